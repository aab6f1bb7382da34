//! holegauge: measure holes in cross-section micrographs and reconstruct
//! true hole diameters from OCT slices.
//!
//! # Usage
//!
//! ```text
//! holegauge measure [OPTIONS] <IMAGES>...
//! holegauge reconstruct [OPTIONS] <SLICES_JSON>
//! holegauge calibrate --known-um <UM> --pixels <PX>
//! holegauge taper --top <UM> --bottom <UM> --height <UM>
//! ```
//!
//! Logging goes to stderr and follows `RUST_LOG`; `--verbose` raises the
//! default level to `debug`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use holegauge_pipeline::{
    AnalysisOptions, FitMethod, HoleAnalysis, MeasureError, MeasurementRecord, Parameters,
    ReconstructionOptions, ReconstructionRecord,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Hole metrology for cross-section micrographs and OCT slices.
#[derive(Parser)]
#[command(name = "holegauge", version)]
struct Cli {
    /// Log pipeline details at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Measure the hole in each image.
    Measure(MeasureArgs),
    /// Fit the hole circle through OCT slice endpoints.
    Reconstruct(ReconstructArgs),
    /// Compute micrometres per pixel from a feature of known length.
    Calibrate {
        /// Known length in micrometres.
        #[arg(long)]
        known_um: f64,
        /// Measured length in pixels.
        #[arg(long)]
        pixels: f64,
    },
    /// Taper between two widths over a height, all in micrometres.
    Taper {
        #[arg(long)]
        top: f64,
        #[arg(long)]
        bottom: f64,
        #[arg(long)]
        height: f64,
    },
}

#[derive(Args)]
struct MeasureArgs {
    /// Images to measure (PNG, JPEG, BMP, WebP, TIFF).
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Measure from the top surface and the lowest bottom segment, for
    /// holes whose opening does not break the surface line.
    #[arg(long)]
    no_gap: bool,

    /// Also score inner-wall roughness.
    #[arg(long)]
    roughness: bool,

    /// Print one JSON record per line instead of a text summary.
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    params: ParamArgs,
}

/// Detection parameters.
#[derive(Args)]
struct ParamArgs {
    /// Parameter record as a JSON file; missing keys take their defaults.
    ///
    /// When provided, all other parameter flags are ignored.
    #[arg(long)]
    params_json: Option<PathBuf>,

    /// Gaussian smoothing kernel size (even values are bumped to odd).
    #[arg(long, default_value_t = Parameters::DEFAULT_GAUSSIAN_KERNEL)]
    gaussian_kernel: u32,

    /// Adaptive threshold neighbourhood size.
    #[arg(long, default_value_t = Parameters::DEFAULT_ADAPTIVE_BLOCK_SIZE)]
    adaptive_block_size: u32,

    /// Constant subtracted from the adaptive local mean.
    #[arg(long, default_value_t = Parameters::DEFAULT_ADAPTIVE_C, allow_hyphen_values = true)]
    adaptive_c: i32,

    /// Fixed global threshold.
    #[arg(long, default_value_t = Parameters::DEFAULT_BINARY_THRESHOLD)]
    binary_threshold: u8,

    /// Surface line (top to bottom) taken as the hole's top surface.
    #[arg(long, default_value_t = Parameters::DEFAULT_TOP_LINE_INDEX)]
    top_line_index: usize,

    /// Surface line considered for the hole's bottom.
    #[arg(long, default_value_t = Parameters::DEFAULT_BOTTOM_LINE_INDEX)]
    bottom_line_index: usize,

    /// Row projection threshold, percent of maximum.
    #[arg(long, default_value_t = Parameters::DEFAULT_ROW_PROJECTION_THRESHOLD)]
    row_projection_threshold: u32,

    /// Minimum opening width in pixels.
    #[arg(long, default_value_t = Parameters::DEFAULT_GAP_MIN_WIDTH)]
    gap_min_width: u32,

    /// Horizontal structuring element length.
    #[arg(long, default_value_t = Parameters::DEFAULT_HORIZONTAL_KERNEL_SIZE)]
    horizontal_kernel_size: u32,

    /// Band projection threshold, percent of maximum.
    #[arg(long, default_value_t = Parameters::DEFAULT_COLUMN_PROJECTION_THRESHOLD)]
    column_projection_threshold: u32,

    /// Half-width of the band projection peak window.
    #[arg(long, default_value_t = Parameters::DEFAULT_COLUMN_PEAK_WINDOW)]
    column_peak_window: u32,

    /// Contrast gain for the center column gradient search.
    #[arg(long, default_value_t = Parameters::DEFAULT_BOTTOM_ENHANCE_CONTRAST)]
    bottom_enhance_contrast: f64,

    /// Fraction of the image height searched for the bottom.
    #[arg(long, default_value_t = Parameters::DEFAULT_BOTTOM_SEARCH_RANGE)]
    bottom_search_range: f64,

    /// Longest white run a bottom row must exceed.
    #[arg(long, default_value_t = Parameters::DEFAULT_SHORT_LINE_MIN_LENGTH)]
    short_line_min_length: u32,

    /// Lower bound on a bottom row's white ratio.
    #[arg(long, default_value_t = Parameters::DEFAULT_SHORT_LINE_MIN_WHITE_RATIO)]
    short_line_min_white_ratio: f64,

    /// Upper bound on a bottom row's white ratio.
    #[arg(long, default_value_t = Parameters::DEFAULT_SHORT_LINE_MAX_WHITE_RATIO)]
    short_line_max_white_ratio: f64,

    /// Invert the binary mask.
    #[arg(long)]
    invert_binary: bool,

    /// Micrometres per pixel along columns.
    #[arg(long, default_value_t = Parameters::DEFAULT_PIXEL_TO_UM_X)]
    pixel_to_um_x: f64,

    /// Micrometres per pixel along rows.
    #[arg(long, default_value_t = Parameters::DEFAULT_PIXEL_TO_UM_Y)]
    pixel_to_um_y: f64,

    /// Expected hole depth in micrometres.
    #[arg(long, default_value_t = Parameters::DEFAULT_REFERENCE_DEPTH_UM)]
    reference_depth_um: f64,

    /// Rotate the input counter-clockwise by this many degrees first.
    #[arg(
        long = "rotate",
        default_value_t = Parameters::DEFAULT_ROTATION_DEG,
        allow_hyphen_values = true
    )]
    rotation_deg: f64,
}

#[derive(Args)]
struct ReconstructArgs {
    /// JSON file with `endpoints` (`[x1, y1, x2, y2]` rows in pixels) and
    /// `scan_positions` (micrometres).
    slices_json: PathBuf,

    /// Circle fitting method.
    #[arg(long, value_enum, default_value_t = Method::Algebraic)]
    method: Method,

    /// Shift every slice so its chord midpoint matches the first slice's.
    #[arg(long)]
    align_midpoints: bool,

    /// Micrometres per pixel along the slice.
    #[arg(long, default_value_t = Parameters::DEFAULT_PIXEL_TO_UM_X)]
    pixel_to_um_x: f64,

    /// Hole depth in micrometres, for the depth-to-diameter ratio.
    #[arg(long)]
    depth_um: Option<f64>,
}

/// Circle fitting method selection.
#[derive(Clone, Copy, ValueEnum)]
enum Method {
    /// Direct linear least squares.
    Algebraic,
    /// Levenberg–Marquardt seeded by the algebraic fit, falling back to it.
    Geometric,
    /// Levenberg–Marquardt from the centroid, no fallback.
    GeometricForced,
}

impl From<Method> for FitMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Algebraic => Self::Algebraic,
            Method::Geometric => Self::Geometric,
            Method::GeometricForced => Self::GeometricForced,
        }
    }
}

#[derive(Deserialize)]
struct SlicesFile {
    endpoints: Vec<[f64; 4]>,
    scan_positions: Vec<f64>,
}

/// Build [`Parameters`] from CLI arguments.
///
/// If `--params-json` is provided the file is parsed and the individual
/// parameter flags are ignored.
fn params_from_cli(args: &ParamArgs) -> anyhow::Result<Parameters> {
    if let Some(ref path) = args.params_json {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("parsing parameters from {}", path.display()));
    }
    Ok(Parameters {
        gaussian_kernel: args.gaussian_kernel,
        adaptive_block_size: args.adaptive_block_size,
        adaptive_c: args.adaptive_c,
        binary_threshold: args.binary_threshold,
        top_line_index: args.top_line_index,
        bottom_line_index: args.bottom_line_index,
        row_projection_threshold: args.row_projection_threshold,
        gap_min_width: args.gap_min_width,
        horizontal_kernel_size: args.horizontal_kernel_size,
        column_projection_threshold: args.column_projection_threshold,
        column_peak_window: args.column_peak_window,
        bottom_enhance_contrast: args.bottom_enhance_contrast,
        bottom_search_range: args.bottom_search_range,
        short_line_min_length: args.short_line_min_length,
        short_line_min_white_ratio: args.short_line_min_white_ratio,
        short_line_max_white_ratio: args.short_line_max_white_ratio,
        invert_binary: args.invert_binary,
        pixel_to_um_x: args.pixel_to_um_x,
        pixel_to_um_y: args.pixel_to_um_y,
        reference_depth_um: args.reference_depth_um,
        rotation_deg: args.rotation_deg,
    })
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn print_analysis(
    name: &str,
    analysis: &HoleAnalysis,
    params: &Parameters,
    json: bool,
) -> anyhow::Result<()> {
    let record = MeasurementRecord::new(
        name,
        &analysis.bounds,
        &analysis.measurement,
        params.reference_depth_um,
        unix_seconds(),
    );
    if json {
        println!("{}", serde_json::to_string(&record)?);
        return Ok(());
    }
    let m = &analysis.measurement;
    println!("{name}");
    println!(
        "  opening   {}..{} on row {} ({:?})",
        record.hole_start, record.hole_end, record.upper_surface_row, analysis.gap.method
    );
    println!(
        "  bottom    row {} ({:?})",
        record.bottom_surface_row, analysis.bottom.source
    );
    println!("  diameter  {:.2} um", m.diameter_um);
    println!("  depth     {:.2} um", m.depth_um);
    println!(
        "  0.1 mm    upper {:.2} um, lower {:.2} um, standard {:.2} um",
        m.upper_diam_um, m.lower_diam_um, m.standard_diameter_um
    );
    println!("  ratio     {:.3}", m.depth_to_diameter_ratio);
    if let (Some(t), Some(a)) = (m.taper, m.taper_angle_deg) {
        println!("  taper     {t:.4} ({a:.2} deg)");
    }
    if let Some(r) = &analysis.roughness {
        println!("  roughness {:.1} ({})", r.score, r.grade.label());
    }
    Ok(())
}

/// Read every path, reporting unreadable files to `on_error` instead of
/// yielding them.
fn read_images<'a>(
    paths: &'a [PathBuf],
    mut on_error: impl FnMut(&Path, std::io::Error) + 'a,
) -> impl Iterator<Item = (String, Vec<u8>)> + 'a {
    paths.iter().filter_map(move |path| match std::fs::read(path) {
        Ok(bytes) => Some((file_name(path), bytes)),
        Err(e) => {
            on_error(path, e);
            None
        }
    })
}

/// Measure every image and return how many failed.
fn run_measure(args: &MeasureArgs) -> anyhow::Result<usize> {
    let params = params_from_cli(&args.params)?;
    params.validate()?;

    let mut unreadable = 0_usize;
    let report_unreadable = |path: &Path, e: std::io::Error| {
        eprintln!("{}: {e}", path.display());
        unreadable += 1;
    };

    if args.no_gap {
        let mut failed = 0_usize;
        for (name, bytes) in read_images(&args.images, report_unreadable) {
            let result = holegauge_pipeline::grayscale::decode_and_grayscale(&bytes)
                .and_then(|gray| holegauge_pipeline::measure_without_gap(&gray, &params));
            match result {
                Ok(m) if args.json => println!("{}", serde_json::to_string(&m)?),
                Ok(m) => println!(
                    "{name}\n  diameter  {:.2} um\n  depth     {:.2} um\n  ratio     {:.3}",
                    m.diameter_um, m.depth_um, m.depth_to_diameter_ratio
                ),
                Err(e) => {
                    eprintln!("{name}: {e}");
                    failed += 1;
                }
            }
        }
        return Ok(failed + unreadable);
    }

    let options = AnalysisOptions {
        roughness: args.roughness,
    };
    let mut print_error = None;
    let summary = holegauge_pipeline::measure_batch(
        read_images(&args.images, report_unreadable),
        &params,
        options,
        &AtomicBool::new(false),
        |name, result: Result<HoleAnalysis, MeasureError>| match result {
            Ok(analysis) => {
                if let Err(e) = print_analysis(name, &analysis, &params, args.json) {
                    print_error.get_or_insert(e);
                }
            }
            Err(e) => eprintln!("{name}: {e}"),
        },
    );
    if let Some(e) = print_error {
        return Err(e);
    }
    let failed = summary.failed + unreadable;
    if !args.json {
        eprintln!(
            "{} processed, {} succeeded, {failed} failed",
            summary.processed + unreadable,
            summary.succeeded,
        );
    }
    Ok(failed)
}

const fn exit_for(failed: usize) -> ExitCode {
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_reconstruct(args: &ReconstructArgs) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.slices_json)
        .with_context(|| format!("reading {}", args.slices_json.display()))?;
    let file: SlicesFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing slices from {}", args.slices_json.display()))?;
    if file.endpoints.len() < 3 {
        bail!(
            "at least 3 slices are needed to reconstruct, got {}",
            file.endpoints.len()
        );
    }
    let slices = holegauge_pipeline::reconstruct::slices_from_rows(
        &file.endpoints,
        &file.scan_positions,
        args.pixel_to_um_x,
    )?;
    let fit = holegauge_pipeline::reconstruct(
        &slices,
        ReconstructionOptions {
            method: args.method.into(),
            align_midpoints: args.align_midpoints,
        },
    )?;
    let record = ReconstructionRecord::new(&fit, args.depth_um);
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Command::Measure(args) => run_measure(args).map(exit_for),
        Command::Reconstruct(args) => run_reconstruct(args).map(|()| ExitCode::SUCCESS),
        Command::Calibrate { known_um, pixels } => {
            let factor = holegauge_pipeline::calibration::conversion_factor(*known_um, *pixels)?;
            println!("{factor:.6} um/px");
            Ok(ExitCode::SUCCESS)
        }
        Command::Taper {
            top,
            bottom,
            height,
        } => {
            let report = holegauge_pipeline::taper(*top, *bottom, *height)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("holegauge").chain(args.iter().copied())).unwrap()
    }

    fn measure_args(cli: Cli) -> Option<MeasureArgs> {
        match cli.command {
            Command::Measure(args) => Some(args),
            _ => None,
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn measure_defaults_match_parameters() {
        let args = measure_args(parse(&["measure", "a.png"])).unwrap();
        assert_eq!(params_from_cli(&args.params).unwrap(), Parameters::default());
        assert!(!args.no_gap && !args.roughness && !args.json);
    }

    #[test]
    fn measure_flags_reach_parameters() {
        let cli = parse(&[
            "-v",
            "measure",
            "a.png",
            "b.png",
            "--gap-min-width",
            "30",
            "--adaptive-c",
            "-3",
            "--invert-binary",
            "--roughness",
        ]);
        assert!(cli.verbose);
        let args = measure_args(cli).unwrap();
        assert_eq!(args.images.len(), 2);
        let p = params_from_cli(&args.params).unwrap();
        assert_eq!(p.gap_min_width, 30);
        assert_eq!(p.adaptive_c, -3);
        assert!(p.invert_binary);
        assert!(args.roughness);
    }

    #[test]
    fn rotate_flag_accepts_negative_angles() {
        let args = measure_args(parse(&["measure", "a.png", "--rotate", "-12.5"])).unwrap();
        let p = params_from_cli(&args.params).unwrap();
        assert!((p.rotation_deg + 12.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unreadable_files_are_reported_once_and_skipped() {
        let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let missing = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("no-such-image.png");
        let paths = vec![manifest, missing.clone()];
        let mut errors = Vec::new();
        let read: Vec<String> = read_images(&paths, |path, _| errors.push(path.to_path_buf()))
            .map(|(name, _)| name)
            .collect();
        assert_eq!(read, vec!["Cargo.toml".to_string()]);
        assert_eq!(errors, vec![missing]);
    }

    #[test]
    fn missing_image_counts_as_one_failure() {
        for extra in [None, Some("--no-gap")] {
            let mut argv = vec!["measure", "/nonexistent/holegauge/a.png", "--json"];
            argv.extend(extra);
            let args = measure_args(parse(&argv)).unwrap();
            assert_eq!(run_measure(&args).unwrap(), 1);
        }
    }

    #[test]
    fn measure_requires_an_image() {
        assert!(Cli::try_parse_from(["holegauge", "measure"]).is_err());
    }

    #[test]
    fn reconstruct_method_names() {
        let cli = parse(&[
            "reconstruct",
            "s.json",
            "--method",
            "geometric-forced",
            "--align-midpoints",
        ]);
        let Command::Reconstruct(args) = cli.command else {
            unreachable!("parsed as reconstruct");
        };
        assert_eq!(FitMethod::from(args.method), FitMethod::GeometricForced);
        assert!(args.align_midpoints);
        assert!(args.depth_um.is_none());
    }

    #[test]
    fn slices_file_shape() {
        let file: SlicesFile = serde_json::from_str(
            r#"{"endpoints": [[1, 2, 3, 4], [5, 6, 7, 8]], "scan_positions": [0, 10]}"#,
        )
        .unwrap();
        assert_eq!(file.endpoints.len(), 2);
        assert!((file.endpoints[1][2] - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn calibrate_and_taper_parse() {
        let cli = parse(&["calibrate", "--known-um", "100", "--pixels", "62.5"]);
        assert!(matches!(cli.command, Command::Calibrate { .. }));
        let cli = parse(&["taper", "--top", "100", "--bottom", "80", "--height", "200"]);
        assert!(matches!(cli.command, Command::Taper { .. }));
    }
}
