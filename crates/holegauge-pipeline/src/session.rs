//! Rolling standard diameter across successive measurements.

use crate::dimension::DiameterHistory;
use crate::types::{GrayImage, MeasureError, Measurement, Parameters};
use crate::{AnalysisOptions, HoleAnalysis, analyze};

/// A sequence of measurements sharing parameters and a
/// [`DiameterHistory`].
///
/// Each successful measurement pushes its standard diameter and reports
/// the mean of the last [`DiameterHistory::CAPACITY`] values. Failed
/// measurements leave the history untouched.
#[derive(Debug, Clone, Default)]
pub struct MeasurementSession {
    params: Parameters,
    options: AnalysisOptions,
    history: DiameterHistory,
}

impl MeasurementSession {
    #[must_use]
    pub fn new(params: Parameters, options: AnalysisOptions) -> Self {
        Self {
            params,
            options,
            history: DiameterHistory::new(),
        }
    }

    #[must_use]
    pub const fn params(&self) -> &Parameters {
        &self.params
    }

    /// Replace the parameters. The history is kept.
    pub fn set_params(&mut self, params: Parameters) {
        self.params = params;
    }

    #[must_use]
    pub const fn history(&self) -> &DiameterHistory {
        &self.history
    }

    /// Forget previous diameters.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Analyze `image` and stabilize its standard diameter.
    ///
    /// # Errors
    ///
    /// As [`analyze`].
    pub fn analyze(&mut self, image: &GrayImage) -> Result<HoleAnalysis, MeasureError> {
        let mut analysis = analyze(image, &self.params, self.options)?;
        self.history.stabilize(&mut analysis.measurement);
        Ok(analysis)
    }

    /// Measure `image` and stabilize its standard diameter.
    ///
    /// # Errors
    ///
    /// As [`analyze`].
    pub fn measure(&mut self, image: &GrayImage) -> Result<Measurement, MeasureError> {
        self.analyze(image).map(|a| a.measurement)
    }
}
