//! Calibration configuration types.
//!
//! [`CalibratorSettings`] gathers every tunable of a calibration run. Values
//! are validated by the calibrator setters; [`CalibratorSettings::validate`]
//! performs the same checks on a whole settings block handed to the builder.

use crate::error::CalibrationError;

/// Default inlier threshold on the norm residual, in Tesla.
pub const DEFAULT_THRESHOLD: f64 = 1e-9;

/// Default stop threshold for median-based methods, in Tesla.
pub const DEFAULT_STOP_THRESHOLD: f64 = 1e-9;

/// Default noise floor used as the standard deviation of measurements that do
/// not carry their own, in Tesla.
pub const DEFAULT_NOISE_FLOOR: f64 = 1e-9;

/// Robust sample-consensus variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobustMethod {
    /// Uniform sampling, inlier-count scoring.
    Ransac,
    /// Uniform sampling, truncated quadratic scoring.
    #[default]
    Msac,
    /// Uniform sampling, least median of squares.
    Lmeds,
    /// Quality-ordered sampling, truncated quadratic scoring.
    Prosac,
    /// Quality-ordered sampling, least median of squares.
    Promeds,
}

impl RobustMethod {
    /// Whether subsets are drawn by quality rank (requires quality scores).
    pub fn requires_quality_scores(&self) -> bool {
        matches!(self, RobustMethod::Prosac | RobustMethod::Promeds)
    }

    /// Whether models are scored by their median residual.
    pub fn is_median_based(&self) -> bool {
        matches!(self, RobustMethod::Lmeds | RobustMethod::Promeds)
    }
}

/// Tunables of a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibratorSettings {
    pub method: RobustMethod,
    /// Inlier threshold on `| ||corrected|| - B |`, in Tesla.
    pub threshold: f64,
    /// Probability of drawing at least one all-inlier subset, in (0, 1).
    pub confidence: f64,
    pub max_iterations: usize,
    /// Minimum progress advance between two progress notifications, in (0, 1).
    pub progress_delta: f32,
    /// Re-fit the consensus model on its inliers.
    pub refine_result: bool,
    /// Iteration cap of the final re-fit; the consensus model is kept when
    /// the re-fit does not converge within it.
    pub refinement_max_iterations: usize,
    /// Keep the parameter covariance of the refined model.
    pub keep_covariance: bool,
    /// Measurements per subset; `None` uses the minimum for the current mode.
    pub preliminary_subset_size: Option<usize>,
    /// Median residual at which median-based methods stop early, in Tesla.
    pub stop_threshold: f64,
    /// Standard deviation assumed for measurements without one, in Tesla (> 0).
    pub noise_floor: f64,
    /// Polish every subset solution with a nonlinear fit.
    pub refine_preliminary_solutions: bool,
    /// Seed for subset sampling; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for CalibratorSettings {
    fn default() -> Self {
        Self {
            method: RobustMethod::default(),
            threshold: DEFAULT_THRESHOLD,
            confidence: 0.99,
            max_iterations: 5000,
            progress_delta: 0.05,
            refine_result: true,
            refinement_max_iterations: 100,
            keep_covariance: true,
            preliminary_subset_size: None,
            stop_threshold: DEFAULT_STOP_THRESHOLD,
            noise_floor: DEFAULT_NOISE_FLOOR,
            refine_preliminary_solutions: false,
            seed: None,
        }
    }
}

impl CalibratorSettings {
    /// Check every field. The subset size is checked against `minimum`.
    pub fn validate(&self, minimum: usize) -> Result<(), CalibrationError> {
        check_threshold(self.threshold)?;
        check_confidence(self.confidence)?;
        check_max_iterations(self.max_iterations)?;
        check_max_iterations(self.refinement_max_iterations)?;
        check_progress_delta(self.progress_delta)?;
        check_stop_threshold(self.stop_threshold)?;
        check_noise_floor(self.noise_floor)?;
        if let Some(size) = self.preliminary_subset_size {
            check_subset_size(size, minimum)?;
        }
        Ok(())
    }

    /// Effective subset size for a mode whose minimum is `minimum`.
    pub fn subset_size(&self, minimum: usize) -> usize {
        self.preliminary_subset_size.unwrap_or(minimum).max(minimum)
    }
}

pub(crate) fn check_threshold(threshold: f64) -> Result<(), CalibrationError> {
    if threshold > 0.0 && threshold.is_finite() {
        Ok(())
    } else {
        Err(CalibrationError::InvalidThreshold(threshold))
    }
}

pub(crate) fn check_confidence(confidence: f64) -> Result<(), CalibrationError> {
    if confidence > 0.0 && confidence < 1.0 {
        Ok(())
    } else {
        Err(CalibrationError::InvalidConfidence(confidence))
    }
}

pub(crate) fn check_max_iterations(max_iterations: usize) -> Result<(), CalibrationError> {
    if max_iterations >= 1 {
        Ok(())
    } else {
        Err(CalibrationError::InvalidMaxIterations(max_iterations))
    }
}

pub(crate) fn check_progress_delta(progress_delta: f32) -> Result<(), CalibrationError> {
    if progress_delta > 0.0 && progress_delta < 1.0 {
        Ok(())
    } else {
        Err(CalibrationError::InvalidProgressDelta(progress_delta))
    }
}

pub(crate) fn check_stop_threshold(stop_threshold: f64) -> Result<(), CalibrationError> {
    if stop_threshold >= 0.0 && stop_threshold.is_finite() {
        Ok(())
    } else {
        Err(CalibrationError::InvalidStopThreshold(stop_threshold))
    }
}

pub(crate) fn check_noise_floor(noise_floor: f64) -> Result<(), CalibrationError> {
    if noise_floor > 0.0 && noise_floor.is_finite() {
        Ok(())
    } else {
        Err(CalibrationError::InvalidStdDev(noise_floor))
    }
}

pub(crate) fn check_subset_size(size: usize, minimum: usize) -> Result<(), CalibrationError> {
    if size >= minimum {
        Ok(())
    } else {
        Err(CalibrationError::InvalidSubsetSize { minimum, got: size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let cfg = CalibratorSettings::default();
        assert_eq!(cfg.method, RobustMethod::Msac);
        assert_eq!(cfg.threshold, DEFAULT_THRESHOLD);
        assert!((cfg.confidence - 0.99).abs() < 1e-12);
        assert_eq!(cfg.max_iterations, 5000);
        assert!((cfg.progress_delta - 0.05).abs() < 1e-6);
        assert!(cfg.refine_result);
        assert!(cfg.keep_covariance);
        assert_eq!(cfg.preliminary_subset_size, None);
        assert!(!cfg.refine_preliminary_solutions);
        assert_eq!(cfg.seed, None);
        assert!(cfg.validate(10).is_ok());
    }

    #[test]
    fn method_traits() {
        assert!(RobustMethod::Prosac.requires_quality_scores());
        assert!(RobustMethod::Promeds.requires_quality_scores());
        assert!(!RobustMethod::Msac.requires_quality_scores());
        assert!(RobustMethod::Lmeds.is_median_based());
        assert!(!RobustMethod::Ransac.is_median_based());
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let base = CalibratorSettings::default();

        let cfg = CalibratorSettings {
            threshold: 0.0,
            ..base.clone()
        };
        assert_eq!(cfg.validate(10), Err(CalibrationError::InvalidThreshold(0.0)));

        let cfg = CalibratorSettings {
            confidence: 1.0,
            ..base.clone()
        };
        assert_eq!(cfg.validate(10), Err(CalibrationError::InvalidConfidence(1.0)));

        let cfg = CalibratorSettings {
            max_iterations: 0,
            ..base.clone()
        };
        assert_eq!(cfg.validate(10), Err(CalibrationError::InvalidMaxIterations(0)));

        let cfg = CalibratorSettings {
            progress_delta: 1.5,
            ..base.clone()
        };
        assert_eq!(cfg.validate(10), Err(CalibrationError::InvalidProgressDelta(1.5)));
        let cfg = CalibratorSettings {
            refinement_max_iterations: 0,
            ..base.clone()
        };
        assert_eq!(cfg.validate(10), Err(CalibrationError::InvalidMaxIterations(0)));

        for endpoint in [0.0, 1.0] {
            let cfg = CalibratorSettings {
                progress_delta: endpoint,
                ..base.clone()
            };
            assert_eq!(
                cfg.validate(10),
                Err(CalibrationError::InvalidProgressDelta(endpoint))
            );
        }

        let cfg = CalibratorSettings {
            preliminary_subset_size: Some(6),
            ..base
        };
        assert_eq!(
            cfg.validate(7),
            Err(CalibrationError::InvalidSubsetSize { minimum: 7, got: 6 })
        );
    }

    #[test]
    fn subset_size_defaults_to_minimum() {
        let mut cfg = CalibratorSettings::default();
        assert_eq!(cfg.subset_size(10), 10);
        cfg.preliminary_subset_size = Some(15);
        assert_eq!(cfg.subset_size(10), 15);
        assert_eq!(cfg.subset_size(16), 16);
    }
}
