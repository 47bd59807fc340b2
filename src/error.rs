//! Error types for calibration configuration, runs and numerical solvers.

use thiserror::Error;

/// Errors surfaced by [`MagnetometerCalibrator`](crate::calibrator::MagnetometerCalibrator)
/// and its builder.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    /// A mutator or `calibrate()` was invoked while a calibration is running.
    #[error("calibrator is locked while a calibration is running")]
    Locked,
    /// `calibrate()` was invoked before the calibrator was ready.
    #[error("calibrator is not ready: {0}")]
    NotReady(&'static str),
    /// Inlier threshold must be strictly positive and finite.
    #[error("threshold must be > 0, got {0}")]
    InvalidThreshold(f64),
    /// Confidence must lie in the open interval (0, 1).
    #[error("confidence must be in (0, 1), got {0}")]
    InvalidConfidence(f64),
    /// At least one iteration is required.
    #[error("max iterations must be >= 1, got {0}")]
    InvalidMaxIterations(usize),
    /// Progress delta must lie in [0, 1].
    #[error("progress delta must be in [0, 1], got {0}")]
    InvalidProgressDelta(f32),
    /// Preliminary subset size is below the minimum for the current mode.
    #[error("preliminary subset size must be >= {minimum}, got {got}")]
    InvalidSubsetSize { minimum: usize, got: usize },
    /// A matrix argument had the wrong shape.
    #[error("invalid dimensions: expected {expected_rows}x{expected_cols}, got {rows}x{cols}")]
    InvalidDimensions {
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    /// Ground-truth field norm must be strictly positive and finite.
    #[error("ground-truth field norm must be > 0, got {0}")]
    InvalidFieldNorm(f64),
    /// Standard deviations (per measurement or noise floor) must be >= 0 and finite.
    #[error("standard deviation must be >= 0, got {0}")]
    InvalidStdDev(f64),
    /// Stop threshold must be >= 0 and finite.
    #[error("stop threshold must be >= 0, got {0}")]
    InvalidStopThreshold(f64),
    /// Quality scores must be finite and match the number of measurements.
    #[error("quality scores are invalid: {0}")]
    InvalidQualityScores(&'static str),
    /// The consensus loop never produced a valid model.
    #[error("no consensus model found after {iterations} iterations")]
    NoConsensus { iterations: usize },
}

/// Numerical failure while fitting a calibration model.
///
/// These never reach callers of `calibrate()` directly: a failing subset is
/// discarded by the consensus loop and a failing refinement falls back to the
/// unrefined model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("subset has {got} measurements, at least {required} required")]
    InsufficientData { required: usize, got: usize },
    #[error("subset is rank deficient")]
    Degenerate,
    #[error("fitted quadric is not positive definite")]
    NotPositiveDefinite,
    #[error("solver did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },
    #[error("solver produced non-finite values")]
    NonFinite,
}
