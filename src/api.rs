//! High-level Rust API.
//!
//! One-call calibration from a matrix of readings, for callers that do not
//! need listeners or incremental reconfiguration.

use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::calibrator::MagnetometerCalibrator;
use crate::error::CalibrationError;
use crate::measurement::Measurement;
use crate::settings::CalibratorSettings;

/// Result of a one-call calibration.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub hard_iron: Vector3<f64>,
    /// Soft-iron matrix `M`.
    pub soft_iron: Matrix3<f64>,
    /// Indices of the inlier readings.
    pub inliers: Vec<usize>,
    pub covariance: Option<DMatrix<f64>>,
    pub mse: f64,
    pub chi_sq: f64,
    pub iterations: usize,
}

/// Convert an Nx3 matrix of readings (Tesla) into measurements.
pub fn measurements_from_matrix(readings: &DMatrix<f64>) -> Result<Vec<Measurement>, CalibrationError> {
    if readings.ncols() != 3 {
        return Err(CalibrationError::InvalidDimensions {
            expected_rows: readings.nrows(),
            expected_cols: 3,
            rows: readings.nrows(),
            cols: readings.ncols(),
        });
    }
    Ok(readings
        .row_iter()
        .map(|row| Measurement::from_components(row[0], row[1], row[2]))
        .collect())
}

/// Calibrate a magnetometer from Nx3 readings taken where the field norm is
/// `field_norm`.
///
/// # Arguments
/// * `readings` - Raw readings, one per row, in Tesla
/// * `field_norm` - Ground-truth field norm at the site, in Tesla
/// * `hard_iron` - Known bias; `None` estimates it
/// * `common_axis` - Pin `myx`, `mzx` and `mzy` to zero
/// * `settings` - Optional settings (defaults if `None`)
pub fn calibrate_magnetometer(
    readings: &DMatrix<f64>,
    field_norm: f64,
    hard_iron: Option<Vector3<f64>>,
    common_axis: bool,
    settings: Option<CalibratorSettings>,
) -> Result<CalibrationOutcome, CalibrationError> {
    let mut builder = MagnetometerCalibrator::builder()
        .measurements(measurements_from_matrix(readings)?)
        .ground_truth_field_norm(field_norm)
        .common_axis(common_axis)
        .estimate_hard_iron(hard_iron.is_none())
        .settings(settings.unwrap_or_default());
    if let Some(bias) = hard_iron {
        builder = builder.hard_iron(bias);
    }

    let mut calibrator = builder.build()?;
    calibrator.calibrate()?;

    let (Some(params), Some(inliers_data)) = (calibrator.estimated_params(), calibrator.inliers_data()) else {
        return Err(CalibrationError::NoConsensus { iterations: 0 });
    };
    Ok(CalibrationOutcome {
        hard_iron: params.hard_iron,
        soft_iron: params.soft_iron,
        inliers: inliers_data
            .inliers
            .iter()
            .enumerate()
            .filter_map(|(i, &inlier)| inlier.then_some(i))
            .collect(),
        covariance: calibrator.estimated_covariance().cloned(),
        mse: calibrator.estimated_mse().unwrap_or_default(),
        chi_sq: calibrator.estimated_chi_sq().unwrap_or_default(),
        iterations: calibrator.iterations().unwrap_or_default(),
    })
}
