//! Magnetic flux density samples consumed by the calibrator.

use nalgebra::Vector3;

use crate::error::CalibrationError;

/// One body-frame magnetic flux density reading, in Tesla.
///
/// The optional standard deviation weights the sample during refinement; when
/// absent the calibrator's noise floor is used instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    flux: Vector3<f64>,
    std_dev: Option<f64>,
}

impl Measurement {
    /// Create an unweighted measurement.
    pub fn new(flux: Vector3<f64>) -> Self {
        Self {
            flux,
            std_dev: None,
        }
    }

    /// Create a measurement from its per-axis components.
    pub fn from_components(bx: f64, by: f64, bz: f64) -> Self {
        Self::new(Vector3::new(bx, by, bz))
    }

    /// Create a measurement carrying its standard deviation.
    pub fn with_std_dev(flux: Vector3<f64>, std_dev: f64) -> Result<Self, CalibrationError> {
        if !std_dev.is_finite() || std_dev < 0.0 {
            return Err(CalibrationError::InvalidStdDev(std_dev));
        }
        Ok(Self {
            flux,
            std_dev: Some(std_dev),
        })
    }

    /// Measured flux density.
    pub fn flux(&self) -> &Vector3<f64> {
        &self.flux
    }

    /// Whether every flux component is finite.
    pub fn is_finite(&self) -> bool {
        self.flux.iter().all(|v| v.is_finite())
    }

    /// Standard deviation of the measurement, if known.
    pub fn std_dev(&self) -> Option<f64> {
        self.std_dev
    }

    /// Standard deviation, or `fallback` when unknown or zero.
    pub(crate) fn std_dev_or(&self, fallback: f64) -> f64 {
        match self.std_dev {
            Some(s) if s > 0.0 => s,
            _ => fallback,
        }
    }
}

impl From<Vector3<f64>> for Measurement {
    fn from(flux: Vector3<f64>) -> Self {
        Self::new(flux)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_std_dev_is_rejected() {
        let err = Measurement::with_std_dev(Vector3::zeros(), -1.0).unwrap_err();
        assert_eq!(err, CalibrationError::InvalidStdDev(-1.0));
        assert!(Measurement::with_std_dev(Vector3::zeros(), f64::NAN).is_err());
    }

    #[test]
    fn std_dev_fallback_applies_to_missing_and_zero() {
        let m = Measurement::from_components(1.0, 2.0, 3.0);
        assert_eq!(m.std_dev(), None);
        assert_eq!(m.std_dev_or(0.5), 0.5);

        let zero = Measurement::with_std_dev(Vector3::x(), 0.0).unwrap();
        assert_eq!(zero.std_dev_or(0.5), 0.5);

        let weighted = Measurement::with_std_dev(Vector3::x(), 2.0).unwrap();
        assert_eq!(weighted.std_dev_or(0.5), 2.0);
        assert_eq!(weighted.flux(), &Vector3::x());
    }

    #[test]
    fn non_finite_components_are_detected() {
        assert!(Measurement::from_components(1.0, -2.0, 0.0).is_finite());
        assert!(!Measurement::from_components(f64::NAN, 1.0, 1.0).is_finite());
        assert!(!Measurement::from_components(1.0, f64::NEG_INFINITY, 1.0).is_finite());
    }
}
