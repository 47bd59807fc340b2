//! Minimal-subset solver for the hard-iron/soft-iron model.
//!
//! Readings are divided by the ground-truth norm `B` so that corrected
//! readings lie on the unit sphere, i.e. on the ellipsoid
//! `(y - b)ᵀ A (y - b) = 1` with `A = KᵀK` and `K = (I + M)⁻¹`.
//!
//! The linear step fits that ellipsoid:
//! - with a known bias, `A` (6 unknowns) by least squares on the centred
//!   readings;
//! - otherwise the general quadric `yᵀAy + gᵀy + c = 0` (10 homogeneous
//!   coefficients), whose centre is the bias.
//!
//! `A` is factored by Cholesky into an upper-triangular `K`. Under the
//! common-axis constraint this `K` is the answer. Otherwise norm data leave
//! `K` undetermined up to a rotation, which is fixed by aligning `K` with the
//! inverse of the initial soft-iron guess (orthogonal Procrustes).

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use tracing::trace;

use crate::core::Estimator;
use crate::error::SolverError;
use crate::measurement::Measurement;
use crate::model::{CalibrationParameters, ParameterLayout};
use crate::optim::LevenbergMarquardt;
use crate::refine::NormResidualProblem;

/// Singular values below this fraction of the largest count as zero.
const RANK_TOLERANCE: f64 = 1e-10;

/// Fits calibration candidates from measurement subsets.
#[derive(Debug, Clone)]
pub struct MagnetometerEstimator {
    layout: ParameterLayout,
    field_norm: f64,
    /// Known (or initial) hard iron and initial soft-iron guess.
    initial: CalibrationParameters,
    sample_size: usize,
    refine_solutions: bool,
}

impl MagnetometerEstimator {
    pub fn new(layout: ParameterLayout, field_norm: f64, initial: CalibrationParameters) -> Self {
        Self {
            layout,
            field_norm,
            initial,
            sample_size: layout.minimum_measurements(),
            refine_solutions: false,
        }
    }

    /// Measurements per subset; never below the layout minimum.
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size.max(self.layout.minimum_measurements());
        self
    }

    /// Polish every linear solution with Levenberg-Marquardt.
    pub fn with_refined_solutions(mut self, refine: bool) -> Self {
        self.refine_solutions = refine;
        self
    }

    pub fn layout(&self) -> ParameterLayout {
        self.layout
    }

    pub fn field_norm(&self) -> f64 {
        self.field_norm
    }

    /// Fit one candidate to the measurements selected by `sample`.
    ///
    /// When the linear step fails the initial guess seeds a nonlinear fit.
    pub fn fit(
        &self,
        measurements: &[Measurement],
        sample: &[usize],
    ) -> Result<CalibrationParameters, SolverError> {
        let required = self.layout.minimum_measurements();
        if sample.len() < required {
            return Err(SolverError::InsufficientData {
                required,
                got: sample.len(),
            });
        }

        match self.linear_fit(measurements, sample) {
            Ok(params) if self.refine_solutions => {
                Ok(self.polish(measurements, sample, &params).unwrap_or(params))
            }
            Ok(params) => Ok(params),
            Err(err) => {
                trace!(%err, "linear fit failed, seeding from initial guess");
                self.polish(measurements, sample, &self.initial)
            }
        }
    }

    /// Closed-form ellipsoid fit.
    pub fn linear_fit(
        &self,
        measurements: &[Measurement],
        sample: &[usize],
    ) -> Result<CalibrationParameters, SolverError> {
        let norm = self.field_norm;
        let ys: Vec<Vector3<f64>> = sample
            .iter()
            .map(|&i| measurements[i].flux() / norm)
            .collect();

        let (a, hard_iron) = if self.layout.estimate_hard_iron {
            let (a, center) = fit_quadric(&ys)?;
            (a, center * norm)
        } else {
            let center = self.initial.hard_iron / norm;
            (fit_centered_ellipsoid(&ys, &center)?, self.initial.hard_iron)
        };

        let chol = a.cholesky().ok_or(SolverError::NotPositiveDefinite)?;
        let mut k = chol.l().transpose();
        if !self.layout.common_axis {
            let reference = self.initial.correction().unwrap_or_else(Matrix3::identity);
            k = procrustes_rotation(&k, &reference) * k;
        }

        let transform = k.try_inverse().ok_or(SolverError::Degenerate)?;
        let mut soft_iron = transform - Matrix3::identity();
        if self.layout.common_axis {
            soft_iron[(1, 0)] = 0.0;
            soft_iron[(2, 0)] = 0.0;
            soft_iron[(2, 1)] = 0.0;
        }

        let params = CalibrationParameters::new(hard_iron, soft_iron);
        if !params.is_finite() {
            return Err(SolverError::NonFinite);
        }
        Ok(params)
    }

    fn polish(
        &self,
        measurements: &[Measurement],
        sample: &[usize],
        start: &CalibrationParameters,
    ) -> Result<CalibrationParameters, SolverError> {
        let problem = NormResidualProblem::unweighted(
            measurements,
            sample,
            self.layout,
            &self.initial.hard_iron,
            self.field_norm,
        );
        let report = LevenbergMarquardt::default()
            .minimize(&problem, self.layout.pack(start, self.field_norm))?;
        Ok(self
            .layout
            .unpack(&report.params, &self.initial.hard_iron, self.field_norm))
    }
}

impl Estimator for MagnetometerEstimator {
    type Datum = Measurement;
    type Model = CalibrationParameters;

    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn is_valid_sample(&self, data: &[Measurement], sample: &[usize]) -> bool {
        sample.iter().all(|&i| data.get(i).is_some_and(Measurement::is_finite))
    }

    fn estimate_model(&self, data: &[Measurement], sample: &[usize]) -> Vec<CalibrationParameters> {
        match self.fit(data, sample) {
            Ok(params) => vec![params],
            Err(err) => {
                trace!(%err, "subset fit failed");
                Vec::new()
            }
        }
    }

    fn is_valid_model(
        &self,
        model: &CalibrationParameters,
        _data: &[Measurement],
        _sample: &[usize],
        _threshold: f64,
    ) -> bool {
        let transform = model.transform();
        model.is_finite()
            && transform.diagonal().iter().all(|d| *d > 0.0)
            && model.correction().is_some()
    }
}

/// Least-squares `A` with `zᵀAz = 1` for `z = y - center`.
fn fit_centered_ellipsoid(
    ys: &[Vector3<f64>],
    center: &Vector3<f64>,
) -> Result<Matrix3<f64>, SolverError> {
    let mut design = DMatrix::zeros(ys.len(), 6);
    for (row, y) in ys.iter().enumerate() {
        let z = y - center;
        let terms = [
            z.x * z.x,
            z.y * z.y,
            z.z * z.z,
            2.0 * z.x * z.y,
            2.0 * z.x * z.z,
            2.0 * z.y * z.z,
        ];
        for (col, t) in terms.iter().enumerate() {
            design[(row, col)] = *t;
        }
    }

    ensure_finite(&design)?;
    let svd = design.svd(true, true);
    let largest = svd.singular_values.max();
    if svd.singular_values.min() <= largest * RANK_TOLERANCE {
        return Err(SolverError::Degenerate);
    }
    let coeffs = svd
        .solve(&DVector::repeat(ys.len(), 1.0), largest * f64::EPSILON)
        .map_err(|_| SolverError::Degenerate)?;

    Ok(symmetric_from_coefficients(coeffs.as_slice()))
}

/// General quadric fit. Returns `A` scaled so that `(y - c)ᵀA(y - c) = 1` and
/// the centre `c`.
fn fit_quadric(ys: &[Vector3<f64>]) -> Result<(Matrix3<f64>, Vector3<f64>), SolverError> {
    const COEFFS: usize = 10;
    if ys.len() < COEFFS {
        return Err(SolverError::InsufficientData {
            required: COEFFS,
            got: ys.len(),
        });
    }

    let mut design = DMatrix::zeros(ys.len(), COEFFS);
    for (row, y) in ys.iter().enumerate() {
        let terms = [
            y.x * y.x,
            y.y * y.y,
            y.z * y.z,
            2.0 * y.x * y.y,
            2.0 * y.x * y.z,
            2.0 * y.y * y.z,
            y.x,
            y.y,
            y.z,
            1.0,
        ];
        for (col, t) in terms.iter().enumerate() {
            design[(row, col)] = *t;
        }
    }

    ensure_finite(&design)?;
    let svd = design.svd(false, true);
    let v_t = svd.v_t.ok_or(SolverError::Degenerate)?;

    // Null vector: right singular vector of the smallest singular value. The
    // second smallest must be clearly non-zero for it to be unique.
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[a].total_cmp(&svd.singular_values[b]));
    let largest = svd.singular_values.max();
    if svd.singular_values[order[1]] <= largest * RANK_TOLERANCE {
        return Err(SolverError::Degenerate);
    }
    let coeffs: Vec<f64> = v_t.row(order[0]).iter().copied().collect();

    let a = symmetric_from_coefficients(&coeffs[..6]);
    let g = Vector3::new(coeffs[6], coeffs[7], coeffs[8]);
    let center = -0.5 * a.try_inverse().ok_or(SolverError::Degenerate)? * g;
    let scale = center.dot(&(a * center)) - coeffs[9];
    if !scale.is_finite() || scale.abs() <= f64::EPSILON * a.norm() {
        return Err(SolverError::Degenerate);
    }

    Ok((a / scale, center))
}

// SVD does not terminate on NaN input.
fn ensure_finite(design: &DMatrix<f64>) -> Result<(), SolverError> {
    if design.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SolverError::NonFinite)
    }
}

fn symmetric_from_coefficients(c: &[f64]) -> Matrix3<f64> {
    Matrix3::new(c[0], c[3], c[4], c[3], c[1], c[5], c[4], c[5], c[2])
}

/// Rotation `R` minimizing `||R k - reference||`.
fn procrustes_rotation(k: &Matrix3<f64>, reference: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = (reference * k.transpose()).svd(true, true);
    let (Some(mut u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    if (u * v_t).determinant() < 0.0 {
        let weakest = svd.singular_values.imin();
        u.column_mut(weakest).neg_mut();
    }
    u * v_t
}
