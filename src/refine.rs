//! Weighted nonlinear refinement of a consensus model.
//!
//! The problem is solved in units of the ground-truth norm `B`: readings are
//! divided by `B` and the residual of reading `i` is
//! `eᵢ = sᵢ (||(I + M)⁻¹ (yᵢ - b)|| - 1)` with `sᵢ = B / σᵢ`, so `Σ eᵢ²` is the
//! chi-square statistic of the fit.

use argmin::core::{Error, Jacobian, Operator};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use tracing::{debug, warn};

use crate::error::SolverError;
use crate::measurement::Measurement;
use crate::model::{CalibrationParameters, ParameterLayout, MATRIX_ENTRIES};
use crate::optim::LevenbergMarquardt;
use crate::scoring::norm_residual;

/// Singular values below this fraction of the largest are treated as zero
/// when inverting the normal matrix.
const PSEUDO_INVERSE_RCOND: f64 = 1e-10;

/// Norm-constraint least-squares problem over the free calibration
/// parameters.
pub struct NormResidualProblem {
    normalized: Vec<Vector3<f64>>,
    sqrt_weights: Vec<f64>,
    layout: ParameterLayout,
    known_bias: Vector3<f64>,
}

impl NormResidualProblem {
    /// Unit-weight problem over `indices`.
    pub fn unweighted(
        measurements: &[Measurement],
        indices: &[usize],
        layout: ParameterLayout,
        known_hard_iron: &Vector3<f64>,
        field_norm: f64,
    ) -> Self {
        Self {
            normalized: indices
                .iter()
                .map(|&i| measurements[i].flux() / field_norm)
                .collect(),
            sqrt_weights: vec![1.0; indices.len()],
            layout,
            known_bias: known_hard_iron / field_norm,
        }
    }

    /// Problem over `indices` weighted by `1/σᵢ²`, `σᵢ` falling back to
    /// `noise_floor`.
    pub fn weighted(
        measurements: &[Measurement],
        indices: &[usize],
        layout: ParameterLayout,
        known_hard_iron: &Vector3<f64>,
        field_norm: f64,
        noise_floor: f64,
    ) -> Self {
        let mut problem = Self::unweighted(measurements, indices, layout, known_hard_iron, field_norm);
        problem.sqrt_weights = indices
            .iter()
            .map(|&i| field_norm / measurements[i].std_dev_or(noise_floor))
            .collect();
        problem
    }

    pub fn len(&self) -> usize {
        self.normalized.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    /// Parameters in normalized units.
    fn params(&self, x: &DVector<f64>) -> CalibrationParameters {
        self.layout.unpack(x, &self.known_bias, 1.0)
    }

    fn correction(&self, x: &DVector<f64>) -> Result<(CalibrationParameters, Matrix3<f64>), Error> {
        let params = self.params(x);
        let k = params
            .correction()
            .ok_or_else(|| Error::msg("soft-iron transform is singular"))?;
        Ok((params, k))
    }
}

impl Operator for NormResidualProblem {
    type Param = DVector<f64>;
    type Output = DVector<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        let (params, k) = self.correction(x)?;
        Ok(DVector::from_iterator(
            self.len(),
            self.normalized
                .iter()
                .zip(&self.sqrt_weights)
                .map(|(y, s)| s * ((k * (y - params.hard_iron)).norm() - 1.0)),
        ))
    }
}

impl Jacobian for NormResidualProblem {
    type Param = DVector<f64>;
    type Jacobian = DMatrix<f64>;

    fn jacobian(&self, x: &Self::Param) -> Result<Self::Jacobian, Error> {
        let (params, k) = self.correction(x)?;
        let offset = self.layout.free_len() - self.layout.free_matrix_params().len();
        let mut jac = DMatrix::zeros(self.len(), self.layout.free_len());

        // With u = K z and v = Kᵀ u:
        //   d||u|| / dT_rc = -v_r u_c / ||u||,  d||u|| / db = -v / ||u||.
        for (row, (y, s)) in self.normalized.iter().zip(&self.sqrt_weights).enumerate() {
            let u = k * (y - params.hard_iron);
            let norm = u.norm();
            if norm == 0.0 {
                continue;
            }
            let v = k.transpose() * u;
            let scale = -s / norm;

            for j in 0..offset {
                jac[(row, j)] = scale * v[j];
            }
            for (col, &p) in self.layout.free_matrix_params().iter().enumerate() {
                let (r, c) = MATRIX_ENTRIES[p];
                jac[(row, offset + col)] = scale * v[r] * u[c];
            }
        }
        Ok(jac)
    }
}

/// Result of the refinement stage.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub params: CalibrationParameters,
    /// Covariance over the full parameter vector, when requested.
    pub covariance: Option<DMatrix<f64>>,
    /// Mean squared residual over the refined measurements, in Tesla².
    pub mse: f64,
    pub chi_sq: f64,
}

/// Fit statistics of `params` over `indices`: mean squared residual (Tesla²)
/// and chi-square `Σ rᵢ²/σᵢ²`.
pub fn residual_statistics(
    measurements: &[Measurement],
    indices: &[usize],
    params: &CalibrationParameters,
    field_norm: f64,
    noise_floor: f64,
) -> (f64, f64) {
    if indices.is_empty() {
        return (0.0, 0.0);
    }
    let (sum_sq, chi_sq) = indices.iter().fold((0.0, 0.0), |(sum_sq, chi_sq), &i| {
        let m = &measurements[i];
        let r = norm_residual(m.flux(), params, field_norm);
        let sigma = m.std_dev_or(noise_floor);
        (sum_sq + r * r, chi_sq + (r / sigma).powi(2))
    });
    (sum_sq / indices.len() as f64, chi_sq)
}

/// Weighted least-squares re-fit of `initial` on the measurements in
/// `inliers`.
#[allow(clippy::too_many_arguments)]
pub fn refine(
    measurements: &[Measurement],
    inliers: &[usize],
    initial: &CalibrationParameters,
    layout: ParameterLayout,
    field_norm: f64,
    noise_floor: f64,
    keep_covariance: bool,
    solver: &LevenbergMarquardt,
) -> Result<Refinement, SolverError> {
    if inliers.len() < layout.free_len() {
        return Err(SolverError::InsufficientData {
            required: layout.free_len(),
            got: inliers.len(),
        });
    }

    let problem = NormResidualProblem::weighted(
        measurements,
        inliers,
        layout,
        &initial.hard_iron,
        field_norm,
        noise_floor,
    );
    let report = solver.minimize(&problem, layout.pack(initial, field_norm))?;

    let params = layout.unpack(&report.params, &initial.hard_iron, field_norm);
    if !params.is_finite() || params.correction().is_none() {
        return Err(SolverError::NonFinite);
    }

    let covariance = if keep_covariance {
        Some(layout.expand_covariance(&invert_normal(&report.normal, layout)?, field_norm))
    } else {
        None
    };

    let (mse, chi_sq) = residual_statistics(measurements, inliers, &params, field_norm, noise_floor);
    debug!(
        iterations = report.iterations,
        inliers = inliers.len(),
        mse,
        chi_sq,
        "refinement finished"
    );

    Ok(Refinement {
        params,
        covariance,
        mse,
        chi_sq,
    })
}

/// Inverse of the normal matrix `JᵀWJ`.
///
/// Without the common-axis constraint the norm data leave a rotation of the
/// soft-iron matrix undetermined, so the Moore-Penrose pseudo-inverse is used.
fn invert_normal(normal: &DMatrix<f64>, layout: ParameterLayout) -> Result<DMatrix<f64>, SolverError> {
    if layout.common_axis {
        if let Some(chol) = normal.clone().cholesky() {
            return Ok(chol.inverse());
        }
        warn!("normal matrix is not positive definite, using pseudo-inverse");
    }

    let svd = normal.clone().svd(true, true);
    let eps = svd.singular_values.max() * PSEUDO_INVERSE_RCOND;
    svd.pseudo_inverse(eps).map_err(|_| SolverError::Degenerate)
}
