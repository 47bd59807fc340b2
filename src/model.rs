//! Hard-iron/soft-iron calibration model.
//!
//! A raw reading `m` relates to the true flux density `f` through
//! `m = b + (I + M) f`, where `b` is the hard-iron bias and `M` the soft-iron
//! scaling/cross-coupling matrix
//!
//! ```text
//!     | sx  mxy mxz |
//! M = | myx sy  myz |
//!     | mzx mzy sz  |
//! ```
//!
//! Parameter vectors always follow the order `[sx, sy, sz, mxy, mxz, myx, myz,
//! mzx, mzy]`, preceded by `[bx, by, bz]` when the hard iron is estimated.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

/// Number of entries of the soft-iron matrix.
pub const MATRIX_PARAMS: usize = 9;

/// Number of hard-iron bias components.
pub const BIAS_PARAMS: usize = 3;

/// `(row, col)` position of every matrix parameter in `M`.
pub(crate) const MATRIX_ENTRIES: [(usize, usize); MATRIX_PARAMS] = [
    (0, 0),
    (1, 1),
    (2, 2),
    (0, 1),
    (0, 2),
    (1, 0),
    (1, 2),
    (2, 0),
    (2, 1),
];

const GENERAL_FREE: [usize; 9] = [0, 1, 2, 3, 4, 5, 6, 7, 8];

// myx, mzx and mzy are pinned to zero under the common-axis constraint.
const COMMON_AXIS_FREE: [usize; 6] = [0, 1, 2, 3, 4, 6];

/// Build a soft-iron matrix from its scaling factors and cross-coupling errors.
#[allow(clippy::too_many_arguments)]
pub fn soft_iron_from_components(
    sx: f64,
    sy: f64,
    sz: f64,
    mxy: f64,
    mxz: f64,
    myx: f64,
    myz: f64,
    mzx: f64,
    mzy: f64,
) -> Matrix3<f64> {
    Matrix3::new(sx, mxy, mxz, myx, sy, myz, mzx, mzy, sz)
}

/// Estimated (or known) magnetometer calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationParameters {
    /// Hard-iron bias, in Tesla.
    pub hard_iron: Vector3<f64>,
    /// Soft-iron matrix `M` (dimensionless).
    pub soft_iron: Matrix3<f64>,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self::new(Vector3::zeros(), Matrix3::zeros())
    }
}

impl CalibrationParameters {
    pub fn new(hard_iron: Vector3<f64>, soft_iron: Matrix3<f64>) -> Self {
        Self {
            hard_iron,
            soft_iron,
        }
    }

    pub fn sx(&self) -> f64 {
        self.soft_iron[(0, 0)]
    }

    pub fn sy(&self) -> f64 {
        self.soft_iron[(1, 1)]
    }

    pub fn sz(&self) -> f64 {
        self.soft_iron[(2, 2)]
    }

    pub fn mxy(&self) -> f64 {
        self.soft_iron[(0, 1)]
    }

    pub fn mxz(&self) -> f64 {
        self.soft_iron[(0, 2)]
    }

    pub fn myx(&self) -> f64 {
        self.soft_iron[(1, 0)]
    }

    pub fn myz(&self) -> f64 {
        self.soft_iron[(1, 2)]
    }

    pub fn mzx(&self) -> f64 {
        self.soft_iron[(2, 0)]
    }

    pub fn mzy(&self) -> f64 {
        self.soft_iron[(2, 1)]
    }

    /// Soft-iron parameters in canonical order.
    pub fn matrix_params(&self) -> [f64; MATRIX_PARAMS] {
        MATRIX_ENTRIES.map(|(r, c)| self.soft_iron[(r, c)])
    }

    /// Distortion matrix `I + M`.
    pub fn transform(&self) -> Matrix3<f64> {
        Matrix3::identity() + self.soft_iron
    }

    /// Correction matrix `(I + M)⁻¹`, if `I + M` is invertible.
    pub fn correction(&self) -> Option<Matrix3<f64>> {
        self.transform().try_inverse()
    }

    /// Recover the true flux density from a raw reading.
    pub fn correct(&self, measured: &Vector3<f64>) -> Option<Vector3<f64>> {
        self.correction().map(|k| k * (measured - self.hard_iron))
    }

    /// Apply the calibration errors to a true flux density.
    pub fn distort(&self, true_flux: &Vector3<f64>) -> Vector3<f64> {
        self.hard_iron + self.transform() * true_flux
    }

    /// Whether the lower-triangular cross-coupling terms are all zero.
    pub fn has_common_axis(&self) -> bool {
        self.myx() == 0.0 && self.mzx() == 0.0 && self.mzy() == 0.0
    }

    pub(crate) fn is_finite(&self) -> bool {
        self.hard_iron.iter().all(|v| v.is_finite()) && self.soft_iron.iter().all(|v| v.is_finite())
    }
}

/// Which calibration parameters are free during a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParameterLayout {
    /// Pin `myx`, `mzx` and `mzy` to zero.
    pub common_axis: bool,
    /// Estimate the hard-iron bias instead of treating it as known.
    pub estimate_hard_iron: bool,
}

impl ParameterLayout {
    pub fn new(common_axis: bool, estimate_hard_iron: bool) -> Self {
        Self {
            common_axis,
            estimate_hard_iron,
        }
    }

    /// Indices (in canonical order) of the free soft-iron parameters.
    pub fn free_matrix_params(&self) -> &'static [usize] {
        if self.common_axis {
            &COMMON_AXIS_FREE
        } else {
            &GENERAL_FREE
        }
    }

    fn bias_len(&self) -> usize {
        if self.estimate_hard_iron {
            BIAS_PARAMS
        } else {
            0
        }
    }

    /// Number of free parameters.
    pub fn free_len(&self) -> usize {
        self.bias_len() + self.free_matrix_params().len()
    }

    /// Dimension of the full parameter vector (and of the covariance).
    pub fn full_len(&self) -> usize {
        self.bias_len() + MATRIX_PARAMS
    }

    /// Smallest number of measurements that over-determines the free parameters.
    ///
    /// 10 general / 7 common-axis with a known bias; 13 / 10 when the bias is
    /// estimated.
    pub fn minimum_measurements(&self) -> usize {
        self.free_len() + 1
    }

    /// Pack the free parameters. The bias is expressed in units of `norm`.
    pub fn pack(&self, params: &CalibrationParameters, norm: f64) -> DVector<f64> {
        let mut x = DVector::zeros(self.free_len());
        let offset = self.bias_len();
        if self.estimate_hard_iron {
            for i in 0..BIAS_PARAMS {
                x[i] = params.hard_iron[i] / norm;
            }
        }
        let all = params.matrix_params();
        for (k, &p) in self.free_matrix_params().iter().enumerate() {
            x[offset + k] = all[p];
        }
        x
    }

    /// Inverse of [`pack`](Self::pack). Constrained parameters are zero and a
    /// known bias is taken from `known_hard_iron`.
    pub fn unpack(
        &self,
        x: &DVector<f64>,
        known_hard_iron: &Vector3<f64>,
        norm: f64,
    ) -> CalibrationParameters {
        let offset = self.bias_len();
        let hard_iron = if self.estimate_hard_iron {
            Vector3::new(x[0], x[1], x[2]) * norm
        } else {
            *known_hard_iron
        };
        let mut soft_iron = Matrix3::zeros();
        for (k, &p) in self.free_matrix_params().iter().enumerate() {
            let (r, c) = MATRIX_ENTRIES[p];
            soft_iron[(r, c)] = x[offset + k];
        }
        CalibrationParameters::new(hard_iron, soft_iron)
    }

    /// Expand a covariance over the packed parameters into the full parameter
    /// vector, converting bias entries from units of `norm` back to Tesla.
    ///
    /// Constrained parameters get zero rows and columns.
    pub fn expand_covariance(&self, reduced: &DMatrix<f64>, norm: f64) -> DMatrix<f64> {
        let offset = self.bias_len();
        let mut full_index = Vec::with_capacity(self.free_len());
        let mut scale = Vec::with_capacity(self.free_len());
        for i in 0..offset {
            full_index.push(i);
            scale.push(norm);
        }
        for &p in self.free_matrix_params() {
            full_index.push(offset + p);
            scale.push(1.0);
        }

        let n = self.full_len();
        let mut full = DMatrix::zeros(n, n);
        for (a, &fa) in full_index.iter().enumerate() {
            for (b, &fb) in full_index.iter().enumerate() {
                full[(fa, fb)] = reduced[(a, b)] * scale[a] * scale[b];
            }
        }
        full
    }
}
