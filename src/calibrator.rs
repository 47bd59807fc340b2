//! Robust magnetometer calibrator.
//!
//! [`MagnetometerCalibrator`] estimates the soft-iron matrix (and optionally
//! the hard-iron bias) from readings taken at a site with a known field norm.
//! A robust sample-consensus search discards outliers, then the consensus
//! model is optionally re-fitted on its inliers with covariance.
//!
//! ```no_run
//! use magcal::{MagnetometerCalibrator, Measurement, RobustMethod};
//!
//! # fn readings() -> Vec<Measurement> { Vec::new() }
//! let mut calibrator = MagnetometerCalibrator::builder()
//!     .measurements(readings())
//!     .ground_truth_field_norm(5e-5)
//!     .method(RobustMethod::Msac)
//!     .build()?;
//! calibrator.set_threshold(3e-7)?;
//! calibrator.calibrate()?;
//! let soft_iron = calibrator.estimated_soft_iron();
//! # Ok::<(), magcal::CalibrationError>(())
//! ```

use std::sync::Arc;

use nalgebra::{DMatrix, Matrix3, Vector3};
use tracing::{debug, warn};

use crate::choices::{SamplerChoice, ScoringChoice, TerminationChoice};
use crate::core::{ConsensusObserver, Phase, SampleConsensus};
use crate::error::CalibrationError;
use crate::estimator::MagnetometerEstimator;
use crate::measurement::Measurement;
use crate::model::{soft_iron_from_components, CalibrationParameters, ParameterLayout};
use crate::optim::LevenbergMarquardt;
use crate::refine::{refine, residual_statistics};
use crate::scoring::{measurement_residual, norm_residual};
use crate::settings::{self, CalibratorSettings, RobustMethod};

/// Receives notifications from [`MagnetometerCalibrator::calibrate`].
///
/// Callbacks run synchronously on the calibrating thread. Every mutator
/// invoked on the calibrator from a callback fails with
/// [`CalibrationError::Locked`].
pub trait CalibratorListener {
    /// Fired once the calibrator is running, before the first iteration.
    fn on_calibrate_start(&mut self, _calibrator: &mut MagnetometerCalibrator) {}

    /// Fired once per run, after success and after failure.
    fn on_calibrate_end(&mut self, _calibrator: &mut MagnetometerCalibrator) {}

    /// Fired after every consensus iteration with the iteration count.
    fn on_calibrate_next_iteration(&mut self, _calibrator: &mut MagnetometerCalibrator, _iteration: usize) {}

    /// Fired when progress towards the iteration bound advanced by at least
    /// the progress delta. `progress` is in [0, 1].
    fn on_calibrate_progress_change(&mut self, _calibrator: &mut MagnetometerCalibrator, _progress: f32) {}
}

/// Lifecycle of a calibrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibratorState {
    #[default]
    Idle,
    Running,
    Converged,
    Failed,
}

/// Inlier classification of the consensus model.
#[derive(Debug, Clone, PartialEq)]
pub struct InliersData {
    /// One flag per measurement.
    pub inliers: Vec<bool>,
    /// Norm residual of every measurement, in Tesla.
    pub residuals: Vec<f64>,
    pub num_inliers: usize,
}

#[derive(Debug, Clone)]
struct CalibrationResult {
    params: CalibrationParameters,
    covariance: Option<DMatrix<f64>>,
    mse: f64,
    chi_sq: f64,
    inliers_data: InliersData,
    iterations: usize,
}

/// Robust estimator of magnetometer hard-iron/soft-iron calibration.
pub struct MagnetometerCalibrator {
    measurements: Option<Arc<[Measurement]>>,
    hard_iron: Vector3<f64>,
    initial_soft_iron: Matrix3<f64>,
    field_norm: Option<f64>,
    common_axis: bool,
    estimate_hard_iron: bool,
    quality_scores: Option<Arc<[f64]>>,
    settings: CalibratorSettings,
    listener: Option<Box<dyn CalibratorListener>>,
    /// Set while the listener is detached for notification.
    notifying: bool,
    state: CalibratorState,
    result: Option<CalibrationResult>,
}

impl Default for MagnetometerCalibrator {
    fn default() -> Self {
        Self {
            measurements: None,
            hard_iron: Vector3::zeros(),
            initial_soft_iron: Matrix3::zeros(),
            field_norm: None,
            common_axis: false,
            estimate_hard_iron: false,
            quality_scores: None,
            settings: CalibratorSettings::default(),
            listener: None,
            notifying: false,
            state: CalibratorState::Idle,
            result: None,
        }
    }
}

impl std::fmt::Debug for MagnetometerCalibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MagnetometerCalibrator")
            .field("measurements", &self.measurements.as_ref().map(|m| m.len()))
            .field("field_norm", &self.field_norm)
            .field("common_axis", &self.common_axis)
            .field("estimate_hard_iron", &self.estimate_hard_iron)
            .field("settings", &self.settings)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn vector_from_matrix(m: &DMatrix<f64>) -> Result<Vector3<f64>, CalibrationError> {
    if m.shape() != (3, 1) {
        return Err(CalibrationError::InvalidDimensions {
            expected_rows: 3,
            expected_cols: 1,
            rows: m.nrows(),
            cols: m.ncols(),
        });
    }
    Ok(Vector3::new(m[0], m[1], m[2]))
}

fn matrix3_from_matrix(m: &DMatrix<f64>) -> Result<Matrix3<f64>, CalibrationError> {
    if m.shape() != (3, 3) {
        return Err(CalibrationError::InvalidDimensions {
            expected_rows: 3,
            expected_cols: 3,
            rows: m.nrows(),
            cols: m.ncols(),
        });
    }
    Ok(m.fixed_view::<3, 3>(0, 0).into_owned())
}

fn check_field_norm(norm: f64) -> Result<(), CalibrationError> {
    if norm > 0.0 && norm.is_finite() {
        Ok(())
    } else {
        Err(CalibrationError::InvalidFieldNorm(norm))
    }
}

fn check_quality_scores(scores: &[f64]) -> Result<(), CalibrationError> {
    if scores.is_empty() {
        return Err(CalibrationError::InvalidQualityScores("no quality scores given"));
    }
    if !scores.iter().all(|s| s.is_finite()) {
        return Err(CalibrationError::InvalidQualityScores("quality scores must be finite"));
    }
    Ok(())
}

impl MagnetometerCalibrator {
    /// Start configuring a calibrator.
    pub fn builder() -> CalibratorBuilder {
        CalibratorBuilder::default()
    }

    /// Unconfigured calibrator; see [`builder`](Self::builder).
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_unlocked(&self) -> Result<(), CalibrationError> {
        if self.is_running() {
            Err(CalibrationError::Locked)
        } else {
            Ok(())
        }
    }

    /// Free-parameter layout of the current configuration.
    pub fn layout(&self) -> ParameterLayout {
        ParameterLayout::new(self.common_axis, self.estimate_hard_iron)
    }

    /// Minimum number of measurements for the current configuration:
    /// 10 (7 with a common axis) with a known bias, 13 (10) when the bias is
    /// estimated.
    pub fn minimum_required_measurements(&self) -> usize {
        self.layout().minimum_measurements()
    }

    /// Whether a calibration is in progress.
    pub fn is_running(&self) -> bool {
        self.state == CalibratorState::Running
    }

    /// Lifecycle state of the last (or current) run.
    pub fn state(&self) -> CalibratorState {
        self.state
    }

    fn readiness(&self) -> Result<(), &'static str> {
        let measurements = self.measurements.as_deref().ok_or("measurements are not set")?;
        if measurements.len() < self.minimum_required_measurements() {
            return Err("not enough measurements for the current configuration");
        }
        if self.field_norm.is_none() {
            return Err("ground-truth field norm is not set");
        }
        if self.settings.method.requires_quality_scores() {
            let scores = self
                .quality_scores
                .as_deref()
                .ok_or("quality scores are required by the selected method")?;
            if scores.len() != measurements.len() {
                return Err("quality scores do not match the measurements");
            }
        }
        Ok(())
    }

    /// Whether [`calibrate`](Self::calibrate) can run with the current
    /// configuration.
    pub fn is_ready(&self) -> bool {
        self.readiness().is_ok()
    }

    // Configuration getters.

    /// Current run settings.
    pub fn settings(&self) -> &CalibratorSettings {
        &self.settings
    }

    /// Robust method used by the consensus search.
    pub fn method(&self) -> RobustMethod {
        self.settings.method
    }

    /// Inlier threshold on the norm residual, in Tesla.
    pub fn threshold(&self) -> f64 {
        self.settings.threshold
    }

    /// Confidence of drawing at least one outlier-free subset.
    pub fn confidence(&self) -> f64 {
        self.settings.confidence
    }

    /// Upper bound on consensus iterations.
    pub fn max_iterations(&self) -> usize {
        self.settings.max_iterations
    }

    /// Progress advance between two progress notifications.
    pub fn progress_delta(&self) -> f32 {
        self.settings.progress_delta
    }

    /// Whether the consensus model is re-fitted on its inliers.
    pub fn is_result_refined(&self) -> bool {
        self.settings.refine_result
    }

    /// Iteration cap of the final re-fit.
    pub fn refinement_max_iterations(&self) -> usize {
        self.settings.refinement_max_iterations
    }

    /// Whether the covariance of the refined model is kept.
    pub fn is_covariance_kept(&self) -> bool {
        self.settings.keep_covariance
    }

    /// Effective number of measurements drawn per consensus iteration.
    pub fn preliminary_subset_size(&self) -> usize {
        self.settings.subset_size(self.minimum_required_measurements())
    }

    /// Median residual at which median-based methods stop early, in Tesla.
    pub fn stop_threshold(&self) -> f64 {
        self.settings.stop_threshold
    }

    /// Standard deviation assumed for readings without one, in Tesla.
    pub fn noise_floor(&self) -> f64 {
        self.settings.noise_floor
    }

    /// Whether every subset solution is polished by a nonlinear fit.
    pub fn is_preliminary_solution_refined(&self) -> bool {
        self.settings.refine_preliminary_solutions
    }

    /// Sampling seed; `None` seeds from entropy.
    pub fn seed(&self) -> Option<u64> {
        self.settings.seed
    }

    /// Readings to calibrate from, in Tesla.
    pub fn measurements(&self) -> Option<&[Measurement]> {
        self.measurements.as_deref()
    }

    /// Norm of the ambient field at the calibration site, in Tesla.
    pub fn ground_truth_field_norm(&self) -> Option<f64> {
        self.field_norm
    }

    /// Known hard-iron bias, or the initial guess when it is estimated.
    pub fn hard_iron(&self) -> Vector3<f64> {
        self.hard_iron
    }

    /// Initial soft-iron guess `M`; it also fixes the rotation of the
    /// general model.
    pub fn initial_soft_iron(&self) -> Matrix3<f64> {
        self.initial_soft_iron
    }

    /// Whether `myx`, `mzx` and `mzy` are pinned to zero.
    pub fn is_common_axis_used(&self) -> bool {
        self.common_axis
    }

    /// Whether the hard-iron bias is estimated rather than known.
    pub fn is_hard_iron_estimated(&self) -> bool {
        self.estimate_hard_iron
    }

    /// Per-measurement quality scores used by PROSAC and PROMedS.
    pub fn quality_scores(&self) -> Option<&[f64]> {
        self.quality_scores.as_deref()
    }

    /// Whether a listener is attached, including while it is being notified.
    pub fn has_listener(&self) -> bool {
        self.listener.is_some() || self.notifying
    }

    // Setters. All fail with `Locked` while a calibration runs.

    /// Replace every run setting at once.
    pub fn set_settings(&mut self, settings: CalibratorSettings) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings.validate(self.minimum_required_measurements())?;
        self.settings = settings;
        Ok(())
    }

    /// Robust method; PROSAC and PROMedS also need quality scores.
    pub fn set_method(&mut self, method: RobustMethod) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.settings.method = method;
        Ok(())
    }

    /// Inlier threshold in Tesla; must be positive.
    pub fn set_threshold(&mut self, threshold: f64) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_threshold(threshold)?;
        self.settings.threshold = threshold;
        Ok(())
    }

    /// Confidence in the open interval (0, 1).
    pub fn set_confidence(&mut self, confidence: f64) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_confidence(confidence)?;
        self.settings.confidence = confidence;
        Ok(())
    }

    /// Iteration bound; at least 1.
    pub fn set_max_iterations(&mut self, max_iterations: usize) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_max_iterations(max_iterations)?;
        self.settings.max_iterations = max_iterations;
        Ok(())
    }

    /// Progress granularity in the open interval (0, 1).
    pub fn set_progress_delta(&mut self, progress_delta: f32) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_progress_delta(progress_delta)?;
        self.settings.progress_delta = progress_delta;
        Ok(())
    }

    /// Re-fit the consensus model on its inliers after the search.
    pub fn set_result_refined(&mut self, refine: bool) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.settings.refine_result = refine;
        Ok(())
    }

    /// Iteration cap of the final re-fit; at least 1.
    pub fn set_refinement_max_iterations(&mut self, max_iterations: usize) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_max_iterations(max_iterations)?;
        self.settings.refinement_max_iterations = max_iterations;
        Ok(())
    }

    /// Keep the covariance of the refined model.
    pub fn set_covariance_kept(&mut self, keep: bool) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.settings.keep_covariance = keep;
        Ok(())
    }

    /// Measurements per subset; at least the minimum of the current mode.
    pub fn set_preliminary_subset_size(&mut self, size: usize) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_subset_size(size, self.minimum_required_measurements())?;
        self.settings.preliminary_subset_size = Some(size);
        Ok(())
    }

    /// Early-stop median residual in Tesla; non-negative.
    pub fn set_stop_threshold(&mut self, stop_threshold: f64) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_stop_threshold(stop_threshold)?;
        self.settings.stop_threshold = stop_threshold;
        Ok(())
    }

    /// Fallback standard deviation in Tesla; must be positive.
    pub fn set_noise_floor(&mut self, noise_floor: f64) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        settings::check_noise_floor(noise_floor)?;
        self.settings.noise_floor = noise_floor;
        Ok(())
    }

    /// Polish every subset solution with a nonlinear fit.
    pub fn set_preliminary_solution_refined(&mut self, refine: bool) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.settings.refine_preliminary_solutions = refine;
        Ok(())
    }

    /// Sampling seed for reproducible runs.
    pub fn set_seed(&mut self, seed: Option<u64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.settings.seed = seed;
        Ok(())
    }

    /// Readings in Tesla. Non-finite readings never enter a subset.
    pub fn set_measurements(
        &mut self,
        measurements: impl Into<Arc<[Measurement]>>,
    ) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.measurements = Some(measurements.into());
        Ok(())
    }

    /// Field norm at the site in Tesla; must be positive and finite.
    pub fn set_ground_truth_field_norm(&mut self, norm: f64) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        check_field_norm(norm)?;
        self.field_norm = Some(norm);
        Ok(())
    }

    /// Known bias, or the initial guess when the bias is estimated.
    pub fn set_hard_iron(&mut self, hard_iron: Vector3<f64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.hard_iron = hard_iron;
        Ok(())
    }

    /// Same as [`set_hard_iron`](Self::set_hard_iron), per component.
    pub fn set_hard_iron_components(&mut self, bx: f64, by: f64, bz: f64) -> Result<(), CalibrationError> {
        self.set_hard_iron(Vector3::new(bx, by, bz))
    }

    /// Set the hard iron from a 3x1 matrix.
    pub fn set_hard_iron_matrix(&mut self, hard_iron: &DMatrix<f64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.hard_iron = vector_from_matrix(hard_iron)?;
        Ok(())
    }

    /// Initial soft-iron guess `M`.
    pub fn set_initial_soft_iron(&mut self, soft_iron: Matrix3<f64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.initial_soft_iron = soft_iron;
        Ok(())
    }

    /// Set the initial soft iron from a 3x3 matrix.
    pub fn set_initial_soft_iron_matrix(&mut self, soft_iron: &DMatrix<f64>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.initial_soft_iron = matrix3_from_matrix(soft_iron)?;
        Ok(())
    }

    /// Diagonal of the initial soft iron; cross-coupling terms are kept.
    pub fn set_initial_scaling_factors(&mut self, sx: f64, sy: f64, sz: f64) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.initial_soft_iron[(0, 0)] = sx;
        self.initial_soft_iron[(1, 1)] = sy;
        self.initial_soft_iron[(2, 2)] = sz;
        Ok(())
    }

    /// Off-diagonal terms of the initial soft iron; scaling factors are kept.
    pub fn set_initial_cross_coupling_errors(
        &mut self,
        mxy: f64,
        mxz: f64,
        myx: f64,
        myz: f64,
        mzx: f64,
        mzy: f64,
    ) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        let m = &mut self.initial_soft_iron;
        m[(0, 1)] = mxy;
        m[(0, 2)] = mxz;
        m[(1, 0)] = myx;
        m[(1, 2)] = myz;
        m[(2, 0)] = mzx;
        m[(2, 1)] = mzy;
        Ok(())
    }

    /// Whole initial soft iron, in parameter order.
    #[allow(clippy::too_many_arguments)]
    pub fn set_initial_scaling_factors_and_cross_coupling_errors(
        &mut self,
        sx: f64,
        sy: f64,
        sz: f64,
        mxy: f64,
        mxz: f64,
        myx: f64,
        myz: f64,
        mzx: f64,
        mzy: f64,
    ) -> Result<(), CalibrationError> {
        self.set_initial_soft_iron(soft_iron_from_components(
            sx, sy, sz, mxy, mxz, myx, myz, mzx, mzy,
        ))
    }

    /// Pin `myx`, `mzx` and `mzy` to zero.
    pub fn set_common_axis_used(&mut self, common_axis: bool) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.common_axis = common_axis;
        Ok(())
    }

    /// Estimate the bias instead of using the known one.
    pub fn set_hard_iron_estimated(&mut self, estimate: bool) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.estimate_hard_iron = estimate;
        Ok(())
    }

    /// One finite score per measurement, higher is better.
    pub fn set_quality_scores(&mut self, scores: impl Into<Arc<[f64]>>) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        let scores = scores.into();
        check_quality_scores(&scores)?;
        self.quality_scores = Some(scores);
        Ok(())
    }

    /// Attach or detach the listener.
    pub fn set_listener(
        &mut self,
        listener: Option<Box<dyn CalibratorListener>>,
    ) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.listener = listener;
        Ok(())
    }

    // Results.

    /// Estimated calibration, after a successful run.
    pub fn estimated_params(&self) -> Option<&CalibrationParameters> {
        self.result.as_ref().map(|r| &r.params)
    }

    /// Estimated soft-iron matrix `M`.
    pub fn estimated_soft_iron(&self) -> Option<Matrix3<f64>> {
        self.estimated_params().map(|p| p.soft_iron)
    }

    /// Estimated scaling factor along x.
    pub fn estimated_sx(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.sx())
    }

    /// Estimated scaling factor along y.
    pub fn estimated_sy(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.sy())
    }

    /// Estimated scaling factor along z.
    pub fn estimated_sz(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.sz())
    }

    /// Estimated cross-coupling errors, named after their position in `M`.
    pub fn estimated_mxy(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.mxy())
    }

    pub fn estimated_mxz(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.mxz())
    }

    pub fn estimated_myx(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.myx())
    }

    pub fn estimated_myz(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.myz())
    }

    pub fn estimated_mzx(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.mzx())
    }

    pub fn estimated_mzy(&self) -> Option<f64> {
        self.estimated_params().map(|p| p.mzy())
    }

    /// Hard iron of the estimated calibration (the known bias unless it is
    /// estimated).
    pub fn estimated_hard_iron(&self) -> Option<Vector3<f64>> {
        self.estimated_params().map(|p| p.hard_iron)
    }

    /// Covariance over `[sx, sy, sz, mxy, mxz, myx, myz, mzx, mzy]`, preceded
    /// by the bias when it is estimated.
    pub fn estimated_covariance(&self) -> Option<&DMatrix<f64>> {
        self.result.as_ref().and_then(|r| r.covariance.as_ref())
    }

    /// Mean squared norm residual over the inliers, in Tesla².
    pub fn estimated_mse(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.mse)
    }

    /// Chi-square `Σ rᵢ²/σᵢ²` over the inliers.
    pub fn estimated_chi_sq(&self) -> Option<f64> {
        self.result.as_ref().map(|r| r.chi_sq)
    }

    /// Inlier flags and residuals of every measurement.
    pub fn inliers_data(&self) -> Option<&InliersData> {
        self.result.as_ref().map(|r| &r.inliers_data)
    }

    /// Consensus iterations of the last successful run.
    pub fn iterations(&self) -> Option<usize> {
        self.result.as_ref().map(|r| r.iterations)
    }

    /// Run the robust calibration.
    ///
    /// On success the estimate is available through the `estimated_*`
    /// getters. Fails with `Locked` when re-entered from a listener,
    /// `NotReady` when the configuration is incomplete and `NoConsensus`
    /// when no model gathered any inlier.
    pub fn calibrate(&mut self) -> Result<(), CalibrationError> {
        self.ensure_unlocked()?;
        self.readiness().map_err(CalibrationError::NotReady)?;
        let (Some(measurements), Some(field_norm)) = (self.measurements.clone(), self.field_norm) else {
            return Err(CalibrationError::NotReady("measurements or field norm are not set"));
        };

        let settings = self.settings.clone();
        let layout = self.layout();
        let sample_size = self.preliminary_subset_size();
        let initial = CalibrationParameters::new(self.hard_iron, self.initial_soft_iron);

        let sampler = SamplerChoice::for_method(settings.method, self.quality_scores.as_deref(), settings.seed)?;
        let estimator = MagnetometerEstimator::new(layout, field_norm, initial)
            .with_sample_size(sample_size)
            .with_refined_solutions(settings.refine_preliminary_solutions);
        let scoring = ScoringChoice::for_method(
            settings.method,
            settings.threshold,
            sample_size,
            measurement_residual(field_norm),
        );
        let mut consensus = SampleConsensus::new(
            estimator,
            sampler,
            scoring,
            TerminationChoice::for_settings(&settings),
        )
        .with_sample_size(sample_size)
        .with_max_iterations(settings.max_iterations)
        .with_progress_delta(settings.progress_delta);

        self.state = CalibratorState::Running;
        self.result = None;
        let mut listener = self.listener.take();
        self.notifying = listener.is_some();
        if let Some(l) = listener.as_deref_mut() {
            l.on_calibrate_start(self);
        }

        let phase = {
            let mut bridge = ListenerBridge {
                calibrator: &mut *self,
                listener: listener.as_deref_mut(),
            };
            consensus.run(&measurements, &mut bridge)
        };

        let outcome = match (phase, consensus.best_model.take()) {
            (Phase::Converged, Some(best)) => Ok(self.finish(
                &measurements,
                best,
                &consensus.best_inliers,
                consensus.iteration,
                layout,
                field_norm,
                &settings,
            )),
            _ => Err(CalibrationError::NoConsensus {
                iterations: consensus.iteration,
            }),
        };

        if let Some(l) = listener.as_deref_mut() {
            l.on_calibrate_end(self);
        }
        self.listener = listener;
        self.notifying = false;

        match outcome {
            Ok(result) => {
                debug!(
                    iterations = result.iterations,
                    inliers = result.inliers_data.num_inliers,
                    mse = result.mse,
                    "calibration finished"
                );
                self.result = Some(result);
                self.state = CalibratorState::Converged;
                Ok(())
            }
            Err(err) => {
                warn!(%err, "calibration failed");
                self.state = CalibratorState::Failed;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        measurements: &[Measurement],
        best: CalibrationParameters,
        inliers: &[usize],
        iterations: usize,
        layout: ParameterLayout,
        field_norm: f64,
        settings: &CalibratorSettings,
    ) -> CalibrationResult {
        let residuals: Vec<f64> = measurements
            .iter()
            .map(|m| norm_residual(m.flux(), &best, field_norm))
            .collect();
        let mut flags = vec![false; measurements.len()];
        for &i in inliers {
            flags[i] = true;
        }
        let inliers_data = InliersData {
            inliers: flags,
            residuals,
            num_inliers: inliers.len(),
        };

        let solver = LevenbergMarquardt::default().with_max_iterations(settings.refinement_max_iterations);
        let refined = if settings.refine_result {
            refine(
                measurements,
                inliers,
                &best,
                layout,
                field_norm,
                settings.noise_floor,
                settings.keep_covariance,
                &solver,
            )
            .map_err(|err| warn!(%err, "refinement failed, keeping consensus model"))
            .ok()
        } else {
            None
        };

        match refined {
            Some(r) => CalibrationResult {
                params: r.params,
                covariance: r.covariance,
                mse: r.mse,
                chi_sq: r.chi_sq,
                inliers_data,
                iterations,
            },
            None => {
                let (mse, chi_sq) =
                    residual_statistics(measurements, inliers, &best, field_norm, settings.noise_floor);
                CalibrationResult {
                    params: best,
                    covariance: None,
                    mse,
                    chi_sq,
                    inliers_data,
                    iterations,
                }
            }
        }
    }
}

/// Forwards consensus notifications to the calibrator listener.
struct ListenerBridge<'a> {
    calibrator: &'a mut MagnetometerCalibrator,
    listener: Option<&'a mut (dyn CalibratorListener + 'static)>,
}

impl ConsensusObserver for ListenerBridge<'_> {
    fn on_iteration(&mut self, iteration: usize) {
        if let Some(l) = self.listener.as_deref_mut() {
            l.on_calibrate_next_iteration(self.calibrator, iteration);
        }
    }

    fn on_progress(&mut self, progress: f32) {
        if let Some(l) = self.listener.as_deref_mut() {
            l.on_calibrate_progress_change(self.calibrator, progress);
        }
    }
}

/// Builder for [`MagnetometerCalibrator`]. Every input is optional; an omitted
/// bias is zero and an omitted soft-iron guess is the zero matrix.
#[derive(Default)]
pub struct CalibratorBuilder {
    measurements: Option<Arc<[Measurement]>>,
    hard_iron: Option<Vector3<f64>>,
    initial_soft_iron: Option<Matrix3<f64>>,
    field_norm: Option<f64>,
    common_axis: bool,
    estimate_hard_iron: bool,
    quality_scores: Option<Arc<[f64]>>,
    settings: CalibratorSettings,
    listener: Option<Box<dyn CalibratorListener>>,
}

impl CalibratorBuilder {
    /// Readings in Tesla.
    pub fn measurements(mut self, measurements: impl Into<Arc<[Measurement]>>) -> Self {
        self.measurements = Some(measurements.into());
        self
    }

    /// Known bias, or the initial guess when it is estimated.
    pub fn hard_iron(mut self, hard_iron: Vector3<f64>) -> Self {
        self.hard_iron = Some(hard_iron);
        self
    }

    pub fn hard_iron_array(self, hard_iron: [f64; 3]) -> Self {
        self.hard_iron(Vector3::from(hard_iron))
    }

    pub fn hard_iron_components(self, bx: f64, by: f64, bz: f64) -> Self {
        self.hard_iron(Vector3::new(bx, by, bz))
    }

    /// Hard iron from a 3x1 matrix.
    pub fn hard_iron_matrix(self, hard_iron: &DMatrix<f64>) -> Result<Self, CalibrationError> {
        Ok(self.hard_iron(vector_from_matrix(hard_iron)?))
    }

    /// Field norm at the site, in Tesla.
    pub fn ground_truth_field_norm(mut self, norm: f64) -> Self {
        self.field_norm = Some(norm);
        self
    }

    /// Initial soft-iron guess `M`.
    pub fn initial_soft_iron(mut self, soft_iron: Matrix3<f64>) -> Self {
        self.initial_soft_iron = Some(soft_iron);
        self
    }

    /// Initial soft iron from a 3x3 matrix.
    pub fn initial_soft_iron_matrix(self, soft_iron: &DMatrix<f64>) -> Result<Self, CalibrationError> {
        Ok(self.initial_soft_iron(matrix3_from_matrix(soft_iron)?))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn initial_scaling_factors_and_cross_coupling_errors(
        self,
        sx: f64,
        sy: f64,
        sz: f64,
        mxy: f64,
        mxz: f64,
        myx: f64,
        myz: f64,
        mzx: f64,
        mzy: f64,
    ) -> Self {
        self.initial_soft_iron(soft_iron_from_components(
            sx, sy, sz, mxy, mxz, myx, myz, mzx, mzy,
        ))
    }

    /// Pin `myx`, `mzx` and `mzy` to zero.
    pub fn common_axis(mut self, common_axis: bool) -> Self {
        self.common_axis = common_axis;
        self
    }

    /// Estimate the bias instead of using the known one.
    pub fn estimate_hard_iron(mut self, estimate: bool) -> Self {
        self.estimate_hard_iron = estimate;
        self
    }

    /// Per-measurement quality scores for PROSAC and PROMedS.
    pub fn quality_scores(mut self, scores: impl Into<Arc<[f64]>>) -> Self {
        self.quality_scores = Some(scores.into());
        self
    }

    pub fn method(mut self, method: RobustMethod) -> Self {
        self.settings.method = method;
        self
    }

    /// Run settings; validated by [`build`](Self::build).
    pub fn settings(mut self, settings: CalibratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Listener notified during calibration.
    pub fn listener(mut self, listener: impl CalibratorListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Validate the inputs and build the calibrator.
    pub fn build(self) -> Result<MagnetometerCalibrator, CalibrationError> {
        let layout = ParameterLayout::new(self.common_axis, self.estimate_hard_iron);
        self.settings.validate(layout.minimum_measurements())?;
        if let Some(norm) = self.field_norm {
            check_field_norm(norm)?;
        }
        if let Some(scores) = self.quality_scores.as_deref() {
            check_quality_scores(scores)?;
        }

        Ok(MagnetometerCalibrator {
            measurements: self.measurements,
            hard_iron: self.hard_iron.unwrap_or_else(Vector3::zeros),
            initial_soft_iron: self.initial_soft_iron.unwrap_or_else(Matrix3::zeros),
            field_norm: self.field_norm,
            common_axis: self.common_axis,
            estimate_hard_iron: self.estimate_hard_iron,
            quality_scores: self.quality_scores,
            settings: self.settings,
            listener: self.listener,
            notifying: false,
            state: CalibratorState::Idle,
            result: None,
        })
    }
}
