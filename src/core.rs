//! Core sample-consensus traits and the generic consensus loop.
//!
//! The loop is assembled from four pluggable components:
//! - an [`Estimator`] producing candidate models from subsets,
//! - a [`Sampler`] drawing those subsets,
//! - a [`Scoring`] strategy ranking candidates against all data,
//! - a [`TerminationCriterion`] adapting the iteration budget.
//!
//! [`SampleConsensus`] drives them through an explicit [`Phase`] state machine
//! and reports iterations and progress to a [`ConsensusObserver`].

use tracing::{debug, trace};

use crate::scoring::Score;

/// Attempts at drawing a valid sample before an iteration is given up.
const MAX_SAMPLE_ATTEMPTS: usize = 100;

/// Estimator responsible for generating model hypotheses from subsets.
pub trait Estimator {
    /// Element of the data set.
    type Datum;
    /// Model type produced by this estimator.
    type Model: Clone;

    /// Size of a minimal sample for this estimator.
    fn sample_size(&self) -> usize;

    /// Check whether a given sample is usable.
    fn is_valid_sample(&self, data: &[Self::Datum], sample: &[usize]) -> bool;

    /// Estimate candidate models from a sample. An empty result means the
    /// sample yields no candidate.
    fn estimate_model(&self, data: &[Self::Datum], sample: &[usize]) -> Vec<Self::Model>;

    /// Validate a candidate model before scoring.
    fn is_valid_model(
        &self,
        model: &Self::Model,
        data: &[Self::Datum],
        sample: &[usize],
        threshold: f64,
    ) -> bool;
}

/// Sampler responsible for drawing subsets of indices.
pub trait Sampler {
    /// Draw `sample_size` distinct indices in `[0, point_count)` into `out_indices`.
    ///
    /// Returns `false` if a sample could not be drawn (caller may retry).
    fn sample(&mut self, point_count: usize, sample_size: usize, out_indices: &mut [usize])
        -> bool;

    /// Update the sampler state given the last sample and iteration.
    fn update(&mut self, sample: &[usize], sample_size: usize, iteration: usize, score_hint: f64);
}

/// Scoring strategy used to evaluate model quality and determine inliers.
pub trait Scoring<D, M> {
    /// Score type; greater compares as better.
    type Score: Clone + PartialOrd;

    /// Inlier/outlier threshold for residuals.
    fn threshold(&self) -> f64;

    /// Score a model and write the indices of its inliers into `inliers_out`.
    fn score(&self, data: &[D], model: &M, inliers_out: &mut Vec<usize>) -> Self::Score;
}

/// Termination criterion deciding when the consensus loop can stop.
pub trait TerminationCriterion<S> {
    /// Update the termination state after the best score improved.
    ///
    /// May lower `max_iterations`. Returns `true` if the loop should stop
    /// immediately.
    fn check(
        &mut self,
        point_count: usize,
        best_score: &S,
        sample_size: usize,
        max_iterations: &mut usize,
    ) -> bool;
}

/// Number of iterations needed to draw one all-inlier sample of
/// `sample_size` with probability `confidence`, given `inlier_ratio`.
///
/// `N = log(1 - confidence) / log(1 - inlier_ratio^sample_size)`, at least 1.
/// Returns `None` when no inlier has been seen yet.
pub fn required_iterations(confidence: f64, inlier_ratio: f64, sample_size: usize) -> Option<usize> {
    let inlier_ratio = inlier_ratio.clamp(0.0, 1.0);
    if inlier_ratio <= 0.0 {
        return None;
    }

    let p_good_sample = inlier_ratio.powi(sample_size as i32);
    if p_good_sample >= 1.0 {
        return Some(1);
    }
    if p_good_sample <= 0.0 {
        return None;
    }

    let log_one_minus_conf = (1.0 - confidence).ln();
    let log_one_minus_p = (1.0 - p_good_sample).ln();
    if !log_one_minus_conf.is_finite() || !log_one_minus_p.is_finite() || log_one_minus_p >= 0.0 {
        return None;
    }

    let required = (log_one_minus_conf / log_one_minus_p).ceil().max(1.0);
    if required >= usize::MAX as f64 {
        return None;
    }
    Some(required as usize)
}

/// RANSAC-style termination criterion that lowers the iteration budget using
/// the current best inlier ratio and the desired confidence.
#[derive(Debug, Clone, Copy)]
pub struct RansacTerminationCriterion {
    /// Desired confidence in (0, 1).
    pub confidence: f64,
}

impl TerminationCriterion<Score> for RansacTerminationCriterion {
    fn check(
        &mut self,
        point_count: usize,
        best_score: &Score,
        sample_size: usize,
        max_iterations: &mut usize,
    ) -> bool {
        if point_count == 0 {
            return false;
        }
        let inlier_ratio = best_score.inlier_count as f64 / point_count as f64;
        if let Some(required) = required_iterations(self.confidence, inlier_ratio, sample_size) {
            if required < *max_iterations {
                *max_iterations = required;
            }
        }

        // The outer loop stops once the (possibly lowered) budget is used up.
        false
    }
}

/// Termination for median-based scoring: behaves like
/// [`RansacTerminationCriterion`] and additionally stops as soon as the best
/// median residual drops to `stop_threshold`.
#[derive(Debug, Clone, Copy)]
pub struct MedianTerminationCriterion {
    pub confidence: f64,
    /// Residual (not squared) below which the search stops.
    pub stop_threshold: f64,
}

impl TerminationCriterion<Score> for MedianTerminationCriterion {
    fn check(
        &mut self,
        point_count: usize,
        best_score: &Score,
        sample_size: usize,
        max_iterations: &mut usize,
    ) -> bool {
        let mut ransac = RansacTerminationCriterion {
            confidence: self.confidence,
        };
        ransac.check(point_count, best_score, sample_size, max_iterations);

        best_score.cost() <= self.stop_threshold * self.stop_threshold
    }
}

/// Receives notifications from a running consensus loop.
///
/// Calls happen synchronously on the thread running the loop.
pub trait ConsensusObserver {
    /// An iteration finished; `iteration` counts completed iterations.
    fn on_iteration(&mut self, _iteration: usize) {}

    /// Progress (fraction of the current iteration budget) advanced by at
    /// least the configured delta.
    fn on_progress(&mut self, _progress: f32) {}
}

/// Observer that ignores every notification.
pub struct NoopObserver;

impl ConsensusObserver for NoopObserver {}

/// State of the consensus loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Sampling,
    Fitting,
    Scoring,
    Converged,
    Failed,
}

/// Generic sample-consensus loop orchestrating the components above.
pub struct SampleConsensus<E, Sa, Sc, T>
where
    E: Estimator,
    Sa: Sampler,
    Sc: Scoring<E::Datum, E::Model>,
    T: TerminationCriterion<Sc::Score>,
{
    pub estimator: E,
    pub sampler: Sa,
    pub scoring: Sc,
    pub termination: T,

    /// Number of measurements drawn per iteration (at least the estimator's
    /// minimal sample size).
    pub sample_size: usize,
    /// Hard cap on iterations.
    pub max_iterations: usize,
    /// Minimum progress advance between two progress notifications.
    pub progress_delta: f32,

    // Outputs / diagnostics
    pub best_model: Option<E::Model>,
    pub best_inliers: Vec<usize>,
    pub best_score: Option<Sc::Score>,
    pub iteration: usize,
    phase: Phase,
}

impl<E, Sa, Sc, T> SampleConsensus<E, Sa, Sc, T>
where
    E: Estimator,
    Sa: Sampler,
    Sc: Scoring<E::Datum, E::Model>,
    T: TerminationCriterion<Sc::Score>,
{
    /// Create a new loop from its components.
    pub fn new(estimator: E, sampler: Sa, scoring: Sc, termination: T) -> Self {
        let sample_size = estimator.sample_size();
        Self {
            estimator,
            sampler,
            scoring,
            termination,
            sample_size,
            max_iterations: 5000,
            progress_delta: 0.05,
            best_model: None,
            best_inliers: Vec::new(),
            best_score: None,
            iteration: 0,
            phase: Phase::Idle,
        }
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_progress_delta(mut self, progress_delta: f32) -> Self {
        self.progress_delta = progress_delta;
        self
    }

    /// Current phase of the state machine.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn reset(&mut self) {
        self.best_inliers.clear();
        self.best_model = None;
        self.best_score = None;
        self.iteration = 0;
        self.phase = Phase::Idle;
    }

    fn draw_sample(&mut self, data: &[E::Datum], sample: &mut [usize]) -> bool {
        let sample_size = sample.len();
        for _ in 0..MAX_SAMPLE_ATTEMPTS {
            if !self.sampler.sample(data.len(), sample_size, sample) {
                self.sampler.update(sample, sample_size, self.iteration, 0.0);
                continue;
            }
            if !self.estimator.is_valid_sample(data, sample) {
                self.sampler.update(sample, sample_size, self.iteration, 0.0);
                continue;
            }
            return true;
        }
        false
    }

    /// Run the loop on `data`, returning the final phase
    /// ([`Phase::Converged`] or [`Phase::Failed`]).
    pub fn run(&mut self, data: &[E::Datum], observer: &mut dyn ConsensusObserver) -> Phase {
        self.reset();

        let sample_size = self.sample_size.max(self.estimator.sample_size());
        if data.len() < sample_size || self.max_iterations == 0 {
            self.phase = Phase::Failed;
            return self.phase;
        }

        let mut sample = vec![0usize; sample_size];
        let mut tmp_inliers = Vec::new();
        let mut max_iterations = self.max_iterations;
        let mut last_progress = 0.0f32;
        let threshold = self.scoring.threshold();

        while self.iteration < max_iterations {
            self.phase = Phase::Sampling;
            let mut stop = false;

            if self.draw_sample(data, &mut sample) {
                self.phase = Phase::Fitting;
                let models = self.estimator.estimate_model(data, &sample);
                if models.is_empty() {
                    trace!(iteration = self.iteration, "subset yielded no candidate");
                }

                let mut improved = false;
                for model in models.iter() {
                    if !self
                        .estimator
                        .is_valid_model(model, data, &sample, threshold)
                    {
                        continue;
                    }

                    self.phase = Phase::Scoring;
                    tmp_inliers.clear();
                    let score = self.scoring.score(data, model, &mut tmp_inliers);

                    let better = match &self.best_score {
                        None => true,
                        Some(best) => score > *best,
                    };

                    if better {
                        self.best_score = Some(score);
                        self.best_model = Some(model.clone());
                        self.best_inliers.clear();
                        self.best_inliers.extend_from_slice(&tmp_inliers);
                        improved = true;
                    }
                }

                if improved {
                    if let Some(best_score) = &self.best_score {
                        stop = self.termination.check(
                            data.len(),
                            best_score,
                            sample_size,
                            &mut max_iterations,
                        );
                    }
                }
            }

            self.sampler
                .update(&sample, sample_size, self.iteration, 0.0);
            self.iteration += 1;
            observer.on_iteration(self.iteration);

            let progress = (self.iteration as f32 / max_iterations.max(1) as f32).min(1.0);
            if progress - last_progress >= self.progress_delta {
                last_progress = progress;
                observer.on_progress(progress);
            }

            if stop {
                break;
            }
        }

        self.phase = if self.best_model.is_some() && !self.best_inliers.is_empty() {
            Phase::Converged
        } else {
            Phase::Failed
        };
        debug!(
            iterations = self.iteration,
            inliers = self.best_inliers.len(),
            phase = ?self.phase,
            "consensus loop finished"
        );
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::UniformRandomSampler;
    use crate::scoring::{MsacScoring, RansacScoring};

    /// Model: a constant; data are scalars; residual is the absolute distance.
    #[derive(Clone, Debug, PartialEq)]
    struct Constant(f64);

    struct ConstantEstimator {
        fail: bool,
    }

    impl Estimator for ConstantEstimator {
        type Datum = f64;
        type Model = Constant;

        fn sample_size(&self) -> usize {
            1
        }

        fn is_valid_sample(&self, data: &[f64], sample: &[usize]) -> bool {
            sample.iter().all(|&i| i < data.len())
        }

        fn estimate_model(&self, data: &[f64], sample: &[usize]) -> Vec<Constant> {
            if self.fail {
                return Vec::new();
            }
            let mean = sample.iter().map(|&i| data[i]).sum::<f64>() / sample.len() as f64;
            vec![Constant(mean)]
        }

        fn is_valid_model(&self, model: &Constant, _: &[f64], _: &[usize], _: f64) -> bool {
            model.0.is_finite()
        }
    }

    fn residual(d: &f64, m: &Constant) -> f64 {
        (d - m.0).abs()
    }

    fn data_with_outliers() -> Vec<f64> {
        let mut data = vec![3.0; 18];
        data.push(100.0);
        data.push(-50.0);
        data
    }

    #[derive(Default)]
    struct CountingObserver {
        iterations: usize,
        progress: Vec<f32>,
    }

    impl ConsensusObserver for CountingObserver {
        fn on_iteration(&mut self, _iteration: usize) {
            self.iterations += 1;
        }

        fn on_progress(&mut self, progress: f32) {
            self.progress.push(progress);
        }
    }

    #[test]
    fn required_iterations_matches_closed_form() {
        // log(0.01) / log(1 - 0.25) = 16.008...
        assert_eq!(required_iterations(0.99, 0.5, 2), Some(17));
        assert_eq!(required_iterations(0.99, 1.0, 7), Some(1));
        assert_eq!(required_iterations(0.99, 0.0, 7), None);
    }

    #[test]
    fn ransac_termination_only_lowers_the_budget() {
        let mut term = RansacTerminationCriterion { confidence: 0.99 };
        let mut max_iterations = 10;
        let stop = term.check(100, &Score::new(50, 50.0), 2, &mut max_iterations);
        assert!(!stop);
        assert_eq!(max_iterations, 10);

        let mut max_iterations = 1000;
        term.check(100, &Score::new(50, 50.0), 2, &mut max_iterations);
        assert_eq!(max_iterations, 17);
    }

    #[test]
    fn median_termination_stops_below_threshold() {
        let mut term = MedianTerminationCriterion {
            confidence: 0.99,
            stop_threshold: 0.1,
        };
        let mut max_iterations = 1000;
        assert!(term.check(10, &Score::new(9, -0.001), 1, &mut max_iterations));
        assert!(!term.check(10, &Score::new(9, -1.0), 1, &mut max_iterations));
    }

    #[test]
    fn consensus_recovers_constant_and_inliers() {
        let data = data_with_outliers();
        let mut consensus = SampleConsensus::new(
            ConstantEstimator { fail: false },
            UniformRandomSampler::from_seed(3),
            MsacScoring::new(0.5, residual),
            RansacTerminationCriterion { confidence: 0.99 },
        )
        .with_max_iterations(200);

        let phase = consensus.run(&data, &mut NoopObserver);

        assert_eq!(phase, Phase::Converged);
        assert_eq!(consensus.phase(), Phase::Converged);
        assert_eq!(consensus.best_model, Some(Constant(3.0)));
        assert_eq!(consensus.best_inliers, (0..18).collect::<Vec<_>>());
        assert!(consensus.iteration < 200, "adaptive bound should cut the run short");
    }

    #[test]
    fn failing_estimator_exhausts_budget_and_fails() {
        let data = data_with_outliers();
        let mut observer = CountingObserver::default();
        let mut consensus = SampleConsensus::new(
            ConstantEstimator { fail: true },
            UniformRandomSampler::from_seed(3),
            RansacScoring::new(0.5, residual),
            RansacTerminationCriterion { confidence: 0.99 },
        )
        .with_max_iterations(25)
        .with_progress_delta(0.2);

        let phase = consensus.run(&data, &mut observer);

        assert_eq!(phase, Phase::Failed);
        assert!(consensus.best_model.is_none());
        assert_eq!(consensus.iteration, 25);
        assert_eq!(observer.iterations, 25);
        assert!((4..=5).contains(&observer.progress.len()));
        assert!(observer.progress.windows(2).all(|w| w[1] > w[0]));
        assert!(observer.progress.iter().all(|p| *p <= 1.0));
    }

    #[test]
    fn too_few_points_fail_without_iterating() {
        let mut consensus = SampleConsensus::new(
            ConstantEstimator { fail: false },
            UniformRandomSampler::from_seed(1),
            RansacScoring::new(0.5, residual),
            RansacTerminationCriterion { confidence: 0.99 },
        )
        .with_sample_size(4);

        let phase = consensus.run(&[1.0, 2.0], &mut NoopObserver);
        assert_eq!(phase, Phase::Failed);
        assert_eq!(consensus.iteration, 0);
    }
}
