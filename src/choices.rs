//! Runtime wrappers exposing the built-in components via enums while
//! [`SampleConsensus`](crate::core::SampleConsensus) stays fully generic.
//! Each [`RobustMethod`] maps to one sampler, scoring and termination
//! variant; the sampler and termination enums also carry a `Dyn` escape
//! hatch for custom implementations.

use crate::core::{MedianTerminationCriterion, RansacTerminationCriterion, Sampler, Scoring, TerminationCriterion};
use crate::error::CalibrationError;
use crate::samplers::{ProsacSampler, UniformRandomSampler};
use crate::scoring::{LmedsScoring, MsacScoring, RansacScoring, Score};
use crate::settings::{CalibratorSettings, RobustMethod};

/// Runtime sampler selection.
pub enum SamplerChoice {
    Uniform(UniformRandomSampler),
    Prosac(ProsacSampler),
    Dyn(Box<dyn Sampler + Send + Sync>),
}

impl SamplerChoice {
    /// Sampler used by `method`. Quality-ordered methods need one score per
    /// measurement.
    pub fn for_method(
        method: RobustMethod,
        quality_scores: Option<&[f64]>,
        seed: Option<u64>,
    ) -> Result<Self, CalibrationError> {
        if !method.requires_quality_scores() {
            return Ok(SamplerChoice::Uniform(UniformRandomSampler::from_optional_seed(seed)));
        }
        let scores = quality_scores.ok_or(CalibrationError::NotReady(
            "quality scores are required by the selected method",
        ))?;
        Ok(SamplerChoice::Prosac(ProsacSampler::from_quality_scores(scores, seed)))
    }
}

impl Sampler for SamplerChoice {
    fn sample(&mut self, point_count: usize, sample_size: usize, out_indices: &mut [usize]) -> bool {
        match self {
            SamplerChoice::Uniform(s) => s.sample(point_count, sample_size, out_indices),
            SamplerChoice::Prosac(s) => s.sample(point_count, sample_size, out_indices),
            SamplerChoice::Dyn(s) => s.sample(point_count, sample_size, out_indices),
        }
    }

    fn update(&mut self, sample: &[usize], sample_size: usize, iteration: usize, score_hint: f64) {
        match self {
            SamplerChoice::Uniform(s) => s.update(sample, sample_size, iteration, score_hint),
            SamplerChoice::Prosac(s) => s.update(sample, sample_size, iteration, score_hint),
            SamplerChoice::Dyn(s) => s.update(sample, sample_size, iteration, score_hint),
        }
    }
}

/// Runtime scoring selection over a residual function `F`.
pub enum ScoringChoice<F> {
    Ransac(RansacScoring<F>),
    Msac(MsacScoring<F>),
    Lmeds(LmedsScoring<F>),
}

impl<F> ScoringChoice<F> {
    pub fn for_method(method: RobustMethod, threshold: f64, sample_size: usize, residual_fn: F) -> Self {
        match method {
            RobustMethod::Ransac => ScoringChoice::Ransac(RansacScoring::new(threshold, residual_fn)),
            RobustMethod::Msac | RobustMethod::Prosac => {
                ScoringChoice::Msac(MsacScoring::new(threshold, residual_fn))
            }
            RobustMethod::Lmeds | RobustMethod::Promeds => {
                ScoringChoice::Lmeds(LmedsScoring::new(threshold, sample_size, residual_fn))
            }
        }
    }
}

impl<D, M, F> Scoring<D, M> for ScoringChoice<F>
where
    F: Fn(&D, &M) -> f64,
{
    type Score = Score;

    fn threshold(&self) -> f64 {
        match self {
            ScoringChoice::Ransac(s) => Scoring::<D, M>::threshold(s),
            ScoringChoice::Msac(s) => Scoring::<D, M>::threshold(s),
            ScoringChoice::Lmeds(s) => Scoring::<D, M>::threshold(s),
        }
    }

    fn score(&self, data: &[D], model: &M, inliers_out: &mut Vec<usize>) -> Score {
        match self {
            ScoringChoice::Ransac(s) => s.score(data, model, inliers_out),
            ScoringChoice::Msac(s) => s.score(data, model, inliers_out),
            ScoringChoice::Lmeds(s) => s.score(data, model, inliers_out),
        }
    }
}

/// Runtime termination selection (Score-specific).
pub enum TerminationChoice {
    Ransac(RansacTerminationCriterion),
    Median(MedianTerminationCriterion),
    Dyn(Box<dyn TerminationCriterion<Score> + Send + Sync>),
}

impl TerminationChoice {
    /// Termination used with the configured method: median-based methods
    /// also stop once the median residual reaches the stop threshold.
    pub fn for_settings(settings: &CalibratorSettings) -> Self {
        if settings.method.is_median_based() {
            TerminationChoice::Median(MedianTerminationCriterion {
                confidence: settings.confidence,
                stop_threshold: settings.stop_threshold,
            })
        } else {
            TerminationChoice::Ransac(RansacTerminationCriterion {
                confidence: settings.confidence,
            })
        }
    }
}

impl TerminationCriterion<Score> for TerminationChoice {
    fn check(
        &mut self,
        point_count: usize,
        best_score: &Score,
        sample_size: usize,
        max_iterations: &mut usize,
    ) -> bool {
        match self {
            TerminationChoice::Ransac(term) => {
                term.check(point_count, best_score, sample_size, max_iterations)
            }
            TerminationChoice::Median(term) => {
                term.check(point_count, best_score, sample_size, max_iterations)
            }
            TerminationChoice::Dyn(term) => {
                term.check(point_count, best_score, sample_size, max_iterations)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(d: &f64, _m: &()) -> f64 {
        *d
    }

    #[test]
    fn methods_map_to_components() {
        assert!(matches!(
            SamplerChoice::for_method(RobustMethod::Msac, None, Some(1)),
            Ok(SamplerChoice::Uniform(_))
        ));
        assert!(matches!(
            SamplerChoice::for_method(RobustMethod::Promeds, Some(&[1.0, 2.0]), Some(1)),
            Ok(SamplerChoice::Prosac(_))
        ));
        assert!(matches!(
            SamplerChoice::for_method(RobustMethod::Prosac, None, None),
            Err(CalibrationError::NotReady(_))
        ));

        assert!(matches!(
            ScoringChoice::for_method(RobustMethod::Prosac, 0.5, 3, identity),
            ScoringChoice::Msac(_)
        ));
        assert!(matches!(
            ScoringChoice::for_method(RobustMethod::Lmeds, 0.5, 3, identity),
            ScoringChoice::Lmeds(_)
        ));

        let settings = CalibratorSettings {
            method: RobustMethod::Promeds,
            ..CalibratorSettings::default()
        };
        assert!(matches!(
            TerminationChoice::for_settings(&settings),
            TerminationChoice::Median(_)
        ));
    }

    #[test]
    fn scoring_choice_delegates() {
        let scoring = ScoringChoice::for_method(RobustMethod::Ransac, 0.5, 1, identity);
        let mut inliers = Vec::new();
        let score = scoring.score(&[0.1, 0.7, 0.2], &(), &mut inliers);
        assert_eq!(score.inlier_count, 2);
        assert_eq!(Scoring::<f64, ()>::threshold(&scoring), 0.5);
    }

    struct StopAtOnce;

    impl TerminationCriterion<Score> for StopAtOnce {
        fn check(&mut self, _: usize, _: &Score, _: usize, _: &mut usize) -> bool {
            true
        }
    }

    #[test]
    fn dyn_termination_is_forwarded() {
        let mut term = TerminationChoice::Dyn(Box::new(StopAtOnce));
        let mut max_iterations = 10;
        assert!(term.check(5, &Score::new(5, 5.0), 1, &mut max_iterations));
    }
}
