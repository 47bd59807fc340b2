//! Scoring strategies for the consensus loop.
//!
//! All strategies classify a datum as inlier when its residual is at most the
//! threshold (boundary inclusive) and produce a [`Score`] that compares
//! greater for better models:
//! - [`RansacScoring`]: inlier count.
//! - [`MsacScoring`]: truncated quadratic loss `Σ min(r², τ²)`.
//! - [`LmedsScoring`]: median of squared residuals, with a data-driven
//!   inlier threshold.

use std::cmp::Ordering;

use nalgebra::Vector3;
use ordered_float::OrderedFloat;

use crate::core::Scoring;
use crate::measurement::Measurement;
use crate::model::CalibrationParameters;

/// Consistency factor turning a median absolute residual into a Gaussian sigma.
const MEDIAN_TO_SIGMA: f64 = 1.4826;

/// Inliers of a median-scored model lie within this many robust sigmas.
const LMEDS_INLIER_FACTOR: f64 = 2.5;

/// Score of a candidate model.
///
/// `value` grows with model quality: the inlier count for RANSAC, the negated
/// cost for MSAC and LMedS. Ties on `value` are broken by `inlier_count`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub inlier_count: usize,
    pub value: f64,
}

impl Score {
    pub fn new(inlier_count: usize, value: f64) -> Self {
        Self {
            inlier_count,
            value,
        }
    }

    /// Cost minimized by cost-based strategies (`-value`).
    pub fn cost(&self) -> f64 {
        -self.value
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.value.partial_cmp(&other.value)? {
            Ordering::Equal => self.inlier_count.partial_cmp(&other.inlier_count),
            ord => Some(ord),
        }
    }
}

/// Norm residual `| ||(I + M)⁻¹ (m - b)|| - B |` of one reading, in Tesla.
///
/// Infinite when `I + M` is singular.
pub fn norm_residual(flux: &Vector3<f64>, params: &CalibrationParameters, field_norm: f64) -> f64 {
    match params.correct(flux) {
        Some(corrected) => (corrected.norm() - field_norm).abs(),
        None => f64::INFINITY,
    }
}

/// Residual closure over measurements for a fixed field norm.
pub fn measurement_residual(
    field_norm: f64,
) -> impl Fn(&Measurement, &CalibrationParameters) -> f64 + Copy {
    move |m, params| norm_residual(m.flux(), params, field_norm)
}

/// RANSAC scoring: counts residuals within the threshold.
///
/// The residual function takes `(datum, model)` and returns a non-negative
/// residual.
pub struct RansacScoring<F> {
    threshold: f64,
    residual_fn: F,
}

impl<F> RansacScoring<F> {
    pub fn new(threshold: f64, residual_fn: F) -> Self {
        Self {
            threshold,
            residual_fn,
        }
    }
}

impl<D, M, F> Scoring<D, M> for RansacScoring<F>
where
    F: Fn(&D, &M) -> f64,
{
    type Score = Score;

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, data: &[D], model: &M, inliers_out: &mut Vec<usize>) -> Score {
        inliers_out.clear();
        for (i, datum) in data.iter().enumerate() {
            if (self.residual_fn)(datum, model) <= self.threshold {
                inliers_out.push(i);
            }
        }
        Score::new(inliers_out.len(), inliers_out.len() as f64)
    }
}

/// MSAC scoring: every datum contributes `min(r², τ²)` to the cost.
pub struct MsacScoring<F> {
    threshold: f64,
    residual_fn: F,
}

impl<F> MsacScoring<F> {
    pub fn new(threshold: f64, residual_fn: F) -> Self {
        Self {
            threshold,
            residual_fn,
        }
    }
}

impl<D, M, F> Scoring<D, M> for MsacScoring<F>
where
    F: Fn(&D, &M) -> f64,
{
    type Score = Score;

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, data: &[D], model: &M, inliers_out: &mut Vec<usize>) -> Score {
        let thresh_sq = self.threshold * self.threshold;
        inliers_out.clear();

        let mut cost = 0.0;
        for (i, datum) in data.iter().enumerate() {
            let r = (self.residual_fn)(datum, model);
            if r <= self.threshold {
                inliers_out.push(i);
                cost += r * r;
            } else {
                cost += thresh_sq;
            }
        }

        Score::new(inliers_out.len(), -cost)
    }
}

/// Least-median-of-squares scoring.
///
/// The cost is the median squared residual. Inliers are the data within
/// `2.5 σ̂` of the model, `σ̂ = 1.4826 (1 + 5 / (n - s)) √median`, never
/// tighter than the configured threshold.
pub struct LmedsScoring<F> {
    threshold: f64,
    sample_size: usize,
    residual_fn: F,
}

impl<F> LmedsScoring<F> {
    pub fn new(threshold: f64, sample_size: usize, residual_fn: F) -> Self {
        Self {
            threshold,
            sample_size,
            residual_fn,
        }
    }

    /// Inlier threshold implied by a median squared residual over `n` data.
    pub fn inlier_threshold(&self, median_sq: f64, n: usize) -> f64 {
        let correction = if n > self.sample_size {
            1.0 + 5.0 / (n - self.sample_size) as f64
        } else {
            1.0
        };
        let sigma = MEDIAN_TO_SIGMA * correction * median_sq.max(0.0).sqrt();
        (LMEDS_INLIER_FACTOR * sigma).max(self.threshold)
    }
}

impl<D, M, F> Scoring<D, M> for LmedsScoring<F>
where
    F: Fn(&D, &M) -> f64,
{
    type Score = Score;

    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn score(&self, data: &[D], model: &M, inliers_out: &mut Vec<usize>) -> Score {
        inliers_out.clear();
        if data.is_empty() {
            return Score::new(0, f64::NEG_INFINITY);
        }

        let residuals: Vec<f64> = data
            .iter()
            .map(|datum| (self.residual_fn)(datum, model))
            .collect();

        let mut squared: Vec<OrderedFloat<f64>> =
            residuals.iter().map(|r| OrderedFloat(r * r)).collect();
        let mid = squared.len() / 2;
        let (_, median, _) = squared.select_nth_unstable(mid);
        let median_sq = median.into_inner();

        let inlier_threshold = self.inlier_threshold(median_sq, data.len());
        for (i, r) in residuals.iter().enumerate() {
            if *r <= inlier_threshold {
                inliers_out.push(i);
            }
        }

        if !median_sq.is_finite() {
            return Score::new(inliers_out.len(), f64::NEG_INFINITY);
        }
        Score::new(inliers_out.len(), -median_sq)
    }
}
