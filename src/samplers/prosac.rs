//! PROSAC sampler: progressively grows the subset of high-quality points.
//!
//! Points are ranked by descending quality score. Early samples are drawn
//! from the best few points only; the candidate pool grows according to the
//! PROSAC growth function until, after `ransac_convergence_iterations`
//! samples, sampling degenerates to uniform RANSAC sampling.

use ordered_float::OrderedFloat;

use crate::core::Sampler;
use crate::utils::UniformRandomGenerator;

/// PROSAC sampler over a quality ranking.
pub struct ProsacSampler {
    rng: UniformRandomGenerator<usize>,
    /// Point indices sorted by descending quality.
    ranking: Vec<usize>,
    growth_function: Vec<usize>,
    sample_size: Option<usize>,
    point_number: usize,
    ransac_convergence_iterations: usize,
    kth_sample_number: usize,
    subset_size: usize,
}

impl ProsacSampler {
    /// Construct from per-point quality scores (higher is better).
    pub fn from_quality_scores(quality_scores: &[f64], seed: Option<u64>) -> Self {
        Self::with_ranking(rank_by_quality(quality_scores), seed)
    }

    /// Construct from an explicit ranking (best point first).
    pub fn with_ranking(ranking: Vec<usize>, seed: Option<u64>) -> Self {
        Self {
            rng: UniformRandomGenerator::from_optional_seed(seed),
            ranking,
            growth_function: Vec::new(),
            sample_size: None,
            point_number: 0,
            ransac_convergence_iterations: 100_000,
            kth_sample_number: 1,
            subset_size: 0,
        }
    }

    /// Number of samples after which PROSAC falls back to uniform sampling.
    pub fn with_ransac_convergence_iterations(mut self, iterations: usize) -> Self {
        self.ransac_convergence_iterations = iterations.max(1);
        self
    }

    /// Current size of the sampling pool.
    pub fn subset_size(&self) -> usize {
        self.subset_size
    }

    fn increment_iteration_number(&mut self) {
        self.kth_sample_number += 1;

        if self.kth_sample_number > self.ransac_convergence_iterations {
            return;
        }
        if self.subset_size < self.point_number
            && self.kth_sample_number > self.growth_function[self.subset_size - 1]
        {
            self.subset_size += 1;
        }
    }

    fn initialize(&mut self, point_number: usize, sample_size: usize) {
        self.point_number = point_number;
        self.sample_size = Some(sample_size);
        self.kth_sample_number = 1;
        self.growth_function.clear();
        self.growth_function.resize(point_number, 0);

        let mut t_n = self.ransac_convergence_iterations as f64;
        for i in 0..sample_size {
            t_n *= (sample_size - i) as f64 / (point_number - i) as f64;
        }

        let mut t_n_prime: usize = 1;
        for i in 0..point_number {
            if i < sample_size {
                self.growth_function[i] = t_n_prime;
                continue;
            }
            let t_n_plus1 = (i + 1) as f64 * t_n / (i + 1 - sample_size) as f64;
            self.growth_function[i] = t_n_prime + ((t_n_plus1 - t_n).ceil() as usize);
            t_n = t_n_plus1;
            t_n_prime = self.growth_function[i];
        }

        self.subset_size = sample_size;
    }

    fn subset_size_or_all(&self) -> usize {
        if self.kth_sample_number > self.ransac_convergence_iterations {
            self.point_number
        } else {
            self.subset_size
        }
    }
}

impl Sampler for ProsacSampler {
    fn sample(&mut self, point_count: usize, sample_size: usize, out_indices: &mut [usize]) -> bool {
        if sample_size == 0
            || point_count == 0
            || sample_size > point_count
            || out_indices.len() < sample_size
            || self.ranking.len() != point_count
        {
            return false;
        }

        if self.sample_size != Some(sample_size) || self.point_number != point_count {
            self.initialize(point_count, sample_size);
        }

        let out = &mut out_indices[..sample_size];
        if self.kth_sample_number > self.ransac_convergence_iterations
            || self.subset_size == sample_size
        {
            self.rng.gen_unique(out, 0, self.subset_size_or_all() - 1);
        } else {
            // sample_size - 1 points from the pool, plus the newest pool member.
            let (head, last) = out.split_at_mut(sample_size - 1);
            self.rng.gen_unique(head, 0, self.subset_size - 2);
            last[0] = self.subset_size - 1;
        }

        for idx in out.iter_mut() {
            *idx = self.ranking[*idx];
        }

        self.increment_iteration_number();
        true
    }

    fn update(
        &mut self,
        _sample: &[usize],
        _sample_size: usize,
        _iteration: usize,
        _score_hint: f64,
    ) {
        // Pool growth is driven by the number of drawn samples.
    }
}

/// Indices sorted by descending quality; ties keep their original order.
pub fn rank_by_quality(quality_scores: &[f64]) -> Vec<usize> {
    let mut ranking: Vec<usize> = (0..quality_scores.len()).collect();
    ranking.sort_by_key(|&i| std::cmp::Reverse(OrderedFloat(quality_scores[i])));
    ranking
}
