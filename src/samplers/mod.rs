//! Sampling strategies for drawing minimal measurement subsets.
//!
//! Both samplers implement the shared [`Sampler`](crate::core::Sampler)
//! trait:
//! - [`UniformRandomSampler`]: subsets drawn uniformly without replacement.
//! - [`ProsacSampler`]: subsets drawn from a progressively growing pool of
//!   the highest-quality measurements.

pub mod prosac;
pub mod uniform;

pub use prosac::{rank_by_quality, ProsacSampler};
pub use uniform::UniformRandomSampler;
