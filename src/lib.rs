//! # magcal - Robust Magnetometer Calibration
//!
//! `magcal` estimates the hard-iron bias and soft-iron matrix of a
//! magnetometer from readings taken at a site where the norm of the ambient
//! field is known. A robust sample-consensus search (RANSAC, MSAC, LMedS,
//! PROSAC or PROMedS) discards outliers and the consensus model is refined by
//! weighted least squares, with parameter covariance.
//!
//! ## Quick Start
//!
//! ```rust
//! use magcal::{CalibrationParameters, MagnetometerCalibrator, Measurement};
//! use nalgebra::{Matrix3, Vector3};
//!
//! let norm = 5e-5;
//! let truth = CalibrationParameters::new(
//!     Vector3::zeros(),
//!     Matrix3::new(0.02, 0.01, 0.0, 0.0, -0.01, 0.005, 0.0, 0.0, 0.015),
//! );
//!
//! // Readings of a field of known norm taken in many orientations.
//! let measurements: Vec<Measurement> = (0..30)
//!     .map(|i| {
//!         let z = 1.0 - 2.0 * (i as f64 + 0.5) / 30.0;
//!         let r = (1.0 - z * z).sqrt();
//!         let theta = 2.4 * i as f64;
//!         let field = Vector3::new(r * theta.cos(), r * theta.sin(), z) * norm;
//!         Measurement::new(truth.distort(&field))
//!     })
//!     .collect();
//!
//! let mut calibrator = MagnetometerCalibrator::builder()
//!     .measurements(measurements)
//!     .ground_truth_field_norm(norm)
//!     .common_axis(true)
//!     .build()
//!     .unwrap();
//! calibrator.calibrate().unwrap();
//!
//! let soft_iron = calibrator.estimated_soft_iron().unwrap();
//! assert!((soft_iron - truth.soft_iron).amax() < 1e-9);
//! ```
//!
//! ## Extending the Library
//!
//! The consensus loop in [`core`] is generic. Custom models, samplers,
//! scorings and stopping rules plug in through:
//!
//! - **[`Estimator`](core::Estimator)**: candidate models from subsets
//! - **[`Sampler`](core::Sampler)**: subset drawing
//! - **[`Scoring<D, M>`](core::Scoring)**: model ranking and inlier selection
//! - **[`TerminationCriterion<S>`](core::TerminationCriterion)**: adaptive stopping
//! - **[`ConsensusObserver`](core::ConsensusObserver)**: iteration and progress notifications
//!
//! ### Example: Custom Sampler
//!
//! ```rust
//! use magcal::core::Sampler;
//!
//! /// Always draws the first `sample_size` points.
//! struct FirstPoints;
//!
//! impl Sampler for FirstPoints {
//!     fn sample(&mut self, point_count: usize, sample_size: usize, out: &mut [usize]) -> bool {
//!         if sample_size > point_count {
//!             return false;
//!         }
//!         for (i, slot) in out.iter_mut().take(sample_size).enumerate() {
//!             *slot = i;
//!         }
//!         true
//!     }
//!
//!     fn update(&mut self, _sample: &[usize], _sample_size: usize, _iteration: usize, _score_hint: f64) {}
//! }
//! ```
//!
//! ## Modules
//!
//! - **[`api`]**: one-call calibration from a matrix of readings
//! - **[`calibrator`]**: the configurable calibrator and its listener
//! - **[`core`]**: core traits and the generic consensus loop
//! - **[`estimator`]**: minimal-subset solver
//! - **[`scoring`]**: norm residual and RANSAC/MSAC/LMedS scorings
//! - **[`samplers`]**: uniform and PROSAC sampling
//! - **[`refine`]**: weighted refinement with covariance
//! - **[`optim`]**: Levenberg-Marquardt solver
//! - **[`model`]**: calibration parameters and parameter layouts
//! - **[`settings`]**: configuration types

pub mod api;
pub mod calibrator;
pub mod choices;
pub mod core;
pub mod error;
pub mod estimator;
pub mod measurement;
pub mod model;
pub mod optim;
pub mod refine;
pub mod samplers;
pub mod scoring;
pub mod settings;
pub mod utils;

// Re-export high-level API
pub use api::{calibrate_magnetometer, CalibrationOutcome};
pub use calibrator::{
    CalibratorBuilder, CalibratorListener, CalibratorState, InliersData, MagnetometerCalibrator,
};
pub use error::{CalibrationError, SolverError};
pub use measurement::Measurement;
pub use model::{CalibrationParameters, ParameterLayout};

// Re-export core traits for easy access
pub use crate::core::{ConsensusObserver, Estimator, Sampler, Scoring, TerminationCriterion};

// Re-export settings for convenience
pub use settings::{CalibratorSettings, RobustMethod};
