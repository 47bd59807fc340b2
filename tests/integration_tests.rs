//! Integration tests for the calibrator and the one-call API.
//!
//! Synthetic readings are generated from a random ground-truth calibration,
//! corrupted with outliers and noise, and the estimates are compared against
//! the truth over a few Monte Carlo trials.

use approx::assert_relative_eq;
use magcal::*;
use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

const NORM: f64 = 5e-5;
const TRIALS: usize = 5;
const N_MEASUREMENTS: usize = 100;
const OUTLIER_PERCENTAGE: f64 = 0.04;
const OUTLIER_ERROR: f64 = 1e-5;
const NOISE_STD: f64 = 1e-7;
const NOISY_THRESHOLD: f64 = 5e-7;

struct Dataset {
    truth: CalibrationParameters,
    measurements: Vec<Measurement>,
    quality_scores: Vec<f64>,
}

fn random_direction(rng: &mut StdRng) -> Vector3<f64> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    loop {
        let v = Vector3::new(normal.sample(rng), normal.sample(rng), normal.sample(rng));
        let n = v.norm();
        if n > 1e-3 {
            return v / n;
        }
    }
}

fn random_truth(rng: &mut StdRng, common_axis: bool) -> CalibrationParameters {
    let scale = Uniform::new(-0.05, 0.05);
    let bias = Uniform::new(-5e-6, 5e-6);
    let (sx, sy, sz) = (scale.sample(rng), scale.sample(rng), scale.sample(rng));
    let (mxy, mxz, myz) = (scale.sample(rng), scale.sample(rng), scale.sample(rng));
    // A symmetric matrix is the rotation-free representative of the general
    // model; the common-axis model is upper triangular.
    let soft_iron = if common_axis {
        Matrix3::new(sx, mxy, mxz, 0.0, sy, myz, 0.0, 0.0, sz)
    } else {
        Matrix3::new(sx, mxy, mxz, mxy, sy, myz, mxz, myz, sz)
    };
    CalibrationParameters::new(
        Vector3::new(bias.sample(rng), bias.sample(rng), bias.sample(rng)),
        soft_iron,
    )
}

/// General soft iron with all nine entries independent.
fn random_non_symmetric_truth(rng: &mut StdRng) -> CalibrationParameters {
    let scale = Uniform::new(-0.05, 0.05);
    let bias = Uniform::new(-5e-6, 5e-6);
    CalibrationParameters::new(
        Vector3::new(bias.sample(rng), bias.sample(rng), bias.sample(rng)),
        Matrix3::from_fn(|_, _| scale.sample(rng)),
    )
}

fn dataset(rng: &mut StdRng, common_axis: bool, noise_std: Option<f64>) -> Dataset {
    let truth = random_truth(rng, common_axis);
    corrupted_readings(rng, truth, noise_std)
}

fn corrupted_readings(rng: &mut StdRng, truth: CalibrationParameters, noise_std: Option<f64>) -> Dataset {
    let outlier = Uniform::new(-OUTLIER_ERROR, OUTLIER_ERROR);
    let mut measurements = Vec::with_capacity(N_MEASUREMENTS);
    let mut quality_scores = Vec::with_capacity(N_MEASUREMENTS);

    for _ in 0..N_MEASUREMENTS {
        let mut reading = truth.distort(&(random_direction(rng) * NORM));
        if let Some(std) = noise_std {
            let noise = Normal::new(0.0, std).unwrap();
            reading += Vector3::new(noise.sample(rng), noise.sample(rng), noise.sample(rng));
        }
        let is_outlier = rng.gen::<f64>() < OUTLIER_PERCENTAGE;
        if is_outlier {
            reading += Vector3::new(outlier.sample(rng), outlier.sample(rng), outlier.sample(rng));
        }
        quality_scores.push(if is_outlier {
            rng.gen_range(0.0..0.5)
        } else {
            1.0 + rng.gen_range(0.0..0.5)
        });
        measurements.push(match noise_std {
            Some(std) => Measurement::with_std_dev(reading, std).unwrap(),
            None => Measurement::new(reading),
        });
    }

    Dataset {
        truth,
        measurements,
        quality_scores,
    }
}

fn calibrator_for(
    data: &Dataset,
    method: RobustMethod,
    common_axis: bool,
    estimate_hard_iron: bool,
    threshold: f64,
    seed: u64,
) -> MagnetometerCalibrator {
    let settings = CalibratorSettings {
        method,
        threshold,
        seed: Some(seed),
        ..CalibratorSettings::default()
    };
    let mut builder = MagnetometerCalibrator::builder()
        .measurements(data.measurements.clone())
        .ground_truth_field_norm(NORM)
        .common_axis(common_axis)
        .estimate_hard_iron(estimate_hard_iron)
        .settings(settings);
    if !estimate_hard_iron {
        builder = builder.hard_iron(data.truth.hard_iron);
    }
    if method.requires_quality_scores() {
        builder = builder.quality_scores(data.quality_scores.clone());
    }
    builder.build().unwrap()
}

fn matches_truth(calibrator: &MagnetometerCalibrator, truth: &CalibrationParameters, tolerance: f64) -> bool {
    let (Some(soft_iron), Some(hard_iron)) =
        (calibrator.estimated_soft_iron(), calibrator.estimated_hard_iron())
    else {
        return false;
    };
    (soft_iron - truth.soft_iron).amax() < tolerance
        && (hard_iron - truth.hard_iron).amax() < tolerance * NORM
}

/// Run `TRIALS` calibrations with outliers and exact inliers; returns the
/// number of trials that recovered the truth.
fn exact_trials(method: RobustMethod, common_axis: bool, estimate_hard_iron: bool, seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut valid = 0;
    for trial in 0..TRIALS {
        let data = dataset(&mut rng, common_axis, None);
        let mut calibrator = calibrator_for(
            &data,
            method,
            common_axis,
            estimate_hard_iron,
            settings::DEFAULT_THRESHOLD,
            seed + trial as u64,
        );
        if calibrator.calibrate().is_err() {
            continue;
        }
        assert_eq!(calibrator.state(), CalibratorState::Converged);
        if !matches_truth(&calibrator, &data.truth, 1e-9) {
            continue;
        }

        let layout = ParameterLayout::new(common_axis, estimate_hard_iron);
        if let Some(cov) = calibrator.estimated_covariance() {
            assert_eq!(cov.shape(), (layout.full_len(), layout.full_len()));
        }
        let inliers = calibrator.inliers_data().unwrap();
        assert_eq!(inliers.inliers.len(), N_MEASUREMENTS);
        assert!(inliers.num_inliers >= N_MEASUREMENTS / 2);
        valid += 1;
    }
    valid
}

/// Same as [`exact_trials`] with Gaussian noise on every reading.
fn noisy_trials(method: RobustMethod, common_axis: bool, estimate_hard_iron: bool, seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut valid = 0;
    for trial in 0..TRIALS {
        let data = dataset(&mut rng, common_axis, Some(NOISE_STD));
        let mut calibrator = calibrator_for(
            &data,
            method,
            common_axis,
            estimate_hard_iron,
            NOISY_THRESHOLD,
            seed + trial as u64,
        );
        if calibrator.calibrate().is_err() {
            continue;
        }
        if !matches_truth(&calibrator, &data.truth, 1e-2) {
            continue;
        }
        assert!(calibrator.estimated_mse().unwrap() > 0.0);
        assert!(calibrator.estimated_chi_sq().unwrap() > 0.0);
        valid += 1;
    }
    valid
}

/// Trials on a non-symmetric general soft iron, handing the truth to the
/// calibrator as the initial guess so the rotation gauge resolves to it.
fn non_symmetric_trials(
    method: RobustMethod,
    estimate_hard_iron: bool,
    noise_std: Option<f64>,
    seed: u64,
) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let (threshold, tolerance) = match noise_std {
        Some(_) => (NOISY_THRESHOLD, 1e-2),
        None => (settings::DEFAULT_THRESHOLD, 1e-9),
    };
    let mut valid = 0;
    for trial in 0..TRIALS {
        let truth = random_non_symmetric_truth(&mut rng);
        assert!((truth.soft_iron - truth.soft_iron.transpose()).amax() > 0.0);
        let data = corrupted_readings(&mut rng, truth, noise_std);
        let settings = CalibratorSettings {
            method,
            threshold,
            seed: Some(seed + trial as u64),
            ..CalibratorSettings::default()
        };
        let mut builder = MagnetometerCalibrator::builder()
            .measurements(data.measurements.clone())
            .ground_truth_field_norm(NORM)
            .estimate_hard_iron(estimate_hard_iron)
            .initial_soft_iron(data.truth.soft_iron)
            .settings(settings);
        if !estimate_hard_iron {
            builder = builder.hard_iron(data.truth.hard_iron);
        }
        if method.requires_quality_scores() {
            builder = builder.quality_scores(data.quality_scores.clone());
        }
        let mut calibrator = builder.build().unwrap();

        if calibrator.calibrate().is_err() {
            continue;
        }
        if !matches_truth(&calibrator, &data.truth, tolerance) {
            continue;
        }
        if noise_std.is_some() {
            assert!(calibrator.estimated_mse().unwrap() > 0.0);
        } else {
            assert!(calibrator.inliers_data().unwrap().num_inliers >= N_MEASUREMENTS / 2);
        }
        valid += 1;
    }
    valid
}

#[test]
fn test_msac_non_symmetric_general_with_initial_guess() {
    assert!(non_symmetric_trials(RobustMethod::Msac, false, None, 130) > 0);
    assert!(non_symmetric_trials(RobustMethod::Msac, true, None, 131) > 0);
}

#[test]
fn test_lmeds_non_symmetric_general_with_initial_guess() {
    assert!(non_symmetric_trials(RobustMethod::Lmeds, true, None, 140) > 0);
}

#[test]
fn test_noisy_non_symmetric_general_with_initial_guess() {
    assert!(non_symmetric_trials(RobustMethod::Msac, false, Some(NOISE_STD), 150) > 0);
    assert!(non_symmetric_trials(RobustMethod::Prosac, true, Some(NOISE_STD), 151) > 0);
}

#[test]
fn test_msac_known_hard_iron_general() {
    assert!(exact_trials(RobustMethod::Msac, false, false, 10) > 0);
}

#[test]
fn test_msac_known_hard_iron_common_axis() {
    assert!(exact_trials(RobustMethod::Msac, true, false, 20) > 0);
}

#[test]
fn test_msac_estimated_hard_iron_general() {
    assert!(exact_trials(RobustMethod::Msac, false, true, 30) > 0);
}

#[test]
fn test_msac_estimated_hard_iron_common_axis() {
    assert!(exact_trials(RobustMethod::Msac, true, true, 40) > 0);
}

#[test]
fn test_ransac_with_outliers() {
    assert!(exact_trials(RobustMethod::Ransac, false, false, 50) > 0);
    assert!(exact_trials(RobustMethod::Ransac, true, true, 51) > 0);
}

#[test]
fn test_lmeds_with_outliers() {
    assert!(exact_trials(RobustMethod::Lmeds, false, false, 60) > 0);
    assert!(exact_trials(RobustMethod::Lmeds, true, true, 61) > 0);
}

#[test]
fn test_prosac_with_quality_scores() {
    assert!(exact_trials(RobustMethod::Prosac, false, false, 70) > 0);
    assert!(exact_trials(RobustMethod::Prosac, true, true, 71) > 0);
}

#[test]
fn test_promeds_with_quality_scores() {
    assert!(exact_trials(RobustMethod::Promeds, false, false, 80) > 0);
    assert!(exact_trials(RobustMethod::Promeds, true, true, 81) > 0);
}

#[test]
fn test_noisy_inliers_msac() {
    assert!(noisy_trials(RobustMethod::Msac, false, false, 90) > 0);
    assert!(noisy_trials(RobustMethod::Msac, true, true, 91) > 0);
}

#[test]
fn test_noisy_inliers_prosac() {
    assert!(noisy_trials(RobustMethod::Prosac, true, false, 100) > 0);
}

#[test]
fn test_quality_ordered_method_requires_scores() {
    let mut rng = StdRng::seed_from_u64(110);
    let data = dataset(&mut rng, true, None);
    let mut calibrator = MagnetometerCalibrator::builder()
        .measurements(data.measurements)
        .ground_truth_field_norm(NORM)
        .method(RobustMethod::Promeds)
        .build()
        .unwrap();

    assert!(!calibrator.is_ready());
    assert!(matches!(calibrator.calibrate(), Err(CalibrationError::NotReady(_))));
    assert_eq!(calibrator.state(), CalibratorState::Idle);
}

#[test]
fn test_calibrate_magnetometer_api() {
    let mut rng = StdRng::seed_from_u64(120);
    let mut valid = 0;
    for trial in 0..TRIALS {
        let data = dataset(&mut rng, false, None);
        let mut readings = DMatrix::<f64>::zeros(N_MEASUREMENTS, 3);
        for (i, m) in data.measurements.iter().enumerate() {
            readings.row_mut(i).copy_from(&m.flux().transpose());
        }
        let settings = CalibratorSettings {
            seed: Some(trial as u64),
            ..CalibratorSettings::default()
        };

        let Ok(outcome) = calibrate_magnetometer(&readings, NORM, None, false, Some(settings)) else {
            continue;
        };
        if (outcome.soft_iron - data.truth.soft_iron).amax() > 1e-9 {
            continue;
        }
        assert_relative_eq!(outcome.hard_iron, data.truth.hard_iron, epsilon = 1e-9 * NORM);
        assert!(outcome.inliers.len() >= N_MEASUREMENTS / 2);
        assert!(outcome.inliers.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(outcome.covariance.map(|c| c.shape()), Some((12, 12)));
        assert!(outcome.iterations >= 1);
        valid += 1;
    }
    assert!(valid > 0);
}
