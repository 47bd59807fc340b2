//! Example: Robust magnetometer calibration with MSAC
//!
//! This example calibrates a synthetic magnetometer with a hard-iron bias and
//! a common-axis soft-iron matrix from noisy readings contaminated with
//! outliers.

use magcal::{CalibratorListener, MagnetometerCalibrator, Measurement, RobustMethod};
use nalgebra::{Matrix3, Vector3};
use rand::Rng;

struct ProgressPrinter;

impl CalibratorListener for ProgressPrinter {
    fn on_calibrate_start(&mut self, calibrator: &mut MagnetometerCalibrator) {
        println!(
            "Calibration started ({:?}, {} measurements)",
            calibrator.method(),
            calibrator.measurements().map_or(0, |m| m.len())
        );
    }

    fn on_calibrate_progress_change(&mut self, _calibrator: &mut MagnetometerCalibrator, progress: f32) {
        println!("  progress: {:.0}%", 100.0 * progress);
    }

    fn on_calibrate_end(&mut self, _calibrator: &mut MagnetometerCalibrator) {
        println!("Calibration finished\n");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Robust Magnetometer Calibration Example ===\n");

    // Earth's field is roughly 50 uT at mid latitudes.
    let field_norm = 5e-5;
    let noise_std = 5e-8;
    let n_inliers = 180;
    let n_outliers = 20;

    let true_hard_iron = Vector3::new(2e-6, -1.5e-6, 3e-6);
    let true_soft_iron = Matrix3::new(0.03, -0.01, 0.02, 0.0, -0.02, 0.005, 0.0, 0.0, 0.01);
    let truth = magcal::CalibrationParameters::new(true_hard_iron, true_soft_iron);

    println!("True hard iron (T): {}", true_hard_iron.transpose());
    println!("True soft iron:{}", true_soft_iron);
    println!(
        "Generating {} inliers and {} outliers\n",
        n_inliers, n_outliers
    );

    let mut rng = rand::thread_rng();
    let mut measurements = Vec::with_capacity(n_inliers + n_outliers);
    for i in 0..n_inliers + n_outliers {
        // Random orientation on the unit sphere.
        let z: f64 = rng.gen_range(-1.0..1.0);
        let theta: f64 = rng.gen_range(0.0..std::f64::consts::TAU);
        let r = (1.0 - z * z).sqrt();
        let field = Vector3::new(r * theta.cos(), r * theta.sin(), z) * field_norm;

        let mut reading = truth.distort(&field);
        reading += Vector3::from_fn(|_, _| rng.gen_range(-noise_std..noise_std));
        if i >= n_inliers {
            reading += Vector3::from_fn(|_, _| rng.gen_range(-1e-5..1e-5));
        }
        measurements.push(Measurement::with_std_dev(reading, noise_std)?);
    }

    let mut calibrator = MagnetometerCalibrator::builder()
        .measurements(measurements)
        .ground_truth_field_norm(field_norm)
        .common_axis(true)
        .estimate_hard_iron(true)
        .method(RobustMethod::Msac)
        .listener(ProgressPrinter)
        .build()?;
    calibrator.set_threshold(3.0 * noise_std)?;
    calibrator.set_progress_delta(0.25)?;

    calibrator.calibrate()?;

    let inliers = calibrator.inliers_data().map_or(0, |d| d.num_inliers);
    println!("MSAC Results:");
    println!("  Found {} inliers out of {} readings", inliers, n_inliers + n_outliers);
    println!("  Iterations: {}", calibrator.iterations().unwrap_or_default());
    println!("  MSE: {:e}", calibrator.estimated_mse().unwrap_or_default());
    println!("  Chi squared: {:.2}", calibrator.estimated_chi_sq().unwrap_or_default());

    if let (Some(hard_iron), Some(soft_iron)) =
        (calibrator.estimated_hard_iron(), calibrator.estimated_soft_iron())
    {
        println!("\nEstimated hard iron (T): {}", hard_iron.transpose());
        println!("Estimated soft iron:{}", soft_iron);
        println!("  Hard iron error: {:e} T", (hard_iron - true_hard_iron).amax());
        println!("  Soft iron error: {:e}", (soft_iron - true_soft_iron).amax());
    }

    if let Some(cov) = calibrator.estimated_covariance() {
        let std_devs: Vec<String> = (0..cov.nrows())
            .map(|i| format!("{:.2e}", cov[(i, i)].max(0.0).sqrt()))
            .collect();
        println!("\nParameter standard deviations: [{}]", std_devs.join(", "));
    }

    Ok(())
}
