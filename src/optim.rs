//! Damped least-squares (Levenberg-Marquardt) solver.
//!
//! Problems are expressed through `argmin`'s operator traits: [`Operator`]
//! maps parameters to the (already weighted) residual vector and
//! [`Jacobian`] returns its derivative. The solver minimizes the sum of
//! squared residuals.

use argmin::core::{Jacobian, Operator};
use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::error::SolverError;

/// Outcome of a successful minimization.
#[derive(Debug, Clone)]
pub struct LmReport {
    pub params: DVector<f64>,
    /// Sum of squared residuals at `params`.
    pub cost: f64,
    pub iterations: usize,
    /// Gauss-Newton normal matrix `JᵀJ` at `params`.
    pub normal: DMatrix<f64>,
}

/// Levenberg-Marquardt with Marquardt (diagonal) damping.
#[derive(Debug, Clone, Copy)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    /// Relative cost decrease below which the solver stops.
    pub ftol: f64,
    /// Relative step length below which the solver stops.
    pub xtol: f64,
    /// Gradient infinity norm below which the solver stops.
    pub gtol: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            initial_lambda: 1e-3,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-14,
        }
    }
}

const MAX_LAMBDA: f64 = 1e16;
const MIN_LAMBDA: f64 = 1e-15;

impl LevenbergMarquardt {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Minimize `||problem(x)||²` starting from `x0`.
    pub fn minimize<P>(&self, problem: &P, x0: DVector<f64>) -> Result<LmReport, SolverError>
    where
        P: Operator<Param = DVector<f64>, Output = DVector<f64>>
            + Jacobian<Param = DVector<f64>, Jacobian = DMatrix<f64>>,
    {
        let mut x = x0;
        let mut residuals = evaluate(problem, &x)?;
        let mut cost = residuals.norm_squared();
        let mut lambda = self.initial_lambda;
        let mut converged = cost == 0.0;
        let mut iterations = 0;

        while !converged && iterations < self.max_iterations {
            iterations += 1;

            let jac = jacobian(problem, &x)?;
            let gradient = jac.transpose() * &residuals;
            if gradient.amax() <= self.gtol {
                converged = true;
                break;
            }
            let normal = jac.transpose() * &jac;
            let damping = marquardt_diagonal(&normal);

            // Raise the damping until a step lowers the cost.
            loop {
                let mut system = normal.clone();
                for i in 0..system.nrows() {
                    system[(i, i)] += lambda * damping[i];
                }

                let step = match system.cholesky() {
                    Some(chol) => -chol.solve(&gradient),
                    None => {
                        lambda *= 10.0;
                        if lambda > MAX_LAMBDA {
                            return Err(SolverError::Degenerate);
                        }
                        continue;
                    }
                };

                let candidate = &x + &step;
                // A step into a non-finite region is rejected like a cost increase.
                let accepted = evaluate(problem, &candidate)
                    .ok()
                    .map(|r| {
                        let c = r.norm_squared();
                        (r, c)
                    })
                    .filter(|(_, c)| c.is_finite() && *c < cost);

                if let Some((candidate_residuals, candidate_cost)) = accepted {
                    let decrease = cost - candidate_cost;
                    let small_step = step.norm() <= self.xtol * (x.norm() + self.xtol);
                    x = candidate;
                    residuals = candidate_residuals;
                    cost = candidate_cost;
                    lambda = (lambda / 10.0).max(MIN_LAMBDA);
                    converged = cost == 0.0 || decrease <= self.ftol * (cost + decrease) || small_step;
                    break;
                }

                lambda *= 10.0;
                if lambda > MAX_LAMBDA {
                    // No descent direction left: x is a local minimum.
                    converged = true;
                    break;
                }
            }

            trace!(iteration = iterations, cost, lambda, "levenberg-marquardt step");
        }

        if !converged {
            return Err(SolverError::NotConverged { iterations });
        }

        let jac = jacobian(problem, &x)?;
        Ok(LmReport {
            normal: jac.transpose() * &jac,
            params: x,
            cost,
            iterations,
        })
    }
}

fn evaluate<P>(problem: &P, x: &DVector<f64>) -> Result<DVector<f64>, SolverError>
where
    P: Operator<Param = DVector<f64>, Output = DVector<f64>>,
{
    let residuals = problem.apply(x).map_err(|_| SolverError::NonFinite)?;
    if residuals.iter().all(|r| r.is_finite()) {
        Ok(residuals)
    } else {
        Err(SolverError::NonFinite)
    }
}

fn jacobian<P>(problem: &P, x: &DVector<f64>) -> Result<DMatrix<f64>, SolverError>
where
    P: Jacobian<Param = DVector<f64>, Jacobian = DMatrix<f64>>,
{
    let jac = problem.jacobian(x).map_err(|_| SolverError::NonFinite)?;
    if jac.iter().all(|v| v.is_finite()) {
        Ok(jac)
    } else {
        Err(SolverError::NonFinite)
    }
}

/// Diagonal of `normal` floored relative to its largest entry, so directions
/// the data do not constrain are still damped.
fn marquardt_diagonal(normal: &DMatrix<f64>) -> DVector<f64> {
    let diag = normal.diagonal();
    let floor = (diag.amax() * 1e-12).max(f64::MIN_POSITIVE);
    diag.map(|d| d.max(floor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Fit `y = a * exp(b * t)`.
    struct ExpFit {
        t: Vec<f64>,
        y: Vec<f64>,
    }

    impl Operator for ExpFit {
        type Param = DVector<f64>;
        type Output = DVector<f64>;

        fn apply(&self, p: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
            Ok(DVector::from_iterator(
                self.t.len(),
                self.t
                    .iter()
                    .zip(&self.y)
                    .map(|(t, y)| p[0] * (p[1] * t).exp() - y),
            ))
        }
    }

    impl Jacobian for ExpFit {
        type Param = DVector<f64>;
        type Jacobian = DMatrix<f64>;

        fn jacobian(&self, p: &Self::Param) -> Result<Self::Jacobian, argmin::core::Error> {
            let mut jac = DMatrix::zeros(self.t.len(), 2);
            for (i, t) in self.t.iter().enumerate() {
                let e = (p[1] * t).exp();
                jac[(i, 0)] = e;
                jac[(i, 1)] = p[0] * t * e;
            }
            Ok(jac)
        }
    }

    fn exp_problem() -> ExpFit {
        let t: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let y = t.iter().map(|t| 2.0 * (-1.5 * t).exp()).collect();
        ExpFit { t, y }
    }

    #[test]
    fn recovers_exponential_parameters() {
        let report = LevenbergMarquardt::default()
            .minimize(&exp_problem(), DVector::from_vec(vec![1.0, 0.0]))
            .unwrap();

        assert_relative_eq!(report.params[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(report.params[1], -1.5, epsilon = 1e-8);
        assert!(report.cost < 1e-16);
        assert_eq!(report.normal.shape(), (2, 2));
    }

    #[test]
    fn exact_start_returns_immediately() {
        let report = LevenbergMarquardt::default()
            .minimize(&exp_problem(), DVector::from_vec(vec![2.0, -1.5]))
            .unwrap();
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn iteration_cap_is_reported() {
        let err = LevenbergMarquardt::default()
            .with_max_iterations(1)
            .minimize(&exp_problem(), DVector::from_vec(vec![10.0, 3.0]))
            .unwrap_err();
        assert_eq!(err, SolverError::NotConverged { iterations: 1 });
    }
}
