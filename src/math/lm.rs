use nalgebra::{DMatrix, DVector};

/// Tuning knobs for the Levenberg-Marquardt loop.
#[derive(Debug, Clone)]
pub struct LmOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the relative step norm.
    pub step_tolerance: f64,
    pub initial_lambda: f64,
    pub lambda_factor: f64,
    /// Relative forward-difference step for the Jacobian.
    pub fd_step: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            step_tolerance: 1e-6,
            initial_lambda: 1e-3,
            lambda_factor: 10.0,
            fd_step: 1e-6,
        }
    }
}

/// Result of a minimisation run. `improved` reports whether the final cost
/// is below the initial one; callers treat a non-improving run as a solver
/// failure for the crystal being refined.
#[derive(Debug, Clone)]
pub struct LmOutcome {
    pub x: DVector<f64>,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub converged: bool,
    pub improved: bool,
}

/// Minimises |f(x)|^2 by Levenberg-Marquardt with a forward-difference
/// Jacobian. `f` returns the (already weighted) residual vector.
///
/// The damping multiplies the diagonal of the normal matrix (Marquardt
/// scaling), which keeps the step well behaved when the parameters span
/// different magnitudes. Callers should still normalise their parameters
/// to order one where they can.
pub fn minimise<F>(f: F, x0: DVector<f64>, opts: &LmOptions) -> LmOutcome
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n_params = x0.len();
    let mut x = x0;
    let mut residuals = f(&x);
    let initial_cost = residuals.norm_squared();
    let mut cost = initial_cost;
    let mut lambda = opts.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    for _ in 0..opts.max_iterations {
        iterations += 1;

        let jacobian = forward_jacobian(&f, &x, &residuals, opts.fd_step);
        let jt = jacobian.transpose();
        let normal = &jt * &jacobian;
        let gradient = &jt * &residuals;

        // Inner loop: raise the damping until a step reduces the cost.
        let mut stepped = false;
        while lambda < 1e12 {
            let mut damped = normal.clone();
            for i in 0..n_params {
                damped[(i, i)] = normal[(i, i)] * (1.0 + lambda) + 1e-30;
            }

            let step = match damped.lu().solve(&(-&gradient)) {
                Some(s) => s,
                None => {
                    lambda *= opts.lambda_factor;
                    continue;
                }
            };

            let trial = &x + &step;
            let trial_residuals = f(&trial);
            let trial_cost = trial_residuals.norm_squared();

            if trial_cost < cost {
                let step_norm = step.norm();
                let x_norm = x.norm();
                x = trial;
                residuals = trial_residuals;
                cost = trial_cost;
                lambda = (lambda / opts.lambda_factor).max(1e-12);
                stepped = true;
                if step_norm <= opts.step_tolerance * (x_norm + opts.step_tolerance) {
                    converged = true;
                }
                break;
            }
            lambda *= opts.lambda_factor;
        }

        if !stepped || converged {
            break;
        }
    }

    LmOutcome {
        x,
        initial_cost,
        final_cost: cost,
        iterations,
        converged,
        improved: cost < initial_cost,
    }
}

fn forward_jacobian<F>(
    f: &F,
    x: &DVector<f64>,
    residuals: &DVector<f64>,
    fd_step: f64,
) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let n_res = residuals.len();
    let n_params = x.len();
    let mut jacobian = DMatrix::zeros(n_res, n_params);

    for j in 0..n_params {
        let h = fd_step * x[j].abs().max(1.0);
        let mut nudged = x.clone();
        nudged[j] += h;
        let shifted = f(&nudged);
        for i in 0..n_res {
            jacobian[(i, j)] = (shifted[i] - residuals[i]) / h;
        }
    }
    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{dvector, DVector};

    #[test]
    fn converges_on_quadratic_bowl() {
        // Residuals (x-3, y+1): unique minimum at (3, -1).
        let f = |x: &DVector<f64>| dvector![x[0] - 3.0, x[1] + 1.0];
        let out = minimise(f, dvector![0.0, 0.0], &LmOptions::default());
        assert!(out.converged);
        assert!(out.improved);
        assert_relative_eq!(out.x[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(out.x[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn converges_on_rosenbrock_style_residuals() {
        let f = |x: &DVector<f64>| dvector![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]];
        let out = minimise(
            f,
            dvector![-1.2, 1.0],
            &LmOptions {
                max_iterations: 200,
                ..LmOptions::default()
            },
        );
        assert!(out.final_cost < 1e-8);
        assert_relative_eq!(out.x[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(out.x[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn reports_no_improvement_at_a_minimum() {
        // Already at the optimum: no step can reduce the cost.
        let f = |x: &DVector<f64>| dvector![x[0]];
        let out = minimise(f, dvector![0.0], &LmOptions::default());
        assert!(!out.improved);
        assert_relative_eq!(out.final_cost, 0.0);
    }
}
