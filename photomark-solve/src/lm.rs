//! Damped nonlinear least squares (Levenberg-Marquardt).
//!
//! Both back ends feed this loop through [`LeastSquaresSystem`]. The dense
//! path factors the damped normal equations with a Cholesky decomposition;
//! the sparse path assembles `JᵀJ` from per-row triplets and uses a sparse
//! Cholesky. A factorization failure or a non-finite trial cost rejects the
//! step and raises damping; only damping growth past any useful range is
//! fatal.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix};

use crate::SolveError;

/// Sparse Jacobian as one entry list per residual row.
pub struct SparseJacobian {
    pub rows: Vec<Vec<(usize, f64)>>,
}

/// The capability the LM core needs from a residual system.
pub trait LeastSquaresSystem {
    fn num_variables(&self) -> usize;

    fn residuals(&mut self, vars: &DVector<f64>) -> Result<DVector<f64>, SolveError>;

    fn jacobian(&mut self, vars: &DVector<f64>) -> Result<DMatrix<f64>, SolveError>;

    /// Row-wise sparse Jacobian; the default densifies.
    fn jacobian_rows(&mut self, vars: &DVector<f64>) -> Result<SparseJacobian, SolveError> {
        let dense = self.jacobian(vars)?;
        let rows = (0..dense.nrows())
            .map(|i| {
                (0..dense.ncols())
                    .filter(|j| dense[(i, *j)] != 0.0)
                    .map(|j| (j, dense[(i, j)]))
                    .collect()
            })
            .collect();
        Ok(SparseJacobian { rows })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolver {
    Dense,
    Sparse,
}

#[derive(Debug, Clone, Copy)]
pub struct LmOptions {
    pub max_iterations: usize,
    /// Convergence tolerance on cost change and step infinity-norm.
    pub tolerance: f64,
    /// Initial damping λ₀.
    pub damping: f64,
    pub verbose: bool,
    pub linear_solver: LinearSolver,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-10,
            damping: 1e-3,
            verbose: false,
            linear_solver: LinearSolver::Dense,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmReport {
    pub converged: bool,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Cost after every accepted step; non-increasing by construction.
    pub accepted_costs: Vec<f64>,
}

const DAMPING_SHRINK: f64 = 0.7;
const DAMPING_GROW: f64 = 2.0;
const DAMPING_CEILING: f64 = 1e14;
const MAX_STEP_RETRIES: usize = 24;

fn cost_of(residuals: &DVector<f64>) -> f64 {
    0.5 * residuals.norm_squared()
}

enum NormalEquations {
    Dense { jtj: DMatrix<f64>, g: DVector<f64> },
    Sparse { jtj: CooMatrix<f64>, diag: DVector<f64>, g: DVector<f64> },
}

impl NormalEquations {
    fn dense(j: &DMatrix<f64>, r: &DVector<f64>) -> Self {
        NormalEquations::Dense {
            jtj: j.transpose() * j,
            g: j.transpose() * r,
        }
    }

    fn sparse(j: &SparseJacobian, r: &DVector<f64>, n: usize) -> Self {
        let mut jtj = CooMatrix::new(n, n);
        let mut diag = DVector::zeros(n);
        let mut g = DVector::zeros(n);
        for (row, entries) in j.rows.iter().enumerate() {
            for (c1, v1) in entries {
                g[*c1] += v1 * r[row];
                for (c2, v2) in entries {
                    if c1 == c2 {
                        diag[*c1] += v1 * v2;
                    }
                    jtj.push(*c1, *c2, v1 * v2);
                }
            }
        }
        NormalEquations::Sparse { jtj, diag, g }
    }

    /// Solve `(JᵀJ + λ·diag(JᵀJ))·Δ = −Jᵀr`. `None` when the factorization
    /// fails at this damping level.
    fn solve_step(&self, lambda: f64) -> Option<DVector<f64>> {
        match self {
            NormalEquations::Dense { jtj, g } => {
                let mut damped = jtj.clone();
                for i in 0..damped.nrows() {
                    let d = damped[(i, i)].max(1e-12);
                    damped[(i, i)] += lambda * d;
                }
                let chol = damped.cholesky()?;
                Some(chol.solve(&(-g)))
            }
            NormalEquations::Sparse { jtj, diag, g } => {
                let n = g.len();
                let mut damped = jtj.clone();
                for i in 0..n {
                    damped.push(i, i, lambda * diag[i].max(1e-12));
                }
                let csc = CscMatrix::from(&damped);
                let chol = CscCholesky::factor(&csc).ok()?;
                let rhs = DMatrix::from_column_slice(n, 1, (-g).as_slice());
                let sol = chol.solve(&rhs);
                Some(DVector::from_column_slice(sol.as_slice()))
            }
        }
    }
}

/// Run the LM loop, mutating `vars` in place. Returns with
/// `converged = false` (not an error) when the iteration cap elapses without
/// meeting a convergence test; the last accepted variable vector is kept.
pub fn minimize<S: LeastSquaresSystem>(
    system: &mut S,
    vars: &mut DVector<f64>,
    opts: &LmOptions,
) -> Result<LmReport, SolveError> {
    let r0 = system.residuals(vars)?;
    if !r0.iter().all(|v| v.is_finite()) {
        return Err(SolveError::NonFiniteResidual);
    }
    let initial_cost = cost_of(&r0);
    let mut cost = initial_cost;
    let mut lambda = opts.damping;
    let mut accepted_costs = Vec::new();
    let mut consecutive_small = 0usize;
    let mut converged = false;
    let mut iterations = 0usize;

    if system.num_variables() == 0 || r0.is_empty() {
        return Ok(LmReport {
            converged: true,
            iterations: 0,
            initial_cost,
            final_cost: cost,
            accepted_costs,
        });
    }

    for iter in 0..opts.max_iterations {
        iterations = iter + 1;

        let normal = match opts.linear_solver {
            LinearSolver::Dense => {
                let j = system.jacobian(vars)?;
                let r = system.residuals(vars)?;
                NormalEquations::dense(&j, &r)
            }
            LinearSolver::Sparse => {
                let j = system.jacobian_rows(vars)?;
                let r = system.residuals(vars)?;
                NormalEquations::sparse(&j, &r, system.num_variables())
            }
        };

        let mut accepted = false;
        for _retry in 0..MAX_STEP_RETRIES {
            let Some(delta) = normal.solve_step(lambda) else {
                lambda *= DAMPING_GROW;
                if lambda > DAMPING_CEILING {
                    return Err(SolveError::SingularNormalEquations);
                }
                continue;
            };
            let candidate = &*vars + &delta;
            let r_new = system.residuals(&candidate)?;
            let cost_new = cost_of(&r_new);

            // non-strict: at a minimum the damped step is ~zero and must
            // still count as accepted so the small-drop rule can converge
            if cost_new.is_finite() && cost_new <= cost {
                let drop = cost - cost_new;
                let step_inf = delta.amax();
                *vars = candidate;
                cost = cost_new;
                lambda = (lambda * DAMPING_SHRINK).max(1e-12);
                accepted_costs.push(cost);
                accepted = true;

                if drop < opts.tolerance {
                    consecutive_small += 1;
                } else {
                    consecutive_small = 0;
                }
                if step_inf < opts.tolerance || consecutive_small >= 2 {
                    converged = true;
                }
                if opts.verbose {
                    tracing::info!(iter, cost, lambda, step_inf, "accepted step");
                } else {
                    tracing::trace!(iter, cost, lambda, "accepted step");
                }
                break;
            }
            lambda *= DAMPING_GROW;
            tracing::trace!(iter, lambda, cost_new, "rejected step");
        }

        if converged {
            break;
        }
        if !accepted && lambda > DAMPING_CEILING {
            // nothing acceptable at any damping; give up at the cap
            break;
        }
    }

    Ok(LmReport {
        converged,
        iterations,
        initial_cost,
        final_cost: cost,
        accepted_costs,
    })
}
