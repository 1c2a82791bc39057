//! Non-negative least squares: minimize `‖Ax − b‖²` subject to `x ≥ 0`.
//!
//! The profile solver only ever needs tiny instances (one unknown per true allele
//! of a single sample), so the default implementation is the classic Lawson–Hanson
//! active-set method with the passive-set subproblem solved through its normal
//! equations.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::Solve;
use ndarray_linalg::error::LinalgError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NnlsError {
    #[error("Design matrix has {rows} rows but the target vector has {len} entries.")]
    DimensionMismatch { rows: usize, len: usize },
    #[error("Non-finite value in the NNLS input.")]
    NonFiniteInput,
    #[error("Linear system solve failed inside NNLS: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),
}

/// Strategy for solving the per-sample non-negative least-squares subproblem.
pub trait NnlsSolver: Sync {
    fn solve(&self, a: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, NnlsError>;
}

impl<F> NnlsSolver for F
where
    F: Fn(ArrayView2<f64>, ArrayView1<f64>) -> Result<Array1<f64>, NnlsError> + Sync,
{
    fn solve(&self, a: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, NnlsError> {
        self(a, b)
    }
}

/// Lawson–Hanson active-set NNLS.
#[derive(Clone, Copy, Debug)]
pub struct ActiveSetNnls {
    /// Cap on the number of passive-set additions, as a multiple of the unknowns.
    pub iteration_factor: usize,
}

impl Default for ActiveSetNnls {
    fn default() -> Self {
        Self {
            iteration_factor: 3,
        }
    }
}

impl NnlsSolver for ActiveSetNnls {
    fn solve(&self, a: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, NnlsError> {
        let (rows, cols) = a.dim();
        if rows != b.len() {
            return Err(NnlsError::DimensionMismatch {
                rows,
                len: b.len(),
            });
        }
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return Err(NnlsError::NonFiniteInput);
        }

        let mut x = Array1::<f64>::zeros(cols);
        if cols == 0 {
            return Ok(x);
        }

        let norm_one = (0..cols)
            .map(|j| a.column(j).iter().map(|v| v.abs()).sum::<f64>())
            .fold(0.0_f64, f64::max);
        let tol = 10.0 * f64::EPSILON * norm_one * rows.max(cols) as f64;

        let mut passive = vec![false; cols];
        // Columns that made the passive system singular are never considered again.
        let mut excluded = vec![false; cols];
        let max_iterations = self.iteration_factor.max(1) * cols;

        for _ in 0..max_iterations {
            let gradient = a.t().dot(&(&b - &a.dot(&x)));
            let candidate = (0..cols)
                .filter(|&j| !passive[j] && !excluded[j] && gradient[j] > tol)
                .max_by(|&i, &j| gradient[i].total_cmp(&gradient[j]));
            let Some(entering) = candidate else {
                break;
            };

            passive[entering] = true;
            let mut trial = match passive_least_squares(a, b, &passive) {
                Ok(trial) => trial,
                Err(NnlsError::LinearSystemSolveFailed(err)) => {
                    log::debug!("NNLS passive system singular after admitting column {entering}: {err}");
                    passive[entering] = false;
                    excluded[entering] = true;
                    continue;
                }
                Err(err) => return Err(err),
            };

            // Step back towards feasibility until every passive coefficient is positive.
            let mut inner_guard = cols;
            while (0..cols).any(|j| passive[j] && trial[j] <= tol) && inner_guard > 0 {
                inner_guard -= 1;
                let alpha = (0..cols)
                    .filter(|&j| passive[j] && trial[j] <= tol)
                    .map(|j| x[j] / (x[j] - trial[j]))
                    .filter(|step| step.is_finite())
                    .fold(1.0_f64, f64::min)
                    .clamp(0.0, 1.0);
                x = &x + &((&trial - &x) * alpha);
                for j in 0..cols {
                    if passive[j] && x[j] <= tol {
                        passive[j] = false;
                        x[j] = 0.0;
                    }
                }
                trial = passive_least_squares(a, b, &passive)?;
            }
            x = trial.mapv(|v| v.max(0.0));
        }

        Ok(x)
    }
}

/// Unconstrained least squares restricted to the passive columns; zero elsewhere.
fn passive_least_squares(
    a: ArrayView2<f64>,
    b: ArrayView1<f64>,
    passive: &[bool],
) -> Result<Array1<f64>, NnlsError> {
    let columns: Vec<usize> = (0..passive.len()).filter(|&j| passive[j]).collect();
    let mut full = Array1::<f64>::zeros(passive.len());
    if columns.is_empty() {
        return Ok(full);
    }

    let sub = Array2::from_shape_fn((a.nrows(), columns.len()), |(i, k)| a[[i, columns[k]]]);
    let gram = sub.t().dot(&sub);
    let rhs = sub.t().dot(&b);
    let z = gram.solve(&rhs)?;
    for (k, &j) in columns.iter().enumerate() {
        full[j] = z[k];
    }
    Ok(full)
}
