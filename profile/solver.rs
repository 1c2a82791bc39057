//! # Profile-Mixture Solver
//!
//! Recovers, for every true allele of a marker, the proportional background profile
//! it produces at each catalogued variant. Each sample's rescaled read vector is
//! modelled as a non-negative mixture of the profiles of its true alleles:
//!
//! ```text
//!     C ≈ A · P      C: alleles × variants evidence (see `aggregate::accumulate_evidence`)
//!                    A: alleles × alleles balance accumulated over all samples
//!                    P: alleles × variants profiles, P[j, j] = 100, P ≥ 0
//! ```
//!
//! The fit alternates between estimating `A` from per-sample NNLS solves against the
//! current profiles and refining `P` by a non-negative Gauss–Seidel sweep over its
//! rows, until the squared residual `‖C − A·P‖²` stops decreasing.

use crate::aggregate::{MarkerEvidence, accumulate_evidence};
use crate::config::SolverConfig;
use crate::diagnostics::{DiagnosticSink, SolverEvent, VarianceCaveat};
use crate::nnls::{NnlsError, NnlsSolver};
use crate::types::Strand;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

/// Reference peak height of every true allele in its own profile.
pub const REFERENCE_HEIGHT: f64 = 100.0;

#[derive(Error, Debug)]
pub enum SolveError {
    #[error("Observations have {rows} sample rows but {genotypes} genotypes were supplied.")]
    SampleCountMismatch { rows: usize, genotypes: usize },
    #[error("There are {true_alleles} true alleles but only {variants} catalogued variants.")]
    TooManyTrueAlleles { true_alleles: usize, variants: usize },
    #[error("Sample {sample} has no true alleles.")]
    EmptyGenotype { sample: usize },
    #[error("Sample {sample} refers to allele {allele}, but only {true_alleles} true alleles exist.")]
    GenotypeOutOfRange {
        sample: usize,
        allele: usize,
        true_alleles: usize,
    },
    #[error("Non-finite or negative read count for sample {sample} at variant {variant}.")]
    InvalidObservation { sample: usize, variant: usize },
    #[error("Balance estimation failed for sample {sample}: {source}")]
    Balance {
        sample: usize,
        #[source]
        source: NnlsError,
    },
}

/// Whether variance profiles are estimated alongside the mean profiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SolveMode {
    #[default]
    ProfileOnly,
    WithVariance,
}

/// Converged (or best-effort) fit for one read direction.
#[derive(Clone, Debug)]
pub struct StrandFit {
    pub profiles: Array2<f64>,
    pub variances: Option<Array2<f64>>,
    /// Balance matrix of the final outer iteration.
    pub balance: Array2<f64>,
    pub residual: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Alleles for which no evidence accumulated; their profile rows are zero apart
    /// from the reference position.
    pub degenerate_alleles: Vec<usize>,
}

/// Fit for both read directions of one marker.
#[derive(Clone, Debug)]
pub struct MarkerFit {
    pub forward: StrandFit,
    pub reverse: StrandFit,
    pub variance_caveat: Option<VarianceCaveat>,
}

/// Result of a sequence of coordinate-descent sweeps.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepOutcome {
    pub residual: f64,
    pub sweeps: usize,
    pub degenerate: Vec<usize>,
}

pub struct ProfileMixtureSolver<'a, N: NnlsSolver + ?Sized> {
    config: SolverConfig,
    nnls: &'a N,
}

impl<'a, N: NnlsSolver + ?Sized> ProfileMixtureSolver<'a, N> {
    pub fn new(config: SolverConfig, nnls: &'a N) -> Self {
        Self { config, nnls }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solves both directions of a marker independently.
    pub fn solve_marker(
        &self,
        evidence: &MarkerEvidence,
        mode: SolveMode,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<MarkerFit, SolveError> {
        sink.record(&SolverEvent::StrandStart(Strand::Forward));
        let forward = self.solve_strand(
            evidence.observations(Strand::Forward),
            &evidence.genotypes,
            evidence.true_alleles,
            mode,
            sink,
        )?;
        sink.record(&SolverEvent::StrandStart(Strand::Reverse));
        let reverse = self.solve_strand(
            evidence.observations(Strand::Reverse),
            &evidence.genotypes,
            evidence.true_alleles,
            mode,
            sink,
        )?;

        Ok(MarkerFit {
            forward,
            reverse,
            variance_caveat: (mode == SolveMode::WithVariance)
                .then(|| VarianceCaveat::for_genotypes(&evidence.genotypes)),
        })
    }

    /// Solves one read direction.
    ///
    /// `observations` holds the raw read counts (samples × variants); the first
    /// `true_alleles` columns must be the true alleles, and every genotype index must
    /// point into them.
    pub fn solve_strand(
        &self,
        observations: ArrayView2<f64>,
        genotypes: &[Vec<usize>],
        true_alleles: usize,
        mode: SolveMode,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<StrandFit, SolveError> {
        validate_inputs(observations, genotypes, true_alleles)?;

        let evidence = accumulate_evidence(observations, genotypes, true_alleles);
        for &(sample, allele) in &evidence.skipped {
            log::warn!("Sample {sample} does not have reads for allele {allele}; skipped");
            sink.record(&SolverEvent::SkippedSample { sample, allele });
        }
        let c = evidence.matrix;

        let mut profiles = initial_profiles(true_alleles, observations.ncols());
        let mut balance = Array2::<f64>::zeros((true_alleles, true_alleles));
        let mut residual = f64::MAX;
        let mut iterations = 0;
        let mut converged = false;
        let mut degenerate = Vec::new();

        for iteration in 0..self.config.max_outer_iterations {
            iterations = iteration + 1;
            balance = self.estimate_balance(observations, genotypes, &profiles)?;

            let outcome = self.refine_profiles(&balance, &c, &mut profiles);
            for &allele in &outcome.degenerate {
                log::warn!("Iteration {iteration}: no samples appear to have allele {allele}");
                sink.record(&SolverEvent::DegenerateAllele { iteration, allele });
            }
            degenerate = outcome.degenerate;

            let previous = residual;
            residual = squared_residual(c.view(), balance.view(), profiles.view());
            log::debug!(
                "Outer iteration {iteration}: residual {residual:.6} ({} inner sweeps)",
                outcome.sweeps
            );
            sink.record(&SolverEvent::Iteration {
                iteration,
                residual,
                previous: (iteration > 0).then_some(previous),
            });

            if has_converged(previous, residual, self.config.tolerance) {
                converged = true;
                break;
            }
        }

        if !converged {
            log::warn!(
                "Profile fit did not converge within {iterations} iterations (residual {residual:.6})"
            );
            sink.record(&SolverEvent::NotConverged {
                iterations,
                residual,
            });
        }

        let variances = match mode {
            SolveMode::ProfileOnly => None,
            SolveMode::WithVariance => {
                let caveat = VarianceCaveat::for_genotypes(genotypes);
                log::warn!("{caveat}");
                sink.record(&SolverEvent::VarianceStart(caveat));
                Some(self.estimate_variances(observations, genotypes, &profiles, sink)?)
            }
        };

        Ok(StrandFit {
            profiles,
            variances,
            balance,
            residual,
            iterations,
            converged,
            degenerate_alleles: degenerate,
        })
    }

    /// Accumulates the allele-balance matrix `A` for the current profiles.
    ///
    /// Homozygotes contribute a unit weight to their allele's diagonal entry. For
    /// samples with several true alleles, the counts at the true-allele columns are
    /// fitted as a non-negative mix of the corresponding profile sub-matrix, and the
    /// mixture weights are rescaled the same way the sample was rescaled into `C`.
    pub fn estimate_balance(
        &self,
        observations: ArrayView2<f64>,
        genotypes: &[Vec<usize>],
        profiles: &Array2<f64>,
    ) -> Result<Array2<f64>, SolveError> {
        let n = profiles.nrows();
        let mut balance = Array2::<f64>::zeros((n, n));

        for (sample, genotype) in genotypes.iter().enumerate() {
            if let [allele] = genotype.as_slice() {
                // Homozygotes need no fit; alleles without reads never entered C.
                if observations[[sample, *allele]] != 0.0 {
                    balance[[*allele, *allele]] += 1.0;
                }
                continue;
            }

            let weights = self.sample_balance(observations.row(sample), genotype, profiles, sample)?;
            for (j, &row_allele) in genotype.iter().enumerate() {
                for (k, &col_allele) in genotype.iter().enumerate() {
                    balance[[row_allele, col_allele]] += weights[[j, k]];
                }
            }
        }

        Ok(balance)
    }

    /// Per-sample balance weights (genotype × genotype). Row `j` describes the
    /// sample rescaled by its `j`-th allele; rows of alleles without reads stay zero.
    pub(crate) fn sample_balance(
        &self,
        counts: ArrayView1<f64>,
        genotype: &[usize],
        profiles: &Array2<f64>,
        sample: usize,
    ) -> Result<Array2<f64>, SolveError> {
        let k = genotype.len();
        if k == 1 {
            let reference = counts[genotype[0]];
            let weight = if reference == 0.0 { 0.0 } else { 1.0 };
            return Ok(Array2::from_elem((1, 1), weight));
        }

        // Column l of the design is allele l's profile restricted to the sample's
        // true-allele columns.
        let design = Array2::from_shape_fn((k, k), |(row, col)| {
            profiles[[genotype[col], genotype[row]]]
        });
        let target = Array1::from_shape_fn(k, |j| counts[genotype[j]]);
        let mixture = self
            .nnls
            .solve(design.view(), target.view())
            .map_err(|source| SolveError::Balance { sample, source })?;

        let mut weights = Array2::<f64>::zeros((k, k));
        for j in 0..k {
            if target[j] == 0.0 {
                continue;
            }
            let scale = REFERENCE_HEIGHT / target[j] / k as f64;
            weights.row_mut(j).assign(&(&mixture * scale));
        }
        Ok(weights)
    }

    /// Refines the profiles for a fixed balance matrix, in place.
    ///
    /// Each sweep visits the rows in order and immediately reuses updated rows.
    /// Negative entries are clamped to zero and the reference entry is pinned to 100.
    /// Rows whose allele has no evidence (`(AᵗA)[p, p] == 0`) are zeroed.
    pub fn refine_profiles(
        &self,
        balance: &Array2<f64>,
        evidence: &Array2<f64>,
        profiles: &mut Array2<f64>,
    ) -> SweepOutcome {
        coordinate_descent(
            balance.view(),
            evidence.view(),
            profiles,
            &self.config,
            |p, row| row[p] = REFERENCE_HEIGHT,
        )
    }
}

fn validate_inputs(
    observations: ArrayView2<f64>,
    genotypes: &[Vec<usize>],
    true_alleles: usize,
) -> Result<(), SolveError> {
    if observations.nrows() != genotypes.len() {
        return Err(SolveError::SampleCountMismatch {
            rows: observations.nrows(),
            genotypes: genotypes.len(),
        });
    }
    if true_alleles > observations.ncols() {
        return Err(SolveError::TooManyTrueAlleles {
            true_alleles,
            variants: observations.ncols(),
        });
    }
    for (sample, genotype) in genotypes.iter().enumerate() {
        if genotype.is_empty() {
            return Err(SolveError::EmptyGenotype { sample });
        }
        if let Some(&allele) = genotype.iter().find(|&&allele| allele >= true_alleles) {
            return Err(SolveError::GenotypeOutOfRange {
                sample,
                allele,
                true_alleles,
            });
        }
    }
    if let Some(((sample, variant), _)) = observations
        .indexed_iter()
        .find(|(_, value)| !value.is_finite() || **value < 0.0)
    {
        return Err(SolveError::InvalidObservation { sample, variant });
    }
    Ok(())
}

/// Profiles start out without any cross contributions: 100 × identity.
pub fn initial_profiles(true_alleles: usize, variants: usize) -> Array2<f64> {
    let mut profiles = Array2::<f64>::zeros((true_alleles, variants));
    for j in 0..true_alleles {
        profiles[[j, j]] = REFERENCE_HEIGHT;
    }
    profiles
}

/// `‖evidence − design · estimate‖²`
pub fn squared_residual(
    evidence: ArrayView2<f64>,
    design: ArrayView2<f64>,
    estimate: ArrayView2<f64>,
) -> f64 {
    let fitted = design.dot(&estimate);
    evidence
        .iter()
        .zip(fitted.iter())
        .map(|(observed, modelled)| (observed - modelled).powi(2))
        .sum()
}

fn has_converged(previous: f64, current: f64, tolerance: f64) -> bool {
    current == 0.0 || (previous - current) / previous < tolerance
}

/// Non-negative Gauss–Seidel coordinate descent for `min ‖evidence − design · X‖²`
/// over the rows of `X`. `clamp` applies row-specific constraints after the
/// non-negativity clamp.
pub(crate) fn coordinate_descent<F>(
    design: ArrayView2<f64>,
    evidence: ArrayView2<f64>,
    estimate: &mut Array2<f64>,
    config: &SolverConfig,
    mut clamp: F,
) -> SweepOutcome
where
    F: FnMut(usize, &mut Array1<f64>),
{
    let gram = design.t().dot(&design);
    let projected = design.t().dot(&evidence);
    let rows = estimate.nrows();

    let mut degenerate = Vec::new();
    let mut residual = f64::MAX;
    let mut sweeps = 0;

    for sweep in 0..config.max_inner_iterations {
        sweeps = sweep + 1;
        for p in 0..rows {
            let diagonal = gram[[p, p]];
            if diagonal == 0.0 {
                let mut row = Array1::<f64>::zeros(estimate.ncols());
                clamp(p, &mut row);
                estimate.row_mut(p).assign(&row);
                if !degenerate.contains(&p) {
                    degenerate.push(p);
                }
                continue;
            }

            let mut row = projected.row(p).to_owned();
            for q in (0..rows).filter(|&q| q != p) {
                row.scaled_add(-gram[[p, q]], &estimate.row(q));
            }
            row /= diagonal;
            row.mapv_inplace(|v| v.max(0.0));
            clamp(p, &mut row);
            estimate.row_mut(p).assign(&row);
        }

        let previous = residual;
        residual = squared_residual(evidence, design, estimate.view());
        if has_converged(previous, residual, config.tolerance) {
            break;
        }
    }

    SweepOutcome {
        residual,
        sweeps,
        degenerate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{NoopSink, ReportBuffer};
    use crate::nnls::ActiveSetNnls;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn solver(nnls: &ActiveSetNnls) -> ProfileMixtureSolver<'_, ActiveSetNnls> {
        ProfileMixtureSolver::new(SolverConfig::default(), nnls)
    }

    #[test]
    fn homozygotes_converge_to_mean_background() {
        let nnls = ActiveSetNnls::default();
        let observations = array![[100.0, 10.0], [100.0, 6.0], [100.0, 14.0]];
        let genotypes = vec![vec![0], vec![0], vec![0]];

        let fit = solver(&nnls)
            .solve_strand(observations.view(), &genotypes, 1, SolveMode::ProfileOnly, &mut NoopSink)
            .unwrap();

        assert_abs_diff_eq!(fit.profiles[[0, 0]], 100.0, epsilon = 1e-12);
        assert_abs_diff_eq!(fit.profiles[[0, 1]], 10.0, epsilon = 1e-9);
        assert_eq!(fit.balance, array![[3.0]]);
        assert!(fit.converged);
        assert!(fit.variances.is_none());
    }

    #[test]
    fn homozygote_balance_matrix_is_diagonal() {
        let nnls = ActiveSetNnls::default();
        let observations = array![
            [200.0, 0.0, 10.0],
            [0.0, 50.0, 4.0],
            [120.0, 0.0, 0.0],
        ];
        let genotypes = vec![vec![0], vec![1], vec![0]];

        let fit = solver(&nnls)
            .solve_strand(observations.view(), &genotypes, 2, SolveMode::ProfileOnly, &mut NoopSink)
            .unwrap();

        assert_eq!(fit.balance, array![[2.0, 0.0], [0.0, 1.0]]);
        // Allele 0: (5 + 0) / 2; allele 1: 8 / 1.
        assert_abs_diff_eq!(fit.profiles[[0, 2]], 2.5, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.profiles[[1, 2]], 8.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.profiles[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn balanced_heterozygotes_yield_scaled_identity() {
        let nnls = ActiveSetNnls::default();
        let observations = array![[50.0, 50.0], [80.0, 80.0], [30.0, 30.0]];
        let genotypes = vec![vec![0, 1]; 3];

        let fit = solver(&nnls)
            .solve_strand(observations.view(), &genotypes, 2, SolveMode::ProfileOnly, &mut NoopSink)
            .unwrap();

        for ((i, k), value) in fit.profiles.indexed_iter() {
            let expected = if i == k { 100.0 } else { 0.0 };
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-9);
        }
        assert_abs_diff_eq!(fit.balance[[0, 0]], 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(fit.balance[[0, 1]], fit.balance[[1, 0]], epsilon = 1e-12);
        assert_abs_diff_eq!(fit.balance[[0, 0]], fit.balance[[1, 1]], epsilon = 1e-12);
        assert_abs_diff_eq!(fit.balance[[0, 0]], fit.balance[[0, 1]], epsilon = 1e-9);
        assert_abs_diff_eq!(fit.residual, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn allele_without_evidence_keeps_only_its_reference_and_an_anomaly() {
        let nnls = ActiveSetNnls::default();
        let observations = array![[100.0, 0.0, 5.0], [90.0, 0.0, 6.0]];
        let genotypes = vec![vec![0], vec![0, 1]];
        let mut report = ReportBuffer::default();

        let fit = solver(&nnls)
            .solve_strand(observations.view(), &genotypes, 2, SolveMode::ProfileOnly, &mut report)
            .unwrap();

        assert_eq!(fit.degenerate_alleles, vec![1]);
        assert_eq!(fit.profiles.row(1).to_vec(), vec![0.0, 100.0, 0.0]);
        assert!(fit.profiles.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(fit.profiles[[0, 0]], 100.0, epsilon = 1e-12);
        assert!(report.lines().iter().any(|l| l == "Sample 1 does not have allele 1"));
        assert!(report
            .lines()
            .iter()
            .any(|l| l.ends_with("No samples appear to have allele 1")));
    }

    #[test]
    fn mixed_genotypes_keep_invariants() {
        let nnls = ActiveSetNnls::default();
        let observations = array![
            [1000.0, 0.0, 80.0, 30.0],
            [0.0, 800.0, 10.0, 90.0],
            [500.0, 420.0, 45.0, 60.0],
            [610.0, 300.0, 52.0, 38.0],
            [900.0, 0.0, 66.0, 29.0],
        ];
        let genotypes = vec![vec![0], vec![1], vec![0, 1], vec![0, 1], vec![0]];

        let fit = solver(&nnls)
            .solve_strand(observations.view(), &genotypes, 2, SolveMode::ProfileOnly, &mut NoopSink)
            .unwrap();

        for j in 0..2 {
            assert_eq!(fit.profiles[[j, j]], 100.0);
        }
        assert!(fit.profiles.iter().all(|&v| v >= 0.0));
        assert!(fit.iterations <= SolverConfig::default().max_outer_iterations);
    }

    #[test]
    fn converged_fit_is_a_fixed_point() {
        let nnls = ActiveSetNnls::default();
        let solver = solver(&nnls);
        let observations = array![
            [1000.0, 0.0, 80.0],
            [0.0, 800.0, 10.0],
            [500.0, 420.0, 45.0],
            [610.0, 300.0, 52.0],
        ];
        let genotypes = vec![vec![0], vec![1], vec![0, 1], vec![0, 1]];

        let fit = solver
            .solve_strand(observations.view(), &genotypes, 2, SolveMode::ProfileOnly, &mut NoopSink)
            .unwrap();
        let evidence = accumulate_evidence(observations.view(), &genotypes, 2).matrix;

        let single_sweep = SolverConfig {
            max_inner_iterations: 1,
            ..*solver.config()
        };
        let mut profiles = fit.profiles.clone();
        let outcome = ProfileMixtureSolver::new(single_sweep, &nnls).refine_profiles(
            &fit.balance,
            &evidence,
            &mut profiles,
        );
        let relative_change = (fit.residual - outcome.residual).abs() / fit.residual.max(1.0);
        assert!(relative_change < solver.config().tolerance);
        assert!(outcome.residual <= fit.residual + 1e-9);
    }

    #[test]
    fn injected_nnls_strategy_drives_balance_estimation() {
        fn even_split(a: ArrayView2<f64>, _: ArrayView1<f64>) -> Result<Array1<f64>, NnlsError> {
            Ok(Array1::from_elem(a.ncols(), 0.5))
        }
        let solver = ProfileMixtureSolver::new(SolverConfig::default(), &even_split);
        let observations = array![[50.0, 25.0]];
        let balance = solver
            .estimate_balance(observations.view(), &[vec![0, 1]], &initial_profiles(2, 2))
            .unwrap();
        // Row j is the mixture rescaled by 100 / count_j / 2.
        assert_eq!(balance, array![[0.5, 0.5], [1.0, 1.0]]);
    }

    #[test]
    fn iteration_caps_bound_the_work() {
        let nnls = ActiveSetNnls::default();
        let config = SolverConfig {
            max_outer_iterations: 1,
            max_inner_iterations: 1,
            tolerance: 1e-12,
        };
        let observations = array![[500.0, 420.0, 45.0], [610.0, 300.0, 52.0]];
        let genotypes = vec![vec![0, 1], vec![0, 1]];
        let mut report = ReportBuffer::default();

        let fit = ProfileMixtureSolver::new(config, &nnls)
            .solve_strand(observations.view(), &genotypes, 2, SolveMode::ProfileOnly, &mut report)
            .unwrap();
        assert_eq!(fit.iterations, 1);
        assert!(report.lines().iter().any(|l| l.starts_with("   0 ")));
    }

    #[test]
    fn inconsistent_genotypes_are_rejected() {
        let nnls = ActiveSetNnls::default();
        let observations = array![[100.0, 5.0]];
        let result = solver(&nnls).solve_strand(
            observations.view(),
            &[vec![1]],
            1,
            SolveMode::ProfileOnly,
            &mut NoopSink,
        );
        assert!(matches!(
            result,
            Err(SolveError::GenotypeOutOfRange { sample: 0, allele: 1, true_alleles: 1 })
        ));

        let result = solver(&nnls).solve_strand(
            observations.view(),
            &[vec![0], vec![0]],
            1,
            SolveMode::ProfileOnly,
            &mut NoopSink,
        );
        assert!(matches!(result, Err(SolveError::SampleCountMismatch { .. })));
    }
}
