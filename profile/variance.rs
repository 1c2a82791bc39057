//! Companion dispersion estimate for fitted profiles.
//!
//! Every (sample, true allele) pair becomes one row of an expanded system: the
//! evidence is the squared deviation of the rescaled sample from its fitted
//! mixture, and the design row holds the squared balance weights. The same
//! non-negative coordinate descent used for the profiles then fits `V`.

use crate::diagnostics::{DiagnosticSink, SolverEvent};
use crate::nnls::NnlsSolver;
use crate::solver::{ProfileMixtureSolver, REFERENCE_HEIGHT, SolveError, coordinate_descent};
use ndarray::{Array1, Array2, ArrayView2};

impl<N: NnlsSolver + ?Sized> ProfileMixtureSolver<'_, N> {
    /// Fits the variance matrix (alleles × variants) for converged `profiles`.
    ///
    /// `V[p, p]` is always zero, as is every entry whose mean profile value is zero.
    pub fn estimate_variances(
        &self,
        observations: ArrayView2<f64>,
        genotypes: &[Vec<usize>],
        profiles: &Array2<f64>,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Array2<f64>, SolveError> {
        let (n, m) = profiles.dim();
        let mut design_rows: Vec<Array1<f64>> = Vec::new();
        let mut evidence_rows: Vec<Array1<f64>> = Vec::new();

        for (sample, genotype) in genotypes.iter().enumerate() {
            let counts = observations.row(sample);
            let weights = self.sample_balance(counts, genotype, profiles, sample)?;
            let k = genotype.len();

            for (j, &allele) in genotype.iter().enumerate() {
                let reference = counts[allele];
                if reference == 0.0 {
                    continue;
                }
                let scale = REFERENCE_HEIGHT / reference / k as f64;

                let mut fitted = Array1::<f64>::zeros(m);
                let mut design = Array1::<f64>::zeros(n);
                for (l, &other) in genotype.iter().enumerate() {
                    fitted.scaled_add(weights[[j, l]], &profiles.row(other));
                    design[other] = weights[[j, l]].powi(2);
                }

                let deviation = Array1::from_shape_fn(m, |v| (scale * counts[v] - fitted[v]).powi(2));
                design_rows.push(design);
                evidence_rows.push(deviation);
            }
        }

        let rows = design_rows.len();
        let design = Array2::from_shape_fn((rows, n), |(r, c)| design_rows[r][c]);
        let evidence = Array2::from_shape_fn((rows, m), |(r, c)| evidence_rows[r][c]);

        let mut variances = Array2::<f64>::zeros((n, m));
        let outcome = coordinate_descent(
            design.view(),
            evidence.view(),
            &mut variances,
            self.config(),
            |p, row| {
                row[p] = 0.0;
                for (value, &mean) in row.iter_mut().zip(profiles.row(p)) {
                    if mean == 0.0 {
                        *value = 0.0;
                    }
                }
            },
        );

        for &allele in &outcome.degenerate {
            log::warn!("No variance evidence for allele {allele}");
            sink.record(&SolverEvent::DegenerateAllele {
                iteration: outcome.sweeps.saturating_sub(1),
                allele,
            });
        }
        log::debug!(
            "Variance fit: residual {:.6} after {} sweeps",
            outcome.residual,
            outcome.sweeps
        );

        Ok(variances)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SolverConfig;
    use crate::diagnostics::NoopSink;
    use crate::nnls::ActiveSetNnls;
    use crate::solver::{ProfileMixtureSolver, SolveMode};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn homozygote_variance_is_population_variance() {
        let nnls = ActiveSetNnls::default();
        let solver = ProfileMixtureSolver::new(SolverConfig::default(), &nnls);
        let observations = array![[100.0, 10.0], [100.0, 6.0], [100.0, 14.0]];
        let genotypes = vec![vec![0], vec![0], vec![0]];

        let fit = solver
            .solve_strand(
                observations.view(),
                &genotypes,
                1,
                SolveMode::WithVariance,
                &mut NoopSink,
            )
            .unwrap();
        let variances = fit.variances.unwrap();

        assert_abs_diff_eq!(fit.profiles[[0, 1]], 10.0, epsilon = 1e-9);
        assert_eq!(variances[[0, 0]], 0.0);
        assert_abs_diff_eq!(variances[[0, 1]], 32.0 / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn variance_is_zero_on_reference_and_where_mean_is_zero() {
        let nnls = ActiveSetNnls::default();
        let solver = ProfileMixtureSolver::new(SolverConfig::default(), &nnls);
        let observations = array![
            [100.0, 0.0, 8.0, 0.0],
            [0.0, 100.0, 0.0, 3.0],
            [80.0, 0.0, 4.0, 0.0],
            [0.0, 50.0, 0.0, 2.0],
            [60.0, 60.0, 3.0, 2.0],
        ];
        let genotypes = vec![vec![0], vec![1], vec![0], vec![1], vec![0, 1]];

        let fit = solver
            .solve_strand(
                observations.view(),
                &genotypes,
                2,
                SolveMode::WithVariance,
                &mut NoopSink,
            )
            .unwrap();
        let variances = fit.variances.unwrap();

        for p in 0..2 {
            assert_eq!(variances[[p, p]], 0.0);
            for k in 0..4 {
                assert!(variances[[p, k]] >= 0.0);
                if fit.profiles[[p, k]] == 0.0 {
                    assert_eq!(variances[[p, k]], 0.0);
                }
            }
        }
    }

    #[test]
    fn profile_only_mode_skips_variances() {
        let nnls = ActiveSetNnls::default();
        let solver = ProfileMixtureSolver::new(SolverConfig::default(), &nnls);
        let observations = array![[100.0, 10.0], [50.0, 5.0]];
        let fit = solver
            .solve_strand(
                observations.view(),
                &[vec![0], vec![0]],
                1,
                SolveMode::ProfileOnly,
                &mut NoopSink,
            )
            .unwrap();
        assert!(fit.variances.is_none());
    }
}
