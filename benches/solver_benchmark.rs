// ========================================================================================
//
//                  SINGLE-DIRECTION PROFILE SOLVE BENCHMARK
//
// ========================================================================================
//
// Times one direction of the alternating least-squares fit on synthetic markers of
// growing size. Samples are drawn as noisy mixtures of known profiles, about a third
// of them heterozygous.

use bgprofile::config::SolverConfig;
use bgprofile::diagnostics::NoopSink;
use bgprofile::nnls::ActiveSetNnls;
use bgprofile::solver::{ProfileMixtureSolver, SolveMode};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct SyntheticMarker {
    observations: Array2<f64>,
    genotypes: Vec<Vec<usize>>,
    true_alleles: usize,
}

fn synthetic_marker(true_alleles: usize, variants: usize, samples: usize) -> SyntheticMarker {
    let mut rng = StdRng::seed_from_u64(0xB6E5 + (true_alleles * variants * samples) as u64);

    let profiles = Array2::from_shape_fn((true_alleles, variants), |(j, k)| {
        if j == k {
            100.0
        } else if rng.gen_bool(0.3) {
            rng.gen_range(0.5..15.0)
        } else {
            0.0
        }
    });

    let mut observations = Array2::<f64>::zeros((samples, variants));
    let mut genotypes = Vec::with_capacity(samples);
    for sample in 0..samples {
        let first = sample % true_alleles;
        let genotype = if true_alleles > 1 && rng.gen_bool(0.33) {
            let second = (first + rng.gen_range(1..true_alleles)) % true_alleles;
            vec![first, second]
        } else {
            vec![first]
        };

        for &allele in &genotype {
            let depth: f64 = rng.gen_range(200.0..2000.0);
            for variant in 0..variants {
                let jitter = rng.gen_range(0.8..1.2);
                observations[[sample, variant]] +=
                    (profiles[[allele, variant]] * depth / 100.0 * jitter).round();
            }
        }
        genotypes.push(genotype);
    }

    SyntheticMarker {
        observations,
        genotypes,
        true_alleles,
    }
}

fn benchmark_solve_strand(c: &mut Criterion) {
    let shapes = [(2_usize, 10_usize, 50_usize), (5, 40, 200), (10, 120, 800)];
    let nnls = ActiveSetNnls::default();
    let solver = ProfileMixtureSolver::new(SolverConfig::default(), &nnls);

    let mut group = c.benchmark_group("solve_strand");
    for &(n, m, k) in &shapes {
        let marker = synthetic_marker(n, m, k);
        group.throughput(Throughput::Elements((m * k) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("n{n}_m{m}_k{k}")),
            &marker,
            |b, marker| {
                b.iter(|| {
                    let fit = solver
                        .solve_strand(
                            black_box(marker.observations.view()),
                            &marker.genotypes,
                            marker.true_alleles,
                            SolveMode::ProfileOnly,
                            &mut NoopSink,
                        )
                        .expect("synthetic marker solves");
                    black_box(fit.residual);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark_solve_strand);
criterion_main!(benches);
