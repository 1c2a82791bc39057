// ========================================================================================
//                            Profile estimation pipeline
// ========================================================================================
//
// Loading, sample selection and aggregation run sequentially; the markers are then
// solved in parallel. Each marker writes its diagnostics into its own buffer, and
// the buffers are replayed in marker order so the report reads the same regardless
// of scheduling.

use crate::aggregate::{AggregateError, EvidenceAggregator, MarkerEvidence};
use crate::config::{ConfigError, EstimatorConfig};
use crate::diagnostics::{DiagnosticSink, ReportBuffer, SolverEvent};
use crate::io::{self, InputError};
use crate::nnls::NnlsSolver;
use crate::report::{MarkerProfile, ProfileReport, ReportError};
use crate::sampling::{drop_samples, make_rng, reduce_read_counts};
use crate::select::{ensure_min_samples, homozygotes_only, restrict_to_marker};
use crate::solver::{ProfileMixtureSolver, SolveError, SolveMode};
use crate::types::SampleRecord;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("Failed to solve marker {marker}: {source}")]
    Solve {
        marker: String,
        #[source]
        source: SolveError,
    },
    #[error(transparent)]
    Report(#[from] ReportError),
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Reads the sample files and merges in the allele list, if any.
pub fn load_inputs(
    files: &[PathBuf],
    allele_list: Option<&Path>,
    annotation_column: Option<&str>,
) -> Result<Vec<SampleRecord>, PipelineError> {
    let mut samples = io::load_samples(files, annotation_column)?;
    if let Some(path) = allele_list {
        let list = io::read_allele_list(path)?;
        io::apply_allele_list(&mut samples, &list);
    }
    Ok(samples)
}

/// Runs the complete estimation: sample selection, aggregation, the significance
/// filter and the per-marker solve.
pub fn estimate_profiles<N: NnlsSolver + ?Sized>(
    mut samples: Vec<SampleRecord>,
    config: &EstimatorConfig,
    nnls: &N,
    sink: &mut dyn DiagnosticSink,
) -> Result<ProfileReport, PipelineError> {
    config.validate()?;
    let started = Instant::now();
    let mut rng = make_rng(config.seed);

    if config.drop_samples > 0.0 {
        let dropped = drop_samples(&mut samples, config.drop_samples, &mut rng);
        log::info!("Dropped {} of {} samples", dropped.len(), dropped.len() + samples.len());
    }
    if let Some(limit) = config.limit_reads {
        for sample in &mut samples {
            reduce_read_counts(sample, limit, &mut rng);
        }
    }
    if let Some(marker) = &config.marker {
        restrict_to_marker(&mut samples, marker);
    }
    if config.homozygotes_only {
        homozygotes_only(&mut samples);
    }
    let removed = ensure_min_samples(&mut samples, config.min_samples);
    if removed > 0 {
        log::info!(
            "Dropped {removed} genotypes with alleles seen in fewer than {} samples",
            config.min_samples
        );
    }

    let mut aggregator = EvidenceAggregator::new(config.detection);
    for sample in &samples {
        aggregator.add_sample(sample)?;
    }
    drop(samples);

    let mut evidence = aggregator.finish(config.min_sample_pct);
    evidence.sort_by(|a, b| natord::compare(&a.marker, &b.marker));

    let loading = format!(
        "Data loading and filtering took {:.6} seconds",
        started.elapsed().as_secs_f64()
    );
    log::info!("{loading}");
    sink.record(&SolverEvent::Message(&loading));

    let mode = if config.variance {
        SolveMode::WithVariance
    } else {
        SolveMode::ProfileOnly
    };
    let solver = ProfileMixtureSolver::new(config.solver, nnls);
    let pb = create_progress_bar(evidence.len() as u64, "Solving markers");

    let solved: Vec<Result<(MarkerProfile, ReportBuffer), PipelineError>> = evidence
        .par_iter()
        .map(|marker| {
            let result = solve_one(&solver, marker, mode);
            pb.inc(1);
            result
        })
        .collect();
    pb.finish_and_clear();

    let mut report = ProfileReport::new();
    for (marker, result) in evidence.iter().zip(solved) {
        let (profile, buffer) = result?;
        buffer.replay_into(sink);
        report.insert(&marker.marker, profile);
    }

    log::info!(
        "Estimated profiles for {} markers in {:.2} seconds",
        report.len(),
        started.elapsed().as_secs_f64()
    );
    Ok(report)
}

fn solve_one<N: NnlsSolver + ?Sized>(
    solver: &ProfileMixtureSolver<'_, N>,
    evidence: &MarkerEvidence,
    mode: SolveMode,
) -> Result<(MarkerProfile, ReportBuffer), PipelineError> {
    let mut buffer = ReportBuffer::default();
    buffer.record(&SolverEvent::MarkerStart {
        marker: &evidence.marker,
        true_alleles: evidence.true_alleles,
        variants: evidence.num_variants(),
        samples: evidence.num_samples(),
    });
    log::info!(
        "Solving marker {} ({} true alleles, {} variants, {} samples)",
        evidence.marker,
        evidence.true_alleles,
        evidence.num_variants(),
        evidence.num_samples()
    );

    let started = Instant::now();
    let fit = solver
        .solve_marker(evidence, mode, &mut buffer)
        .map_err(|source| PipelineError::Solve {
            marker: evidence.marker.clone(),
            source,
        })?;
    let seconds = started.elapsed().as_secs_f64();

    buffer.record(&SolverEvent::MarkerSolved {
        marker: &evidence.marker,
        seconds,
    });
    log::info!("Solved marker {} in {seconds:.3} seconds", evidence.marker);

    Ok((MarkerProfile::from_fit(evidence, &fit), buffer))
}
