// ========================================================================================
//
//                         THE COMMAND-LINE FRONT END: BGPROFILE
//
// ========================================================================================
//
// Parses arguments, assembles the estimator configuration (file values first,
// command-line flags on top), loads the samples and hands everything to the library
// pipeline. The JSON result goes to stdout or the requested output file; the
// optional text report receives the solver diagnostics.

use bgprofile::config::EstimatorConfig;
use bgprofile::diagnostics::{DiagnosticSink, NoopSink, TextReport};
use bgprofile::nnls::ActiveSetNnls;
use bgprofile::pipeline::{self, PipelineError};
use bgprofile::report::ReportError;
use clap::Parser;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[clap(
    name = "bgprofile",
    version,
    about = "Estimate allele-specific background noise profiles from genotyped samples."
)]
struct Args {
    /// Sample files (tab-separated: name, allele, forward, reverse). Files whose names
    /// share the part before the first dot belong to the same sample.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Allele list with columns sample, marker and allele.
    #[arg(short = 'l', long = "allelelist", value_name = "FILE")]
    allele_list: Option<PathBuf>,

    /// Column of the sample files whose values starting with 'ALLELE' mark true alleles.
    #[arg(short = 'c', long, value_name = "COLUMN")]
    annotation_column: Option<String>,

    /// Write a diagnostic report to the given file.
    #[arg(short = 'r', long, value_name = "OUTFILE")]
    report: Option<PathBuf>,

    /// Write the profiles to the given file instead of stdout.
    #[arg(short = 'o', long, value_name = "OUTFILE")]
    output: Option<PathBuf>,

    /// TOML configuration file; flags below override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Minimum background, as a percentage of the true allele's reads, per direction.
    #[arg(short = 'm', long, value_name = "PCT")]
    min_pct: Option<f64>,

    /// Minimum background, as a number of reads, per direction.
    #[arg(short = 'n', long, value_name = "N")]
    min_abs: Option<u64>,

    /// Minimum number of samples required for each true allele.
    #[arg(short = 's', long, value_name = "N")]
    min_samples: Option<usize>,

    /// Minimum percentage of an allele's samples in which a background product must be seen.
    #[arg(short = 'S', long, value_name = "PCT")]
    min_sample_pct: Option<f64>,

    /// Only estimate profiles for this marker.
    #[arg(short = 'M', long)]
    marker: Option<String>,

    /// Indent the JSON output.
    #[arg(short = 't', long)]
    tidy: bool,

    /// Only use samples that are homozygous for the marker.
    #[arg(short = 'H', long)]
    homozygotes: bool,

    /// Simulate lower sequencing depth by keeping at most this many reads per sample.
    #[arg(short = 'R', long, value_name = "N")]
    limit_reads: Option<u64>,

    /// Randomly drop this fraction of the samples.
    #[arg(short = 'x', long, value_name = "FRACTION")]
    drop_samples: Option<f64>,

    /// Seed for read and sample down-sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// Also estimate (experimental) variance profiles.
    #[arg(long)]
    variance: bool,
}

impl Args {
    fn estimator_config(&self) -> Result<EstimatorConfig, PipelineError> {
        let mut config = match &self.config {
            Some(path) => EstimatorConfig::load(path)?,
            None => EstimatorConfig::default(),
        };

        if let Some(min_pct) = self.min_pct {
            config.detection.min_pct = min_pct;
        }
        if let Some(min_abs) = self.min_abs {
            config.detection.min_abs = min_abs;
        }
        if let Some(min_samples) = self.min_samples {
            config.min_samples = min_samples;
        }
        if let Some(min_sample_pct) = self.min_sample_pct {
            config.min_sample_pct = min_sample_pct;
        }
        if self.marker.is_some() {
            config.marker = self.marker.clone();
        }
        if self.limit_reads.is_some() {
            config.limit_reads = self.limit_reads;
        }
        if let Some(fraction) = self.drop_samples {
            config.drop_samples = fraction;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.homozygotes_only |= self.homozygotes;
        config.variance |= self.variance;

        config.validate()?;
        Ok(config)
    }
}

fn run(args: Args) -> Result<(), PipelineError> {
    let config = args.estimator_config()?;
    let samples = pipeline::load_inputs(
        &args.files,
        args.allele_list.as_deref(),
        args.annotation_column.as_deref(),
    )?;

    let nnls = ActiveSetNnls::default();
    let mut text_report = match &args.report {
        Some(path) => Some(TextReport::new(BufWriter::new(
            File::create(path).map_err(ReportError::Io)?,
        ))),
        None => None,
    };
    let mut noop = NoopSink;
    let sink: &mut dyn DiagnosticSink = match text_report.as_mut() {
        Some(report) => report,
        None => &mut noop,
    };

    let profiles = pipeline::estimate_profiles(samples, &config, &nnls, sink)?;

    if let Some(report) = text_report {
        report
            .into_inner()
            .flush()
            .map_err(ReportError::Io)?;
    }

    match &args.output {
        Some(path) => {
            let file = File::create(path).map_err(ReportError::Io)?;
            profiles.write_json(BufWriter::new(file), args.tidy)?;
        }
        None => profiles.write_json(io::stdout().lock(), args.tidy)?,
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    if let Err(e) = run(Args::parse()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
