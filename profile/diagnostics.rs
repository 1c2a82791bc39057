use crate::types::Strand;
use std::fmt;
use std::io::Write;

/// Caveat attached to every variance estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VarianceCaveat {
    /// Every sample was homozygous; values are population variances.
    PopulationVariance,
    /// Heterozygous samples were involved; values only indicate dispersion.
    DescriptiveDispersion,
}

impl VarianceCaveat {
    pub fn for_genotypes(genotypes: &[Vec<usize>]) -> Self {
        if genotypes.iter().all(|genotype| genotype.len() <= 1) {
            Self::PopulationVariance
        } else {
            Self::DescriptiveDispersion
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::PopulationVariance => {
                "EXPERIMENTAL: the values produced are population variances. \
                 This may change to sample variance in a future version. Use with care."
            }
            Self::DescriptiveDispersion => {
                "EXPERIMENTAL: the values produced may give a sense of the amount of variation, \
                 but should not be used in further computations that expect true variances."
            }
        }
    }
}

impl fmt::Display for VarianceCaveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Progress and anomalies reported while estimating profiles.
#[derive(Clone, Debug, PartialEq)]
pub enum SolverEvent<'a> {
    MarkerStart {
        marker: &'a str,
        true_alleles: usize,
        variants: usize,
        samples: usize,
    },
    MarkerSolved {
        marker: &'a str,
        seconds: f64,
    },
    StrandStart(Strand),
    /// One outer iteration of the alternating least-squares loop.
    Iteration {
        iteration: usize,
        residual: f64,
        previous: Option<f64>,
    },
    DegenerateAllele {
        iteration: usize,
        allele: usize,
    },
    /// A sample's true allele had no reads to rescale by.
    SkippedSample {
        sample: usize,
        allele: usize,
    },
    NotConverged {
        iterations: usize,
        residual: f64,
    },
    VarianceStart(VarianceCaveat),
    Message(&'a str),
}

impl fmt::Display for SolverEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarkerStart {
                marker,
                true_alleles,
                variants,
                samples,
            } => write!(
                f,
                "Solving marker {marker} with n={true_alleles}, m={variants}, k={samples}"
            ),
            Self::MarkerSolved { marker, seconds } => {
                write!(f, "Solved marker {marker} in {seconds:.6} seconds")
            }
            Self::StrandStart(strand) => write!(f, "Solving {strand} read profiles"),
            Self::Iteration {
                iteration,
                residual,
                previous: None,
            } => write!(f, "{iteration:4} {residual:15.6}"),
            Self::Iteration {
                iteration,
                residual,
                previous: Some(previous),
            } => {
                let delta = previous - residual;
                write!(
                    f,
                    "{iteration:4} {residual:15.6} {delta:15.6} {:6.2}",
                    100.0 * delta / previous
                )
            }
            Self::DegenerateAllele { iteration, allele } => write!(
                f,
                "{iteration:4} - No samples appear to have allele {allele}"
            ),
            Self::SkippedSample { sample, allele } => {
                write!(f, "Sample {sample} does not have allele {allele}")
            }
            Self::NotConverged {
                iterations,
                residual,
            } => write!(
                f,
                "Stopped after {iterations} iterations without converging (residual {residual:.6})"
            ),
            Self::VarianceStart(caveat) => write!(f, "Computing variances...\n{caveat}"),
            Self::Message(message) => f.write_str(message),
        }
    }
}

/// Observer for solver progress. Nothing the solver computes depends on what a sink
/// does with the events it receives.
pub trait DiagnosticSink {
    fn record(&mut self, event: &SolverEvent<'_>) {
        let _ = event;
    }
}

#[derive(Default)]
pub struct NoopSink;

impl DiagnosticSink for NoopSink {}

/// Writes one line per event to an append-only text stream.
pub struct TextReport<W: Write> {
    writer: W,
    failed: bool,
}

impl<W: Write> TextReport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
        }
    }

    pub fn write_line(&mut self, line: &str) {
        if self.failed {
            return;
        }
        if let Err(err) = writeln!(self.writer, "{line}") {
            log::warn!("Diagnostic report is no longer writable: {err}");
            self.failed = true;
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> DiagnosticSink for TextReport<W> {
    fn record(&mut self, event: &SolverEvent<'_>) {
        self.write_line(&event.to_string());
    }
}

/// Collects report lines in memory so that markers solved on different threads can
/// be written out in a deterministic order afterwards.
#[derive(Default, Debug)]
pub struct ReportBuffer {
    lines: Vec<String>,
}

impl ReportBuffer {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Forwards every collected line, in order, to another sink.
    pub fn replay_into(self, sink: &mut dyn DiagnosticSink) {
        for line in &self.lines {
            sink.record(&SolverEvent::Message(line));
        }
    }
}

impl DiagnosticSink for ReportBuffer {
    fn record(&mut self, event: &SolverEvent<'_>) {
        self.lines.push(event.to_string());
    }
}
