// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::collections::BTreeMap;
use std::fmt;

/// Read direction. Each direction is solved as an independent problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub const BOTH: [Strand; 2] = [Strand::Forward, Strand::Reverse];

    pub fn describe(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Forward and reverse read counts of one sequence in one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadPair {
    pub forward: u64,
    pub reverse: u64,
}

impl ReadPair {
    pub fn new(forward: u64, reverse: u64) -> Self {
        Self { forward, reverse }
    }

    #[inline]
    pub fn get_mut(&mut self, strand: Strand) -> &mut u64 {
        match strand {
            Strand::Forward => &mut self.forward,
            Strand::Reverse => &mut self.reverse,
        }
    }

    pub fn total(&self) -> u64 {
        self.forward + self.reverse
    }

    /// A true allele must have reads in both directions to act as a rescaling reference.
    pub fn has_zero_direction(&self) -> bool {
        self.forward == 0 || self.reverse == 0
    }
}

/// Reads observed for one sequence of one marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceReads {
    pub marker: String,
    pub sequence: String,
    pub reads: ReadPair,
}

impl SequenceReads {
    pub fn new(marker: &str, sequence: &str, reads: ReadPair) -> Self {
        Self {
            marker: marker.to_string(),
            sequence: sequence.to_string(),
            reads,
        }
    }
}

/// Everything known about one sample: its observed reads (in input order) and, per
/// marker, the sequences established as its true alleles.
#[derive(Debug, Clone, Default)]
pub struct SampleRecord {
    pub tag: String,
    pub reads: Vec<SequenceReads>,
    pub alleles: BTreeMap<String, Vec<String>>,
}

impl SampleRecord {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    pub fn push_reads(&mut self, marker: &str, sequence: &str, reads: ReadPair) {
        self.reads.push(SequenceReads::new(marker, sequence, reads));
    }

    /// Declares `sequence` a true allele of `marker`. Repeated declarations collapse.
    pub fn add_allele(&mut self, marker: &str, sequence: &str) {
        let alleles = self.alleles.entry(marker.to_string()).or_default();
        if !alleles.iter().any(|allele| allele == sequence) {
            alleles.push(sequence.to_string());
        }
    }

    pub fn total_reads(&self) -> u64 {
        self.reads.iter().map(|entry| entry.reads.total()).sum()
    }
}
