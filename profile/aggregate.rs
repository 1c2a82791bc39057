//! # Evidence Aggregation
//!
//! Folds genotyped samples into per-marker evidence: a catalogue of every sequence
//! variant observed for the marker, the genotype of each sample as indices into that
//! catalogue, and the raw per-sample read counts in both directions.
//!
//! After all samples are in, background variants that are not recurrently detected
//! among the carriers of at least one true allele are dropped, and the catalogue is
//! reordered so that the true alleles occupy the leading positions.

use crate::config::DetectionThresholds;
use crate::types::{ReadPair, SampleRecord, Strand};
use ahash::AHashMap;
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AggregateError {
    #[error("Missing allele {allele} of marker {marker} in sample {sample}.")]
    MissingAllele {
        sample: String,
        marker: String,
        allele: String,
    },
    #[error(
        "Allele {allele} of marker {marker} in sample {sample} has 0 reads in at least one direction (forward {forward}, reverse {reverse})."
    )]
    ZeroReads {
        sample: String,
        marker: String,
        allele: String,
        forward: u64,
        reverse: u64,
    },
}

/// Accumulates genotyped samples for all markers.
#[derive(Debug)]
pub struct EvidenceAggregator {
    thresholds: DetectionThresholds,
    markers: Vec<MarkerAccumulator>,
    lookup: AHashMap<String, usize>,
}

impl EvidenceAggregator {
    pub fn new(thresholds: DetectionThresholds) -> Self {
        Self {
            thresholds,
            markers: Vec::new(),
            lookup: AHashMap::new(),
        }
    }

    pub fn num_markers(&self) -> usize {
        self.markers.len()
    }

    /// Admits one sample. The sample is validated in full before anything is
    /// accumulated, so a rejected sample leaves the aggregator untouched.
    pub fn add_sample(&mut self, sample: &SampleRecord) -> Result<(), AggregateError> {
        let reads = MergedReads::from_sample(sample);

        for (marker, alleles) in &sample.alleles {
            for allele in alleles {
                let pair = reads.get(marker, allele).ok_or_else(|| {
                    AggregateError::MissingAllele {
                        sample: sample.tag.clone(),
                        marker: marker.clone(),
                        allele: allele.clone(),
                    }
                })?;
                if pair.has_zero_direction() {
                    return Err(AggregateError::ZeroReads {
                        sample: sample.tag.clone(),
                        marker: marker.clone(),
                        allele: allele.clone(),
                        forward: pair.forward,
                        reverse: pair.reverse,
                    });
                }
            }
        }

        // Phase 1: register the true alleles and derive their detection thresholds.
        let mut participating: AHashMap<&str, (usize, Vec<AlleleThreshold>)> = AHashMap::new();
        for (marker, alleles) in &sample.alleles {
            if alleles.is_empty() {
                continue;
            }
            let slot = self.marker_slot(marker);
            let accumulator = &mut self.markers[slot];
            accumulator.begin_sample();

            let mut thresholds = Vec::with_capacity(alleles.len());
            for allele in alleles {
                let index = accumulator.variant_index(allele);
                if accumulator.genotypes.last().is_some_and(|g| g.contains(&index)) {
                    continue;
                }
                accumulator.establish(index);
                // Validated above.
                let pair = reads.get(marker, allele).copied().unwrap_or_default();
                thresholds.push(AlleleThreshold::new(index, pair, &self.thresholds));
            }
            participating.insert(marker.as_str(), (slot, thresholds));
        }

        // Phase 2: enter the reads and count detections per true allele.
        for (marker, sequence, pair) in reads.iter() {
            let Some((slot, thresholds)) = participating.get(marker) else {
                continue;
            };
            let accumulator = &mut self.markers[*slot];
            let index = accumulator.variant_index(sequence);
            accumulator.record(index, pair);
            for threshold in thresholds {
                if threshold.detects(pair) {
                    accumulator.count_detection(threshold.allele, index);
                }
            }
        }

        Ok(())
    }

    /// Applies the background-significance filter and returns the evidence per
    /// marker, in order of first appearance.
    pub fn finish(self, min_sample_pct: f64) -> Vec<MarkerEvidence> {
        self.markers
            .into_iter()
            .map(|accumulator| accumulator.into_evidence(min_sample_pct))
            .collect()
    }

    fn marker_slot(&mut self, marker: &str) -> usize {
        if let Some(&slot) = self.lookup.get(marker) {
            return slot;
        }
        let slot = self.markers.len();
        self.markers.push(MarkerAccumulator::new(marker));
        self.lookup.insert(marker.to_string(), slot);
        slot
    }
}

/// Reads of one sample with duplicate (marker, sequence) entries summed, in order of
/// first appearance.
struct MergedReads<'a> {
    entries: Vec<(&'a str, &'a str, ReadPair)>,
    positions: AHashMap<(&'a str, &'a str), usize>,
}

impl<'a> MergedReads<'a> {
    fn from_sample(sample: &'a SampleRecord) -> Self {
        let mut entries: Vec<(&str, &str, ReadPair)> = Vec::with_capacity(sample.reads.len());
        let mut positions: AHashMap<(&'a str, &'a str), usize> =
            AHashMap::with_capacity(sample.reads.len());
        for entry in &sample.reads {
            let key = (entry.marker.as_str(), entry.sequence.as_str());
            match positions.get(&key) {
                // Rows of the same sequence from several files of one sample add up.
                Some(&position) => {
                    let pair: &mut ReadPair = &mut entries[position].2;
                    pair.forward += entry.reads.forward;
                    pair.reverse += entry.reads.reverse;
                }
                None => {
                    positions.insert(key, entries.len());
                    entries.push((key.0, key.1, entry.reads));
                }
            }
        }
        Self { entries, positions }
    }

    fn get(&self, marker: &'a str, sequence: &'a str) -> Option<&ReadPair> {
        self.positions
            .get(&(marker, sequence))
            .map(|&position| &self.entries[position].2)
    }

    fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str, &ReadPair)> + '_ {
        self.entries
            .iter()
            .map(|(marker, sequence, pair)| (*marker, *sequence, pair))
    }
}

/// Per-direction minimum read count at which a variant counts as detected alongside
/// one particular true allele of a sample.
#[derive(Debug, Clone, Copy)]
struct AlleleThreshold {
    allele: usize,
    forward: u64,
    reverse: u64,
}

impl AlleleThreshold {
    fn new(allele: usize, reads: ReadPair, thresholds: &DetectionThresholds) -> Self {
        let relative = |count: u64| (count as f64 * thresholds.min_pct / 100.0).ceil() as u64;
        Self {
            allele,
            forward: relative(reads.forward).max(thresholds.min_abs),
            reverse: relative(reads.reverse).max(thresholds.min_abs),
        }
    }

    fn detects(&self, reads: &ReadPair) -> bool {
        reads.forward >= self.forward || reads.reverse >= self.reverse
    }
}

#[derive(Debug)]
struct MarkerAccumulator {
    name: String,
    catalogue: Vec<String>,
    positions: AHashMap<String, usize>,
    /// True alleles in the order they were first established.
    established: Vec<usize>,
    carriers: AHashMap<usize, usize>,
    /// Per true allele, the number of its carriers in which each variant was detected.
    recurrence: AHashMap<usize, Vec<usize>>,
    // Rows shorter than the catalogue read as zero beyond their end.
    forward: Vec<Vec<u64>>,
    reverse: Vec<Vec<u64>>,
    genotypes: Vec<Vec<usize>>,
}

impl MarkerAccumulator {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            catalogue: Vec::new(),
            positions: AHashMap::new(),
            established: Vec::new(),
            carriers: AHashMap::new(),
            recurrence: AHashMap::new(),
            forward: Vec::new(),
            reverse: Vec::new(),
            genotypes: Vec::new(),
        }
    }

    fn begin_sample(&mut self) {
        self.forward.push(Vec::new());
        self.reverse.push(Vec::new());
        self.genotypes.push(Vec::new());
    }

    fn variant_index(&mut self, sequence: &str) -> usize {
        if let Some(&index) = self.positions.get(sequence) {
            return index;
        }
        let index = self.catalogue.len();
        self.catalogue.push(sequence.to_string());
        self.positions.insert(sequence.to_string(), index);
        index
    }

    fn establish(&mut self, index: usize) {
        if !self.carriers.contains_key(&index) {
            self.established.push(index);
            self.recurrence.insert(index, Vec::new());
        }
        *self.carriers.entry(index).or_insert(0) += 1;
        if let Some(genotype) = self.genotypes.last_mut() {
            genotype.push(index);
        }
    }

    fn record(&mut self, index: usize, reads: &ReadPair) {
        for (rows, count) in [
            (&mut self.forward, reads.forward),
            (&mut self.reverse, reads.reverse),
        ] {
            if let Some(row) = rows.last_mut() {
                if row.len() <= index {
                    row.resize(index + 1, 0);
                }
                row[index] = count;
            }
        }
    }

    fn count_detection(&mut self, allele: usize, index: usize) {
        if let Some(counts) = self.recurrence.get_mut(&allele) {
            if counts.len() <= index {
                counts.resize(index + 1, 0);
            }
            counts[index] += 1;
        }
    }

    fn is_significant(&self, index: usize, min_sample_pct: f64) -> bool {
        self.established.iter().any(|allele| {
            let detections = self.recurrence[allele].get(index).copied().unwrap_or(0);
            let required = min_sample_pct * self.carriers[allele] as f64 / 100.0;
            detections as f64 >= required
        })
    }

    fn into_evidence(self, min_sample_pct: f64) -> MarkerEvidence {
        let mut order = self.established.clone();
        for index in 0..self.catalogue.len() {
            if !self.carriers.contains_key(&index) && self.is_significant(index, min_sample_pct) {
                order.push(index);
            }
        }

        let mut remap = vec![None; self.catalogue.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = Some(new);
        }

        let alleles: Vec<String> = order.iter().map(|&i| self.catalogue[i].clone()).collect();
        let genotypes: Vec<Vec<usize>> = self
            .genotypes
            .iter()
            .map(|genotype| genotype.iter().filter_map(|&i| remap[i]).collect())
            .collect();
        let to_matrix = |rows: &[Vec<u64>]| {
            Array2::from_shape_fn((rows.len(), order.len()), |(sample, k)| {
                rows[sample].get(order[k]).copied().unwrap_or(0) as f64
            })
        };

        log::info!(
            "Marker {}: {} true alleles, {} of {} variants retained across {} samples",
            self.name,
            self.established.len(),
            order.len(),
            self.catalogue.len(),
            self.genotypes.len()
        );

        MarkerEvidence {
            marker: self.name.clone(),
            true_alleles: self.established.len(),
            forward: to_matrix(self.forward.as_slice()),
            reverse: to_matrix(self.reverse.as_slice()),
            alleles,
            genotypes,
        }
    }
}

/// Aggregated evidence for one marker.
///
/// Invariants: the first `true_alleles` entries of `alleles` are the true alleles,
/// and every genotype index is below `true_alleles`.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerEvidence {
    pub marker: String,
    pub alleles: Vec<String>,
    pub true_alleles: usize,
    pub genotypes: Vec<Vec<usize>>,
    /// Raw read counts, one row per sample, one column per catalogued variant.
    pub forward: Array2<f64>,
    pub reverse: Array2<f64>,
}

impl MarkerEvidence {
    pub fn num_samples(&self) -> usize {
        self.genotypes.len()
    }

    pub fn num_variants(&self) -> usize {
        self.alleles.len()
    }

    pub fn observations(&self, strand: Strand) -> ArrayView2<'_, f64> {
        match strand {
            Strand::Forward => self.forward.view(),
            Strand::Reverse => self.reverse.view(),
        }
    }

    pub fn evidence_matrix(&self, strand: Strand) -> EvidenceMatrix {
        accumulate_evidence(
            self.observations(strand),
            &self.genotypes,
            self.true_alleles,
        )
    }
}

/// The accumulated, reference-rescaled evidence matrix `C` (true alleles × variants).
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceMatrix {
    pub matrix: Array2<f64>,
    /// `(sample, allele)` pairs left out because the allele had no reads.
    pub skipped: Vec<(usize, usize)>,
}

/// Sums every sample into the rows of its true alleles, rescaled such that the allele
/// reads exactly `100 / (alleles in the sample)` at its own column.
pub fn accumulate_evidence(
    observations: ArrayView2<f64>,
    genotypes: &[Vec<usize>],
    true_alleles: usize,
) -> EvidenceMatrix {
    let mut matrix = Array2::<f64>::zeros((true_alleles, observations.ncols()));
    let mut skipped = Vec::new();

    for (sample, genotype) in genotypes.iter().enumerate() {
        let row = observations.row(sample);
        for &allele in genotype {
            let reference = row[allele];
            if reference == 0.0 {
                skipped.push((sample, allele));
                continue;
            }
            let scale = 100.0 / reference / genotype.len() as f64;
            matrix.row_mut(allele).scaled_add(scale, &row);
        }
    }

    EvidenceMatrix { matrix, skipped }
}
