//! Serializable profile output, keyed by marker name.

use crate::aggregate::MarkerEvidence;
use crate::solver::{MarkerFit, StrandFit};
use ndarray::Array2;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::{self, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write profile report: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to serialize profile report: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rounds to three decimals; negative zero becomes zero.
pub fn round3(value: f64) -> f64 {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == 0.0 { 0.0 } else { rounded }
}

fn rounded_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|&v| round3(v)).collect())
        .collect()
}

/// Rounded profiles (and optionally variances) of one marker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MarkerProfile {
    #[serde(rename = "true alleles")]
    pub true_alleles: usize,
    pub alleles: Vec<String>,
    pub profiles_forward: Vec<Vec<f64>>,
    pub profiles_reverse: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variances_forward: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variances_reverse: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variance_caveat: Option<String>,
}

impl MarkerProfile {
    pub fn from_fit(evidence: &MarkerEvidence, fit: &MarkerFit) -> Self {
        let variances = |strand: &StrandFit| strand.variances.as_ref().map(rounded_rows);
        Self {
            true_alleles: evidence.true_alleles,
            alleles: evidence.alleles.clone(),
            profiles_forward: rounded_rows(&fit.forward.profiles),
            profiles_reverse: rounded_rows(&fit.reverse.profiles),
            variances_forward: variances(&fit.forward),
            variances_reverse: variances(&fit.reverse),
            variance_caveat: fit.variance_caveat.map(|caveat| caveat.to_string()),
        }
    }
}

/// All marker profiles of a run, kept in natural order of marker name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileReport {
    markers: Vec<(String, MarkerProfile)>,
}

impl ProfileReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the profile of `marker`.
    pub fn insert(&mut self, marker: &str, profile: MarkerProfile) {
        match self
            .markers
            .binary_search_by(|(name, _)| marker_order(name, marker))
        {
            Ok(index) => self.markers[index].1 = profile,
            Err(index) => self.markers.insert(index, (marker.to_string(), profile)),
        }
    }

    pub fn get(&self, marker: &str) -> Option<&MarkerProfile> {
        self.markers
            .binary_search_by(|(name, _)| marker_order(name, marker))
            .ok()
            .map(|index| &self.markers[index].1)
    }

    pub fn markers(&self) -> impl Iterator<Item = &str> {
        self.markers.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// Writes the report as one JSON object. `tidy` indents by two spaces.
    pub fn write_json<W: Write>(&self, mut writer: W, tidy: bool) -> Result<(), ReportError> {
        if tidy {
            serde_json::to_writer_pretty(&mut writer, self)?;
        } else {
            serde_json::to_writer(&mut writer, self)?;
        }
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}

// Natural order, with a plain comparison as tie-breaker so distinct names never
// compare equal.
fn marker_order(a: &str, b: &str) -> Ordering {
    natord::compare(a, b).then_with(|| a.cmp(b))
}

impl Serialize for ProfileReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.markers.len()))?;
        for (marker, profile) in &self.markers {
            map.serialize_entry(marker, profile)?;
        }
        map.end()
    }
}
