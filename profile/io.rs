//! # Sample and Allele-List Input
//!
//! Reads tab-separated sample files and allele lists into `SampleRecord`s.
//!
//! - Sample files carry one row per observed sequence with the columns `name`
//!   (marker), `allele` (sequence), `forward` and `reverse`. An optional annotation
//!   column marks true alleles with values starting with `ALLELE`.
//! - The sample tag is the file name up to its first dot; files that share a tag
//!   are merged into one sample.
//! - Allele lists have the columns `sample`, `marker` and `allele`, where the allele
//!   field may hold several comma-separated sequences.

use crate::types::{ReadPair, SampleRecord};
use csv::{Reader, ReaderBuilder, StringRecord};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Tag → marker → true alleles.
pub type AlleleList = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to read '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("The required column '{column}' was not found in '{path}'.")]
    ColumnNotFound { path: PathBuf, column: String },
    #[error("Invalid read count '{value}' in column '{column}' of '{path}', line {line}.")]
    InvalidCount {
        path: PathBuf,
        line: u64,
        column: &'static str,
        value: String,
    },
    #[error("No sample files were given.")]
    NoInput,
}

/// The file name without any extensions.
pub fn sample_tag(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_default();
    match name.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

/// Loads all sample files, merging files with the same tag. Samples are returned
/// in order of first appearance.
pub fn load_samples(
    paths: &[PathBuf],
    annotation_column: Option<&str>,
) -> Result<Vec<SampleRecord>, InputError> {
    if paths.is_empty() {
        return Err(InputError::NoInput);
    }

    let mut samples: Vec<SampleRecord> = Vec::new();
    for path in paths {
        let tag = sample_tag(path);
        let index = match samples.iter().position(|sample| sample.tag == tag) {
            Some(index) => index,
            None => {
                samples.push(SampleRecord::new(&tag));
                samples.len() - 1
            }
        };
        let rows = read_sample_file(path, annotation_column, &mut samples[index])?;
        log::debug!("Read {rows} rows for sample {tag} from {}", path.display());
    }

    log::info!("Loaded {} samples from {} files", samples.len(), paths.len());
    Ok(samples)
}

/// Appends the rows of one sample file to `sample`. Returns the number of rows read.
pub fn read_sample_file(
    path: &Path,
    annotation_column: Option<&str>,
    sample: &mut SampleRecord,
) -> Result<usize, InputError> {
    let (mut reader, headers) = open_table(path)?;
    let marker_col = required_column(path, &headers, "name")?;
    let allele_col = required_column(path, &headers, "allele")?;
    let forward_col = required_column(path, &headers, "forward")?;
    let reverse_col = required_column(path, &headers, "reverse")?;
    let annotation_col = annotation_column.and_then(|name| {
        let found = headers.iter().position(|header| header == name);
        if found.is_none() {
            log::debug!("{} has no annotation column '{name}'", path.display());
        }
        found
    });

    let mut rows = 0;
    for result in reader.records() {
        let record = result.map_err(|source| csv_error(path, source))?;
        if record.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        let marker = field(&record, marker_col);
        let allele = field(&record, allele_col);
        let reads = ReadPair::new(
            parse_count(path, &record, forward_col, "forward")?,
            parse_count(path, &record, reverse_col, "reverse")?,
        );
        sample.push_reads(marker, allele, reads);

        if let Some(col) = annotation_col {
            if field(&record, col).starts_with("ALLELE") {
                sample.add_allele(marker, allele);
            }
        }
        rows += 1;
    }
    Ok(rows)
}

/// Reads an allele list. Repeated lines for the same sample and marker accumulate.
pub fn read_allele_list(path: &Path) -> Result<AlleleList, InputError> {
    let (mut reader, headers) = open_table(path)?;
    let sample_col = required_column(path, &headers, "sample")?;
    let marker_col = required_column(path, &headers, "marker")?;
    let allele_col = required_column(path, &headers, "allele")?;

    let mut list = AlleleList::new();
    for result in reader.records() {
        let record = result.map_err(|source| csv_error(path, source))?;
        let tag = field(&record, sample_col);
        let marker = field(&record, marker_col);
        if tag.is_empty() || marker.is_empty() {
            continue;
        }
        let alleles = list
            .entry(tag.to_string())
            .or_default()
            .entry(marker.to_string())
            .or_default();
        for allele in field(&record, allele_col)
            .split(',')
            .map(str::trim)
            .filter(|allele| !allele.is_empty())
        {
            if !alleles.iter().any(|known| known == allele) {
                alleles.push(allele.to_string());
            }
        }
    }
    Ok(list)
}

/// Adds the alleles of `list` to the matching samples. Entries for unknown tags are
/// ignored.
pub fn apply_allele_list(samples: &mut [SampleRecord], list: &AlleleList) {
    for sample in samples {
        let Some(markers) = list.get(&sample.tag) else {
            continue;
        };
        for (marker, alleles) in markers {
            for allele in alleles {
                sample.add_allele(marker, allele);
            }
        }
    }
}

fn csv_error(path: &Path, source: csv::Error) -> InputError {
    InputError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

fn open_table(path: &Path) -> Result<(Reader<File>, StringRecord), InputError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .map_err(|source| csv_error(path, source))?;
    let headers = reader
        .headers()
        .map_err(|source| csv_error(path, source))?
        .clone();
    Ok((reader, headers))
}

fn required_column(path: &Path, headers: &StringRecord, name: &str) -> Result<usize, InputError> {
    headers
        .iter()
        .position(|header| header == name)
        .ok_or_else(|| InputError::ColumnNotFound {
            path: path.to_path_buf(),
            column: name.to_string(),
        })
}

fn field(record: &StringRecord, index: usize) -> &str {
    record.get(index).unwrap_or("").trim()
}

fn parse_count(
    path: &Path,
    record: &StringRecord,
    index: usize,
    column: &'static str,
) -> Result<u64, InputError> {
    let value = field(record, index);
    value.parse::<u64>().map_err(|_| InputError::InvalidCount {
        path: path.to_path_buf(),
        line: record.position().map_or(0, |position| position.line()),
        column,
        value: value.to_string(),
    })
}
