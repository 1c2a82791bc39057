//! Genotype selection applied before aggregation.

use crate::types::SampleRecord;
use std::collections::{BTreeMap, BTreeSet};

/// Keeps only the genotypes of `marker`.
pub fn restrict_to_marker(samples: &mut [SampleRecord], marker: &str) {
    for sample in samples {
        sample.alleles.retain(|name, _| name == marker);
    }
}

/// Discards every marker genotype with more than one true allele.
pub fn homozygotes_only(samples: &mut [SampleRecord]) {
    for sample in samples {
        sample.alleles.retain(|_, alleles| alleles.len() <= 1);
    }
}

/// Drops, per marker, the genotype of every sample carrying a true allele that is
/// seen in fewer than `min_samples` samples. Dropping a genotype may make another
/// allele rare, so this repeats until no rare allele is left.
///
/// Returns the number of genotypes dropped.
pub fn ensure_min_samples(samples: &mut [SampleRecord], min_samples: usize) -> usize {
    if min_samples <= 1 {
        return 0;
    }

    let markers: BTreeSet<String> = samples
        .iter()
        .flat_map(|sample| sample.alleles.keys().cloned())
        .collect();

    let mut dropped = 0;
    for marker in &markers {
        let mut carriers: BTreeMap<String, usize> = BTreeMap::new();
        for alleles in samples.iter().filter_map(|sample| sample.alleles.get(marker)) {
            for allele in alleles {
                *carriers.entry(allele.clone()).or_default() += 1;
            }
        }

        while let Some(rare) = rare_allele(&carriers, min_samples) {
            for sample in samples.iter_mut() {
                let carries = sample
                    .alleles
                    .get(marker)
                    .is_some_and(|alleles| alleles.contains(&rare));
                if !carries {
                    continue;
                }
                if let Some(alleles) = sample.alleles.remove(marker) {
                    for allele in alleles {
                        if let Some(count) = carriers.get_mut(&allele) {
                            *count -= 1;
                        }
                    }
                }
                log::debug!(
                    "Dropping marker {marker} of sample {}: allele {rare} is seen in fewer than {min_samples} samples",
                    sample.tag
                );
                dropped += 1;
            }
        }
    }

    dropped
}

fn rare_allele(carriers: &BTreeMap<String, usize>, min_samples: usize) -> Option<String> {
    carriers
        .iter()
        .find(|&(_, &count)| count > 0 && count < min_samples)
        .map(|(allele, _)| allele.clone())
}
