//! Random thinning used to simulate shallower sequencing or smaller studies.

use crate::types::{SampleRecord, Strand};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

/// A seeded generator when `seed` is given, an entropy-seeded one otherwise.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Removes reads uniformly at random, without replacement, until the sample holds
/// at most `limit` reads over all sequences and both directions.
pub fn reduce_read_counts<R: Rng + ?Sized>(sample: &mut SampleRecord, limit: u64, rng: &mut R) {
    let total = sample.total_reads();
    if total <= limit {
        return;
    }

    let mut remove = index::sample(rng, total as usize, (total - limit) as usize).into_vec();
    remove.sort_unstable();

    let mut next = 0;
    let mut seen = 0_usize;
    for entry in &mut sample.reads {
        for strand in Strand::BOTH {
            let count = entry.reads.get_mut(strand);
            seen += *count as usize;
            while next < remove.len() && remove[next] < seen {
                *count -= 1;
                next += 1;
            }
        }
    }
    log::debug!(
        "Reduced sample {} from {total} to {} reads",
        sample.tag,
        sample.total_reads()
    );
}

/// Drops `floor(len × fraction)` randomly chosen samples and returns their tags.
pub fn drop_samples<R: Rng + ?Sized>(
    samples: &mut Vec<SampleRecord>,
    fraction: f64,
    rng: &mut R,
) -> Vec<String> {
    let count = (samples.len() as f64 * fraction).floor() as usize;
    if count == 0 {
        return Vec::new();
    }

    let mut drop = vec![false; samples.len()];
    for i in index::sample(rng, samples.len(), count) {
        drop[i] = true;
    }

    let mut dropped = Vec::with_capacity(count);
    let mut position = 0;
    samples.retain(|sample| {
        let keep = !drop[position];
        position += 1;
        if !keep {
            dropped.push(sample.tag.clone());
        }
        keep
    });
    dropped
}
