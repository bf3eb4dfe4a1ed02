//! Deterministic weighted bucketing for experiment stickiness.
//!
//! The hash construction is part of the wire contract: every SDK
//! implementation must assign the same variant to the same
//! `(experiment, stickiness key)` pair. Hence the fixed hash function,
//! endianness, modulus and walk order below.

use md5::{Digest, Md5};

const BUCKET_PRECISION: u32 = 10_000;

/// Maps a stickiness key into `[0, 1)`.
///
/// `MD5(experiment_id ++ "." ++ key)`, first four digest bytes read
/// big-endian as a `u32`, reduced modulo 10 000.
pub fn bucket_unit(experiment_id: &str, stickiness_key: &str) -> f64 {
    let mut hasher = Md5::new();
    hasher.update(experiment_id.as_bytes());
    hasher.update(b".");
    hasher.update(stickiness_key.as_bytes());
    let digest = hasher.finalize();
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (hash % BUCKET_PRECISION) as f64 / BUCKET_PRECISION as f64
}

/// Picks the first variant, in configuration order, whose cumulative weight
/// exceeds the key's bucket unit. Returns `None` when the weights do not
/// cover the unit (malformed configuration).
pub fn get_bucket(
    experiment_id: &str,
    stickiness_key: &str,
    variants: &[(String, f64)],
) -> Option<String> {
    let unit = bucket_unit(experiment_id, stickiness_key);
    let mut cumulative = 0.0;
    for (label, weight) in variants {
        cumulative += weight;
        if unit < cumulative {
            return Some(label.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variants(weights: &[(&str, f64)]) -> Vec<(String, f64)> {
        weights
            .iter()
            .map(|(label, weight)| (label.to_string(), *weight))
            .collect()
    }

    #[test]
    fn bucket_is_stable_across_invocations() {
        let split = variants(&[("A", 0.5), ("B", 0.5)]);
        let first = get_bucket("exp1", "user-42", &split);
        for _ in 0..100 {
            assert_eq!(get_bucket("exp1", "user-42", &split), first);
        }
    }

    #[test]
    fn different_experiments_bucket_independently() {
        let split = variants(&[("A", 0.5), ("B", 0.5)]);
        let mut differs = false;
        for i in 0..64 {
            let key = format!("user-{i}");
            if get_bucket("exp1", &key, &split) != get_bucket("exp2", &key, &split) {
                differs = true;
                break;
            }
        }
        assert!(differs, "seeding by experiment id had no effect");
    }

    #[test]
    fn full_weight_always_selects() {
        let single = variants(&[("only", 1.0)]);
        for i in 0..256 {
            assert_eq!(
                get_bucket("exp", &format!("key-{i}"), &single).as_deref(),
                Some("only")
            );
        }
    }

    #[test]
    fn observed_frequencies_track_weights() {
        let split = variants(&[("a", 0.2), ("b", 0.3), ("c", 0.5)]);
        let mut counts = [0u32; 3];
        let total = 100_000;
        for i in 0..total {
            match get_bucket("freq-exp", &format!("user-{i}"), &split).as_deref() {
                Some("a") => counts[0] += 1,
                Some("b") => counts[1] += 1,
                Some("c") => counts[2] += 1,
                other => panic!("unexpected bucket {other:?}"),
            }
        }
        for (count, weight) in counts.iter().zip([0.2, 0.3, 0.5]) {
            let observed = *count as f64 / total as f64;
            assert!(
                (observed - weight).abs() < 0.01,
                "observed {observed} for weight {weight}"
            );
        }
    }
}
