//! Fill-batch planning
//!
//! Small fill sets rebalance in one pass; oversized sets are broken into
//! adaptive chunks so a burst of fills cannot produce one enormous
//! transaction. Tail balancing keeps the last chunk from degenerating into
//! a singleton, which would waste a whole broadcast round-trip on one fill.

use crate::consts::{BATCH_STRESS_TIERS, MAX_FILL_BATCH_SIZE};

/// Chunk sizes for processing `total` resolved fills.
pub fn plan_batches(total: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    if total <= MAX_FILL_BATCH_SIZE {
        return vec![total];
    }

    let chunk = BATCH_STRESS_TIERS
        .iter()
        .find(|(min, _)| total >= *min)
        .map(|(_, chunk)| *chunk)
        .unwrap_or(MAX_FILL_BATCH_SIZE);

    let mut sizes = vec![chunk; total / chunk];
    let remainder = total % chunk;
    if remainder == 1 {
        // Borrow one from the previous chunk instead of a singleton tail
        if let Some(last) = sizes.last_mut() {
            *last -= 1;
        }
        sizes.push(2);
    } else if remainder > 0 {
        sizes.push(remainder);
    }
    sizes
}

/// Split a slice according to [`plan_batches`].
pub fn chunk_fills<T: Clone>(fills: &[T]) -> Vec<Vec<T>> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    for size in plan_batches(fills.len()) {
        chunks.push(fills[offset..offset + size].to_vec());
        offset += size;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_batches_stay_unified() {
        assert!(plan_batches(0).is_empty());
        assert_eq!(plan_batches(1), vec![1]);
        assert_eq!(plan_batches(MAX_FILL_BATCH_SIZE), vec![MAX_FILL_BATCH_SIZE]);
    }

    #[test]
    fn test_chunking_conserves_total() {
        for total in 0..200 {
            let sizes = plan_batches(total);
            assert_eq!(sizes.iter().sum::<usize>(), total, "total {total}");
        }
    }

    #[test]
    fn test_no_singleton_tails() {
        for total in 2..200 {
            let sizes = plan_batches(total);
            assert!(
                sizes.iter().all(|s| *s != 1),
                "singleton chunk for total {total}: {sizes:?}"
            );
        }
    }

    #[test]
    fn test_stress_tiers_pick_larger_chunks() {
        // Moderate bursts use the mid tier, big bursts the top tier
        assert!(plan_batches(13).iter().all(|s| *s <= 6));
        assert!(plan_batches(32).contains(&8));
    }

    #[test]
    fn test_chunk_fills_preserves_order() {
        let fills: Vec<u32> = (0..17).collect();
        let chunks = chunk_fills(&fills);
        let flat: Vec<u32> = chunks.into_iter().flatten().collect();
        assert_eq!(flat, fills);
    }
}
