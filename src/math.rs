//! Precision-aware math for grid sizing and fund accounting
//!
//! Everything in this module is pure and deterministic. All amounts that
//! cross the chain boundary are integers scaled by `10^precision`; float
//! comparisons against chain values must go through [`quantize`] first so
//! repeated conversions never drift.

use std::collections::BTreeMap;

use crate::consts::{MIN_SPREAD_FACTOR, MIN_SPREAD_ORDERS};
use crate::grid::types::SlotId;

/// `10^precision` as a float scale factor.
pub fn pow10(precision: u32) -> f64 {
    10f64.powi(precision as i32)
}

/// Convert a float amount to on-chain integer units, saturating at i64 range.
pub fn to_int(value: f64, precision: u32) -> i64 {
    (value * pow10(precision)).round() as i64
}

/// Convert on-chain integer units back to a float amount.
pub fn to_float(units: i64, precision: u32) -> f64 {
    units as f64 / pow10(precision)
}

/// Snap a float amount onto the chain's integer lattice.
pub fn quantize(value: f64, precision: u32) -> f64 {
    to_float(to_int(value, precision), precision)
}

/// Precision slack used by fund tolerance checks: `2 * 10^-p`.
pub fn precision_slack(precision: u32) -> f64 {
    to_float(crate::consts::PRECISION_SLACK_UNITS, precision)
}

/// Distribute `total` over `n` slots with geometric weights
/// `(1 - increment_factor)^(idx * weight)`.
///
/// With `reverse` the weight order is flipped so the largest share lands on
/// the last slot instead of the first. When `precision` is given the
/// allocation is carried out in integer units and the rounding remainder is
/// added to the largest share, so the quantized sum equals
/// `quantize(total, p)` exactly.
pub fn allocate_by_weights(
    total: f64,
    n: usize,
    weight: f64,
    increment_factor: f64,
    reverse: bool,
    precision: Option<u32>,
) -> Vec<f64> {
    if n == 0 || total <= 0.0 {
        return vec![0.0; n];
    }

    let base = (1.0 - increment_factor).max(f64::MIN_POSITIVE);
    let mut weights: Vec<f64> = (0..n).map(|i| base.powf(i as f64 * weight)).collect();
    if reverse {
        weights.reverse();
    }
    let weight_sum: f64 = weights.iter().sum();

    match precision {
        None => weights.iter().map(|w| total * w / weight_sum).collect(),
        Some(p) => {
            let total_units = to_int(total, p);
            let mut units: Vec<i64> = weights
                .iter()
                .map(|w| ((total_units as f64) * w / weight_sum).floor() as i64)
                .collect();

            let assigned: i64 = units.iter().sum();
            let remainder = total_units - assigned;
            if let Some(largest) = (0..n).max_by_key(|&i| units[i]) {
                units[largest] += remainder;
            }

            units.into_iter().map(|u| to_float(u, p)).collect()
        }
    }
}

/// Number of SPREAD placeholder slots needed to keep the bid-ask window at
/// `target_spread_percent`, given the grid increment.
///
/// The target spread is floored at `increment_percent * MIN_SPREAD_FACTOR`,
/// and the result never drops below `MIN_SPREAD_ORDERS`.
pub fn gap_slots(increment_percent: f64, target_spread_percent: f64) -> usize {
    let target = target_spread_percent.max(increment_percent * MIN_SPREAD_FACTOR);
    let steps = ((1.0 + target / 100.0).ln() / (1.0 + increment_percent / 100.0).ln()).ceil();
    let gap = steps as i64 - 1;
    gap.max(MIN_SPREAD_ORDERS as i64) as usize
}

/// Root-mean-square of the relative size deviation between a calculated
/// (ideal) sizing and the persisted sizing.
///
/// Slot ids present on only one side count as a full 1.0 deviation.
pub fn divergence_rms(
    calculated: &BTreeMap<SlotId, f64>,
    persisted: &BTreeMap<SlotId, f64>,
) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;

    for (id, ideal) in calculated {
        n += 1;
        match persisted.get(id) {
            Some(cur) if *ideal != 0.0 => {
                let rel = (cur - ideal) / ideal;
                sum += rel * rel;
            }
            _ => sum += 1.0,
        }
    }
    for id in persisted.keys() {
        if !calculated.contains_key(id) {
            n += 1;
            sum += 1.0;
        }
    }

    if n == 0 {
        0.0
    } else {
        (sum / n as f64).sqrt()
    }
}

/// Whether an order size is economically placeable.
///
/// Invalid when below the absolute minimum `min_factor * 10^-p`, below twice
/// the dust fraction of the ideal size, or when it rounds to zero integer
/// units.
pub fn order_size_valid(
    size: f64,
    precision: u32,
    min_factor: f64,
    ideal_size: Option<f64>,
    dust_pct: f64,
) -> bool {
    if size < min_factor * to_float(1, precision) {
        return false;
    }
    if let Some(ideal) = ideal_size {
        if size < 2.0 * (dust_pct / 100.0) * ideal {
            return false;
        }
    }
    to_int(size, precision) != 0
}

/// Price tolerance for matching an on-chain order back to a grid slot.
///
/// One integer unit of either asset moves the implied price by roughly this
/// much, so price comparisons within the tolerance are considered equal.
pub fn price_tolerance(
    price: f64,
    size_base: f64,
    precision_base: u32,
    size_quote: f64,
    precision_quote: u32,
) -> f64 {
    let base_term = 1.0 / (size_base * pow10(precision_base));
    let quote_term = 1.0 / (size_quote * pow10(precision_quote));
    (base_term + quote_term) * price
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_int_float_round_trip() {
        let v = 1.23456789;
        let q = quantize(v, 5);
        assert!((q - 1.23457).abs() < 1e-12);
        // Idempotent after one application
        assert_eq!(quantize(q, 5), q);
        assert_eq!(to_int(q, 5), to_int(quantize(q, 5), 5));
    }

    #[test]
    fn test_allocation_float_mode() {
        let shares = allocate_by_weights(100.0, 4, 1.0, 0.1, false, None);
        assert_eq!(shares.len(), 4);
        assert!((shares.iter().sum::<f64>() - 100.0).abs() < 1e-9);
        // Monotonically decreasing weights
        for w in shares.windows(2) {
            assert!(w[0] > w[1]);
        }
    }

    #[test]
    fn test_allocation_reverse() {
        let forward = allocate_by_weights(100.0, 4, 1.0, 0.1, false, None);
        let reversed = allocate_by_weights(100.0, 4, 1.0, 0.1, true, None);
        for (f, r) in forward.iter().zip(reversed.iter().rev()) {
            assert!((f - r).abs() < 1e-9);
        }
    }

    #[test]
    fn test_allocation_integer_conservation() {
        let shares = allocate_by_weights(99.9999, 7, 1.3, 0.01, false, Some(5));
        let sum: f64 = shares.iter().sum();
        assert!((quantize(sum, 5) - quantize(99.9999, 5)).abs() < 1e-12);
    }

    #[test]
    fn test_gap_slots() {
        // ceil(ln(1.02)/ln(1.01)) - 1 = 1
        assert_eq!(gap_slots(1.0, 2.0), 1);
        // Wide spread over a fine grid needs more placeholders:
        // ceil(ln(1.03)/ln(1.005)) - 1 = 5
        assert_eq!(gap_slots(0.5, 3.0), 5);
        // Floors at MIN_SPREAD_ORDERS even for degenerate targets
        assert_eq!(gap_slots(5.0, 0.1), MIN_SPREAD_ORDERS);
    }

    #[test]
    fn test_divergence_rms_matched() {
        let calc: BTreeMap<SlotId, f64> = [(0, 10.0), (1, 10.0)].into();
        let pers: BTreeMap<SlotId, f64> = [(0, 11.0), (1, 9.0)].into();
        let rms = divergence_rms(&calc, &pers);
        assert!((rms - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_divergence_rms_unmatched_counts_full() {
        let calc: BTreeMap<SlotId, f64> = [(0, 10.0)].into();
        let pers: BTreeMap<SlotId, f64> = [(1, 10.0)].into();
        let rms = divergence_rms(&calc, &pers);
        assert!((rms - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_order_size_valid() {
        // Below absolute minimum
        assert!(!order_size_valid(0.000001, 5, 1.0, None, 10.0));
        // Below dust floor relative to ideal
        assert!(!order_size_valid(0.1, 5, 1.0, Some(10.0), 10.0));
        // Healthy
        assert!(order_size_valid(5.0, 5, 1.0, Some(10.0), 10.0));
        // Rounds to zero integer units
        assert!(!order_size_valid(0.4 * to_float(1, 8), 8, 0.0, None, 0.0));
    }

    #[test]
    fn test_price_tolerance_scales_with_price() {
        let t1 = price_tolerance(100.0, 50.0, 5, 5000.0, 5);
        let t2 = price_tolerance(200.0, 50.0, 5, 5000.0, 5);
        assert!((t2 / t1 - 2.0).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_round_trip_idempotent(value in -1.0e6..1.0e6f64, precision in 0u32..9) {
            let once = quantize(value, precision);
            let twice = quantize(once, precision);
            prop_assert_eq!(once.to_bits(), twice.to_bits());
        }

        #[test]
        fn prop_allocation_conserves_total(
            total in 0.001..1.0e6f64,
            n in 1usize..40,
            weight in 0.1..3.0f64,
            inc in 0.0001..0.2f64,
            reverse in proptest::bool::ANY,
        ) {
            let precision = 5u32;
            let shares = allocate_by_weights(total, n, weight, inc, reverse, Some(precision));
            let sum_units: i64 = shares.iter().map(|s| to_int(*s, precision)).sum();
            prop_assert_eq!(sum_units, to_int(total, precision));
        }

        #[test]
        fn prop_gap_slots_at_least_minimum(inc in 0.01..10.0f64, spread in 0.0..30.0f64) {
            prop_assert!(gap_slots(inc, spread) >= MIN_SPREAD_ORDERS);
        }
    }
}
