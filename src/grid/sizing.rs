//! Weighted sizing of a grid rail
//!
//! Sizes are always expressed in the base asset, matching `GridSlot::size`.
//! The buy side's budget arrives in quote units and is allocated in quote,
//! then converted per slot through its price.

use std::collections::BTreeMap;

use crate::chain::types::AssetPair;
use crate::math;

use super::model::Grid;
use super::types::{PerSide, Side, SlotId};

/// Ideal base-asset size per slot for one rail.
pub type SideSizing = BTreeMap<SlotId, f64>;

/// Compute the ideal sizing of `side` from `budget`.
///
/// `budget` is denominated in the side's own asset (quote for BUY, base for
/// SELL). A network-fee reserve proportional to the total active order count
/// is deducted up front. BUY allocates in reverse so the largest order sits
/// nearest the market; SELL allocates forward.
pub fn size_side(
    grid: &Grid,
    pair: &AssetPair,
    side: Side,
    budget: f64,
    weight: f64,
    increment_percent: f64,
    fee_reserve_per_order: f64,
    active_counts: PerSide<usize>,
) -> SideSizing {
    let slot_ids: Vec<SlotId> = grid.rail(side).map(|s| s.id).collect();
    if slot_ids.is_empty() {
        return SideSizing::new();
    }

    let reserved = fee_reserve_per_order * (active_counts.buy + active_counts.sell) as f64;
    let budget = (budget - reserved).max(0.0);

    let precision = pair.asset_for(side).precision;
    let shares = math::allocate_by_weights(
        budget,
        slot_ids.len(),
        weight,
        increment_percent / 100.0,
        side == Side::Buy,
        Some(precision),
    );

    slot_ids
        .into_iter()
        .zip(shares)
        .map(|(id, share)| {
            let size = match side {
                Side::Sell => share,
                // Quote allocation -> base size through the slot price
                Side::Buy => {
                    let price = grid.slot(id).map(|s| s.price).unwrap_or(1.0);
                    math::quantize(share / price, pair.base.precision)
                }
            };
            (id, size)
        })
        .collect()
}

/// Current committed sizes of a rail, keyed by slot id. Only on-chain slots
/// participate; virtual placeholders carry no size to compare.
pub fn persisted_sizes(grid: &Grid, side: Side) -> SideSizing {
    grid.rail(side)
        .filter(|s| s.is_on_chain())
        .map(|s| (s.id, s.size))
        .collect()
}
