//! Symmetric grid rebalancing strategy
//!
//! The rebalancer turns a batch of resolved fills into a `CowPlan`: a
//! boundary shift plus CREATE actions that restore the inventory posture on
//! the opposite rail. Chain-driven facts (fills reducing or clearing slots)
//! are applied to the master by the pipeline before the plan is computed;
//! the plan only ever contains operations the engine itself must broadcast.

use std::collections::HashSet;

use log::{debug, warn};

use crate::config::BotConfig;
use crate::grid::model::Grid;
use crate::grid::sizing::SideSizing;
use crate::grid::types::{PerSide, Side, SlotId, SlotState};
use crate::grid::working::{Action, CowPlan};
use crate::math;

/// A fill resolved to its grid slot, ready for rebalancing.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledOrder {
    pub slot_id: SlotId,
    pub side: Side,
    /// Base-asset amount filled by this event.
    pub filled_size: f64,
    /// Base-asset amount still resting (0 for a full fill).
    pub remaining: f64,
    pub is_full: bool,
    pub is_maker: bool,
}

/// Computes rebalance plans from resolved fills.
pub struct Rebalancer<'a> {
    grid: &'a Grid,
    config: &'a BotConfig,
    /// Ideal per-slot sizes from the last sizing pass.
    ideal_sizes: &'a PerSide<SideSizing>,
}

impl<'a> Rebalancer<'a> {
    pub fn new(
        grid: &'a Grid,
        config: &'a BotConfig,
        ideal_sizes: &'a PerSide<SideSizing>,
    ) -> Self {
        Self {
            grid,
            config,
            ideal_sizes,
        }
    }

    /// Produce the rebalance plan for a batch of fills.
    ///
    /// Order ids in `exclude` (the shadow set) are in flight elsewhere, so
    /// any slot still referencing one of them is not a valid CREATE target.
    pub fn process_filled_orders(
        &self,
        batch: &[FilledOrder],
        exclude: &HashSet<String>,
    ) -> CowPlan {
        let n = self.grid.len();
        if n == 0 || batch.is_empty() {
            return CowPlan::default();
        }

        // Full fills walk the boundary; partials leave it alone.
        let mut boundary = self.grid.boundary_idx;
        for fill in batch.iter().filter(|f| f.is_full) {
            boundary = match fill.side {
                Side::Sell => (boundary + 1).min(n - 1),
                Side::Buy => boundary.saturating_sub(1),
            };
        }

        let mut actions = Vec::new();
        let mut claimed: HashSet<SlotId> = HashSet::new();

        for fill in batch.iter().filter(|f| f.is_full) {
            let opposite = fill.side.opposite();
            let Some(target) = self.pick_target(opposite, boundary, exclude, &claimed) else {
                warn!(
                    "no free {:?} slot to rotate fill on slot {} into",
                    opposite, fill.slot_id
                );
                continue;
            };

            let Some(size) = self.size_for(opposite, target, fill) else {
                debug!(
                    "skipping rotation into slot {target}: size below dust limits"
                );
                continue;
            };

            let price = match self.grid.slot(target) {
                Some(slot) => slot.price,
                None => continue,
            };

            claimed.insert(target);
            actions.push(Action::Create {
                slot_id: target,
                side: opposite,
                price,
                size,
            });
        }

        CowPlan {
            actions,
            boundary_idx: Some(boundary),
        }
    }

    /// First unoccupied slot of `side`, scanning inward-out from the
    /// boundary window.
    fn pick_target(
        &self,
        side: Side,
        boundary: usize,
        exclude: &HashSet<String>,
        claimed: &HashSet<SlotId>,
    ) -> Option<SlotId> {
        let n = self.grid.len();
        let gap = self.grid.gap;

        let candidates: Vec<usize> = match side {
            // Top of the buy rail moving down
            Side::Buy => (0..=boundary.min(n - 1)).rev().collect(),
            // Bottom of the sell rail moving up
            Side::Sell => ((boundary + gap + 1).min(n - 1)..n).collect(),
        };

        candidates.into_iter().find_map(|idx| {
            let slot = self.grid.slot(idx as SlotId)?;
            if slot.is_occupied() {
                return None;
            }
            if claimed.contains(&slot.id) {
                return None;
            }
            if let Some(oid) = &slot.order_id {
                if exclude.contains(oid) {
                    return None;
                }
            }
            Some(slot.id)
        })
    }

    /// Size for the replacement order: the ideal sizing when available,
    /// otherwise the fill's proceeds rolled into the target rung.
    fn size_for(&self, side: Side, target: SlotId, fill: &FilledOrder) -> Option<f64> {
        let pair = &self.config.pair;
        let target_price = self.grid.slot(target)?.price;

        let ideal = self.ideal_sizes.get(side).get(&target).copied();
        let size = match ideal {
            Some(size) if size > 0.0 => size,
            _ => {
                let fill_price = self
                    .grid
                    .slot(fill.slot_id)
                    .map(|s| s.price)
                    .unwrap_or(target_price);
                match side {
                    // Sell proceeds (quote) buy base at the target rung
                    Side::Buy => fill.filled_size * fill_price / target_price,
                    // Buy proceeds (base) are re-listed directly
                    Side::Sell => fill.filled_size,
                }
            }
        };

        let size = pair.base.quantize(size);
        let ideal_ref = ideal.filter(|s| *s > 0.0);
        if !math::order_size_valid(
            size,
            pair.base.precision,
            self.config.min_order_factor,
            ideal_ref,
            self.config.dust_pct,
        ) {
            return None;
        }
        Some(size)
    }

    /// Bootstrap-mode rotation: no rebalance math, just mirror the fill
    /// with a CREATE at the closest empty opposite slot's pre-computed size.
    pub fn bootstrap_plan(&self, fill: &FilledOrder) -> Option<Action> {
        let opposite = fill.side.opposite();

        // Anchor on the market-closest resting order of the opposite side
        let anchor = match opposite {
            Side::Buy => self.grid.best_bid(),
            Side::Sell => self.grid.best_ask(),
        };
        let anchor_idx = anchor.map(|s| s.id as i64).unwrap_or_else(|| {
            match opposite {
                Side::Buy => self.grid.boundary_idx as i64,
                Side::Sell => (self.grid.boundary_idx + self.grid.gap + 1) as i64,
            }
        });

        // Closest empty VIRTUAL slot on the opposite rail; ties break toward
        // the market side of the rail
        let target = self
            .grid
            .rail(opposite)
            .filter(|s| s.state == SlotState::Virtual && !s.is_occupied())
            .min_by_key(|s| {
                let distance = (s.id as i64 - anchor_idx).abs();
                let tie = match opposite {
                    Side::Buy => SlotId::MAX - s.id,
                    Side::Sell => s.id,
                };
                (distance, tie)
            })?;

        let size = self
            .ideal_sizes
            .get(opposite)
            .get(&target.id)
            .copied()
            .filter(|s| *s > 0.0)?;

        Some(Action::Create {
            slot_id: target.id,
            side: opposite,
            price: target.price,
            size,
        })
    }
}
