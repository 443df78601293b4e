//! Grid construction, role assignment and boundary management
//!
//! The master grid is logically immutable: it is shared as `Arc<Grid>` and
//! every mutation path builds a new `Grid` with a bumped version. The slot
//! set is fixed at construction; only roles, states and sizes evolve.

use crate::config::BotConfig;
use crate::errors::{EngineError, EngineResult};
use crate::math;

use super::types::{GridSlot, PerSide, Side, SlotId, SlotRole, SlotState};

/// The published order grid.
#[derive(Debug, Clone)]
pub struct Grid {
    slots: Vec<GridSlot>,
    /// Index of the last BUY slot; SELL starts at `boundary_idx + gap + 1`.
    pub boundary_idx: usize,
    /// Number of SPREAD placeholder slots above the boundary.
    pub gap: usize,
    /// Monotone counter bumped on every master mutation.
    pub version: u64,
}

impl Grid {
    /// Build a geometric grid around `start_price` covering
    /// `[min_price, max_price]`.
    pub fn create(config: &BotConfig) -> EngineResult<Grid> {
        config.validate()?;

        let step = 1.0 + config.increment_percent / 100.0;

        // Walk down from the start price to the lower bound...
        let mut below = Vec::new();
        let mut price = config.start_price / step;
        while price >= config.min_price {
            below.push(price);
            price /= step;
        }
        // ...and up to the upper bound.
        let mut above = Vec::new();
        let mut price = config.start_price * step;
        while price <= config.max_price {
            above.push(price);
            price *= step;
        }

        let gap = math::gap_slots(config.increment_percent, config.target_spread_percent);
        let boundary_idx = below.len();
        let n = below.len() + 1 + above.len();

        let sell_slots = n.saturating_sub(boundary_idx + gap + 1);
        if below.is_empty() || sell_slots == 0 {
            return Err(EngineError::config(
                "grid",
                format!(
                    "imbalanced rail: {} buy / {} sell slots for range [{}, {}]",
                    below.len(),
                    sell_slots,
                    config.min_price,
                    config.max_price
                ),
            ));
        }

        let prices = below
            .into_iter()
            .rev()
            .chain(std::iter::once(config.start_price))
            .chain(above);

        let slots = prices
            .enumerate()
            .map(|(i, price)| {
                let role = Self::role_for(boundary_idx, gap, i);
                GridSlot::new_virtual(i as SlotId, price, role)
            })
            .collect();

        Ok(Grid {
            slots,
            boundary_idx,
            gap,
            version: 1,
        })
    }

    /// Rebuild a grid from persisted slots.
    pub fn from_parts(
        slots: Vec<GridSlot>,
        boundary_idx: usize,
        gap: usize,
        version: u64,
    ) -> Grid {
        Grid {
            slots,
            boundary_idx,
            gap,
            version,
        }
    }

    /// The role slot `idx` plays under a given boundary.
    pub fn role_for(boundary_idx: usize, gap: usize, idx: usize) -> SlotRole {
        if idx <= boundary_idx {
            SlotRole::Buy
        } else if idx <= boundary_idx + gap {
            SlotRole::Spread
        } else {
            SlotRole::Sell
        }
    }

    pub fn slots(&self) -> &[GridSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, id: SlotId) -> Option<&GridSlot> {
        self.slots.get(id as usize)
    }

    /// Locate the slot currently holding a chain order id.
    pub fn find_by_order_id(&self, order_id: &str) -> Option<&GridSlot> {
        self.slots
            .iter()
            .find(|s| s.order_id.as_deref() == Some(order_id))
    }

    /// Slots whose role matches `side`.
    pub fn rail(&self, side: Side) -> impl Iterator<Item = &GridSlot> {
        self.slots
            .iter()
            .filter(move |s| s.role.side() == Some(side))
    }

    /// On-chain order counts per side.
    pub fn active_counts(&self) -> PerSide<usize> {
        PerSide {
            buy: self
                .rail(Side::Buy)
                .filter(|s| s.is_on_chain())
                .count(),
            sell: self
                .rail(Side::Sell)
                .filter(|s| s.is_on_chain())
                .count(),
        }
    }

    /// Capital committed to on-chain orders per side: base units on the
    /// sell side, quote units (size x price) on the buy side.
    pub fn committed_value(&self) -> PerSide<f64> {
        let mut committed = PerSide::<f64>::default();
        for slot in self.slots.iter().filter(|s| s.is_on_chain()) {
            match slot.role.side() {
                Some(Side::Sell) => committed.sell += slot.size,
                Some(Side::Buy) => committed.buy += slot.size * slot.price,
                None => {}
            }
        }
        committed
    }

    /// Highest-priced on-chain BUY slot.
    pub fn best_bid(&self) -> Option<&GridSlot> {
        self.rail(Side::Buy).filter(|s| s.is_on_chain()).last()
    }

    /// Lowest-priced on-chain SELL slot.
    pub fn best_ask(&self) -> Option<&GridSlot> {
        self.rail(Side::Sell).find(|s| s.is_on_chain())
    }

    /// Measured spread between the resting rails, in percent of the bid.
    pub fn measured_spread_percent(&self) -> Option<f64> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        Some((ask - bid) / bid * 100.0)
    }

    /// Reassign roles for a boundary, returning only the changed slots.
    ///
    /// On-chain slots keep their role until a rotation replaces them; a
    /// SPREAD role is never written onto a slot that still holds an order.
    pub fn assign_roles(&self, boundary_idx: usize, gap: usize) -> Vec<GridSlot> {
        let mut changed = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            let new_role = Self::role_for(boundary_idx, gap, i);
            if slot.role == new_role {
                continue;
            }
            if slot.is_on_chain() {
                continue;
            }
            let mut updated = slot.clone();
            updated.role = new_role;
            if new_role == SlotRole::Spread {
                updated.to_spread_placeholder();
            } else {
                updated.state = SlotState::Virtual;
            }
            changed.push(updated);
        }
        changed
    }

    /// Boundary after a full fill on `side`, clamped to the slot range.
    pub fn shifted_boundary(&self, filled_side: Side) -> usize {
        let n = self.slots.len();
        match filled_side {
            // A sell fill means the market moved up: the boundary follows.
            Side::Sell => (self.boundary_idx + 1).min(n - 1),
            Side::Buy => self.boundary_idx.saturating_sub(1),
        }
    }

    /// Recompute the boundary so the rails match the fund ratio, both
    /// expressed in quote value. Used after structural resyncs.
    pub fn boundary_from_funds(&self, buy_value: f64, sell_value: f64) -> usize {
        let n = self.slots.len();
        let total = buy_value + sell_value;
        if total <= 0.0 {
            return self.boundary_idx;
        }
        let rail_slots = n.saturating_sub(self.gap).max(2);
        let fraction = buy_value / total;
        let buy_slots = ((fraction * rail_slots as f64).round() as usize)
            .clamp(1, rail_slots - 1);
        (buy_slots - 1).min(n - 1)
    }

    /// Produce the successor grid with `updated` slots merged in.
    pub fn with_updates(&self, updated: Vec<GridSlot>, boundary_idx: usize) -> Grid {
        let mut slots = self.slots.clone();
        for slot in updated {
            let idx = slot.id as usize;
            if idx < slots.len() {
                slots[idx] = slot;
            }
        }
        Grid {
            slots,
            boundary_idx,
            gap: self.gap,
            version: self.version + 1,
        }
    }

    /// Phantom sweep: clears any ACTIVE/PARTIAL slot without an order id.
    /// Returns the corrected grid when at least one phantom was found.
    pub fn correct_phantoms(&self) -> Option<Grid> {
        let phantoms: Vec<GridSlot> = self
            .slots
            .iter()
            .filter(|s| s.is_phantom())
            .map(|s| {
                let mut fixed = s.clone();
                fixed.virtualize();
                fixed
            })
            .collect();
        if phantoms.is_empty() {
            None
        } else {
            Some(self.with_updates(phantoms, self.boundary_idx))
        }
    }
}
