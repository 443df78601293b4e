//! Core data types for the order grid

use serde::{Deserialize, Serialize};

use crate::chain::types::RawOrder;

/// Stable identifier of a grid slot. Slot ids double as indices into the
/// price ladder and never change after construction.
pub type SlotId = u32;

/// Market side of an order or a pool of capital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Role a slot currently plays on the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotRole {
    /// On the bid rail, at or below the boundary.
    Buy,
    /// On the ask rail, above the boundary gap.
    Sell,
    /// Placeholder inside the bid-ask window; never holds an order.
    Spread,
}

impl SlotRole {
    pub fn side(&self) -> Option<Side> {
        match self {
            SlotRole::Buy => Some(Side::Buy),
            SlotRole::Sell => Some(Side::Sell),
            SlotRole::Spread => None,
        }
    }
}

/// On-chain presence of a slot's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    /// No order on chain for this slot.
    Virtual,
    /// Order resting on chain at full size.
    Active,
    /// Order resting on chain, partially filled.
    Partial,
}

/// A single position on the price ladder.
///
/// Slots are created once, at grid construction, and live for the life of
/// the bot; fills and rotations change role/state/size but never the price
/// or the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSlot {
    pub id: SlotId,
    #[serde(rename = "type")]
    pub role: SlotRole,
    pub state: SlotState,
    /// Slot price, absolute (quote per base).
    pub price: f64,
    /// Committed base-asset amount; 0 when VIRTUAL or SPREAD.
    pub size: f64,
    /// Chain order id; present iff state is ACTIVE or PARTIAL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Cached last-known on-chain integer representation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_on_chain: Option<RawOrder>,
    /// Last directional side; survives SPREAD placeholder periods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_side: Option<Side>,
}

impl GridSlot {
    pub fn new_virtual(id: SlotId, price: f64, role: SlotRole) -> Self {
        Self {
            id,
            role,
            state: SlotState::Virtual,
            price,
            size: 0.0,
            order_id: None,
            raw_on_chain: None,
            committed_side: role.side(),
        }
    }

    /// Whether the slot claims an on-chain order.
    pub fn is_on_chain(&self) -> bool {
        matches!(self.state, SlotState::Active | SlotState::Partial)
    }

    /// An on-chain state with no order id is a phantom; detection must
    /// auto-correct it to VIRTUAL.
    pub fn is_phantom(&self) -> bool {
        self.is_on_chain() && self.order_id.is_none()
    }

    /// Whether a CREATE may target this slot.
    pub fn is_occupied(&self) -> bool {
        self.is_on_chain() || self.order_id.is_some()
    }

    /// Clear the on-chain linkage after a full fill or a detected phantom.
    pub fn virtualize(&mut self) {
        if let Some(side) = self.role.side() {
            self.committed_side = Some(side);
        }
        self.state = SlotState::Virtual;
        self.size = 0.0;
        self.order_id = None;
        self.raw_on_chain = None;
    }

    /// Convert to a SPREAD placeholder, preserving the committed side.
    pub fn to_spread_placeholder(&mut self) {
        self.virtualize();
        self.role = SlotRole::Spread;
    }

    /// Mark as resting on chain with the assigned order id.
    pub fn mark_active(&mut self, order_id: String, raw: Option<RawOrder>) {
        self.state = SlotState::Active;
        self.order_id = Some(order_id);
        self.raw_on_chain = raw;
        if let Some(side) = self.role.side() {
            self.committed_side = Some(side);
        }
    }

    /// Reduce to the remaining size after a partial fill.
    pub fn mark_partial(&mut self, remaining: f64, raw: Option<RawOrder>) {
        self.state = SlotState::Partial;
        self.size = remaining;
        if raw.is_some() {
            self.raw_on_chain = raw;
        }
    }
}

/// A pair of values, one per market side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerSide<T> {
    pub buy: T,
    pub sell: T,
}

impl<T> PerSide<T> {
    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> PerSide<U> {
        PerSide {
            buy: f(&self.buy),
            sell: f(&self.sell),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phantom_detection() {
        let mut slot = GridSlot::new_virtual(3, 100.0, SlotRole::Sell);
        assert!(!slot.is_phantom());

        slot.state = SlotState::Active;
        assert!(slot.is_phantom());

        slot.order_id = Some("1.7.42".into());
        assert!(!slot.is_phantom());
    }

    #[test]
    fn test_spread_placeholder_discipline() {
        let mut slot = GridSlot::new_virtual(5, 100.0, SlotRole::Sell);
        slot.mark_active("1.7.42".into(), None);
        slot.size = 12.0;

        slot.to_spread_placeholder();
        assert_eq!(slot.role, SlotRole::Spread);
        assert_eq!(slot.state, SlotState::Virtual);
        assert_eq!(slot.size, 0.0);
        assert!(slot.order_id.is_none());
        // Directional memory survives the placeholder
        assert_eq!(slot.committed_side, Some(Side::Sell));
    }

    #[test]
    fn test_virtualize_clears_chain_linkage() {
        let mut slot = GridSlot::new_virtual(1, 50.0, SlotRole::Buy);
        slot.mark_active("1.7.9".into(), None);
        slot.size = 4.0;

        slot.virtualize();
        assert_eq!(slot.state, SlotState::Virtual);
        assert!(slot.order_id.is_none());
        assert!(slot.raw_on_chain.is_none());
        assert_eq!(slot.size, 0.0);
    }

    #[test]
    fn test_per_side_access() {
        let mut funds = PerSide { buy: 10.0, sell: 20.0 };
        *funds.get_mut(Side::Buy) += 5.0;
        assert_eq!(*funds.get(Side::Buy), 15.0);
        assert_eq!(*funds.get(Side::Sell), 20.0);
    }
}
