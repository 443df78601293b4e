//! Copy-on-write working grid
//!
//! A `WorkingGrid` stages one batch worth of mutations off the published
//! master. Actions are projected phantom-free (no order id is written until
//! the chain assigns one), validated against funds, and only merged back
//! into a successor grid after the broadcast confirms.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chain::types::AssetPair;
use crate::errors::{EngineError, EngineResult};
use crate::math;

use super::model::Grid;
use super::types::{GridSlot, PerSide, Side, SlotId, SlotState};

/// One staged mutation of the grid.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create {
        slot_id: SlotId,
        side: Side,
        price: f64,
        size: f64,
    },
    Update {
        slot_id: SlotId,
        order_id: String,
        new_size: f64,
        /// Price of the destination slot when this update rotates the order.
        new_price: Option<f64>,
        /// Destination slot when the on-chain order moves to a new rung.
        new_slot_id: Option<SlotId>,
    },
    Cancel {
        slot_id: SlotId,
        order_id: String,
    },
}

impl Action {
    /// Chain order id this action touches, if any.
    pub fn order_id(&self) -> Option<&str> {
        match self {
            Action::Create { .. } => None,
            Action::Update { order_id, .. } | Action::Cancel { order_id, .. } => {
                Some(order_id.as_str())
            }
        }
    }

    /// Slot ids this action touches.
    pub fn slot_ids(&self) -> Vec<SlotId> {
        match self {
            Action::Create { slot_id, .. } | Action::Cancel { slot_id, .. } => vec![*slot_id],
            Action::Update {
                slot_id,
                new_slot_id,
                ..
            } => match new_slot_id {
                Some(target) => vec![*slot_id, *target],
                None => vec![*slot_id],
            },
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, Action::Create { .. })
    }
}

/// A rebalance plan plus the boundary it was computed for.
#[derive(Debug, Clone, Default)]
pub struct CowPlan {
    pub actions: Vec<Action>,
    /// Boundary the working grid should land on; `None` keeps the master's.
    pub boundary_idx: Option<usize>,
}

/// Staged copy of the master grid at a recorded base version.
#[derive(Debug, Clone)]
pub struct WorkingGrid {
    master: Arc<Grid>,
    pub base_version: u64,
    overlay: HashMap<SlotId, GridSlot>,
    pub boundary_idx: usize,
}

impl WorkingGrid {
    pub fn new(master: Arc<Grid>) -> Self {
        Self {
            base_version: master.version,
            boundary_idx: master.boundary_idx,
            overlay: HashMap::new(),
            master,
        }
    }

    /// Working view of a slot: overlay first, master underneath.
    pub fn slot(&self, id: SlotId) -> Option<&GridSlot> {
        self.overlay.get(&id).or_else(|| self.master.slot(id))
    }

    fn slot_entry(&mut self, id: SlotId) -> EngineResult<&mut GridSlot> {
        if !self.overlay.contains_key(&id) {
            let base = self.master.slot(id).cloned().ok_or_else(|| {
                EngineError::IllegalOrderState {
                    context: "working-grid".into(),
                    slot_id: Some(id),
                    details: "slot id outside grid".into(),
                }
            })?;
            self.overlay.insert(id, base);
        }
        Ok(self.overlay.get_mut(&id).expect("just inserted"))
    }

    /// Drop a slot's staged copy so a later commit cannot overwrite
    /// concurrent master changes (used for skipped zero-delta updates).
    pub fn resync_from_master(&mut self, id: SlotId) {
        self.overlay.remove(&id);
    }

    /// Stage pre-computed slot updates (role reassignments) directly.
    pub fn stage_slots(&mut self, slots: Vec<GridSlot>) {
        for slot in slots {
            self.overlay.insert(slot.id, slot);
        }
    }

    pub fn set_boundary(&mut self, boundary_idx: usize) {
        self.boundary_idx = boundary_idx;
    }

    /// Slots staged in this working grid.
    pub fn touched(&self) -> impl Iterator<Item = &GridSlot> {
        self.overlay.values()
    }

    /// Project an action into the working view. CREATEs land as VIRTUAL with
    /// no order id; ids are attached from broadcast results later.
    pub fn apply(&mut self, action: &Action) -> EngineResult<()> {
        match action {
            Action::Create {
                slot_id,
                side,
                size,
                ..
            } => {
                let slot = self
                    .slot(*slot_id)
                    .ok_or_else(|| EngineError::IllegalOrderState {
                        context: "cow-apply".into(),
                        slot_id: Some(*slot_id),
                        details: "create targets unknown slot".into(),
                    })?;
                if slot.is_occupied() {
                    return Err(EngineError::CreateSlotOccupied {
                        target_id: *slot_id,
                        current_order_id: slot.order_id.clone(),
                        current_role: slot.role,
                        current_state: slot.state,
                    });
                }
                let role = match side {
                    Side::Buy => super::types::SlotRole::Buy,
                    Side::Sell => super::types::SlotRole::Sell,
                };
                let slot = self.slot_entry(*slot_id)?;
                slot.role = role;
                slot.state = SlotState::Virtual;
                slot.size = *size;
                slot.order_id = None;
                slot.raw_on_chain = None;
                slot.committed_side = Some(*side);
            }
            Action::Update {
                slot_id,
                order_id,
                new_size,
                new_slot_id,
                ..
            } => match new_slot_id {
                None => {
                    let slot = self.slot_entry(*slot_id)?;
                    slot.size = *new_size;
                }
                Some(target_id) => {
                    // Rotation: the on-chain order moves to a new rung; the
                    // source reverts to an empty virtual slot.
                    let (state, raw) = {
                        let source = self.slot_entry(*slot_id)?;
                        let state = source.state;
                        let raw = source.raw_on_chain.clone();
                        source.virtualize();
                        (state, raw)
                    };
                    let target = self.slot_entry(*target_id)?;
                    target.state = state;
                    target.size = *new_size;
                    target.order_id = Some(order_id.clone());
                    target.raw_on_chain = raw;
                    if let Some(side) = target.role.side() {
                        target.committed_side = Some(side);
                    }
                }
            },
            Action::Cancel { slot_id, .. } => {
                let slot = self.slot_entry(*slot_id)?;
                slot.to_spread_placeholder();
            }
        }
        Ok(())
    }

    /// Committed value a side requires in the working view, in integer-exact
    /// float units (base for sell, quote for buy).
    pub fn required_funds(&self, pair: &AssetPair) -> PerSide<f64> {
        let mut required = PerSide::<f64>::default();
        for id in 0..self.master.len() as SlotId {
            let Some(slot) = self.slot(id) else { continue };
            if !slot.is_on_chain() && !(slot.size > 0.0) {
                continue;
            }
            match slot.committed_side.or(slot.role.side()) {
                Some(Side::Sell) => {
                    required.sell += pair.base.quantize(slot.size);
                }
                Some(Side::Buy) => {
                    required.buy += pair.quote.quantize(slot.size * slot.price);
                }
                None => {}
            }
        }
        required
    }

    /// Merge the overlay into a successor grid with a bumped version.
    pub fn into_grid(self) -> Grid {
        let updated: Vec<GridSlot> = self.overlay.into_values().collect();
        self.master.with_updates(updated, self.boundary_idx)
    }
}

/// Size-validity limits used by plan validation.
#[derive(Debug, Clone, Copy)]
pub struct SizeLimits {
    pub min_order_factor: f64,
    pub dust_pct: f64,
}

/// Validate a plan against the master state and the free balances.
///
/// Fund validation walks the actions in execution order and compares the
/// *peak* running requirement per side (not the net) to the chain-free
/// balance: a CREATE broadcast before a CANCEL confirms needs its funds up
/// front even when the batch nets out.
pub fn validate_plan(
    master: &Grid,
    plan: &[Action],
    pair: &AssetPair,
    limits: SizeLimits,
    free: PerSide<f64>,
) -> EngineResult<()> {
    let mut running = PerSide::<f64> { buy: 0.0, sell: 0.0 };
    let mut peak = running;

    for action in plan {
        match action {
            Action::Create {
                slot_id,
                side,
                price,
                size,
            } => {
                let slot = master.slot(*slot_id).ok_or_else(|| {
                    EngineError::IllegalOrderState {
                        context: "cow-validate".into(),
                        slot_id: Some(*slot_id),
                        details: "create targets unknown slot".into(),
                    }
                })?;
                if slot.is_occupied() {
                    return Err(EngineError::CreateSlotOccupied {
                        target_id: *slot_id,
                        current_order_id: slot.order_id.clone(),
                        current_role: slot.role,
                        current_state: slot.state,
                    });
                }
                let precision = pair.base.precision;
                if !math::order_size_valid(
                    *size,
                    precision,
                    limits.min_order_factor,
                    None,
                    limits.dust_pct,
                ) {
                    return Err(EngineError::IllegalOrderState {
                        context: "cow-validate".into(),
                        slot_id: Some(*slot_id),
                        details: format!("create size {size} below minimum"),
                    });
                }
                match side {
                    Side::Sell => running.sell += pair.base.quantize(*size),
                    Side::Buy => running.buy += pair.quote.quantize(size * price),
                }
            }
            Action::Update {
                slot_id,
                new_size,
                new_price,
                ..
            } => {
                let old = master.slot(*slot_id);
                let old_size = old.map(|s| s.size).unwrap_or(0.0);
                let side = old
                    .and_then(|s| s.committed_side.or(s.role.side()))
                    .unwrap_or(Side::Sell);
                let price = (*new_price).or(old.map(|s| s.price)).unwrap_or(0.0);
                match side {
                    Side::Sell => {
                        running.sell += pair.base.quantize(*new_size) - pair.base.quantize(old_size)
                    }
                    Side::Buy => {
                        running.buy += pair.quote.quantize(new_size * price)
                            - pair.quote.quantize(old_size * price)
                    }
                }
            }
            Action::Cancel { slot_id, .. } => {
                if let Some(slot) = master.slot(*slot_id) {
                    match slot.committed_side.or(slot.role.side()) {
                        Some(Side::Sell) => running.sell -= pair.base.quantize(slot.size),
                        Some(Side::Buy) => {
                            running.buy -= pair.quote.quantize(slot.size * slot.price)
                        }
                        None => {}
                    }
                }
            }
        }
        peak.buy = peak.buy.max(running.buy);
        peak.sell = peak.sell.max(running.sell);
    }

    for side in [Side::Buy, Side::Sell] {
        let slack = pair.asset_for(side).precision_slack();
        if *peak.get(side) > free.get(side) + slack {
            return Err(EngineError::AccountingCommitmentFailed {
                side,
                amount: *peak.get(side),
                context: format!(
                    "plan needs {:.8} but only {:.8} free",
                    peak.get(side),
                    free.get(side)
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::grid::types::SlotRole;

    fn base_grid() -> (Arc<Grid>, crate::config::BotConfig) {
        let config = test_config();
        let grid = Arc::new(Grid::create(&config).unwrap());
        (grid, config)
    }

    #[test]
    fn test_create_projection_is_phantom_free() {
        let (grid, _) = base_grid();
        let b = grid.boundary_idx;
        let mut working = WorkingGrid::new(grid);

        working
            .apply(&Action::Create {
                slot_id: b as SlotId,
                side: Side::Buy,
                price: 100.0,
                size: 5.0,
            })
            .unwrap();

        let slot = working.slot(b as SlotId).unwrap();
        assert_eq!(slot.state, SlotState::Virtual);
        assert_eq!(slot.size, 5.0);
        assert!(slot.order_id.is_none());
    }

    #[test]
    fn test_create_into_occupied_slot_rejected() {
        let (grid, _) = base_grid();
        let b = grid.boundary_idx;

        let mut held = grid.slot(b as SlotId).unwrap().clone();
        held.mark_active("1.7.7".into(), None);
        held.size = 2.0;
        let grid = Arc::new(grid.with_updates(vec![held], b));

        let mut working = WorkingGrid::new(grid);
        let err = working
            .apply(&Action::Create {
                slot_id: b as SlotId,
                side: Side::Buy,
                price: 100.0,
                size: 5.0,
            })
            .unwrap_err();

        assert!(matches!(err, EngineError::CreateSlotOccupied { .. }));
    }

    #[test]
    fn test_rotation_clears_source_and_moves_order() {
        let (grid, _) = base_grid();
        let b = grid.boundary_idx;
        let source_id = (b + grid.gap + 1) as SlotId;
        let target_id = (b + grid.gap + 4) as SlotId;

        let mut source = grid.slot(source_id).unwrap().clone();
        source.mark_active("1.7.424242".into(), None);
        source.size = 83.9;
        let grid = Arc::new(grid.with_updates(vec![source], b));
        let target_price = grid.slot(target_id).unwrap().price;

        let mut working = WorkingGrid::new(grid);
        working
            .apply(&Action::Update {
                slot_id: source_id,
                order_id: "1.7.424242".into(),
                new_size: 83.9,
                new_price: Some(target_price),
                new_slot_id: Some(target_id),
            })
            .unwrap();

        let source = working.slot(source_id).unwrap();
        assert_eq!(source.state, SlotState::Virtual);
        assert!(source.order_id.is_none());
        assert_eq!(source.size, 0.0);

        let target = working.slot(target_id).unwrap();
        assert_eq!(target.state, SlotState::Active);
        assert_eq!(target.order_id.as_deref(), Some("1.7.424242"));
        assert!((target.size - 83.9).abs() < 1e-9);
    }

    #[test]
    fn test_cancel_restores_spread_placeholder() {
        let (grid, _) = base_grid();
        let b = grid.boundary_idx;
        let id = (b + grid.gap + 1) as SlotId;

        let mut held = grid.slot(id).unwrap().clone();
        held.mark_active("1.7.9".into(), None);
        held.size = 4.0;
        let grid = Arc::new(grid.with_updates(vec![held], b));

        let mut working = WorkingGrid::new(grid);
        working
            .apply(&Action::Cancel {
                slot_id: id,
                order_id: "1.7.9".into(),
            })
            .unwrap();

        let slot = working.slot(id).unwrap();
        assert_eq!(slot.role, SlotRole::Spread);
        assert_eq!(slot.size, 0.0);
        assert!(slot.order_id.is_none());
        // Directional memory preserved for later boundary math
        assert_eq!(slot.committed_side, Some(Side::Sell));
    }

    #[test]
    fn test_into_grid_bumps_version() {
        let (grid, _) = base_grid();
        let version = grid.version;
        let working = WorkingGrid::new(grid);
        let committed = working.into_grid();
        assert_eq!(committed.version, version + 1);
    }

    #[test]
    fn test_resync_drops_staged_copy() {
        let (grid, _) = base_grid();
        let b = grid.boundary_idx;
        let mut working = WorkingGrid::new(grid.clone());
        working
            .apply(&Action::Create {
                slot_id: b as SlotId,
                side: Side::Buy,
                price: 100.0,
                size: 5.0,
            })
            .unwrap();

        working.resync_from_master(b as SlotId);
        assert_eq!(working.slot(b as SlotId), grid.slot(b as SlotId));
    }

    #[test]
    fn test_validate_peak_not_net() {
        let (grid, config) = base_grid();
        let b = grid.boundary_idx;

        // An existing sell order that the plan cancels after creating a new
        // one: net requirement ~0, peak requirement = the new order.
        let held_id = (b + grid.gap + 1) as SlotId;
        let mut held = grid.slot(held_id).unwrap().clone();
        held.mark_active("1.7.5".into(), None);
        held.size = 10.0;
        let grid = Arc::new(grid.with_updates(vec![held], b));

        let create_first = vec![
            Action::Create {
                slot_id: (b + grid.gap + 2) as SlotId,
                side: Side::Sell,
                price: grid.slot((b + grid.gap + 2) as SlotId).unwrap().price,
                size: 10.0,
            },
            Action::Cancel {
                slot_id: held_id,
                order_id: "1.7.5".into(),
            },
        ];

        let limits = SizeLimits {
            min_order_factor: config.min_order_factor,
            dust_pct: 0.0,
        };
        let scarce = PerSide { buy: 0.0, sell: 1.0 };
        let err = validate_plan(&grid, &create_first, &config.pair, limits, scarce).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AccountingCommitmentFailed {
                side: Side::Sell,
                ..
            }
        ));

        // Cancel first releases the funds before the create needs them
        let cancel_first: Vec<Action> = create_first.iter().rev().cloned().collect();
        validate_plan(&grid, &cancel_first, &config.pair, limits, scarce).unwrap();
    }

    #[test]
    fn test_required_funds_counts_on_chain_sides() {
        let (grid, config) = base_grid();
        let b = grid.boundary_idx;

        let mut sell = grid.slot((b + grid.gap + 1) as SlotId).unwrap().clone();
        sell.mark_active("1.7.1".into(), None);
        sell.size = 4.0;
        let mut buy = grid.slot(b as SlotId).unwrap().clone();
        buy.mark_active("1.7.2".into(), None);
        buy.size = 2.0;
        let grid = Arc::new(grid.with_updates(vec![sell, buy], b));

        let working = WorkingGrid::new(grid.clone());
        let required = working.required_funds(&config.pair);
        assert!((required.sell - 4.0).abs() < 1e-6);
        let buy_price = grid.slot(b as SlotId).unwrap().price;
        assert!((required.buy - 2.0 * buy_price).abs() < 1e-4);
    }
}
