//! Copy-on-write plan execution
//!
//! The master grid mutates only after the chain confirms the operations
//! that justify it. A failed broadcast discards the working grid; stale
//! order references found in the node's error message get their slots
//! cleaned to SPREAD (a directed, audited mutation), the ids are recorded
//! in the stale-cleaned ledger, and the surviving operations are retried
//! exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::chain::client::DexRpc;
use crate::chain::types::{BuiltOp, OpResult, RawOrder};
use crate::errors::{EngineError, EngineResult};
use crate::grid::types::{GridSlot, Side, SlotId};
use crate::grid::working::{validate_plan, Action, CowPlan, SizeLimits, WorkingGrid};
use crate::pipeline::now_ms;

use super::GridEngine;

/// Error-message fragments the node emits for vanished orders.
const STALE_MARKERS: &[&str] = &[
    "does not exist",
    "Unable to find Object",
    "not found",
];

/// Pull chain object ids (`x.y.z`) out of a node error message, but only
/// when the message signals a vanished order.
pub fn parse_stale_order_ids(message: &str) -> Vec<String> {
    if !STALE_MARKERS.iter().any(|m| message.contains(m)) {
        return Vec::new();
    }

    let mut ids = Vec::new();
    for token in message.split(|c: char| !(c.is_ascii_digit() || c == '.')) {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())) {
            if !ids.contains(&token.to_string()) {
                ids.push(token.to_string());
            }
        }
    }
    ids
}

/// Group an all-CREATE two-sided plan into outside-in pairs:
/// `[outermost sell, outermost buy], [next sell, next buy], ...` with any
/// leftover singles trailing. Returns action indices.
pub fn outside_in_pairs(actions: &[Action]) -> Vec<Vec<usize>> {
    let mut sells: Vec<(usize, f64)> = Vec::new();
    let mut buys: Vec<(usize, f64)> = Vec::new();
    for (idx, action) in actions.iter().enumerate() {
        if let Action::Create { side, price, .. } = action {
            match side {
                Side::Sell => sells.push((idx, *price)),
                Side::Buy => buys.push((idx, *price)),
            }
        }
    }
    // Outermost sell = highest price, outermost buy = lowest price
    sells.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("prices are finite"));
    buys.sort_by(|a, b| a.1.partial_cmp(&b.1).expect("prices are finite"));

    let mut groups = Vec::new();
    let pairs = sells.len().min(buys.len());
    for i in 0..pairs {
        groups.push(vec![sells[i].0, buys[i].0]);
    }
    for (idx, _) in sells.iter().skip(pairs) {
        groups.push(vec![*idx]);
    }
    for (idx, _) in buys.iter().skip(pairs) {
        groups.push(vec![*idx]);
    }
    groups
}

/// Outcome of one broadcast attempt.
enum Attempt {
    Done,
    /// Stale references were cleaned; run once more with what's left.
    Retry(CowPlan),
}

/// Whether the grouped-create execution path applies.
fn is_two_sided_create_batch(actions: &[Action]) -> bool {
    if actions.is_empty() || !actions.iter().all(Action::is_create) {
        return false;
    }
    let mut has_buy = false;
    let mut has_sell = false;
    for action in actions {
        if let Action::Create { side, .. } = action {
            match side {
                Side::Buy => has_buy = true,
                Side::Sell => has_sell = true,
            }
        }
    }
    has_buy && has_sell
}

impl<R: DexRpc + 'static> GridEngine<R> {
    /// Execute a plan through the COW workflow. On success the master is
    /// swapped atomically and optimistic accounting is applied; on failure
    /// the working grid is discarded. Stale-order failures clean the
    /// affected slots and retry once with the surviving operations.
    pub async fn execute_plan(&self, plan: CowPlan) -> EngineResult<()> {
        self.mark_pipeline_op("cow-execute");
        let mut plan = plan;
        let mut allow_retry = true;
        let result = loop {
            match self.execute_plan_attempt(plan, allow_retry).await {
                Ok(Attempt::Done) => break Ok(()),
                Ok(Attempt::Retry(remaining)) => {
                    plan = remaining;
                    allow_retry = false;
                }
                Err(e) => break Err(e),
            }
        };
        self.clear_pipeline_op("cow-execute");
        result
    }

    async fn execute_plan_attempt(
        &self,
        plan: CowPlan,
        allow_retry: bool,
    ) -> EngineResult<Attempt> {
        let master = self.master();
        let config = self.bot_config();
        let boundary = plan.boundary_idx.unwrap_or(master.boundary_idx);

        if plan.actions.is_empty() && boundary == master.boundary_idx {
            return Ok(Attempt::Done);
        }

        // Stage: roles first so creates see the post-shift rails
        let mut working = WorkingGrid::new(master.clone());
        if boundary != master.boundary_idx {
            working.set_boundary(boundary);
            working.stage_slots(master.assign_roles(boundary, master.gap));
        }

        let limits = SizeLimits {
            min_order_factor: config.min_order_factor,
            dust_pct: config.dust_pct,
        };
        let (free, committed) = {
            let acct = self.accountant.lock().await;
            (acct.free_per_side(), acct.committed())
        };
        validate_plan(&master, &plan.actions, &config.pair, limits, free)?;

        for action in &plan.actions {
            working.apply(action)?;
        }

        // The fully staged book must fit inside the whole fund pool
        let required = working.required_funds(&config.pair);
        for side in [Side::Buy, Side::Sell] {
            let available = free.get(side) + committed.get(side);
            let slack = config.pair.asset_for(side).precision_slack();
            if *required.get(side) > available + slack {
                return Err(EngineError::IllegalOrderState {
                    context: "cow-validate".into(),
                    slot_id: None,
                    details: format!(
                        "staged grid needs {:.8} on {side:?} but only {available:.8} exists",
                        required.get(side)
                    ),
                });
            }
        }

        // Boundary-only commit: nothing to broadcast
        if plan.actions.is_empty() {
            self.commit_working(working, &[], &[]).await?;
            return Ok(Attempt::Done);
        }

        // Shadow-lock everything the batch touches
        let _shadow = ShadowGuard::acquire(self, &plan.actions);

        // Build native operations; zero-delta updates are skipped and their
        // slots resynced so the commit cannot clobber concurrent changes.
        let account_id = self.account_id()?;
        let mut built: Vec<(usize, BuiltOp)> = Vec::new();
        for (idx, action) in plan.actions.iter().enumerate() {
            match self.build_op(&account_id, &master, action) {
                Some(op) => built.push((idx, op)),
                None => {
                    debug!("skipping zero-delta action on slots {:?}", action.slot_ids());
                    for slot_id in action.slot_ids() {
                        working.resync_from_master(slot_id);
                    }
                }
            }
        }
        if built.is_empty() {
            self.commit_working(working, &[], &[]).await?;
            return Ok(Attempt::Done);
        }

        // Group: outside-in create pairs for two-sided create batches,
        // otherwise one transaction.
        let groups: Vec<Vec<usize>> = if is_two_sided_create_batch(&plan.actions) {
            outside_in_pairs(&plan.actions)
        } else {
            vec![built.iter().map(|(idx, _)| *idx).collect()]
        };
        let groups_total = groups.len();

        let mut confirmed: Vec<(usize, OpResult)> = Vec::new();
        let mut broadcast_op_count = 0usize;

        self.accountant.lock().await.set_throw_on_illegal_state(true);
        let broadcast_result: EngineResult<()> = async {
            for (group_no, group) in groups.iter().enumerate() {
                let ops: Vec<BuiltOp> = group
                    .iter()
                    .filter_map(|idx| {
                        built
                            .iter()
                            .find(|(i, _)| i == idx)
                            .map(|(_, op)| op.clone())
                    })
                    .collect();
                if ops.is_empty() {
                    continue;
                }

                match self.rpc.execute_batch(&account_id, ops.clone()).await {
                    Ok(result) => {
                        broadcast_op_count += ops.len();
                        let mut results = result.operation_results.into_iter();
                        for idx in group {
                            if built.iter().any(|(i, _)| i == idx) {
                                if let Some(op_result) = results.next() {
                                    confirmed.push((*idx, op_result));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        if group_no > 0 {
                            // Earlier groups are on chain; fail fast and
                            // surface the partial state.
                            return Err(EngineError::PartialOnChainState {
                                groups_broadcast: group_no,
                                groups_total,
                                broadcast_op_count,
                            });
                        }
                        return Err(e);
                    }
                }
            }
            Ok(())
        }
        .await;
        self.accountant
            .lock()
            .await
            .set_throw_on_illegal_state(false);

        match broadcast_result {
            Ok(()) => {
                self.attach_results(&mut working, &plan.actions, &confirmed, &config);
                self.commit_working(working, &plan.actions, &confirmed).await?;
                Ok(Attempt::Done)
            }
            Err(EngineError::PartialOnChainState {
                groups_broadcast,
                groups_total,
                broadcast_op_count,
            }) => {
                // Commit what the chain confirmed; the next sync reconverges
                // the rest.
                warn!(
                    "grouped create batch partially broadcast: {groups_broadcast}/{groups_total} groups"
                );
                let confirmed_actions: Vec<Action> = confirmed
                    .iter()
                    .filter_map(|(idx, _)| plan.actions.get(*idx).cloned())
                    .collect();
                let mut partial = WorkingGrid::new(self.master());
                if boundary != self.master().boundary_idx {
                    partial.set_boundary(boundary);
                    partial.stage_slots(self.master().assign_roles(boundary, self.master().gap));
                }
                for action in &confirmed_actions {
                    partial.apply(action)?;
                }
                self.attach_results(&mut partial, &plan.actions, &confirmed, &config);
                self.commit_working(partial, &plan.actions, &confirmed).await?;
                Err(EngineError::PartialOnChainState {
                    groups_broadcast,
                    groups_total,
                    broadcast_op_count,
                })
            }
            Err(EngineError::Rpc(message)) => {
                let stale_ids = parse_stale_order_ids(&message);
                if stale_ids.is_empty() || !allow_retry {
                    error!("batch broadcast failed, discarding working grid: {message}");
                    return Err(EngineError::Rpc(message));
                }
                warn!("stale order references in broadcast error: {stale_ids:?}");
                self.cleanup_stale_orders(&stale_ids).await?;

                // Retry once with the operations that survive the cleanup
                let remaining: Vec<Action> = plan
                    .actions
                    .iter()
                    .filter(|action| {
                        action
                            .order_id()
                            .map(|oid| !stale_ids.iter().any(|s| s == oid))
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    return Ok(Attempt::Done);
                }
                info!("retrying batch with {} remaining actions", remaining.len());
                Ok(Attempt::Retry(CowPlan {
                    actions: remaining,
                    boundary_idx: plan.boundary_idx,
                }))
            }
            Err(e) => {
                error!("batch broadcast failed, discarding working grid: {e}");
                Err(e)
            }
        }
    }

    /// Build the chain op for one action; `None` when it rounds to nothing.
    fn build_op(
        &self,
        account_id: &str,
        master: &Arc<crate::grid::model::Grid>,
        action: &Action,
    ) -> Option<BuiltOp> {
        let config = self.bot_config();
        let pair = &config.pair;
        match action {
            Action::Create {
                side, price, size, ..
            } => match side {
                Side::Sell => self.rpc.build_create_order_op(
                    account_id,
                    *size,
                    &pair.base,
                    size * price,
                    &pair.quote,
                    config.expiration_secs,
                ),
                Side::Buy => self.rpc.build_create_order_op(
                    account_id,
                    size * price,
                    &pair.quote,
                    *size,
                    &pair.base,
                    config.expiration_secs,
                ),
            },
            Action::Update {
                slot_id,
                order_id,
                new_size,
                new_price,
                ..
            } => {
                let slot = master.slot(*slot_id)?;
                let side = slot.committed_side.or(slot.role.side())?;
                let raw_for_sale = slot.raw_on_chain.as_ref().map(|r| r.for_sale);
                let price = new_price.unwrap_or(slot.price);
                match side {
                    Side::Sell => self.rpc.build_update_order_op(
                        account_id,
                        order_id,
                        *new_size,
                        &pair.base,
                        new_price.map(|p| new_size * p),
                        &pair.quote,
                        raw_for_sale,
                    ),
                    Side::Buy => self.rpc.build_update_order_op(
                        account_id,
                        order_id,
                        new_size * price,
                        &pair.quote,
                        new_price.map(|_| *new_size),
                        &pair.base,
                        raw_for_sale,
                    ),
                }
            }
            Action::Cancel { order_id, .. } => {
                Some(self.rpc.build_cancel_order_op(account_id, order_id))
            }
        }
    }

    /// Write assigned order ids and raw integers onto confirmed creates and
    /// rotations in the working grid.
    fn attach_results(
        &self,
        working: &mut WorkingGrid,
        actions: &[Action],
        confirmed: &[(usize, OpResult)],
        config: &crate::config::BotConfig,
    ) {
        for (idx, op_result) in confirmed {
            let Some(action) = actions.get(*idx) else { continue };
            match action {
                Action::Create {
                    slot_id,
                    side,
                    price,
                    size,
                } => {
                    let Some(order_id) = op_result.return_value.clone() else {
                        warn!("create result missing order id for slot {slot_id}");
                        continue;
                    };
                    let raw = match side {
                        Side::Sell => RawOrder {
                            for_sale: config.pair.base.to_int(*size),
                            sell_price: crate::chain::types::ChainPrice::selling_base(
                                &config.pair,
                                *size,
                                *price,
                            ),
                        },
                        Side::Buy => RawOrder {
                            for_sale: config.pair.quote.to_int(size * price),
                            sell_price: crate::chain::types::ChainPrice::selling_quote(
                                &config.pair,
                                *size,
                                *price,
                            ),
                        },
                    };
                    let staged: Option<GridSlot> = working.slot(*slot_id).cloned();
                    if let Some(mut slot) = staged {
                        slot.mark_active(order_id, Some(raw));
                        slot.size = *size;
                        working.stage_slots(vec![slot]);
                    }
                }
                Action::Update {
                    slot_id,
                    new_slot_id,
                    ..
                } => {
                    // Rotations keep their order id; refresh raw integers on
                    // the destination slot.
                    let target = new_slot_id.unwrap_or(*slot_id);
                    let staged: Option<GridSlot> = working.slot(target).cloned();
                    if let Some(mut slot) = staged {
                        if let (Some(raw), Some(side)) = (
                            slot.raw_on_chain.clone(),
                            slot.committed_side.or(slot.role.side()),
                        ) {
                            let mut raw: RawOrder = raw;
                            raw.for_sale = match side {
                                Side::Sell => config.pair.base.to_int(slot.size),
                                Side::Buy => {
                                    config.pair.quote.to_int(slot.size * slot.price)
                                }
                            };
                            slot.raw_on_chain = Some(raw);
                        }
                        working.stage_slots(vec![slot]);
                    }
                }
                Action::Cancel { .. } => {}
            }
        }
    }

    /// Version-checked master swap plus optimistic accounting and persist.
    pub(crate) async fn commit_working(
        &self,
        working: WorkingGrid,
        actions: &[Action],
        confirmed: &[(usize, OpResult)],
    ) -> EngineResult<()> {
        let master_before = {
            let _grid_guard = self.grid_lock.lock().await;
            let current = self.master();
            if working.base_version != current.version {
                return Err(EngineError::StaleWorkingGrid {
                    base_version: working.base_version,
                    current_version: current.version,
                });
            }
            let next = working.into_grid();
            debug!(
                "committing grid version {} -> {} (boundary {})",
                current.version,
                next.version,
                next.boundary_idx
            );
            self.publish_master(next);
            current
        };

        self.apply_commit_accounting(&master_before, actions, confirmed)
            .await;

        if let Err(e) = self.persist_snapshot().await {
            warn!("snapshot persist after commit failed: {e}");
        }
        Ok(())
    }

    /// Per-action optimistic fund adjustments after a confirmed commit.
    async fn apply_commit_accounting(
        &self,
        master_before: &Arc<crate::grid::model::Grid>,
        actions: &[Action],
        confirmed: &[(usize, OpResult)],
    ) {
        let config = self.bot_config();
        let fees = self.ctx.fees.get();
        let confirmed_idx: HashSet<usize> = confirmed.iter().map(|(i, _)| *i).collect();
        let mut acct = self.accountant.lock().await;

        for (idx, action) in actions.iter().enumerate() {
            match action {
                Action::Create {
                    side, price, size, ..
                } => {
                    if !confirmed_idx.contains(&idx) {
                        continue;
                    }
                    let value = match side {
                        Side::Sell => *size,
                        Side::Buy => size * price,
                    };
                    if let Err(e) = acct.commit(*side, value, "cow-create") {
                        warn!("post-commit accounting drift on create: {e}");
                    }
                    acct.accrue_network_fee(fees.create_fee);
                }
                Action::Update {
                    slot_id,
                    new_size,
                    new_price,
                    new_slot_id,
                    ..
                } => {
                    let Some(old) = master_before.slot(*slot_id) else { continue };
                    let Some(side) = old.committed_side.or(old.role.side()) else {
                        continue;
                    };
                    let price = new_price.unwrap_or(old.price);
                    let (old_value, new_value) = match side {
                        Side::Sell => (old.size, *new_size),
                        Side::Buy => (old.size * old.price, new_size * price),
                    };
                    if let Err(e) = acct.update_optimistic_free_balance(
                        side,
                        old_value,
                        new_value,
                        if new_slot_id.is_some() {
                            "cow-rotate"
                        } else {
                            "cow-update"
                        },
                        0.0,
                        false,
                    ) {
                        warn!("post-commit accounting drift on update: {e}");
                    }
                    acct.accrue_network_fee(fees.update_fee);
                }
                Action::Cancel { slot_id, .. } => {
                    let Some(old) = master_before.slot(*slot_id) else { continue };
                    let Some(side) = old.committed_side.or(old.role.side()) else {
                        continue;
                    };
                    let value = match side {
                        Side::Sell => old.size,
                        Side::Buy => old.size * old.price,
                    };
                    acct.release(side, value);
                    acct.accrue_network_fee(fees.cancel_fee);
                }
            }
        }
    }

    /// Directed cleanup for orders the chain no longer knows: their slots
    /// become SPREAD placeholders, their funds are released, and the ids
    /// enter the stale-cleaned ledger.
    pub(crate) async fn cleanup_stale_orders(&self, stale_ids: &[String]) -> EngineResult<()> {
        let now = now_ms();
        let _grid_guard = self.grid_lock.lock().await;
        let master = self.master();

        let mut updated: Vec<GridSlot> = Vec::new();
        let mut released: Vec<(Side, f64)> = Vec::new();

        for stale_id in stale_ids {
            let Some(slot) = master.find_by_order_id(stale_id) else {
                self.pipeline.mark_stale_cleaned(stale_id, now);
                continue;
            };
            let mut cleaned = slot.clone();
            if let Some(side) = cleaned.committed_side.or(cleaned.role.side()) {
                let value = match side {
                    Side::Sell => cleaned.size,
                    Side::Buy => cleaned.size * cleaned.price,
                };
                released.push((side, value));
            }
            cleaned.to_spread_placeholder();
            info!(
                "stale order {stale_id}: slot {} cleaned to spread placeholder",
                cleaned.id
            );
            updated.push(cleaned);
            self.pipeline.mark_stale_cleaned(stale_id, now);
        }

        if !updated.is_empty() {
            let next = master.with_updates(updated, master.boundary_idx);
            self.publish_master(next);
        }
        drop(_grid_guard);

        let mut acct = self.accountant.lock().await;
        for (side, value) in released {
            acct.release(side, value);
        }
        Ok(())
    }
}

/// Cooperative shadow locks over the order ids and slot ids a batch
/// touches. Dropped (and released) when the batch finishes either way.
struct ShadowGuard<'a, R: DexRpc + 'static> {
    engine: &'a GridEngine<R>,
    order_ids: Vec<String>,
    slot_ids: Vec<SlotId>,
}

impl<'a, R: DexRpc + 'static> ShadowGuard<'a, R> {
    fn acquire(engine: &'a GridEngine<R>, actions: &[Action]) -> Self {
        let order_ids: Vec<String> = actions
            .iter()
            .filter_map(|a| a.order_id().map(str::to_string))
            .collect();
        let slot_ids: Vec<SlotId> = actions.iter().flat_map(|a| a.slot_ids()).collect();

        {
            let mut shadow = engine.shadow_order_ids.lock().unwrap();
            for oid in &order_ids {
                shadow.insert(oid.clone());
            }
        }
        {
            let mut shadow = engine.shadow_slot_ids.lock().unwrap();
            for id in &slot_ids {
                shadow.insert(*id);
            }
        }
        Self {
            engine,
            order_ids,
            slot_ids,
        }
    }
}

impl<R: DexRpc + 'static> Drop for ShadowGuard<'_, R> {
    fn drop(&mut self) {
        let mut shadow = self.engine.shadow_order_ids.lock().unwrap();
        for oid in &self.order_ids {
            shadow.remove(oid);
        }
        drop(shadow);
        let mut shadow = self.engine.shadow_slot_ids.lock().unwrap();
        for id in &self.slot_ids {
            shadow.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stale_ids_known_patterns() {
        assert_eq!(
            parse_stale_order_ids("Limit order 1.7.42 does not exist"),
            vec!["1.7.42".to_string()]
        );
        assert_eq!(
            parse_stale_order_ids("Unable to find Object 1.7.99"),
            vec!["1.7.99".to_string()]
        );
        assert_eq!(
            parse_stale_order_ids("object 1.7.7 not found"),
            vec!["1.7.7".to_string()]
        );
    }

    #[test]
    fn test_parse_stale_ids_requires_marker() {
        // An id with no stale marker is not a cleanup signal
        assert!(parse_stale_order_ids("insufficient balance for 1.7.42").is_empty());
        assert!(parse_stale_order_ids("connection reset").is_empty());
    }

    #[test]
    fn test_parse_stale_ids_dedups() {
        let ids = parse_stale_order_ids(
            "Limit order 1.7.42 does not exist; object 1.7.42 not found",
        );
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_outside_in_pair_grouping() {
        let actions = vec![
            Action::Create { slot_id: 0, side: Side::Buy, price: 90.0, size: 1.0 },
            Action::Create { slot_id: 1, side: Side::Buy, price: 95.0, size: 1.0 },
            Action::Create { slot_id: 5, side: Side::Sell, price: 105.0, size: 1.0 },
            Action::Create { slot_id: 6, side: Side::Sell, price: 110.0, size: 1.0 },
        ];
        let groups = outside_in_pairs(&actions);
        assert_eq!(groups.len(), 2);
        // First group: outermost sell (110) + outermost buy (90)
        assert_eq!(groups[0], vec![3, 0]);
        // Second group: inner sell (105) + inner buy (95)
        assert_eq!(groups[1], vec![2, 1]);
    }

    #[test]
    fn test_outside_in_handles_uneven_sides() {
        let actions = vec![
            Action::Create { slot_id: 0, side: Side::Buy, price: 90.0, size: 1.0 },
            Action::Create { slot_id: 5, side: Side::Sell, price: 105.0, size: 1.0 },
            Action::Create { slot_id: 6, side: Side::Sell, price: 110.0, size: 1.0 },
        ];
        let groups = outside_in_pairs(&actions);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        // Leftover sell trails as a singleton group
        assert_eq!(groups[1], vec![1]);
    }

    #[test]
    fn test_two_sided_create_detection() {
        let two_sided = vec![
            Action::Create { slot_id: 0, side: Side::Buy, price: 90.0, size: 1.0 },
            Action::Create { slot_id: 5, side: Side::Sell, price: 105.0, size: 1.0 },
        ];
        assert!(is_two_sided_create_batch(&two_sided));

        let one_sided = vec![Action::Create {
            slot_id: 0,
            side: Side::Buy,
            price: 90.0,
            size: 1.0,
        }];
        assert!(!is_two_sided_create_batch(&one_sided));

        let mixed = vec![
            Action::Create { slot_id: 0, side: Side::Buy, price: 90.0, size: 1.0 },
            Action::Cancel { slot_id: 5, order_id: "1.7.1".into() },
        ];
        assert!(!is_two_sided_create_batch(&mixed));
    }
}
