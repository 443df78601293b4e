//! The grid engine: locks, lifecycle, and the fill-processing consumer
//!
//! One `GridEngine` drives one bot. All state mutation happens inside task
//! bodies holding the appropriate lock; the canonical order is
//! `fill_lock -> divergence_lock`, with `grid_lock` serializing master
//! swaps at the bottom. The fill listener is a producer task pushing into
//! the pipeline queue; a single consumer drains it.

pub mod cow;
pub mod maintenance;
pub mod metrics;
pub mod snapshot;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Notify};

use crate::accounting::Accountant;
use crate::chain::client::{DexRpc, RetryPolicy};
use crate::chain::types::{FillEvent, FillProcessingMode, OpenOrder};
use crate::config::{BotConfig, EngineSettings, PriceMode};
use crate::consts::TRIGGER_DEBOUNCE_MS;
use crate::errors::{EngineError, EngineResult};
use crate::fees::{FeeCache, FeeSchedule};
use crate::grid::model::Grid;
use crate::grid::sizing::{self, SideSizing};
use crate::grid::types::{GridSlot, PerSide, Side, SlotId};
use crate::grid::working::CowPlan;
use crate::math;
use crate::pipeline::{now_ms, FillPipeline};
use crate::strategy::{FilledOrder, Rebalancer};

use metrics::EngineMetrics;
use snapshot::{BotSnapshot, SnapshotStore};

/// Immutable per-bot context assembled during startup.
#[derive(Debug)]
pub struct Context {
    pub account_name: String,
    pub account_id: StdRwLock<Option<String>>,
    pub fees: FeeCache,
}

/// Why a maintenance pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceTrigger {
    Startup,
    Periodic,
    PostFill,
}

/// The engine for a single grid bot.
pub struct GridEngine<R: DexRpc> {
    pub(crate) rpc: Arc<R>,
    pub(crate) settings: EngineSettings,
    pub(crate) config: StdRwLock<BotConfig>,
    pub(crate) ctx: Context,

    /// Published master grid; swapped atomically under `grid_lock`.
    master: StdRwLock<Arc<Grid>>,

    /// Outermost lock: queue drain, startup, maintenance, shutdown.
    pub(crate) fill_lock: Mutex<()>,
    /// Inner lock: structural corrections.
    pub(crate) divergence_lock: Mutex<()>,
    /// Serializes working-grid commits.
    pub(crate) grid_lock: Mutex<()>,

    /// Cooperative exclusion set of chain order ids in flight.
    pub(crate) shadow_order_ids: StdMutex<HashSet<String>>,
    pub(crate) shadow_slot_ids: StdMutex<HashSet<SlotId>>,

    pub(crate) accountant: Mutex<Accountant>,
    pub(crate) pipeline: FillPipeline,
    pub(crate) metrics: EngineMetrics,

    /// Ideal per-slot sizes from the last sizing pass.
    pub(crate) ideal_sizes: StdMutex<PerSide<SideSizing>>,
    /// Sides flagged divergent, consumed by maintenance.
    pub(crate) sides_updated: StdMutex<HashSet<Side>>,
    pub(crate) doubled_sides: StdMutex<PerSide<bool>>,

    pub(crate) store: SnapshotStore,
    pub(crate) retry: RetryPolicy,

    pub(crate) shutting_down: AtomicBool,
    /// Maintenance skips this many cycles after a recovery.
    pub(crate) maintenance_cooldown: AtomicU32,
    /// In-flight pipeline operation markers: name -> started ms.
    pub(crate) pipeline_ops: StdMutex<HashMap<String, u64>>,
    pub(crate) persistence_warning: AtomicBool,

    /// Wakes the consumer task; deferred rescheduling goes through here so
    /// the consumer never re-enters itself.
    pub(crate) consume_notify: Notify,
}

/// How a single raw event resolved against the grid.
enum FillResolution {
    /// Slot-resolved fill, ready for rebalancing.
    Resolved(FilledOrder),
    /// Known stale-cleaned order: funds already released, skip.
    StaleCleaned,
    /// Unknown order: proceeds credited, excluded from rebalance.
    Orphan,
    /// Not an order-match op or a duplicate.
    Ignored,
}

impl<R: DexRpc + 'static> GridEngine<R> {
    pub fn new(rpc: Arc<R>, config: BotConfig, settings: EngineSettings) -> EngineResult<Self> {
        config.validate()?;

        let store = SnapshotStore::new(settings.profiles_dir.clone(), config.bot_key.clone());
        let retry = RetryPolicy {
            max_attempts: settings.rpc_max_attempts,
            base_delay_ms: settings.rpc_base_delay_ms,
            max_delay_ms: settings.rpc_max_delay_ms,
        };
        let accountant = Accountant::new(config.pair.clone(), FeeSchedule::default());
        let grid = Grid::create(&config)?;

        Ok(Self {
            rpc,
            settings,
            ctx: Context {
                account_name: config.account.clone(),
                account_id: StdRwLock::new(None),
                fees: FeeCache::new(),
            },
            config: StdRwLock::new(config),
            master: StdRwLock::new(Arc::new(grid)),
            fill_lock: Mutex::new(()),
            divergence_lock: Mutex::new(()),
            grid_lock: Mutex::new(()),
            shadow_order_ids: StdMutex::new(HashSet::new()),
            shadow_slot_ids: StdMutex::new(HashSet::new()),
            accountant: Mutex::new(accountant),
            pipeline: FillPipeline::new(),
            metrics: EngineMetrics::new(),
            ideal_sizes: StdMutex::new(PerSide::default()),
            sides_updated: StdMutex::new(HashSet::new()),
            doubled_sides: StdMutex::new(PerSide::default()),
            store,
            retry,
            shutting_down: AtomicBool::new(false),
            maintenance_cooldown: AtomicU32::new(0),
            pipeline_ops: StdMutex::new(HashMap::new()),
            persistence_warning: AtomicBool::new(false),
            consume_notify: Notify::new(),
        })
    }

    // --- shared accessors ----------------------------------------------------

    /// The published master grid.
    pub fn master(&self) -> Arc<Grid> {
        self.master.read().unwrap().clone()
    }

    /// Swap the master. Callers must hold `grid_lock`; the version of `next`
    /// must already be bumped past the current master's.
    pub(crate) fn publish_master(&self, next: Grid) -> Arc<Grid> {
        let published = Arc::new(next);
        *self.master.write().unwrap() = published.clone();
        published
    }

    pub fn bot_config(&self) -> BotConfig {
        self.config.read().unwrap().clone()
    }

    pub fn metrics_snapshot(&self) -> metrics::MetricsSnapshot {
        self.metrics
            .recent_fills_tracked
            .store(self.pipeline.recent_fills_tracked() as u64, Ordering::Relaxed);
        self.metrics
            .shadow_locks_active
            .store(self.shadow_order_ids.lock().unwrap().len() as u64, Ordering::Relaxed);
        self.metrics
            .queue_depth
            .store(self.pipeline.queue_len() as u64, Ordering::Relaxed);
        self.metrics.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn account_id(&self) -> EngineResult<String> {
        self.ctx
            .account_id
            .read()
            .unwrap()
            .clone()
            .ok_or(EngineError::NoAccount)
    }

    /// Pipeline-consensus gate: maintenance and corrections only run when
    /// nothing is in flight anywhere in the pipeline.
    pub fn pipeline_empty(&self) -> bool {
        if !self.pipeline.is_queue_empty() {
            return false;
        }
        if !self.shadow_order_ids.lock().unwrap().is_empty() {
            return false;
        }
        if !self.pipeline_ops.lock().unwrap().is_empty() {
            return false;
        }
        true
    }

    pub(crate) fn mark_pipeline_op(&self, name: &str) {
        self.pipeline_ops
            .lock()
            .unwrap()
            .insert(name.to_string(), now_ms());
    }

    pub(crate) fn clear_pipeline_op(&self, name: &str) {
        self.pipeline_ops.lock().unwrap().remove(name);
    }

    /// Markers older than the stuck threshold are cleared so a crashed path
    /// cannot block maintenance forever.
    pub(crate) fn clear_stale_pipeline_ops(&self) {
        let now = now_ms();
        self.pipeline_ops.lock().unwrap().retain(|name, started| {
            let stuck = now.saturating_sub(*started) >= crate::consts::STUCK_PIPELINE_OP_MS;
            if stuck {
                warn!("clearing stuck pipeline op '{name}'");
            }
            !stuck
        });
    }

    // --- startup / shutdown --------------------------------------------------

    /// Bring the engine up: connect, resolve the account, load fees, restore
    /// or build the grid, reconcile with the chain, and size both rails.
    pub async fn initialize(&self, fees: FeeSchedule) -> EngineResult<()> {
        let _guard = self.fill_lock.lock().await;

        self.rpc
            .wait_for_connected(Duration::from_millis(self.settings.connection_timeout_ms))
            .await?;

        let account_name = self.ctx.account_name.clone();
        let account_id = self.rpc.resolve_account_id(&account_name).await?;
        info!("resolved account {account_name} -> {account_id}");
        *self.ctx.account_id.write().unwrap() = Some(account_id.clone());

        self.ctx.fees.populate(fees)?;
        {
            let config = self.bot_config();
            let mut acct = self.accountant.lock().await;
            *acct = Accountant::new(config.pair.clone(), self.ctx.fees.get());
        }

        // Startup trigger handling runs before any state is trusted
        if self.store.trigger_present() {
            info!("startup recalculation trigger present");
            self.handle_trigger_locked().await?;
        } else if let Some(snapshot) = self.store.load() {
            self.restore_from_snapshot(snapshot).await?;
        }

        self.recovery_sync_locked().await?;
        self.recompute_ideal_sizes().await;
        self.accountant.lock().await.finish_bootstrap();

        info!(
            "engine initialized: {} slots, boundary {}, version {}",
            self.master().len(),
            self.master().boundary_idx,
            self.master().version
        );
        Ok(())
    }

    async fn restore_from_snapshot(&self, snapshot: BotSnapshot) -> EngineResult<()> {
        let config = self.bot_config();
        if snapshot.assets != config.pair {
            warn!("snapshot asset metadata differs from config; rebuilding grid");
            return Ok(());
        }
        let grid = snapshot.to_grid();
        // Phantom sweep on load: never trust persisted on-chain claims blindly
        let grid = Arc::new(grid);
        let grid = match grid.correct_phantoms() {
            Some(fixed) => Arc::new(fixed),
            None => grid,
        };
        *self.master.write().unwrap() = grid;
        self.pipeline
            .restore_processed_fills(snapshot.processed_fills);
        *self.doubled_sides.lock().unwrap() = snapshot.doubled_sides;
        info!(
            "restored snapshot: {} slots, version {}, fees owed {:.5}",
            self.master().len(),
            self.master().version,
            snapshot.bts_fees_owed
        );
        // Fee debt survives restarts
        self.accountant
            .lock()
            .await
            .set_bts_fees_owed(snapshot.bts_fees_owed);
        Ok(())
    }

    /// Run the engine until shutdown: listener, consumer, timers.
    pub async fn run(self: Arc<Self>) -> EngineResult<()> {
        let account_id = self.account_id()?;
        let mut fill_rx = self.rpc.listen_for_fills(&account_id).await?;

        // Listener: push raw events and wake the consumer
        let listener = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(events) = fill_rx.recv().await {
                    if engine.is_shutting_down() {
                        break;
                    }
                    let depth = engine.pipeline.push(events);
                    engine.metrics.record_queue_depth(depth as u64);
                    engine.consume_notify.notify_one();
                }
            })
        };

        // Single consumer task
        let consumer = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    engine.consume_notify.notified().await;
                    if engine.is_shutting_down() {
                        break;
                    }
                    engine.consume_fill_queue().await;
                }
            })
        };

        // Periodic maintenance
        let maintenance = {
            let engine = Arc::clone(&self);
            let period = Duration::from_secs(engine.settings.maintenance_interval_secs);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(period);
                timer.tick().await;
                loop {
                    timer.tick().await;
                    if engine.is_shutting_down() {
                        break;
                    }
                    engine.run_maintenance(MaintenanceTrigger::Periodic).await;
                }
            })
        };

        // Open-orders watchdog
        let watchdog = {
            let engine = Arc::clone(&self);
            let period = Duration::from_millis(engine.settings.open_orders_sync_loop_ms);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(period);
                timer.tick().await;
                loop {
                    timer.tick().await;
                    if engine.is_shutting_down() {
                        break;
                    }
                    engine.watchdog_pass().await;
                }
            })
        };

        // Trigger-file watcher with debounce
        let trigger_watcher = {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(Duration::from_secs(1));
                loop {
                    timer.tick().await;
                    if engine.is_shutting_down() {
                        break;
                    }
                    if engine.store.trigger_present() {
                        tokio::time::sleep(Duration::from_millis(TRIGGER_DEBOUNCE_MS)).await;
                        if let Err(e) = engine.handle_trigger().await {
                            error!("trigger handling failed: {e}");
                        }
                    }
                }
            })
        };

        self.run_maintenance(MaintenanceTrigger::Startup).await;

        // Park until shutdown is requested
        while !self.is_shutting_down() {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        self.consume_notify.notify_one();
        for handle in [listener, consumer, maintenance, watchdog, trigger_watcher] {
            handle.abort();
        }
        Ok(())
    }

    /// Graceful shutdown: stop scheduling, await in-flight work, persist.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _guard = self.fill_lock.lock().await;

        let pending = self.pipeline.queue_len();
        if pending > 0 {
            warn!("shutting down with {pending} unprocessed fill events");
        }
        if let Err(e) = self.persist_snapshot().await {
            error!("final snapshot persist failed: {e}");
        }
        info!("engine shut down");
    }

    // --- fill consumption (§ pipeline) ---------------------------------------

    /// Drain and process the fill queue. Single consumer; contention drops
    /// out and the next arrival re-schedules through the notifier.
    pub async fn consume_fill_queue(&self) {
        if self.pipeline.is_queue_empty() || self.is_shutting_down() {
            return;
        }

        if self.accountant.lock().await.is_bootstrap() {
            self.consume_bootstrap().await;
            return;
        }

        let guard = match self.fill_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.metrics
                    .lock_contention_events
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.metrics
            .fill_processing_lock_active
            .store(true, Ordering::Relaxed);
        self.mark_pipeline_op("consume-fill-queue");
        let started = Instant::now();

        let mut any_full_fill = false;
        let mut any_rotation = false;

        loop {
            let events = self.pipeline.drain();
            if events.is_empty() {
                break;
            }
            self.metrics.record_queue_depth(0);

            match self.process_drained_events(events).await {
                Ok((full_fills, rotations)) => {
                    any_full_fill |= full_fills;
                    any_rotation |= rotations;
                }
                Err(e) if e.needs_recovery() => {
                    error!("fill batch failed, entering recovery: {e}");
                    if let Err(re) = self.recovery_sync_locked().await {
                        error!("recovery sync failed: {re}");
                    }
                    self.maintenance_cooldown.store(1, Ordering::SeqCst);
                }
                Err(e) => {
                    error!("fill batch failed: {e}");
                }
            }
        }

        self.pipeline.evict_expired(now_ms());
        if let Err(e) = self.persist_snapshot().await {
            warn!("dedup-cache persist failed: {e}");
        }

        self.metrics.fill_processing_time_ms.fetch_add(
            started.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
        self.clear_pipeline_op("consume-fill-queue");
        self.metrics
            .fill_processing_lock_active
            .store(false, Ordering::Relaxed);
        drop(guard);

        // Post-fill maintenance only after real rotations, and only when the
        // pipeline has gone quiet.
        if any_full_fill && any_rotation {
            self.run_maintenance(MaintenanceTrigger::PostFill).await;
        }

        // Late arrivals reschedule the consumer; never re-enter directly.
        if !self.pipeline.is_queue_empty() {
            self.consume_notify.notify_one();
        }
    }

    /// One drain snapshot: dedup, resolve, sync fill facts, rebalance in
    /// batches. Returns (saw full fill, committed rotations).
    async fn process_drained_events(&self, events: Vec<FillEvent>) -> EngineResult<(bool, bool)> {
        let now = now_ms();
        let mut resolved: Vec<FilledOrder> = Vec::new();

        for event in &events {
            match self.resolve_event(event, now).await? {
                FillResolution::Resolved(fill) => {
                    self.metrics.fills_processed.fetch_add(1, Ordering::Relaxed);
                    resolved.push(fill);
                }
                FillResolution::Orphan => {
                    self.metrics.fills_processed.fetch_add(1, Ordering::Relaxed);
                }
                FillResolution::StaleCleaned | FillResolution::Ignored => {}
            }
        }

        if resolved.is_empty() {
            return Ok((false, false));
        }

        // Chain-driven facts land on the master before any rebalance math
        self.apply_fill_facts(&resolved).await?;
        if self.rpc.fill_processing_mode() == FillProcessingMode::OpenOrders {
            self.sync_open_orders_snapshot().await?;
        }

        let full_fills: Vec<FilledOrder> =
            resolved.iter().filter(|f| f.is_full).cloned().collect();
        let any_full = !full_fills.is_empty();
        let mut any_rotation = false;

        for chunk in crate::pipeline::batch::chunk_fills(&full_fills) {
            let plan = {
                let master = self.master();
                let config = self.bot_config();
                let ideal = self.ideal_sizes.lock().unwrap().clone();
                let shadow = self.shadow_order_ids.lock().unwrap().clone();
                Rebalancer::new(&master, &config, &ideal).process_filled_orders(&chunk, &shadow)
            };
            if plan.actions.is_empty() && plan.boundary_idx == Some(self.master().boundary_idx) {
                continue;
            }
            self.metrics.batches_executed.fetch_add(1, Ordering::Relaxed);
            self.execute_plan(plan).await?;
            any_rotation = true;
        }

        Ok((any_full, any_rotation))
    }

    /// Classify one raw event and perform its accounting side effects.
    async fn resolve_event(
        &self,
        event: &FillEvent,
        now: u64,
    ) -> EngineResult<FillResolution> {
        if !event.is_order_match() {
            debug!("ignoring non-match op code {}", event.op_code);
            return Ok(FillResolution::Ignored);
        }
        if !self.pipeline.should_process(&event.dedup_key(), now) {
            debug!("duplicate fill {} skipped", event.dedup_key());
            return Ok(FillResolution::Ignored);
        }

        let master = self.master();
        let order_id = &event.op.order_id;

        let Some(slot) = master.find_by_order_id(order_id) else {
            if self.pipeline.is_stale_cleaned(order_id, now) {
                debug!("fill for stale-cleaned order {order_id} skipped");
                return Ok(FillResolution::StaleCleaned);
            }
            // Orphan: credit the proceeds, never rebalance on it
            warn!("orphan fill for unknown order {order_id}");
            self.accountant
                .lock()
                .await
                .process_fill_accounting(&event.op)?;
            return Ok(FillResolution::Orphan);
        };

        let config = self.bot_config();
        let side = slot.committed_side.or(slot.role.side()).unwrap_or(Side::Sell);

        // Base-asset amount this event filled: sells pay base out, buys
        // receive base in.
        let filled_base = match side {
            Side::Sell => config.pair.base.to_float(event.op.pays.amount),
            Side::Buy => config.pair.base.to_float(event.op.receives.amount),
        };
        let remaining = config
            .pair
            .base
            .quantize((slot.size - filled_base).max(0.0));
        let is_full = math::to_int(remaining, config.pair.base.precision) == 0;

        self.accountant
            .lock()
            .await
            .process_fill_accounting(&event.op)?;

        Ok(FillResolution::Resolved(FilledOrder {
            slot_id: slot.id,
            side,
            filled_size: filled_base,
            remaining,
            is_full,
            is_maker: event.op.is_maker,
        }))
    }

    /// Record fill facts on the master: full fills virtualize their slot,
    /// partials shrink it. This is a directed, audited mutation: the chain
    /// already did it, COW approval does not apply.
    async fn apply_fill_facts(&self, fills: &[FilledOrder]) -> EngineResult<()> {
        let _grid_guard = self.grid_lock.lock().await;
        let master = self.master();

        let mut updated: Vec<GridSlot> = Vec::new();
        for fill in fills {
            let Some(slot) = master.slot(fill.slot_id) else { continue };
            let mut slot = updated
                .iter()
                .find(|s| s.id == fill.slot_id)
                .cloned()
                .unwrap_or_else(|| slot.clone());
            if fill.is_full {
                slot.virtualize();
            } else {
                let raw = slot.raw_on_chain.clone().map(|mut raw| {
                    raw.for_sale = match fill.side {
                        Side::Sell => {
                            self.bot_config().pair.base.to_int(fill.remaining)
                        }
                        Side::Buy => self
                            .bot_config()
                            .pair
                            .quote
                            .to_int(fill.remaining * slot.price),
                    };
                    raw
                });
                slot.mark_partial(fill.remaining, raw);
            }
            updated.retain(|s| s.id != fill.slot_id);
            updated.push(slot);
        }

        if !updated.is_empty() {
            let next = master.with_updates(updated, master.boundary_idx);
            self.publish_master(next);
        }
        Ok(())
    }

    /// Open-orders sync mode: refresh the snapshot and reconcile price or
    /// size mismatches the event stream may have missed.
    async fn sync_open_orders_snapshot(&self) -> EngineResult<()> {
        let account_id = self.account_id()?;
        let open_orders = self.rpc.read_open_orders(&account_id).await?;
        self.reconcile_open_orders(&open_orders).await
    }

    /// Diff the chain's open orders against the master grid.
    pub(crate) async fn reconcile_open_orders(
        &self,
        open_orders: &[OpenOrder],
    ) -> EngineResult<()> {
        let config = self.bot_config();
        let _grid_guard = self.grid_lock.lock().await;
        let master = self.master();

        let on_chain: HashMap<&str, &OpenOrder> = open_orders
            .iter()
            .map(|o| (o.id.as_str(), o))
            .collect();

        let mut updated: Vec<GridSlot> = Vec::new();
        let mut price_mismatches = 0usize;

        for slot in master.slots().iter().filter(|s| s.is_on_chain()) {
            let Some(order_id) = slot.order_id.as_deref() else {
                // Phantom: auto-correct
                let mut fixed = slot.clone();
                fixed.virtualize();
                updated.push(fixed);
                continue;
            };
            match on_chain.get(order_id) {
                None => {
                    // Gone from chain: treat as fully filled/cancelled
                    let mut fixed = slot.clone();
                    fixed.virtualize();
                    updated.push(fixed);
                }
                Some(order) => {
                    let side = slot.committed_side.or(slot.role.side());
                    let remaining = match side {
                        Some(Side::Buy) => {
                            let quote = config.pair.quote.to_float(order.for_sale);
                            config.pair.base.quantize(quote / slot.price)
                        }
                        _ => config.pair.base.to_float(order.for_sale),
                    };
                    if let Some(implied) = order.implied_price(&config.pair) {
                        let tolerance = math::price_tolerance(
                            slot.price,
                            slot.size.max(remaining).max(1e-9),
                            config.pair.base.precision,
                            (slot.size.max(remaining) * slot.price).max(1e-9),
                            config.pair.quote.precision,
                        );
                        if (implied - slot.price).abs() > tolerance.max(slot.price * 1e-4) {
                            warn!(
                                "price mismatch on slot {}: chain {:.8} vs grid {:.8}",
                                slot.id, implied, slot.price
                            );
                            price_mismatches += 1;
                        }
                    }
                    if (remaining - slot.size).abs() > config.pair.base.precision_slack() {
                        let mut fixed = slot.clone();
                        fixed.mark_partial(remaining, Some(order.raw()));
                        updated.push(fixed);
                    }
                }
            }
        }

        if price_mismatches > 0 {
            // A mismatched rung means the persisted sizing no longer holds;
            // queue both sides for the correction pass.
            let mut sides = self.sides_updated.lock().unwrap();
            sides.insert(Side::Buy);
            sides.insert(Side::Sell);
        }

        if !updated.is_empty() {
            let next = master.with_updates(updated, master.boundary_idx);
            self.publish_master(next);
        }
        Ok(())
    }

    /// Bootstrap mode: rotation-only handling that preserves the startup
    /// grid shape. No rebalance math, no boundary movement.
    async fn consume_bootstrap(&self) {
        let _guard = self.fill_lock.lock().await;
        let now = now_ms();

        loop {
            let events = self.pipeline.drain();
            if events.is_empty() {
                break;
            }
            for event in events {
                let resolution = match self.resolve_event(&event, now).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!("bootstrap fill resolution failed: {e}");
                        continue;
                    }
                };
                let FillResolution::Resolved(fill) = resolution else {
                    continue;
                };
                if let Err(e) = self.apply_fill_facts(&[fill.clone()]).await {
                    error!("bootstrap fill fact failed: {e}");
                    continue;
                }

                let action = {
                    let master = self.master();
                    let config = self.bot_config();
                    let ideal = self.ideal_sizes.lock().unwrap().clone();
                    Rebalancer::new(&master, &config, &ideal).bootstrap_plan(&fill)
                };
                if let Some(action) = action {
                    let plan = CowPlan {
                        actions: vec![action],
                        boundary_idx: None,
                    };
                    if let Err(e) = self.execute_plan(plan).await {
                        error!("bootstrap rotation failed: {e}");
                    }
                }
            }
        }
    }

    // --- recovery & sizing ---------------------------------------------------

    /// Full recovery: re-fetch balances, re-read open orders, reconcile the
    /// grid, recompute the boundary from funds. Callers hold `fill_lock`.
    pub(crate) async fn recovery_sync_locked(&self) -> EngineResult<()> {
        self.mark_pipeline_op("recovery-sync");
        let result = self.recovery_sync_inner().await;
        self.clear_pipeline_op("recovery-sync");
        result
    }

    async fn recovery_sync_inner(&self) -> EngineResult<()> {
        let account_id = self.account_id()?;
        let config = self.bot_config();

        let balances = crate::chain::client::with_retry(&self.retry, "fetch_balances", || {
            let rpc = self.rpc.clone();
            let account_id = account_id.clone();
            let pair = config.pair.clone();
            async move { rpc.fetch_balances(&account_id, &pair).await }
        })
        .await?;

        let open_orders = crate::chain::client::with_retry(&self.retry, "read_open_orders", || {
            let rpc = self.rpc.clone();
            let account_id = account_id.clone();
            async move { rpc.read_open_orders(&account_id).await }
        })
        .await?;

        self.adopt_unknown_orders(&open_orders).await?;
        self.reconcile_open_orders(&open_orders).await?;

        // Fund-driven boundary recomputation after the structural resync
        {
            let _grid_guard = self.grid_lock.lock().await;
            let master = self.master();
            let committed = master.committed_value();
            let mid = master
                .slot(master.boundary_idx as SlotId)
                .map(|s| s.price)
                .unwrap_or(1.0);
            let buy_value = balances.buy_free + committed.buy;
            let sell_value = (balances.sell_free + committed.sell) * mid;
            let boundary = master.boundary_from_funds(buy_value, sell_value);
            if boundary != master.boundary_idx {
                info!(
                    "fund-driven boundary move {} -> {boundary}",
                    master.boundary_idx
                );
                let changed = master.assign_roles(boundary, master.gap);
                let next = master.with_updates(changed, boundary);
                self.publish_master(next);
            }
        }

        {
            let mut acct = self.accountant.lock().await;
            acct.set_account_totals(balances);
            acct.set_committed(self.master().committed_value());
            acct.clear_drift_flag();
        }

        self.persist_snapshot().await?;
        Ok(())
    }

    /// Adopt chain orders the grid does not know, matching them to rungs by
    /// price within tolerance.
    async fn adopt_unknown_orders(&self, open_orders: &[OpenOrder]) -> EngineResult<()> {
        let config = self.bot_config();
        let _grid_guard = self.grid_lock.lock().await;
        let master = self.master();

        let mut updated: Vec<GridSlot> = Vec::new();
        for order in open_orders {
            if master.find_by_order_id(&order.id).is_some() {
                continue;
            }
            let Some(side) = order.side(&config.pair) else { continue };
            let Some(price) = order.implied_price(&config.pair) else { continue };

            let candidate = master
                .slots()
                .iter()
                .filter(|s| !s.is_occupied())
                .filter(|s| updated.iter().all(|u| u.id != s.id))
                .min_by(|a, b| {
                    (a.price - price)
                        .abs()
                        .partial_cmp(&(b.price - price).abs())
                        .expect("prices are finite")
                });
            let Some(slot) = candidate else { continue };

            let relative_gap = (slot.price - price).abs() / price;
            if relative_gap > config.increment_percent / 100.0 / 2.0 {
                warn!(
                    "open order {} at {:.8} matches no rung (closest {:.8}); leaving it alone",
                    order.id, price, slot.price
                );
                continue;
            }

            let size = match side {
                Side::Sell => config.pair.base.to_float(order.for_sale),
                Side::Buy => {
                    let quote = config.pair.quote.to_float(order.for_sale);
                    config.pair.base.quantize(quote / slot.price)
                }
            };
            let mut adopted = slot.clone();
            adopted.role = match side {
                Side::Buy => crate::grid::types::SlotRole::Buy,
                Side::Sell => crate::grid::types::SlotRole::Sell,
            };
            adopted.mark_active(order.id.clone(), Some(order.raw()));
            adopted.size = size;
            info!(
                "adopted chain order {} into slot {} ({side:?} {:.8} @ {:.8})",
                order.id, adopted.id, size, slot.price
            );
            updated.push(adopted);
        }

        if !updated.is_empty() {
            let next = master.with_updates(updated, master.boundary_idx);
            self.publish_master(next);
        }
        Ok(())
    }

    /// Re-derive the ideal per-slot sizing from the current fund state.
    pub(crate) async fn recompute_ideal_sizes(&self) {
        let config = self.bot_config();
        let master = self.master();
        let (free, committed) = {
            let acct = self.accountant.lock().await;
            (acct.free_per_side(), acct.committed())
        };
        let active = master.active_counts();

        let buy = sizing::size_side(
            &master,
            &config.pair,
            Side::Buy,
            free.buy + committed.buy,
            config.allocation_weight,
            config.increment_percent,
            config.fee_reserve,
            active,
        );
        let sell = sizing::size_side(
            &master,
            &config.pair,
            Side::Sell,
            free.sell + committed.sell,
            config.allocation_weight,
            config.increment_percent,
            config.fee_reserve,
            active,
        );
        *self.ideal_sizes.lock().unwrap() = PerSide { buy, sell };
    }

    // --- trigger handling ----------------------------------------------------

    /// Runtime trigger handling: grabs the fill lock first.
    pub async fn handle_trigger(&self) -> EngineResult<()> {
        let _guard = self.fill_lock.lock().await;
        self.handle_trigger_locked().await
    }

    /// Reload config, regenerate the grid, reset fee debt and doubled
    /// flags, delete the trigger. Callers hold `fill_lock`.
    async fn handle_trigger_locked(&self) -> EngineResult<()> {
        info!("handling grid recalculation trigger");

        // Reload bot config from disk when present; otherwise keep current
        let config_path = self
            .store
            .profiles_dir()
            .join("bots")
            .join(format!("{}.json", self.store.bot_key()));
        let mut config = self.bot_config();
        if config_path.exists() {
            match BotConfig::load_from_file(&config_path) {
                Ok(fresh) => {
                    info!("reloaded bot config from {:?}", config_path);
                    config = fresh;
                }
                Err(e) => warn!("config reload failed, keeping current: {e}"),
            }
        }

        if let Ok(Some(price)) = self.derive_start_price(&config).await {
            info!("derived start price {price:.8} ({:?})", config.price_mode);
            config.start_price = price;
            if config.start_price < config.min_price {
                config.start_price = config.min_price;
            }
            if config.start_price > config.max_price {
                config.start_price = config.max_price;
            }
        }

        let grid = Grid::create(&config)?;
        {
            let _grid_guard = self.grid_lock.lock().await;
            let version = self.master().version + 1;
            let grid = Grid::from_parts(
                grid.slots().to_vec(),
                grid.boundary_idx,
                grid.gap,
                version,
            );
            self.publish_master(grid);
        }
        *self.config.write().unwrap() = config;

        {
            let mut acct = self.accountant.lock().await;
            acct.set_bts_fees_owed(0.0);
        }
        *self.doubled_sides.lock().unwrap() = PerSide::default();

        self.store.remove_trigger()?;
        self.persist_snapshot().await?;
        info!("grid regenerated: {} slots", self.master().len());
        Ok(())
    }

    /// Resolve the start price for the configured derivation mode.
    async fn derive_start_price(&self, config: &BotConfig) -> EngineResult<Option<f64>> {
        match config.price_mode {
            PriceMode::Pool => self.rpc.fetch_pool_price(&config.pair).await,
            PriceMode::Market => self.rpc.fetch_market_price(&config.pair).await,
            PriceMode::Auto => {
                if let Some(price) = self.rpc.fetch_pool_price(&config.pair).await? {
                    return Ok(Some(price));
                }
                self.rpc.fetch_market_price(&config.pair).await
            }
        }
    }

    // --- watchdog ------------------------------------------------------------

    /// Periodic open-orders/balances drift check.
    async fn watchdog_pass(&self) {
        if !self.pipeline_empty() {
            return;
        }
        let Ok(account_id) = self.account_id() else { return };
        let config = self.bot_config();

        let Ok(balances) = self.rpc.fetch_balances(&account_id, &config.pair).await else {
            return;
        };

        let drifted = {
            let mut acct = self.accountant.lock().await;
            acct.set_account_totals(balances);
            acct.set_committed(self.master().committed_value());
            acct.check_fund_drift()
        };
        if drifted.is_empty() {
            return;
        }

        warn!("watchdog detected fund drift on {drifted:?}, scheduling recovery");
        let _guard = self.fill_lock.lock().await;
        if let Err(e) = self.recovery_sync_locked().await {
            error!("watchdog recovery failed: {e}");
        }
    }

    // --- persistence ---------------------------------------------------------

    /// Write the bot snapshot. Failures set the persistence warning flag and
    /// are retried on the next opportunity.
    pub(crate) async fn persist_snapshot(&self) -> EngineResult<()> {
        let config = self.bot_config();
        let bts_fees_owed = self.accountant.lock().await.bts_fees_owed();
        let snapshot = BotSnapshot::from_grid(
            &self.master(),
            bts_fees_owed,
            *self.doubled_sides.lock().unwrap(),
            self.pipeline.processed_fills_snapshot(),
            config.pair.clone(),
        );
        match self.store.save(&snapshot) {
            Ok(()) => {
                self.persistence_warning.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.persistence_warning.store(true, Ordering::Relaxed);
                Err(EngineError::PersistenceFailure(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::client::mock::MockRpc;
    use crate::chain::types::{AssetAmount, BalanceSnapshot, BuiltOp, FillOp};
    use crate::config::tests::test_config;
    use crate::grid::types::{SlotRole, SlotState};
    use crate::grid::working::Action;

    fn unique_settings(tag: &str) -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.profiles_dir = std::env::temp_dir().join(format!(
            "dexgrid-engine-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&settings.profiles_dir);
        settings
    }

    /// Engine initialized against the mock chain with balances chosen so the
    /// fund-driven boundary recompute lands on the constructed default.
    async fn ready_engine(tag: &str) -> (Arc<GridEngine<MockRpc>>, Arc<MockRpc>) {
        let rpc = Arc::new(MockRpc::new());
        rpc.set_balances(BalanceSnapshot {
            buy: 51_000.0,
            sell: 490.0,
            buy_free: 51_000.0,
            sell_free: 490.0,
            fee_free: 100.0,
        });
        let engine = Arc::new(
            GridEngine::new(rpc.clone(), test_config(), unique_settings(tag)).unwrap(),
        );
        engine
            .initialize(crate::fees::FeeSchedule {
                create_fee: 0.1,
                update_fee: 0.05,
                cancel_fee: 0.01,
            })
            .await
            .unwrap();
        // Deterministic assertions: burn the first post-fill maintenance pass
        engine.maintenance_cooldown.store(1, Ordering::SeqCst);
        (engine, rpc)
    }

    /// Place one sell order through the COW path; returns (slot id, oid).
    async fn place_sell(
        engine: &Arc<GridEngine<MockRpc>>,
        slot_offset: usize,
        size: f64,
    ) -> (SlotId, String) {
        let master = engine.master();
        let slot_id = (master.boundary_idx + master.gap + 1 + slot_offset) as SlotId;
        let price = master.slot(slot_id).unwrap().price;
        engine
            .execute_plan(crate::grid::working::CowPlan {
                actions: vec![Action::Create {
                    slot_id,
                    side: Side::Sell,
                    price,
                    size,
                }],
                boundary_idx: None,
            })
            .await
            .unwrap();
        let oid = engine
            .master()
            .slot(slot_id)
            .unwrap()
            .order_id
            .clone()
            .expect("create assigned an order id");
        (slot_id, oid)
    }

    fn sell_fill(
        engine: &Arc<GridEngine<MockRpc>>,
        oid: &str,
        size: f64,
        price: f64,
        block: u64,
        event_id: &str,
    ) -> FillEvent {
        let pair = engine.bot_config().pair;
        FillEvent::order_match(
            FillOp {
                order_id: oid.to_string(),
                pays: AssetAmount {
                    amount: pair.base.to_int(size),
                    asset_id: pair.base.id.clone(),
                },
                receives: AssetAmount {
                    amount: pair.quote.to_int(size * price),
                    asset_id: pair.quote.id.clone(),
                },
                is_maker: true,
            },
            block,
            event_id,
        )
    }

    #[tokio::test]
    async fn test_single_sell_fill_rotates_to_buy() {
        let (engine, rpc) = ready_engine("s3").await;
        let boundary_before = engine.master().boundary_idx;
        let (slot_id, oid) = place_sell(&engine, 0, 2.0).await;
        let fill_price = engine.master().slot(slot_id).unwrap().price;
        let batches_before = rpc.batches_executed();

        engine.pipeline.push(vec![sell_fill(&engine, &oid, 2.0, fill_price, 100, "a")]);
        engine.consume_fill_queue().await;

        let master = engine.master();
        // The filled slot is no longer on chain
        let filled = master.slot(slot_id).unwrap();
        assert_eq!(filled.state, SlotState::Virtual);
        assert!(filled.order_id.is_none());
        // Boundary advanced
        assert_eq!(master.boundary_idx, boundary_before + 1);
        // The new top-of-buy slot carries a fresh buy order
        let new_bid = master.slot(master.boundary_idx as SlotId).unwrap();
        assert_eq!(new_bid.role, SlotRole::Buy);
        assert_eq!(new_bid.state, SlotState::Active);
        assert!(new_bid.order_id.is_some());
        // Exactly one extra batch went out, containing one buy create
        assert_eq!(rpc.batches_executed(), batches_before + 1);
        let last = rpc.last_batch().unwrap();
        assert_eq!(last.len(), 1);
        match &last[0] {
            BuiltOp::Create { sell_asset_id, .. } => {
                assert_eq!(sell_asset_id, &engine.bot_config().pair.quote.id);
            }
            other => panic!("expected create, got {other:?}"),
        }
        // Fund invariant holds after the whole cycle
        assert!(engine.accountant.lock().await.check_fund_drift().is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_reduces_without_rotation() {
        let (engine, rpc) = ready_engine("partial").await;
        let boundary_before = engine.master().boundary_idx;
        let (slot_id, oid) = place_sell(&engine, 0, 4.0).await;
        let fill_price = engine.master().slot(slot_id).unwrap().price;
        let batches_before = rpc.batches_executed();

        engine.pipeline.push(vec![sell_fill(&engine, &oid, 1.5, fill_price, 101, "b")]);
        engine.consume_fill_queue().await;

        let master = engine.master();
        let slot = master.slot(slot_id).unwrap();
        assert_eq!(slot.state, SlotState::Partial);
        assert!((slot.size - 2.5).abs() < 1e-9);
        assert_eq!(slot.order_id.as_deref(), Some(oid.as_str()));
        // Partials never shift the boundary or broadcast anything
        assert_eq!(engine.master().boundary_idx, boundary_before);
        assert_eq!(rpc.batches_executed(), batches_before);
    }

    #[tokio::test]
    async fn test_duplicate_fill_is_idempotent() {
        let (engine, _rpc) = ready_engine("dedup").await;
        let (slot_id, oid) = place_sell(&engine, 0, 4.0).await;
        let fill_price = engine.master().slot(slot_id).unwrap().price;

        // The same event delivered twice in one drain
        let event = sell_fill(&engine, &oid, 1.0, fill_price, 102, "dup");
        engine.pipeline.push(vec![event.clone(), event]);
        engine.consume_fill_queue().await;

        // Exactly one accounting effect: one partial reduction of 1.0
        let master = engine.master();
        let slot = master.slot(slot_id).unwrap();
        assert!((slot.size - 3.0).abs() < 1e-9);
        let totals = engine.accountant.lock().await.totals();
        assert!((totals.buy - (51_000.0 + 1.0 * fill_price)).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_orphan_fill_credited_once_and_stale_skipped() {
        let (engine, _rpc) = ready_engine("orphan").await;
        let pair = engine.bot_config().pair;
        let buy_before = engine.accountant.lock().await.totals().buy;

        // Unknown order id: orphan, proceeds credited
        engine
            .pipeline
            .push(vec![sell_fill(&engine, "1.7.31337", 1.0, 100.0, 103, "o1")]);
        engine.consume_fill_queue().await;
        let buy_after = engine.accountant.lock().await.totals().buy;
        assert!((buy_after - buy_before - 100.0).abs() < pair.quote.precision_slack());

        // Stale-cleaned order id within retention: no credit
        engine.pipeline.mark_stale_cleaned("1.7.31338", now_ms());
        engine
            .pipeline
            .push(vec![sell_fill(&engine, "1.7.31338", 1.0, 100.0, 104, "o2")]);
        engine.consume_fill_queue().await;
        let buy_final = engine.accountant.lock().await.totals().buy;
        assert!((buy_final - buy_after).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_order_cleanup_and_retry() {
        let (engine, rpc) = ready_engine("s6").await;
        let (slot_a, oid_a) = place_sell(&engine, 0, 2.0).await;
        let (slot_b, oid_b) = place_sell(&engine, 1, 2.0).await;

        // First broadcast fails naming oid_a; the retry succeeds
        rpc.push_batch_failure(Some(&format!("Limit order {oid_a} does not exist")));

        let result = engine
            .execute_plan(crate::grid::working::CowPlan {
                actions: vec![
                    Action::Cancel {
                        slot_id: slot_a,
                        order_id: oid_a.clone(),
                    },
                    Action::Cancel {
                        slot_id: slot_b,
                        order_id: oid_b.clone(),
                    },
                ],
                boundary_idx: None,
            })
            .await;
        assert!(result.is_ok());

        let master = engine.master();
        // The stale slot was cleaned to a spread placeholder
        let cleaned = master.slot(slot_a).unwrap();
        assert_eq!(cleaned.role, SlotRole::Spread);
        assert!(cleaned.order_id.is_none());
        // And its id is in the stale-cleaned ledger
        assert!(engine.pipeline.is_stale_cleaned(&oid_a, now_ms()));
        // The surviving cancel was retried: last batch contains only oid_b
        let last = rpc.last_batch().unwrap();
        assert_eq!(last.len(), 1);
        match &last[0] {
            BuiltOp::Cancel { order_id } => assert_eq!(order_id, &oid_b),
            other => panic!("expected cancel, got {other:?}"),
        }
        assert_eq!(master.slot(slot_b).unwrap().role, SlotRole::Spread);
    }

    #[tokio::test]
    async fn test_rotation_moves_order_id_between_slots() {
        let (engine, _rpc) = ready_engine("s7").await;
        let (source_id, oid) = place_sell(&engine, 0, 83.9).await;
        let master = engine.master();
        let target_id = source_id + 3;
        let target_price = master.slot(target_id).unwrap().price;

        engine
            .execute_plan(crate::grid::working::CowPlan {
                actions: vec![Action::Update {
                    slot_id: source_id,
                    order_id: oid.clone(),
                    new_size: 83.9,
                    new_price: Some(target_price),
                    new_slot_id: Some(target_id),
                }],
                boundary_idx: None,
            })
            .await
            .unwrap();

        let master = engine.master();
        let source = master.slot(source_id).unwrap();
        assert_eq!(source.state, SlotState::Virtual);
        assert!(source.order_id.is_none());

        let target = master.slot(target_id).unwrap();
        assert_eq!(target.state, SlotState::Active);
        assert_eq!(target.order_id.as_deref(), Some(oid.as_str()));
        assert!((target.size - 83.9).abs() < 1e-9);
        assert!((target.price - target_price).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_contended_consumer_drops_out_and_recovers() {
        let (engine, _rpc) = ready_engine("s8").await;
        let (slot_id, oid) = place_sell(&engine, 0, 3.0).await;
        let fill_price = engine.master().slot(slot_id).unwrap().price;

        engine
            .pipeline
            .push(vec![sell_fill(&engine, &oid, 1.0, fill_price, 105, "c1")]);

        // Batch B arrives while "processing" (the lock is held elsewhere)
        let guard = engine.fill_lock.lock().await;
        engine.consume_fill_queue().await;
        assert_eq!(
            engine.metrics.snapshot().lock_contention_events,
            1,
            "contended consumer must drop out"
        );
        // Nothing was consumed under contention
        assert_eq!(engine.pipeline.queue_len(), 1);
        drop(guard);

        // The next attempt drains everything, in order, exactly once
        engine
            .pipeline
            .push(vec![sell_fill(&engine, &oid, 1.0, fill_price, 106, "c2")]);
        engine.consume_fill_queue().await;
        assert!(engine.pipeline.is_queue_empty());
        let master = engine.master();
        let slot = master.slot(slot_id).unwrap();
        assert!((slot.size - 1.0).abs() < 1e-9);
        assert!(engine.accountant.lock().await.check_fund_drift().is_empty());
    }

    #[tokio::test]
    async fn test_stale_working_grid_rejected() {
        let (engine, _rpc) = ready_engine("stale-version").await;
        let master = engine.master();
        let slot_id = master.boundary_idx as SlotId;
        let price = master.slot(slot_id).unwrap().price;

        // Build a working grid, then move the master underneath it
        let working = crate::grid::working::WorkingGrid::new(master.clone());
        {
            let _guard = engine.grid_lock.lock().await;
            let bumped = master.with_updates(Vec::new(), master.boundary_idx);
            engine.publish_master(bumped);
        }

        let err = engine
            .commit_working(working, &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleWorkingGrid { .. }));
        // And a fresh plan against the new master still succeeds
        engine
            .execute_plan(crate::grid::working::CowPlan {
                actions: vec![Action::Create {
                    slot_id,
                    side: Side::Buy,
                    price,
                    size: 1.0,
                }],
                boundary_idx: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_trigger_regenerates_grid_and_resets_state() {
        let (engine, _rpc) = ready_engine("trigger").await;
        engine.accountant.lock().await.set_bts_fees_owed(42.0);
        *engine.doubled_sides.lock().unwrap() = PerSide { buy: true, sell: false };

        std::fs::create_dir_all(engine.store.profiles_dir()).unwrap();
        std::fs::write(engine.store.trigger_path(), b"").unwrap();
        let version_before = engine.master().version;

        engine.handle_trigger().await.unwrap();

        assert!(!engine.store.trigger_present());
        assert!(engine.master().version > version_before);
        assert_eq!(engine.accountant.lock().await.bts_fees_owed(), 0.0);
        let doubled = *engine.doubled_sides.lock().unwrap();
        assert!(!doubled.buy && !doubled.sell);
    }
}
