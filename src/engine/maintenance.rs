//! Maintenance controller: health, divergence and spread correction
//!
//! Runs at startup, on a periodic timer, and after fills, always under the
//! canonical lock order `fill_lock -> divergence_lock`. Every step re-checks
//! the pipeline-consensus gate so corrections never race in-flight fills.

use log::{debug, info, warn};

use crate::chain::client::DexRpc;
use crate::errors::EngineResult;
use crate::grid::divergence::{self, DivergenceThresholds};
use crate::grid::sizing;
use crate::grid::types::{Side, SlotState};
use crate::grid::working::{Action, CowPlan};
use crate::math;

use super::{GridEngine, MaintenanceTrigger};

impl<R: DexRpc + 'static> GridEngine<R> {
    /// One full maintenance pass.
    pub async fn run_maintenance(&self, trigger: MaintenanceTrigger) {
        let _fill_guard = self.fill_lock.lock().await;

        // 1. Funds first: settle what fee debt we can and refresh sizing
        self.settle_fee_debt().await;
        self.recompute_ideal_sizes().await;

        // 2. Stuck pipeline markers must never block maintenance forever
        self.clear_stale_pipeline_ops();

        // 3. Recovery cooldown burns one cycle doing nothing
        let cooldown = self
            .maintenance_cooldown
            .load(std::sync::atomic::Ordering::SeqCst);
        if cooldown > 0 {
            self.maintenance_cooldown
                .store(cooldown - 1, std::sync::atomic::Ordering::SeqCst);
            debug!("maintenance cooldown active ({cooldown} cycles left)");
            return;
        }

        // 4. Pipeline-consensus gate
        if !self.pipeline_empty() {
            debug!("maintenance deferred: pipeline not empty ({trigger:?})");
            return;
        }

        self.metrics
            .divergence_lock_active
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let _div_guard = self.divergence_lock.lock().await;

        if let Err(e) = self.check_grid_health().await {
            warn!("grid health check failed: {e}");
        }
        if self.pipeline_empty() {
            if let Err(e) = self.check_divergence().await {
                warn!("divergence check failed: {e}");
            }
        }
        if self.pipeline_empty() {
            if let Err(e) = self.check_spread().await {
                warn!("spread correction failed: {e}");
            }
        }

        self.metrics
            .divergence_lock_active
            .store(false, std::sync::atomic::Ordering::Relaxed);
    }

    /// Settle accrued network fees against whichever side holds the fee
    /// asset; defers silently when neither does.
    async fn settle_fee_debt(&self) {
        let config = self.bot_config();
        let fee_side = config.pair.side_of(&config.pair.fee_asset.id);
        if let Some(side) = fee_side {
            self.accountant.lock().await.deduct_bts_fees(side);
        }
    }

    /// Dust health: when *both* rails carry dust orders, cancel them so the
    /// capital can be re-deployed at full size.
    pub(crate) async fn check_grid_health(&self) -> EngineResult<()> {
        let master = self.master();
        let config = self.bot_config();
        let ideal = self.ideal_sizes.lock().unwrap().clone();

        let mut dust: Vec<(Side, Action)> = Vec::new();
        for side in [Side::Buy, Side::Sell] {
            for slot in master.rail(side).filter(|s| s.is_on_chain()) {
                let Some(order_id) = slot.order_id.clone() else { continue };
                let ideal_size = ideal.get(side).get(&slot.id).copied();
                let healthy = math::order_size_valid(
                    slot.size,
                    config.pair.base.precision,
                    config.min_order_factor,
                    ideal_size.filter(|s| *s > 0.0),
                    config.dust_pct / 2.0,
                );
                if !healthy {
                    dust.push((
                        side,
                        Action::Cancel {
                            slot_id: slot.id,
                            order_id,
                        },
                    ));
                }
            }
        }

        let buy_dust = dust.iter().any(|(s, _)| *s == Side::Buy);
        let sell_dust = dust.iter().any(|(s, _)| *s == Side::Sell);
        if !(buy_dust && sell_dust) {
            return Ok(());
        }

        info!("dust on both rails: cancelling {} orders", dust.len());
        let plan = CowPlan {
            actions: dust.into_iter().map(|(_, a)| a).collect(),
            boundary_idx: None,
        };
        self.execute_plan(plan).await
    }

    /// Divergence: resize, fill holes and trim surplus on any side whose
    /// persisted sizing has drifted from the ideal.
    pub(crate) async fn check_divergence(&self) -> EngineResult<()> {
        let master = self.master();
        let config = self.bot_config();
        let thresholds = DivergenceThresholds {
            rms: config.divergence_rms_threshold,
            ratio: config.divergence_ratio_threshold,
        };

        let flagged: Vec<Side> = {
            let mut sides = self.sides_updated.lock().unwrap();
            sides.drain().collect()
        };

        let ideal = self.ideal_sizes.lock().unwrap().clone();
        let mut actions: Vec<Action> = Vec::new();

        for side in [Side::Buy, Side::Sell] {
            let calculated = ideal.get(side).clone();
            let persisted = sizing::persisted_sizes(&master, side);
            let report = divergence::check_side(&calculated, &persisted, thresholds);

            if !report.divergent && !flagged.contains(&side) {
                continue;
            }
            info!(
                "{side:?} side divergent (rms {:.4}, ratio {:.4}); correcting",
                report.rms, report.surplus_ratio
            );

            for slot in master.rail(side) {
                let ideal_size = calculated.get(&slot.id).copied().unwrap_or(0.0);
                match slot.state {
                    SlotState::Active | SlotState::Partial => {
                        let Some(order_id) = slot.order_id.clone() else { continue };
                        if ideal_size <= 0.0 {
                            // Surplus rung: no capital belongs here anymore
                            actions.push(Action::Cancel {
                                slot_id: slot.id,
                                order_id,
                            });
                        } else {
                            let delta = (slot.size - ideal_size).abs();
                            if delta > config.pair.base.precision_slack()
                                && delta / ideal_size > config.dust_pct / 100.0
                            {
                                actions.push(Action::Update {
                                    slot_id: slot.id,
                                    order_id,
                                    new_size: ideal_size,
                                    new_price: None,
                                    new_slot_id: None,
                                });
                            }
                        }
                    }
                    SlotState::Virtual => {
                        // Hole: an empty rung the sizing says should exist
                        if ideal_size > 0.0
                            && !slot.is_occupied()
                            && math::order_size_valid(
                                ideal_size,
                                config.pair.base.precision,
                                config.min_order_factor,
                                None,
                                config.dust_pct,
                            )
                        {
                            actions.push(Action::Create {
                                slot_id: slot.id,
                                side,
                                price: slot.price,
                                size: ideal_size,
                            });
                        }
                    }
                }
            }
        }

        if actions.is_empty() {
            return Ok(());
        }
        // Cancels release funds before creates need them
        actions.sort_by_key(|a| match a {
            Action::Cancel { .. } => 0,
            Action::Update { .. } => 1,
            Action::Create { .. } => 2,
        });
        let plan = CowPlan {
            actions,
            boundary_idx: None,
        };
        self.execute_plan(plan).await
    }

    /// Spread correction: when the measured window exceeds the target plus
    /// tolerance, place an opposite-side order at the nearest inward rung.
    pub(crate) async fn check_spread(&self) -> EngineResult<()> {
        let master = self.master();
        let config = self.bot_config();

        let Some(measured) = master.measured_spread_percent() else {
            return Ok(());
        };
        let limit =
            config.target_spread_percent + crate::consts::SPREAD_CORRECTION_TOLERANCE_PCT;
        if measured <= limit {
            return Ok(());
        }
        info!(
            "spread {measured:.3}% above target {:.3}%, correcting",
            config.target_spread_percent
        );

        let ideal = self.ideal_sizes.lock().unwrap().clone();
        let mut actions = Vec::new();
        let mut doubled = *self.doubled_sides.lock().unwrap();

        for side in [Side::Buy, Side::Sell] {
            // Nearest inward empty rung on this rail
            let candidate = match side {
                Side::Buy => master
                    .rail(Side::Buy)
                    .filter(|s| s.state == SlotState::Virtual && !s.is_occupied())
                    .last(),
                Side::Sell => master
                    .rail(Side::Sell)
                    .find(|s| s.state == SlotState::Virtual && !s.is_occupied()),
            };
            let Some(slot) = candidate else { continue };

            // Only place when it actually tightens the window
            let improves = match (side, master.best_bid(), master.best_ask()) {
                (Side::Buy, Some(bid), _) => slot.price > bid.price,
                (Side::Buy, None, _) => true,
                (Side::Sell, _, Some(ask)) => slot.price < ask.price,
                (Side::Sell, _, None) => true,
            };
            if !improves {
                continue;
            }

            let Some(size) = ideal.get(side).get(&slot.id).copied().filter(|s| *s > 0.0)
            else {
                continue;
            };
            actions.push(Action::Create {
                slot_id: slot.id,
                side,
                price: slot.price,
                size,
            });
            *doubled.get_mut(side) = true;
        }

        if actions.is_empty() {
            return Ok(());
        }
        *self.doubled_sides.lock().unwrap() = doubled;
        let plan = CowPlan {
            actions,
            boundary_idx: None,
        };
        self.execute_plan(plan).await
    }
}
