//! Fund accounting: chain snapshot, optimistic book, fee settlement
//!
//! The accountant keeps two parallel books. The *chain snapshot*
//! (`AccountTotals`) mirrors the last authoritative balance fetch; the
//! *optimistic book* adjusts it for fills and planned commitments as they
//! happen. The fund invariant `total ~= free + committed` is re-checked
//! after every mutation, and violations during a broadcast are elevated to
//! `IllegalOrderState`.

use log::{debug, warn};

use crate::chain::types::{AssetPair, BalanceSnapshot, FillOp};
use crate::errors::{EngineError, EngineResult};
use crate::fees::FeeSchedule;
use crate::grid::types::{PerSide, Side};
use crate::math;

/// Chain-snapshot balances for the pair, B = buy (quote), A = sell (base).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccountTotals {
    pub buy: f64,
    pub sell: f64,
    pub buy_free: f64,
    pub sell_free: f64,
}

/// Outcome of crediting a fill: which side received how much.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FillCredit {
    pub side: Side,
    pub amount: f64,
}

/// The fund accountant for one bot.
#[derive(Debug)]
pub struct Accountant {
    pair: AssetPair,
    fees: FeeSchedule,
    totals: AccountTotals,
    /// Value locked in ACTIVE/PARTIAL orders: base units on the sell side,
    /// quote units on the buy side.
    committed_chain: PerSide<f64>,
    /// Optimistic reservations not yet confirmed on-chain.
    virtual_reserved: PerSide<f64>,
    /// Accrued network-fee debt in the fee asset.
    bts_fees_owed: f64,
    /// Per-side fill proceeds not yet reallocated into the grid.
    cache_funds: PerSide<f64>,
    /// When set, invariant violations become hard errors (broadcast window).
    throw_on_illegal_state: bool,
    /// Set when drift was detected; cleared by a recovery sync.
    drift_flagged: bool,
    /// Startup sizing not finished yet; fills take the bootstrap path.
    bootstrap: bool,
}

impl Accountant {
    pub fn new(pair: AssetPair, fees: FeeSchedule) -> Self {
        Self {
            pair,
            fees,
            totals: AccountTotals::default(),
            committed_chain: PerSide::default(),
            virtual_reserved: PerSide::default(),
            bts_fees_owed: 0.0,
            cache_funds: PerSide::default(),
            throw_on_illegal_state: false,
            drift_flagged: false,
            bootstrap: true,
        }
    }

    // --- snapshot management -------------------------------------------------

    /// Install a fresh authoritative balance snapshot.
    pub fn set_account_totals(&mut self, snapshot: BalanceSnapshot) {
        self.totals = AccountTotals {
            buy: snapshot.buy,
            sell: snapshot.sell,
            buy_free: snapshot.buy_free,
            sell_free: snapshot.sell_free,
        };
        self.virtual_reserved = PerSide::default();
        debug!(
            "account totals set: buy {:.8} ({:.8} free), sell {:.8} ({:.8} free)",
            self.totals.buy, self.totals.buy_free, self.totals.sell, self.totals.sell_free
        );
    }

    /// Install the committed value derived from the grid's on-chain orders.
    pub fn set_committed(&mut self, committed: PerSide<f64>) {
        self.committed_chain = committed;
    }

    pub fn totals(&self) -> AccountTotals {
        self.totals
    }

    pub fn committed(&self) -> PerSide<f64> {
        self.committed_chain
    }

    pub fn cache_funds(&self) -> PerSide<f64> {
        self.cache_funds
    }

    pub fn bts_fees_owed(&self) -> f64 {
        self.bts_fees_owed
    }

    pub fn set_bts_fees_owed(&mut self, owed: f64) {
        self.bts_fees_owed = owed;
    }

    /// Free balance available for new commitments on a side.
    pub fn free(&self, side: Side) -> f64 {
        let raw = match side {
            Side::Buy => self.totals.buy_free,
            Side::Sell => self.totals.sell_free,
        };
        raw - self.virtual_reserved.get(side)
    }

    pub fn free_per_side(&self) -> PerSide<f64> {
        PerSide {
            buy: self.free(Side::Buy),
            sell: self.free(Side::Sell),
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    pub fn finish_bootstrap(&mut self) {
        self.bootstrap = false;
    }

    pub fn set_throw_on_illegal_state(&mut self, throw: bool) {
        self.throw_on_illegal_state = throw;
    }

    pub fn drift_flagged(&self) -> bool {
        self.drift_flagged
    }

    pub fn clear_drift_flag(&mut self) {
        self.drift_flagged = false;
    }

    // --- mutations -----------------------------------------------------------

    /// Credit a fill: `receives` lands on its side's free balance (with the
    /// maker refund folded in when the proceeds are the fee asset), `pays`
    /// leaves the committed book.
    pub fn process_fill_accounting(&mut self, op: &FillOp) -> EngineResult<Option<FillCredit>> {
        let Some(paid_side) = self.pair.side_of(&op.pays.asset_id) else {
            warn!(
                "fill {} pays unknown asset {}, ignoring",
                op.order_id, op.pays.asset_id
            );
            return Ok(None);
        };

        let paid_asset = self.pair.asset_for(paid_side);
        let paid = paid_asset.to_float(op.pays.amount);
        let committed = self.committed_chain.get_mut(paid_side);
        *committed = (*committed - paid).max(0.0);
        match paid_side {
            Side::Buy => self.totals.buy = (self.totals.buy - paid).max(0.0),
            Side::Sell => self.totals.sell = (self.totals.sell - paid).max(0.0),
        }

        let credit = if let Some(recv_side) = self.pair.side_of(&op.receives.asset_id) {
            let recv_asset = self.pair.asset_for(recv_side);
            let amount = recv_asset.to_float(op.receives.amount);
            let net = if op.receives.asset_id == self.pair.fee_asset.id {
                self.fees.net_proceeds(amount, op.is_maker)
            } else {
                amount
            };

            match recv_side {
                Side::Buy => {
                    self.totals.buy += net;
                    self.totals.buy_free += net;
                }
                Side::Sell => {
                    self.totals.sell += net;
                    self.totals.sell_free += net;
                }
            }
            *self.cache_funds.get_mut(recv_side) += net;

            Some(FillCredit {
                side: recv_side,
                amount: net,
            })
        } else {
            warn!(
                "fill {} receives unknown asset {}, proceeds not credited",
                op.order_id, op.receives.asset_id
            );
            None
        };

        // A maker fill settles 10% of the creation fee; the accrued debt
        // keeps the other 90% from being charged twice.
        if op.is_maker && self.bts_fees_owed > 0.0 {
            self.bts_fees_owed = (self.bts_fees_owed - self.fees.maker_refund()).max(0.0);
        }

        self.verify("process_fill_accounting")?;
        Ok(credit)
    }

    /// Apply the free-balance delta of replacing `old_value` with
    /// `new_value` on `side` (both in the side's own asset), deducting
    /// `fee` from the fee-asset book.
    pub fn update_optimistic_free_balance(
        &mut self,
        side: Side,
        old_value: f64,
        new_value: f64,
        context: &str,
        fee: f64,
        skip_recalc: bool,
    ) -> EngineResult<()> {
        let asset = self.pair.asset_for(side);
        let delta = asset.quantize(old_value) - asset.quantize(new_value);

        let slack = asset.precision_slack();
        let free = match side {
            Side::Buy => &mut self.totals.buy_free,
            Side::Sell => &mut self.totals.sell_free,
        };
        let next = *free + delta;
        if next < -slack {
            return Err(EngineError::AccountingCommitmentFailed {
                side,
                amount: -delta,
                context: format!("{context}: free balance would go to {next:.8}"),
            });
        }
        *free = next.max(0.0);
        let committed = self.committed_chain.get_mut(side);
        *committed = (*committed - delta).max(0.0);

        if fee > 0.0 {
            let fee_side = self.pair.side_of(&self.pair.fee_asset.id);
            match fee_side {
                Some(fee_side) => {
                    let fee_free = match fee_side {
                        Side::Buy => &mut self.totals.buy_free,
                        Side::Sell => &mut self.totals.sell_free,
                    };
                    *fee_free = (*fee_free - fee).max(0.0);
                    match fee_side {
                        Side::Buy => self.totals.buy = (self.totals.buy - fee).max(0.0),
                        Side::Sell => self.totals.sell = (self.totals.sell - fee).max(0.0),
                    }
                }
                None => self.bts_fees_owed += fee,
            }
        }

        if !skip_recalc {
            self.verify(context)?;
        }
        Ok(())
    }

    /// Move value from a side's free balance into the committed book.
    /// Cached fill proceeds count as reallocated up to the committed value.
    pub fn commit(&mut self, side: Side, value: f64, context: &str) -> EngineResult<()> {
        self.update_optimistic_free_balance(side, 0.0, value, context, 0.0, false)?;
        let cache = self.cache_funds.get_mut(side);
        *cache = (*cache - value).max(0.0);
        Ok(())
    }

    /// Release committed value back to a side's free balance.
    pub fn release(&mut self, side: Side, value: f64) {
        let asset = self.pair.asset_for(side);
        let value = asset.quantize(value);
        let committed = self.committed_chain.get_mut(side);
        *committed = (*committed - value).max(0.0);
        match side {
            Side::Buy => self.totals.buy_free += value,
            Side::Sell => self.totals.sell_free += value,
        }
    }

    /// Add network-fee debt (order create/update/cancel broadcasts).
    pub fn accrue_network_fee(&mut self, amount: f64) {
        self.bts_fees_owed += amount;
    }

    /// Settle accrued network fees against a side.
    ///
    /// The side's proceeds cache is consumed fully first; the remainder is
    /// settled by charging the *full* owed amount to the chain-free balance.
    /// If the chain-free balance cannot cover the owed amount, settlement is
    /// deferred entirely; there is no partial settlement.
    pub fn deduct_bts_fees(&mut self, side: Side) {
        if self.bts_fees_owed <= 0.0 {
            return;
        }
        let owed = self.bts_fees_owed;
        let cache = self.cache_funds.get_mut(side);

        if *cache >= owed {
            *cache -= owed;
            self.bts_fees_owed = 0.0;
            debug!("settled {owed:.8} fee debt from {side:?} cache funds");
            return;
        }

        let free = match side {
            Side::Buy => &mut self.totals.buy_free,
            Side::Sell => &mut self.totals.sell_free,
        };
        if *free < owed {
            debug!(
                "deferring fee settlement: owed {owed:.8} > free {:.8} on {side:?}",
                *free
            );
            return;
        }

        // The cache is consumed in full, and the full owed amount (not the
        // cache-reduced remainder) comes off the chain-free balance.
        *cache = 0.0;
        *free -= owed;
        match side {
            Side::Buy => self.totals.buy -= owed,
            Side::Sell => self.totals.sell -= owed,
        }
        self.bts_fees_owed = 0.0;
        debug!("settled {owed:.8} fee debt against {side:?} free balance");
    }

    // --- invariants ----------------------------------------------------------

    /// Per-side drift between the snapshot total and `free + committed`.
    /// Returns the sides that exceed tolerance and flags recovery.
    pub fn check_fund_drift(&mut self) -> Vec<Side> {
        let mut drifted = Vec::new();
        for side in [Side::Buy, Side::Sell] {
            let (total, free) = match side {
                Side::Buy => (self.totals.buy, self.totals.buy_free),
                Side::Sell => (self.totals.sell, self.totals.sell_free),
            };
            let committed = *self.committed_chain.get(side);
            let gap = (total - (free + committed)).abs();
            let tolerance = self.drift_tolerance(side, total);
            if gap > tolerance {
                warn!(
                    "fund drift on {side:?}: total {total:.8} vs free {free:.8} + \
                     committed {committed:.8} (gap {gap:.8} > {tolerance:.8})"
                );
                drifted.push(side);
            }
        }
        if !drifted.is_empty() {
            self.drift_flagged = true;
        }
        drifted
    }

    fn drift_tolerance(&self, side: Side, total: f64) -> f64 {
        let asset = self.pair.asset_for(side);
        let slack = asset.precision_slack();
        slack.max(crate::consts::FUND_DRIFT_PCT_TOLERANCE * total)
    }

    fn verify(&mut self, context: &str) -> EngineResult<()> {
        for side in [Side::Buy, Side::Sell] {
            let (total, free) = match side {
                Side::Buy => (self.totals.buy, self.totals.buy_free),
                Side::Sell => (self.totals.sell, self.totals.sell_free),
            };
            let committed = *self.committed_chain.get(side);
            let gap = (total - (free + committed)).abs();
            if gap > self.drift_tolerance(side, total) {
                self.drift_flagged = true;
                if self.throw_on_illegal_state {
                    return Err(EngineError::IllegalOrderState {
                        context: context.to_string(),
                        slot_id: None,
                        details: format!(
                            "fund invariant violated on {side:?}: gap {gap:.8}"
                        ),
                    });
                }
                warn!("fund invariant drift in {context} on {side:?}: gap {gap:.8}");
            }
        }
        Ok(())
    }

    /// Whether an order of `size` base units would round to nothing.
    pub fn rounds_to_zero(&self, side: Side, size: f64) -> bool {
        math::to_int(size, self.pair.asset_for(side).precision) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::{Asset, AssetAmount};
    use crate::config::tests::test_pair;

    fn fees() -> FeeSchedule {
        FeeSchedule {
            create_fee: 1.0,
            update_fee: 0.5,
            cancel_fee: 0.1,
        }
    }

    fn accountant() -> Accountant {
        let mut acct = Accountant::new(test_pair(), fees());
        acct.set_account_totals(BalanceSnapshot {
            buy: 2000.0,
            sell: 1000.0,
            buy_free: 2000.0,
            sell_free: 1000.0,
            fee_free: 100.0,
        });
        acct.finish_bootstrap();
        acct
    }

    #[test]
    fn test_fee_settlement_charges_full_owed() {
        // cache 30, owed 50, free 1000 -> cache 0, free 950, owed 0
        let mut acct = accountant();
        acct.set_bts_fees_owed(50.0);
        *acct.cache_funds.get_mut(Side::Sell) = 30.0;

        acct.deduct_bts_fees(Side::Sell);

        assert_eq!(*acct.cache_funds().get(Side::Sell), 0.0);
        assert!((acct.totals().sell_free - 950.0).abs() < 1e-9);
        assert_eq!(acct.bts_fees_owed(), 0.0);
    }

    #[test]
    fn test_fee_settlement_defers_when_free_insufficient() {
        // cache 30, owed 50, free 40 -> untouched
        let mut acct = accountant();
        acct.totals.sell_free = 40.0;
        acct.totals.sell = 40.0;
        acct.set_bts_fees_owed(50.0);
        *acct.cache_funds.get_mut(Side::Sell) = 30.0;

        acct.deduct_bts_fees(Side::Sell);

        assert_eq!(*acct.cache_funds().get(Side::Sell), 30.0);
        assert!((acct.totals().sell_free - 40.0).abs() < 1e-9);
        assert_eq!(acct.bts_fees_owed(), 50.0);
    }

    #[test]
    fn test_fee_settlement_from_cache_alone() {
        let mut acct = accountant();
        acct.set_bts_fees_owed(50.0);
        *acct.cache_funds.get_mut(Side::Sell) = 80.0;

        acct.deduct_bts_fees(Side::Sell);

        assert!((*acct.cache_funds().get(Side::Sell) - 30.0).abs() < 1e-9);
        assert!((acct.totals().sell_free - 1000.0).abs() < 1e-9);
        assert_eq!(acct.bts_fees_owed(), 0.0);
    }

    #[test]
    fn test_fill_accounting_sell_fill() {
        let mut acct = accountant();
        // A resting sell order: 100 base committed
        acct.totals.sell_free = 900.0;
        acct.set_committed(PerSide {
            buy: 0.0,
            sell: 100.0,
        });

        let pair = test_pair();
        let op = FillOp {
            order_id: "1.7.42".into(),
            pays: AssetAmount {
                amount: pair.base.to_int(10.0),
                asset_id: pair.base.id.clone(),
            },
            receives: AssetAmount {
                amount: pair.quote.to_int(25.0),
                asset_id: pair.quote.id.clone(),
            },
            is_maker: true,
        };

        let credit = acct.process_fill_accounting(&op).unwrap().unwrap();
        assert_eq!(credit.side, Side::Buy);
        assert!((credit.amount - 25.0).abs() < 1e-9);

        // Committed base shrank, quote free grew
        assert!((*acct.committed().get(Side::Sell) - 90.0).abs() < 1e-9);
        assert!((acct.totals().buy_free - 2025.0).abs() < 1e-9);
        assert!((*acct.cache_funds().get(Side::Buy) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_fill_accounting_is_invariant_safe() {
        let mut acct = accountant();
        acct.totals.sell_free = 500.0;
        acct.set_committed(PerSide {
            buy: 0.0,
            sell: 500.0,
        });
        acct.set_throw_on_illegal_state(true);

        let pair = test_pair();
        let op = FillOp {
            order_id: "1.7.1".into(),
            pays: AssetAmount {
                amount: pair.base.to_int(50.0),
                asset_id: pair.base.id.clone(),
            },
            receives: AssetAmount {
                amount: pair.quote.to_int(120.0),
                asset_id: pair.quote.id.clone(),
            },
            is_maker: false,
        };
        acct.process_fill_accounting(&op).unwrap();

        assert!(acct.check_fund_drift().is_empty());
    }

    #[test]
    fn test_optimistic_update_rejects_overdraw() {
        let mut acct = accountant();
        acct.totals.sell_free = 5.0;

        // Committing 50 base with only 5 free must fail
        let err = acct
            .update_optimistic_free_balance(Side::Sell, 0.0, 50.0, "test", 0.0, false)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::AccountingCommitmentFailed {
                side: Side::Sell,
                ..
            }
        ));
    }

    #[test]
    fn test_commit_and_release_round_trip() {
        let mut acct = accountant();
        acct.commit(Side::Buy, 100.0, "test").unwrap();
        assert!((acct.free(Side::Buy) - 1900.0).abs() < 1e-9);
        assert!((*acct.committed().get(Side::Buy) - 100.0).abs() < 1e-9);

        acct.release(Side::Buy, 100.0);
        assert!((acct.free(Side::Buy) - 2000.0).abs() < 1e-9);
        assert!(acct.check_fund_drift().is_empty());
    }

    #[test]
    fn test_drift_detection_flags_recovery() {
        let mut acct = accountant();
        // Claim committed funds the totals cannot account for
        acct.set_committed(PerSide {
            buy: 500.0,
            sell: 0.0,
        });
        let drifted = acct.check_fund_drift();
        assert_eq!(drifted, vec![Side::Buy]);
        assert!(acct.drift_flagged());
    }

    #[test]
    fn test_drift_tolerance_allows_precision_slack() {
        let mut acct = accountant();
        // One integer unit of noise stays inside tolerance
        acct.totals.sell_free = 1000.0 - 0.00001;
        assert!(acct.check_fund_drift().is_empty());
    }
}
