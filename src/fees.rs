//! Network fee schedule and the one-shot fee cache
//!
//! BitShares-style chains charge a flat network fee (in the chain's core
//! asset, BTS here) per order operation, and refund 90% of the creation fee
//! when the order fills as maker. The schedule is loaded once at startup by
//! an external collaborator and injected through [`FeeCache`].

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Flat per-operation network fees, in the fee asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Fee charged when a limit order is created.
    pub create_fee: f64,
    /// Fee charged when a limit order is amended in place.
    pub update_fee: f64,
    /// Fee charged when a limit order is cancelled.
    pub cancel_fee: f64,
}

impl FeeSchedule {
    /// Net fee a maker ends up paying: 10% of the creation fee.
    pub fn maker_net_fee(&self) -> f64 {
        self.create_fee * 0.1
    }

    /// Net fee a taker pays: the full creation fee.
    pub fn taker_net_fee(&self) -> f64 {
        self.create_fee
    }

    /// Portion of the creation fee refunded on a maker fill.
    pub fn maker_refund(&self) -> f64 {
        self.create_fee * 0.9
    }

    /// Proceeds of a fill after the maker refund is folded in.
    pub fn net_proceeds(&self, amount: f64, is_maker: bool) -> f64 {
        if is_maker {
            amount + self.maker_refund()
        } else {
            amount
        }
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            create_fee: 0.0,
            update_fee: 0.0,
            cancel_fee: 0.0,
        }
    }
}

/// Process-wide fee schedule, populated exactly once during startup.
///
/// The source system kept this as a global; here it lives inside the engine
/// `Context` and is handed to whoever needs fee lookups.
#[derive(Debug, Default)]
pub struct FeeCache {
    schedule: OnceLock<FeeSchedule>,
}

impl FeeCache {
    pub fn new() -> Self {
        Self {
            schedule: OnceLock::new(),
        }
    }

    /// One-shot populate. A second call is a startup-order bug.
    pub fn populate(&self, schedule: FeeSchedule) -> EngineResult<()> {
        self.schedule.set(schedule).map_err(|_| {
            EngineError::config("fee_cache", "fee schedule populated twice")
        })
    }

    /// The populated schedule, or a zero schedule if the loader never ran.
    pub fn get(&self) -> FeeSchedule {
        self.schedule.get().copied().unwrap_or_default()
    }

    pub fn is_populated(&self) -> bool {
        self.schedule.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> FeeSchedule {
        FeeSchedule {
            create_fee: 1.0,
            update_fee: 0.5,
            cancel_fee: 0.1,
        }
    }

    #[test]
    fn test_maker_taker_net_fees() {
        let fees = schedule();
        assert!((fees.maker_net_fee() - 0.1).abs() < 1e-12);
        assert!((fees.taker_net_fee() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_net_proceeds() {
        let fees = schedule();
        assert!((fees.net_proceeds(100.0, true) - 100.9).abs() < 1e-12);
        assert!((fees.net_proceeds(100.0, false) - 100.0).abs() < 1e-12);
    }

    #[test]
    fn test_fee_cache_single_populate() {
        let cache = FeeCache::new();
        assert!(!cache.is_populated());
        cache.populate(schedule()).unwrap();
        assert!(cache.is_populated());
        assert!(cache.populate(schedule()).is_err());
        assert!((cache.get().create_fee - 1.0).abs() < 1e-12);
    }
}
