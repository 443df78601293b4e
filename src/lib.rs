//! dexgrid: a grid market-making engine for BitShares-style DEXes
//!
//! The engine maintains a geometric price grid of standing limit orders for
//! one account on one trading pair, rotating and resizing orders as the
//! market moves while enforcing strict fund accounting. Chain access goes
//! through the [`chain::DexRpc`] contract; everything else is internal.

#![deny(unreachable_pub)]

pub mod accounting;
pub mod chain;
pub mod config;
pub mod consts;
pub mod engine;
pub mod errors;
pub mod fees;
pub mod grid;
pub mod math;
pub mod pipeline;
pub mod strategy;

pub use chain::{DexRpc, RetryPolicy};
pub use config::{BotConfig, EngineSettings, PriceMode};
pub use engine::{GridEngine, MaintenanceTrigger};
pub use errors::{EngineError, EngineResult};
pub use fees::{FeeCache, FeeSchedule};
pub use grid::{Grid, GridSlot, Side, SlotId, SlotRole, SlotState};
