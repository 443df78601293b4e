//! The order grid: slot model, construction, sizing and the COW staging
//! layer used for atomic commits.

pub mod divergence;
pub mod model;
pub mod sizing;
pub mod types;
pub mod working;

pub use model::Grid;
pub use types::{GridSlot, PerSide, Side, SlotId, SlotRole, SlotState};
pub use working::{Action, CowPlan, WorkingGrid};
