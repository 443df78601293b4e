//! Engine error taxonomy

use thiserror::Error;

use crate::grid::types::{Side, SlotId, SlotRole, SlotState};

/// Errors that can occur in grid engine operations
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("invalid config: {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("cannot resolve account")]
    NoAccount,

    #[error("illegal order state in {context}: slot {slot_id:?}: {details}")]
    IllegalOrderState {
        context: String,
        slot_id: Option<SlotId>,
        details: String,
    },

    #[error("accounting commitment failed on {side:?} for {amount}: {context}")]
    AccountingCommitmentFailed {
        side: Side,
        amount: f64,
        context: String,
    },

    #[error(
        "create targets occupied slot {target_id}: \
         order {current_order_id:?} ({current_role:?}/{current_state:?})"
    )]
    CreateSlotOccupied {
        target_id: SlotId,
        current_order_id: Option<String>,
        current_role: SlotRole,
        current_state: SlotState,
    },

    #[error("stale on-chain order {order_id}")]
    StaleOnChainOrder { order_id: String },

    #[error(
        "partial on-chain state: {groups_broadcast}/{groups_total} groups \
         confirmed ({broadcast_op_count} ops)"
    )]
    PartialOnChainState {
        groups_broadcast: usize,
        groups_total: usize,
        broadcast_op_count: usize,
    },

    #[error("working grid is stale: base {base_version}, current {current_version}")]
    StaleWorkingGrid {
        base_version: u64,
        current_version: u64,
    },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::PersistenceFailure(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Construct a `ConfigInvalid` without the field/reason boilerplate.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Errors that must route through recovery sync rather than a plain log.
    pub fn needs_recovery(&self) -> bool {
        matches!(
            self,
            EngineError::IllegalOrderState { .. }
                | EngineError::AccountingCommitmentFailed { .. }
        )
    }
}
