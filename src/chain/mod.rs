//! Chain boundary: wire types and the RPC contract
//!
//! The engine is chain-agnostic behind [`client::DexRpc`]; this module holds
//! the narrow contract plus the integer-denominated types that cross it.

pub mod client;
pub mod types;

pub use client::{with_retry, DexRpc, RetryPolicy};
pub use types::{
    Asset, AssetAmount, AssetPair, BalanceSnapshot, BatchResult, BuiltOp, ChainPrice, FillEvent,
    FillOp, FillProcessingMode, OpResult, OpenOrder, RawOrder,
};
