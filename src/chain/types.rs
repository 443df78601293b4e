//! Wire-level types shared with the blockchain RPC collaborator

use serde::{Deserialize, Serialize};

use crate::consts::ORDER_MATCH_OP;
use crate::grid::types::Side;
use crate::math;

/// An asset as known to the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Chain object id (e.g. "1.3.0").
    pub id: String,
    /// Ticker symbol (e.g. "BTS").
    pub symbol: String,
    /// Decimal places; integer amounts are `float * 10^precision`.
    pub precision: u32,
}

impl Asset {
    pub fn to_int(&self, value: f64) -> i64 {
        math::to_int(value, self.precision)
    }

    pub fn to_float(&self, units: i64) -> f64 {
        math::to_float(units, self.precision)
    }

    pub fn quantize(&self, value: f64) -> f64 {
        math::quantize(value, self.precision)
    }

    /// `2 * 10^-p`, the per-asset precision slack.
    pub fn precision_slack(&self) -> f64 {
        math::precision_slack(self.precision)
    }
}

/// The traded pair plus the network fee asset.
///
/// `base` is assetA, the asset SELL orders part with; `quote` is assetB, the
/// asset BUY orders spend. Prices are quote per base throughout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPair {
    pub base: Asset,
    pub quote: Asset,
    pub fee_asset: Asset,
}

impl AssetPair {
    /// The asset a side's capital is denominated in.
    pub fn asset_for(&self, side: Side) -> &Asset {
        match side {
            Side::Sell => &self.base,
            Side::Buy => &self.quote,
        }
    }

    /// Which side's capital a given asset id belongs to, if either.
    pub fn side_of(&self, asset_id: &str) -> Option<Side> {
        if asset_id == self.base.id {
            Some(Side::Sell)
        } else if asset_id == self.quote.id {
            Some(Side::Buy)
        } else {
            None
        }
    }
}

/// Integer amount of a specific asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAmount {
    pub amount: i64,
    pub asset_id: String,
}

/// Integer price fraction as stored on chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPrice {
    pub base: AssetAmount,
    pub quote: AssetAmount,
}

impl ChainPrice {
    /// Price fraction of a sell order: `base_amount` base for its quote
    /// value at `price`.
    pub fn selling_base(pair: &AssetPair, base_amount: f64, price: f64) -> Self {
        Self {
            base: AssetAmount {
                amount: pair.base.to_int(base_amount),
                asset_id: pair.base.id.clone(),
            },
            quote: AssetAmount {
                amount: pair.quote.to_int(base_amount * price),
                asset_id: pair.quote.id.clone(),
            },
        }
    }

    /// Price fraction of a buy order: quote value at `price` for
    /// `base_amount` base.
    pub fn selling_quote(pair: &AssetPair, base_amount: f64, price: f64) -> Self {
        Self {
            base: AssetAmount {
                amount: pair.quote.to_int(base_amount * price),
                asset_id: pair.quote.id.clone(),
            },
            quote: AssetAmount {
                amount: pair.base.to_int(base_amount),
                asset_id: pair.base.id.clone(),
            },
        }
    }
}

/// Cached last-known on-chain integer representation of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOrder {
    pub for_sale: i64,
    pub sell_price: ChainPrice,
}

/// An open limit order as returned by the RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub for_sale: i64,
    pub sell_price: ChainPrice,
}

impl OpenOrder {
    pub fn raw(&self) -> RawOrder {
        RawOrder {
            for_sale: self.for_sale,
            sell_price: self.sell_price.clone(),
        }
    }

    /// Implied absolute price (quote per base) of this order on `pair`.
    ///
    /// Sell orders quote base->quote directly; buy orders are inverted.
    pub fn implied_price(&self, pair: &AssetPair) -> Option<f64> {
        let base_amt = &self.sell_price.base;
        let quote_amt = &self.sell_price.quote;
        if base_amt.amount == 0 || quote_amt.amount == 0 {
            return None;
        }
        if base_amt.asset_id == pair.base.id {
            let base = pair.base.to_float(base_amt.amount);
            let quote = pair.quote.to_float(quote_amt.amount);
            Some(quote / base)
        } else if base_amt.asset_id == pair.quote.id {
            let quote = pair.quote.to_float(base_amt.amount);
            let base = pair.base.to_float(quote_amt.amount);
            Some(quote / base)
        } else {
            None
        }
    }

    /// Which grid side this order sits on: selling base = Sell rail.
    pub fn side(&self, pair: &AssetPair) -> Option<Side> {
        pair.side_of(&self.sell_price.base.asset_id)
    }
}

/// The order-match operation payload of a fill event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillOp {
    pub order_id: String,
    pub pays: AssetAmount,
    pub receives: AssetAmount,
    pub is_maker: bool,
}

/// A fill event as delivered by the chain listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Operation code; order matches are `ORDER_MATCH_OP`.
    pub op_code: u8,
    pub op: FillOp,
    pub block_num: u64,
    /// Chain event id (unique within a block).
    pub id: String,
}

impl FillEvent {
    pub fn order_match(op: FillOp, block_num: u64, id: impl Into<String>) -> Self {
        Self {
            op_code: ORDER_MATCH_OP,
            op,
            block_num,
            id: id.into(),
        }
    }

    pub fn is_order_match(&self) -> bool {
        self.op_code == ORDER_MATCH_OP
    }

    /// Key used for time-windowed deduplication.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.op.order_id, self.block_num, self.id)
    }
}

/// A fully built chain operation, integer amounts resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BuiltOp {
    Create {
        amount_to_sell: i64,
        sell_asset_id: String,
        min_to_receive: i64,
        receive_asset_id: String,
        expiration_secs: u64,
    },
    Update {
        order_id: String,
        delta_amount_to_sell: i64,
        /// Present when the order moves to a new price rung.
        new_price: Option<ChainPrice>,
    },
    Cancel {
        order_id: String,
    },
}

impl BuiltOp {
    /// Chain order id this op references, if it targets an existing order.
    pub fn target_order_id(&self) -> Option<&str> {
        match self {
            BuiltOp::Create { .. } => None,
            BuiltOp::Update { order_id, .. } | BuiltOp::Cancel { order_id } => {
                Some(order_id.as_str())
            }
        }
    }
}

/// Per-operation result of a broadcast batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    /// Result kind discriminant mirroring the chain's `[kind, value]` pairs.
    pub kind: u8,
    /// For CREATE results, the assigned chain order id.
    pub return_value: Option<String>,
}

/// Outcome of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub success: bool,
    pub operation_results: Vec<OpResult>,
    /// Raw response, kept for diagnostics only.
    pub raw: serde_json::Value,
}

/// How fills are reconciled against the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillProcessingMode {
    /// Process each event's own history entry.
    History,
    /// Refresh the full open-orders snapshot and diff it.
    OpenOrders,
}

/// Account balance snapshot resolved to floats by the client.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Total quote-asset balance (buy-side capital).
    pub buy: f64,
    /// Total base-asset balance (sell-side capital).
    pub sell: f64,
    /// Quote-asset balance not locked in orders.
    pub buy_free: f64,
    /// Base-asset balance not locked in orders.
    pub sell_free: f64,
    /// Free balance in the network fee asset.
    pub fee_free: f64,
}
