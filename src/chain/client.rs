//! Blockchain RPC abstraction - enables mocking for tests
//!
//! The engine never talks to the chain directly; everything goes through
//! [`DexRpc`]. The production implementation (connection handling, signing,
//! wire encoding) lives in a separate crate and is injected at startup.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc;

use crate::consts::{
    DEFAULT_RPC_BASE_DELAY_MS, DEFAULT_RPC_MAX_ATTEMPTS, DEFAULT_RPC_MAX_DELAY_MS,
};
use crate::errors::{EngineError, EngineResult};

use super::types::{
    Asset, AssetPair, BalanceSnapshot, BatchResult, BuiltOp, FillEvent, FillProcessingMode,
    OpenOrder,
};

/// Chain operations consumed by the engine.
#[async_trait]
pub trait DexRpc: Send + Sync {
    /// Block until the underlying connection is usable, within `timeout`.
    async fn wait_for_connected(&self, timeout: Duration) -> EngineResult<()>;

    /// Resolve an account name to its chain id.
    async fn resolve_account_id(&self, name: &str) -> EngineResult<String>;

    /// Read the account's open limit orders.
    async fn read_open_orders(&self, account_id: &str) -> EngineResult<Vec<OpenOrder>>;

    /// Fetch the account's balances for the pair and fee asset.
    async fn fetch_balances(
        &self,
        account_id: &str,
        pair: &AssetPair,
    ) -> EngineResult<BalanceSnapshot>;

    /// Build a limit-order-create op. `None` when either amount rounds to
    /// zero integer units.
    fn build_create_order_op(
        &self,
        account_id: &str,
        amount_to_sell: f64,
        sell_asset: &Asset,
        min_to_receive: f64,
        receive_asset: &Asset,
        expiration_secs: u64,
    ) -> Option<BuiltOp>;

    /// Build a limit-order-update op against the cached on-chain integers.
    /// `new_min_to_receive` is set when the order moves to a new price rung.
    /// `None` when the integer delta is zero and the price is unchanged.
    #[allow(clippy::too_many_arguments)]
    fn build_update_order_op(
        &self,
        account_id: &str,
        order_id: &str,
        new_amount_to_sell: f64,
        sell_asset: &Asset,
        new_min_to_receive: Option<f64>,
        receive_asset: &Asset,
        raw_for_sale: Option<i64>,
    ) -> Option<BuiltOp>;

    /// Build a limit-order-cancel op.
    fn build_cancel_order_op(&self, account_id: &str, order_id: &str) -> BuiltOp;

    /// Sign and broadcast a batch as a single transaction. Transport or
    /// validation failures come back as `EngineError::Rpc` with the node's
    /// message preserved verbatim (stale-order cleanup parses it).
    async fn execute_batch(
        &self,
        account_id: &str,
        ops: Vec<BuiltOp>,
    ) -> EngineResult<BatchResult>;

    /// Subscribe to fill events for the account. Events arrive in batches.
    async fn listen_for_fills(
        &self,
        account_id: &str,
    ) -> EngineResult<mpsc::UnboundedReceiver<Vec<FillEvent>>>;

    /// How this deployment reconciles fills.
    fn fill_processing_mode(&self) -> FillProcessingMode;

    /// Pool-derived price for the pair, if a matching pool exists.
    async fn fetch_pool_price(&self, pair: &AssetPair) -> EngineResult<Option<f64>>;

    /// Order-book-derived price (mid of best bid/ask), if the book is two-sided.
    async fn fetch_market_price(&self, pair: &AssetPair) -> EngineResult<Option<f64>>;
}

/// Exponential backoff policy for RPC retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RPC_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RPC_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RPC_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run an RPC operation with exponential backoff.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    operation: F,
) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label, attempt, policy.max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ============================================================================
// Mock implementation for testing
// ============================================================================

/// Mock RPC for exercising the engine without a chain connection.
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use crate::chain::types::{ChainPrice, OpResult};
    use crate::math;

    use super::*;

    /// Scripted RPC double. Every broadcast is recorded; failures are
    /// injected per call via `push_batch_failure`.
    pub struct MockRpc {
        pub account_id: String,
        pub balances: Mutex<BalanceSnapshot>,
        pub open_orders: Mutex<Vec<OpenOrder>>,
        pub executed_batches: Mutex<Vec<Vec<BuiltOp>>>,
        batch_failures: Mutex<VecDeque<Option<String>>>,
        next_order_num: AtomicU64,
        mode: FillProcessingMode,
        pub pool_price: Mutex<Option<f64>>,
        pub market_price: Mutex<Option<f64>>,
        fill_tx: Mutex<Option<mpsc::UnboundedSender<Vec<FillEvent>>>>,
    }

    impl MockRpc {
        pub fn new() -> Self {
            Self {
                account_id: "1.2.777".to_string(),
                balances: Mutex::new(BalanceSnapshot::default()),
                open_orders: Mutex::new(Vec::new()),
                executed_batches: Mutex::new(Vec::new()),
                batch_failures: Mutex::new(VecDeque::new()),
                next_order_num: AtomicU64::new(1000),
                mode: FillProcessingMode::History,
                pool_price: Mutex::new(None),
                market_price: Mutex::new(None),
                fill_tx: Mutex::new(None),
            }
        }

        pub fn with_mode(mut self, mode: FillProcessingMode) -> Self {
            self.mode = mode;
            self
        }

        pub fn set_balances(&self, balances: BalanceSnapshot) {
            *self.balances.lock().unwrap() = balances;
        }

        pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
            *self.open_orders.lock().unwrap() = orders;
        }

        /// Queue the outcome of the next `execute_batch` call: `Some(msg)`
        /// fails with that node message, `None` succeeds.
        pub fn push_batch_failure(&self, message: Option<&str>) {
            self.batch_failures
                .lock()
                .unwrap()
                .push_back(message.map(str::to_string));
        }

        /// Deliver a batch of fill events to the subscribed listener.
        pub fn inject_fills(&self, fills: Vec<FillEvent>) {
            if let Some(tx) = self.fill_tx.lock().unwrap().as_ref() {
                let _ = tx.send(fills);
            }
        }

        pub fn batches_executed(&self) -> usize {
            self.executed_batches.lock().unwrap().len()
        }

        pub fn last_batch(&self) -> Option<Vec<BuiltOp>> {
            self.executed_batches.lock().unwrap().last().cloned()
        }

        fn next_order_id(&self) -> String {
            let n = self.next_order_num.fetch_add(1, Ordering::SeqCst);
            format!("1.7.{n}")
        }
    }

    impl Default for MockRpc {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl DexRpc for MockRpc {
        async fn wait_for_connected(&self, _timeout: Duration) -> EngineResult<()> {
            Ok(())
        }

        async fn resolve_account_id(&self, name: &str) -> EngineResult<String> {
            if name.is_empty() {
                return Err(EngineError::NoAccount);
            }
            Ok(self.account_id.clone())
        }

        async fn read_open_orders(&self, _account_id: &str) -> EngineResult<Vec<OpenOrder>> {
            Ok(self.open_orders.lock().unwrap().clone())
        }

        async fn fetch_balances(
            &self,
            _account_id: &str,
            _pair: &AssetPair,
        ) -> EngineResult<BalanceSnapshot> {
            Ok(*self.balances.lock().unwrap())
        }

        fn build_create_order_op(
            &self,
            _account_id: &str,
            amount_to_sell: f64,
            sell_asset: &Asset,
            min_to_receive: f64,
            receive_asset: &Asset,
            expiration_secs: u64,
        ) -> Option<BuiltOp> {
            let sell_units = math::to_int(amount_to_sell, sell_asset.precision);
            let receive_units = math::to_int(min_to_receive, receive_asset.precision);
            if sell_units == 0 || receive_units == 0 {
                return None;
            }
            Some(BuiltOp::Create {
                amount_to_sell: sell_units,
                sell_asset_id: sell_asset.id.clone(),
                min_to_receive: receive_units,
                receive_asset_id: receive_asset.id.clone(),
                expiration_secs,
            })
        }

        fn build_update_order_op(
            &self,
            _account_id: &str,
            order_id: &str,
            new_amount_to_sell: f64,
            sell_asset: &Asset,
            new_min_to_receive: Option<f64>,
            receive_asset: &Asset,
            raw_for_sale: Option<i64>,
        ) -> Option<BuiltOp> {
            let new_units = math::to_int(new_amount_to_sell, sell_asset.precision);
            let delta = new_units - raw_for_sale.unwrap_or(0);
            let new_price = new_min_to_receive.map(|min| ChainPrice {
                base: crate::chain::types::AssetAmount {
                    amount: new_units,
                    asset_id: sell_asset.id.clone(),
                },
                quote: crate::chain::types::AssetAmount {
                    amount: math::to_int(min, receive_asset.precision),
                    asset_id: receive_asset.id.clone(),
                },
            });
            if delta == 0 && new_price.is_none() {
                return None;
            }
            Some(BuiltOp::Update {
                order_id: order_id.to_string(),
                delta_amount_to_sell: delta,
                new_price,
            })
        }

        fn build_cancel_order_op(&self, _account_id: &str, order_id: &str) -> BuiltOp {
            BuiltOp::Cancel {
                order_id: order_id.to_string(),
            }
        }

        async fn execute_batch(
            &self,
            _account_id: &str,
            ops: Vec<BuiltOp>,
        ) -> EngineResult<BatchResult> {
            let scripted = self.batch_failures.lock().unwrap().pop_front();
            if let Some(Some(message)) = scripted {
                return Err(EngineError::Rpc(message));
            }

            let operation_results = ops
                .iter()
                .map(|op| match op {
                    BuiltOp::Create { .. } => OpResult {
                        kind: 1,
                        return_value: Some(self.next_order_id()),
                    },
                    BuiltOp::Update { .. } => OpResult {
                        kind: 2,
                        return_value: None,
                    },
                    BuiltOp::Cancel { .. } => OpResult {
                        kind: 0,
                        return_value: None,
                    },
                })
                .collect();

            self.executed_batches.lock().unwrap().push(ops);

            Ok(BatchResult {
                success: true,
                operation_results,
                raw: serde_json::Value::Null,
            })
        }

        async fn listen_for_fills(
            &self,
            _account_id: &str,
        ) -> EngineResult<mpsc::UnboundedReceiver<Vec<FillEvent>>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.fill_tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        fn fill_processing_mode(&self) -> FillProcessingMode {
            self.mode
        }

        async fn fetch_pool_price(&self, _pair: &AssetPair) -> EngineResult<Option<f64>> {
            Ok(*self.pool_price.lock().unwrap())
        }

        async fn fetch_market_price(&self, _pair: &AssetPair) -> EngineResult<Option<f64>> {
            Ok(*self.market_price.lock().unwrap())
        }
    }

    /// Build a `ChainPrice` for a sell order on `pair` at `price`.
    pub fn sell_price_at(pair: &AssetPair, base_amount: f64, price: f64) -> ChainPrice {
        ChainPrice::selling_base(pair, base_amount, price)
    }

    /// Build a `ChainPrice` for a buy order on `pair` at `price`.
    pub fn buy_price_at(pair: &AssetPair, base_amount: f64, price: f64) -> ChainPrice {
        ChainPrice::selling_quote(pair, base_amount, price)
    }
}
