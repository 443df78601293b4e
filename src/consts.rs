//! Engine-wide constants and tuning knobs

/// Minimum number of SPREAD placeholder slots between the rails.
pub const MIN_SPREAD_ORDERS: usize = 1;

/// The target spread is floored at `increment_percent * MIN_SPREAD_FACTOR`.
pub const MIN_SPREAD_FACTOR: f64 = 1.0;

/// Fill events carrying the same dedup key within this window are dropped.
pub const FILL_DEDUPE_WINDOW_MS: u64 = 60_000;

/// Entries in the recently-processed-fills map are evicted after this long.
pub const FILL_CLEANUP_INTERVAL_MS: u64 = 600_000;

/// Floor on the retention of stale-cleaned order ids. The effective window
/// is `max(FILL_DEDUPE_WINDOW_MS, STALE_CLEANED_MIN_RETENTION_MS)`.
pub const STALE_CLEANED_MIN_RETENTION_MS: u64 = 300_000;

/// Largest fill batch that still gets a single unified rebalance.
pub const MAX_FILL_BATCH_SIZE: usize = 6;

/// Adaptive chunk sizes for oversized fill batches, as `(min_fills, chunk)`
/// tiers. The first tier whose threshold the batch meets wins.
pub const BATCH_STRESS_TIERS: &[(usize, usize)] = &[(24, 8), (12, 6), (0, 4)];

/// Default RMS threshold above which a side counts as divergent (~14.3%).
pub const DEFAULT_DIVERGENCE_RMS_THRESHOLD: f64 = 0.143;

/// Default surplus/deficit ratio threshold for divergence detection.
pub const DEFAULT_DIVERGENCE_RATIO_THRESHOLD: f64 = 0.2;

/// Pipeline operation markers older than this are considered stuck.
pub const STUCK_PIPELINE_OP_MS: u64 = 300_000;

/// Budget for the initial connection wait at startup.
pub const CONNECTION_TIMEOUT_MS: u64 = 30_000;

/// Default period of the open-orders watchdog loop.
pub const DEFAULT_OPEN_ORDERS_SYNC_LOOP_MS: u64 = 45_000;

/// Environment variable overriding the watchdog loop period.
pub const OPEN_ORDERS_SYNC_LOOP_ENV: &str = "OPEN_ORDERS_SYNC_LOOP_MS";

/// Debounce for trigger-file detection.
pub const TRIGGER_DEBOUNCE_MS: u64 = 200;

/// Default period of the timer-driven maintenance pass.
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300;

/// Percent component of the fund-drift tolerance (0.1%).
pub const FUND_DRIFT_PCT_TOLERANCE: f64 = 0.001;

/// Integer-unit component of the fund-drift tolerance (`2 * 10^-p`).
pub const PRECISION_SLACK_UNITS: i64 = 2;

/// Default dust threshold as a percent of the ideal slot size.
pub const DEFAULT_DUST_PCT: f64 = 10.0;

/// Default absolute order-size floor, in units of `10^-p`.
pub const DEFAULT_MIN_ORDER_FACTOR: f64 = 1.0;

/// Default expiration stamped on created orders (~5 years, effectively GTC).
pub const DEFAULT_ORDER_EXPIRATION_SECS: u64 = 5 * 365 * 24 * 3600;

/// Spread correction fires when the measured spread exceeds the target by
/// more than this many percentage points.
pub const SPREAD_CORRECTION_TOLERANCE_PCT: f64 = 0.5;

/// Retry defaults for RPC calls.
pub const DEFAULT_RPC_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RPC_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_RPC_MAX_DELAY_MS: u64 = 10_000;

/// Operation code of an order-match event in the fill stream.
pub const ORDER_MATCH_OP: u8 = 4;
