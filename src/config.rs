//! Engine settings and per-bot grid configuration

use std::path::PathBuf;

use config::{Config, File};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::chain::types::AssetPair;
use crate::consts::{
    CONNECTION_TIMEOUT_MS, DEFAULT_DIVERGENCE_RATIO_THRESHOLD,
    DEFAULT_DIVERGENCE_RMS_THRESHOLD, DEFAULT_DUST_PCT, DEFAULT_MAINTENANCE_INTERVAL_SECS,
    DEFAULT_MIN_ORDER_FACTOR, DEFAULT_OPEN_ORDERS_SYNC_LOOP_MS, DEFAULT_ORDER_EXPIRATION_SECS,
    OPEN_ORDERS_SYNC_LOOP_ENV,
};
use crate::errors::{EngineError, EngineResult};

/// How the grid's start price is derived when (re)generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PriceMode {
    /// Price from a matching liquidity pool.
    Pool,
    /// Mid price from the order book.
    Market,
    /// Pool first, then market, then the configured start price.
    #[default]
    Auto,
}

/// Process-level engine settings, loaded from file + environment.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Directory holding per-bot state (`orders/{bot_key}.json`) and
    /// trigger files.
    pub profiles_dir: PathBuf,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Period of the open-orders watchdog; the
    /// `OPEN_ORDERS_SYNC_LOOP_MS` environment variable overrides it.
    #[serde(default = "default_sync_loop_ms")]
    pub open_orders_sync_loop_ms: u64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_rpc_max_attempts")]
    pub rpc_max_attempts: u32,

    #[serde(default = "default_rpc_base_delay_ms")]
    pub rpc_base_delay_ms: u64,

    #[serde(default = "default_rpc_max_delay_ms")]
    pub rpc_max_delay_ms: u64,
}

fn default_maintenance_interval() -> u64 {
    DEFAULT_MAINTENANCE_INTERVAL_SECS
}

fn default_sync_loop_ms() -> u64 {
    DEFAULT_OPEN_ORDERS_SYNC_LOOP_MS
}

fn default_connection_timeout() -> u64 {
    CONNECTION_TIMEOUT_MS
}

fn default_rpc_max_attempts() -> u32 {
    crate::consts::DEFAULT_RPC_MAX_ATTEMPTS
}

fn default_rpc_base_delay_ms() -> u64 {
    crate::consts::DEFAULT_RPC_BASE_DELAY_MS
}

fn default_rpc_max_delay_ms() -> u64 {
    crate::consts::DEFAULT_RPC_MAX_DELAY_MS
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            profiles_dir: PathBuf::from("profiles"),
            maintenance_interval_secs: default_maintenance_interval(),
            open_orders_sync_loop_ms: default_sync_loop_ms(),
            connection_timeout_ms: default_connection_timeout(),
            rpc_max_attempts: default_rpc_max_attempts(),
            rpc_base_delay_ms: default_rpc_base_delay_ms(),
            rpc_max_delay_ms: default_rpc_max_delay_ms(),
        }
    }
}

impl EngineSettings {
    /// Load settings from a configuration file, with `DEXGRID_*` environment
    /// variables layered on top.
    pub fn load(config_path: &str) -> EngineResult<Self> {
        // Pull in .env before the environment source reads it
        let _ = dotenvy::dotenv();

        let mut settings: Self = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(config::Environment::with_prefix("DEXGRID").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::config("settings", e.to_string()))?;

        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Apply the enumerated raw environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var(OPEN_ORDERS_SYNC_LOOP_ENV) {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => self.open_orders_sync_loop_ms = ms,
                _ => warn!(
                    "Ignoring invalid {}={:?}, using {}ms",
                    OPEN_ORDERS_SYNC_LOOP_ENV, raw, self.open_orders_sync_loop_ms
                ),
            }
        }
    }
}

/// Per-bot grid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Key identifying this bot in the profiles directory.
    pub bot_key: String,

    /// Account name the bot trades as.
    pub account: String,

    /// Traded pair plus the network fee asset.
    pub pair: AssetPair,

    /// Price the grid is centered on at generation time.
    pub start_price: f64,

    /// Lower bound of the price ladder.
    pub min_price: f64,

    /// Upper bound of the price ladder.
    pub max_price: f64,

    /// Geometric step between adjacent slots, in percent.
    pub increment_percent: f64,

    /// Desired bid-ask window, in percent.
    pub target_spread_percent: f64,

    /// Exponent applied to the geometric allocation weights.
    #[serde(default = "default_allocation_weight")]
    pub allocation_weight: f64,

    /// Fee-asset amount reserved per active order before sizing.
    #[serde(default)]
    pub fee_reserve: f64,

    /// Dust threshold as percent of the ideal slot size.
    #[serde(default = "default_dust_pct")]
    pub dust_pct: f64,

    /// Absolute order-size floor in units of `10^-p`.
    #[serde(default = "default_min_order_factor")]
    pub min_order_factor: f64,

    #[serde(default = "default_rms_threshold")]
    pub divergence_rms_threshold: f64,

    #[serde(default = "default_ratio_threshold")]
    pub divergence_ratio_threshold: f64,

    /// Expiration stamped on created orders, seconds from broadcast.
    #[serde(default = "default_expiration")]
    pub expiration_secs: u64,

    #[serde(default)]
    pub price_mode: PriceMode,
}

fn default_allocation_weight() -> f64 {
    1.0
}

fn default_dust_pct() -> f64 {
    DEFAULT_DUST_PCT
}

fn default_min_order_factor() -> f64 {
    DEFAULT_MIN_ORDER_FACTOR
}

fn default_rms_threshold() -> f64 {
    DEFAULT_DIVERGENCE_RMS_THRESHOLD
}

fn default_ratio_threshold() -> f64 {
    DEFAULT_DIVERGENCE_RATIO_THRESHOLD
}

fn default_expiration() -> u64 {
    DEFAULT_ORDER_EXPIRATION_SECS
}

impl BotConfig {
    /// Validate the configuration; construction fails fast on bad input.
    pub fn validate(&self) -> EngineResult<()> {
        if self.min_price <= 0.0 {
            return Err(EngineError::config("min_price", "must be positive"));
        }
        if self.max_price <= 0.0 {
            return Err(EngineError::config("max_price", "must be positive"));
        }
        if self.start_price <= 0.0 {
            return Err(EngineError::config("start_price", "must be positive"));
        }
        if self.min_price > self.start_price || self.start_price > self.max_price {
            return Err(EngineError::config(
                "start_price",
                "must satisfy min_price <= start_price <= max_price",
            ));
        }
        if self.increment_percent <= 0.0 || self.increment_percent >= 100.0 {
            return Err(EngineError::config(
                "increment_percent",
                "must be in (0, 100)",
            ));
        }
        if self.target_spread_percent < 0.0 {
            return Err(EngineError::config(
                "target_spread_percent",
                "must not be negative",
            ));
        }
        if self.bot_key.is_empty() {
            return Err(EngineError::config("bot_key", "cannot be empty"));
        }
        if self.account.is_empty() {
            return Err(EngineError::config("account", "cannot be empty"));
        }
        Ok(())
    }

    /// Load a bot config from a JSON file and validate it.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the bot config to a JSON file.
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
