//! Trading configuration.

use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for trade sizing, risk levels, polling cadence, and the
/// per-asset quantity conventions of the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Quote-currency notional per buy order
    pub trade_amount: Decimal,

    /// Balance required before buying, as a multiple of `trade_amount`
    /// (covers fees)
    pub fee_buffer: Decimal,

    /// Quote asset of all traded pairs
    pub quote_asset: String,

    /// ATR multiplier for stop/target distances
    pub atr_multiplier: Decimal,

    /// Outer trading-loop tick interval (seconds)
    pub check_interval_secs: u64,

    /// Background exchange-sweep coalescing interval (seconds)
    pub status_check_interval_secs: u64,

    /// Fill-monitor polling attempts
    pub fill_poll_attempts: u32,

    /// Fill-monitor polling interval (seconds)
    pub fill_poll_interval_secs: u64,

    /// Settle time after cancelling protective orders, before the balance
    /// is re-queried for the sell (seconds)
    pub settle_delay_secs: u64,

    /// Delay between sequential sell batches (seconds)
    pub batch_delay_secs: u64,

    /// Assets quoted in whole units on this venue
    pub integer_assets: Vec<String>,

    /// Decimal places accepted per asset; `default_precision` otherwise
    pub decimal_precision: HashMap<String, u32>,
    pub default_precision: u32,

    /// Single-order quantity ceiling for integer-quoted assets
    pub integer_batch_ceiling: Decimal,

    /// Single-order quantity ceiling for everything else
    pub decimal_batch_ceiling: Decimal,

    /// Price cache TTL
    pub price_ttl: Duration,

    /// Balance cache TTL
    pub balance_ttl: Duration,

    /// Volatility-proxy cache TTL
    pub volatility_ttl: Duration,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let mut decimal_precision = HashMap::new();
        decimal_precision.insert("BTC".to_string(), 6);
        decimal_precision.insert("ETH".to_string(), 6);
        decimal_precision.insert("SOL".to_string(), 4);
        decimal_precision.insert("LTC".to_string(), 4);
        decimal_precision.insert("XRP".to_string(), 2);

        Self {
            trade_amount: dec!(10),
            fee_buffer: dec!(1.05),
            quote_asset: "USDT".to_string(),
            atr_multiplier: dec!(2.0),
            check_interval_secs: 5,
            status_check_interval_secs: 60,
            fill_poll_attempts: 30,
            fill_poll_interval_secs: 5,
            settle_delay_secs: 2,
            batch_delay_secs: 2,
            integer_assets: ["SUI", "BONK", "SHIB", "DOGE", "PEPE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            decimal_precision,
            default_precision: 2,
            integer_batch_ceiling: dec!(100000),
            decimal_batch_ceiling: dec!(100),
            price_ttl: Duration::from_secs(1),
            balance_ttl: Duration::from_secs(5),
            volatility_ttl: Duration::from_secs(3600),
        }
    }
}

impl TradingConfig {
    /// Minimum quote balance required before placing a buy.
    pub fn min_balance_required(&self) -> Decimal {
        self.trade_amount * self.fee_buffer
    }

    /// Whether an asset is quoted in whole units on this venue.
    pub fn is_integer_asset(&self, asset: &str) -> bool {
        self.integer_assets.iter().any(|a| a == asset)
    }

    /// Decimal places accepted for an asset's quantities.
    pub fn precision_for(&self, asset: &str) -> u32 {
        self.decimal_precision
            .get(asset)
            .copied()
            .unwrap_or(self.default_precision)
    }

    /// Largest quantity submitted as a single order for an asset.
    pub fn batch_ceiling_for(&self, asset: &str) -> Decimal {
        if self.is_integer_asset(asset) {
            self.integer_batch_ceiling
        } else {
            self.decimal_batch_ceiling
        }
    }

    pub fn fill_poll_interval(&self) -> Duration {
        Duration::from_secs(self.fill_poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs(self.batch_delay_secs)
    }
}
