//! ATR-style risk levels: stop-loss, take-profit, and trailing-stop.
//!
//! The volatility figure is a proxy, not a true ATR: it is 3 % of the
//! current price (or a static per-symbol fallback when no price is
//! available), cached for an hour per symbol. Callers must not assume
//! statistical accuracy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{QuoteCache, TradingConfig};

/// Share of price used as the volatility proxy.
const VOLATILITY_RATIO: Decimal = dec!(0.03);

/// Safety buffer applied below a swing low.
const SWING_LOW_BUFFER: Decimal = dec!(0.99);

/// Hard cap on the take-profit distance: never target more than 10 % above
/// entry, regardless of resistance input.
const MAX_TARGET_RATIO: Decimal = dec!(1.10);

/// Decimal places for published levels.
const LEVEL_DECIMALS: u32 = 4;

/// Risk-level calculator with a per-symbol volatility cache.
pub struct AtrStrategy {
    quotes: Arc<QuoteCache>,
    multiplier: Decimal,
    volatility_ttl: Duration,
    volatility_cache: Mutex<HashMap<String, (Instant, Decimal)>>,
    fallback: HashMap<&'static str, Decimal>,
}

impl AtrStrategy {
    pub fn new(quotes: Arc<QuoteCache>, config: &TradingConfig) -> Self {
        let fallback = HashMap::from([
            ("BTC_USDT", dec!(800)),
            ("ETH_USDT", dec!(50)),
            ("SOL_USDT", dec!(3)),
            ("SUI_USDT", dec!(0.1)),
            ("BONK_USDT", dec!(0.000001)),
            ("DOGE_USDT", dec!(0.01)),
            ("XRP_USDT", dec!(0.05)),
        ]);

        Self {
            quotes,
            multiplier: config.atr_multiplier,
            volatility_ttl: config.volatility_ttl,
            volatility_cache: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    /// Volatility proxy for a symbol, cached for an hour.
    pub async fn volatility(&self, symbol: &str) -> Decimal {
        {
            let cached = self.volatility_cache.lock().await;
            if let Some((fetched_at, value)) = cached.get(symbol) {
                if fetched_at.elapsed() < self.volatility_ttl {
                    debug!(symbol = %symbol, volatility = %value, "Using cached volatility");
                    return *value;
                }
            }
        }

        let volatility = match self.quotes.price(symbol).await {
            Ok(price) => price * VOLATILITY_RATIO,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "No price for volatility, using fallback");
                self.fallback
                    .get(symbol)
                    .copied()
                    .unwrap_or(VOLATILITY_RATIO)
            }
        };

        let mut cached = self.volatility_cache.lock().await;
        cached.insert(symbol.to_string(), (Instant::now(), volatility));

        debug!(symbol = %symbol, volatility = %volatility, "Calculated volatility");
        volatility
    }

    /// Stop-loss for a new entry, optionally respecting a swing low.
    pub async fn stop_loss(
        &self,
        symbol: &str,
        entry: Decimal,
        swing_low: Option<Decimal>,
    ) -> Decimal {
        let volatility = self.volatility(symbol).await;
        stop_loss_level(entry, volatility, self.multiplier, swing_low)
    }

    /// Take-profit for a new entry, optionally respecting a resistance
    /// level.
    pub async fn take_profit(
        &self,
        symbol: &str,
        entry: Decimal,
        resistance: Option<Decimal>,
    ) -> Decimal {
        let volatility = self.volatility(symbol).await;
        take_profit_level(entry, volatility, self.multiplier, resistance)
    }

    /// Trailing-stop update against the live price. The sole writer of the
    /// stop-loss during the active-monitoring phase.
    pub async fn trailing_stop(
        &self,
        symbol: &str,
        current_price: Decimal,
        current_stop: Decimal,
        highest_price: Decimal,
    ) -> (Decimal, Decimal) {
        let volatility = self.volatility(symbol).await;
        trailing_stop_level(
            current_price,
            volatility,
            self.multiplier,
            current_stop,
            highest_price,
        )
    }
}

/// `entry - v*m`, pulled under a swing low (with a 1 % buffer) when one is
/// supplied below entry.
pub fn stop_loss_level(
    entry: Decimal,
    volatility: Decimal,
    multiplier: Decimal,
    swing_low: Option<Decimal>,
) -> Decimal {
    let atr_stop = entry - volatility * multiplier;

    let level = match swing_low {
        Some(low) if low < entry => atr_stop.min(low) * SWING_LOW_BUFFER,
        _ => atr_stop,
    };

    level.round_dp(LEVEL_DECIMALS)
}

/// `entry + v*m` as the minimum acceptable target; a resistance level is
/// adopted only when it exceeds the minimum; capped at 10 % above entry.
pub fn take_profit_level(
    entry: Decimal,
    volatility: Decimal,
    multiplier: Decimal,
    resistance: Option<Decimal>,
) -> Decimal {
    let minimum = entry + volatility * multiplier;

    let target = match resistance {
        Some(level) if level > minimum => level,
        _ => minimum,
    };

    target.min(entry * MAX_TARGET_RATIO).round_dp(LEVEL_DECIMALS)
}

/// Trailing-stop rule: only a new high recomputes the candidate stop, and
/// the candidate is adopted only when it is above the current stop. The
/// stop never retreats.
pub fn trailing_stop_level(
    current_price: Decimal,
    volatility: Decimal,
    multiplier: Decimal,
    current_stop: Decimal,
    highest_price: Decimal,
) -> (Decimal, Decimal) {
    if current_price > highest_price {
        let candidate = current_price - volatility * multiplier;
        if candidate > current_stop {
            return (candidate, current_price);
        }
    }

    (current_stop, highest_price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;

    #[test]
    fn test_stop_loss_respects_swing_low_with_buffer() {
        // atr_stop = 100 - 3*2 = 94; min(94, 92) = 92; * 0.99 = 91.08
        let level = stop_loss_level(dec!(100), dec!(3), dec!(2), Some(dec!(92)));
        assert_eq!(level, dec!(91.08));
    }

    #[test]
    fn test_stop_loss_ignores_swing_low_above_entry() {
        let level = stop_loss_level(dec!(100), dec!(3), dec!(2), Some(dec!(105)));
        assert_eq!(level, dec!(94));
    }

    #[test]
    fn test_take_profit_caps_resistance_at_ten_percent() {
        // minimum = 106; resistance 115 > 106, but capped at 110
        let level = take_profit_level(dec!(100), dec!(3), dec!(2), Some(dec!(115)));
        assert_eq!(level, dec!(110));
    }

    #[test]
    fn test_take_profit_keeps_minimum_over_weak_resistance() {
        let level = take_profit_level(dec!(100), dec!(3), dec!(2), Some(dec!(104)));
        assert_eq!(level, dec!(106));
    }

    #[test]
    fn test_trailing_stop_moves_only_on_new_high() {
        // No new high: inputs unchanged.
        assert_eq!(
            trailing_stop_level(dec!(100), dec!(3), dec!(2), dec!(94), dec!(101)),
            (dec!(94), dec!(101))
        );

        // New high with a better candidate: 108 - 6 = 102 > 94.
        assert_eq!(
            trailing_stop_level(dec!(108), dec!(3), dec!(2), dec!(94), dec!(101)),
            (dec!(102), dec!(108))
        );

        // New high whose candidate does not beat the current stop.
        assert_eq!(
            trailing_stop_level(dec!(102), dec!(3), dec!(2), dec!(98), dec!(101)),
            (dec!(98), dec!(101))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatility_is_three_percent_of_price() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("BTC_USDT", dec!(50000));
        let config = TradingConfig::default();
        let quotes = Arc::new(QuoteCache::new(exchange, &config));
        let strategy = AtrStrategy::new(quotes, &config);

        assert_eq!(strategy.volatility("BTC_USDT").await, dec!(1500.00));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatility_falls_back_without_price() {
        let exchange = Arc::new(MockExchange::new());
        let config = TradingConfig::default();
        let quotes = Arc::new(QuoteCache::new(exchange, &config));
        let strategy = AtrStrategy::new(quotes, &config);

        // Known symbol: static fallback table.
        assert_eq!(strategy.volatility("DOGE_USDT").await, dec!(0.01));
        // Unknown symbol: hardcoded constant.
        assert_eq!(strategy.volatility("ABC_USDT").await, dec!(0.03));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volatility_cached_for_an_hour() {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_price("ETH_USDT", dec!(2000));
        let config = TradingConfig::default();
        let quotes = Arc::new(QuoteCache::new(exchange.clone(), &config));
        let strategy = AtrStrategy::new(quotes, &config);

        assert_eq!(strategy.volatility("ETH_USDT").await, dec!(60.00));

        exchange.set_price("ETH_USDT", dec!(3000));
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(strategy.volatility("ETH_USDT").await, dec!(60.00));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(strategy.volatility("ETH_USDT").await, dec!(90.00));
    }
}
