//! Short-TTL read-through cache for prices and balances.
//!
//! Shared by every component that needs a quote so the request rate to the
//! exchange stays bounded. The map lock is held only for lookup and insert;
//! the fetch itself happens outside it, so concurrent readers never block
//! each other past the underlying request. Failed fetches cache nothing and
//! expired entries are never served.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::api::ExchangeApi;

use super::{EngineError, TradingConfig};

struct Entry {
    fetched_at: Instant,
    value: Decimal,
}

/// Read-through price/balance cache.
pub struct QuoteCache {
    exchange: Arc<dyn ExchangeApi>,
    prices: Mutex<HashMap<String, Entry>>,
    balances: Mutex<HashMap<String, Entry>>,
    price_ttl: Duration,
    balance_ttl: Duration,
}

impl QuoteCache {
    pub fn new(exchange: Arc<dyn ExchangeApi>, config: &TradingConfig) -> Self {
        Self {
            exchange,
            prices: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            price_ttl: config.price_ttl,
            balance_ttl: config.balance_ttl,
        }
    }

    /// Current price for an instrument pair.
    pub async fn price(&self, symbol: &str) -> Result<Decimal, EngineError> {
        {
            let prices = self.prices.lock().await;
            if let Some(entry) = prices.get(symbol) {
                if entry.fetched_at.elapsed() < self.price_ttl {
                    debug!(symbol = %symbol, price = %entry.value, "Using cached price");
                    return Ok(entry.value);
                }
            }
        }

        let price = self
            .exchange
            .get_current_price(symbol)
            .await?
            .filter(|price| *price > Decimal::ZERO)
            .ok_or_else(|| EngineError::PriceUnavailable(symbol.to_string()))?;

        let mut prices = self.prices.lock().await;
        prices.insert(
            symbol.to_string(),
            Entry {
                fetched_at: Instant::now(),
                value: price,
            },
        );

        Ok(price)
    }

    /// Available balance for an asset.
    pub async fn balance(&self, asset: &str) -> Result<Decimal, EngineError> {
        {
            let balances = self.balances.lock().await;
            if let Some(entry) = balances.get(asset) {
                if entry.fetched_at.elapsed() < self.balance_ttl {
                    debug!(asset = %asset, balance = %entry.value, "Using cached balance");
                    return Ok(entry.value);
                }
            }
        }

        let balance = self.exchange.get_balance(asset).await?;

        let mut balances = self.balances.lock().await;
        balances.insert(
            asset.to_string(),
            Entry {
                fetched_at: Instant::now(),
                value: balance,
            },
        );

        Ok(balance)
    }
}
