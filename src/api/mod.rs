//! Exchange, ledger-adjacent and notification clients.
//!
//! The exchange surface is a trait so the trading engine can be exercised
//! against a scripted implementation in tests.

mod exchange;
mod notifier;
mod types;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

pub use exchange::ExchangeClient;
pub use notifier::Notifier;
pub use types::*;

/// Errors surfaced by the exchange RPC layer.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network-level failure; retried with backoff where safe.
    #[error("transport error: {0}")]
    Transport(String),

    /// Structured rejection from the venue.
    #[error("exchange rejected request: {code} - {message}")]
    Rejected { code: i64, message: String },

    /// Credentials rejected; fatal at startup only.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Response did not match the documented shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Venue error code for quantity-encoding rejections.
const INVALID_QUANTITY_CODE: i64 = 213;

impl ExchangeError {
    /// Rejections that should trigger the quantity-format retry ladder.
    pub fn is_invalid_quantity(&self) -> bool {
        matches!(
            self,
            ExchangeError::Rejected { code, message }
                if *code == INVALID_QUANTITY_CODE || message.contains("Invalid quantity format")
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}

/// The narrow exchange surface the engine depends on.
///
/// Every operation is idempotent-safe to retry except `submit_order`.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Latest price for an instrument pair, `None` when the venue has no
    /// ticker data for it.
    async fn get_current_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError>;

    /// Available balance for a single asset.
    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError>;

    /// Submit an order and return its id.
    async fn submit_order(&self, request: &OrderRequest) -> Result<String, ExchangeError>;

    /// Current state of an order.
    async fn get_order_detail(&self, order_id: &str) -> Result<OrderDetail, ExchangeError>;

    /// Cancel a resting order. `false` means the venue refused (already
    /// filled, unknown id, ...).
    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError>;
}
