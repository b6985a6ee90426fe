//! Trading engine: quote cache, risk levels, order gateway, position
//! store, and the lifecycle manager.

mod cache;
mod config;
mod manager;
mod orders;
mod risk;
mod store;

pub use cache::QuoteCache;
pub use config::TradingConfig;
pub use manager::PositionManager;
pub use orders::{format_quantity, FillResult, OrderGateway, SellSize};
pub use risk::AtrStrategy;
pub use store::PositionStore;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::api::ExchangeError;

/// Engine-level outcomes that are expected in normal operation. None of
/// these is fatal to the process; they are reported to the ledger and
/// logged by the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("insufficient balance: {available} available, {required} required")]
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },

    #[error("no price available for {0}")]
    PriceUnavailable(String),

    #[error("order {order_id} did not reach a terminal state within the poll budget")]
    FillTimeout { order_id: String },

    #[error("order {order_id} was cancelled without executing")]
    Unfilled { order_id: String },

    #[error("sell for {symbol} failed after exhausting all quantity formats")]
    SellExhausted { symbol: String },

    #[error("no tracked position or exchange balance for {0}")]
    NoPosition(String),
}
