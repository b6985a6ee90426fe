//! Trade signals as read from the ledger's signal queue.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Requested action for a signal row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
}

impl SignalAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "BUY" => Some(SignalAction::Buy),
            "SELL" => Some(SignalAction::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
        }
    }
}

/// One actionable row from the signal queue.
///
/// `row_id` is an opaque handle back to the ledger row; the engine only
/// threads it through to ledger calls, never interprets it. Optional risk
/// levels of zero in the source row are treated as absent.
#[derive(Debug, Clone)]
pub struct TradeSignal {
    pub row_id: i64,
    /// Normalized instrument pair, e.g. `BTC_USDT`.
    pub symbol: String,
    /// Base asset of the pair, e.g. `BTC`.
    pub base_asset: String,
    pub action: SignalAction,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub resistance_up: Option<Decimal>,
    pub resistance_down: Option<Decimal>,
    /// Entry order id recorded on the row, when a position was opened by us.
    pub order_id: Option<String>,
}

/// Normalize a raw symbol cell into an instrument pair: bare assets get the
/// quote appended, slash pairs become underscore pairs.
pub fn normalize_symbol(raw: &str, quote: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains('/') {
        trimmed.replace('/', "_")
    } else if trimmed.contains('_') {
        trimmed.to_string()
    } else {
        format!("{}_{}", trimmed, quote)
    }
}

/// Base asset of an instrument pair (`BTC_USDT` -> `BTC`).
pub fn base_asset(symbol: &str) -> &str {
    symbol.split('_').next().unwrap_or(symbol)
}
