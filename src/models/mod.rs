//! Data models for positions and trade signals.

mod position;
mod signal;

pub use position::{ExitType, Position, PositionStatus};
pub use signal::{base_asset, normalize_symbol, SignalAction, TradeSignal};
