//! Position model: the unit of tracked risk.
//!
//! Mutation happens through a small closed set of operations, each
//! enforcing its own invariant: `apply_fill` (quantity reconciliation and
//! activation), `update_trailing_stop` (monotone stop), `close` (single
//! transition to sold).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Entry order submitted, fill not yet confirmed.
    OrderPlaced,
    /// Fill confirmed; under active monitoring.
    PositionActive,
    /// Exit confirmed.
    Sold,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::OrderPlaced => "ORDER_PLACED",
            PositionStatus::PositionActive => "POSITION_ACTIVE",
            PositionStatus::Sold => "SOLD",
        }
    }
}

/// How a position was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitType {
    TakeProfit,
    StopLoss,
    Manual,
    None,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::TakeProfit => "take_profit",
            ExitType::StopLoss => "stop_loss",
            ExitType::Manual => "manual",
            ExitType::None => "none",
        }
    }
}

/// A tracked spot position for a single instrument pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Instrument pair; unique key in the active-position map.
    pub symbol: String,

    /// Entry order id on the exchange.
    pub entry_order_id: String,

    /// Opaque handle back to the originating ledger row.
    pub source_row: i64,

    /// Base-asset quantity. Reconciled from the fill report once the entry
    /// order executes; an estimate before that.
    pub quantity: Decimal,

    /// Average entry price from the fill report.
    pub entry_price: Decimal,

    /// Highest price seen while active; monotonically non-decreasing,
    /// seeds the trailing stop.
    pub highest_price: Decimal,

    /// Current stop-loss level. Only ever raised after activation.
    pub stop_loss: Decimal,

    /// Take-profit level; static after entry.
    pub take_profit: Decimal,

    /// Resting take-profit order on the exchange, if one was placed.
    pub tp_order_id: Option<String>,

    /// Resting stop-loss order on the exchange, if one was placed.
    pub sl_order_id: Option<String>,

    pub status: PositionStatus,

    /// Consulted independently of `status` by the monitor sweep; kept
    /// consistent with it by the mutation methods.
    pub is_open: bool,

    pub exit_price: Option<Decimal>,
    pub exit_type: ExitType,
    pub realized_pnl: Option<Decimal>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a provisional position for a just-submitted entry order.
    pub fn new(
        symbol: String,
        entry_order_id: String,
        source_row: i64,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            symbol,
            entry_order_id,
            source_row,
            quantity,
            entry_price,
            highest_price: entry_price,
            stop_loss,
            take_profit,
            tp_order_id: None,
            sl_order_id: None,
            status: PositionStatus::OrderPlaced,
            is_open: true,
            exit_price: None,
            exit_type: ExitType::None,
            realized_pnl: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reconstruct a position from live balance when a sell signal arrives
    /// for a symbol we are not tracking (manual or out-of-band buys). Entry
    /// price is unknown, so no PnL will be reported for it.
    pub fn synthetic(symbol: String, source_row: i64, quantity: Decimal) -> Self {
        let mut position = Self::new(
            symbol,
            "manual".to_string(),
            source_row,
            quantity,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
        );
        position.status = PositionStatus::PositionActive;
        position
    }

    /// Reconcile quantity and price from the exchange's fill report and
    /// activate the position. The fill quantity must be positive.
    pub fn apply_fill(&mut self, quantity: Decimal, avg_price: Decimal) {
        debug_assert!(quantity > Decimal::ZERO, "fill quantity must be positive");
        self.quantity = quantity;
        if avg_price > Decimal::ZERO {
            self.entry_price = avg_price;
            self.highest_price = self.highest_price.max(avg_price);
        }
        self.status = PositionStatus::PositionActive;
        self.updated_at = Utc::now();
    }

    /// Adopt a new trailing stop. Both fields are monotone: a stop below
    /// the current one or a highest below the current one is ignored.
    /// Returns whether the stop actually moved.
    pub fn update_trailing_stop(&mut self, stop_loss: Decimal, highest_price: Decimal) -> bool {
        if highest_price > self.highest_price {
            self.highest_price = highest_price;
            self.updated_at = Utc::now();
        }
        if stop_loss > self.stop_loss {
            self.stop_loss = stop_loss;
            self.updated_at = Utc::now();
            return true;
        }
        false
    }

    /// Record protective-order ids. Partial placement (one side only) is
    /// allowed.
    pub fn set_protective_orders(&mut self, tp_order_id: Option<String>, sl_order_id: Option<String>) {
        self.tp_order_id = tp_order_id;
        self.sl_order_id = sl_order_id;
        self.updated_at = Utc::now();
    }

    /// Transition to sold. Returns the realized PnL, or `None` when the
    /// position was already closed or the entry price is unknown.
    pub fn close(&mut self, exit_price: Decimal, exit_type: ExitType) -> Option<Decimal> {
        if !self.is_open {
            return None;
        }

        self.status = PositionStatus::Sold;
        self.is_open = false;
        self.exit_price = Some(exit_price);
        self.exit_type = exit_type;
        self.updated_at = Utc::now();

        if self.entry_price > Decimal::ZERO {
            let pnl = (exit_price - self.entry_price) * self.quantity;
            self.realized_pnl = Some(pnl);
            Some(pnl)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_open && self.status == PositionStatus::PositionActive
    }

    pub fn has_protective_orders(&self) -> bool {
        self.tp_order_id.is_some() || self.sl_order_id.is_some()
    }
}
