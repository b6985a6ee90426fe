//! Signal queue and trade ledger.
//!
//! A tabular SQLite store with two tables:
//! - `signals`: the working sheet — one line per instrument carrying the
//!   requested action, optional risk levels, and the order/purchase/sale
//!   columns the engine stamps as a trade progresses.
//! - `archive`: completed trades, copied over with a computed return %.

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{debug, info, warn};

use crate::models::{base_asset, normalize_symbol, SignalAction, TradeSignal};

/// Quote asset appended to bare symbols in signal rows.
const DEFAULT_QUOTE: &str = "USDT";

/// Ledger status values stamped on signal rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    OrderPlaced,
    Sold,
    UpdateTpSl,
    InsufficientBalance,
    OrderFailed,
    Error,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::OrderPlaced => "ORDER_PLACED",
            TradeStatus::Sold => "SOLD",
            TradeStatus::UpdateTpSl => "UPDATE_TP_SL",
            TradeStatus::InsufficientBalance => "INSUFFICIENT_BALANCE",
            TradeStatus::OrderFailed => "ORDER_FAILED",
            TradeStatus::Error => "ERROR",
        }
    }
}

/// Optional fields accompanying a status update.
#[derive(Debug, Clone, Default)]
pub struct TradeUpdate {
    pub order_id: Option<String>,
    pub purchase_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub sell_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Raw signal row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignalRow {
    pub id: i64,
    pub symbol: String,
    pub action: String,
    pub tradable: bool,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub resistance_up: Option<f64>,
    pub resistance_down: Option<f64>,
    pub status: Option<String>,
    pub order_id: Option<String>,
    pub purchase_price: Option<f64>,
    pub quantity: Option<f64>,
    pub sell_price: Option<f64>,
    pub sell_quantity: Option<f64>,
    pub notes: Option<String>,
    pub updated_at: String,
}

/// SQLite-backed signal queue and ledger.
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (or create) the ledger database.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .context("Failed to connect to ledger database")?;

        let ledger = Self { pool };
        ledger.run_migrations().await?;

        Ok(ledger)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL DEFAULT 'WAIT',
                tradable INTEGER NOT NULL DEFAULT 1,
                buy_target REAL,
                take_profit REAL,
                stop_loss REAL,
                resistance_up REAL,
                resistance_down REAL,
                status TEXT,
                order_id TEXT,
                purchase_price REAL,
                quantity REAL,
                ordered_at TEXT,
                purchased_at TEXT,
                sell_price REAL,
                sell_quantity REAL,
                sold_at TEXT,
                notes TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS archive (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                purchase_price REAL,
                quantity REAL,
                purchased_at TEXT,
                sell_price REAL,
                sell_quantity REAL,
                sold_at TEXT,
                take_profit REAL,
                stop_loss REAL,
                resistance_up REAL,
                resistance_down REAL,
                notes TEXT,
                return_pct TEXT,
                method TEXT NOT NULL DEFAULT 'Trading Bot',
                archived_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_action ON signals(action)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_archive_symbol ON archive(symbol)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Signal queue ====================

    /// Insert a new signal line (CLI seeding; normally an external producer
    /// writes these).
    pub async fn insert_signal(
        &self,
        symbol: &str,
        action: SignalAction,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
        resistance_up: Option<Decimal>,
        resistance_down: Option<Decimal>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (symbol, action, take_profit, stop_loss, resistance_up, resistance_down)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(action.as_str())
        .bind(take_profit.map(|v| v.to_f64().unwrap_or(0.0)))
        .bind(stop_loss.map(|v| v.to_f64().unwrap_or(0.0)))
        .bind(resistance_up.map(|v| v.to_f64().unwrap_or(0.0)))
        .bind(resistance_down.map(|v| v.to_f64().unwrap_or(0.0)))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Actionable signals: tradable rows with a BUY or SELL action.
    pub async fn trade_signals(&self) -> Result<Vec<TradeSignal>> {
        let rows: Vec<SignalRow> = sqlx::query_as(
            r#"
            SELECT id, symbol, action, tradable, take_profit, stop_loss,
                   resistance_up, resistance_down, status, order_id,
                   purchase_price, quantity, sell_price, sell_quantity,
                   notes, updated_at
            FROM signals
            WHERE tradable = 1 AND action IN ('BUY', 'SELL')
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut signals = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(action) = SignalAction::parse(&row.action) else {
                continue;
            };
            let symbol = normalize_symbol(&row.symbol, DEFAULT_QUOTE);
            let base = base_asset(&symbol).to_string();

            signals.push(TradeSignal {
                row_id: row.id,
                symbol,
                base_asset: base,
                action,
                take_profit: optional_level(row.take_profit),
                stop_loss: optional_level(row.stop_loss),
                resistance_up: optional_level(row.resistance_up),
                resistance_down: optional_level(row.resistance_down),
                order_id: row.order_id.filter(|id| !id.is_empty()),
            });
        }

        debug!(count = signals.len(), "Fetched trade signals");
        Ok(signals)
    }

    // ==================== Status updates ====================

    /// Stamp a status (and its accompanying columns) on a signal row.
    pub async fn update_trade_status(
        &self,
        row_id: i64,
        status: TradeStatus,
        update: TradeUpdate,
    ) -> Result<()> {
        info!(row = row_id, status = status.as_str(), "Updating trade status");

        match status {
            TradeStatus::OrderPlaced => {
                // An order in flight makes the line non-tradable until sold.
                sqlx::query(
                    r#"
                    UPDATE signals SET
                        status = ?,
                        tradable = 0,
                        order_id = COALESCE(?, order_id),
                        purchase_price = COALESCE(?, purchase_price),
                        quantity = COALESCE(?, quantity),
                        take_profit = COALESCE(?, take_profit),
                        stop_loss = COALESCE(?, stop_loss),
                        ordered_at = datetime('now'),
                        purchased_at = datetime('now'),
                        notes = CASE WHEN ? IS NOT NULL THEN 'Order ID: ' || ? ELSE notes END,
                        updated_at = datetime('now')
                    WHERE id = ?
                    "#,
                )
                .bind(status.as_str())
                .bind(update.order_id.as_deref())
                .bind(update.purchase_price.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(update.quantity.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(update.take_profit.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(update.stop_loss.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(update.order_id.as_deref())
                .bind(update.order_id.as_deref())
                .bind(row_id)
                .execute(&self.pool)
                .await?;
            }
            TradeStatus::Sold => {
                sqlx::query(
                    r#"
                    UPDATE signals SET
                        status = ?,
                        action = 'WAIT',
                        tradable = 1,
                        sell_price = COALESCE(?, sell_price),
                        sell_quantity = COALESCE(?, sell_quantity),
                        sold_at = datetime('now'),
                        notes = COALESCE(notes, '') || ' | Position closed: ' || datetime('now'),
                        updated_at = datetime('now')
                    WHERE id = ?
                    "#,
                )
                .bind(status.as_str())
                .bind(update.sell_price.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(update.quantity.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(row_id)
                .execute(&self.pool)
                .await?;
            }
            TradeStatus::UpdateTpSl => {
                sqlx::query(
                    r#"
                    UPDATE signals SET
                        take_profit = COALESCE(?, take_profit),
                        stop_loss = COALESCE(?, stop_loss),
                        updated_at = datetime('now')
                    WHERE id = ?
                    "#,
                )
                .bind(update.take_profit.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(update.stop_loss.map(|v| v.to_f64().unwrap_or(0.0)))
                .bind(row_id)
                .execute(&self.pool)
                .await?;
            }
            TradeStatus::InsufficientBalance | TradeStatus::OrderFailed | TradeStatus::Error => {
                sqlx::query(
                    "UPDATE signals SET status = ?, updated_at = datetime('now') WHERE id = ?",
                )
                .bind(status.as_str())
                .bind(row_id)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    // ==================== Archival ====================

    /// Copy a completed trade to the archive and reset the line so the
    /// instrument can be traded again.
    pub async fn move_to_archive(&self, row_id: i64) -> Result<()> {
        let row: Option<SignalRow> = sqlx::query_as(
            r#"
            SELECT id, symbol, action, tradable, take_profit, stop_loss,
                   resistance_up, resistance_down, status, order_id,
                   purchase_price, quantity, sell_price, sell_quantity,
                   notes, updated_at
            FROM signals WHERE id = ?
            "#,
        )
        .bind(row_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            warn!(row = row_id, "Cannot archive: signal row not found");
            return Ok(());
        };

        let return_pct = match (row.purchase_price, row.sell_price) {
            (Some(buy), Some(sell)) if buy > 0.0 && sell > 0.0 => {
                let pct = (sell - buy) / buy * 100.0;
                Some(format!("{:+.2}%", pct))
            }
            _ => None,
        };

        sqlx::query(
            r#"
            INSERT INTO archive (
                signal_id, symbol, purchase_price, quantity, purchased_at,
                sell_price, sell_quantity, sold_at, take_profit, stop_loss,
                resistance_up, resistance_down, notes, return_pct
            )
            SELECT id, symbol, purchase_price, quantity, purchased_at,
                   sell_price, sell_quantity, sold_at, take_profit, stop_loss,
                   resistance_up, resistance_down, notes, ?
            FROM signals WHERE id = ?
            "#,
        )
        .bind(return_pct)
        .bind(row_id)
        .execute(&self.pool)
        .await?;

        self.clean_coin_line(row_id).await?;

        info!(row = row_id, symbol = %row.symbol, "Trade moved to archive");
        Ok(())
    }

    /// Clear the order-related columns of a line and make it tradable
    /// again. The instrument and its resistance levels stay in place.
    pub async fn clean_coin_line(&self, row_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE signals SET
                action = 'WAIT',
                tradable = 1,
                status = NULL,
                order_id = NULL,
                purchase_price = NULL,
                quantity = NULL,
                ordered_at = NULL,
                purchased_at = NULL,
                sell_price = NULL,
                sell_quantity = NULL,
                sold_at = NULL,
                notes = NULL,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(row_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Inspection ====================

    /// All signal rows, for the status display.
    pub async fn all_rows(&self) -> Result<Vec<SignalRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, symbol, action, tradable, take_profit, stop_loss,
                   resistance_up, resistance_down, status, order_id,
                   purchase_price, quantity, sell_price, sell_quantity,
                   notes, updated_at
            FROM signals ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Number of archived trades.
    pub async fn archived_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM archive")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Treat missing or zero level cells as absent.
fn optional_level(value: Option<f64>) -> Option<Decimal> {
    value
        .filter(|v| *v > 0.0)
        .and_then(|v| Decimal::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn ledger() -> Ledger {
        Ledger::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_signals_normalize_and_filter() {
        let ledger = ledger().await;
        ledger
            .insert_signal("BTC", SignalAction::Buy, None, Some(dec!(47000)), None, None)
            .await
            .unwrap();

        let signals = ledger.trade_signals().await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].symbol, "BTC_USDT");
        assert_eq!(signals[0].base_asset, "BTC");
        assert_eq!(signals[0].stop_loss, Some(dec!(47000)));
        assert_eq!(signals[0].take_profit, None);
    }

    #[tokio::test]
    async fn test_order_placed_flips_tradable_off() {
        let ledger = ledger().await;
        let row = ledger
            .insert_signal("ETH", SignalAction::Buy, None, None, None, None)
            .await
            .unwrap();

        ledger
            .update_trade_status(
                row,
                TradeStatus::OrderPlaced,
                TradeUpdate {
                    order_id: Some("ord-9".to_string()),
                    purchase_price: Some(dec!(2500)),
                    quantity: Some(dec!(0.004)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The row is no longer an actionable signal.
        assert!(ledger.trade_signals().await.unwrap().is_empty());

        let rows = ledger.all_rows().await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("ORDER_PLACED"));
        assert!(!rows[0].tradable);
        assert_eq!(rows[0].order_id.as_deref(), Some("ord-9"));
    }

    #[tokio::test]
    async fn test_archive_computes_return_and_resets_line() {
        let ledger = ledger().await;
        let row = ledger
            .insert_signal("SOL", SignalAction::Buy, None, None, None, None)
            .await
            .unwrap();

        ledger
            .update_trade_status(
                row,
                TradeStatus::OrderPlaced,
                TradeUpdate {
                    purchase_price: Some(dec!(100)),
                    quantity: Some(dec!(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ledger
            .update_trade_status(
                row,
                TradeStatus::Sold,
                TradeUpdate {
                    sell_price: Some(dec!(110)),
                    quantity: Some(dec!(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ledger.move_to_archive(row).await.unwrap();

        assert_eq!(ledger.archived_count().await.unwrap(), 1);

        let rows = ledger.all_rows().await.unwrap();
        assert!(rows[0].tradable);
        assert_eq!(rows[0].action, "WAIT");
        assert!(rows[0].status.is_none());
        assert!(rows[0].purchase_price.is_none());
    }
}
