//! Position lifecycle manager.
//!
//! Drives a signal from order placement through fill, protective orders,
//! trailing-stop maintenance, and exit. Two sweeps share the position
//! store: the foreground price sweep (`check_positions`, called from the
//! trading loop) and the background exchange sweep
//! (`update_position_status`, run on the monitor task started with
//! `start()`). Either sweep may close a position first; both treat a
//! missing position as a no-op.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::api::{ExchangeApi, Notifier, OrderState};
use crate::ledger::{Ledger, TradeStatus, TradeUpdate};
use crate::models::{base_asset, ExitType, Position, TradeSignal};

use super::{
    AtrStrategy, EngineError, OrderGateway, PositionStore, QuoteCache, SellSize, TradingConfig,
};

/// Bound on joining the monitor task during shutdown.
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed background sweep before resuming.
const MONITOR_COOLDOWN: Duration = Duration::from_secs(60);

/// Orchestrates buys, sells, and both monitoring sweeps over the shared
/// position store.
pub struct PositionManager {
    exchange: Arc<dyn ExchangeApi>,
    quotes: Arc<QuoteCache>,
    risk: AtrStrategy,
    gateway: OrderGateway,
    store: Arc<PositionStore>,
    ledger: Arc<Ledger>,
    notifier: Arc<Notifier>,
    config: TradingConfig,

    last_status_check: Mutex<Option<Instant>>,
    shutdown_tx: watch::Sender<bool>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PositionManager {
    /// Construction has no side effects; the monitor task starts only on
    /// an explicit `start()`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        quotes: Arc<QuoteCache>,
        risk: AtrStrategy,
        gateway: OrderGateway,
        store: Arc<PositionStore>,
        ledger: Arc<Ledger>,
        notifier: Arc<Notifier>,
        config: TradingConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            exchange,
            quotes,
            risk,
            gateway,
            store,
            ledger,
            notifier,
            config,
            last_status_check: Mutex::new(None),
            shutdown_tx,
            monitor_handle: Mutex::new(None),
        }
    }

    pub async fn position_count(&self) -> usize {
        self.store.len().await
    }

    pub async fn has_position(&self, symbol: &str) -> bool {
        self.store.contains(symbol).await
    }

    // ==================== Buy ====================

    /// Execute a buy signal. `Ok(false)` means the signal was skipped as
    /// an idempotent no-op (a position already exists). Business-rule and
    /// execution failures are typed errors, already reported to the ledger
    /// by the time they surface.
    pub async fn execute_buy(&self, signal: &TradeSignal) -> Result<bool, EngineError> {
        let symbol = &signal.symbol;

        if self.store.contains(symbol).await {
            info!(symbol = %symbol, "Already have an active position, skipping buy");
            return Ok(false);
        }

        let required = self.config.min_balance_required();
        let available = self.quotes.balance(&self.config.quote_asset).await?;
        if available < required {
            warn!(
                symbol = %symbol,
                available = %available,
                required = %required,
                "Insufficient balance for trade"
            );
            self.report_status(
                signal.row_id,
                TradeStatus::InsufficientBalance,
                TradeUpdate::default(),
            )
            .await;
            return Err(EngineError::InsufficientBalance {
                available,
                required,
            });
        }

        let price = match self.quotes.price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Could not get current price, skipping buy");
                self.report_status(signal.row_id, TradeStatus::Error, TradeUpdate::default())
                    .await;
                return Err(e);
            }
        };

        // Signal-supplied levels win over computed ones.
        let stop_loss = match signal.stop_loss {
            Some(level) => level,
            None => {
                self.risk
                    .stop_loss(symbol, price, signal.resistance_down)
                    .await
            }
        };
        let take_profit = match signal.take_profit {
            Some(level) => level,
            None => {
                self.risk
                    .take_profit(symbol, price, signal.resistance_up)
                    .await
            }
        };

        let order_id = match self.gateway.market_buy(symbol, self.config.trade_amount).await {
            Ok(order_id) => order_id,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Failed to create buy order");
                self.report_status(signal.row_id, TradeStatus::OrderFailed, TradeUpdate::default())
                    .await;
                return Err(e);
            }
        };

        // Provisional entry; quantity and price are reconciled from the
        // fill report once the order executes.
        let estimated_quantity = self.config.trade_amount / price;

        self.report_status(
            signal.row_id,
            TradeStatus::OrderPlaced,
            TradeUpdate {
                order_id: Some(order_id.clone()),
                purchase_price: Some(price),
                quantity: Some(estimated_quantity),
                stop_loss: Some(stop_loss),
                take_profit: Some(take_profit),
                ..Default::default()
            },
        )
        .await;

        let position = Position::new(
            symbol.clone(),
            order_id.clone(),
            signal.row_id,
            estimated_quantity,
            price,
            stop_loss,
            take_profit,
        );
        self.store.add(position).await;

        match self
            .gateway
            .await_fill(
                &order_id,
                self.config.fill_poll_attempts,
                self.config.fill_poll_interval(),
            )
            .await
        {
            Ok(fill) => {
                let position = self
                    .store
                    .update(symbol, |p| p.apply_fill(fill.quantity, fill.avg_price))
                    .await;

                let Some(position) = position else {
                    warn!(symbol = %symbol, "Position vanished during fill monitoring");
                    return Ok(false);
                };

                self.place_protective_orders(&position).await;
                Ok(true)
            }
            Err(e) => {
                warn!(symbol = %symbol, order_id = %order_id, error = %e, "Buy order did not fill");
                self.store.remove(symbol).await;
                self.report_status(signal.row_id, TradeStatus::OrderFailed, TradeUpdate::default())
                    .await;
                Err(e)
            }
        }
    }

    /// Place protective orders for a freshly filled position and record
    /// whichever ids succeeded. Partial success does not roll back the
    /// position.
    async fn place_protective_orders(&self, position: &Position) {
        let (tp_order_id, sl_order_id) = self
            .gateway
            .place_protective_orders(
                &position.symbol,
                position.quantity,
                position.take_profit,
                position.stop_loss,
            )
            .await;

        self.store
            .update(&position.symbol, |p| {
                p.set_protective_orders(tp_order_id.clone(), sl_order_id.clone())
            })
            .await;

        self.report_status(
            position.source_row,
            TradeStatus::UpdateTpSl,
            TradeUpdate {
                take_profit: Some(position.take_profit),
                stop_loss: Some(position.stop_loss),
                ..Default::default()
            },
        )
        .await;

        self.notifier
            .notify(&format!(
                "BUY filled: {} {} @ {} (TP {}, SL {})",
                position.symbol,
                position.quantity,
                position.entry_price,
                position.take_profit,
                position.stop_loss
            ))
            .await;
    }

    // ==================== Sell ====================

    /// Execute a sell for a symbol. When the store has no entry, a
    /// position is reconstructed from live balance (manual or out-of-band
    /// buys). A sell that fails after all retries leaves the position
    /// tracked and returns the error.
    pub async fn execute_sell(
        &self,
        symbol: &str,
        row_id: i64,
        exit_type: ExitType,
    ) -> Result<bool, EngineError> {
        let base = base_asset(symbol).to_string();

        let position = match self.store.get(symbol).await {
            Some(position) => position,
            None => {
                info!(symbol = %symbol, "No tracked position, reconstructing from balance");
                let balance = self.quotes.balance(&base).await?;
                if balance <= Decimal::ZERO {
                    warn!(symbol = %symbol, "No balance found, cannot sell");
                    return Err(EngineError::NoPosition(symbol.to_string()));
                }
                Position::synthetic(symbol.to_string(), row_id, balance)
            }
        };

        // Cancel resting protective orders first; the quantity they
        // encumber is not sellable until the cancellations settle.
        if self.cancel_protective_orders(&position).await {
            sleep(self.config.settle_delay()).await;
        }

        let mut quantity = position.quantity;
        match self.exchange.get_balance(&base).await {
            Ok(balance) if balance > Decimal::ZERO && balance < quantity => {
                warn!(
                    symbol = %symbol,
                    tracked = %quantity,
                    balance = %balance,
                    "Live balance below tracked quantity, selling balance"
                );
                quantity = balance;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Balance re-query failed, using tracked quantity");
            }
        }

        let order_id = self
            .gateway
            .market_sell(symbol, SellSize::Quantity(quantity))
            .await?;

        let fill = self
            .gateway
            .await_fill(
                &order_id,
                self.config.fill_poll_attempts,
                self.config.fill_poll_interval(),
            )
            .await?;

        let sell_price = if fill.avg_price > Decimal::ZERO {
            fill.avg_price
        } else {
            self.quotes.price(symbol).await.unwrap_or(Decimal::ZERO)
        };

        self.report_status(
            row_id,
            TradeStatus::Sold,
            TradeUpdate {
                sell_price: Some(sell_price),
                quantity: Some(fill.quantity),
                ..Default::default()
            },
        )
        .await;

        if let Err(e) = self.ledger.move_to_archive(row_id).await {
            warn!(row = row_id, error = %e, "Failed to archive ledger row");
        }

        let mut closed = self.store.remove(symbol).await.unwrap_or(position);
        let pnl = closed.close(sell_price, exit_type);

        let message = match pnl {
            Some(pnl) => format!(
                "SELL filled: {} {} @ {} ({}, PnL {} {})",
                symbol,
                fill.quantity,
                sell_price,
                exit_type.as_str(),
                pnl.round_dp(2),
                self.config.quote_asset
            ),
            None => format!(
                "SELL filled: {} {} @ {} ({})",
                symbol,
                fill.quantity,
                sell_price,
                exit_type.as_str()
            ),
        };
        self.notifier.notify(&message).await;

        info!(symbol = %symbol, order_id = %order_id, price = %sell_price, "Sell completed");
        Ok(true)
    }

    /// Cancel a position's resting protective orders, best-effort. Returns
    /// whether there was anything to cancel.
    async fn cancel_protective_orders(&self, position: &Position) -> bool {
        let mut had_any = false;

        for (side, order_id) in [
            ("take-profit", &position.tp_order_id),
            ("stop-loss", &position.sl_order_id),
        ] {
            let Some(order_id) = order_id else { continue };
            had_any = true;

            match self.exchange.cancel_order(order_id).await {
                Ok(true) => {
                    info!(symbol = %position.symbol, side, order_id = %order_id, "Cancelled protective order");
                }
                Ok(false) => {
                    warn!(symbol = %position.symbol, side, order_id = %order_id, "Protective order cancel refused");
                }
                Err(e) => {
                    warn!(symbol = %position.symbol, side, error = %e, "Failed to cancel protective order");
                }
            }
        }

        had_any
    }

    // ==================== Foreground sweep ====================

    /// Price sweep over all active positions: update trailing stops and
    /// trigger exits on stop/target hits. Failures are isolated per
    /// symbol. Returns the number of positions checked.
    pub async fn check_positions(&self) -> usize {
        let positions = self.store.snapshot().await;
        let mut checked = 0;

        for position in positions {
            if !position.is_active() {
                continue;
            }

            match self.check_position(&position).await {
                Ok(()) => checked += 1,
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "Error checking position");
                }
            }
        }

        checked
    }

    async fn check_position(&self, position: &Position) -> Result<(), EngineError> {
        let symbol = &position.symbol;
        let price = self.quotes.price(symbol).await?;

        let (new_stop, new_highest) = self
            .risk
            .trailing_stop(symbol, price, position.stop_loss, position.highest_price)
            .await;

        if new_stop != position.stop_loss {
            let updated = self
                .store
                .update(symbol, |p| {
                    p.update_trailing_stop(new_stop, new_highest);
                })
                .await;

            if updated.is_some() {
                info!(symbol = %symbol, stop_loss = %new_stop, "Trailing stop raised");
                self.report_status(
                    position.source_row,
                    TradeStatus::UpdateTpSl,
                    TradeUpdate {
                        stop_loss: Some(new_stop),
                        take_profit: Some(position.take_profit),
                        ..Default::default()
                    },
                )
                .await;
            }
        }

        let stop = new_stop.max(position.stop_loss);
        if stop > Decimal::ZERO && price <= stop {
            info!(symbol = %symbol, price = %price, stop = %stop, "Stop loss triggered");
            self.execute_sell(symbol, position.source_row, ExitType::StopLoss)
                .await?;
        } else if position.take_profit > Decimal::ZERO && price >= position.take_profit {
            info!(symbol = %symbol, price = %price, target = %position.take_profit, "Take profit triggered");
            self.execute_sell(symbol, position.source_row, ExitType::TakeProfit)
                .await?;
        }

        Ok(())
    }

    // ==================== Background sweep ====================

    /// Exchange-status sweep: detect filled protective orders and close
    /// their positions. Coalesced so it runs at most once per configured
    /// interval no matter how often it is invoked. Returns the number of
    /// positions closed; an error means every polled position failed,
    /// which the monitor loop answers with a cooldown.
    pub async fn update_position_status(&self) -> Result<usize, EngineError> {
        {
            let mut last = self.last_status_check.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_secs(self.config.status_check_interval_secs) {
                    return Ok(0);
                }
            }
            *last = Some(Instant::now());
        }

        debug!("Checking open position statuses");

        let positions = self.store.snapshot().await;
        let mut closed = 0usize;
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut last_error = None;

        for position in positions {
            if !position.is_open || !position.has_protective_orders() {
                continue;
            }
            attempted += 1;

            match self.sweep_position(&position).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "Error updating position status");
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if attempted > 0 && failed == attempted {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        if closed > 0 {
            info!(closed, "Closed positions during status sweep");
        }
        Ok(closed)
    }

    /// Check one position's protective orders; close the position when one
    /// of them filled.
    async fn sweep_position(&self, position: &Position) -> Result<bool, EngineError> {
        let symbol = &position.symbol;

        let tp_filled = match &position.tp_order_id {
            Some(order_id) => {
                self.exchange.get_order_detail(order_id).await?.state == OrderState::Filled
            }
            None => false,
        };

        // At most one side can fill before the position is closed; the
        // other is cancelled below.
        let sl_filled = if tp_filled {
            false
        } else {
            match &position.sl_order_id {
                Some(order_id) => {
                    self.exchange.get_order_detail(order_id).await?.state == OrderState::Filled
                }
                None => false,
            }
        };

        if !tp_filled && !sl_filled {
            return Ok(false);
        }

        let (exit_type, opposite) = if tp_filled {
            (ExitType::TakeProfit, position.sl_order_id.as_ref())
        } else {
            (ExitType::StopLoss, position.tp_order_id.as_ref())
        };

        info!(symbol = %symbol, exit = exit_type.as_str(), "Protective order filled");

        if let Some(opposite_id) = opposite {
            match self.exchange.cancel_order(opposite_id).await {
                Ok(true) => {
                    info!(symbol = %symbol, order_id = %opposite_id, "Cancelled opposite protective order");
                }
                Ok(false) => {
                    warn!(symbol = %symbol, order_id = %opposite_id, "Opposite protective order cancel refused");
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Failed to cancel opposite protective order");
                }
            }
        }

        let exit_price = match self.quotes.price(symbol).await {
            Ok(price) => price,
            // No live price: fall back to the trigger level that filled.
            Err(_) => {
                if tp_filled {
                    position.take_profit
                } else {
                    position.stop_loss
                }
            }
        };

        let closed = self
            .store
            .update(symbol, |p| {
                p.close(exit_price, exit_type);
            })
            .await;

        // The foreground sweep may have closed and removed it already.
        let Some(closed) = closed else {
            return Ok(false);
        };

        self.report_status(
            position.source_row,
            TradeStatus::Sold,
            TradeUpdate {
                sell_price: Some(exit_price),
                quantity: Some(closed.quantity),
                ..Default::default()
            },
        )
        .await;

        if let Err(e) = self.ledger.move_to_archive(position.source_row).await {
            warn!(row = position.source_row, error = %e, "Failed to archive ledger row");
        }

        self.store.remove(symbol).await;

        let message = match closed.realized_pnl {
            Some(pnl) => format!(
                "{} hit for {}: exit {} (PnL {} {})",
                exit_label(exit_type),
                symbol,
                exit_price,
                pnl.round_dp(2),
                self.config.quote_asset
            ),
            None => format!(
                "{} hit for {}: exit {}",
                exit_label(exit_type),
                symbol,
                exit_price
            ),
        };
        self.notifier.notify(&message).await;

        Ok(true)
    }

    // ==================== Monitor lifecycle ====================

    /// Start the background monitor task. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.monitor_handle.lock().await;
        if slot.is_some() {
            warn!("Position monitor already running");
            return;
        }

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.config.status_check_interval_secs);

        *slot = Some(tokio::spawn(async move {
            info!("Position monitor started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(interval) => {}
                }

                match manager.update_position_status().await {
                    Ok(closed) if closed > 0 => {
                        // Re-evaluate remaining positions right away.
                        manager.check_positions().await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Status sweep failed, cooling down");
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = sleep(MONITOR_COOLDOWN) => {}
                        }
                    }
                }
            }

            info!("Position monitor stopped");
        }));
    }

    /// Signal the monitor to stop and join it with a bounded timeout. An
    /// in-flight poll is left to run to its own timeout.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let handle = self.monitor_handle.lock().await.take();
        if let Some(handle) = handle {
            match timeout(MONITOR_JOIN_TIMEOUT, handle).await {
                Ok(_) => info!("Position monitor joined"),
                Err(_) => warn!("Position monitor did not stop within timeout"),
            }
        }
    }

    async fn report_status(&self, row_id: i64, status: TradeStatus, update: TradeUpdate) {
        if let Err(e) = self.ledger.update_trade_status(row_id, status, update).await {
            warn!(row = row_id, status = status.as_str(), error = %e, "Failed to update ledger");
        }
    }
}

fn exit_label(exit_type: ExitType) -> &'static str {
    match exit_type {
        ExitType::TakeProfit => "Take profit",
        ExitType::StopLoss => "Stop loss",
        ExitType::Manual => "Manual exit",
        ExitType::None => "Exit",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockExchange;
    use crate::api::OrderSide;
    use crate::models::SignalAction;
    use rust_decimal_macros::dec;

    struct Harness {
        exchange: Arc<MockExchange>,
        manager: Arc<PositionManager>,
        ledger: Arc<Ledger>,
        store: Arc<PositionStore>,
    }

    async fn harness() -> Harness {
        let exchange = Arc::new(MockExchange::new());
        let config = TradingConfig::default();
        let quotes = Arc::new(QuoteCache::new(exchange.clone(), &config));
        let risk = AtrStrategy::new(quotes.clone(), &config);
        let gateway = OrderGateway::new(exchange.clone(), quotes.clone(), config.clone());
        let store = Arc::new(PositionStore::new());
        let ledger = Arc::new(Ledger::new("sqlite::memory:").await.unwrap());
        let notifier = Arc::new(Notifier::disabled());

        let manager = Arc::new(PositionManager::new(
            exchange.clone(),
            quotes,
            risk,
            gateway,
            store.clone(),
            ledger.clone(),
            notifier,
            config,
        ));

        Harness {
            exchange,
            manager,
            ledger,
            store,
        }
    }

    async fn buy_signal(h: &Harness, symbol: &str) -> TradeSignal {
        let bare = base_asset(symbol).to_string();
        let row_id = h
            .ledger
            .insert_signal(&bare, SignalAction::Buy, None, None, None, None)
            .await
            .unwrap();
        TradeSignal {
            row_id,
            symbol: symbol.to_string(),
            base_asset: bare,
            action: SignalAction::Buy,
            take_profit: None,
            stop_loss: None,
            resistance_up: None,
            resistance_down: None,
            order_id: None,
        }
    }

    fn active_position(symbol: &str, row_id: i64) -> Position {
        let mut position = Position::new(
            symbol.to_string(),
            "ord-entry".to_string(),
            row_id,
            dec!(2),
            dec!(100),
            dec!(94),
            dec!(120),
        );
        position.apply_fill(dec!(2), dec!(100));
        position
    }

    #[tokio::test]
    async fn test_execute_buy_fills_and_places_protective_orders() {
        let h = harness().await;
        tokio::time::pause();
        h.exchange.set_balance("USDT", dec!(100));
        h.exchange.set_price("ETH_USDT", dec!(2500));
        h.exchange
            .set_default_detail(MockExchange::filled(dec!(0.004), dec!(2500)));

        let signal = buy_signal(&h, "ETH_USDT").await;
        let executed = h.manager.execute_buy(&signal).await.unwrap();
        assert!(executed);

        let position = h.store.get("ETH_USDT").await.unwrap();
        assert!(position.is_active());
        assert_eq!(position.quantity, dec!(0.004));
        assert!(position.tp_order_id.is_some());
        assert!(position.sl_order_id.is_some());
        // v = 2500 * 0.03 = 75; stop = 2500 - 150; target = 2500 + 150
        assert_eq!(position.stop_loss, dec!(2350));
        assert_eq!(position.take_profit, dec!(2650));

        // Buy + two protective orders on the wire.
        let submissions = h.exchange.submissions();
        assert_eq!(submissions.len(), 3);
        assert_eq!(submissions[0].request.side, OrderSide::Buy);

        let rows = h.ledger.all_rows().await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("ORDER_PLACED"));
        assert!(!rows[0].tradable);
    }

    #[tokio::test]
    async fn test_execute_buy_rejects_on_insufficient_balance() {
        let h = harness().await;
        h.exchange.set_balance("USDT", dec!(5));
        h.exchange.set_price("ETH_USDT", dec!(2500));

        let signal = buy_signal(&h, "ETH_USDT").await;
        let result = h.manager.execute_buy(&signal).await;

        assert!(matches!(
            result,
            Err(EngineError::InsufficientBalance { .. })
        ));
        assert!(h.exchange.submissions().is_empty());
        let rows = h.ledger.all_rows().await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("INSUFFICIENT_BALANCE"));
    }

    #[tokio::test]
    async fn test_execute_buy_is_idempotent_per_symbol() {
        let h = harness().await;
        h.store.add(active_position("ETH_USDT", 1)).await;

        let signal = buy_signal(&h, "ETH_USDT").await;
        let executed = h.manager.execute_buy(&signal).await.unwrap();

        assert!(!executed);
        assert!(h.exchange.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_execute_buy_removes_position_when_unfilled() {
        let h = harness().await;
        tokio::time::pause();
        h.exchange.set_balance("USDT", dec!(100));
        h.exchange.set_price("ETH_USDT", dec!(2500));
        // The entry order reports CANCELED with nothing executed.
        h.exchange
            .push_detail("ord-1", Ok(MockExchange::canceled(dec!(0), dec!(0))));

        let signal = buy_signal(&h, "ETH_USDT").await;
        let result = h.manager.execute_buy(&signal).await;

        assert!(matches!(result, Err(EngineError::Unfilled { .. })));
        assert!(h.store.is_empty().await);
        let rows = h.ledger.all_rows().await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("ORDER_FAILED"));
    }

    #[tokio::test]
    async fn test_execute_sell_synthesizes_position_from_balance() {
        let h = harness().await;
        tokio::time::pause();
        h.exchange.set_balance("DOGE", dec!(1500));
        h.exchange.set_price("DOGE_USDT", dec!(0.2));
        h.exchange
            .set_default_detail(MockExchange::filled(dec!(1500), dec!(0.2)));

        let row_id = h
            .ledger
            .insert_signal("DOGE", SignalAction::Sell, None, None, None, None)
            .await
            .unwrap();

        let sold = h
            .manager
            .execute_sell("DOGE_USDT", row_id, ExitType::Manual)
            .await
            .unwrap();
        assert!(sold);

        let submissions = h.exchange.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].request.side, OrderSide::Sell);
        assert_eq!(submissions[0].request.quantity.as_deref(), Some("1500"));

        assert_eq!(h.ledger.archived_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_execute_sell_without_position_or_balance_fails() {
        let h = harness().await;

        let result = h
            .manager
            .execute_sell("DOGE_USDT", 1, ExitType::Manual)
            .await;

        assert!(matches!(result, Err(EngineError::NoPosition(_))));
        assert!(h.exchange.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sell_leaves_position_tracked() {
        let h = harness().await;
        tokio::time::pause();
        h.exchange.set_price("ETH_USDT", dec!(90));
        h.exchange.set_balance("ETH", dec!(2));
        // Every submission attempt is rejected on format.
        for _ in 0..5 {
            h.exchange
                .push_submit_result(Err(MockExchange::invalid_quantity()));
        }
        h.store.add(active_position("ETH_USDT", 1)).await;

        let result = h
            .manager
            .execute_sell("ETH_USDT", 1, ExitType::Manual)
            .await;

        assert!(matches!(result, Err(EngineError::SellExhausted { .. })));
        assert!(h.store.contains("ETH_USDT").await);
    }

    #[tokio::test]
    async fn test_check_positions_raises_trailing_stop() {
        let h = harness().await;
        tokio::time::pause();
        h.exchange.set_price("ETH_USDT", dec!(108));
        h.store.add(active_position("ETH_USDT", 1)).await;

        h.manager.check_positions().await;

        // v = 108 * 0.03 = 3.24; candidate = 108 - 6.48 = 101.52 > 94.
        let position = h.store.get("ETH_USDT").await.unwrap();
        assert_eq!(position.stop_loss, dec!(101.52));
        assert_eq!(position.highest_price, dec!(108));
    }

    #[tokio::test]
    async fn test_check_positions_sells_on_stop_hit() {
        let h = harness().await;
        tokio::time::pause();
        h.exchange.set_price("ETH_USDT", dec!(90));
        h.exchange.set_balance("ETH", dec!(2));
        h.exchange
            .set_default_detail(MockExchange::filled(dec!(2), dec!(90)));
        h.store.add(active_position("ETH_USDT", 7)).await;

        h.manager.check_positions().await;

        assert!(h.store.is_empty().await);
        let sells: Vec<_> = h
            .exchange
            .submissions()
            .into_iter()
            .filter(|s| s.request.side == OrderSide::Sell)
            .collect();
        assert_eq!(sells.len(), 1);
    }

    #[tokio::test]
    async fn test_background_sweep_closes_on_tp_fill_and_cancels_sl() {
        let h = harness().await;
        tokio::time::pause();
        h.exchange.set_price("ETH_USDT", dec!(121));

        let row_id = h
            .ledger
            .insert_signal("ETH", SignalAction::Buy, None, None, None, None)
            .await
            .unwrap();
        let mut position = active_position("ETH_USDT", row_id);
        position.set_protective_orders(Some("tp-1".to_string()), Some("sl-1".to_string()));
        h.store.add(position).await;

        h.exchange
            .push_detail("tp-1", Ok(MockExchange::filled(dec!(2), dec!(120))));

        let closed = h.manager.update_position_status().await.unwrap();
        assert_eq!(closed, 1);

        assert!(h.store.is_empty().await);
        assert_eq!(h.exchange.cancelled(), vec!["sl-1".to_string()]);
        assert_eq!(h.ledger.archived_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_background_sweep_is_coalesced() {
        let h = harness().await;
        h.exchange.set_price("ETH_USDT", dec!(121));

        let mut position = active_position("ETH_USDT", 3);
        position.set_protective_orders(Some("tp-1".to_string()), None);
        h.store.add(position).await;
        h.exchange
            .push_detail("tp-1", Ok(MockExchange::filled(dec!(2), dec!(120))));

        // First sweep runs and closes the position.
        assert_eq!(h.manager.update_position_status().await.unwrap(), 1);

        // A new position appears immediately; the sweep is coalesced and
        // does not touch it.
        let mut second = active_position("SOL_USDT", 4);
        second.set_protective_orders(Some("tp-2".to_string()), None);
        h.store.add(second).await;
        h.exchange
            .push_detail("tp-2", Ok(MockExchange::filled(dec!(2), dec!(120))));

        assert_eq!(h.manager.update_position_status().await.unwrap(), 0);
        assert!(h.store.contains("SOL_USDT").await);

        // After the interval elapses the sweep runs again.
        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(61)).await;
        h.exchange.set_price("SOL_USDT", dec!(121));
        assert_eq!(h.manager.update_position_status().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stop_joins_monitor() {
        let h = harness().await;
        tokio::time::pause();
        h.manager.start().await;
        h.manager.stop().await;
        assert!(h.manager.monitor_handle.lock().await.is_none());
    }
}
