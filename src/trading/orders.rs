//! Order submission, fill monitoring, and the sell-quantity fallback
//! ladder.
//!
//! Sells are always submitted by base-asset quantity: market sells by
//! notional are unsupported on this venue, so a notional input is converted
//! at the live price before anything reaches the wire. When the venue
//! rejects a quantity encoding, alternate formats are tried in order, then
//! large sells are decomposed into sequential batches, then a final 50 %
//! attempt is made before the failure is surfaced.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{ExchangeApi, OrderRequest, OrderSide, OrderState, OrderType};
use crate::models::base_asset;

use super::{EngineError, QuoteCache, TradingConfig};

/// Requested sell size. `Notional` is the exceptional path: it is converted
/// to quantity before submission and fails when no price is obtainable.
#[derive(Debug, Clone, Copy)]
pub enum SellSize {
    Quantity(Decimal),
    Notional(Decimal),
}

/// Outcome of a successfully monitored order.
#[derive(Debug, Clone)]
pub struct FillResult {
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

/// Market-order submission and monitoring against the exchange.
pub struct OrderGateway {
    exchange: Arc<dyn ExchangeApi>,
    quotes: Arc<QuoteCache>,
    config: TradingConfig,
}

impl OrderGateway {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        quotes: Arc<QuoteCache>,
        config: TradingConfig,
    ) -> Self {
        Self {
            exchange,
            quotes,
            config,
        }
    }

    /// Place a market buy sized by quote-currency notional.
    pub async fn market_buy(&self, symbol: &str, notional: Decimal) -> Result<String, EngineError> {
        info!(symbol = %symbol, notional = %notional, "Creating market buy order");

        let request = OrderRequest::market_buy(symbol, notional);
        let order_id = self.exchange.submit_order(&request).await?;

        info!(symbol = %symbol, order_id = %order_id, "Buy order created");
        Ok(order_id)
    }

    /// Place a market sell. Quantity is mandatory on the wire; a notional
    /// input is converted here and the whole operation fails when no price
    /// is obtainable.
    pub async fn market_sell(&self, symbol: &str, size: SellSize) -> Result<String, EngineError> {
        let quantity = match size {
            SellSize::Quantity(quantity) => quantity,
            SellSize::Notional(notional) => {
                warn!(
                    symbol = %symbol,
                    notional = %notional,
                    "Sell requested by notional; converting to quantity at live price"
                );
                let price = self.quotes.price(symbol).await?;
                notional / price
            }
        };

        let formatted = format_quantity(quantity, symbol, &self.config);
        info!(symbol = %symbol, quantity = %formatted, "Creating market sell order");

        let request = OrderRequest::market_sell(symbol, formatted)
            .with_client_oid(sell_client_oid(symbol, None));

        match self.exchange.submit_order(&request).await {
            Ok(order_id) => {
                info!(symbol = %symbol, order_id = %order_id, "Sell order created");
                Ok(order_id)
            }
            Err(e) if e.is_invalid_quantity() => {
                warn!(symbol = %symbol, error = %e, "Quantity format rejected, trying alternatives");
                self.resolve_quantity_format(symbol, quantity).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Retry a rejected sell with alternate quantity encodings, then batch
    /// decomposition, then a 50 % last resort. First success wins.
    async fn resolve_quantity_format(
        &self,
        symbol: &str,
        quantity: Decimal,
    ) -> Result<String, EngineError> {
        let base = base_asset(symbol);

        let retry_formats: Vec<String> = if self.config.is_integer_asset(base) {
            vec![
                quantity.trunc().to_string(),
                (quantity * dec!(0.99)).trunc().to_string(),
                (quantity * dec!(0.95)).trunc().to_string(),
            ]
        } else {
            vec![
                render_dp(quantity, 1),
                render_dp(quantity, 0),
                render_dp(quantity * dec!(0.99), 8),
            ]
        };

        for format in retry_formats {
            info!(symbol = %symbol, quantity = %format, "Retrying sell with alternate format");

            let request = OrderRequest::market_sell(symbol, format.clone());
            match self.exchange.submit_order(&request).await {
                Ok(order_id) => {
                    info!(symbol = %symbol, order_id = %order_id, quantity = %format, "Retry succeeded");
                    return Ok(order_id);
                }
                Err(e) => {
                    warn!(symbol = %symbol, quantity = %format, error = %e, "Retry format rejected");
                }
            }
        }

        let ceiling = self.config.batch_ceiling_for(base);
        if quantity > ceiling {
            if let Some(order_id) = self.batch_sell(symbol, quantity, ceiling).await {
                return Ok(order_id);
            }
        }

        // Last resort: sell half of the requested quantity.
        let half = quantity * dec!(0.5);
        let formatted = format_quantity(half, symbol, &self.config);
        info!(symbol = %symbol, quantity = %formatted, "Trying to sell 50% of quantity as last resort");

        let request = OrderRequest::market_sell(symbol, formatted);
        match self.exchange.submit_order(&request).await {
            Ok(order_id) => {
                info!(symbol = %symbol, order_id = %order_id, "Sold 50% of requested quantity");
                Ok(order_id)
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "All sell attempts exhausted");
                Err(EngineError::SellExhausted {
                    symbol: symbol.to_string(),
                })
            }
        }
    }

    /// Sell in sequential batches of at most `ceiling`. The last batch
    /// re-queries the live balance to absorb drift from prior fills and
    /// fees. Returns the first successful order id.
    async fn batch_sell(
        &self,
        symbol: &str,
        total_quantity: Decimal,
        ceiling: Decimal,
    ) -> Option<String> {
        let base = base_asset(symbol);
        let num_batches = (total_quantity / ceiling).ceil().to_u64().unwrap_or(0);

        info!(
            symbol = %symbol,
            total = %total_quantity,
            batches = num_batches,
            "Selling in batches"
        );

        let mut successful: Vec<String> = Vec::new();
        let mut remaining = total_quantity;

        for batch in 1..=num_batches {
            let is_last = batch == num_batches;

            let batch_quantity = if is_last {
                // Queried directly, not through the cache: the quantity must
                // reflect fills from the immediately preceding batches.
                match self.exchange.get_balance(base).await {
                    Ok(balance) if balance > Decimal::ZERO => balance * dec!(0.98),
                    Ok(_) => {
                        info!(symbol = %symbol, "No balance left, batch selling complete");
                        break;
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Balance re-query failed, using remainder");
                        ceiling.min(remaining)
                    }
                }
            } else {
                ceiling.min(remaining)
            };

            let formatted = format_quantity(batch_quantity, symbol, &self.config);
            if batch_quantity <= Decimal::ZERO || formatted == "0" {
                warn!(symbol = %symbol, batch, "Batch quantity is zero, skipping");
                continue;
            }

            info!(symbol = %symbol, batch, total = num_batches, quantity = %formatted, "Selling batch");

            let request = OrderRequest::market_sell(symbol, formatted)
                .with_client_oid(sell_client_oid(symbol, Some(batch)));

            match self.exchange.submit_order(&request).await {
                Ok(order_id) => {
                    info!(symbol = %symbol, batch, order_id = %order_id, "Batch sold");
                    successful.push(order_id);
                    remaining -= batch_quantity;
                    // Let balances settle before the next batch.
                    sleep(self.config.batch_delay()).await;
                }
                Err(e) if e.is_invalid_quantity() => {
                    // One retry at 99 % of the batch before skipping it.
                    let reduced = format_quantity(batch_quantity * dec!(0.99), symbol, &self.config);
                    info!(symbol = %symbol, batch, quantity = %reduced, "Retrying batch at 99%");

                    let retry = OrderRequest::market_sell(symbol, reduced);
                    match self.exchange.submit_order(&retry).await {
                        Ok(order_id) => {
                            info!(symbol = %symbol, batch, order_id = %order_id, "Batch retry succeeded");
                            successful.push(order_id);
                            remaining -= batch_quantity;
                            sleep(self.config.batch_delay()).await;
                        }
                        Err(e) => {
                            warn!(symbol = %symbol, batch, error = %e, "Batch retry failed, skipping");
                        }
                    }
                }
                Err(e) => {
                    warn!(symbol = %symbol, batch, error = %e, "Batch failed, skipping");
                }
            }
        }

        if !successful.is_empty() {
            info!(
                symbol = %symbol,
                sold = successful.len(),
                total = num_batches,
                "Batch selling finished"
            );
        }

        successful.into_iter().next()
    }

    /// Poll an order until it reaches a terminal state.
    ///
    /// A cancellation with a nonzero executed quantity counts as a fill:
    /// partial market execution before cancellation is common on this
    /// venue. A cancellation with nothing executed must be observed on at
    /// least two consecutive polls before it counts as a failure, which
    /// debounces a single stale read. On timeout the order is left resting.
    pub async fn await_fill(
        &self,
        order_id: &str,
        max_attempts: u32,
        poll_interval: Duration,
    ) -> Result<FillResult, EngineError> {
        info!(order_id = %order_id, "Monitoring order");

        let mut empty_cancel_polls = 0u32;

        for attempt in 1..=max_attempts {
            match self.exchange.get_order_detail(order_id).await {
                Ok(detail) => match detail.state {
                    OrderState::Filled => {
                        info!(
                            order_id = %order_id,
                            quantity = %detail.cumulative_quantity,
                            avg_price = %detail.avg_price,
                            "Order filled"
                        );
                        return Ok(FillResult {
                            quantity: detail.cumulative_quantity,
                            avg_price: detail.avg_price,
                        });
                    }
                    OrderState::Canceled if detail.cumulative_quantity > Decimal::ZERO => {
                        info!(
                            order_id = %order_id,
                            quantity = %detail.cumulative_quantity,
                            "Order executed partially before cancellation, treating as fill"
                        );
                        return Ok(FillResult {
                            quantity: detail.cumulative_quantity,
                            avg_price: detail.avg_price,
                        });
                    }
                    OrderState::Canceled => {
                        empty_cancel_polls += 1;
                        if empty_cancel_polls >= 2 {
                            warn!(order_id = %order_id, "Order cancelled with no execution");
                            return Err(EngineError::Unfilled {
                                order_id: order_id.to_string(),
                            });
                        }
                    }
                    other => {
                        empty_cancel_polls = 0;
                        debug!(order_id = %order_id, state = ?other, attempt, "Order not terminal yet");
                    }
                },
                Err(e) => {
                    warn!(order_id = %order_id, attempt, error = %e, "Error polling order status");
                }
            }

            if attempt < max_attempts {
                sleep(poll_interval).await;
            }
        }

        warn!(order_id = %order_id, "Fill monitoring timed out, order left resting");
        Err(EngineError::FillTimeout {
            order_id: order_id.to_string(),
        })
    }

    /// Place protective orders for an active position: venue-native trigger
    /// types first, plain limit orders on rejection. Partial success (one
    /// side placed) is allowed.
    pub async fn place_protective_orders(
        &self,
        symbol: &str,
        quantity: Decimal,
        take_profit: Decimal,
        stop_loss: Decimal,
    ) -> (Option<String>, Option<String>) {
        let base = base_asset(symbol);

        // Fees may have shaved the actual holdings below the fill quantity.
        let mut sell_quantity = quantity;
        if let Ok(balance) = self.exchange.get_balance(base).await {
            if balance > Decimal::ZERO && balance < quantity {
                warn!(
                    symbol = %symbol,
                    balance = %balance,
                    quantity = %quantity,
                    "Balance below fill quantity, protecting 99% of balance"
                );
                sell_quantity = balance * dec!(0.99);
            }
        }

        let formatted = format_quantity(sell_quantity, symbol, &self.config);

        let tp_order_id = self
            .place_protective(symbol, OrderType::TakeProfitLimit, &formatted, take_profit)
            .await;
        let sl_order_id = self
            .place_protective(symbol, OrderType::StopLossLimit, &formatted, stop_loss)
            .await;

        (tp_order_id, sl_order_id)
    }

    async fn place_protective(
        &self,
        symbol: &str,
        order_type: OrderType,
        quantity: &str,
        trigger: Decimal,
    ) -> Option<String> {
        let request = OrderRequest::protective(symbol, order_type, quantity.to_string(), trigger);

        match self.exchange.submit_order(&request).await {
            Ok(order_id) => {
                info!(symbol = %symbol, order_type = ?order_type, order_id = %order_id, trigger = %trigger, "Protective order placed");
                Some(order_id)
            }
            Err(e) if !e.is_transient() => {
                warn!(symbol = %symbol, order_type = ?order_type, error = %e, "Native protective order rejected, falling back to limit");

                let fallback =
                    OrderRequest::limit(symbol, OrderSide::Sell, quantity.to_string(), trigger);
                match self.exchange.submit_order(&fallback).await {
                    Ok(order_id) => {
                        info!(symbol = %symbol, order_id = %order_id, "Limit fallback placed");
                        Some(order_id)
                    }
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "Limit fallback failed");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(symbol = %symbol, order_type = ?order_type, error = %e, "Failed to place protective order");
                None
            }
        }
    }
}

/// Render a quantity the way the venue expects for the asset: integers for
/// whole-unit assets above 1, otherwise the asset's precision with trailing
/// zeros trimmed. Truncation, never rounding up: over-selling a balance is
/// a rejection.
pub fn format_quantity(quantity: Decimal, symbol: &str, config: &TradingConfig) -> String {
    let base = base_asset(symbol);

    let rendered = if config.is_integer_asset(base) {
        if quantity > Decimal::ONE {
            quantity.trunc().to_string()
        } else {
            quantity
                .round_dp_with_strategy(8, RoundingStrategy::ToZero)
                .normalize()
                .to_string()
        }
    } else {
        let precision = config.precision_for(base);
        quantity
            .round_dp_with_strategy(precision, RoundingStrategy::ToZero)
            .normalize()
            .to_string()
    };

    if rendered.is_empty() {
        "0".to_string()
    } else {
        rendered
    }
}

/// Fixed-precision rendering for the retry ladder (no zero-trimming: the
/// encoding itself is what is being varied).
fn render_dp(quantity: Decimal, dp: u32) -> String {
    format!(
        "{:.*}",
        dp as usize,
        quantity.round_dp_with_strategy(dp, RoundingStrategy::ToZero)
    )
}

fn sell_client_oid(symbol: &str, batch: Option<u64>) -> String {
    match batch {
        Some(n) => format!("SELL-{}-B{}-{}", symbol, n, Uuid::new_v4().simple()),
        None => format!("SELL-{}-{}", symbol, Uuid::new_v4().simple()),
    }
}
