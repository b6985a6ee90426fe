//! Exchange wire types: order parameters, terminal states, and the
//! JSON-RPC envelope used by the signed transport.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order type as accepted by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    /// Venue-native take-profit trigger order.
    TakeProfitLimit,
    /// Venue-native stop-loss trigger order.
    StopLossLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::TakeProfitLimit => "TAKE_PROFIT_LIMIT",
            OrderType::StopLossLimit => "STOP_LOSS_LIMIT",
        }
    }
}

/// Order state as reported by the venue. Anything unrecognized is kept
/// verbatim so pollers can keep waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderState {
    Active,
    Pending,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Other(String),
}

impl OrderState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "ACTIVE" => OrderState::Active,
            "PENDING" | "NEW" => OrderState::Pending,
            "FILLED" => OrderState::Filled,
            "CANCELED" => OrderState::Canceled,
            "REJECTED" => OrderState::Rejected,
            "EXPIRED" => OrderState::Expired,
            other => OrderState::Other(other.to_string()),
        }
    }
}

/// Snapshot of an order from the order-detail endpoint.
#[derive(Debug, Clone)]
pub struct OrderDetail {
    pub state: OrderState,
    /// Base-asset quantity executed so far.
    pub cumulative_quantity: Decimal,
    /// Average execution price over the filled quantity.
    pub avg_price: Decimal,
}

/// Parameters for a single order submission.
///
/// Exactly one of `quantity` / `notional` is set. Quantities are carried as
/// pre-formatted strings because the venue is picky about numeric encodings
/// and the retry ladder needs full control over the rendering.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Option<String>,
    pub notional: Option<Decimal>,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub client_oid: Option<String>,
}

impl OrderRequest {
    /// Market buy sized by quote-currency notional.
    pub fn market_buy(symbol: &str, notional: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: None,
            notional: Some(notional),
            price: None,
            trigger_price: None,
            client_oid: None,
        }
    }

    /// Market sell sized by base-asset quantity. There is deliberately no
    /// notional-sell constructor: market sells by notional are unsupported
    /// on this venue.
    pub fn market_sell(symbol: &str, quantity: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            quantity: Some(quantity),
            notional: None,
            price: None,
            trigger_price: None,
            client_oid: None,
        }
    }

    /// Resting limit order.
    pub fn limit(symbol: &str, side: OrderSide, quantity: String, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity: Some(quantity),
            notional: None,
            price: Some(price),
            trigger_price: None,
            client_oid: None,
        }
    }

    /// Venue-native protective order (take-profit or stop-loss trigger)
    /// selling `quantity` when `trigger` is crossed.
    pub fn protective(
        symbol: &str,
        order_type: OrderType,
        quantity: String,
        trigger: Decimal,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type,
            quantity: Some(quantity),
            notional: None,
            price: Some(trigger),
            trigger_price: Some(trigger),
            client_oid: None,
        }
    }

    pub fn with_client_oid(mut self, client_oid: String) -> Self {
        self.client_oid = Some(client_oid);
        self
    }

    /// Render as create-order parameters. Numerics are stringified as the
    /// venue requires.
    pub fn params(&self) -> Value {
        let mut params = json!({
            "instrument_name": self.symbol,
            "side": self.side.as_str(),
            "type": self.order_type.as_str(),
        });
        let map = params.as_object_mut().expect("object literal");
        if let Some(ref quantity) = self.quantity {
            map.insert("quantity".into(), json!(quantity));
        }
        if let Some(notional) = self.notional {
            map.insert("notional".into(), json!(notional.to_string()));
        }
        if let Some(price) = self.price {
            map.insert("price".into(), json!(price.to_string()));
        }
        if let Some(trigger) = self.trigger_price {
            map.insert("ref_price".into(), json!(trigger.to_string()));
        }
        if let Some(ref client_oid) = self.client_oid {
            map.insert("client_oid".into(), json!(client_oid));
        }
        params
    }
}

/// Signed request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub id: i64,
    pub method: String,
    pub api_key: String,
    pub params: Value,
    pub nonce: i64,
    pub sig: String,
}

/// Response envelope. The venue reports errors through `code`, with the
/// text in either `message` or `msg` depending on the endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    pub code: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub result: Value,
}

impl RpcResponse {
    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.msg.clone())
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_sell_params_carry_quantity_only() {
        let req = OrderRequest::market_sell("BTC_USDT", "0.5".to_string());
        let params = req.params();
        assert_eq!(params["side"], "SELL");
        assert_eq!(params["type"], "MARKET");
        assert_eq!(params["quantity"], "0.5");
        assert!(params.get("notional").is_none());
    }

    #[test]
    fn test_protective_order_params() {
        let req = OrderRequest::protective(
            "ETH_USDT",
            OrderType::TakeProfitLimit,
            "1.2".to_string(),
            dec!(2500.5),
        );
        let params = req.params();
        assert_eq!(params["type"], "TAKE_PROFIT_LIMIT");
        assert_eq!(params["price"], "2500.5");
        assert_eq!(params["ref_price"], "2500.5");
    }

    #[test]
    fn test_order_state_parse() {
        assert_eq!(OrderState::parse("FILLED"), OrderState::Filled);
        assert_eq!(OrderState::parse("CANCELED"), OrderState::Canceled);
        assert_eq!(
            OrderState::parse("PARTIALLY_FILLED"),
            OrderState::Other("PARTIALLY_FILLED".to_string())
        );
    }
}
