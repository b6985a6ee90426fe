//! Signed JSON-RPC exchange client.
//!
//! Every private call is authenticated with an HMAC-SHA256 digest over a
//! canonicalized parameter string. The canonicalization (sorted keys,
//! nested flattening to a bounded depth, lowercase booleans, stringified
//! numerics) must stay bit-exact with the venue's documented algorithm.
//! Transport failures are retried with bounded exponential backoff, except
//! for order submission which is never blindly resubmitted.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{
    ExchangeApi, ExchangeError, OrderDetail, OrderRequest, OrderState, RpcRequest, RpcResponse,
};

/// Trading endpoints (order placement, order detail, cancellation).
pub const TRADING_BASE_URL: &str = "https://api.exchange.example.com/exchange/v1/";
/// Account endpoints (balances) and the public ticker.
pub const ACCOUNT_BASE_URL: &str = "https://api.exchange.example.com/v2/";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum recursion depth when flattening nested params for signing.
const MAX_SIGN_LEVEL: usize = 3;

/// Methods served from the account API rather than the trading API.
const ACCOUNT_METHODS: &[&str] = &[
    "private/get-account-summary",
    "private/margin/get-account-summary",
    "private/get-subaccount-balances",
    "private/get-accounts",
];

type HmacSha256 = Hmac<Sha256>;

/// HTTP client for the venue's signed RPC API.
pub struct ExchangeClient {
    http: Client,
    api_key: String,
    api_secret: String,
    trading_base_url: String,
    account_base_url: String,
}

impl ExchangeClient {
    pub fn new(api_key: &str, api_secret: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            trading_base_url: TRADING_BASE_URL.to_string(),
            account_base_url: ACCOUNT_BASE_URL.to_string(),
        })
    }

    /// Create from environment variables:
    /// - EXCHANGE_API_KEY
    /// - EXCHANGE_API_SECRET
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("EXCHANGE_API_KEY").context("EXCHANGE_API_KEY not set")?;
        let api_secret =
            std::env::var("EXCHANGE_API_SECRET").context("EXCHANGE_API_SECRET not set")?;
        Self::new(&api_key, &api_secret)
    }

    /// Override base URLs (for testing against a local stub).
    pub fn with_base_urls(mut self, trading: String, account: String) -> Self {
        self.trading_base_url = trading;
        self.account_base_url = account;
        self
    }

    /// Probe credentials with an account-summary call. Called once at
    /// startup; a failure here is fatal to the process.
    pub async fn authenticate(&self) -> Result<(), ExchangeError> {
        match self.call("private/get-account-summary", json!({}), true).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::Rejected { code, message }) => Err(ExchangeError::Auth(format!(
                "account summary rejected: {} - {}",
                code, message
            ))),
            Err(other) => Err(other),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, ExchangeError> {
        let request_id = Utc::now().timestamp_millis();
        let nonce = request_id;

        let param_str = params_to_str(params, 0);
        // Signature payload format: method + id + api_key + params + nonce
        let payload = format!("{}{}{}{}{}", method, request_id, self.api_key, param_str, nonce);

        let body = RpcRequest {
            id: request_id,
            method: method.to_string(),
            api_key: self.api_key.clone(),
            params: params.clone(),
            nonce,
            sig: self.sign(&payload),
        };

        let is_account = ACCOUNT_METHODS.iter().any(|m| method.starts_with(m));
        let base = if is_account {
            &self.account_base_url
        } else {
            &self.trading_base_url
        };
        let endpoint = format!("{}{}", base, method);

        debug!(method = %method, "Sending signed request");

        let response = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;

        debug!(method = %method, code = parsed.code, "Signed response");

        if parsed.code == 0 {
            Ok(parsed.result)
        } else {
            Err(ExchangeError::Rejected {
                code: parsed.code,
                message: parsed.error_message(),
            })
        }
    }

    /// Send a signed request. `retry_transient` wraps transport failures in
    /// bounded exponential backoff; rejections are returned immediately.
    async fn call(
        &self,
        method: &str,
        mut params: Value,
        retry_transient: bool,
    ) -> Result<Value, ExchangeError> {
        stringify_numbers(&mut params);

        if !retry_transient {
            return self.call_once(method, &params).await;
        }

        backoff::future::retry(retry_policy(), || async {
            self.call_once(method, &params).await.map_err(|e| {
                if e.is_transient() {
                    warn!(method = %method, error = %e, "Transient transport error, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        let url = format!("{}public/get-ticker", self.account_base_url);

        let response = self
            .http
            .get(&url)
            .query(&[("instrument_name", symbol)])
            .send()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExchangeError::Transport(format!(
                "ticker request failed with HTTP {}",
                response.status()
            )));
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;

        if parsed.code != 0 {
            return Err(ExchangeError::Rejected {
                code: parsed.code,
                message: parsed.error_message(),
            });
        }

        let data = parsed.result.get("data").and_then(Value::as_array);
        let Some(first) = data.and_then(|d| d.first()) else {
            warn!(symbol = %symbol, "No ticker data for instrument");
            return Ok(None);
        };

        // 'a' is the latest ask price in the ticker payload.
        Ok(optional_decimal(first.get("a")))
    }
}

#[async_trait]
impl ExchangeApi for ExchangeClient {
    async fn get_current_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        backoff::future::retry(retry_policy(), || async {
            self.fetch_ticker(symbol).await.map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        let result = self
            .call("private/get-account-summary", json!({}), true)
            .await?;

        let accounts = result
            .get("accounts")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Malformed("account summary missing accounts".into()))?;

        for account in accounts {
            if account.get("currency").and_then(Value::as_str) == Some(asset) {
                let available = optional_decimal(account.get("available")).unwrap_or(Decimal::ZERO);
                debug!(asset = %asset, available = %available, "Fetched balance");
                return Ok(available);
            }
        }

        warn!(asset = %asset, "Asset not found in account summary");
        Ok(Decimal::ZERO)
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        // Order submission is not idempotent: a transport error is surfaced
        // rather than retried, so the caller decides what happens next.
        let result = self
            .call("private/create-order", request.params(), false)
            .await?;

        match result.get("order_id") {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Number(id)) => Ok(id.to_string()),
            _ => Err(ExchangeError::Malformed(
                "create-order response missing order_id".into(),
            )),
        }
    }

    async fn get_order_detail(&self, order_id: &str) -> Result<OrderDetail, ExchangeError> {
        let result = self
            .call(
                "private/get-order-detail",
                json!({ "order_id": order_id }),
                true,
            )
            .await?;

        let status = result
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Malformed("order detail missing status".into()))?;

        Ok(OrderDetail {
            state: OrderState::parse(status),
            cumulative_quantity: optional_decimal(result.get("cumulative_quantity"))
                .unwrap_or(Decimal::ZERO),
            avg_price: optional_decimal(result.get("avg_price")).unwrap_or(Decimal::ZERO),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError> {
        match self
            .call("private/cancel-order", json!({ "order_id": order_id }), true)
            .await
        {
            Ok(_) => Ok(true),
            Err(ExchangeError::Rejected { code, message }) => {
                warn!(order_id = %order_id, code, message = %message, "Cancel refused by venue");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }
}

/// Bounded exponential backoff for transport-level retries.
fn retry_policy() -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_elapsed_time(Some(Duration::from_secs(8)))
        .build()
}

/// Parse a decimal from either a JSON string or number.
fn optional_decimal(value: Option<&Value>) -> Option<Decimal> {
    match value {
        Some(Value::String(s)) => Decimal::from_str(s).ok(),
        Some(Value::Number(n)) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
        _ => None,
    }
}

/// Recursively convert numeric values to strings, as the venue requires of
/// all request parameters.
fn stringify_numbers(value: &mut Value) {
    match value {
        Value::Number(n) => *value = Value::String(n.to_string()),
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                stringify_numbers(v);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                stringify_numbers(item);
            }
        }
        _ => {}
    }
}

/// Canonicalize params for signing per the venue's official algorithm:
/// keys sorted, `null` literal, booleans lowercase, lists and nested
/// objects flattened up to `MAX_SIGN_LEVEL`.
fn params_to_str(value: &Value, level: usize) -> String {
    if level >= MAX_SIGN_LEVEL {
        return scalar_str(value);
    }

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            let mut out = String::new();
            for key in keys {
                out.push_str(key);
                match &map[key] {
                    Value::Null => out.push_str("null"),
                    Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
                    Value::Array(items) => {
                        for item in items {
                            out.push_str(&params_to_str(item, level + 1));
                        }
                    }
                    nested @ Value::Object(_) => out.push_str(&params_to_str(nested, level + 1)),
                    scalar => out.push_str(&scalar_str(scalar)),
                }
            }
            out
        }
        other => scalar_str(other),
    }
}

fn scalar_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_to_str_sorts_keys() {
        let params = json!({
            "side": "BUY",
            "instrument_name": "BTC_USDT",
            "type": "MARKET",
        });
        assert_eq!(
            params_to_str(&params, 0),
            "instrument_nameBTC_USDTsideBUYtypeMARKET"
        );
    }

    #[test]
    fn test_params_to_str_booleans_and_null() {
        let params = json!({
            "b": true,
            "a": Value::Null,
            "c": false,
        });
        assert_eq!(params_to_str(&params, 0), "anullbtruecfalse");
    }

    #[test]
    fn test_params_to_str_flattens_lists() {
        let params = json!({
            "orders": [
                { "id": "2", "qty": "5" },
                { "id": "1" },
            ],
        });
        assert_eq!(params_to_str(&params, 0), "ordersid2qty5id1");
    }

    #[test]
    fn test_stringify_numbers_recurses() {
        let mut params = json!({
            "notional": 10.5,
            "nested": { "qty": 3 },
            "list": [1, "x"],
        });
        stringify_numbers(&mut params);
        assert_eq!(params["notional"], "10.5");
        assert_eq!(params["nested"]["qty"], "3");
        assert_eq!(params["list"][0], "1");
        assert_eq!(params["list"][1], "x");
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let client = ExchangeClient::new("key", "secret").unwrap();
        let a = client.sign("private/create-order1key...nonce");
        let b = client.sign("private/create-order1key...nonce");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
