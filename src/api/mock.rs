//! Scripted in-memory exchange for engine tests.
//!
//! Submissions are recorded with timestamps so tests can assert on both the
//! exact requests sent and the pacing between them. Order-detail responses
//! are scripted per order id; the last entry in a script repeats, which
//! models an order parked in a terminal state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::time::Instant;

use super::{ExchangeApi, ExchangeError, OrderDetail, OrderRequest, OrderState};

/// One recorded `submit_order` call.
#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub request: OrderRequest,
    pub at: Instant,
}

pub struct MockExchange {
    prices: Mutex<HashMap<String, Decimal>>,
    balances: Mutex<HashMap<String, Decimal>>,
    submit_plan: Mutex<VecDeque<Result<String, ExchangeError>>>,
    submissions: Mutex<Vec<RecordedSubmission>>,
    detail_plans: Mutex<HashMap<String, VecDeque<Result<OrderDetail, ExchangeError>>>>,
    default_detail: Mutex<Option<OrderDetail>>,
    cancelled: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            prices: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            submit_plan: Mutex::new(VecDeque::new()),
            submissions: Mutex::new(Vec::new()),
            detail_plans: Mutex::new(HashMap::new()),
            default_detail: Mutex::new(None),
            cancelled: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(asset.to_string(), amount);
    }

    /// Queue the outcome of the next `submit_order` call. When the queue is
    /// empty, submissions succeed with generated ids.
    pub fn push_submit_result(&self, result: Result<String, ExchangeError>) {
        self.submit_plan.lock().unwrap().push_back(result);
    }

    /// Queue an order-detail response for a given order id.
    pub fn push_detail(&self, order_id: &str, result: Result<OrderDetail, ExchangeError>) {
        self.detail_plans
            .lock()
            .unwrap()
            .entry(order_id.to_string())
            .or_default()
            .push_back(result);
    }

    /// Detail returned for any order without a script of its own.
    pub fn set_default_detail(&self, detail: OrderDetail) {
        *self.default_detail.lock().unwrap() = Some(detail);
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    /// The rejection that triggers the quantity-format ladder.
    pub fn invalid_quantity() -> ExchangeError {
        ExchangeError::Rejected {
            code: 213,
            message: "Invalid quantity format".to_string(),
        }
    }

    pub fn filled(quantity: Decimal, avg_price: Decimal) -> OrderDetail {
        OrderDetail {
            state: OrderState::Filled,
            cumulative_quantity: quantity,
            avg_price,
        }
    }

    pub fn canceled(quantity: Decimal, avg_price: Decimal) -> OrderDetail {
        OrderDetail {
            state: OrderState::Canceled,
            cumulative_quantity: quantity,
            avg_price,
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn get_current_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        Ok(self.prices.lock().unwrap().get(symbol).copied())
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal, ExchangeError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<String, ExchangeError> {
        self.submissions.lock().unwrap().push(RecordedSubmission {
            request: request.clone(),
            at: Instant::now(),
        });

        if let Some(result) = self.submit_plan.lock().unwrap().pop_front() {
            return result;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("ord-{}", id))
    }

    async fn get_order_detail(&self, order_id: &str) -> Result<OrderDetail, ExchangeError> {
        let mut plans = self.detail_plans.lock().unwrap();
        if let Some(plan) = plans.get_mut(order_id) {
            // Pop through the script, then keep repeating its final entry.
            if plan.len() > 1 {
                return plan.pop_front().expect("non-empty plan");
            }
            if let Some(last) = plan.front() {
                return last.clone();
            }
        }

        if let Some(ref detail) = *self.default_detail.lock().unwrap() {
            return Ok(detail.clone());
        }

        Err(ExchangeError::Transport(format!(
            "no scripted detail for order {}",
            order_id
        )))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, ExchangeError> {
        self.cancelled.lock().unwrap().push(order_id.to_string());
        Ok(true)
    }
}
