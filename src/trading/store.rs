//! Thread-safe store of active positions.
//!
//! One mutex guards the whole map; every operation holds it only for the
//! map access itself. Sweeps iterate over a cloned snapshot so no network
//! call ever happens under the lock.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::models::Position;

/// Mutex-guarded map of symbol -> Position. At most one position per
/// symbol; `add` is first-writer-wins.
pub struct PositionStore {
    positions: Mutex<HashMap<String, Position>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
        }
    }

    /// Add a position. Returns `false` when one already exists for the
    /// symbol, leaving the existing entry untouched.
    pub async fn add(&self, position: Position) -> bool {
        let mut positions = self.positions.lock().await;

        if positions.contains_key(&position.symbol) {
            warn!(symbol = %position.symbol, "Position already exists");
            return false;
        }

        info!(symbol = %position.symbol, "Added position");
        positions.insert(position.symbol.clone(), position);
        true
    }

    pub async fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.lock().await.get(symbol).cloned()
    }

    pub async fn contains(&self, symbol: &str) -> bool {
        self.positions.lock().await.contains_key(symbol)
    }

    /// Apply a mutation under the lock. Returns the updated position, or
    /// `None` when the symbol is not tracked (a no-op, not an error: the
    /// other sweep may have already closed it).
    pub async fn update<F>(&self, symbol: &str, mutate: F) -> Option<Position>
    where
        F: FnOnce(&mut Position),
    {
        let mut positions = self.positions.lock().await;
        let position = positions.get_mut(symbol)?;
        mutate(position);
        Some(position.clone())
    }

    pub async fn remove(&self, symbol: &str) -> Option<Position> {
        let removed = self.positions.lock().await.remove(symbol);
        if removed.is_some() {
            info!(symbol = %symbol, "Removed position");
        }
        removed
    }

    /// Clone of all tracked positions for lock-free iteration.
    pub async fn snapshot(&self) -> Vec<Position> {
        self.positions.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.positions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.lock().await.is_empty()
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn position(symbol: &str) -> Position {
        Position::new(
            symbol.to_string(),
            "ord-1".to_string(),
            1,
            dec!(1),
            dec!(100),
            dec!(94),
            dec!(106),
        )
    }

    #[tokio::test]
    async fn test_concurrent_add_same_symbol_single_winner() {
        let store = Arc::new(PositionStore::new());

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.add(position("BTC_USDT")).await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.add(position("BTC_USDT")).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b, "exactly one add must win");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_missing_symbol_is_noop() {
        let store = PositionStore::new();
        let updated = store
            .update("ETH_USDT", |p| {
                p.stop_loss = dec!(99);
            })
            .await;
        assert!(updated.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_copy() {
        let store = PositionStore::new();
        store.add(position("SOL_USDT")).await;

        let mut snapshot = store.snapshot().await;
        snapshot[0].stop_loss = dec!(1);

        assert_eq!(store.get("SOL_USDT").await.unwrap().stop_loss, dec!(94));
    }

    #[tokio::test]
    async fn test_remove_returns_position_once() {
        let store = PositionStore::new();
        store.add(position("XRP_USDT")).await;

        assert!(store.remove("XRP_USDT").await.is_some());
        assert!(store.remove("XRP_USDT").await.is_none());
        assert!(store.is_empty().await);
    }
}
