//! Trade store - append-only record of executed fills
//!
//! Trades are created only inside the matching engine and never modified
//! after insertion.

use crate::core_types::{OrderId, SymbolId, UserId};
use crate::error::{EngineError, Result};
use crate::models::Trade;
use std::sync::RwLock;

pub struct TradeStore {
    trades: RwLock<Vec<Trade>>,
}

impl TradeStore {
    pub fn new() -> Self {
        Self {
            trades: RwLock::new(Vec::new()),
        }
    }

    /// Append a trade. Zero-quantity trades are an engine bug.
    pub fn insert(&self, trade: Trade) -> Result<()> {
        if trade.qty == 0 {
            return Err(EngineError::invariant(format!(
                "zero-quantity trade {}",
                trade.trade_id
            )));
        }
        let mut trades = self
            .trades
            .write()
            .map_err(|_| EngineError::invariant("trade store poisoned"))?;
        trades.push(trade);
        Ok(())
    }

    /// Trades in which `user` participated, most recent first.
    pub fn by_user(&self, user: UserId, symbol_id: Option<SymbolId>, limit: usize) -> Vec<Trade> {
        let trades = match self.trades.read() {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        trades
            .iter()
            .rev()
            .filter(|t| t.buyer_user_id == user || t.seller_user_id == user)
            .filter(|t| symbol_id.map_or(true, |s| t.symbol_id == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Trades for one symbol, most recent first.
    pub fn by_symbol(&self, symbol_id: SymbolId, limit: usize) -> Vec<Trade> {
        let trades = match self.trades.read() {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        trades
            .iter()
            .rev()
            .filter(|t| t.symbol_id == symbol_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Fills of one order, restricted to the order's owner side.
    pub fn by_order(&self, order_id: OrderId, user: UserId) -> Vec<Trade> {
        let trades = match self.trades.read() {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        };
        trades
            .iter()
            .filter(|t| {
                (t.maker_order_id == order_id || t.taker_order_id == order_id)
                    && (t.buyer_user_id == user || t.seller_user_id == user)
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trades.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TradeStore {
    fn default() -> Self {
        Self::new()
    }
}
