//! Order store - record of every order with lifecycle status
//!
//! Append and update-by-id access. Status transitions are derived here from
//! the filled quantity so no caller can invent an inconsistent pair, and
//! terminal states are immutable.

use crate::core_types::{OrderId, SymbolId, UserId};
use crate::error::{EngineError, Result};
use crate::models::{Order, OrderStatus};
use rustc_hash::FxHashMap;
use std::sync::RwLock;

pub struct OrderStore {
    orders: RwLock<FxHashMap<OrderId, Order>>,
    /// Enforces per-user client_order_id uniqueness
    client_ids: RwLock<FxHashMap<(UserId, String), OrderId>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(FxHashMap::default()),
            client_ids: RwLock::new(FxHashMap::default()),
        }
    }

    /// Persist a new order.
    ///
    /// Rejects duplicate order ids and duplicate `(user, client_order_id)`
    /// pairs.
    pub fn insert(&self, order: Order) -> Result<()> {
        if let Some(cid) = &order.client_order_id {
            let mut client_ids = self
                .client_ids
                .write()
                .map_err(|_| EngineError::invariant("order store poisoned"))?;
            let key = (order.user_id, cid.clone());
            if client_ids.contains_key(&key) {
                return Err(EngineError::validation("duplicate client order id"));
            }
            client_ids.insert(key, order.order_id);
        }
        let mut orders = self
            .orders
            .write()
            .map_err(|_| EngineError::invariant("order store poisoned"))?;
        if orders.contains_key(&order.order_id) {
            return Err(EngineError::validation("duplicate order id"));
        }
        orders.insert(order.order_id, order);
        Ok(())
    }

    /// Update an order's filled quantity; status follows from filled vs qty.
    ///
    /// `closed_at` is stamped when the order reaches Filled. Fill updates on
    /// a terminal order, shrinking fills, and fills beyond qty are upstream
    /// logic bugs and fail with `InvariantViolation`.
    pub fn update_fill(&self, id: OrderId, new_filled: u64, now_ms: i64) -> Result<Order> {
        let mut orders = self
            .orders
            .write()
            .map_err(|_| EngineError::invariant("order store poisoned"))?;
        let order = orders.get_mut(&id).ok_or(EngineError::NotFound)?;

        if order.is_terminal() {
            return Err(EngineError::invariant(format!(
                "fill update on terminal order {} ({:?})",
                id, order.status
            )));
        }
        if new_filled > order.qty || new_filled < order.filled_qty {
            return Err(EngineError::invariant(format!(
                "fill bounds broken on order {}: filled {} -> {} of qty {}",
                id, order.filled_qty, new_filled, order.qty
            )));
        }

        order.filled_qty = new_filled;
        order.updated_at_ms = now_ms;
        if new_filled == order.qty {
            order.status = OrderStatus::Filled;
            order.closed_at_ms = Some(now_ms);
        } else if new_filled > 0 {
            order.status = OrderStatus::PartiallyFilled;
        }
        Ok(order.clone())
    }

    /// Cancel an order conditionally.
    ///
    /// Only Open/PartiallyFilled orders owned by `user` are cancellable;
    /// anything else returns `NotCancellable` (the engine maps terminal
    /// states to the idempotent `AlreadyTerminal` acknowledgement).
    pub fn mark_cancelled(&self, id: OrderId, user: UserId, now_ms: i64) -> Result<Order> {
        let mut orders = self
            .orders
            .write()
            .map_err(|_| EngineError::invariant("order store poisoned"))?;
        let order = orders.get_mut(&id).ok_or(EngineError::NotFound)?;
        if order.user_id != user {
            return Err(EngineError::NotCancellable);
        }
        if !matches!(order.status, OrderStatus::Open | OrderStatus::PartiallyFilled) {
            return Err(EngineError::NotCancellable);
        }
        order.status = OrderStatus::Cancelled;
        order.updated_at_ms = now_ms;
        order.closed_at_ms = Some(now_ms);
        Ok(order.clone())
    }

    /// Reject a live order (FOK shortfall, market order with no fillable
    /// liquidity). Terminal orders are immutable.
    pub fn mark_rejected(&self, id: OrderId, reason: &str, now_ms: i64) -> Result<Order> {
        let mut orders = self
            .orders
            .write()
            .map_err(|_| EngineError::invariant("order store poisoned"))?;
        let order = orders.get_mut(&id).ok_or(EngineError::NotFound)?;
        if order.is_terminal() {
            return Err(EngineError::invariant(format!(
                "reject of terminal order {} ({:?})",
                id, order.status
            )));
        }
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason.to_string());
        order.updated_at_ms = now_ms;
        order.closed_at_ms = Some(now_ms);
        Ok(order.clone())
    }

    /// Fetch an order owned by `user`.
    pub fn get(&self, id: OrderId, user: UserId) -> Option<Order> {
        let orders = self.orders.read().ok()?;
        orders.get(&id).filter(|o| o.user_id == user).cloned()
    }

    /// Fetch an order regardless of owner (engine internal).
    pub fn get_any(&self, id: OrderId) -> Option<Order> {
        self.orders.read().ok()?.get(&id).cloned()
    }

    /// Highest order id ever stored; the engine's id counter resumes
    /// above this on restart.
    pub fn max_order_id(&self) -> OrderId {
        self.orders
            .read()
            .map(|orders| orders.keys().copied().max().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Open and partially filled orders for one symbol, ordered by
    /// `(created_at, order_id)` for deterministic book hydration.
    pub fn open_by_symbol(&self, symbol_id: SymbolId, limit: usize) -> Vec<Order> {
        let orders = match self.orders.read() {
            Ok(o) => o,
            Err(_) => return Vec::new(),
        };
        let mut open: Vec<Order> = orders
            .values()
            .filter(|o| {
                o.symbol_id == symbol_id
                    && matches!(o.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
            })
            .cloned()
            .collect();
        open.sort_by_key(|o| (o.created_at_ms, o.order_id));
        open.truncate(limit);
        open
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}
