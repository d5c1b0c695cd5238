//! OrderBook - BTreeMap-based price-time priority order book
//!
//! This module contains only the per-symbol book data structure; matching
//! lives in the engine. The book holds only Open and PartiallyFilled
//! orders.
//!
//! # Key design:
//! - Asks are stored with normal keys (ascending, lowest price = best ask)
//! - Bids use negated keys `u64::MAX - price` (highest price first = best bid)
//! - Within a price level orders are FIFO by time of acceptance
//! - An order-id index makes removal O(log N + k) instead of a full scan
//!
//! # Complexity:
//! | Operation | Time |
//! |-----------|------|
//! | insert | O(log N) |
//! | best price | O(log N) |
//! | remove | O(log N + k), k = orders at the level |
//! | aggregate_depth | O(L) for L levels visited |

use crate::core_types::OrderId;
use crate::models::{Order, Side};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};

/// One side's aggregated price level: `(price, total visible quantity)`
pub type DepthLevel = (u64, u64);

#[derive(Debug, Default)]
pub struct OrderBook {
    /// Sell orders: price -> orders (ascending, lowest = best)
    asks: BTreeMap<u64, VecDeque<Order>>,
    /// Buy orders: (MAX - price) -> orders (so highest price comes first)
    bids: BTreeMap<u64, VecDeque<Order>>,
    /// order_id -> (side, price), for direct removal
    index: FxHashMap<OrderId, (Side, u64)>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn bid_key(price: u64) -> u64 {
        u64::MAX - price
    }

    /// Best bid price (highest buy price)
    #[inline]
    pub fn best_bid(&self) -> Option<u64> {
        self.bids.first_key_value().map(|(k, _)| u64::MAX - k)
    }

    /// Best ask price (lowest sell price)
    #[inline]
    pub fn best_ask(&self) -> Option<u64> {
        self.asks.first_key_value().map(|(k, _)| *k)
    }

    /// True while `best_bid >= best_ask`. Between commands this must be
    /// false (or one side empty).
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Number of orders resting in the book
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id)
    }

    /// Rest an order in the book (FIFO within its price level).
    ///
    /// The caller is responsible for inserting in acceptance order; the
    /// book does not re-sort within a level.
    pub fn insert(&mut self, order: Order) {
        self.index.insert(order.order_id, (order.side, order.price));
        let (map, key) = match order.side {
            Side::Buy => (&mut self.bids, Self::bid_key(order.price)),
            Side::Sell => (&mut self.asks, order.price),
        };
        map.entry(key).or_default().push_back(order);
    }

    /// Remove an order by id. Returns the removed order if present.
    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let (side, price) = self.index.remove(&order_id)?;
        let (map, key) = match side {
            Side::Buy => (&mut self.bids, Self::bid_key(price)),
            Side::Sell => (&mut self.asks, price),
        };
        let level = map.get_mut(&key)?;
        let pos = level.iter().position(|o| o.order_id == order_id)?;
        let order = level.remove(pos);
        if level.is_empty() {
            map.remove(&key);
        }
        order
    }

    /// The first order at the best price of `side`.
    pub fn peek_top(&self, side: Side) -> Option<&Order> {
        match side {
            Side::Buy => self.bids.first_key_value().and_then(|(_, q)| q.front()),
            Side::Sell => self.asks.first_key_value().and_then(|(_, q)| q.front()),
        }
    }

    /// Apply a fill of `qty` to the top order of `side`.
    ///
    /// Returns the updated order and whether it was removed (fully filled).
    /// The caller must ensure `qty <= remaining` of the top order.
    pub fn fill_top(&mut self, side: Side, qty: u64) -> Option<(Order, bool)> {
        let map = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let mut entry = map.first_entry()?;
        let level = entry.get_mut();
        let top = level.front_mut()?;
        top.filled_qty += qty;
        if !top.is_filled() && top.filled_qty > 0 {
            top.status = crate::models::OrderStatus::PartiallyFilled;
        }
        let snapshot = top.clone();
        let removed = top.is_filled();
        if removed {
            level.pop_front();
            self.index.remove(&snapshot.order_id);
            if level.is_empty() {
                entry.remove();
            }
        }
        Some((snapshot, removed))
    }

    /// Total remaining quantity available on `side` at prices acceptable to
    /// `limit_price` (None = any price), capped at `needed`.
    ///
    /// Used for the FOK pre-check: walk best-first, stop as soon as enough
    /// liquidity is found.
    pub fn available_qty(&self, side: Side, limit_price: Option<u64>, needed: u64) -> u64 {
        let mut available = 0u64;
        let acceptable = |price: u64| match (side, limit_price) {
            (_, None) => true,
            // Taker buying: asks priced at or below the limit
            (Side::Sell, Some(limit)) => price <= limit,
            // Taker selling: bids priced at or above the limit
            (Side::Buy, Some(limit)) => price >= limit,
        };
        let levels: Box<dyn Iterator<Item = (u64, &VecDeque<Order>)> + '_> = match side {
            Side::Sell => Box::new(self.asks.iter().map(|(p, q)| (*p, q))),
            Side::Buy => Box::new(self.bids.iter().map(|(k, q)| (u64::MAX - k, q))),
        };
        for (price, level) in levels {
            if !acceptable(price) {
                break;
            }
            for order in level {
                available = available.saturating_add(order.remaining_qty());
                if available >= needed {
                    return available;
                }
            }
        }
        available
    }

    /// Aggregate visible quantity per price level, top `limit` levels per
    /// side. Bids descend from the best bid, asks ascend from the best ask.
    /// Iceberg orders contribute only their display tranche.
    pub fn aggregate_depth(&self, limit: usize) -> (Vec<DepthLevel>, Vec<DepthLevel>) {
        let sum_level = |level: &VecDeque<Order>| -> u64 {
            level.iter().map(|o| o.visible_qty()).sum()
        };
        let bids = self
            .bids
            .iter()
            .take(limit)
            .map(|(k, level)| (u64::MAX - k, sum_level(level)))
            .collect();
        let asks = self
            .asks
            .iter()
            .take(limit)
            .map(|(price, level)| (*price, sum_level(level)))
            .collect();
        (bids, asks)
    }

    /// All resting orders in price priority (bids best-first, then asks
    /// best-first). Used for resync snapshots.
    pub fn all_orders(&self) -> Vec<&Order> {
        self.bids
            .values()
            .flat_map(|level| level.iter())
            .chain(self.asks.values().flat_map(|level| level.iter()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType, TimeInForce};

    fn make_order(id: OrderId, price: u64, qty: u64, side: Side) -> Order {
        Order {
            order_id: id,
            user_id: 1,
            client_order_id: None,
            symbol_id: 0,
            side,
            order_type: OrderType::Limit,
            price,
            stop_price: None,
            qty,
            filled_qty: 0,
            display_qty: None,
            tif: TimeInForce::Gtc,
            status: OrderStatus::Open,
            reject_reason: None,
            created_at_ms: id as i64,
            updated_at_ms: id as i64,
            closed_at_ms: None,
        }
    }

    #[test]
    fn test_best_bid_ask() {
        let mut book = OrderBook::new();
        book.insert(make_order(1, 100, 10, Side::Buy));
        book.insert(make_order(2, 99, 10, Side::Buy));
        book.insert(make_order(3, 101, 10, Side::Sell));
        book.insert(make_order(4, 102, 10, Side::Sell));

        assert_eq!(book.best_bid(), Some(100));
        assert_eq!(book.best_ask(), Some(101));
        assert!(!book.is_crossed());
        assert_eq!(book.len(), 4);
    }

    #[test]
    fn test_remove_cleans_level() {
        let mut book = OrderBook::new();
        book.insert(make_order(1, 100, 10, Side::Buy));
        book.insert(make_order(2, 99, 30, Side::Buy));

        let removed = book.remove(1).unwrap();
        assert_eq!(removed.order_id, 1);
        assert_eq!(book.best_bid(), Some(99));
        assert!(!book.contains(1));

        assert!(book.remove(999).is_none());
    }

    #[test]
    fn test_fifo_within_level() {
        let mut book = OrderBook::new();
        book.insert(make_order(1, 100, 5, Side::Sell));
        book.insert(make_order(2, 100, 5, Side::Sell));

        assert_eq!(book.peek_top(Side::Sell).unwrap().order_id, 1);
        let (filled, removed) = book.fill_top(Side::Sell, 5).unwrap();
        assert_eq!(filled.order_id, 1);
        assert!(removed);
        assert_eq!(book.peek_top(Side::Sell).unwrap().order_id, 2);
    }

    #[test]
    fn test_fill_top_partial() {
        let mut book = OrderBook::new();
        book.insert(make_order(1, 100, 10, Side::Buy));

        let (updated, removed) = book.fill_top(Side::Buy, 4).unwrap();
        assert!(!removed);
        assert_eq!(updated.filled_qty, 4);
        assert_eq!(book.peek_top(Side::Buy).unwrap().remaining_qty(), 6);
    }

    #[test]
    fn test_aggregate_depth() {
        let mut book = OrderBook::new();
        book.insert(make_order(1, 100, 10, Side::Buy));
        book.insert(make_order(2, 100, 5, Side::Buy));
        book.insert(make_order(3, 99, 7, Side::Buy));
        book.insert(make_order(4, 101, 3, Side::Sell));

        let (bids, asks) = book.aggregate_depth(10);
        assert_eq!(bids, vec![(100, 15), (99, 7)]);
        assert_eq!(asks, vec![(101, 3)]);

        let (bids, _) = book.aggregate_depth(1);
        assert_eq!(bids, vec![(100, 15)]);
    }

    #[test]
    fn test_aggregate_depth_iceberg_visible_only() {
        let mut book = OrderBook::new();
        let mut iceberg = make_order(1, 100, 100, Side::Sell);
        iceberg.display_qty = Some(10);
        book.insert(iceberg);
        book.insert(make_order(2, 100, 5, Side::Sell));

        let (_, asks) = book.aggregate_depth(10);
        assert_eq!(asks, vec![(100, 15)]);
    }

    #[test]
    fn test_available_qty_price_bound() {
        let mut book = OrderBook::new();
        book.insert(make_order(1, 100, 5, Side::Sell));
        book.insert(make_order(2, 101, 5, Side::Sell));
        book.insert(make_order(3, 105, 5, Side::Sell));

        // Buying with limit 101: only the first two levels count
        assert_eq!(book.available_qty(Side::Sell, Some(101), 100), 10);
        // Enough found early: stops at the needed amount
        assert_eq!(book.available_qty(Side::Sell, Some(101), 5), 5);
        // Market: everything
        assert_eq!(book.available_qty(Side::Sell, None, 100), 15);
    }

    #[test]
    fn test_crossed_detection() {
        let mut book = OrderBook::new();
        book.insert(make_order(1, 101, 5, Side::Buy));
        book.insert(make_order(2, 100, 5, Side::Sell));
        assert!(book.is_crossed());
    }
}
