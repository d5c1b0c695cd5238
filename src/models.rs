// models.rs - Order, trade and transaction types

use crate::core_types::{AssetId, OrderId, SymbolId, TradeId, TxnId, UserId};
use serde::{Deserialize, Serialize};

/// Order side: Buy or Sell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side of the book
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Execute at best available price, never rests
    Market,
    /// Must specify price, rests if unfilled
    Limit,
    /// Market order armed at a trigger price
    Stop,
    /// Limit order armed at a trigger price
    StopLimit,
}

/// Time-in-force: what happens to an unfilled residual
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Good-till-cancelled: residual rests in the book
    Gtc,
    /// Immediate-or-cancel: residual is cancelled after the matching pass
    Ioc,
    /// Fill-or-kill: rejected unless fully fillable atomically
    Fok,
}

/// Order status
///
/// Once persisted, an order MUST reach one of the terminal states
/// (never disappear or become unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted, resting or about to match
    Open,
    /// Some quantity filled, rest in the book
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Cancelled by user or residual policy
    Cancelled,
    /// Rejected (balance check failed, FOK shortfall, ...)
    Rejected,
    /// Expired by the system
    Expired,
}

impl OrderStatus {
    /// Terminal states are immutable
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// An order as the engine and stores see it.
///
/// `price` and `qty` are raw u64, already scaled by the registry's
/// per-asset scales. `price` is zero only for market orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    /// Client-supplied identifier, unique per user
    pub client_order_id: Option<String>,
    pub symbol_id: SymbolId,
    pub side: Side,
    pub order_type: OrderType,
    /// Scaled limit price; > 0 for Limit/StopLimit
    pub price: u64,
    /// Trigger price for Stop/StopLimit
    pub stop_price: Option<u64>,
    /// Scaled quantity, > 0
    pub qty: u64,
    pub filled_qty: u64,
    /// Iceberg display quantity: caps the order's contribution to depth
    pub display_qty: Option<u64>,
    pub tif: TimeInForce,
    pub status: OrderStatus,
    /// Populated for Rejected orders so the user can retrieve the cause
    pub reject_reason: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    /// Set iff status is terminal
    pub closed_at_ms: Option<i64>,
}

impl Order {
    /// Remaining quantity to fill
    #[inline]
    pub fn remaining_qty(&self) -> u64 {
        self.qty - self.filled_qty
    }

    /// Check if order is fully filled
    #[inline]
    pub fn is_filled(&self) -> bool {
        self.filled_qty >= self.qty
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Quantity this order contributes to aggregated depth.
    /// Iceberg orders only show their display tranche.
    #[inline]
    pub fn visible_qty(&self) -> u64 {
        match self.display_qty {
            Some(d) => d.min(self.remaining_qty()),
            None => self.remaining_qty(),
        }
    }
}

/// A trade that occurred when orders matched.
///
/// The maker is the order that was already resting in the book at the
/// moment of the match; the incoming order is the taker. Immutable once
/// created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub symbol_id: SymbolId,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub buyer_user_id: UserId,
    pub seller_user_id: UserId,
    /// Trade price = maker's limit price (price improvement accrues to the taker)
    pub price: u64,
    pub qty: u64,
    /// Buyer's commission, paid in the base asset
    pub buyer_fee: u64,
    /// Seller's commission, paid in the quote asset
    pub seller_fee: u64,
    pub taker_side: Side,
    pub created_at_ms: i64,
}

impl Trade {
    /// Whether the buy side of this trade was the maker
    #[inline]
    pub fn is_buyer_maker(&self) -> bool {
        self.taker_side == Side::Sell
    }

    /// Maker/taker flag for the given order id
    pub fn is_maker(&self, order_id: OrderId) -> bool {
        self.maker_order_id == order_id
    }
}

/// Deposit/withdrawal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnKind {
    Deposit,
    Withdrawal,
}

/// Deposit/withdrawal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// A deposit or withdrawal record.
///
/// Completed transactions are the only legal way to change a user's total
/// free + locked outside of matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub kind: TxnKind,
    pub amount: u64,
    /// Withdrawal destination, None for deposits
    pub address: Option<String>,
    pub status: TxnStatus,
    pub created_at_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_order(qty: u64, filled: u64) -> Order {
        Order {
            order_id: 1,
            user_id: 1,
            client_order_id: None,
            symbol_id: 0,
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: 100,
            stop_price: None,
            qty,
            filled_qty: filled,
            display_qty: None,
            tif: TimeInForce::Gtc,
            status: OrderStatus::Open,
            reject_reason: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            closed_at_ms: None,
        }
    }

    #[test]
    fn test_remaining_and_filled() {
        let order = make_order(10, 4);
        assert_eq!(order.remaining_qty(), 6);
        assert!(!order.is_filled());

        let full = make_order(10, 10);
        assert!(full.is_filled());
        assert_eq!(full.remaining_qty(), 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_visible_qty_iceberg() {
        let mut order = make_order(100, 0);
        assert_eq!(order.visible_qty(), 100);

        order.display_qty = Some(10);
        assert_eq!(order.visible_qty(), 10);

        // Near the end, the remainder is smaller than the display tranche
        order.filled_qty = 95;
        assert_eq!(order.visible_qty(), 5);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_is_buyer_maker() {
        let trade = Trade {
            trade_id: 1,
            symbol_id: 0,
            maker_order_id: 10,
            taker_order_id: 11,
            buyer_user_id: 1,
            seller_user_id: 2,
            price: 100,
            qty: 1,
            buyer_fee: 0,
            seller_fee: 0,
            taker_side: Side::Sell,
            created_at_ms: 0,
        };
        assert!(trade.is_buyer_maker());
        assert!(trade.is_maker(10));
        assert!(!trade.is_maker(11));
    }
}
