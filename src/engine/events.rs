//! Event types emitted by the matching engine
//!
//! Each event carries `channel`, `symbol`, `data` and `timestamp`. Per
//! `(channel, symbol)` the publisher delivers events in the engine's
//! emission order.

use crate::models::{Order, Trade};
use crate::orderbook::DepthLevel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event stream channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Order,
    Trade,
    Depth,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Order => write!(f, "order"),
            Channel::Trade => write!(f, "trade"),
            Channel::Depth => write!(f, "depth"),
        }
    }
}

/// Aggregated top-of-book levels for the depth stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthPayload {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// A serialized event as delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub channel: Channel,
    pub symbol: String,
    pub data: serde_json::Value,
    pub timestamp_ms: i64,
}

impl EventMessage {
    pub fn order_update(symbol: &str, order: &Order, timestamp_ms: i64) -> Self {
        Self {
            channel: Channel::Order,
            symbol: symbol.to_string(),
            data: serde_json::to_value(order).unwrap_or(serde_json::Value::Null),
            timestamp_ms,
        }
    }

    pub fn trade(symbol: &str, trade: &Trade, timestamp_ms: i64) -> Self {
        Self {
            channel: Channel::Trade,
            symbol: symbol.to_string(),
            data: serde_json::to_value(trade).unwrap_or(serde_json::Value::Null),
            timestamp_ms,
        }
    }

    pub fn depth(symbol: &str, bids: Vec<DepthLevel>, asks: Vec<DepthLevel>, timestamp_ms: i64) -> Self {
        Self {
            channel: Channel::Depth,
            symbol: symbol.to_string(),
            data: serde_json::to_value(DepthPayload { bids, asks }).unwrap_or(serde_json::Value::Null),
            timestamp_ms,
        }
    }
}

/// Snapshot of a symbol's open state, served to subscribers that missed
/// events (persistence succeeded but publication failed) so they can
/// recover without replaying history.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub symbol: String,
    pub best_bid: Option<u64>,
    pub best_ask: Option<u64>,
    pub open_orders: Vec<Order>,
    pub timestamp_ms: i64,
}

/// Aggregated depth answer for book queries
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    /// Server timestamp at snapshot time
    pub timestamp_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, OrderType, Side, TimeInForce};

    #[test]
    fn test_channel_display() {
        assert_eq!(Channel::Order.to_string(), "order");
        assert_eq!(Channel::Trade.to_string(), "trade");
        assert_eq!(Channel::Depth.to_string(), "depth");
    }

    #[test]
    fn test_order_update_payload() {
        let order = Order {
            order_id: 42,
            user_id: 7,
            client_order_id: None,
            symbol_id: 0,
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: 100,
            stop_price: None,
            qty: 10,
            filled_qty: 0,
            display_qty: None,
            tif: TimeInForce::Gtc,
            status: OrderStatus::Open,
            reject_reason: None,
            created_at_ms: 1,
            updated_at_ms: 1,
            closed_at_ms: None,
        };
        let event = EventMessage::order_update("BTCUSDT", &order, 123);
        assert_eq!(event.channel, Channel::Order);
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.data["order_id"], 42);
        assert_eq!(event.data["status"], "OPEN");
        assert_eq!(event.timestamp_ms, 123);
    }

    #[test]
    fn test_depth_payload() {
        let event = EventMessage::depth("BTCUSDT", vec![(100, 5)], vec![(101, 3)], 0);
        assert_eq!(event.data["bids"][0][0], 100);
        assert_eq!(event.data["asks"][0][1], 3);
    }
}
