//! spotmatch - spot venue matching core
//!
//! Users submit limit and market orders for a set of symbols, the venue
//! matches crossing orders, records executed trades, and maintains
//! per-user per-asset balances with correct locking semantics.
//!
//! # Modules
//!
//! - [`core_types`] - Core type aliases (AssetId, UserId, ...)
//! - [`error`] - Domain error enum
//! - [`money`] - Exact scaled fixed-point arithmetic
//! - [`fee`] - Commission calculation
//! - [`models`] - Order, Trade and Transaction types
//! - [`symbols`] - Explicit symbol -> (base, quote) registry
//! - [`balance`] - Enforced free/locked balance type
//! - [`balance_store`] - Shared ledger with ordered row locking
//! - [`store`] - Order and trade stores
//! - [`orderbook`] - BTreeMap-based price-time priority book
//! - [`engine`] - Per-symbol matching core and worker service
//! - [`publisher`] - (channel, symbol) event fan-out
//! - [`funding`] - Deposits and withdrawals
//! - [`persistence`] - PostgreSQL relational mirror
//! - [`config`] - YAML configuration with env overrides

// Core types - must be first!
pub mod core_types;
pub mod error;

// Money and trading parameters
pub mod fee;
pub mod money;
pub mod symbols;

// Domain models
pub mod models;

// Trading components
pub mod balance;
pub mod balance_store;
pub mod engine;
pub mod funding;
pub mod orderbook;
pub mod publisher;
pub mod store;

// Ambient services
pub mod config;
pub mod logging;
pub mod persistence;

// Convenient re-exports at crate root
pub use balance::Balance;
pub use balance_store::{BalanceStore, Settlement};
pub use config::AppConfig;
pub use core_types::{AssetId, ClientId, OrderId, SymbolId, TradeId, UserId};
pub use engine::{CancelAck, EngineConfig, EngineService, ServiceConfig, SubmitOrder, SymbolEngine};
pub use error::{EngineError, Result};
pub use models::{Order, OrderStatus, OrderType, Side, TimeInForce, Trade, Transaction};
pub use orderbook::OrderBook;
pub use publisher::{EventPublisher, PublisherMessage};
pub use store::{OrderStore, TradeStore};
pub use symbols::{SymbolInfo, SymbolRegistry};
