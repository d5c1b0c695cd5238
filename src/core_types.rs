//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Asset ID - globally unique identifier for an asset.
///
/// # Constraints:
/// - **Immutable**: Once assigned, NEVER changes
/// - **Sequential**: Assigned contiguously by the registry (0, 1, 2, ...)
pub type AssetId = u32;

/// Symbol ID - identifies a trading pair in the registry
pub type SymbolId = u32;

/// User ID - globally unique, immutable after assignment.
pub type UserId = u64;

/// Order ID - unique within the system, assigned monotonically by the engine
pub type OrderId = u64;

/// Trade ID - unique within the system
pub type TradeId = u64;

/// Transaction ID - deposit/withdrawal record identifier
pub type TxnId = u64;

/// Subscriber/client ID for the event publisher
pub type ClientId = u64;

/// Sequence number for ordering
pub type SeqNum = u64;
