//! Matching engine: per-symbol single-writer matching core and the
//! worker service that drives it.

pub mod engine;
pub mod events;
pub mod service;

pub use engine::{CancelAck, EngineConfig, SubmitOrder, SymbolEngine};
pub use events::{BookSnapshot, Channel, DepthSnapshot, EventMessage};
pub use service::{EngineService, ServiceConfig};
