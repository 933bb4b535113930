//! HTTP and streaming surface for the run coordinator.
//!
//! Provides:
//! - Wire protocol (JSON)
//! - REST router with error mapping
//! - SSE live streams
//! - WebSocket live stream (feature: websocket)

pub mod api;
pub mod error;
pub mod extract;
pub mod protocol;
pub mod sse;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use api::router;
pub use error::ApiError;
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use protocol::{ClientMessage, ServerMessage};
