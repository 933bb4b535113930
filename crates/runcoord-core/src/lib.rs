//! Core abstractions for run coordination.
//!
//! This crate provides the fundamental building blocks:
//! - `RunStatus` - Run state machine with a labeled transition table
//! - `Session`, `Run`, `Event` - Persisted records
//! - `RunStore` - Storage trait with conditional (race-safe) writes
//! - `EventBroadcaster` - Bounded live fan-out to stream subscribers

pub mod broadcaster;
pub mod context;
pub mod event;
pub mod state;
pub mod traits;

pub use broadcaster::{Delivery, EventBroadcaster, StreamScope};
pub use context::SessionContext;
pub use event::{Event, EventId, EventQuery, EventType, NewEvent};
pub use state::{RunStatus, RunTransition, TransitionError};
pub use traits::{
    Run, RunId, RunStore, RunnerId, Session, SessionId, SessionStatus, StoreError, now_millis,
};
