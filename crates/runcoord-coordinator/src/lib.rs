//! Run coordination and storage.
//!
//! Provides:
//! - `Coordinator` - Run queue, stop channel and event fan-out over a `RunStore`
//! - `RunnerRegistry` - Runner liveness from heartbeats
//! - `CoordinatorConfig` - Environment-driven settings
//! - Storage implementations (memory, SQLite)

pub mod config;
pub mod coordinator;
pub mod registry;
pub mod stops;
pub mod storage;

pub use config::{ConfigError, CoordinatorConfig, ReaperPolicy};
pub use coordinator::{
    Coordinator, CoordinatorError, Deregistration, Directive, HeartbeatAck, MaintenanceReport,
    PollResult, ProgressEvent, RegisterOutcome, RegisterRunner, RunRequest, RunnerInfo,
    RunnerReport, StopOutcome,
};
pub use registry::{Initiator, Liveness, RegistryError, RunnerEntry, RunnerRegistry, RunnerView};
pub use stops::{StopChannel, StopCommand};
