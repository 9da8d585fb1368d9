//! Byzantine fault tolerant ordering engine.
//!
//! A cluster of `n = 3f + 1` nodes agrees on a single order of client
//! requests through a three-phase vote (PRE_PREPARE, PREPARE, COMMIT) with
//! leader rotation on timeout. The [`manager::ConsensusManager`] is the
//! embedding surface; the transport between nodes is left to the host.

pub mod config;
pub mod coordinator;
pub mod manager;
pub mod messages;
pub mod monitor;
pub mod request;

pub use config::EngineConfig;
pub use coordinator::{CoordinatorEvent, RejectReason, ViolationKind};
pub use manager::{ConsensusManager, EngineEvent, EngineStatus};
pub use messages::{ConsensusMessage, Phase};
pub use monitor::{ConsensusMonitor, HealthStatus, HealthSummary, MonitorConfig};
pub use request::{NewRequest, Priority, Request, RequestKind};
