//! # wakegate-engine
//!
//! The wake protocol on top of the store: chunk reassembly, the per-device
//! state machine, stale sweeping with queued retries, site-day sessions,
//! snapshot aggregation and ordered per-device dispatch.

#![deny(unsafe_code)]

pub mod alerts;
pub mod blob;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod protocol;
pub mod publish;
pub mod reassembler;
pub mod router;
pub mod sessions;
pub mod snapshot;
pub mod sweeper;

pub use alerts::{Alert, AlertSink, LogAlertSink};
pub use blob::{BlobKey, BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::{EngineConfig, SnapshotConfig};
pub use error::{EngineError, Result};
pub use maintenance::{run_maintenance, spawn_maintenance, MaintenanceReport, MetricsSchedule};
pub use protocol::{Collaborators, ProtocolEngine};
pub use publish::{CommandPublisher, LogPublisher};
pub use reassembler::ChunkReassembler;
pub use router::DeviceRouter;
pub use sessions::{OutcomeRecord, SessionManager};
pub use snapshot::{Reading, SnapshotAggregator};
pub use sweeper::{RetryDecision, SweepReport};
