//! tm-broker: Host process supervisor and topic router
//!
//! The broker launches host processes from a declarative configuration,
//! keeps them alive, and routes topic-addressed messages between them
//! over per-host pipes. A single orchestrator task drives reconciliation
//! through an explicit state machine.

pub mod backoff;
pub mod instance;
pub mod orchestrator;
pub mod platform;
pub mod router;
pub mod transport;

pub use instance::{ChildProcessInstance, InstanceContext, InstanceId, LaunchReason, PublishOutcome};
pub use orchestrator::{BrokerStatus, InstanceSummary, MachineState, Orchestrator, OrchestratorHandle};
pub use platform::{NativePlatform, Platform};
pub use router::SubscriptionTable;
