//! Event-driven observability for the orchestration core.
//!
//! Three pieces: event types (`types.rs`), the broadcast bus (`bus.rs`),
//! and nothing else — history/replay is a consumer's concern, not this
//! module's, so subscribers that need durability persist what they
//! receive themselves.
//!
//! ```ignore
//! let bus = EventBus::new().shared();
//! let mut receiver = bus.subscribe();
//!
//! bus.publish(OrchestratorEvent::TaskStarted {
//!     project_id: "p1".to_string(),
//!     task_id: "t1".to_string(),
//!     timestamp: Utc::now(),
//! })?;
//!
//! let event = receiver.recv().await?;
//! ```

pub mod bus;
pub mod types;

pub use bus::{
    EventBus, EventBusError, EventBusExt, EventBusResult, EventFilter, FilteredReceiver,
    SharedEventBus,
};
pub use types::{CheckpointFailure, EventId, OrchestratorEvent, TerminationReason};
