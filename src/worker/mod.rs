//! Worker layer
//!
//! Pipelines run in isolated worker contexts reached only by messages.

pub mod context;
pub mod orchestrator;
pub mod protocol;
pub mod router;

pub use context::{WorkerContext, WorkerHandler, WorkerInit};
pub use orchestrator::{HandshakeTimeouts, WorkerOrchestrator};
pub use protocol::{Op, WorkerRequest, WorkerResponse};
pub use router::RouterHandle;
