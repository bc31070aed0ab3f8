//! Deterministic synchronization primitives for workflow code: the
//! cooperative scheduler, single-assignment futures, channels, and select.

pub(crate) mod channel;
pub(crate) mod future;
pub(crate) mod scheduler;
pub(crate) mod select;

pub use channel::{Channel, ReceiveFuture};
pub use future::WorkflowFuture;
pub use scheduler::YieldNow;
pub use select::Selector;
