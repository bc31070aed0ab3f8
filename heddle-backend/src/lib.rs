//! Backend contract for the heddle workflow engine, plus the in-memory
//! reference implementation.
//!
//! A backend brokers workflow and activity tasks and persists event history.
//! Implementations must make every completion operation a single atomic
//! transition (one transaction, or an equivalent compare-and-set chain);
//! the engine's durability guarantees collapse otherwise.
//!
//! # Implementing a driver
//!
//! 1. Implement [`Backend`] for your storage.
//! 2. Keep `complete_workflow_task` atomic: history append, activity
//!    enqueue, pending timer storage, message routing and lease release
//!    happen together or not at all.
//! 3. Honor `visible_at`: an event must not reach a worker early.
//! 4. Enforce single-writer per instance through leases.

mod backend;
mod in_memory;

pub use backend::{Backend, BackendError};
pub use in_memory::InMemoryBackend;
