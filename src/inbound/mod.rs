//! Inbound coordinator — admission, FIFO queueing, duplicate suppression,
//! batching and overload shedding, one ordered stream per contact.

pub mod coordinator;
pub mod lock;
pub mod model;
pub mod sweeper;

pub use coordinator::InboundCoordinator;
pub use lock::{InMemoryLockProvider, LeaseToken, LockProvider};
pub use model::{
    CoordinatorStats, DequeuedItem, EnqueueOutcome, InboundMessage, QueueEvent, QueueItem,
};
pub use sweeper::spawn_sweep_tasks;
