//! In-process reference backends for every client port.
//!
//! Each one honours its port's contract closely enough to run the adapters
//! end to end without a network: partitions and consumer groups, prefetch
//! and requeue, session loss and clean-session resubscription.

pub mod log;
pub mod queue;
pub mod session;

pub use log::MemoryLogCluster;
pub use queue::MemoryQueueBroker;
pub use session::{MemorySessionBroker, MemorySessionClient};
