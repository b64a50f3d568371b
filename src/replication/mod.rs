//! Replication Layer
//!
//! The shared operation log and the per-replica work queue derived from
//! it. Each replica appends GET/MERGE entries to its own log in the
//! coordinator; every replica merges all logs into its queue in
//! coordinator-timestamp order and executes them.

pub mod entry;
pub mod queue;

pub use entry::{LogEntry, QueueEntry};
pub use queue::ReplicationQueue;
