//! The `persistence` module stores what must survive a restart of the
//! embedded broker: durable exchange/queue/binding declarations and the
//! persistent messages sitting in durable queues.
//!
//! It uses `sled` as an embedded key-value store.

pub mod sled_store;

pub use sled_store::{BindingRecord, Persistence, StoredMessage};
