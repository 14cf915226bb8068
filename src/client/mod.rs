//! The `client` module is the producer side of the pipeline.
//!
//! - `connection`: the lazily created, reusable broker connection/channel
//! - `producer`: persistent publishing of memory messages
//! - `dispatch`: background sends for callers that must not block

pub mod connection;
pub mod dispatch;
pub mod producer;

pub use connection::ConnectionManager;
pub use dispatch::{SendReport, SendStatus, spawn_send};
pub use producer::Producer;

#[cfg(test)]
mod tests;
