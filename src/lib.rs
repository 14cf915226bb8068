//! # memq
//!
//! `memq` moves memory-extraction work off the request path. Producers publish
//! small JSON messages to a durable direct exchange on an AMQP broker, and a
//! worker consumes them from a durable queue and hands each one to a memory
//! processor, acknowledging only after processing finishes.
//!
//! ## Core Modules
//!
//! - `broker`: The broker seam (`Connector`/`BrokerConnection`/`BrokerChannel`), the fixed topology,
//!   the `lapin` backend and an embedded in-process broker.
//! - `client`: The lazily (re)connecting `ConnectionManager` and the `Producer` built on it.
//! - `config`: Loads settings from `config/default.*` and `MEMQ_*` environment variables.
//! - `consumer`: The manual-ack `Consumer` loop and the `MemoryProcessor` callback boundary.
//! - `persistence`: `sled`-backed storage that lets the embedded broker survive a restart.
//! - `transport`: The `MemoryMessage` wire format.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod persistence;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
