//! The `transport` module defines what travels over the broker: the JSON
//! message format shared by the producer and the consumer.

pub mod message;

pub use message::{DecodeError, MemoryMessage, MessageKind};
