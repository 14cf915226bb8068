//! The `consumer` module is the worker side of the pipeline: it drains the
//! memory queue and hands each message to a memory processor.

pub mod processor;
pub mod worker;

pub use processor::{FnProcessor, JournalProcessor, MemoryProcessor};
pub use worker::{Consumer, ConsumerState, ConsumerStats, Disposition};
