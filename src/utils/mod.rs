//! The `utils` module provides shared pieces used across `memq`: the crate
//! error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
