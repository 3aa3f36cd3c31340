//! Shared error definitions and utilities used across all AgentIM crates.

pub mod error;

pub use error::{AgentimError, Error, FromMessage, Result};
