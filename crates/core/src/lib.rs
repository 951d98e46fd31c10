//! `datlake-core`: shared identifiers and error types.
//!
//! This crate contains **pure** primitives (no IO, no async) shared by the
//! event model, the queue processor and the streaming layer.

pub mod error;
pub mod id;

pub use error::CoreError;
pub use id::{EventId, MessageId, ProbeId, SessionId};
