//! Infrastructure layer: queue consumption, realtime broadcast, configuration
//! and runtime wiring.

pub mod broadcast;
pub mod config;
pub mod queue;
pub mod runtime;

pub use config::{ConfigError, Settings};
pub use runtime::CoreRuntime;
