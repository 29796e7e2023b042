//! Pipeline Orchestrator: filesystem watch events feed the scheduler,
//! worker pools drain it.

pub mod orchestrator;
pub mod watcher;

pub use orchestrator::Orchestrator;
pub use watcher::{WatchEvent, Watcher};
