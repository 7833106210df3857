//! fanwatch process boundary
//!
//! Configuration loading, action handlers and the thread wiring that
//! connects the watcher, policy and journal crates.

pub mod config;
pub mod handler;
pub mod monitor;
pub mod output;

// Re-exports
pub use config::{ConfigError, MonitorConfig};
pub use handler::{ConsoleHandler, JournalHandler, TracingHandler};
pub use monitor::{exit_code, register_watches, start, MonitorReport, RunningMonitor};
