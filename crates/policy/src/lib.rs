//! Classification policy for fanwatch
//!
//! This crate provides:
//! - The `Rule` trait with declarative path rules and closure rules
//! - Built-in presets for common host intrusion signals
//! - The decision engine that turns notifications into actions
//! - The action sink that carries actions to their consumers

pub mod builtin;
pub mod engine;
pub mod rule;
pub mod sink;

// Re-exports
pub use builtin::default_rules;
pub use engine::{Engine, EngineStats};
pub use rule::{FnRule, PathRule, PathRuleBuilder, Rule, RuleError};
pub use sink::{channel, drain, ActionHandler, ActionReceiver, ActionSender, DrainStats, OverflowPolicy, SinkClosed};
