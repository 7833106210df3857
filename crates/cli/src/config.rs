//! Monitor configuration
//!
//! Loaded from a TOML file:
//!
//! ```toml
//! [monitor]
//! poll_timeout_ms = 500
//!
//! [[watch]]
//! path = "/etc"
//! events = ["modify", "create", "delete", "move"]
//! recursive = true
//!
//! [[rule]]
//! name = "web-root-write"
//! patterns = ["/srv/www/"]
//! events = ["create", "modify"]
//! action = "alert"
//! ```

use anyhow::{Context, Result};
use fanwatch_core::{ActionKind, EventMask};
use journal::RetentionPolicy;
use policy::{default_rules, Engine, OverflowPolicy, PathRule, Rule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use watcher::{DecodeLimits, DispatchConfig};

/// Default journal location when none is configured
pub const DEFAULT_JOURNAL_PATH: &str = "/var/lib/fanwatch/journal";

/// Smallest decoder record limit that still fits a record with a name
const MIN_RECORD_LEN: usize = 256;

/// Configuration problems found by `validate`
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no [[watch]] entries configured")]
    NoWatches,

    #[error("watch path must be absolute: {}", .0.display())]
    RelativeWatchPath(PathBuf),

    #[error("watch {}: {source}", .path.display())]
    WatchEvents {
        path: PathBuf,
        #[source]
        source: fanwatch_core::ParseMaskError,
    },

    #[error("rule '{rule}': {source}")]
    RuleEvents {
        rule: String,
        #[source]
        source: fanwatch_core::ParseMaskError,
    },

    #[error(transparent)]
    Rule(#[from] policy::RuleError),

    #[error("duplicate rule name '{0}'")]
    DuplicateRule(String),

    #[error("monitor.max_record_len must be at least 256 (got {0})")]
    RecordLimit(usize),

    #[error("monitor.read_buffer_size ({buffer}) must be at least monitor.max_record_len ({limit})")]
    ReadBuffer { buffer: usize, limit: usize },

    #[error("unknown log level '{0}'")]
    LogLevel(String),
}

/// Full monitor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub monitor: MonitorSection,
    pub sink: SinkSection,
    pub policy: PolicySection,
    #[serde(rename = "watch")]
    pub watches: Vec<WatchConfig>,
    #[serde(rename = "rule")]
    pub rules: Vec<RuleConfig>,
    pub journal: JournalSection,
    pub logging: LoggingSection,
}

/// `[monitor]`: dispatch loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSection {
    pub poll_timeout_ms: u64,
    pub read_buffer_size: usize,
    /// Capacity of the dispatch -> engine channel
    pub channel_capacity: usize,
    pub reconcile_interval_secs: u64,
    pub max_record_len: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 500,
            read_buffer_size: 64 * 1024,
            channel_capacity: 1024,
            reconcile_interval_secs: 30,
            max_record_len: watcher::decode::DEFAULT_MAX_RECORD_LEN,
        }
    }
}

/// `[sink]`: action channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkSection {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            capacity: 1024,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// `[policy]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    /// Load the built-in presets ahead of configured rules
    pub builtin_rules: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self { builtin_rules: true }
    }
}

/// `[[watch]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    pub path: PathBuf,
    /// Event names; empty means full coverage
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
}

/// `[[rule]]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default = "default_rule_priority")]
    pub priority: i32,
    pub patterns: Vec<String>,
    /// Event names; empty means any event
    #[serde(default)]
    pub events: Vec<String>,
    /// Restrict to directories (true) or files (false)
    #[serde(default)]
    pub directories: Option<bool>,
    #[serde(default = "default_rule_action")]
    pub action: ActionKind,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_rule_priority() -> i32 {
    100
}

fn default_rule_action() -> ActionKind {
    ActionKind::Alert
}

/// `[journal]`: action archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JournalSection {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub retain_count: usize,
}

impl Default for JournalSection {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            retain_count: RetentionPolicy::default().retain_count,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: String,
    /// Log to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl MonitorConfig {
    /// Read, default and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Parse, default and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text).context("Failed to parse TOML")?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Replace zero or missing values with defaults
    pub fn apply_defaults(&mut self) {
        let defaults = MonitorSection::default();
        if self.monitor.poll_timeout_ms == 0 {
            self.monitor.poll_timeout_ms = defaults.poll_timeout_ms;
        }
        if self.monitor.read_buffer_size == 0 {
            self.monitor.read_buffer_size = defaults.read_buffer_size;
        }
        if self.monitor.channel_capacity == 0 {
            self.monitor.channel_capacity = defaults.channel_capacity;
        }
        if self.monitor.reconcile_interval_secs == 0 {
            self.monitor.reconcile_interval_secs = defaults.reconcile_interval_secs;
        }
        if self.monitor.max_record_len == 0 {
            self.monitor.max_record_len = defaults.max_record_len;
        }
        if self.sink.capacity == 0 {
            self.sink.capacity = SinkSection::default().capacity;
        }
        if self.journal.retain_count == 0 {
            self.journal.retain_count = JournalSection::default().retain_count;
        }
        if self.journal.enabled && self.journal.path.is_none() {
            self.journal.path = Some(PathBuf::from(DEFAULT_JOURNAL_PATH));
        }
        if self.logging.level.trim().is_empty() {
            self.logging.level = LoggingSection::default().level;
        }
    }

    /// Check everything that can be checked without touching the kernel
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watches.is_empty() {
            return Err(ConfigError::NoWatches);
        }
        self.watch_specs()?;

        if self.monitor.max_record_len < MIN_RECORD_LEN {
            return Err(ConfigError::RecordLimit(self.monitor.max_record_len));
        }
        if self.monitor.read_buffer_size < self.monitor.max_record_len {
            return Err(ConfigError::ReadBuffer {
                buffer: self.monitor.read_buffer_size,
                limit: self.monitor.max_record_len,
            });
        }

        self.log_level()?;
        self.build_rules()?;
        Ok(())
    }

    /// Watches as (path, mask, recursive)
    pub fn watch_specs(&self) -> Result<Vec<(PathBuf, EventMask, bool)>, ConfigError> {
        self.watches
            .iter()
            .map(|watch| {
                if !watch.path.is_absolute() {
                    return Err(ConfigError::RelativeWatchPath(watch.path.clone()));
                }
                let mask = if watch.events.is_empty() {
                    EventMask::full_coverage()
                } else {
                    EventMask::parse_list(&watch.events).map_err(|source| ConfigError::WatchEvents {
                        path: watch.path.clone(),
                        source,
                    })?
                };
                Ok((watch.path.clone(), mask, watch.recursive))
            })
            .collect()
    }

    /// Built-in presets (if enabled) followed by configured rules
    pub fn build_rules(&self) -> Result<Vec<Box<dyn Rule>>, ConfigError> {
        let mut rules = if self.policy.builtin_rules {
            default_rules()?
        } else {
            Vec::new()
        };

        for config in &self.rules {
            if rules.iter().any(|rule| rule.name() == config.name) {
                return Err(ConfigError::DuplicateRule(config.name.clone()));
            }

            let mut builder = PathRule::builder(&config.name)
                .priority(config.priority)
                .patterns(config.patterns.iter().cloned())
                .action(config.action);
            if !config.events.is_empty() {
                let events = EventMask::parse_list(&config.events).map_err(|source| {
                    ConfigError::RuleEvents {
                        rule: config.name.clone(),
                        source,
                    }
                })?;
                builder = builder.events(events);
            }
            if let Some(directories) = config.directories {
                builder = builder.directories(directories);
            }
            if let Some(reason) = &config.reason {
                builder = builder.reason(reason);
            }
            rules.push(Box::new(builder.build()?));
        }

        Ok(rules)
    }

    /// Decision engine over `build_rules`
    pub fn build_engine(&self) -> Result<Engine, ConfigError> {
        Ok(Engine::new(self.build_rules()?))
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            poll_timeout: Duration::from_millis(self.monitor.poll_timeout_ms),
            read_buffer_size: self.monitor.read_buffer_size,
            limits: DecodeLimits {
                max_record_len: self.monitor.max_record_len,
                ..DecodeLimits::default()
            },
        }
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.reconcile_interval_secs)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            retain_count: self.journal.retain_count,
            ..RetentionPolicy::default()
        }
    }

    /// Configured log level
    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        self.logging
            .level
            .parse()
            .map_err(|_| ConfigError::LogLevel(self.logging.level.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[watch]]
        path = "/etc"
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = MonitorConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.monitor, MonitorSection::default());
        assert_eq!(config.sink.overflow, OverflowPolicy::Block);
        assert!(config.policy.builtin_rules);
        assert!(!config.journal.enabled);

        let specs = config.watch_specs().unwrap();
        assert_eq!(
            specs,
            vec![(PathBuf::from("/etc"), EventMask::full_coverage(), false)]
        );
    }

    #[test]
    fn test_full_config() {
        let config = MonitorConfig::from_toml_str(
            r#"
            [monitor]
            poll_timeout_ms = 0
            channel_capacity = 16

            [sink]
            capacity = 8
            overflow = "drop-oldest"

            [policy]
            builtin_rules = false

            [[watch]]
            path = "/srv/www"
            events = ["create", "modify", "move"]
            recursive = true

            [[rule]]
            name = "web-root-write"
            priority = 5
            patterns = ["/srv/www/"]
            events = ["create"]
            directories = false
            action = "deny"
            reason = "new file in web root"

            [journal]
            enabled = true
            retain_count = 50

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.poll_timeout_ms, 500);
        assert_eq!(config.monitor.channel_capacity, 16);
        assert_eq!(config.sink.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.journal.path, Some(PathBuf::from(DEFAULT_JOURNAL_PATH)));
        assert_eq!(config.retention().retain_count, 50);
        assert_eq!(config.log_level().unwrap(), tracing::Level::DEBUG);

        let (_, mask, recursive) = config.watch_specs().unwrap().remove(0);
        assert!(recursive);
        assert_eq!(
            mask,
            EventMask::CREATE | EventMask::MODIFY | EventMask::MOVED_FROM | EventMask::MOVED_TO
        );

        let engine = config.build_engine().unwrap();
        assert_eq!(engine.rule_names(), vec!["web-root-write"]);
    }

    #[test]
    fn test_builtin_rules_precede_by_priority() {
        let config = MonitorConfig::from_toml_str(
            r#"
            [[watch]]
            path = "/"

            [[rule]]
            name = "first"
            priority = -1
            patterns = ["*"]
            "#,
        )
        .unwrap();

        let engine = config.build_engine().unwrap();
        assert_eq!(engine.rule_names()[0], "first");
        assert_eq!(engine.len(), 4);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            ("", "no [[watch]]"),
            ("[[watch]]\npath = \"etc\"", "absolute"),
            ("[[watch]]\npath = \"/etc\"\nevents = [\"explode\"]", "explode"),
            (
                "[[watch]]\npath = \"/etc\"\n[[rule]]\nname = \"r\"\npatterns = []",
                "no path patterns",
            ),
            (
                "[[watch]]\npath = \"/etc\"\n[monitor]\nread_buffer_size = 1024\nmax_record_len = 4096",
                "read_buffer_size",
            ),
            ("[[watch]]\npath = \"/etc\"\n[logging]\nlevel = \"loud\"", "log level"),
        ];

        for (text, expected) in cases {
            let err = MonitorConfig::from_toml_str(text).unwrap_err();
            let message = format!("{:#}", err);
            assert!(message.contains(expected), "{:?} -> {}", text, message);
        }
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(MonitorConfig::from_toml_str("[[watch]]\npath = \"/etc\"\nrecursve = true").is_err());
    }

    #[test]
    fn test_duplicate_rule_name() {
        let err = MonitorConfig::from_toml_str(
            r#"
            [[watch]]
            path = "/etc"

            [[rule]]
            name = "exec-from-temp"
            patterns = ["/opt/"]
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate rule name"));
    }
}
