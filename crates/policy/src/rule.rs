//! Classification rules

use fanwatch_core::{Action, ActionKind, EventMask, EventRecord};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::fmt;
use thiserror::Error;

/// A classification rule
///
/// Rules are pure functions of the record's mask, path and directory flag.
/// Lower `priority` values are consulted first.
pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    /// The action this rule takes for `record`, if it applies
    fn matches(&self, record: &EventRecord) -> Option<Action>;
}

/// Errors building a rule
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{rule}' has an invalid pattern: {source}")]
    Pattern {
        rule: String,
        #[source]
        source: ignore::Error,
    },

    #[error("rule '{0}' has no path patterns")]
    NoPatterns(String),

    #[error("rule '{0}' selects no events")]
    NoEvents(String),
}

/// Declarative rule: gitignore-style path patterns plus an event filter
///
/// Patterns are rooted at `/`, so `/etc/shadow` names one file,
/// `authorized_keys` matches that file name anywhere and `/tmp/` matches
/// everything below `/tmp`.
pub struct PathRule {
    name: String,
    priority: i32,
    matcher: Gitignore,
    patterns: Vec<String>,
    events: EventMask,
    directories: Option<bool>,
    kind: ActionKind,
    reason: String,
}

impl PathRule {
    pub fn builder(name: impl Into<String>) -> PathRuleBuilder {
        PathRuleBuilder::new(name)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn events(&self) -> EventMask {
        self.events
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    fn path_matches(&self, record: &EventRecord) -> bool {
        let path = record.path();
        // The matcher only accepts paths below its root
        path.is_absolute()
            && self
                .matcher
                .matched_path_or_any_parents(path, record.is_directory)
                .is_ignore()
    }
}

impl Rule for PathRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn matches(&self, record: &EventRecord) -> Option<Action> {
        if !record.mask.intersects(self.events) {
            return None;
        }
        if let Some(directories) = self.directories {
            if record.is_directory != directories {
                return None;
            }
        }
        if !self.path_matches(record) {
            return None;
        }

        Some(Action::new(self.kind, record.clone(), self.reason.clone()).with_rule(self.name.clone()))
    }
}

impl fmt::Debug for PathRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("patterns", &self.patterns)
            .field("events", &self.events)
            .field("directories", &self.directories)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Builder for `PathRule`
#[derive(Debug, Clone)]
pub struct PathRuleBuilder {
    name: String,
    priority: i32,
    patterns: Vec<String>,
    events: EventMask,
    directories: Option<bool>,
    kind: ActionKind,
    reason: Option<String>,
}

impl PathRuleBuilder {
    /// Defaults: priority 100, every event, files and directories, `Alert`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 100,
            patterns: Vec::new(),
            events: EventMask::full_coverage().events(),
            directories: None,
            kind: ActionKind::Alert,
            reason: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Fire on any of these events
    pub fn events(mut self, events: EventMask) -> Self {
        self.events = events;
        self
    }

    /// Restrict to directories (`true`) or non-directories (`false`)
    pub fn directories(mut self, directories: bool) -> Self {
        self.directories = Some(directories);
        self
    }

    pub fn action(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn build(self) -> Result<PathRule, RuleError> {
        if self.patterns.is_empty() {
            return Err(RuleError::NoPatterns(self.name));
        }
        let events = self.events.events();
        if events.is_empty() {
            return Err(RuleError::NoEvents(self.name));
        }

        let mut builder = GitignoreBuilder::new("/");
        for pattern in &self.patterns {
            if let Err(source) = builder.add_line(None, pattern) {
                return Err(RuleError::Pattern {
                    rule: self.name,
                    source,
                });
            }
        }
        let matcher = match builder.build() {
            Ok(matcher) => matcher,
            Err(source) => {
                return Err(RuleError::Pattern {
                    rule: self.name,
                    source,
                })
            }
        };

        let reason = self
            .reason
            .unwrap_or_else(|| format!("matched rule {}", self.name));

        Ok(PathRule {
            name: self.name,
            priority: self.priority,
            matcher,
            patterns: self.patterns,
            events,
            directories: self.directories,
            kind: self.kind,
            reason,
        })
    }
}

/// Rule backed by a closure returning the action kind and reason
pub struct FnRule<F> {
    name: String,
    priority: i32,
    f: F,
}

impl<F> FnRule<F>
where
    F: Fn(&EventRecord) -> Option<(ActionKind, String)> + Send + Sync,
{
    pub fn new(name: impl Into<String>, priority: i32, f: F) -> Self {
        Self {
            name: name.into(),
            priority,
            f,
        }
    }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(&EventRecord) -> Option<(ActionKind, String)> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn matches(&self, record: &EventRecord) -> Option<Action> {
        (self.f)(record).map(|(kind, reason)| {
            Action::new(kind, record.clone(), reason).with_rule(self.name.clone())
        })
    }
}
