//! Validation messages and results.
//!
//! Validators write into a [`MessageCollector`]. Once every validator has run,
//! the collector is frozen into a [`ValidationResult`], which never changes
//! afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Severity of a user-facing validation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub level: MessageLevel,
    pub text: String,
    /// Nesting depth, used when rendering messages as an indented tree.
    pub depth: u16,
}

/// Immutable outcome of running zero or more validators.
///
/// `is_success()` holds exactly when no message has level [`MessageLevel::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    success: bool,
    messages: Vec<ValidationMessage>,
}

impl ValidationResult {
    /// A successful result with no messages.
    pub fn success() -> Self {
        Self {
            success: true,
            messages: Vec::new(),
        }
    }

    /// Build a result from a snapshot of messages.
    pub fn from_messages(messages: impl IntoIterator<Item = ValidationMessage>) -> Self {
        let messages: Vec<_> = messages.into_iter().collect();
        let success = !messages.iter().any(|m| m.level == MessageLevel::Error);
        Self { success, messages }
    }

    /// Shorthand for a failed result carrying a single error.
    pub fn error(text: impl Into<String>) -> Self {
        Self::from_messages([ValidationMessage {
            level: MessageLevel::Error,
            text: text.into(),
            depth: 0,
        }])
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn messages(&self) -> &[ValidationMessage] {
        &self.messages
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.level == MessageLevel::Error)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success && self.messages.is_empty() {
            return f.write_str("ok");
        }
        let mut first = true;
        for message in &self.messages {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "[{}] {}", message.level, message.text)?;
        }
        Ok(())
    }
}

/// Collects `(level, text)` entries while validators run.
#[derive(Debug, Default)]
pub struct MessageCollector {
    messages: SmallVec<[ValidationMessage; 4]>,
    depth: u16,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: MessageLevel, text: impl Into<String>) {
        self.messages.push(ValidationMessage {
            level,
            text: text.into(),
            depth: self.depth,
        });
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.push(MessageLevel::Info, text);
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        self.push(MessageLevel::Warn, text);
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.push(MessageLevel::Error, text);
    }

    /// Run `f` with messages recorded one level deeper.
    pub fn nested<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.depth = self.depth.saturating_add(1);
        let out = f(self);
        self.depth = self.depth.saturating_sub(1);
        out
    }

    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|m| m.level == MessageLevel::Error)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Freeze the collected messages.
    pub fn finish(self) -> ValidationResult {
        ValidationResult::from_messages(self.messages)
    }
}
