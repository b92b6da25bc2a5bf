//! Core types for the notification pipeline.
//!
//! This module provides the fundamental types used throughout the claw-notify crate:
//! - [`Severity`]: Ordered severity of a log record
//! - [`ErrorContext`]: Structured error information attached to a record
//! - [`LogRecord`]: A captured log event
//! - [`Destination`] and [`TemplateId`]: Where a notification goes and how it is rendered
//! - [`NotificationEnvelope`]: A rendered notification awaiting delivery
//! - [`OutboundMessage`]: A single message handed to the transport

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::NotifyError;

/// Severity of a log record, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Debugging detail.
    Debug = 0,
    /// Routine information.
    Info = 1,
    /// Something unexpected that the workload recovered from.
    #[default]
    Warning = 2,
    /// An operation failed.
    Error = 3,
    /// The workload itself failed.
    Critical = 4,
}

impl Severity {
    /// All severities in ascending order.
    pub const ALL: [Self; 5] = [
        Self::Debug,
        Self::Info,
        Self::Warning,
        Self::Error,
        Self::Critical,
    ];

    /// Returns the severity as an upper-case label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// Maps a `tracing` level onto a severity.
    ///
    /// `tracing` has no level above `ERROR`; critical records come from the
    /// `critical = true` event field or from the wrapper itself.
    #[must_use]
    pub fn from_level(level: &Level) -> Self {
        if *level == Level::ERROR {
            Self::Error
        } else if *level == Level::WARN {
            Self::Warning
        } else if *level == Level::INFO {
            Self::Info
        } else {
            Self::Debug
        }
    }

    /// Returns the least severe `tracing` level that maps to this severity or above.
    #[must_use]
    pub const fn min_level(&self) -> Level {
        match self {
            Self::Debug => Level::TRACE,
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => Err(NotifyError::invalid_setting(
                "enabled_level",
                format!("unknown severity '{other}'"),
            )),
        }
    }
}

/// Structured information about an error attached to a log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Short type name of the error (`"panic"` for panics).
    pub kind: String,
    /// The error's display message.
    pub message: String,
    /// Source chain and, when captured, a backtrace.
    pub stack_trace: String,
}

impl ErrorContext {
    /// Creates an error context from its parts.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            stack_trace: stack_trace.into(),
        }
    }

    /// Captures a typed error, using its type name as the kind.
    #[must_use]
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Self::from_dyn(err, Some(short_type_name(std::any::type_name::<E>())))
    }

    /// Captures a type-erased error. The kind defaults to `"Error"`.
    #[must_use]
    pub fn from_dyn(err: &(dyn std::error::Error + 'static), kind: Option<&str>) -> Self {
        let mut trace = source_chain(err);
        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            if !trace.is_empty() {
                trace.push('\n');
            }
            trace.push_str(&backtrace.to_string());
        }

        Self {
            kind: kind.unwrap_or("Error").to_string(),
            message: err.to_string(),
            stack_trace: trace,
        }
    }

    /// Captures a panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with a non-string payload".to_string());

        let backtrace = Backtrace::capture();
        let stack_trace = if backtrace.status() == BacktraceStatus::Captured {
            backtrace.to_string()
        } else {
            String::new()
        };

        Self {
            kind: "panic".to_string(),
            message,
            stack_trace,
        }
    }
}

/// Strips the module path from a type name, keeping generic arguments intact.
fn short_type_name(full: &str) -> &str {
    let head_end = full.find('<').unwrap_or(full.len());
    let start = full[..head_end].rfind("::").map_or(0, |i| i + 2);
    &full[start..]
}

fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        lines.push(format!("  {}: {cause}", lines.len()));
        current = cause.source();
    }
    if lines.is_empty() {
        String::new()
    } else {
        format!("Caused by:\n{}", lines.join("\n"))
    }
}

/// A log event captured from the logging facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// Emission index within the interception scope that captured it.
    pub sequence: u64,
    /// Severity of the event.
    pub level: Severity,
    /// The rendered event message.
    pub message: String,
    /// The event target (module path or explicit target).
    pub logger: String,
    /// Remaining structured fields, rendered as text.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Attached error context, if any.
    pub error: Option<ErrorContext>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(level: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            sequence: 0,
            level,
            message: message.into(),
            logger: String::new(),
            fields: BTreeMap::new(),
            error: None,
        }
    }

    /// Sets the logger name.
    #[must_use]
    pub fn with_logger(mut self, logger: impl Into<String>) -> Self {
        self.logger = logger.into();
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Attaches an error context.
    #[must_use]
    pub fn with_error(mut self, error: ErrorContext) -> Self {
        self.error = Some(error);
        self
    }

    /// Adds a structured field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns true if an error context is attached.
    #[must_use]
    pub const fn has_error_context(&self) -> bool {
        self.error.is_some()
    }
}

/// Template identities known to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TemplateId {
    /// Template used for chat channel messages.
    #[serde(rename = "claw-notify-channel")]
    Channel,
    /// Template used for subscriber messages.
    #[serde(rename = "claw-notify-subscriber")]
    Subscriber,
}

impl TemplateId {
    /// Returns the template name as provisioned at the transport.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "claw-notify-channel",
            Self::Subscriber => "claw-notify-subscriber",
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a notification is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    /// The shared chat channel.
    Channel,
    /// The configured subscriber list.
    Subscribers,
}

impl Destination {
    /// Returns the template this destination is rendered with.
    #[must_use]
    pub const fn template(&self) -> TemplateId {
        match self {
            Self::Channel => TemplateId::Channel,
            Self::Subscribers => TemplateId::Subscriber,
        }
    }

    /// Returns the destination as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Subscribers => "subscribers",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rendered notification owned by a dispatcher until it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    /// Where the notification goes.
    pub destination: Destination,
    /// Addresses it is delivered to.
    pub recipients: Vec<String>,
    /// Rendered subject line.
    pub subject: String,
    /// Template fields.
    pub fields: BTreeMap<String, String>,
    /// Emission time of the record this notification was rendered from.
    pub source_timestamp: DateTime<Utc>,
    /// Emission index of the source record.
    pub sequence: u64,
}

impl NotificationEnvelope {
    /// Returns the template used to deliver this envelope.
    #[must_use]
    pub const fn template(&self) -> TemplateId {
        self.destination.template()
    }

    /// Builds a single message addressed to every recipient.
    #[must_use]
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage {
            to: self.recipients.clone(),
            subject: self.subject.clone(),
            fields: self.fields.clone(),
        }
    }

    /// Builds one message per recipient, for bulk delivery.
    #[must_use]
    pub fn to_messages_per_recipient(&self) -> Vec<OutboundMessage> {
        self.recipients
            .iter()
            .map(|to| OutboundMessage {
                to: vec![to.clone()],
                subject: self.subject.clone(),
                fields: self.fields.clone(),
            })
            .collect()
    }
}

/// A single message handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Destination addresses.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Template fields.
    pub fields: BTreeMap<String, String>,
}
