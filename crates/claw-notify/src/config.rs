//! Configuration resolution.
//!
//! Every setting is resolved in the same order: an explicit value passed to the
//! builder, then a named environment variable, then a default. Resolution runs
//! once per invocation and produces an immutable [`NotifyConfig`]; nothing
//! downstream reads the process environment.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NotifyError, Result};
use crate::types::Severity;

/// Environment variable names consulted during resolution.
pub mod env {
    /// Validated outbound sender address.
    pub const SENDER_ADDRESS: &str = "NOTIFY_SENDER_ADDRESS";
    /// Chat channel address.
    pub const CHANNEL_ADDRESS: &str = "NOTIFY_CHANNEL_ADDRESS";
    /// Minimum severity that triggers a notification.
    pub const ENABLED_LEVEL: &str = "NOTIFY_ENABLED_LEVEL";
    /// Comma-delimited subscriber addresses.
    pub const SUBSCRIBERS: &str = "NOTIFY_SUBSCRIBERS";
    /// Account label shown in notifications.
    pub const ACCOUNT_LABEL: &str = "NOTIFY_ACCOUNT_LABEL";
    /// Link to the workload's source.
    pub const SOURCE_LINK: &str = "NOTIFY_SOURCE_LINK";
    /// Region the workload runs in.
    pub const REGION: &str = "NOTIFY_REGION";
    /// Region fallback set by most cloud runtimes.
    pub const RUNTIME_REGION: &str = "AWS_REGION";
    /// Display label for the workload's log group.
    pub const LOG_GROUP_LABEL: &str = "NOTIFY_LOG_GROUP_LABEL";
    /// Delivery strategy (`immediate` or `batched`).
    pub const DELIVERY: &str = "NOTIFY_DELIVERY";
}

/// Maximum length for an address (RFC 5321 path limit).
const MAX_ADDRESS_LENGTH: usize = 254;

/// Regex for plausible mail-style addresses.
static ADDRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^@\s,;<>]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .unwrap_or_else(|_| unreachable!())
});

/// Source of environment values.
pub trait EnvSource: Send + Sync {
    /// Returns the value of `key`, if set.
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// A fixed set of environment values.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

/// How notifications are delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStrategy {
    /// One transport call per notification, at the point the record is logged.
    #[default]
    Immediate,
    /// Accumulate during the invocation and send in bulk when it ends.
    Batched,
}

impl DeliveryStrategy {
    /// Returns the strategy as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Batched => "batched",
        }
    }
}

impl fmt::Display for DeliveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStrategy {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" | "individual" => Ok(Self::Immediate),
            "batched" | "batch" | "bulk" => Ok(Self::Batched),
            other => Err(NotifyError::invalid_setting(
                "delivery",
                format!("unknown delivery strategy '{other}'"),
            )),
        }
    }
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Validated sender address.
    pub sender_address: String,
    /// Chat channel address.
    pub channel_address: String,
    /// Minimum severity that triggers a notification.
    pub enabled_level: Severity,
    /// Subscriber addresses (may be empty).
    pub subscriber_addresses: Vec<String>,
    /// Account label, if configured.
    pub account_label: Option<String>,
    /// Link to the workload's source, if configured.
    pub source_link: Option<String>,
    /// Region the workload runs in, if known.
    pub execution_region: Option<String>,
    /// Log group display label, if configured.
    pub log_group_label: Option<String>,
    /// Delivery strategy.
    pub delivery: DeliveryStrategy,
}

impl NotifyConfig {
    /// Returns true if subscriber notifications can be produced.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        !self.subscriber_addresses.is_empty()
    }
}

/// Explicitly provided settings. Unset fields fall back to the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Sender address.
    pub sender_address: Option<String>,
    /// Chat channel address.
    pub channel_address: Option<String>,
    /// Notification threshold.
    pub enabled_level: Option<Severity>,
    /// Subscriber addresses.
    pub subscriber_addresses: Option<Vec<String>>,
    /// Account label.
    pub account_label: Option<String>,
    /// Source link.
    pub source_link: Option<String>,
    /// Execution region.
    pub execution_region: Option<String>,
    /// Log group label.
    pub log_group_label: Option<String>,
    /// Delivery strategy.
    pub delivery: Option<DeliveryStrategy>,
}

impl ConfigOverrides {
    /// Resolves the configuration against an environment.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::MissingSetting` when the sender or channel address
    /// is absent, and `NotifyError::InvalidSetting` when a provided value
    /// cannot be parsed or validated.
    pub fn resolve(&self, source: &dyn EnvSource) -> Result<NotifyConfig> {
        let sender_address = required(
            self.sender_address.as_deref(),
            source,
            "sender_address",
            env::SENDER_ADDRESS,
        )?;
        validate_address("sender_address", &sender_address)?;

        let channel_address = required(
            self.channel_address.as_deref(),
            source,
            "channel_address",
            env::CHANNEL_ADDRESS,
        )?;

        let enabled_level = match self.enabled_level {
            Some(level) => level,
            None => match non_empty(source.var(env::ENABLED_LEVEL)) {
                Some(raw) => raw.parse()?,
                None => Severity::default(),
            },
        };

        let subscriber_addresses = match &self.subscriber_addresses {
            Some(list) => clean_subscribers(list.iter().map(String::as_str)),
            None => source
                .var(env::SUBSCRIBERS)
                .map(|raw| parse_subscribers(&raw))
                .unwrap_or_default(),
        };

        let delivery = match self.delivery {
            Some(delivery) => delivery,
            None => match non_empty(source.var(env::DELIVERY)) {
                Some(raw) => raw.parse()?,
                None => DeliveryStrategy::default(),
            },
        };

        Ok(NotifyConfig {
            sender_address,
            channel_address,
            enabled_level,
            subscriber_addresses,
            account_label: optional(self.account_label.as_deref(), source, env::ACCOUNT_LABEL),
            source_link: optional(self.source_link.as_deref(), source, env::SOURCE_LINK),
            execution_region: optional(self.execution_region.as_deref(), source, env::REGION)
                .or_else(|| non_empty(source.var(env::RUNTIME_REGION))),
            log_group_label: optional(
                self.log_group_label.as_deref(),
                source,
                env::LOG_GROUP_LABEL,
            ),
            delivery,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn optional(explicit: Option<&str>, source: &dyn EnvSource, var: &str) -> Option<String> {
    non_empty(explicit.map(str::to_string)).or_else(|| non_empty(source.var(var)))
}

fn required(
    explicit: Option<&str>,
    source: &dyn EnvSource,
    name: &'static str,
    env_var: &'static str,
) -> Result<String> {
    optional(explicit, source, env_var).ok_or(NotifyError::MissingSetting { name, env_var })
}

/// Checks that `address` looks like a deliverable address.
///
/// # Errors
///
/// Returns `NotifyError::InvalidSetting` naming `field` if it does not.
pub fn validate_address(field: &'static str, address: &str) -> Result<()> {
    if address.len() > MAX_ADDRESS_LENGTH {
        return Err(NotifyError::invalid_setting(
            field,
            format!(
                "address is {} characters, maximum is {MAX_ADDRESS_LENGTH}",
                address.len()
            ),
        ));
    }
    if !ADDRESS_REGEX.is_match(address) {
        return Err(NotifyError::invalid_setting(
            field,
            format!("'{address}' is not a valid address"),
        ));
    }
    Ok(())
}

/// Parses a comma-delimited subscriber list.
///
/// Blank entries are ignored; malformed entries are dropped with a warning so
/// one typo does not silence every other subscriber.
#[must_use]
pub fn parse_subscribers(raw: &str) -> Vec<String> {
    clean_subscribers(raw.split(','))
}

fn clean_subscribers<'a>(entries: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in entries.map(str::trim).filter(|e| !e.is_empty()) {
        if let Err(e) = validate_address("subscriber_addresses", entry) {
            warn!(subscriber = %entry, error = %e, "dropping malformed subscriber address");
            continue;
        }
        if !out.iter().any(|existing| existing == entry) {
            out.push(entry.to_string());
        }
    }
    out
}
