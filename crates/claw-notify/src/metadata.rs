//! Execution-context metadata.
//!
//! Notifications are more useful when they say which function, log group and
//! stream produced them. That information comes from the host and is strictly
//! best-effort: when it cannot be read the affected fields are left out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EnvSource;
use crate::error::{NotifyError, Result};

/// Identity of the host running the instrumented workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIdentity {
    /// Function or task name.
    pub function_name: Option<String>,
    /// Function or task version.
    pub function_version: Option<String>,
    /// Log group the workload writes to.
    pub log_group: Option<String>,
    /// Log stream the workload writes to.
    pub log_stream: Option<String>,
    /// Account label reported by the host.
    pub account_label: Option<String>,
}

impl HostIdentity {
    /// Returns true if no field is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.function_name.is_none()
            && self.function_version.is_none()
            && self.log_group.is_none()
            && self.log_stream.is_none()
            && self.account_label.is_none()
    }
}

/// Provider of execution-context metadata.
pub trait ExecutionMetadata: Send + Sync {
    /// Returns the host identity.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::MetadataUnavailable` if the host cannot be queried.
    fn host_identity(&self) -> Result<HostIdentity>;
}

/// Reads host identity from the variables serverless runtimes export.
#[derive(Clone)]
pub struct EnvMetadata {
    source: Arc<dyn EnvSource>,
}

impl EnvMetadata {
    /// Function name variable.
    pub const FUNCTION_NAME: &'static str = "AWS_LAMBDA_FUNCTION_NAME";
    /// Function version variable.
    pub const FUNCTION_VERSION: &'static str = "AWS_LAMBDA_FUNCTION_VERSION";
    /// Log group variable.
    pub const LOG_GROUP: &'static str = "AWS_LAMBDA_LOG_GROUP_NAME";
    /// Log stream variable.
    pub const LOG_STREAM: &'static str = "AWS_LAMBDA_LOG_STREAM_NAME";

    /// Creates a provider reading from `source`.
    #[must_use]
    pub fn new(source: Arc<dyn EnvSource>) -> Self {
        Self { source }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.source
            .var(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl std::fmt::Debug for EnvMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvMetadata").finish_non_exhaustive()
    }
}

impl ExecutionMetadata for EnvMetadata {
    fn host_identity(&self) -> Result<HostIdentity> {
        let identity = HostIdentity {
            function_name: self.get(Self::FUNCTION_NAME),
            function_version: self.get(Self::FUNCTION_VERSION),
            log_group: self.get(Self::LOG_GROUP),
            log_stream: self.get(Self::LOG_STREAM),
            account_label: None,
        };

        if identity.is_empty() {
            return Err(NotifyError::MetadataUnavailable {
                reason: "not running under a recognised function runtime".to_string(),
            });
        }
        Ok(identity)
    }
}

/// Returns a fixed identity.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    identity: HostIdentity,
}

impl StaticMetadata {
    /// Creates a provider that always returns `identity`.
    #[must_use]
    pub const fn new(identity: HostIdentity) -> Self {
        Self { identity }
    }
}

impl ExecutionMetadata for StaticMetadata {
    fn host_identity(&self) -> Result<HostIdentity> {
        Ok(self.identity.clone())
    }
}

/// A provider with nothing to report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

impl ExecutionMetadata for NoMetadata {
    fn host_identity(&self) -> Result<HostIdentity> {
        Err(NotifyError::MetadataUnavailable {
            reason: "no metadata provider configured".to_string(),
        })
    }
}
