//! Error types for the claw-notify crate.

use thiserror::Error;

/// Errors that can occur while resolving configuration or delivering
/// notifications.
///
/// None of these ever reach the instrumented workload: the wrapper logs them
/// through the original logging path and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// A required setting was not provided explicitly or through the environment.
    #[error("missing required setting '{name}' (set it explicitly or via {env_var})")]
    MissingSetting {
        /// The setting that is missing.
        name: &'static str,
        /// The environment variable consulted for it.
        env_var: &'static str,
    },

    /// A setting was provided but could not be used.
    #[error("invalid setting '{name}': {reason}")]
    InvalidSetting {
        /// The offending setting.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The transport does not know the referenced template.
    #[error(
        "notification template '{template}' does not exist; provision the notification templates before retrying"
    )]
    TemplateNotFound {
        /// The missing template identity.
        template: String,
    },

    /// The transport refused the sender or credentials.
    #[error("transport authorization failed: {reason}")]
    Unauthorized {
        /// The reason given by the transport.
        reason: String,
    },

    /// The transport could not be reached.
    #[error("transport unavailable: {reason}")]
    TransportUnavailable {
        /// The underlying failure.
        reason: String,
    },

    /// The transport asked us to slow down.
    #[error("transport throttled the request: {reason}")]
    Throttled {
        /// The reason given by the transport.
        reason: String,
    },

    /// The transport rejected the message itself.
    #[error("transport rejected the message: {reason}")]
    Rejected {
        /// The reason given by the transport.
        reason: String,
    },

    /// Execution-context metadata could not be retrieved.
    #[error("execution metadata unavailable: {reason}")]
    MetadataUnavailable {
        /// Why the metadata could not be read.
        reason: String,
    },

    /// The hook token does not refer to a live installation.
    #[error("unknown hook token: {token}")]
    UnknownHookToken {
        /// The stale or foreign token.
        token: String,
    },

    /// A thread-scoped hook was uninstalled from a different thread.
    #[error("hook {token} was installed on another thread and must be uninstalled there")]
    HookThreadMismatch {
        /// The token that was passed in.
        token: String,
    },
}

impl NotifyError {
    /// Creates an invalid setting error.
    pub fn invalid_setting(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            name,
            reason: reason.into(),
        }
    }

    /// Creates a transport unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            reason: reason.into(),
        }
    }

    /// Returns true if a failed send may succeed when attempted again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable { .. } | Self::Throttled { .. }
        )
    }

    /// Returns true if this error means no notification can be sent for the
    /// invocation at all.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingSetting { .. } | Self::InvalidSetting { .. })
    }
}

/// Result type for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_missing_setting() {
        let err = NotifyError::MissingSetting {
            name: "sender_address",
            env_var: "NOTIFY_SENDER_ADDRESS",
        };
        assert_eq!(
            err.to_string(),
            "missing required setting 'sender_address' (set it explicitly or via NOTIFY_SENDER_ADDRESS)"
        );
    }

    #[test]
    fn error_display_invalid_setting() {
        let err = NotifyError::invalid_setting("enabled_level", "unknown level 'loud'");
        assert_eq!(
            err.to_string(),
            "invalid setting 'enabled_level': unknown level 'loud'"
        );
    }

    #[test]
    fn error_display_template_not_found_tells_user_to_provision() {
        let err = NotifyError::TemplateNotFound {
            template: "claw-notify-channel".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("claw-notify-channel"));
        assert!(msg.contains("provision"));
        assert!(msg.contains("before retrying"));
    }

    #[test]
    fn error_display_hook_errors() {
        let err = NotifyError::UnknownHookToken {
            token: "hook#3.1".to_string(),
        };
        assert_eq!(err.to_string(), "unknown hook token: hook#3.1");

        let err = NotifyError::HookThreadMismatch {
            token: "hook#0.2".to_string(),
        };
        assert!(err.to_string().contains("another thread"));
    }

    #[test]
    fn only_transient_transport_errors_are_retryable() {
        assert!(NotifyError::unavailable("connection reset").is_retryable());
        assert!(
            NotifyError::Throttled {
                reason: "rate exceeded".to_string()
            }
            .is_retryable()
        );
        assert!(
            !NotifyError::TemplateNotFound {
                template: "t".to_string()
            }
            .is_retryable()
        );
        assert!(
            !NotifyError::Unauthorized {
                reason: "sender not verified".to_string()
            }
            .is_retryable()
        );
        assert!(
            !NotifyError::Rejected {
                reason: "bad address".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn configuration_errors_are_flagged() {
        assert!(NotifyError::invalid_setting("sender_address", "nope").is_configuration());
        assert!(!NotifyError::unavailable("down").is_configuration());
    }
}
