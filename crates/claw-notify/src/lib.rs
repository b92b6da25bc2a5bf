//! Log interception and error notification for Clawbernetes workloads.
//!
//! `claw-notify` wraps a unit of work (a function, handler or task), watches
//! the `tracing` events it emits, and turns the ones that matter into
//! notifications for a chat channel and, when an error is attached, for a
//! list of subscribers.
//!
//! # Features
//!
//! - **Transparent interception**: hooks the active `tracing` dispatch for the
//!   duration of one invocation and forwards every event unchanged
//! - **Classification**: severity gates notification, an attached error gates
//!   subscriber delivery
//! - **Two delivery strategies**: immediate (one call per notification) or
//!   batched (one bulk call per template at exit)
//! - **Failure capture**: an `Err` or panic escaping the work becomes a
//!   critical notification and is then handed back unchanged
//! - **Nested and concurrent invocations**: installations compose and each
//!   invocation owns its own batch
//!
//! # Example
//!
//! ```rust
//! use claw_notify::{DeliveryStrategy, Notifier, RecordingTransport, Severity};
//! use claw_notify::config::MapEnv;
//!
//! let transport = RecordingTransport::new();
//! let notifier = Notifier::builder()
//!     .sender_address("alerts@example.com")
//!     .channel_address("ops@example.com")
//!     .subscriber_addresses(["oncall@example.com"])
//!     .enabled_level(Severity::Warning)
//!     .delivery(DeliveryStrategy::Batched)
//!     .env_source(MapEnv::new())
//!     .transport(transport.clone())
//!     .build();
//!
//! let result: Result<u32, std::io::Error> = notifier.try_invoke(|| {
//!     tracing::warn!("cache cold, falling back to database");
//!     Err(std::io::Error::other("connection refused"))
//! });
//!
//! assert!(result.is_err());
//! // one bulk call for the channel, one for the subscribers
//! assert_eq!(transport.call_count(), 2);
//! ```
//!
//! # Attaching errors to records
//!
//! Passing an error as a `&dyn Error` field attaches it as error context, which
//! also notifies subscribers. `error.kind` overrides the reported type and
//! `critical = true` raises the record to [`Severity::Critical`]:
//!
//! ```rust,ignore
//! tracing::error!(
//!     error = &err as &(dyn std::error::Error + 'static),
//!     error.kind = "CardDeclined",
//!     order_id = %order.id,
//!     "charge failed"
//! );
//! ```

#![forbid(unsafe_code)]
#![doc(html_root_url = "https://docs.rs/claw-notify/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod hook;
pub mod metadata;
pub mod pipeline;
pub mod render;
pub mod transport;
pub mod types;
pub mod wrapper;

// Re-export main types at crate root
pub use classify::{Classifier, DestinationSet};
pub use config::{ConfigOverrides, DeliveryStrategy, EnvSource, NotifyConfig};
pub use dispatch::{BatchedDispatcher, Dispatcher, FlushReport, ImmediateDispatcher, PendingBatch};
pub use error::{NotifyError, Result};
pub use filter::should_notify;
pub use hook::{HookRegistry, HookToken};
pub use metadata::{ExecutionMetadata, HostIdentity};
pub use pipeline::{Pipeline, RecordSink};
pub use render::{DefaultRenderer, Renderer};
pub use transport::{LogTransport, RecordingTransport, Transport};
pub use types::{
    Destination, ErrorContext, LogRecord, NotificationEnvelope, OutboundMessage, Severity,
    TemplateId,
};
pub use wrapper::{InvocationPhase, Notifier, NotifierBuilder};
