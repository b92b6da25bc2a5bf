//! The record pipeline: classify, render, dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::classify::Classifier;
use crate::config::NotifyConfig;
use crate::dispatch::{Dispatcher, FlushReport};
use crate::metadata::HostIdentity;
use crate::render::{RenderContext, Renderer};
use crate::types::LogRecord;

/// Receives records captured by the interception hook.
pub trait RecordSink: Send + Sync {
    /// Handles one captured record.
    fn on_record(&self, record: LogRecord);
}

/// Per-invocation pipeline.
///
/// Owns the invocation's resolved configuration, host identity and
/// dispatcher, so nothing here is shared with other invocations.
pub struct Pipeline {
    config: NotifyConfig,
    host: HostIdentity,
    classifier: Classifier,
    renderer: Arc<dyn Renderer>,
    dispatcher: Arc<dyn Dispatcher>,
    records: AtomicUsize,
    envelopes: AtomicUsize,
}

impl Pipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        config: NotifyConfig,
        host: HostIdentity,
        renderer: Arc<dyn Renderer>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            classifier: Classifier::from_config(&config),
            config,
            host,
            renderer,
            dispatcher,
            records: AtomicUsize::new(0),
            envelopes: AtomicUsize::new(0),
        }
    }

    /// Returns the resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// Returns the host identity used for rendering.
    #[must_use]
    pub const fn host(&self) -> &HostIdentity {
        &self.host
    }

    /// Returns the number of records seen.
    #[must_use]
    pub fn records_seen(&self) -> usize {
        self.records.load(Ordering::Relaxed)
    }

    /// Returns the number of envelopes handed to the dispatcher.
    #[must_use]
    pub fn envelopes_dispatched(&self) -> usize {
        self.envelopes.load(Ordering::Relaxed)
    }

    /// Flushes the dispatcher.
    pub fn flush(&self) -> FlushReport {
        self.dispatcher.flush()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("classifier", &self.classifier)
            .field("strategy", &self.dispatcher.strategy())
            .field("records", &self.records_seen())
            .field("envelopes", &self.envelopes_dispatched())
            .finish_non_exhaustive()
    }
}

impl RecordSink for Pipeline {
    fn on_record(&self, record: LogRecord) {
        self.records.fetch_add(1, Ordering::Relaxed);

        let destinations = self.classifier.classify(&record);
        if destinations.is_empty() {
            return;
        }

        let ctx = RenderContext {
            config: &self.config,
            host: &self.host,
        };
        for destination in destinations.iter() {
            let envelope = self.renderer.render(&record, destination, &ctx);
            self.envelopes.fetch_add(1, Ordering::Relaxed);
            self.dispatcher.dispatch(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryStrategy;
    use crate::dispatch::build_dispatcher;
    use crate::render::DefaultRenderer;
    use crate::transport::{RecordingTransport, RetryPolicy};
    use crate::types::{ErrorContext, Severity, TemplateId};

    fn config(delivery: DeliveryStrategy, subscribers: &[&str]) -> NotifyConfig {
        NotifyConfig {
            sender_address: "alerts@example.com".to_string(),
            channel_address: "ops@example.com".to_string(),
            enabled_level: Severity::Warning,
            subscriber_addresses: subscribers.iter().map(|s| (*s).to_string()).collect(),
            account_label: Some("prod".to_string()),
            source_link: None,
            execution_region: None,
            log_group_label: None,
            delivery,
        }
    }

    fn pipeline(delivery: DeliveryStrategy, subscribers: &[&str]) -> (Pipeline, RecordingTransport) {
        let transport = RecordingTransport::new();
        let config = config(delivery, subscribers);
        let dispatcher = build_dispatcher(
            delivery,
            config.sender_address.clone(),
            Arc::new(transport.clone()),
            RetryPolicy::default(),
        );
        let pipeline = Pipeline::new(
            config,
            HostIdentity::default(),
            Arc::new(DefaultRenderer),
            dispatcher,
        );
        (pipeline, transport)
    }

    #[test]
    fn below_threshold_is_counted_but_not_sent() {
        let (pipeline, transport) = pipeline(DeliveryStrategy::Immediate, &[]);
        pipeline.on_record(LogRecord::new(Severity::Info, "started"));

        assert_eq!(pipeline.records_seen(), 1);
        assert_eq!(pipeline.envelopes_dispatched(), 0);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn error_context_reaches_subscribers() {
        let (pipeline, transport) =
            pipeline(DeliveryStrategy::Immediate, &["a@example.com", "b@example.com"]);
        pipeline.on_record(
            LogRecord::new(Severity::Error, "charge failed")
                .with_error(ErrorContext::new("CardError", "declined", "")),
        );

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].template, TemplateId::Channel);
        assert_eq!(calls[0].messages[0].to, vec!["ops@example.com".to_string()]);
        assert_eq!(calls[1].template, TemplateId::Subscriber);
        assert_eq!(calls[1].messages[0].to.len(), 2);
    }

    #[test]
    fn batched_pipeline_waits_for_flush() {
        let (pipeline, transport) = pipeline(DeliveryStrategy::Batched, &[]);
        pipeline.on_record(LogRecord::new(Severity::Error, "one"));
        pipeline.on_record(LogRecord::new(Severity::Error, "two"));
        assert_eq!(transport.call_count(), 0);

        let report = pipeline.flush();
        assert_eq!(report.calls, 1);
        assert_eq!(report.messages, 2);
    }
}
