//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use claw_notify::config::MapEnv;
use claw_notify::metadata::StaticMetadata;
use claw_notify::{DeliveryStrategy, HostIdentity, Notifier, NotifierBuilder, RecordingTransport};
use parking_lot::Mutex;
use tracing::dispatcher::Dispatch;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::Registry;

/// Sender used by every test notifier.
pub const SENDER: &str = "alerts@example.com";
/// Channel address used by every test notifier.
pub const CHANNEL: &str = "ops@example.com";
/// Subscribers used by [`notifier_with_subscribers`].
pub const SUBSCRIBERS: [&str; 2] = ["dev@example.com", "lead@example.com"];

/// An event seen by the original dispatch.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

/// A layer recording every event it sees.
#[derive(Clone, Default)]
pub struct Capture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

/// The subscriber type behind [`Capture::dispatch`].
pub type CaptureSubscriber = tracing_subscriber::layer::Layered<Capture, Registry>;

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatch that records into this capture.
    pub fn dispatch(&self) -> Dispatch {
        Dispatch::new(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }

    /// Events whose message contains `needle`.
    pub fn matching(&self, needle: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message.contains(needle))
            .cloned()
            .collect()
    }
}

struct FieldVisitor<'a>(&'a mut CapturedEvent);

impl Visit for FieldVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{value:?}");
        if field.name() == "message" {
            self.0.message = value;
        } else {
            self.0.fields.insert(field.name().to_string(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.message = value.to_string();
        } else {
            self.0.fields.insert(field.name().to_string(), value.to_string());
        }
    }
}

impl<S: Subscriber> Layer<S> for Capture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut captured = CapturedEvent {
            level: *event.metadata().level(),
            message: String::new(),
            fields: BTreeMap::new(),
        };
        event.record(&mut FieldVisitor(&mut captured));
        self.events.lock().push(captured);
    }
}

/// A workload error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueError(pub String);

impl ValueError {
    pub fn new(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ValueError {}

/// A builder preloaded with test addresses and no ambient environment.
pub fn builder(transport: &RecordingTransport, delivery: DeliveryStrategy) -> NotifierBuilder {
    Notifier::builder()
        .sender_address(SENDER)
        .channel_address(CHANNEL)
        .delivery(delivery)
        .env_source(MapEnv::new())
        .metadata(StaticMetadata::new(HostIdentity {
            function_name: Some("billing-charge".to_string()),
            log_group: Some("/aws/lambda/billing-charge".to_string()),
            log_stream: Some("2026/10/18/[$LATEST]0f1e".to_string()),
            ..HostIdentity::default()
        }))
        .execution_region("eu-west-1")
        .transport(transport.clone())
}

pub fn notifier(transport: &RecordingTransport, delivery: DeliveryStrategy) -> Notifier {
    builder(transport, delivery).build()
}

pub fn notifier_with_subscribers(
    transport: &RecordingTransport,
    delivery: DeliveryStrategy,
) -> Notifier {
    builder(transport, delivery)
        .subscriber_addresses(SUBSCRIBERS)
        .build()
}
