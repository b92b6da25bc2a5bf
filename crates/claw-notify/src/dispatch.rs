//! Notification dispatch strategies.
//!
//! A [`Dispatcher`] owns rendered envelopes until they are sent. The
//! [`ImmediateDispatcher`] sends each envelope as it arrives; the
//! [`BatchedDispatcher`] holds them in a [`PendingBatch`] and sends one bulk
//! call per template group when flushed.
//!
//! Dispatchers never return delivery errors to their caller. Failures are
//! logged and counted in the [`FlushReport`].

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::DeliveryStrategy;
use crate::error::NotifyError;
use crate::transport::{BULK_MESSAGE_LIMIT, RetryPolicy, Transport};
use crate::types::{NotificationEnvelope, OutboundMessage, TemplateId};

/// Outcome of delivering notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Transport calls that succeeded.
    pub calls: usize,
    /// Messages carried by successful calls.
    pub messages: usize,
    /// Transport calls that failed after retries.
    pub failed_calls: usize,
    /// Messages carried by failed calls.
    pub failed_messages: usize,
}

impl FlushReport {
    /// Returns true if nothing failed.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed_calls == 0
    }

    /// Adds another report to this one.
    pub fn merge(&mut self, other: Self) {
        self.calls += other.calls;
        self.messages += other.messages;
        self.failed_calls += other.failed_calls;
        self.failed_messages += other.failed_messages;
    }

    fn record(&mut self, outcome: &CallOutcome) {
        if outcome.delivered {
            self.calls += 1;
            self.messages += outcome.messages;
        } else {
            self.failed_calls += 1;
            self.failed_messages += outcome.messages;
        }
    }
}

/// Delivers rendered envelopes.
pub trait Dispatcher: Send + Sync {
    /// Hands an envelope to the dispatcher.
    fn dispatch(&self, envelope: NotificationEnvelope);

    /// Sends anything still pending.
    fn flush(&self) -> FlushReport;

    /// Returns the strategy this dispatcher implements.
    fn strategy(&self) -> DeliveryStrategy;
}

/// Builds the dispatcher for a delivery strategy.
#[must_use]
pub fn build_dispatcher(
    strategy: DeliveryStrategy,
    sender: impl Into<String>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
) -> Arc<dyn Dispatcher> {
    let link = TransportLink::new(sender, transport, retry);
    match strategy {
        DeliveryStrategy::Immediate => Arc::new(ImmediateDispatcher::new(link)),
        DeliveryStrategy::Batched => Arc::new(BatchedDispatcher::new(link)),
    }
}

struct CallOutcome {
    delivered: bool,
    messages: usize,
}

/// Sender, transport and retry policy shared by both strategies.
#[derive(Debug, Clone)]
pub struct TransportLink {
    sender: String,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl TransportLink {
    /// Creates a link.
    #[must_use]
    pub fn new(sender: impl Into<String>, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            sender: sender.into(),
            transport,
            retry,
        }
    }

    fn send_one(&self, template: TemplateId, message: &OutboundMessage) -> CallOutcome {
        let result = self
            .retry
            .run(|| self.transport.send_one(&self.sender, template, message));
        self.outcome(template, 1, result)
    }

    fn send_bulk(&self, template: TemplateId, messages: &[OutboundMessage]) -> CallOutcome {
        let result = self
            .retry
            .run(|| self.transport.send_bulk(&self.sender, template, messages));
        self.outcome(template, messages.len(), result)
    }

    fn outcome(
        &self,
        template: TemplateId,
        messages: usize,
        result: std::result::Result<u32, (NotifyError, u32)>,
    ) -> CallOutcome {
        match result {
            Ok(attempts) => {
                debug!(
                    transport = %self.transport.name(),
                    template = %template,
                    messages,
                    attempts,
                    "notification delivered"
                );
                CallOutcome {
                    delivered: true,
                    messages,
                }
            }
            Err((e, attempts)) => {
                error!(
                    transport = %self.transport.name(),
                    template = %template,
                    messages,
                    attempts,
                    error = %e,
                    "failed to deliver notification"
                );
                CallOutcome {
                    delivered: false,
                    messages,
                }
            }
        }
    }
}

/// Sends every envelope as soon as it is dispatched.
///
/// Under a [`Notifier`](crate::Notifier) the send happens before the logging
/// call returns, but on the hook's delivery thread rather than the workload's
/// own thread, so thread-locals set by the workload are not visible to the
/// [`Transport`].
#[derive(Debug)]
pub struct ImmediateDispatcher {
    link: TransportLink,
    report: Mutex<FlushReport>,
}

impl ImmediateDispatcher {
    /// Creates an immediate dispatcher.
    #[must_use]
    pub fn new(link: TransportLink) -> Self {
        Self {
            link,
            report: Mutex::new(FlushReport::default()),
        }
    }

    /// Returns what has been sent so far.
    #[must_use]
    pub fn report(&self) -> FlushReport {
        *self.report.lock()
    }
}

impl Dispatcher for ImmediateDispatcher {
    fn dispatch(&self, envelope: NotificationEnvelope) {
        let outcome = self.link.send_one(envelope.template(), &envelope.to_message());
        self.report.lock().record(&outcome);
    }

    fn flush(&self) -> FlushReport {
        FlushReport::default()
    }

    fn strategy(&self) -> DeliveryStrategy {
        DeliveryStrategy::Immediate
    }
}

/// Envelopes held for one invocation, grouped by template.
///
/// A batch drains once. Envelopes arriving after that are reported back to
/// the caller instead of being held.
#[derive(Debug)]
pub struct PendingBatch {
    groups: Mutex<Option<BTreeMap<TemplateId, Vec<NotificationEnvelope>>>>,
}

impl Default for PendingBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingBatch {
    /// Creates an empty, open batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Some(BTreeMap::new())),
        }
    }

    /// Appends an envelope, or hands it back if the batch has been drained.
    pub fn push(&self, envelope: NotificationEnvelope) -> Option<NotificationEnvelope> {
        match self.groups.lock().as_mut() {
            Some(groups) => {
                groups.entry(envelope.template()).or_default().push(envelope);
                None
            }
            None => Some(envelope),
        }
    }

    /// Returns the number of envelopes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups
            .lock()
            .as_ref()
            .map_or(0, |groups| groups.values().map(Vec::len).sum())
    }

    /// Returns true if no envelope is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the batch has been drained.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.groups.lock().is_none()
    }

    /// Takes every held envelope and closes the batch. Returns `None` if it
    /// was already drained.
    pub fn drain(&self) -> Option<BTreeMap<TemplateId, Vec<NotificationEnvelope>>> {
        self.groups.lock().take()
    }
}

/// Holds envelopes until flushed, then sends one bulk call per template group.
#[derive(Debug)]
pub struct BatchedDispatcher {
    link: TransportLink,
    pending: PendingBatch,
    late: Mutex<FlushReport>,
}

impl BatchedDispatcher {
    /// Creates a batched dispatcher with an empty batch.
    #[must_use]
    pub fn new(link: TransportLink) -> Self {
        Self {
            link,
            pending: PendingBatch::new(),
            late: Mutex::new(FlushReport::default()),
        }
    }

    /// Returns what was sent individually after the batch was flushed and has
    /// not yet been returned by a later [`flush`](Dispatcher::flush).
    #[must_use]
    pub fn late_report(&self) -> FlushReport {
        *self.late.lock()
    }

    /// Returns the pending batch.
    #[must_use]
    pub const fn pending(&self) -> &PendingBatch {
        &self.pending
    }

    fn group_messages(template: TemplateId, envelopes: &[NotificationEnvelope]) -> Vec<OutboundMessage> {
        match template {
            TemplateId::Channel => envelopes.iter().map(NotificationEnvelope::to_message).collect(),
            TemplateId::Subscriber => envelopes
                .iter()
                .flat_map(NotificationEnvelope::to_messages_per_recipient)
                .collect(),
        }
    }
}

impl Dispatcher for BatchedDispatcher {
    fn dispatch(&self, envelope: NotificationEnvelope) {
        if let Some(late) = self.pending.push(envelope) {
            warn!(
                template = %late.template(),
                sequence = late.sequence,
                "batch already flushed, sending notification individually"
            );
            let outcome = self.link.send_one(late.template(), &late.to_message());
            self.late.lock().record(&outcome);
        }
    }

    /// Drains the batch on the first call. Later calls return the individual
    /// sends made since the previous call.
    fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let Some(groups) = self.pending.drain() else {
            debug!("batch already flushed");
            return std::mem::take(&mut *self.late.lock());
        };

        for (template, envelopes) in &groups {
            let messages = Self::group_messages(*template, envelopes);
            for chunk in messages.chunks(BULK_MESSAGE_LIMIT) {
                let outcome = self.link.send_bulk(*template, chunk);
                report.record(&outcome);
            }
        }
        report
    }

    fn strategy(&self) -> DeliveryStrategy {
        DeliveryStrategy::Batched
    }
}
