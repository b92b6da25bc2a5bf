//! Notification transports.
//!
//! This module provides the [`Transport`] trait the dispatchers deliver
//! through, the retry policy applied to every call, and two implementations:
//! [`LogTransport`] writes each message to the log, and
//! [`RecordingTransport`] keeps every call in memory for inspection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{NotifyError, Result};
use crate::render::{expand_template, template_definitions};
use crate::types::{OutboundMessage, TemplateId};

/// Largest number of messages carried by one bulk call.
pub const BULK_MESSAGE_LIMIT: usize = 50;

/// Trait for notification transports.
///
/// Implement this trait to deliver notifications through a mail service,
/// a chat bridge, or any other templated messaging service.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Returns the name of this transport.
    fn name(&self) -> &str;

    /// Sends one templated message.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the message could not be delivered.
    fn send_one(&self, sender: &str, template: TemplateId, message: &OutboundMessage)
    -> Result<()>;

    /// Sends several templated messages in one call.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the call failed as a whole.
    fn send_bulk(
        &self,
        sender: &str,
        template: TemplateId,
        messages: &[OutboundMessage],
    ) -> Result<()>;
}

/// How many times a transport call is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    /// Runs `call` until it succeeds, fails with a permanent error, or the
    /// attempts are used up. Returns the last error and the attempts made.
    pub fn run<F>(&self, mut call: F) -> std::result::Result<u32, (NotifyError, u32)>
    where
        F: FnMut() -> Result<()>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call() {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_retryable() && attempt < max => {
                    debug!(attempt, error = %e, "transport call failed, retrying");
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}

/// A transport that logs every message instead of sending it.
#[derive(Debug, Clone)]
pub struct LogTransport {
    name: String,
}

impl LogTransport {
    /// Creates a new log transport.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn log_message(&self, sender: &str, template: TemplateId, message: &OutboundMessage) {
        let body = template_definitions()
            .into_iter()
            .find(|d| d.id == template)
            .map(|d| expand_template(&d.text, &message.fields))
            .unwrap_or_default();
        info!(
            transport = %self.name,
            template = %template,
            from = %sender,
            to = ?message.to,
            subject = %message.subject,
            body = %body,
            "notification"
        );
    }
}

impl Default for LogTransport {
    fn default() -> Self {
        Self::new("log")
    }
}

impl Transport for LogTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_one(
        &self,
        sender: &str,
        template: TemplateId,
        message: &OutboundMessage,
    ) -> Result<()> {
        self.log_message(sender, template, message);
        Ok(())
    }

    fn send_bulk(
        &self,
        sender: &str,
        template: TemplateId,
        messages: &[OutboundMessage],
    ) -> Result<()> {
        for message in messages {
            self.log_message(sender, template, message);
        }
        Ok(())
    }
}

/// Whether a recorded call was a single or bulk send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// `send_one`.
    One,
    /// `send_bulk`.
    Bulk,
}

/// A call observed by a [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentCall {
    /// Which entry point was used.
    pub kind: CallKind,
    /// Sender address.
    pub sender: String,
    /// Template used.
    pub template: TemplateId,
    /// Messages carried by the call.
    pub messages: Vec<OutboundMessage>,
    /// Whether the call succeeded.
    pub delivered: bool,
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<SentCall>,
    failures: VecDeque<NotifyError>,
    missing_templates: Vec<TemplateId>,
}

/// A transport that records every call and can be told to fail.
///
/// Clones share the same record, so a test can keep one handle and give the
/// other to the notifier.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingTransport {
    /// Creates an empty recording transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error returned by the next call.
    pub fn fail_next(&self, error: NotifyError) {
        self.state.lock().failures.push_back(error);
    }

    /// Makes every call using `template` fail with `TemplateNotFound`.
    pub fn remove_template(&self, template: TemplateId) {
        self.state.lock().missing_templates.push(template);
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<SentCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the successful calls.
    #[must_use]
    pub fn delivered(&self) -> Vec<SentCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.delivered)
            .cloned()
            .collect()
    }

    /// Returns the number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Forgets every recorded call.
    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    fn record(
        &self,
        kind: CallKind,
        sender: &str,
        template: TemplateId,
        messages: Vec<OutboundMessage>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let outcome = if state.missing_templates.contains(&template) {
            Err(NotifyError::TemplateNotFound {
                template: template.to_string(),
            })
        } else {
            state.failures.pop_front().map_or(Ok(()), Err)
        };

        state.calls.push(SentCall {
            kind,
            sender: sender.to_string(),
            template,
            messages,
            delivered: outcome.is_ok(),
        });
        outcome
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    fn send_one(
        &self,
        sender: &str,
        template: TemplateId,
        message: &OutboundMessage,
    ) -> Result<()> {
        self.record(CallKind::One, sender, template, vec![message.clone()])
    }

    fn send_bulk(
        &self,
        sender: &str,
        template: TemplateId,
        messages: &[OutboundMessage],
    ) -> Result<()> {
        self.record(CallKind::Bulk, sender, template, messages.to_vec())
    }
}
