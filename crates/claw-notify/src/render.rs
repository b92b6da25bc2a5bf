//! Notification rendering.
//!
//! A [`Renderer`] turns a classified record into a [`NotificationEnvelope`]:
//! a subject, the template fields and the recipient list. The subject always
//! carries the record's emission time, so notifications delivered out of order
//! can still be put back in sequence.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::config::NotifyConfig;
use crate::metadata::HostIdentity;
use crate::types::{Destination, LogRecord, NotificationEnvelope, TemplateId};

/// Maximum number of characters of the message used in a subject line.
pub const SUBJECT_SUMMARY_LIMIT: usize = 80;

/// Everything a renderer may draw on besides the record.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// The invocation's configuration.
    pub config: &'a NotifyConfig,
    /// Host identity, empty when metadata was unavailable.
    pub host: &'a HostIdentity,
}

impl RenderContext<'_> {
    /// Returns the account label, preferring the configured one.
    #[must_use]
    pub fn account_label(&self) -> Option<&str> {
        self.config
            .account_label
            .as_deref()
            .or(self.host.account_label.as_deref())
    }

    /// Returns the recipients for a destination.
    #[must_use]
    pub fn recipients(&self, destination: Destination) -> Vec<String> {
        match destination {
            Destination::Channel => vec![self.config.channel_address.clone()],
            Destination::Subscribers => self.config.subscriber_addresses.clone(),
        }
    }
}

/// Converts a record into a deliverable envelope.
pub trait Renderer: Send + Sync {
    /// Renders `record` for `destination`.
    fn render(
        &self,
        record: &LogRecord,
        destination: Destination,
        ctx: &RenderContext<'_>,
    ) -> NotificationEnvelope;
}

/// The built-in renderer used with the provisioned templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRenderer;

impl DefaultRenderer {
    /// Builds the subject line for a record.
    #[must_use]
    pub fn subject(record: &LogRecord, ctx: &RenderContext<'_>) -> String {
        let mut subject = format!("{}: {}", record.level, summarize(record));

        let origin = match (ctx.host.function_name.as_deref(), ctx.account_label()) {
            (Some(function), Some(account)) => Some(format!("{function} @ {account}")),
            (Some(function), None) => Some(function.to_string()),
            (None, Some(account)) => Some(account.to_string()),
            (None, None) => None,
        };
        if let Some(origin) = origin {
            subject.push_str(&format!(" [{origin}]"));
        }

        subject.push_str(&format!(
            " at {}",
            record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        subject
    }

    fn fields(
        record: &LogRecord,
        destination: Destination,
        subject: &str,
        ctx: &RenderContext<'_>,
    ) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        let mut put = |key: &str, value: Option<&str>| {
            if let Some(value) = value {
                fields.insert(key.to_string(), value.to_string());
            }
        };

        let timestamp = record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        let sequence = record.sequence.to_string();
        put("subject", Some(subject));
        put("destination", Some(destination.as_str()));
        put("level", Some(record.level.as_str()));
        put("message", Some(&record.message));
        put("logger", Some(&record.logger).filter(|l| !l.is_empty()).map(String::as_str));
        put("timestamp", Some(&timestamp));
        put("sequence", Some(&sequence));

        put("account", ctx.account_label());
        put("region", ctx.config.execution_region.as_deref());
        put("source_link", ctx.config.source_link.as_deref());
        put("log_group_label", ctx.config.log_group_label.as_deref());
        put("function_name", ctx.host.function_name.as_deref());
        put("function_version", ctx.host.function_version.as_deref());
        put("log_group", ctx.host.log_group.as_deref());
        put("log_stream", ctx.host.log_stream.as_deref());

        let log_link = log_link(ctx);
        put("log_link", log_link.as_deref());

        if let Some(error) = &record.error {
            put("error_kind", Some(&error.kind));
            put("error_message", Some(&error.message));
            put(
                "stack_trace",
                Some(&error.stack_trace).filter(|t| !t.is_empty()).map(String::as_str),
            );
        }

        if !record.fields.is_empty() {
            let context = serde_json::to_string(&record.fields).ok();
            put("context", context.as_deref());
        }

        fields
    }
}

impl Renderer for DefaultRenderer {
    fn render(
        &self,
        record: &LogRecord,
        destination: Destination,
        ctx: &RenderContext<'_>,
    ) -> NotificationEnvelope {
        let subject = Self::subject(record, ctx);
        let fields = Self::fields(record, destination, &subject, ctx);

        NotificationEnvelope {
            destination,
            recipients: ctx.recipients(destination),
            subject,
            fields,
            source_timestamp: record.timestamp,
            sequence: record.sequence,
        }
    }
}

/// First line of the message, truncated for a subject line.
fn summarize(record: &LogRecord) -> String {
    let line = record
        .message
        .lines()
        .next()
        .filter(|l| !l.trim().is_empty())
        .or_else(|| record.error.as_ref().map(|e| e.kind.as_str()))
        .unwrap_or("(no message)")
        .trim();

    if line.chars().count() <= SUBJECT_SUMMARY_LIMIT {
        return line.to_string();
    }
    let mut truncated: String = line.chars().take(SUBJECT_SUMMARY_LIMIT - 1).collect();
    truncated.push('…');
    truncated
}

/// Console link to the log stream, when the host identity is complete enough.
fn log_link(ctx: &RenderContext<'_>) -> Option<String> {
    let region = ctx.config.execution_region.as_deref()?;
    let group = ctx.host.log_group.as_deref()?;
    let stream = ctx.host.log_stream.as_deref()?;
    Some(format!(
        "https://{region}.console.aws.amazon.com/cloudwatch/home?region={region}#logEventViewer:group={group};stream={stream}"
    ))
}

/// A template as it must be provisioned at the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    /// Template identity.
    pub id: TemplateId,
    /// Subject part.
    pub subject: String,
    /// Plain-text body part.
    pub text: String,
}

/// Returns the definitions of both templates used by [`DefaultRenderer`].
#[must_use]
pub fn template_definitions() -> Vec<TemplateDefinition> {
    vec![
        TemplateDefinition {
            id: TemplateId::Channel,
            subject: "{{subject}}".to_string(),
            text: "{{level}} from {{function_name}} ({{account}}, {{region}})\n\
                   {{message}}\n\
                   logged by {{logger}} at {{timestamp}}\n\
                   {{error_kind}}: {{error_message}}\n\
                   logs: {{log_link}}\n\
                   source: {{source_link}}"
                .to_string(),
        },
        TemplateDefinition {
            id: TemplateId::Subscriber,
            subject: "{{subject}}".to_string(),
            text: "An error was reported by {{function_name}} in account {{account}} ({{region}}).\n\n\
                   {{message}}\n\n\
                   {{error_kind}}: {{error_message}}\n\
                   {{stack_trace}}\n\n\
                   Logged by {{logger}} at {{timestamp}}.\n\
                   Log group: {{log_group_label}} {{log_group}} / {{log_stream}}\n\
                   Logs: {{log_link}}\n\
                   Source: {{source_link}}"
                .to_string(),
        },
    ]
}

/// Substitutes `{{name}}` placeholders with field values; unknown names become empty.
#[must_use]
pub fn expand_template(template: &str, fields: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if let Some(value) = fields.get(name) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryStrategy;
    use crate::types::{ErrorContext, Severity};
    use chrono::{TimeZone, Utc};

    fn config() -> NotifyConfig {
        NotifyConfig {
            sender_address: "alerts@example.com".to_string(),
            channel_address: "ops@example.slack.com".to_string(),
            enabled_level: Severity::Warning,
            subscriber_addresses: vec!["a@example.com".to_string(), "b@example.com".to_string()],
            account_label: Some("prod".to_string()),
            source_link: None,
            execution_region: Some("eu-west-1".to_string()),
            log_group_label: None,
            delivery: DeliveryStrategy::Immediate,
        }
    }

    fn host() -> HostIdentity {
        HostIdentity {
            function_name: Some("billing-charge".to_string()),
            log_group: Some("/aws/lambda/billing-charge".to_string()),
            log_stream: Some("stream-1".to_string()),
            ..HostIdentity::default()
        }
    }

    fn record() -> LogRecord {
        LogRecord::new(Severity::Error, "card declined")
            .with_logger("billing::charge")
            .with_timestamp(Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap())
            .with_sequence(3)
    }

    mod subject_tests {
        use super::*;

        #[test]
        fn subject_encodes_emission_timestamp() {
            let config = config();
            let host = host();
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            let envelope = DefaultRenderer.render(&record(), Destination::Channel, &ctx);

            assert_eq!(
                envelope.subject,
                "ERROR: card declined [billing-charge @ prod] at 2026-10-18T09:30:00.000Z"
            );
            assert_eq!(envelope.source_timestamp, record().timestamp);
            assert_eq!(envelope.sequence, 3);
        }

        #[test]
        fn subject_without_host_or_account() {
            let mut config = config();
            config.account_label = None;
            let host = HostIdentity::default();
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            let subject = DefaultRenderer::subject(&record(), &ctx);
            assert_eq!(subject, "ERROR: card declined at 2026-10-18T09:30:00.000Z");
        }

        #[test]
        fn long_messages_are_truncated() {
            let config = config();
            let host = HostIdentity::default();
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            let record = LogRecord::new(Severity::Warning, "x".repeat(200));
            let subject = DefaultRenderer::subject(&record, &ctx);
            assert!(subject.contains('…'));
            assert!(subject.len() < 200);
        }

        #[test]
        fn empty_message_uses_error_kind() {
            let config = config();
            let host = HostIdentity::default();
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            let record = LogRecord::new(Severity::Critical, "")
                .with_error(ErrorContext::new("ValueError", "boom", ""));
            let subject = DefaultRenderer::subject(&record, &ctx);
            assert!(subject.starts_with("CRITICAL: ValueError"));
        }

        #[test]
        fn host_account_label_used_when_not_configured() {
            let mut config = config();
            config.account_label = None;
            let host = HostIdentity {
                account_label: Some("from-host".to_string()),
                ..HostIdentity::default()
            };
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            assert_eq!(ctx.account_label(), Some("from-host"));
        }
    }

    mod field_tests {
        use super::*;

        #[test]
        fn channel_envelope_fields_and_recipients() {
            let config = config();
            let host = host();
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            let envelope = DefaultRenderer.render(&record(), Destination::Channel, &ctx);

            assert_eq!(envelope.recipients, vec!["ops@example.slack.com".to_string()]);
            assert_eq!(envelope.fields.get("level"), Some(&"ERROR".to_string()));
            assert_eq!(envelope.fields.get("message"), Some(&"card declined".to_string()));
            assert_eq!(envelope.fields.get("account"), Some(&"prod".to_string()));
            assert_eq!(envelope.fields.get("sequence"), Some(&"3".to_string()));
            assert!(envelope.fields.get("log_link").unwrap().contains("eu-west-1"));
            assert!(!envelope.fields.contains_key("error_kind"));
            assert!(!envelope.fields.contains_key("source_link"));
        }

        #[test]
        fn subscriber_envelope_carries_error_context() {
            let config = config();
            let host = host();
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            let record = record()
                .with_error(ErrorContext::new("DeclineError", "insufficient funds", "trace"))
                .with_field("order_id", "A-17");
            let envelope = DefaultRenderer.render(&record, Destination::Subscribers, &ctx);

            assert_eq!(envelope.recipients.len(), 2);
            assert_eq!(
                envelope.fields.get("error_kind"),
                Some(&"DeclineError".to_string())
            );
            assert_eq!(envelope.fields.get("stack_trace"), Some(&"trace".to_string()));
            assert_eq!(
                envelope.fields.get("context"),
                Some(&r#"{"order_id":"A-17"}"#.to_string())
            );
        }

        #[test]
        fn missing_metadata_omits_fields() {
            let config = config();
            let host = HostIdentity::default();
            let ctx = RenderContext {
                config: &config,
                host: &host,
            };
            let envelope = DefaultRenderer.render(&record(), Destination::Channel, &ctx);
            assert!(!envelope.fields.contains_key("function_name"));
            assert!(!envelope.fields.contains_key("log_link"));
        }
    }

    mod template_tests {
        use super::*;

        #[test]
        fn definitions_cover_both_templates() {
            let defs = template_definitions();
            let ids: Vec<_> = defs.iter().map(|d| d.id).collect();
            assert_eq!(ids, vec![TemplateId::Channel, TemplateId::Subscriber]);
            assert!(defs.iter().all(|d| d.subject == "{{subject}}"));
        }

        #[test]
        fn expand_known_and_unknown_placeholders() {
            let fields = BTreeMap::from([
                ("level".to_string(), "ERROR".to_string()),
                ("message".to_string(), "boom".to_string()),
            ]);
            let out = expand_template("{{level}}: {{ message }} {{missing}}!", &fields);
            assert_eq!(out, "ERROR: boom !");
        }

        #[test]
        fn expand_unterminated_placeholder_kept_verbatim() {
            let out = expand_template("hello {{name", &BTreeMap::new());
            assert_eq!(out, "hello {{name");
        }
    }
}
