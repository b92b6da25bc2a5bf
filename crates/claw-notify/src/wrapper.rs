//! Invocation wrapper.
//!
//! A [`Notifier`] is an immutable policy. Each call to one of its entry points
//! is one invocation: configuration is resolved, a hook is installed, the
//! work runs, and the invocation is finalized exactly once on every exit
//! path, including panics and cancellation.
//!
//! Finalization routes any captured failure through the pipeline as a
//! critical record, removes the hook, flushes the dispatcher, and only then
//! hands the result, error or panic back to the caller unchanged.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::Either;
use serde::{Deserialize, Serialize};
use tracing::dispatcher::{self, Dispatch};
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{ConfigOverrides, DeliveryStrategy, EnvSource, NotifyConfig, ProcessEnv};
use crate::dispatch::{FlushReport, build_dispatcher};
use crate::error::Result;
use crate::hook::{HookRegistry, HookToken, original_dispatch};
use crate::metadata::{EnvMetadata, ExecutionMetadata, HostIdentity};
use crate::pipeline::Pipeline;
use crate::render::{DefaultRenderer, Renderer};
use crate::transport::{LogTransport, RetryPolicy, Transport};
use crate::types::{ErrorContext, LogRecord, Severity};

/// Lifecycle phase of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPhase {
    /// Not started, or fully finalized.
    Idle,
    /// Hook installed, work not yet started.
    Installed,
    /// Work running.
    Executing,
    /// Work finished, finalization in progress.
    Finalizing,
}

#[derive(Clone, Copy)]
enum HookMode {
    /// Installed on the calling thread.
    Scoped,
    /// Attached to a future.
    Attached,
}

struct ActiveHook {
    token: HookToken,
    pipeline: Arc<Pipeline>,
}

/// One run of wrapped work.
struct Invocation {
    id: Uuid,
    phase: InvocationPhase,
    original: Dispatch,
    hook: Option<ActiveHook>,
}

impl Invocation {
    fn enter(&mut self) {
        if self.phase == InvocationPhase::Installed {
            self.phase = InvocationPhase::Executing;
        }
    }

    /// Routes the failure record and removes the hook. Returns the pipeline
    /// still to be flushed, or `None` if there is nothing left to do.
    fn settle(&mut self, failure: Option<ErrorContext>) -> Option<Arc<Pipeline>> {
        if matches!(
            self.phase,
            InvocationPhase::Idle | InvocationPhase::Finalizing
        ) {
            return None;
        }
        self.phase = InvocationPhase::Finalizing;

        let Some(hook) = self.hook.take() else {
            self.phase = InvocationPhase::Idle;
            return None;
        };
        let registry = HookRegistry::global();

        if let Some(ctx) = failure {
            let record = LogRecord::new(Severity::Critical, format!("{}: {}", ctx.kind, ctx.message))
                .with_logger(module_path!())
                .with_error(ctx);
            if let Err(e) = registry.record(hook.token, record) {
                dispatcher::with_default(&self.original, || {
                    warn!(invocation = %self.id, error = %e, "failed to report invocation failure");
                });
            }
        }

        if let Err(e) = registry.uninstall(hook.token) {
            dispatcher::with_default(&self.original, || {
                warn!(invocation = %self.id, hook = %hook.token, error = %e, "failed to remove notification hook");
            });
        }
        Some(hook.pipeline)
    }

    fn finish(&mut self, failure: Option<ErrorContext>) -> FlushReport {
        let report = self
            .settle(failure)
            .map(|pipeline| flush_pipeline(&pipeline, &self.original, self.id))
            .unwrap_or_default();
        self.phase = InvocationPhase::Idle;
        report
    }

    async fn finish_async(&mut self, failure: Option<ErrorContext>) -> FlushReport {
        let Some(pipeline) = self.settle(failure) else {
            self.phase = InvocationPhase::Idle;
            return FlushReport::default();
        };

        // Without a tokio runtime there is no blocking pool; flush inline.
        if tokio::runtime::Handle::try_current().is_err() {
            let report = flush_pipeline(&pipeline, &self.original, self.id);
            self.phase = InvocationPhase::Idle;
            return report;
        }

        let original = self.original.clone();
        let id = self.id;
        let report =
            tokio::task::spawn_blocking(move || flush_pipeline(&pipeline, &original, id)).await;
        self.phase = InvocationPhase::Idle;

        report.unwrap_or_else(|e| {
            dispatcher::with_default(&self.original, || {
                error!(invocation = %self.id, error = %e, "notification flush task failed");
            });
            FlushReport::default()
        })
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let Some(pipeline) = self.settle(None) else {
            self.phase = InvocationPhase::Idle;
            return;
        };
        self.phase = InvocationPhase::Idle;

        let original = self.original.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || flush_pipeline(&pipeline, &original, id));
            }
            Err(_) => {
                flush_pipeline(&pipeline, &original, id);
            }
        }
    }
}

fn flush_pipeline(pipeline: &Pipeline, original: &Dispatch, id: Uuid) -> FlushReport {
    dispatcher::with_default(original, || {
        let report = pipeline.flush();
        if !report.is_clean() {
            warn!(
                invocation = %id,
                failed_calls = report.failed_calls,
                failed_messages = report.failed_messages,
                "some notifications could not be delivered"
            );
        }
        debug!(
            invocation = %id,
            records = pipeline.records_seen(),
            envelopes = pipeline.envelopes_dispatched(),
            calls = report.calls,
            "invocation finalized"
        );
        report
    })
}

/// Wraps units of work so the records they log are turned into notifications.
///
/// Captured records are processed, and with immediate delivery sent, on a
/// short-lived helper thread that the logging call site waits for. A
/// [`Transport`] therefore does not see the workload's thread-locals.
///
/// # Example
///
/// ```rust,ignore
/// use claw_notify::{Notifier, Severity};
///
/// let notifier = Notifier::builder()
///     .sender_address("alerts@example.com")
///     .channel_address("ops-channel@example.com")
///     .enabled_level(Severity::Error)
///     .build();
///
/// let total = notifier.try_invoke(|| charge_card(order))?;
/// ```
#[derive(Clone)]
pub struct Notifier {
    overrides: ConfigOverrides,
    env: Arc<dyn EnvSource>,
    transport: Arc<dyn Transport>,
    renderer: Arc<dyn Renderer>,
    metadata: Arc<dyn ExecutionMetadata>,
    retry: RetryPolicy,
}

impl Notifier {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> NotifierBuilder {
        NotifierBuilder::default()
    }

    /// Resolves the configuration an invocation would use right now.
    pub fn resolve_config(&self) -> Result<NotifyConfig> {
        self.overrides.resolve(self.env.as_ref())
    }

    /// Builds the invocation's pipeline. Runs under `original` so that nothing
    /// logged while resolving settings reaches an enclosing invocation's hook.
    fn prepare(&self, id: Uuid, original: &Dispatch) -> Option<Arc<Pipeline>> {
        dispatcher::with_default(original, || self.build_pipeline(id))
    }

    fn build_pipeline(&self, id: Uuid) -> Option<Arc<Pipeline>> {
        let config = match self.resolve_config() {
            Ok(config) => config,
            Err(e) => {
                error!(
                    invocation = %id,
                    error = %e,
                    "notification configuration invalid, running without notifications"
                );
                return None;
            }
        };

        let host = self.metadata.host_identity().unwrap_or_else(|e| {
            debug!(invocation = %id, error = %e, "execution metadata unavailable");
            HostIdentity::default()
        });

        let delivery = build_dispatcher(
            config.delivery,
            config.sender_address.clone(),
            Arc::clone(&self.transport),
            self.retry,
        );
        Some(Arc::new(Pipeline::new(
            config,
            host,
            Arc::clone(&self.renderer),
            delivery,
        )))
    }

    fn begin(&self, mode: HookMode) -> (Invocation, Option<Dispatch>) {
        let id = Uuid::new_v4();
        let original = original_dispatch();
        let mut invocation = Invocation {
            id,
            phase: InvocationPhase::Idle,
            original,
            hook: None,
        };

        let Some(pipeline) = self.prepare(id, &invocation.original) else {
            return (invocation, None);
        };
        let min_level = pipeline.config().enabled_level;
        dispatcher::with_default(&invocation.original, || {
            debug!(
                invocation = %id,
                delivery = %pipeline.config().delivery,
                threshold = %min_level,
                "installing notification hook"
            );
        });

        let registry = HookRegistry::global();
        let sink = Arc::clone(&pipeline);
        let (token, dispatch) = match mode {
            HookMode::Scoped => (registry.install(sink, min_level), None),
            HookMode::Attached => {
                let (token, dispatch) = registry.attach(sink, min_level);
                (token, Some(dispatch))
            }
        };

        invocation.hook = Some(ActiveHook { token, pipeline });
        invocation.phase = InvocationPhase::Installed;
        (invocation, dispatch)
    }

    /// Runs `work`. A panic is reported as a critical record and then resumed.
    pub fn invoke<T>(&self, work: impl FnOnce() -> T) -> T {
        let (mut invocation, _) = self.begin(HookMode::Scoped);
        invocation.enter();

        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(value) => {
                invocation.finish(None);
                value
            }
            Err(payload) => {
                invocation.finish(Some(ErrorContext::from_panic(payload.as_ref())));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Runs fallible `work`. An `Err` is reported as a critical record with
    /// subscriber delivery, then returned unchanged.
    pub fn try_invoke<T, E>(&self, work: impl FnOnce() -> std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: StdError + 'static,
    {
        let (mut invocation, _) = self.begin(HookMode::Scoped);
        invocation.enter();

        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => {
                invocation.finish(None);
                Ok(value)
            }
            Ok(Err(e)) => {
                invocation.finish(Some(ErrorContext::from_error(&e)));
                Err(e)
            }
            Err(payload) => {
                invocation.finish(Some(ErrorContext::from_panic(payload.as_ref())));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Runs the future `work`.
    ///
    /// The hook follows the future across threads. The final flush runs on
    /// the blocking pool and is awaited as one step. If the returned future is
    /// dropped early the invocation is finalized from `Drop`.
    pub async fn invoke_async<F>(&self, work: F) -> F::Output
    where
        F: Future,
    {
        let (mut invocation, dispatch) = self.begin(HookMode::Attached);
        invocation.enter();

        match AssertUnwindSafe(attach(work, dispatch)).catch_unwind().await {
            Ok(value) => {
                invocation.finish_async(None).await;
                value
            }
            Err(payload) => {
                invocation
                    .finish_async(Some(ErrorContext::from_panic(payload.as_ref())))
                    .await;
                panic::resume_unwind(payload)
            }
        }
    }

    /// Runs the fallible future `work`; see [`try_invoke`](Self::try_invoke).
    pub async fn try_invoke_async<F, T, E>(&self, work: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: StdError + 'static,
    {
        let (mut invocation, dispatch) = self.begin(HookMode::Attached);
        invocation.enter();

        match AssertUnwindSafe(attach(work, dispatch)).catch_unwind().await {
            Ok(Ok(value)) => {
                invocation.finish_async(None).await;
                Ok(value)
            }
            Ok(Err(e)) => {
                invocation
                    .finish_async(Some(ErrorContext::from_error(&e)))
                    .await;
                Err(e)
            }
            Err(payload) => {
                invocation
                    .finish_async(Some(ErrorContext::from_panic(payload.as_ref())))
                    .await;
                panic::resume_unwind(payload)
            }
        }
    }

    /// Wraps a single-argument fallible handler so every call is an invocation.
    pub fn wrap<A, T, E, H>(&self, handler: H) -> impl Fn(A) -> std::result::Result<T, E>
    where
        H: Fn(A) -> std::result::Result<T, E>,
        E: StdError + 'static,
    {
        let notifier = self.clone();
        move |input| notifier.try_invoke(|| handler(input))
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("overrides", &self.overrides)
            .field("transport", &self.transport.name())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn attach<F: Future>(work: F, dispatch: Option<Dispatch>) -> Either<WithDispatch<F>, F> {
    match dispatch {
        Some(dispatch) => Either::Left(work.with_subscriber(dispatch)),
        None => Either::Right(work),
    }
}

/// Builder for [`Notifier`].
///
/// Settings left unset are read from the environment at each invocation.
#[derive(Default)]
pub struct NotifierBuilder {
    overrides: ConfigOverrides,
    env: Option<Arc<dyn EnvSource>>,
    transport: Option<Arc<dyn Transport>>,
    renderer: Option<Arc<dyn Renderer>>,
    metadata: Option<Arc<dyn ExecutionMetadata>>,
    retry: RetryPolicy,
}

impl NotifierBuilder {
    /// Sets the sender address.
    #[must_use]
    pub fn sender_address(mut self, address: impl Into<String>) -> Self {
        self.overrides.sender_address = Some(address.into());
        self
    }

    /// Sets the chat channel address.
    #[must_use]
    pub fn channel_address(mut self, address: impl Into<String>) -> Self {
        self.overrides.channel_address = Some(address.into());
        self
    }

    /// Sets the notification threshold.
    #[must_use]
    pub fn enabled_level(mut self, level: Severity) -> Self {
        self.overrides.enabled_level = Some(level);
        self
    }

    /// Sets the subscriber addresses.
    #[must_use]
    pub fn subscriber_addresses<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.subscriber_addresses = Some(addresses.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the account label.
    #[must_use]
    pub fn account_label(mut self, label: impl Into<String>) -> Self {
        self.overrides.account_label = Some(label.into());
        self
    }

    /// Sets the source link.
    #[must_use]
    pub fn source_link(mut self, link: impl Into<String>) -> Self {
        self.overrides.source_link = Some(link.into());
        self
    }

    /// Sets the execution region.
    #[must_use]
    pub fn execution_region(mut self, region: impl Into<String>) -> Self {
        self.overrides.execution_region = Some(region.into());
        self
    }

    /// Sets the log group label.
    #[must_use]
    pub fn log_group_label(mut self, label: impl Into<String>) -> Self {
        self.overrides.log_group_label = Some(label.into());
        self
    }

    /// Sets the delivery strategy.
    #[must_use]
    pub fn delivery(mut self, strategy: DeliveryStrategy) -> Self {
        self.overrides.delivery = Some(strategy);
        self
    }

    /// Sets the environment settings are read from.
    #[must_use]
    pub fn env_source(mut self, env: impl EnvSource + 'static) -> Self {
        self.env = Some(Arc::new(env));
        self
    }

    /// Sets the transport.
    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Sets the renderer.
    #[must_use]
    pub fn renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    /// Sets the execution metadata provider.
    #[must_use]
    pub fn metadata(mut self, metadata: impl ExecutionMetadata + 'static) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    /// Sets the retry policy for transport calls.
    #[must_use]
    pub const fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the notifier.
    #[must_use]
    pub fn build(self) -> Notifier {
        let env = self.env.unwrap_or_else(|| Arc::new(ProcessEnv));
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(EnvMetadata::new(Arc::clone(&env))));

        Notifier {
            overrides: self.overrides,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(LogTransport::default())),
            renderer: self.renderer.unwrap_or_else(|| Arc::new(DefaultRenderer)),
            metadata,
            env,
            retry: self.retry,
        }
    }
}

impl fmt::Debug for NotifierBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierBuilder")
            .field("overrides", &self.overrides)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
