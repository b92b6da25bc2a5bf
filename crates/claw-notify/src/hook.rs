//! Interception of the `tracing` dispatch.
//!
//! An installation wraps whatever dispatch is active with an [`Interceptor`].
//! The interceptor turns qualifying events into [`LogRecord`]s, hands them to
//! its [`RecordSink`], then forwards the event unchanged to the dispatch it
//! wrapped. Installing inside an existing installation stacks another
//! interceptor on top, so nested invocations compose.
//!
//! Bookkeeping lives in the process-wide [`HookRegistry`]. Every installation
//! gets a [`HookToken`]; uninstalling a token restores the dispatch that was
//! active when that token was installed.
//!
//! Records are handed to the sink on a short-lived delivery thread whose
//! default dispatch is the original, non-intercepted one. The intercepted call
//! site blocks until the sink returns. Anything the sink logs goes to the
//! original dispatch and is never intercepted again.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::dispatcher::{self, DefaultGuard, Dispatch};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::{Interest, Subscriber};
use tracing::{Event, Metadata, error};

use crate::error::{NotifyError, Result};
use crate::pipeline::RecordSink;
use crate::types::{ErrorContext, LogRecord, Severity};

/// Event field that marks a record as critical.
pub const CRITICAL_FIELD: &str = "critical";

/// Event field that names the kind of an attached error.
pub const ERROR_KIND_FIELD: &str = "error.kind";

const DELIVERY_THREAD: &str = "claw-notify-delivery";

static REGISTRY: Lazy<HookRegistry> = Lazy::new(HookRegistry::new);

thread_local! {
    static SCOPES: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
}

/// Identifies one installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookToken {
    index: usize,
    generation: u64,
}

impl fmt::Display for HookToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct HookState {
    active: AtomicBool,
    sequence: AtomicU64,
}

impl HookState {
    fn activated() -> Arc<Self> {
        let state = Self::default();
        state.active.store(true, Ordering::Release);
        Arc::new(state)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

/// A dispatch layer that captures records for one installation.
pub struct Interceptor {
    next: Dispatch,
    original: Dispatch,
    sink: Arc<dyn RecordSink>,
    min_level: Severity,
    state: Arc<HookState>,
}

impl Interceptor {
    /// Returns the non-intercepted dispatch at the bottom of the chain.
    #[must_use]
    pub const fn original(&self) -> &Dispatch {
        &self.original
    }

    /// Returns true while the installation is live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    fn wants(&self, metadata: &Metadata<'_>) -> bool {
        if !metadata.is_event() || !self.state.is_active() {
            return false;
        }
        Severity::from_level(metadata.level()) >= self.min_level
            || metadata.fields().field(CRITICAL_FIELD).is_some()
    }

    fn capture(&self, event: &Event<'_>) -> LogRecord {
        let metadata = event.metadata();
        let mut record =
            LogRecord::new(Severity::from_level(metadata.level()), String::new())
                .with_logger(metadata.target());

        let mut visitor = RecordVisitor::new(&mut record);
        event.record(&mut visitor);
        let RecordVisitor {
            error_kind,
            critical,
            ..
        } = visitor;

        if let (Some(kind), Some(error)) = (error_kind, record.error.as_mut()) {
            error.kind = kind;
        }
        if critical {
            record.level = Severity::Critical;
        }
        record.sequence = self.state.next_sequence();
        record
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("min_level", &self.min_level)
            .field("active", &self.state.is_active())
            .finish_non_exhaustive()
    }
}

impl Subscriber for Interceptor {
    fn register_callsite(&self, _metadata: &'static Metadata<'static>) -> Interest {
        // The answer depends on whether this installation is still live.
        Interest::sometimes()
    }

    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.next.enabled(metadata) || self.wants(metadata)
    }

    fn new_span(&self, span: &Attributes<'_>) -> Id {
        self.next.new_span(span)
    }

    fn record(&self, span: &Id, values: &Record<'_>) {
        self.next.record(span, values);
    }

    fn record_follows_from(&self, span: &Id, follows: &Id) {
        self.next.record_follows_from(span, follows);
    }

    fn event(&self, event: &Event<'_>) {
        if self.wants(event.metadata()) {
            let record = self.capture(event);
            deliver(self.sink.as_ref(), &self.original, record);
        }
        if self.next.enabled(event.metadata()) {
            self.next.event(event);
        }
    }

    fn enter(&self, span: &Id) {
        self.next.enter(span);
    }

    fn exit(&self, span: &Id) {
        self.next.exit(span);
    }

    fn clone_span(&self, id: &Id) -> Id {
        self.next.clone_span(id)
    }

    fn try_close(&self, id: Id) -> bool {
        self.next.try_close(id)
    }
}

/// Runs the sink on a delivery thread with `original` as its default dispatch.
///
/// `tracing` drops events emitted from inside a subscriber callback, so the
/// sink cannot log from the intercepted thread.
///
/// Returns false if the record was lost, either because the delivery thread
/// could not be started or because the sink panicked. Both are logged to
/// `original`; neither reaches the workload.
fn deliver(sink: &dyn RecordSink, original: &Dispatch, record: LogRecord) -> bool {
    let sequence = record.sequence;
    let delivered = thread::scope(|scope| {
        let spawned = thread::Builder::new()
            .name(DELIVERY_THREAD.to_string())
            .spawn_scoped(scope, move || {
                dispatcher::with_default(original, || sink.on_record(record));
            });
        match spawned {
            Ok(handle) => match handle.join() {
                Ok(()) => Ok(()),
                Err(payload) => Err(format!(
                    "record sink panicked: {}",
                    ErrorContext::from_panic(payload.as_ref()).message
                )),
            },
            Err(e) => Err(format!("could not start delivery thread: {e}")),
        }
    });

    match delivered {
        Ok(()) => true,
        Err(reason) => {
            report_lost(original, sequence, &reason);
            false
        }
    }
}

/// Logs a lost record to `original`. Runs on its own thread for the same
/// reason as [`deliver`]; if even that thread cannot start, the inline attempt
/// is all that is left.
fn report_lost(original: &Dispatch, sequence: u64, reason: &str) {
    let log = || {
        dispatcher::with_default(original, || {
            error!(sequence, reason, "notification record dropped");
        });
    };
    let logged = thread::scope(|scope| {
        thread::Builder::new()
            .name(DELIVERY_THREAD.to_string())
            .spawn_scoped(scope, log)
            .is_ok_and(|handle| handle.join().is_ok())
    });
    if !logged {
        log();
    }
}

struct RecordVisitor<'a> {
    record: &'a mut LogRecord,
    error_kind: Option<String>,
    critical: bool,
}

impl<'a> RecordVisitor<'a> {
    fn new(record: &'a mut LogRecord) -> Self {
        Self {
            record,
            error_kind: None,
            critical: false,
        }
    }

    fn text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.record.message = value,
            ERROR_KIND_FIELD => self.error_kind = Some(value),
            name => {
                self.record.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for RecordVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.text(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == CRITICAL_FIELD {
            self.critical = value;
        } else {
            self.text(field, value.to_string());
        }
    }

    fn record_error(&mut self, _field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record.error = Some(ErrorContext::from_dyn(value, None));
    }
}

struct Entry {
    thread: Option<ThreadId>,
    sink: Arc<dyn RecordSink>,
    original: Dispatch,
    state: Arc<HookState>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

impl Slots {
    fn insert(&mut self, entry: Entry) -> HookToken {
        let index = self.free.pop().unwrap_or_else(|| {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        });
        let slot = &mut self.slots[index];
        slot.entry = Some(entry);
        self.live += 1;
        HookToken {
            index,
            generation: slot.generation,
        }
    }

    fn get(&self, token: HookToken) -> Option<&Entry> {
        self.slots
            .get(token.index)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn remove(&mut self, token: HookToken, caller: ThreadId) -> Result<Entry> {
        let unknown = || NotifyError::UnknownHookToken {
            token: token.to_string(),
        };
        let slot = self
            .slots
            .get_mut(token.index)
            .filter(|slot| slot.generation == token.generation)
            .ok_or_else(unknown)?;

        match &slot.entry {
            None => return Err(unknown()),
            Some(entry) if entry.thread.is_some_and(|owner| owner != caller) => {
                return Err(NotifyError::HookThreadMismatch {
                    token: token.to_string(),
                });
            }
            Some(_) => {}
        }

        let entry = slot.entry.take().ok_or_else(unknown)?;
        slot.generation += 1;
        self.free.push(token.index);
        self.live -= 1;
        Ok(entry)
    }
}

struct Scope {
    token: HookToken,
    guard: DefaultGuard,
    retired: bool,
}

/// Process-wide record of live installations.
pub struct HookRegistry {
    slots: Mutex<Slots>,
}

impl HookRegistry {
    fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Returns the process-wide registry.
    #[must_use]
    pub fn global() -> &'static Self {
        &REGISTRY
    }

    /// Installs an interceptor over the current thread's dispatch.
    ///
    /// Events at or above `min_level`, or carrying `critical = true`, are
    /// handed to `sink`. The installation stays in effect on this thread
    /// until [`uninstall`](Self::uninstall) is called with the returned token,
    /// from this thread.
    pub fn install(&self, sink: Arc<dyn RecordSink>, min_level: Severity) -> HookToken {
        let (token, dispatch) = self.register(sink, min_level, Some(thread::current().id()));
        let guard = dispatcher::set_default(&dispatch);
        let _ = SCOPES.try_with(|scopes| {
            scopes.borrow_mut().push(Scope {
                token,
                guard,
                retired: false,
            });
        });
        token
    }

    /// Creates an installation that is not tied to the current thread.
    ///
    /// The returned dispatch must be attached to the work it should observe,
    /// typically with [`tracing::instrument::WithSubscriber`]. The token may
    /// be uninstalled from any thread.
    pub fn attach(&self, sink: Arc<dyn RecordSink>, min_level: Severity) -> (HookToken, Dispatch) {
        self.register(sink, min_level, None)
    }

    fn register(
        &self,
        sink: Arc<dyn RecordSink>,
        min_level: Severity,
        thread: Option<ThreadId>,
    ) -> (HookToken, Dispatch) {
        let next = dispatcher::get_default(Dispatch::clone);
        let original = original_of(&next);
        let state = HookState::activated();

        let token = self.slots.lock().insert(Entry {
            thread,
            sink: Arc::clone(&sink),
            original: original.clone(),
            state: Arc::clone(&state),
        });

        let interceptor = Interceptor {
            next,
            original,
            sink,
            min_level,
            state,
        };
        (token, Dispatch::new(interceptor))
    }

    /// Removes an installation.
    ///
    /// The interceptor stops capturing immediately. For a thread-scoped
    /// installation the dispatch recorded at install time is restored as soon
    /// as every installation stacked above it on the thread is gone; until
    /// then it forwards events untouched.
    pub fn uninstall(&self, token: HookToken) -> Result<()> {
        let entry = self.slots.lock().remove(token, thread::current().id())?;
        entry.state.active.store(false, Ordering::Release);
        if entry.thread.is_some() {
            unwind_scopes(token);
        }
        Ok(())
    }

    /// Routes a record straight to an installation's sink.
    ///
    /// Used for records that never passed through the logging facility, such
    /// as failures observed at the invocation boundary.
    pub fn record(&self, token: HookToken, mut record: LogRecord) -> Result<()> {
        let (sink, original, state) = {
            let slots = self.slots.lock();
            let entry = slots.get(token).ok_or_else(|| NotifyError::UnknownHookToken {
                token: token.to_string(),
            })?;
            (
                Arc::clone(&entry.sink),
                entry.original.clone(),
                Arc::clone(&entry.state),
            )
        };
        record.sequence = state.next_sequence();
        deliver(sink.as_ref(), &original, record);
        Ok(())
    }

    /// Returns true if `token` refers to a live installation.
    #[must_use]
    pub fn is_installed(&self, token: HookToken) -> bool {
        self.slots.lock().get(token).is_some()
    }

    /// Returns the number of live installations in the process.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.lock().live
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("live", &self.active_count())
            .finish()
    }
}

/// Marks `token` retired on this thread and drops every retired scope at the
/// top of the stack, restoring dispatches in reverse install order.
fn unwind_scopes(token: HookToken) {
    let released = SCOPES
        .try_with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            if let Some(scope) = scopes.iter_mut().find(|s| s.token == token) {
                scope.retired = true;
            }
            let mut released = Vec::new();
            while scopes.last().is_some_and(|s| s.retired) {
                if let Some(scope) = scopes.pop() {
                    released.push(scope.guard);
                }
            }
            released
        })
        .unwrap_or_default();
    // Topmost guard first; the borrow on SCOPES is already released.
    drop(released);
}

fn original_of(dispatch: &Dispatch) -> Dispatch {
    dispatch
        .downcast_ref::<Interceptor>()
        .map_or_else(|| dispatch.clone(), |i| i.original.clone())
}

/// Returns the current thread's dispatch with every interceptor peeled off.
#[must_use]
pub fn original_dispatch() -> Dispatch {
    dispatcher::get_default(original_of)
}

/// Returns the number of live installations scoped to the current thread.
#[must_use]
pub fn active_on_current_thread() -> usize {
    SCOPES
        .try_with(|scopes| scopes.borrow().iter().filter(|s| !s.retired).count())
        .unwrap_or(0)
}
