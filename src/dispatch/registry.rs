//! Subscription table and the fault-isolating dispatch executor.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroU32;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use super::{ClientId, Handler, HandlerId, Priority};
use crate::event::NotificationKind;

/// Process-wide receiver of subscriber faults.
pub type FaultHook = Arc<dyn Fn(&FaultContext) + Send + Sync>;

static FAULT_HOOK: RwLock<Option<FaultHook>> = parking_lot::const_rwlock(None);

/// Install the process-wide fault hook, replacing any previous one.
///
/// The hook is called once per failing handler invocation. A panic inside the
/// hook is caught and logged.
pub fn set_fault_hook(hook: FaultHook) {
    *FAULT_HOOK.write() = Some(hook);
}

/// Restore the default fault hook, which logs through `tracing`.
pub fn reset_fault_hook() {
    *FAULT_HOOK.write() = None;
}

/// Everything known about one failed handler invocation.
#[derive(Debug, Clone)]
pub struct FaultContext {
    /// The failing handler.
    pub handler: HandlerId,
    /// The failing handler's label, if it has one.
    pub handler_label: Option<String>,
    /// Which notification was being delivered.
    pub kind: NotificationKind,
    /// The bucket the handler was registered in.
    pub priority: Priority,
    /// The client that raised the notification.
    pub source: ClientId,
    /// `Debug` rendering of the payload.
    pub payload: String,
    /// The error the handler returned, or its panic message.
    pub error: String,
}

impl fmt::Display for FaultContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) failed handling {} at {} priority for client {}: {}",
            self.handler,
            self.handler_label.as_deref().unwrap_or("unnamed"),
            self.kind,
            self.priority,
            self.source,
            self.error
        )
    }
}

fn report_fault(context: &FaultContext) {
    let hook = FAULT_HOOK.read().clone();
    match hook {
        Some(hook) => {
            if catch_unwind(AssertUnwindSafe(|| hook(context))).is_err() {
                error!(handler = %context.handler, "fault hook panicked while reporting a fault");
            }
        }
        None => {
            error!(
                handler = %context.handler,
                label = context.handler_label.as_deref().unwrap_or("unnamed"),
                kind = %context.kind,
                priority = %context.priority,
                client = %context.source,
                payload = %context.payload,
                "notification handler failed: {}",
                context.error
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

struct TableInner<P> {
    buckets: HashMap<Priority, Vec<Handler<P>>>,
    faults: HashMap<(Priority, HandlerId), u32>,
    /// Handlers removed for reaching the fault limit. Requests already queued
    /// still hold them in their snapshots, so they are skipped by id.
    retired: HashSet<(Priority, HandlerId)>,
}

/// Per-kind mapping from [`Priority`] to an ordered list of handlers.
///
/// Buckets are created lazily on first subscribe. Creation and append happen
/// in the same critical section.
pub(crate) struct SubscriptionTable<P> {
    kind: NotificationKind,
    fault_limit: Option<NonZeroU32>,
    inner: Mutex<TableInner<P>>,
}

impl<P> SubscriptionTable<P> {
    pub(crate) fn new(kind: NotificationKind, fault_limit: Option<NonZeroU32>) -> Self {
        Self {
            kind,
            fault_limit,
            inner: Mutex::new(TableInner {
                buckets: HashMap::new(),
                faults: HashMap::new(),
                retired: HashSet::new(),
            }),
        }
    }

    pub(crate) fn kind(&self) -> NotificationKind {
        self.kind
    }

    pub(crate) fn subscribe(&self, priority: Priority, handler: Handler<P>) {
        let mut inner = self.inner.lock();
        // Subscribing again gives a retired handler a fresh start.
        inner.retired.remove(&(priority, handler.id()));
        inner.buckets.entry(priority).or_default().push(handler);
    }

    /// Remove the first occurrence of `handler` from the bucket. Returns
    /// whether anything was removed.
    pub(crate) fn unsubscribe(&self, priority: Priority, handler: &Handler<P>) -> bool {
        let mut inner = self.inner.lock();
        let Some(bucket) = inner.buckets.get_mut(&priority) else {
            return false;
        };
        let Some(index) = bucket.iter().position(|h| h == handler) else {
            return false;
        };
        bucket.remove(index);
        if !bucket.contains(handler) {
            inner.faults.remove(&(priority, handler.id()));
        }
        true
    }

    pub(crate) fn snapshot(&self, priority: Priority) -> Vec<Handler<P>> {
        self.inner
            .lock()
            .buckets
            .get(&priority)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn len(&self, priority: Priority) -> usize {
        self.inner.lock().buckets.get(&priority).map_or(0, Vec::len)
    }

    fn is_retired(&self, priority: Priority, handler: &Handler<P>) -> bool {
        self.fault_limit.is_some()
            && self
                .inner
                .lock()
                .retired
                .contains(&(priority, handler.id()))
    }

    fn record_fault(&self, priority: Priority, handler: &Handler<P>) {
        let Some(limit) = self.fault_limit else {
            return;
        };
        let key = (priority, handler.id());
        let mut inner = self.inner.lock();
        if inner.retired.contains(&key) {
            return;
        }
        let count = inner.faults.entry(key).or_insert(0);
        *count += 1;
        if *count < limit.get() {
            return;
        }
        inner.faults.remove(&key);
        inner.retired.insert(key);
        if let Some(bucket) = inner.buckets.get_mut(&priority) {
            bucket.retain(|h| h != handler);
        }
        warn!(
            handler = %handler.id(),
            kind = %self.kind,
            priority = %priority,
            limit = limit.get(),
            "handler removed after repeated faults"
        );
    }
}

impl<P: fmt::Debug> SubscriptionTable<P> {
    /// Call every handler in `handlers` in order. A failing handler is
    /// reported and skipped over; it never stops the handlers after it.
    pub(crate) fn invoke_bucket(
        &self,
        priority: Priority,
        handlers: &[Handler<P>],
        source: &ClientId,
        payload: &P,
    ) {
        for handler in handlers {
            if self.is_retired(priority, handler) {
                continue;
            }
            let error = match catch_unwind(AssertUnwindSafe(|| handler.call(source, payload))) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            report_fault(&FaultContext {
                handler: handler.id(),
                handler_label: handler.label().map(str::to_string),
                kind: self.kind,
                priority,
                source: *source,
                payload: format!("{payload:?}"),
                error,
            });
            self.record_fault(priority, handler);
        }
    }
}
