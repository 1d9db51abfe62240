//! The per-kind notification facade.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use super::pool::{DeferredDispatch, DispatchPool};
use super::{ClientId, Handler, HandlerResult, Priority, SubscriptionTable};
use crate::event::NotificationKind;

/// Action run once after the last deferred handler of a raise has returned.
///
/// Used to hand pooled receive buffers back once nothing can observe the
/// payload anymore.
pub type ReleaseAction = Box<dyn FnOnce() + Send + 'static>;

/// Subscribe/unsubscribe/raise surface for one notification kind.
///
/// The plain [`subscribe`](Self::subscribe) / [`unsubscribe`](Self::unsubscribe)
/// pair always targets [`Priority::Normal`].
pub struct Notification<P> {
    table: Arc<SubscriptionTable<P>>,
    pool: Arc<DispatchPool>,
    source: ClientId,
}

impl<P> Notification<P>
where
    P: fmt::Debug + Send + 'static,
{
    pub(crate) fn new(
        kind: NotificationKind,
        source: ClientId,
        pool: Arc<DispatchPool>,
        fault_limit: Option<NonZeroU32>,
    ) -> Self {
        Self {
            table: Arc::new(SubscriptionTable::new(kind, fault_limit)),
            pool,
            source,
        }
    }

    /// Which notification this facade delivers.
    pub fn kind(&self) -> NotificationKind {
        self.table.kind()
    }

    /// Register `handler` at [`Priority::Normal`].
    pub fn subscribe(&self, handler: Handler<P>) {
        self.table.subscribe(Priority::Normal, handler);
    }

    /// Register a closure at [`Priority::Normal`] and return its handle.
    pub fn subscribe_fn<F>(&self, func: F) -> Handler<P>
    where
        F: Fn(&ClientId, &P) -> HandlerResult + Send + Sync + 'static,
    {
        let handler = Handler::new(func);
        self.subscribe(handler.clone());
        handler
    }

    /// Remove the first [`Priority::Normal`] registration of `handler`.
    /// Returns `false` (and does nothing) if it was not registered.
    pub fn unsubscribe(&self, handler: &Handler<P>) -> bool {
        self.table.unsubscribe(Priority::Normal, handler)
    }

    /// Append `handler` to the tail of the `priority` bucket. Duplicates are
    /// kept.
    pub fn subscribe_with_priority(&self, priority: Priority, handler: Handler<P>) {
        self.table.subscribe(priority, handler);
    }

    /// Remove the first registration of `handler` from the `priority` bucket.
    pub fn unsubscribe_with_priority(&self, priority: Priority, handler: &Handler<P>) -> bool {
        self.table.unsubscribe(priority, handler)
    }

    /// Number of registrations in the `priority` bucket.
    pub fn handler_count(&self, priority: Priority) -> usize {
        self.table.len(priority)
    }

    /// Deliver `payload` to every subscriber.
    ///
    /// High-priority handlers run before this returns; Normal then Low
    /// handlers run later on a dispatch worker. Handler failures never reach
    /// the caller.
    pub fn raise(&self, payload: P) {
        self.dispatch(payload, None);
    }

    /// Like [`raise`](Self::raise), running `release` after the last Low
    /// handler has returned.
    pub fn raise_with_release(&self, payload: P, release: ReleaseAction) {
        self.dispatch(payload, Some(release));
    }

    fn dispatch(&self, payload: P, release: Option<ReleaseAction>) {
        let high = self.table.snapshot(Priority::High);
        if !high.is_empty() {
            self.table
                .invoke_bucket(Priority::High, &high, &self.source, &payload);
        }

        // Handlers registered at raise time are the ones that run, even if
        // they unsubscribe before the deferred stage is reached.
        let stages: Vec<(Priority, Vec<Handler<P>>)> = [Priority::Normal, Priority::Low]
            .into_iter()
            .map(|priority| (priority, self.table.snapshot(priority)))
            .filter(|(_, handlers)| !handlers.is_empty())
            .collect();
        if stages.is_empty() && release.is_none() {
            return;
        }

        self.pool.submit(Box::new(DispatchRequest {
            table: Arc::clone(&self.table),
            source: self.source,
            payload,
            stages,
            release,
        }));
    }
}

impl<P> fmt::Debug for Notification<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("kind", &self.table.kind())
            .field("source", &self.source)
            .finish()
    }
}

/// The deferred half of one raise.
struct DispatchRequest<P> {
    table: Arc<SubscriptionTable<P>>,
    source: ClientId,
    payload: P,
    stages: Vec<(Priority, Vec<Handler<P>>)>,
    release: Option<ReleaseAction>,
}

impl<P> DeferredDispatch for DispatchRequest<P>
where
    P: fmt::Debug + Send + 'static,
{
    fn kind(&self) -> NotificationKind {
        self.table.kind()
    }

    fn run(self: Box<Self>) {
        let request = *self;
        for (priority, handlers) in &request.stages {
            request
                .table
                .invoke_bucket(*priority, handlers, &request.source, &request.payload);
        }
        if let Some(release) = request.release {
            release();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn facade(pool: &Arc<DispatchPool>) -> Notification<String> {
        Notification::new(
            NotificationKind::UserSpoke,
            ClientId::new(),
            Arc::clone(pool),
            None,
        )
    }

    #[test]
    fn high_runs_on_raising_thread_before_raise_returns() {
        let pool = Arc::new(DispatchPool::with_workers(1).unwrap());
        let notification = facade(&pool);
        let raiser = std::thread::current().id();
        let (tx, rx) = mpsc::channel();
        notification.subscribe_with_priority(
            Priority::High,
            Handler::new(move |_, _: &String| {
                tx.send(std::thread::current().id()).unwrap();
                Ok(())
            }),
        );
        notification.raise("hi".into());
        assert_eq!(rx.try_recv().unwrap(), raiser);
    }

    #[test]
    fn plain_subscribe_targets_normal() {
        let pool = Arc::new(DispatchPool::with_workers(1).unwrap());
        let notification = facade(&pool);
        let handler = notification.subscribe_fn(|_, _| Ok(()));
        assert_eq!(notification.handler_count(Priority::Normal), 1);
        assert!(notification.unsubscribe(&handler));
        assert_eq!(notification.handler_count(Priority::Normal), 0);
    }

    #[test]
    fn release_runs_even_without_deferred_handlers() {
        let pool = Arc::new(DispatchPool::with_workers(1).unwrap());
        let notification = facade(&pool);
        let (tx, rx) = mpsc::channel();
        notification.raise_with_release(
            "payload".into(),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn unsubscribe_after_raise_does_not_cancel_pending_work() {
        let pool = Arc::new(DispatchPool::with_workers(1).unwrap());
        let notification = facade(&pool);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();

        // Blocks the only worker until the gate opens.
        let blocker = Notification::<String>::new(
            NotificationKind::UserSpoke,
            ClientId::new(),
            Arc::clone(&pool),
            None,
        );
        let gate_rx = parking_lot::Mutex::new(gate_rx);
        blocker.subscribe(Handler::new(move |_, _: &String| {
            let _ = gate_rx.lock().recv_timeout(Duration::from_secs(5));
            Ok(())
        }));
        blocker.raise("block".into());

        let handler = notification.subscribe_fn(move |_, text: &String| {
            seen_tx.send(text.clone()).unwrap();
            Ok(())
        });
        notification.raise("late".into());
        assert!(notification.unsubscribe(&handler));
        gate_tx.send(()).unwrap();

        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }
}
