//! Prioritized, fault-isolated notification dispatch.
//!
//! Every protocol event flows through a [`Notification`] facade. A raise runs
//! the [`Priority::High`] handlers synchronously on the raising thread (the
//! network parser), then hands one request covering the
//! [`Priority::Normal`] and [`Priority::Low`] handlers to the process-wide
//! [`DispatchPool`].
//!
//! Handlers are isolated from one another: an error or panic in one handler is
//! reported to the fault hook (see [`set_fault_hook`]) and the next handler
//! runs as usual. Nothing a handler does can unwind into the raiser.
//!
//! ```
//! use bncs_client::dispatch::{Handler, Priority};
//!
//! let handler: Handler<String> = Handler::named("echo", |_source, text: &String| {
//!     println!("{text}");
//!     Ok(())
//! });
//! assert_eq!(handler.label(), Some("echo"));
//! assert!(Priority::High < Priority::Normal);
//! ```

mod notification;
mod pool;
mod registry;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use notification::{Notification, ReleaseAction};
pub use pool::DispatchPool;
pub use registry::{reset_fault_hook, set_fault_hook, FaultContext, FaultHook};

pub(crate) use registry::SubscriptionTable;

/// Delivery stage of a handler.
///
/// Ordered for staging: every `High` handler of a raise completes before any
/// `Normal` handler starts, and `Normal` before `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Runs synchronously on the raising thread. Must be fast and non-blocking.
    High,
    /// Runs on a dispatch worker. The default for plain subscriptions.
    Normal,
    /// Runs on a dispatch worker after every `Normal` handler of the same raise.
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(name)
    }
}

/// Identifies the client instance that raised a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Process-unique identity of a [`Handler`]. Clones share the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Error type returned by a failing handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every handler callback.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type HandlerFn<P> = dyn Fn(&ClientId, &P) -> HandlerResult + Send + Sync;

/// A subscriber callback for payloads of type `P`.
///
/// Equality is identity: a handler equals its clones and nothing else, which
/// is what `unsubscribe` matches on. Subscribing the same handler twice
/// registers it twice.
pub struct Handler<P> {
    id: HandlerId,
    label: Option<Arc<str>>,
    func: Arc<HandlerFn<P>>,
}

impl<P> Handler<P> {
    /// Wrap a callback.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&ClientId, &P) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            id: HandlerId(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)),
            label: None,
            func: Arc::new(func),
        }
    }

    /// Wrap a callback with a label that shows up in fault reports.
    pub fn named<F>(label: impl Into<Arc<str>>, func: F) -> Self
    where
        F: Fn(&ClientId, &P) -> HandlerResult + Send + Sync + 'static,
    {
        let mut handler = Self::new(func);
        handler.label = Some(label.into());
        handler
    }

    /// This handler's identity.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// The diagnostic label, if any.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn call(&self, source: &ClientId, payload: &P) -> HandlerResult {
        (self.func)(source, payload)
    }
}

impl<P> Clone for Handler<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: self.label.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<P> PartialEq for Handler<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<P> Eq for Handler<P> {}

impl<P> fmt::Debug for Handler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn clones_compare_equal_and_fresh_handlers_do_not() {
        let a: Handler<u32> = Handler::new(|_, _| Ok(()));
        let b: Handler<u32> = Handler::new(|_, _| Ok(()));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn priority_orders_high_first() {
        let mut all = vec![Priority::Low, Priority::High, Priority::Normal];
        all.sort();
        assert_eq!(all, vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn priority_round_trips_through_config_names() {
        let parsed: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Priority::Low);
        assert_eq!(Priority::Normal.to_string(), "normal");
    }

    #[test]
    fn handler_debug_shows_label() {
        let h: Handler<()> = Handler::named("greeter", |_, _| Ok(()));
        assert!(format!("{h:?}").contains("greeter"));
    }
}
