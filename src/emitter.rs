//! Synchronous publish/subscribe event notifier.
//!
//! Sockets and transports report lifecycle changes through an [`Emitter`].
//! Subscribers are invoked synchronously, in subscription order, on whatever
//! task triggered the emission — consumers must not assume a particular
//! thread.
//!
//! # Delivery Semantics
//!
//! - Listener invocation order is subscription order.
//! - [`Emitter::once`] registrations are removed from the live list before
//!   their callback runs, so a one-shot listener fires exactly once even if
//!   its own callback re-emits the same event.
//! - Emission iterates over a snapshot of the subscriber list: a listener
//!   may subscribe or unsubscribe anything during dispatch without skipping
//!   or duplicating the other listeners of that pass.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::parser::Packet;
use crate::socket::Handshake;

// ============================================================================
// Types
// ============================================================================

/// Callback type invoked with the emission's argument list.
pub type Listener = Arc<dyn Fn(&[EventArg]) + Send + Sync + 'static>;

/// Handle identifying one subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

// ============================================================================
// EventArg
// ============================================================================

/// Argument values carried by an emission.
///
/// One sum type replaces per-event listener interfaces: every event's
/// payload is expressible as a short sequence of these.
#[derive(Debug, Clone)]
pub enum EventArg {
    /// A UTF-8 string: message data, close reason, transport name.
    Text(String),
    /// Raw bytes: binary message data.
    Binary(Vec<u8>),
    /// A decoded wire packet.
    Packet(Packet),
    /// The parsed handshake.
    Handshake(Handshake),
    /// An error being reported.
    Error(Arc<Error>),
}

impl EventArg {
    /// Returns the string value, if this argument is text.
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the packet, if this argument is one.
    #[inline]
    #[must_use]
    pub fn as_packet(&self) -> Option<&Packet> {
        match self {
            Self::Packet(packet) => Some(packet),
            _ => None,
        }
    }

    /// Returns the error, if this argument is one.
    #[inline]
    #[must_use]
    pub fn as_error(&self) -> Option<&Arc<Error>> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Registration entry for one subscriber.
struct Registration {
    token: ListenerToken,
    listener: Listener,
    once: bool,
}

/// Internal listener table.
#[derive(Default)]
struct EmitterState {
    next_id: u64,
    callbacks: FxHashMap<&'static str, Vec<Registration>>,
}

/// In-process, synchronous, ordered publish/subscribe.
///
/// Cheap to share: all mutation goes through an internal mutex which is
/// never held while a listener runs.
#[derive(Default)]
pub struct Emitter {
    state: Mutex<EmitterState>,
}

impl Emitter {
    /// Creates an emitter with no subscribers.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `listener` to `event`.
    ///
    /// Returns a token for [`Emitter::off`].
    pub fn on(
        &self,
        event: &'static str,
        listener: impl Fn(&[EventArg]) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe(event, Arc::new(listener), false)
    }

    /// Subscribes `listener` to `event` for a single delivery.
    ///
    /// The registration is removed before the callback is invoked, so the
    /// listener fires at most once across repeated emissions.
    pub fn once(
        &self,
        event: &'static str,
        listener: impl Fn(&[EventArg]) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe(event, Arc::new(listener), true)
    }

    fn subscribe(&self, event: &'static str, listener: Listener, once: bool) -> ListenerToken {
        let mut state = self.state.lock();
        let token = ListenerToken(state.next_id);
        state.next_id += 1;
        state.callbacks.entry(event).or_default().push(Registration {
            token,
            listener,
            once,
        });
        token
    }

    /// Removes one subscription.
    ///
    /// Unknown tokens are ignored, so unsubscribing from within a running
    /// callback (when the registration may already be gone) is safe.
    pub fn off(&self, event: &'static str, token: ListenerToken) {
        let mut state = self.state.lock();
        if let Some(registrations) = state.callbacks.get_mut(event) {
            registrations.retain(|registration| registration.token != token);
        }
    }

    /// Removes all subscriptions for `event`.
    pub fn off_event(&self, event: &'static str) {
        self.state.lock().callbacks.remove(event);
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.state.lock().callbacks.clear();
    }

    /// Invokes each current subscriber of `event` with `args`, in
    /// subscription order, synchronously on the calling task.
    pub fn emit(&self, event: &'static str, args: &[EventArg]) {
        let snapshot: Vec<Listener> = {
            let mut state = self.state.lock();
            match state.callbacks.get_mut(event) {
                Some(registrations) => {
                    let listeners = registrations
                        .iter()
                        .map(|registration| Arc::clone(&registration.listener))
                        .collect();
                    // One-shot entries leave the table before any callback
                    // runs; re-entrant emits cannot fire them twice.
                    registrations.retain(|registration| !registration.once);
                    listeners
                }
                None => return,
            }
        };

        for listener in snapshot {
            listener(args);
        }
    }

    /// Returns `true` if `event` has at least one subscriber.
    #[must_use]
    pub fn has_listeners(&self, event: &'static str) -> bool {
        self.state
            .lock()
            .callbacks
            .get(event)
            .is_some_and(|registrations| !registrations.is_empty())
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Emitter")
            .field("events", &state.callbacks.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text_args(args: &[EventArg]) -> String {
        args.first()
            .and_then(EventArg::as_text)
            .unwrap_or_default()
            .to_owned()
    }

    #[test]
    fn test_emit_in_subscription_order() {
        let emitter = Emitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = Arc::clone(&seen);
        emitter.on("foo", move |args| {
            seen_a.lock().push(format!("a:{}", text_args(args)));
        });
        let seen_b = Arc::clone(&seen);
        emitter.on("foo", move |args| {
            seen_b.lock().push(format!("b:{}", text_args(args)));
        });

        emitter.emit("foo", &[EventArg::Text("x".into())]);
        assert_eq!(*seen.lock(), vec!["a:x".to_owned(), "b:x".to_owned()]);
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let emitter = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        emitter.once("foo", move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit("foo", &[]);
        emitter.emit("foo", &[]);
        emitter.emit("foo", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_from_within_callback() {
        let emitter = Arc::new(Emitter::new());
        let count = Arc::new(AtomicUsize::new(0));

        let token_cell: Arc<Mutex<Option<ListenerToken>>> = Arc::new(Mutex::new(None));
        let emitter_clone = Arc::clone(&emitter);
        let token_clone = Arc::clone(&token_cell);
        let count_a = Arc::clone(&count);
        let token = emitter.on("foo", move |_| {
            count_a.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = *token_clone.lock() {
                emitter_clone.off("foo", token);
            }
        });
        *token_cell.lock() = Some(token);

        let count_b = Arc::clone(&count);
        emitter.on("foo", move |_| {
            count_b.fetch_add(10, Ordering::SeqCst);
        });

        // First emit: both listeners run, the first removes itself.
        emitter.emit("foo", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 11);

        // Second emit: only the second listener remains.
        emitter.emit("foo", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn test_off_event_clears_subscribers() {
        let emitter = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        emitter.on("foo", move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(emitter.has_listeners("foo"));

        emitter.off_event("foo");
        emitter.emit("foo", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!emitter.has_listeners("foo"));
    }

    #[test]
    fn test_off_removes_single_listener() {
        let emitter = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_a = Arc::clone(&count);
        let token = emitter.on("foo", move |_| {
            count_a.fetch_add(1, Ordering::SeqCst);
        });
        let count_b = Arc::clone(&count);
        emitter.on("foo", move |_| {
            count_b.fetch_add(10, Ordering::SeqCst);
        });

        emitter.off("foo", token);
        emitter.emit("foo", &[]);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_clear_removes_everything() {
        let emitter = Emitter::new();
        emitter.on("foo", |_| {});
        emitter.on("bar", |_| {});

        emitter.clear();
        assert!(!emitter.has_listeners("foo"));
        assert!(!emitter.has_listeners("bar"));
    }
}
