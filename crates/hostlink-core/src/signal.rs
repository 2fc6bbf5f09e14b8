//! Typed publish/subscribe used for detach/destroy/message notifications.

use std::sync::{Arc, Mutex};

/// Identifies a connected handler so it can be disconnected later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<A> = dyn Fn(&A) + Send + Sync;

struct Inner<A: ?Sized> {
    next_id: u64,
    handlers: Vec<(HandlerId, Arc<Handler<A>>)>,
}

/// A typed notification channel embedded in the entity that emits it.
///
/// Delivery is synchronous and deterministic: `emit` invokes every handler
/// that was connected at the moment of the call, in connection order.
/// Handlers may connect or disconnect other handlers (or themselves) while
/// an emit is in progress; such changes take effect from the next emit.
pub struct Signal<A> {
    inner: Mutex<Inner<A>>,
}

impl<A> Signal<A> {
    /// Create a signal with no connected handlers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                handlers: Vec::new(),
            }),
        }
    }

    /// Connect a handler, returning an id usable with [`Signal::disconnect`].
    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let id = HandlerId(inner.next_id);
        inner.next_id += 1;
        inner.handlers.push((id, Arc::new(handler)));
        id
    }

    /// Disconnect a previously connected handler.
    ///
    /// Returns `false` if the handler was already disconnected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.handlers.len();
        inner.handlers.retain(|(handler_id, _)| *handler_id != id);
        inner.handlers.len() != before
    }

    /// Invoke every currently connected handler with `args`.
    pub fn emit(&self, args: &A) {
        let handlers: Vec<Arc<Handler<A>>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .handlers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in handlers {
            handler(args);
        }
    }

    /// Number of connected handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.lock().unwrap().handlers.len()
    }
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}
