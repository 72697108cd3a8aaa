//! Callback registry and fan-out
//!
//! Handlers are stored behind a single async call signature. Synchronous
//! closures are wrapped into an already-completed future, so the dispatcher
//! awaits every handler the same way and frame N is fully handled before
//! frame N+1 is read.

use crate::protocol::Frame;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handler for decoded frames
pub trait Callback: Send + Sync {
    fn call(&self, frame: Arc<Frame>) -> BoxFuture<'static, ()>;
}

struct SyncCallback<F>(F);

impl<F> Callback for SyncCallback<F>
where
    F: Fn(&Frame) + Send + Sync,
{
    fn call(&self, frame: Arc<Frame>) -> BoxFuture<'static, ()> {
        (self.0)(&frame);
        Box::pin(futures::future::ready(()))
    }
}

struct AsyncCallback<F>(F);

impl<F, Fut> Callback for AsyncCallback<F>
where
    F: Fn(Arc<Frame>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, frame: Arc<Frame>) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(frame))
    }
}

/// Wrap a synchronous closure as a callback
pub fn sync_callback<F>(f: F) -> Arc<dyn Callback>
where
    F: Fn(&Frame) + Send + Sync + 'static,
{
    Arc::new(SyncCallback(f))
}

/// Wrap an async closure as a callback
pub fn async_callback<F, Fut>(f: F) -> Arc<dyn Callback>
where
    F: Fn(Arc<Frame>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(AsyncCallback(f))
}

/// Token returned by registration, used to remove the callback again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u64);

/// Hook invoked once per lost connection, before any reconnect attempt
pub(crate) type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Registered callbacks, shared between the read loop and callers
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    next_token: AtomicU64,
    callbacks: Mutex<Vec<(CallbackToken, Arc<dyn Callback>)>>,
    on_disconnect: Mutex<Option<DisconnectHook>>,
}

impl CallbackRegistry {
    pub fn register(&self, callback: Arc<dyn Callback>) -> CallbackToken {
        let token = CallbackToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push((token, callback));
        }
        token
    }

    /// Returns false if the token was not registered
    pub fn remove(&self, token: CallbackToken) -> bool {
        let Ok(mut callbacks) = self.callbacks.lock() else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != token);
        callbacks.len() != before
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Callback>> {
        self.callbacks
            .lock()
            .map(|callbacks| callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Hand a frame to every registered callback in registration order.
    ///
    /// Iterates over a copy of the registry: a callback removed while a frame
    /// is in flight may still see that frame, but none after it.
    pub async fn dispatch(&self, frame: Frame) {
        let frame = Arc::new(frame);
        for callback in self.snapshot() {
            callback.call(Arc::clone(&frame)).await;
        }
    }

    /// Replace the disconnect hook
    pub fn set_disconnect_hook(&self, hook: DisconnectHook) {
        if let Ok(mut current) = self.on_disconnect.lock() {
            *current = Some(hook);
        }
    }

    pub fn notify_disconnect(&self) {
        let hook = self.on_disconnect.lock().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook();
        }
    }
}
