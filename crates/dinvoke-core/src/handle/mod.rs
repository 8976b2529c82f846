//! One-shot result slot shared between the request sender, the reply reader and any waiters.
//!
//! ## Contract
//! - [`ResultHandle::set_result`] may be called once; a second call is [`InvokeError::IllegalState`].
//! - Callbacks registered before the value is set run exactly once, in registration order, on the
//!   task that sets the value, before any waiter is released.
//! - Callbacks registered after the value is set run immediately on the registering task.
//! - A panicking callback is logged and skipped; the remaining callbacks and waiters still run.
//! - All waiters are released once the value is set; every later wait returns the same value.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use dinvoke_model::CorrelationId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::InvokeError;

type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

/// Waitable, callback-capable, set-once value slot. Cloning yields another handle to the same slot.
pub struct ResultHandle<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    request_id: Option<CorrelationId>,
    /// Published after callbacks have run; waiters only look at this.
    set: AtomicBool,
    state: Mutex<State<T>>,
    notify: Notify,
}

struct State<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
}

impl<T> Clone for ResultHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for ResultHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ResultHandle<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Handle bound to the request carrying `id`.
    pub fn for_request(id: CorrelationId) -> Self {
        Self::build(Some(id))
    }

    fn build(request_id: Option<CorrelationId>) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_id,
                set: AtomicBool::new(false),
                state: Mutex::new(State {
                    value: None,
                    callbacks: Vec::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    pub fn request_id(&self) -> Option<&CorrelationId> {
        self.inner.request_id.as_ref()
    }

    /// Returns `true` once the value is visible to waiters.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Returns the value if it has been set, without waiting.
    pub fn try_get(&self) -> Option<T> {
        if !self.is_set() {
            return None;
        }
        self.lock().value.clone()
    }

    /// Store `value`, run pending callbacks, then wake every waiter.
    pub fn set_result(&self, value: T) -> Result<(), InvokeError> {
        let callbacks = {
            let mut state = self.lock();
            if state.value.is_some() {
                return Err(InvokeError::IllegalState(format!(
                    "result already set{}",
                    self.describe()
                )));
            }
            state.value = Some(value.clone());
            std::mem::take(&mut state.callbacks)
        };

        for cb in callbacks {
            self.fire(cb, &value);
        }

        self.inner.set.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Register `cb`; it runs right away if the value is already there.
    pub fn register_callback<F>(&self, cb: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let ready = {
            let mut state = self.lock();
            match &state.value {
                Some(v) => v.clone(),
                None => {
                    state.callbacks.push(Box::new(cb));
                    return;
                }
            }
        };
        self.fire(Box::new(cb), &ready);
    }

    /// Wait until the value is set.
    ///
    /// Fails with [`InvokeError::Interrupted`] if `cancel` fires first.
    pub async fn wait_for_result(&self, cancel: &CancellationToken) -> Result<T, InvokeError> {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(v) = self.try_get() {
            return Ok(v);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(InvokeError::Interrupted),
            _ = &mut notified => self.try_get().ok_or_else(|| {
                InvokeError::IllegalState(format!("woken without a result{}", self.describe()))
            }),
        }
    }

    fn fire(&self, cb: Callback<T>, value: &T) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cb(value))) {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            error!(reason = %reason, "result callback panicked{}", self.describe());
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn describe(&self) -> String {
        match &self.inner.request_id {
            Some(id) => format!(" for request {id}"),
            None => String::new(),
        }
    }
}

impl<T> std::fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultHandle")
            .field("request_id", &self.inner.request_id)
            .field("set", &self.inner.set.load(Ordering::Acquire))
            .finish()
    }
}
