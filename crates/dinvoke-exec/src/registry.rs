//! Registry of task handlers keyed by the `kind` tag carried in [`dinvoke_model::TaskCall`].

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{ExecError, ExecResult};

/// Runs one kind of task on the worker.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Execute with the call's parameters. `cancel` fires when the worker shuts down.
    async fn call(&self, params: Value, cancel: CancellationToken) -> ExecResult<Value>;
}

/// Adapts an async closure over raw JSON into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecResult<Value>> + Send + 'static,
{
    async fn call(&self, params: Value, cancel: CancellationToken) -> ExecResult<Value> {
        (self.f)(params, cancel).await
    }
}

/// Wrap an async closure taking and returning raw JSON.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecResult<Value>> + Send + 'static,
{
    FnHandler { f }
}

struct Typed<F, P, R> {
    f: F,
    _marker: PhantomData<fn(P) -> R>,
}

#[async_trait]
impl<F, P, R, Fut> TaskHandler for Typed<F, P, R>
where
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecResult<R>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn call(&self, params: Value, cancel: CancellationToken) -> ExecResult<Value> {
        let params: P =
            serde_json::from_value(params).map_err(|e| ExecError::InvalidParams(e.to_string()))?;
        let out = (self.f)(params, cancel).await?;
        serde_json::to_value(out).map_err(|e| ExecError::Failed(format!("unserializable result: {e}")))
    }
}

/// Wrap an async closure over typed parameters and result.
///
/// Parameters that do not deserialize into `P` fail with [`ExecError::InvalidParams`].
pub fn typed<P, R, F, Fut>(f: F) -> impl TaskHandler
where
    F: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecResult<R>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    Typed {
        f,
        _marker: PhantomData,
    }
}

/// Shared, cloneable map from task kind to handler.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&self, kind: impl Into<String>, handler: impl TaskHandler) -> &Self {
        self.register_arc(kind, Arc::new(handler))
    }

    pub fn register_arc(&self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &Self {
        let kind = kind.into();
        trace!(kind = %kind, "task handler registered");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
        self
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind)
            .is_some()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(kind)
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}
