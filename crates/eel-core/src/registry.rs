//! Exposure registry: locally callable functions by name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{EelError, HandlerError, Result};
use crate::message::ADD_SERVER_FUNCTION;

/// A function the peer may invoke by name.
///
/// Parameters arrive positionally, exactly as listed in the Command.
#[async_trait]
pub trait ExposedFunction: Send + Sync {
    async fn call(&self, params: Vec<Value>) -> std::result::Result<Value, HandlerError>;
}

struct SyncFn<F>(F);

#[async_trait]
impl<F> ExposedFunction for SyncFn<F>
where
    F: Fn(Vec<Value>) -> std::result::Result<Value, HandlerError> + Send + Sync,
{
    async fn call(&self, params: Vec<Value>) -> std::result::Result<Value, HandlerError> {
        (self.0)(params)
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> ExposedFunction for AsyncFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, params: Vec<Value>) -> std::result::Result<Value, HandlerError> {
        (self.0)(params).await
    }
}

/// Wrap a synchronous closure.
pub fn from_fn<F>(f: F) -> Arc<dyn ExposedFunction>
where
    F: Fn(Vec<Value>) -> std::result::Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(SyncFn(f))
}

/// Wrap a closure returning a future.
pub fn from_async<F, Fut>(f: F) -> Arc<dyn ExposedFunction>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(AsyncFn(f))
}

/// Deserialize the positional argument at `index`.
pub fn arg<T: DeserializeOwned>(params: &[Value], index: usize) -> std::result::Result<T, HandlerError> {
    let value = params
        .get(index)
        .ok_or(HandlerError::MissingArgument(index))?;
    serde_json::from_value(value.clone()).map_err(|e| HandlerError::InvalidArgument {
        index,
        message: e.to_string(),
    })
}

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    handlers: HashMap<String, Arc<dyn ExposedFunction>>,
}

/// Name → handler table. One handler per name for the registry's lifetime.
#[derive(Default)]
pub struct ExposureRegistry {
    entries: RwLock<Entries>,
}

impl ExposureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// A name that is already taken is rejected and the existing handler
    /// stays in place.
    pub fn register(&self, name: &str, handler: Arc<dyn ExposedFunction>) -> Result<()> {
        if name == ADD_SERVER_FUNCTION {
            return Err(EelError::ReservedName(name.to_owned()));
        }
        let mut entries = self.entries.write();
        if entries.handlers.contains_key(name) {
            return Err(EelError::DuplicateExposure(name.to_owned()));
        }
        let _ = entries.handlers.insert(name.to_owned(), handler);
        entries.order.push(name.to_owned());
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ExposedFunction>> {
        self.entries
            .read()
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| EelError::FunctionNotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().handlers.contains_key(name)
    }

    /// All names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
