use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use mqrpc_core::{operation_names, ResponseBody};
use serde_json::Value;

use super::domain::NotifyHandler;

// ---------------------------------------------------------------------------
// OperationHandler trait
// ---------------------------------------------------------------------------

/// Business logic for one operation tag.
///
/// A handler receives the decoded JSON payload and produces the response body.
/// Returning `Err` yields an `"Internal error: ..."` failure reply; the
/// request is still answered.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> anyhow::Result<ResponseBody>;
}

/// Adapter for synchronous closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F> OperationHandler for FnHandler<F>
where
    F: Fn(Value) -> ResponseBody + Send + Sync + 'static,
{
    async fn handle(&self, payload: Value) -> anyhow::Result<ResponseBody> {
        Ok((self.0)(payload))
    }
}

/// Adapter for closures returning a future.
struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> OperationHandler for AsyncFnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ResponseBody>> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> anyhow::Result<ResponseBody> {
        (self.0)(payload).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Open mapping from operation tag to handler.
///
/// Populated once before the server starts and read-only afterwards, so a
/// plain `HashMap` behind the router's `Arc` is enough. Registering a tag
/// twice replaces the earlier handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in operations (`NOTIFY`).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(operation_names::NOTIFY, NotifyHandler);
        registry
    }

    /// Registers a handler for `operation`.
    pub fn register<H>(&mut self, operation: impl Into<String>, handler: H) -> &mut Self
    where
        H: OperationHandler + 'static,
    {
        self.handlers.insert(operation.into(), Arc::new(handler));
        self
    }

    /// Registers a synchronous closure.
    pub fn register_fn<F>(&mut self, operation: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> ResponseBody + Send + Sync + 'static,
    {
        self.register(operation, FnHandler(f))
    }

    /// Registers an async closure.
    pub fn register_async<F, Fut>(&mut self, operation: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ResponseBody>> + Send + 'static,
    {
        self.register(operation, AsyncFnHandler(f))
    }

    #[must_use]
    pub fn get(&self, operation: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(operation).cloned()
    }

    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Registered operation tags, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("operations", &self.operations())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
