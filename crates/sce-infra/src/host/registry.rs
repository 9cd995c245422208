//! Named handler registry for activities and child workflows.
//!
//! Handlers are async closures from a JSON input to a JSON output or an
//! error message. The registry is cheap to clone and shares its entries.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// A named external operation.
pub trait Handler: Send + Sync {
    fn call(&self, input: Value) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    fn call(&self, input: Value) -> HandlerFuture {
        Box::pin(self(input))
    }
}

/// Registry of handlers keyed by name, with an optional catch-all.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Arc<dyn Handler>>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a handler.
    pub fn register<H: Handler + 'static>(&self, name: impl Into<String>, handler: H) {
        let name = name.into();
        tracing::debug!(handler = %name, "registering handler");
        self.handlers.insert(name, Arc::new(handler));
    }

    /// Answer every unregistered name with `handler`.
    pub fn with_fallback<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    /// Register a handler that always answers with `value`.
    pub fn register_value(&self, name: impl Into<String>, value: Value) {
        self.register(name, move |_input: Value| {
            let value = value.clone();
            async move { Ok::<_, String>(value) }
        });
    }

    /// Register a handler that always fails with `message`.
    pub fn register_failure(&self, name: impl Into<String>, message: impl Into<String>) {
        let message = message.into();
        self.register(name, move |_input: Value| {
            let message = message.clone();
            async move { Err::<Value, _>(message) }
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve a handler by name, falling back to the catch-all.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.fallback.clone())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
