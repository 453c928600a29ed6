//! BoxToolRegistry -- object-safe dynamic dispatch wrapper for ToolRegistry.
//!
//! Same blanket-impl pattern as the other `Box*` wrappers:
//! 1. Define an object-safe `ToolRegistryDyn` trait with boxed futures
//! 2. Blanket-impl `ToolRegistryDyn` for all `T: ToolRegistry`
//! 3. `BoxToolRegistry` wraps `Arc<dyn ToolRegistryDyn>` and delegates
//!
//! The wrapper holds an `Arc` so each parallel tool task can own a clone.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chatflow_types::error::ToolError;
use chatflow_types::tool::{ToolCall, ToolSpec};

use super::registry::ToolRegistry;

/// Object-safe version of [`ToolRegistry`] with boxed futures.
pub trait ToolRegistryDyn: Send + Sync {
    fn specs(&self) -> Vec<ToolSpec>;

    fn call_boxed<'a>(
        &'a self,
        call: &'a ToolCall,
    ) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;
}

impl<T: ToolRegistry> ToolRegistryDyn for T {
    fn specs(&self) -> Vec<ToolSpec> {
        ToolRegistry::specs(self)
    }

    fn call_boxed<'a>(
        &'a self,
        call: &'a ToolCall,
    ) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>> {
        Box::pin(self.call(call))
    }
}

/// Type-erased, cloneable tool registry.
#[derive(Clone)]
pub struct BoxToolRegistry {
    inner: Arc<dyn ToolRegistryDyn>,
}

impl BoxToolRegistry {
    pub fn new<T: ToolRegistry + 'static>(registry: T) -> Self {
        Self {
            inner: Arc::new(registry),
        }
    }

    /// A registry with no tools. Every call fails with `NotFound`.
    pub fn empty() -> Self {
        Self::new(EmptyRegistry)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.inner.specs()
    }

    /// Run one call and return its textual result.
    pub async fn call(&self, call: &ToolCall) -> Result<String, ToolError> {
        self.inner.call_boxed(call).await
    }
}

impl std::fmt::Debug for BoxToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.specs().into_iter().map(|s| s.name).collect();
        f.debug_struct("BoxToolRegistry")
            .field("tools", &names)
            .finish()
    }
}

struct EmptyRegistry;

impl ToolRegistry for EmptyRegistry {
    fn specs(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    async fn call(&self, call: &ToolCall) -> Result<String, ToolError> {
        Err(ToolError::NotFound(call.name().to_string()))
    }
}
