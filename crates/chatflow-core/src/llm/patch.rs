//! ProviderPatch trait definition.
//!
//! Runs last in payload assembly and may add, rename, or drop parameters for
//! a provider's compatibility quirks. The default implementation lives in
//! chatflow-infra (`DefaultProviderPatch`).

use serde_json::{Map, Value};

use chatflow_types::llm::ProviderType;

/// Request facts a patch may key on besides the parameters themselves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchContext {
    pub model: String,
    pub stream: bool,
    pub has_tools: bool,
    pub base_url: Option<String>,
}

/// Provider-specific parameter rewriting.
pub trait ProviderPatch: Send + Sync {
    fn patch(
        &self,
        params: Map<String, Value>,
        provider: ProviderType,
        context: &PatchContext,
    ) -> Map<String, Value>;
}

/// Leaves parameters untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPatch;

impl ProviderPatch for NoPatch {
    fn patch(
        &self,
        params: Map<String, Value>,
        _provider: ProviderType,
        _context: &PatchContext,
    ) -> Map<String, Value> {
        params
    }
}
