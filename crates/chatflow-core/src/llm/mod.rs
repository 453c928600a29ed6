//! Provider-facing abstractions.
//!
//! - `ChatTransport`: streams one request's response from a provider
//! - `ProviderPatch`: provider-specific parameter compatibility step

pub mod patch;
pub mod transport;
