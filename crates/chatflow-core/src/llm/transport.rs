//! ChatTransport trait definition.
//!
//! The HTTP/SSE layer is an external collaborator. The engine only needs a
//! stream of events per request; dropping the stream closes the exchange.

use std::pin::Pin;

use futures_util::Stream;

use chatflow_types::llm::{TransportError, TransportEvent};

/// Stream of events for one outbound request.
pub type TransportStream =
    Pin<Box<dyn Stream<Item = Result<TransportEvent, TransportError>> + Send + 'static>>;

/// Sends prepared payloads to a provider.
///
/// Returns a boxed stream (not RPITIT) so the trait stays object-safe and
/// the engine can hold an `Arc<dyn ChatTransport>`.
pub trait ChatTransport: Send + Sync {
    /// Human-readable transport name, used in logs.
    fn name(&self) -> &str;

    /// Send `payload` and stream the response.
    ///
    /// The stream ends after a `Completed` event or the first error.
    fn stream(&self, payload: serde_json::Value) -> TransportStream;
}
