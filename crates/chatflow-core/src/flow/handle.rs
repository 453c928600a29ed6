//! In-flight request handles and the tools-at-send-time snapshot.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// One in-flight exchange, owned by the engine's pool.
///
/// Cancelling the token stops streaming. `paused` tells the owning task
/// whether the cancellation came from the user (keep partial output, deny
/// pending tools) or from abandonment (drop everything silently).
#[derive(Debug)]
pub struct RequestHandle {
    request_id: Uuid,
    paused: AtomicBool,
    cancel: CancellationToken,
}

impl RequestHandle {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            paused: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Mark paused and stop any streaming.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Stop without keeping any output.
    pub fn abandon(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Tool names offered with a request, captured together with its id.
///
/// Set once per send; returned tool calls are checked against it before
/// anything runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsAtSendTime {
    pub request_id: Uuid,
    pub tool_names: HashSet<String>,
}

impl ToolsAtSendTime {
    pub fn new<'a>(request_id: Uuid, names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            request_id,
            tool_names: names.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn offers(&self, tool_name: &str) -> bool {
        self.tool_names.contains(tool_name)
    }
}
