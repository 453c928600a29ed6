//! Broadcast bus for `FlowEvent`s, with per-request subscriptions.
//!
//! Every subscriber sees every event published after it subscribed. A
//! [`RequestEvents`] subscription narrows that to one request id and ends
//! once the request has produced its last event.

use chatflow_types::event::FlowEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default channel capacity; large enough for a streamed reply between reads.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Multi-producer, multi-consumer bus for request flow events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of `request_id` only.
    ///
    /// Nothing published before this call is replayed.
    pub fn subscribe_request(&self, request_id: Uuid) -> RequestEvents {
        RequestEvents {
            request_id,
            receiver: self.sender.subscribe(),
            missed: 0,
            done: false,
        }
    }

    /// Publish to all current subscribers. Dropped when nobody listens.
    pub fn publish(&self, event: FlowEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Flow event published with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Whether `event` is the last one its request emits.
///
/// A resend after tool results runs under a new request id, so tool results
/// close the original request whether or not a resend follows.
pub fn is_terminal(event: &FlowEvent) -> bool {
    matches!(
        event,
        FlowEvent::Finished { .. } | FlowEvent::ToolResults { .. } | FlowEvent::Error { .. }
    )
}

/// Events of a single request, in publish order.
#[derive(Debug)]
pub struct RequestEvents {
    request_id: Uuid,
    receiver: broadcast::Receiver<FlowEvent>,
    missed: u64,
    done: bool,
}

impl RequestEvents {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Events skipped because this subscriber fell behind the channel.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Next event of the request, or `None` after its terminal event or
    /// once the bus is gone.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.request_id() == Some(self.request_id) => {
                    self.done = is_terminal(&event);
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        request_id = %self.request_id,
                        skipped,
                        "Request subscriber lagged"
                    );
                    self.missed += skipped;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Drain the request to its end and return every event seen.
    pub async fn collect(mut self) -> Vec<FlowEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}
