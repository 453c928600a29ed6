//! Request flow engine.
//!
//! `FlowEngine` drives one conversation's requests: it validates ordering,
//! snapshots the offered tools together with a fresh request id, preprocesses
//! and streams the reply through the rewriter, post-processes the result,
//! and runs the tool permission/execution loop, resending until the model
//! answers without tool calls. Progress is reported on the [`EventBus`];
//! the current [`EngineState`] is observable through a `watch` channel.
//!
//! At most one request is current. Every send abandons whatever was in
//! flight, and every asynchronous step re-checks that its request is still
//! current before touching history.

pub mod handle;
mod tools;
pub mod validate;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};
use tracing::Instrument;
use uuid::Uuid;

use chatflow_types::config::FlowConfig;
use chatflow_types::error::{FlowError, RewriteError};
use chatflow_types::event::{EngineState, ErrorKind, FlowEvent, RequestType};
use chatflow_types::llm::{CompletedResponse, TransportError, TransportEvent};
use chatflow_types::message::{Content, Message, MessageKind};
use chatflow_types::tool::{ToolCallRecord, ToolCallStatus, ToolPolicy};

use crate::chat::session::SessionStore;
use crate::event::{EventBus, RequestEvents};
use crate::llm::transport::ChatTransport;
use crate::postprocess::PostProcessor;
use crate::preprocess::{CompletionRequestPack, PreprocessConfig, Preprocessor};
use crate::rewrite::{Rewriter, StreamRewrite};
use crate::tool::box_registry::BoxToolRegistry;

use self::handle::{RequestHandle, ToolsAtSendTime};

/// Finish reason reported for a reply cut short by `pause`.
pub const PAUSED_FINISH_REASON: &str = "paused";

/// Collaborators an engine is built from.
pub struct EngineParts {
    pub session: SessionStore,
    pub transport: Arc<dyn ChatTransport>,
    pub tools: BoxToolRegistry,
    pub preprocessor: Preprocessor,
    pub rewriter: Arc<Rewriter>,
    pub policy: ToolPolicy,
    pub events: EventBus,
}

/// A batch waiting for an explicit permission decision.
#[derive(Debug, Clone)]
struct PendingToolBatch {
    request_id: Uuid,
    allowed: Vec<ToolCallRecord>,
    denied: Vec<ToolCallRecord>,
}

impl PendingToolBatch {
    /// Apply a decision to the asked calls, matched by call id.
    fn resolve(
        self,
        allowed: &[ToolCallRecord],
        denied: &[ToolCallRecord],
    ) -> (Vec<ToolCallRecord>, Vec<ToolCallRecord>) {
        let approved: HashSet<&str> = allowed.iter().map(|r| r.tool_call.id.as_str()).collect();
        let foreign = {
            let asked: HashSet<&str> = self
                .allowed
                .iter()
                .chain(&self.denied)
                .map(|r| r.tool_call.id.as_str())
                .collect();
            allowed
                .iter()
                .chain(denied)
                .filter(|r| !asked.contains(r.tool_call.id.as_str()))
                .count()
        };
        if foreign > 0 {
            tracing::warn!(foreign, "Ignoring decisions for calls outside the asked batch");
        }

        self.allowed
            .into_iter()
            .chain(self.denied)
            .map(|mut record| {
                record.status = if approved.contains(record.tool_call.id.as_str()) {
                    ToolCallStatus::Allowed
                } else {
                    ToolCallStatus::Denied
                };
                record
            })
            .partition(|r| r.status == ToolCallStatus::Allowed)
    }
}

struct EngineInner {
    session: SessionStore,
    transport: Arc<dyn ChatTransport>,
    tools: BoxToolRegistry,
    preprocessor: Preprocessor,
    rewriter: Arc<Rewriter>,
    postprocessor: PostProcessor,
    policy: RwLock<ToolPolicy>,
    events: EventBus,
    pool: DashMap<Uuid, Arc<RequestHandle>>,
    current: Mutex<Option<ToolsAtSendTime>>,
    last_pack: Mutex<Option<CompletionRequestPack>>,
    pending: Mutex<Option<PendingToolBatch>>,
    state: watch::Sender<EngineState>,
}

/// Outcome of streaming one reply.
enum StreamOutcome {
    Completed(CompletedResponse),
    Cancelled,
    Failed(TransportError),
}

/// Orchestrates requests for one session. Cheap to clone.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FlowEngine {
    pub fn new(parts: EngineParts) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let postprocessor = PostProcessor::new(Arc::clone(&parts.rewriter));
        Self {
            inner: Arc::new(EngineInner {
                session: parts.session,
                transport: parts.transport,
                tools: parts.tools,
                preprocessor: parts.preprocessor,
                rewriter: parts.rewriter,
                postprocessor,
                policy: RwLock::new(parts.policy),
                events: parts.events,
                pool: DashMap::new(),
                current: Mutex::new(None),
                last_pack: Mutex::new(None),
                pending: Mutex::new(None),
                state,
            }),
        }
    }

    /// Build an engine with preprocessor, rewrite rules, and policy taken
    /// from `config`.
    pub fn from_config(
        config: &FlowConfig,
        session: SessionStore,
        transport: Arc<dyn ChatTransport>,
        tools: BoxToolRegistry,
        events: EventBus,
    ) -> Result<Self, RewriteError> {
        let rewriter = Arc::new(Rewriter::from_config(&config.rewrite)?);
        Ok(Self::new(EngineParts {
            session,
            transport,
            tools,
            preprocessor: Preprocessor::new(PreprocessConfig::from(config)),
            rewriter,
            policy: config.tool_policy.clone(),
            events,
        }))
    }

    pub fn session(&self) -> &SessionStore {
        &self.inner.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.inner.events.subscribe()
    }

    /// Follow one request's events until it finishes, fails, or hands off
    /// its tool results.
    pub fn subscribe_request(&self, request_id: Uuid) -> RequestEvents {
        self.inner.events.subscribe_request(request_id)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    /// Wait until the engine is idle.
    pub async fn wait_idle(&self) {
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|s| !s.is_busy()).await;
    }

    /// Id of the current request, if one is in flight.
    pub fn current_request_id(&self) -> Option<Uuid> {
        let current = lock(&self.inner.current).as_ref().map(|s| s.request_id)?;
        self.inner.pool.contains_key(&current).then_some(current)
    }

    pub fn tool_policy(&self) -> ToolPolicy {
        self.inner
            .policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the allow/deny policy. Applies to the next classification.
    pub fn set_tool_policy(&self, policy: ToolPolicy) {
        *self
            .inner
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
    }

    /// Send the session's history for `request_type`.
    ///
    /// The pack's `history` is replaced with the session's current messages.
    /// Returns the id of the new request; progress arrives as events. If the
    /// last assistant turn has unanswered tool calls, those are evaluated
    /// instead of sending.
    pub fn send_request(
        &self,
        pack: CompletionRequestPack,
        request_type: RequestType,
    ) -> Result<Uuid, FlowError> {
        let pack = pack.with_history(self.inner.session.messages());

        if let Some(unexecuted) = validate::unexecuted_tool_calls(&pack.history) {
            let redirect = FlowError::ToolNotExecuted {
                message_id: unexecuted.message_id.clone(),
            };
            tracing::info!(error = %redirect, "Resuming interrupted tool round");
            return Ok(self.inner.start_tool_continuation(pack, unexecuted));
        }

        if let Err(e) = validate::validate_order(&pack.history, request_type) {
            tracing::warn!(request_type = %request_type, error = %e, "Send refused");
            self.inner.events.publish(FlowEvent::Error {
                request_id: None,
                kind: ErrorKind::OrderingViolation,
                message: e.to_string(),
            });
            return Err(e);
        }

        let handle = self.inner.begin(&pack);
        let request_id = handle.request_id();
        let span = tracing::info_span!(
            "chatflow.request",
            request_id = %request_id,
            request_type = %request_type,
        );
        tokio::spawn(
            Arc::clone(&self.inner)
                .run_request(handle, pack, request_type)
                .instrument(span),
        );
        Ok(request_id)
    }

    /// Run a batch after the permission surface decided on it.
    ///
    /// Only the batch last asked about for `request_id` is run, once. Calls
    /// listed in `allowed` run; every other call of that batch is denied,
    /// and records that were not part of it are ignored. Fails with
    /// `StaleRequest` when `request_id` is no longer current and with
    /// `NoPendingToolBatch` when nothing is waiting for a decision.
    pub fn exec_tool_calls(
        &self,
        request_id: Uuid,
        allowed: Vec<ToolCallRecord>,
        denied: Vec<ToolCallRecord>,
    ) -> Result<(), FlowError> {
        if !self.inner.is_current(request_id) {
            tracing::debug!(request_id = %request_id, "Discarding decision for stale request");
            return Err(FlowError::StaleRequest { request_id });
        }
        let pending = {
            let mut slot = lock(&self.inner.pending);
            match slot.take() {
                Some(pending) if pending.request_id == request_id => pending,
                other => {
                    *slot = other;
                    tracing::debug!(request_id = %request_id, "No tool batch awaiting a decision");
                    return Err(FlowError::NoPendingToolBatch { request_id });
                }
            }
        };
        let (allowed, denied) = pending.resolve(&allowed, &denied);
        tracing::debug!(
            request_id = %request_id,
            allowed = allowed.len(),
            denied = denied.len(),
            "Permission decision received"
        );

        let span = tracing::info_span!("chatflow.tools", request_id = %request_id);
        tokio::spawn(
            Arc::clone(&self.inner)
                .execute_batch(request_id, allowed, denied)
                .instrument(span),
        );
        Ok(())
    }

    /// Pause the current request.
    ///
    /// Streaming stops and keeps its partial reply; tool calls not yet run
    /// become denials. Returns the paused request's id.
    pub fn pause(&self) -> Option<Uuid> {
        let request_id = self.current_request_id()?;
        let handle = self.inner.handle(request_id)?;
        handle.pause();
        tracing::info!(request_id = %request_id, "Request paused");
        self.inner.events.publish(FlowEvent::Paused { request_id });
        self.inner.set_state(EngineState::Paused);
        self.inner.set_state(EngineState::Idle);
        Some(request_id)
    }

    /// Drop every in-flight request without keeping any output.
    pub fn abandon(&self) {
        self.inner.abandon_pool();
        lock(&self.inner.current).take();
        lock(&self.inner.pending).take();
        self.inner.set_state(EngineState::Abandoned);
        self.inner.set_state(EngineState::Idle);
    }
}

impl EngineInner {
    fn handle(&self, request_id: Uuid) -> Option<Arc<RequestHandle>> {
        self.pool.get(&request_id).map(|h| Arc::clone(h.value()))
    }

    fn is_current(&self, request_id: Uuid) -> bool {
        let matches = lock(&self.current)
            .as_ref()
            .is_some_and(|s| s.request_id == request_id);
        matches && self.pool.contains_key(&request_id)
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::trace!(?previous, ?state, "Engine state changed");
            self.events.publish(FlowEvent::StateChanged { state });
        }
    }

    /// Set `state` only while `request_id` is current and not stopped.
    fn set_state_for(&self, request_id: Uuid, state: EngineState) {
        let live = self.handle(request_id).is_some_and(|h| !h.is_cancelled());
        if live && self.is_current(request_id) {
            self.set_state(state);
        }
    }

    fn abandon_pool(&self) {
        for entry in self.pool.iter() {
            entry.value().abandon();
        }
        let abandoned = self.pool.len();
        self.pool.clear();
        if abandoned > 0 {
            tracing::debug!(abandoned, "Abandoned in-flight requests");
        }
    }

    /// Abandon the pool and register a fresh current request.
    fn begin(&self, pack: &CompletionRequestPack) -> Arc<RequestHandle> {
        self.abandon_pool();

        let request_id = Uuid::now_v7();
        let handle = Arc::new(RequestHandle::new(request_id));
        {
            let mut current = lock(&self.current);
            *current = Some(ToolsAtSendTime::new(request_id, pack.tool_names()));
            self.pool.insert(request_id, Arc::clone(&handle));
        }
        lock(&self.pending).take();
        *lock(&self.last_pack) = Some(pack.clone());
        handle
    }

    /// Leave `request_id` and return to idle if it was current.
    fn finish_request(&self, request_id: Uuid) {
        self.set_state_for(request_id, EngineState::Idle);
        self.pool.remove(&request_id);
    }

    fn fail(&self, request_id: Uuid, kind: ErrorKind, message: String) {
        tracing::error!(request_id = %request_id, ?kind, error = %message, "Request failed");
        self.events.publish(FlowEvent::Error {
            request_id: Some(request_id),
            kind,
            message,
        });
        self.finish_request(request_id);
    }

    async fn run_request(
        self: Arc<Self>,
        handle: Arc<RequestHandle>,
        pack: CompletionRequestPack,
        request_type: RequestType,
    ) {
        let request_id = handle.request_id();
        self.set_state_for(request_id, EngineState::Sending);
        self.events.publish(FlowEvent::RequestStarted {
            request_id,
            request_type,
        });

        let prepared = self.preprocessor.prepare(&pack).await;
        if !self.pool.contains_key(&request_id) {
            tracing::debug!("Request superseded during preprocessing, dropping");
            return;
        }
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.fail(request_id, ErrorKind::Pipeline, e.to_string());
                return;
            }
        };

        self.set_state_for(request_id, EngineState::Streaming);
        tracing::debug!(transport = self.transport.name(), "Sending request");
        let mut rewrite = StreamRewrite::new(Arc::clone(&self.rewriter));
        let mut reasoning = String::new();
        let outcome = self
            .stream_reply(&handle, prepared.payload, &mut rewrite, &mut reasoning)
            .await;

        match outcome {
            StreamOutcome::Cancelled if handle.is_paused() => {
                self.keep_partial(request_id, &mut rewrite, reasoning);
            }
            StreamOutcome::Cancelled => {
                tracing::debug!("Request abandoned while streaming");
            }
            StreamOutcome::Failed(e) => {
                if self.is_current(request_id) {
                    self.fail(request_id, ErrorKind::Transport, e.to_string());
                }
            }
            StreamOutcome::Completed(response) => {
                if !self.is_current(request_id) {
                    tracing::debug!("Dropping reply of superseded request");
                    return;
                }
                if handle.is_paused() {
                    self.keep_partial(request_id, &mut rewrite, reasoning);
                    return;
                }
                if let Some(delta) = rewrite.finish().delta {
                    self.events.publish(FlowEvent::ContentDelta {
                        request_id,
                        text: delta,
                    });
                }
                self.complete(request_id, response, reasoning).await;
            }
        }
    }

    async fn stream_reply(
        &self,
        handle: &RequestHandle,
        payload: serde_json::Value,
        rewrite: &mut StreamRewrite,
        reasoning: &mut String,
    ) -> StreamOutcome {
        let request_id = handle.request_id();
        let mut stream = self.transport.stream(payload);
        loop {
            let next = tokio::select! {
                biased;
                _ = handle.cancelled() => return StreamOutcome::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(TransportEvent::ContentDelta { text })) => {
                    let step = rewrite.push(&text);
                    if let Some(delta) = step.delta {
                        self.events.publish(FlowEvent::ContentDelta {
                            request_id,
                            text: delta,
                        });
                    }
                    self.events.publish(FlowEvent::FullContent {
                        request_id,
                        text: step.full,
                    });
                }
                Some(Ok(TransportEvent::ReasoningDelta { text })) => {
                    reasoning.push_str(&text);
                    self.events
                        .publish(FlowEvent::ReasoningDelta { request_id, text });
                }
                Some(Ok(TransportEvent::Completed(response))) => {
                    return StreamOutcome::Completed(response);
                }
                Some(Err(e)) => return StreamOutcome::Failed(e),
                None => {
                    return StreamOutcome::Failed(TransportError::Stream(
                        "stream ended without a completed response".to_string(),
                    ));
                }
            }
        }
    }

    /// Append what was streamed before a pause.
    fn keep_partial(&self, request_id: Uuid, rewrite: &mut StreamRewrite, reasoning: String) {
        let text = rewrite.finish().full;
        if !self.is_current(request_id) {
            return;
        }
        if !text.is_empty() || !reasoning.is_empty() {
            let message = Message::new(
                MessageKind::Assistant {
                    name: None,
                    reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
                    tool_calls: Vec::new(),
                },
                Content::Text(text),
            );
            self.session.append(message.clone());
            self.events.publish(FlowEvent::Finished {
                request_id,
                message,
                finish_reason: Some(PAUSED_FINISH_REASON.to_string()),
            });
        }
        self.pool.remove(&request_id);
    }

    async fn complete(self: &Arc<Self>, request_id: Uuid, response: CompletedResponse, reasoning: String) {
        let finish_reason = response.finish_reason.clone();
        let policy = self.policy.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut processed = self.postprocessor.handle_results(response, &policy);

        for warning in processed.warnings.drain(..) {
            self.events.publish(FlowEvent::Warning {
                request_id,
                message: warning,
            });
        }

        if let MessageKind::Assistant {
            reasoning_content, ..
        } = &mut processed.message.kind
        {
            if reasoning_content.is_none() && !reasoning.is_empty() {
                *reasoning_content = Some(reasoning);
            }
        }

        if !processed.has_tool_calls() {
            self.session.append(processed.message.clone());
            self.events.publish(FlowEvent::Finished {
                request_id,
                message: processed.message,
                finish_reason,
            });
            self.finish_request(request_id);
            return;
        }

        self.set_state_for(request_id, EngineState::ToolEvaluation);
        self.session.append(processed.message.clone());
        self.events.publish(FlowEvent::UpdateMessage {
            request_id,
            message: processed.message,
        });
        self.gate(request_id, processed.records).await;
    }
}
