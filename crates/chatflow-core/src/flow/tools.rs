//! Tool permission gate and batch execution.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use chatflow_types::error::{FlowError, ToolError};
use chatflow_types::event::{EngineState, FlowEvent, RequestType};
use chatflow_types::message::{Message, MessageKind};
use chatflow_types::tool::{ToolCall, ToolCallRecord, ToolCallStatus};

use super::handle::ToolsAtSendTime;
use super::validate::UnexecutedCalls;
use super::{EngineInner, FlowEngine, PendingToolBatch, lock};
use crate::preprocess::CompletionRequestPack;

pub(super) const DENIED_BY_USER: &str = "Tool call denied by the user.";
pub(super) const DENIED_PAUSED: &str = "Tool call cancelled: the user paused the request.";

fn not_offered(tool_name: &str) -> String {
    format!("Tool call rejected: '{tool_name}' was not offered with this request.")
}

enum Verdict {
    Run,
    Deny(String),
}

enum TaskOutcome {
    Ran(Result<String, ToolError>),
    Paused,
    Stale,
}

impl EngineInner {
    /// Evaluate tool calls left unanswered in history instead of sending.
    pub(super) fn start_tool_continuation(
        self: &Arc<Self>,
        pack: CompletionRequestPack,
        unexecuted: UnexecutedCalls,
    ) -> Uuid {
        let handle = self.begin(&pack);
        let request_id = handle.request_id();
        let inner = Arc::clone(self);
        let span = tracing::info_span!("chatflow.tools", request_id = %request_id);

        tokio::spawn(
            async move {
                inner.set_state_for(request_id, EngineState::ToolEvaluation);
                let policy = inner
                    .policy
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                let records = unexecuted
                    .calls
                    .into_iter()
                    .map(|(index, call)| ToolCallRecord {
                        status: policy.decide(call.name()),
                        tool_call: call,
                        index,
                    })
                    .collect();
                inner.gate(request_id, records).await;
            }
            .instrument(span),
        );
        request_id
    }

    /// Run the batch directly, or ask for permission if any call is denied.
    pub(super) async fn gate(self: &Arc<Self>, request_id: Uuid, records: Vec<ToolCallRecord>) {
        let (allowed, denied): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.status == ToolCallStatus::Allowed);

        if denied.is_empty() {
            Arc::clone(self)
                .execute_batch(request_id, allowed, denied)
                .await;
            return;
        }
        if !self.is_current(request_id) {
            return;
        }

        tracing::info!(
            allowed = allowed.len(),
            denied = denied.len(),
            "Asking for tool permission"
        );
        *lock(&self.pending) = Some(PendingToolBatch {
            request_id,
            allowed: allowed.clone(),
            denied: denied.clone(),
        });
        self.set_state_for(request_id, EngineState::ToolPermissionPending);
        self.events.publish(FlowEvent::AskForToolPermission {
            request_id,
            allowed,
            denied,
        });
    }

    /// Re-validate, run allowed calls in parallel, append results in call
    /// order, and resend unless a quick denial happened.
    pub(super) async fn execute_batch(
        self: Arc<Self>,
        request_id: Uuid,
        allowed: Vec<ToolCallRecord>,
        denied: Vec<ToolCallRecord>,
    ) {
        let snapshot = lock(&self.current)
            .clone()
            .filter(|s| s.request_id == request_id);
        let (Some(snapshot), Some(handle)) = (snapshot, self.handle(request_id)) else {
            tracing::debug!("Discarding tool batch of stale request");
            return;
        };
        self.set_state_for(request_id, EngineState::ToolExecuting);

        let paused = handle.is_paused();
        let mut quick_deny = paused;
        if !paused && snapshot.tool_names.is_empty() {
            let anomaly = FlowError::SecurityAnomaly(
                "tool calls returned for a request that offered no tools".to_string(),
            );
            tracing::warn!(error = %anomaly, calls = allowed.len() + denied.len(), "Denying batch");
            self.events.publish(FlowEvent::SecurityWarning {
                request_id,
                message: anomaly.to_string(),
            });
        }

        let mut verdicts = Vec::with_capacity(allowed.len() + denied.len());
        for (record, user_allowed) in allowed
            .into_iter()
            .map(|r| (r, true))
            .chain(denied.into_iter().map(|r| (r, false)))
        {
            let verdict = self.verdict(request_id, &snapshot, paused, &record.tool_call, user_allowed);
            if matches!(&verdict, Verdict::Deny(_)) && (paused || !snapshot.offers(record.tool_call.name())) {
                quick_deny = true;
            }
            verdicts.push((record, verdict));
        }

        let mut results: Vec<(usize, ToolCall, String)> = Vec::with_capacity(verdicts.len());
        let mut running = HashMap::new();
        let mut set = JoinSet::new();
        for (record, verdict) in verdicts {
            match verdict {
                Verdict::Deny(reason) => results.push((record.index, record.tool_call, reason)),
                Verdict::Run => {
                    let tools = self.tools.clone();
                    let inner = Arc::clone(&self);
                    let handle = Arc::clone(&handle);
                    let call = record.tool_call.clone();
                    let task = set.spawn(async move {
                        if handle.is_paused() {
                            return TaskOutcome::Paused;
                        }
                        if !inner.is_current(request_id) {
                            return TaskOutcome::Stale;
                        }
                        tracing::debug!(tool = %call.name(), call_id = %call.id, "Running tool");
                        TaskOutcome::Ran(tools.call(&call).await)
                    });
                    running.insert(task.id(), (record.index, record.tool_call));
                }
            }
        }

        let mut stale = false;
        while let Some(joined) = set.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => {
                    tracing::error!(error = %e, "Tool task failed");
                    (e.id(), TaskOutcome::Ran(Err(ToolError::Execution(e.to_string()))))
                }
            };
            let Some((index, call)) = running.remove(&id) else {
                continue;
            };
            let content = match outcome {
                TaskOutcome::Ran(Ok(output)) => output,
                TaskOutcome::Ran(Err(e)) => {
                    tracing::warn!(tool = %call.name(), error = %e, "Tool call failed");
                    format!("Error: {e}")
                }
                TaskOutcome::Paused => {
                    quick_deny = true;
                    DENIED_PAUSED.to_string()
                }
                TaskOutcome::Stale => {
                    stale = true;
                    continue;
                }
            };
            results.push((index, call, content));
        }

        if stale || !self.is_current(request_id) {
            tracing::debug!("Request superseded during tool execution, discarding results");
            return;
        }

        results.sort_by_key(|(index, _, _)| *index);
        let messages: Vec<Message> = results
            .into_iter()
            .map(|(_, call, content)| {
                Message::new(
                    MessageKind::Tool {
                        tool_call_id: call.id,
                        name: Some(call.function.name),
                    },
                    content,
                )
            })
            .collect();

        let will_resend = !quick_deny && !handle.is_paused();
        self.session.append_many(messages.clone());
        self.events.publish(FlowEvent::ToolResults {
            request_id,
            messages,
            will_resend,
        });

        if !will_resend {
            self.finish_request(request_id);
            return;
        }

        self.set_state_for(request_id, EngineState::Resending);
        let Some(mut pack) = lock(&self.last_pack).clone() else {
            self.finish_request(request_id);
            return;
        };
        pack.options.search_result = None;
        let engine = FlowEngine {
            inner: Arc::clone(&self),
        };
        if let Err(e) = engine.send_request(pack, RequestType::ToolMessage) {
            tracing::warn!(error = %e, "Automatic resend after tool results refused");
            self.finish_request(request_id);
        }
    }

    fn verdict(
        &self,
        request_id: Uuid,
        snapshot: &ToolsAtSendTime,
        paused: bool,
        call: &ToolCall,
        user_allowed: bool,
    ) -> Verdict {
        if paused {
            return Verdict::Deny(DENIED_PAUSED.to_string());
        }
        if !snapshot.offers(call.name()) {
            if !snapshot.tool_names.is_empty() {
                tracing::warn!(tool = %call.name(), "Tool call names a tool that was not offered");
                self.events.publish(FlowEvent::SecurityWarning {
                    request_id,
                    message: format!("tool '{}' was not offered with this request", call.name()),
                });
            }
            return Verdict::Deny(not_offered(call.name()));
        }
        if user_allowed {
            Verdict::Run
        } else {
            Verdict::Deny(DENIED_BY_USER.to_string())
        }
    }
}
