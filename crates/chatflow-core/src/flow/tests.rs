use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, broadcast};

use chatflow_types::config::{FlowConfig, RewriteRule};
use chatflow_types::error::{FlowError, ToolError};
use chatflow_types::event::{EngineState, ErrorKind, FlowEvent, RequestType};
use chatflow_types::llm::{CompletedResponse, TransportError, TransportEvent};
use chatflow_types::message::{Message, Role};
use chatflow_types::tool::{ToolCall, ToolCallRecord, ToolCallStatus, ToolPolicy, ToolSpec};

use super::tools::{DENIED_BY_USER, DENIED_PAUSED};
use super::*;
use crate::llm::transport::TransportStream;
use crate::preprocess::hooks::FnHook;
use crate::preprocess::template::TemplateEnvironment;
use crate::tool::registry::ToolRegistry;

const WAIT: Duration = Duration::from_secs(5);

enum Step {
    Emit(TransportEvent),
    Fail(TransportError),
    Hold(Arc<Notify>),
}

fn delta(text: &str) -> Step {
    Step::Emit(TransportEvent::ContentDelta {
        text: text.to_string(),
    })
}

fn done(message: Message, reason: &str) -> Step {
    Step::Emit(TransportEvent::Completed(CompletedResponse {
        message,
        finish_reason: Some(reason.to_string()),
    }))
}

fn reply(text: &str) -> Vec<Step> {
    vec![delta(text), done(Message::assistant(text), "stop")]
}

fn tool_reply(calls: Vec<ToolCall>) -> Vec<Step> {
    vec![done(Message::assistant_with_tool_calls("", calls), "tool_calls")]
}

/// Plays one script per request and records every payload it was sent.
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    payloads: Mutex<Vec<Value>>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().unwrap().clone()
    }
}

impl ChatTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn stream(&self, payload: Value) -> TransportStream {
        self.payloads.lock().unwrap().push(payload);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| reply("ok"));
        Box::pin(async_stream::stream! {
            for step in script {
                match step {
                    Step::Emit(event) => yield Ok(event),
                    Step::Fail(error) => {
                        yield Err(error);
                        break;
                    }
                    Step::Hold(gate) => gate.notified().await,
                }
            }
        })
    }
}

/// Tools that answer `"<name> result"` after a per-tool delay.
#[derive(Default)]
struct RecordingRegistry {
    delays: HashMap<String, Duration>,
    finished: Mutex<Vec<String>>,
}

impl RecordingRegistry {
    fn new(tools: &[(&str, u64)]) -> Arc<Self> {
        Arc::new(Self {
            delays: tools
                .iter()
                .map(|(name, ms)| (name.to_string(), Duration::from_millis(*ms)))
                .collect(),
            finished: Mutex::new(Vec::new()),
        })
    }

    fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

impl ToolRegistry for Arc<RecordingRegistry> {
    fn specs(&self) -> Vec<ToolSpec> {
        self.delays
            .keys()
            .map(|name| ToolSpec::new(name.clone(), "test tool"))
            .collect()
    }

    async fn call(&self, call: &ToolCall) -> Result<String, ToolError> {
        let delay = *self
            .delays
            .get(call.name())
            .ok_or_else(|| ToolError::NotFound(call.name().to_string()))?;
        tokio::time::sleep(delay).await;
        self.finished.lock().unwrap().push(call.name().to_string());
        Ok(format!("{} result", call.name()))
    }
}

struct Harness {
    engine: FlowEngine,
    transport: Arc<ScriptedTransport>,
    registry: Arc<RecordingRegistry>,
    events: broadcast::Receiver<FlowEvent>,
}

fn preprocessor() -> Preprocessor {
    Preprocessor::new(PreprocessConfig::from(&FlowConfig::default())).with_environment(
        TemplateEnvironment {
            hostname: "host".to_string(),
            platform: "linux".to_string(),
            username: "tester".to_string(),
        },
    )
}

fn harness_with(
    scripts: Vec<Vec<Step>>,
    policy: ToolPolicy,
    rules: &[RewriteRule],
    preprocessor: Preprocessor,
) -> Harness {
    let session = SessionStore::new("You are helpful.");
    session.append(Message::user("hi"));
    let transport = ScriptedTransport::new(scripts);
    let registry = RecordingRegistry::new(&[("read_file", 0), ("slow", 60), ("fast", 0)]);
    let events = EventBus::default();
    let engine = FlowEngine::new(EngineParts {
        session,
        transport: Arc::clone(&transport) as Arc<dyn ChatTransport>,
        tools: BoxToolRegistry::new(Arc::clone(&registry)),
        preprocessor,
        rewriter: Arc::new(Rewriter::new(rules, 16).unwrap()),
        policy,
        events,
    });
    let events = engine.subscribe();
    Harness {
        engine,
        transport,
        registry,
        events,
    }
}

fn harness(scripts: Vec<Vec<Step>>) -> Harness {
    harness_with(scripts, ToolPolicy::default(), &[], preprocessor())
}

fn pack_with_tools(names: &[&str]) -> CompletionRequestPack {
    CompletionRequestPack::new("test-model").with_tools(
        names
            .iter()
            .map(|name| ToolSpec::new(*name, "test tool"))
            .collect(),
    )
}

async fn wait_for(
    rx: &mut broadcast::Receiver<FlowEvent>,
    pred: impl Fn(&FlowEvent) -> bool,
) -> FlowEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect events until the engine reports `Idle`.
async fn until_idle(rx: &mut broadcast::Receiver<FlowEvent>) -> Vec<FlowEvent> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Ok(FlowEvent::StateChanged {
                    state: EngineState::Idle,
                }) => return seen,
                Ok(event) => seen.push(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for idle")
}

fn deltas(events: &[FlowEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::ContentDelta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn tool_results(events: &[FlowEvent]) -> Vec<(Vec<Message>, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::ToolResults {
                messages,
                will_resend,
                ..
            } => Some((messages.clone(), *will_resend)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_simple_completion() {
    let mut h = harness(vec![vec![
        Step::Emit(TransportEvent::ReasoningDelta {
            text: "thinking".to_string(),
        }),
        delta("Hel"),
        delta("lo"),
        done(Message::assistant("Hello"), "stop"),
    ]]);

    let id = h
        .engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    assert!(matches!(
        events.first(),
        Some(FlowEvent::StateChanged {
            state: EngineState::Sending
        })
    ));
    assert!(events.contains(&FlowEvent::RequestStarted {
        request_id: id,
        request_type: RequestType::UserMessage,
    }));
    assert_eq!(deltas(&events), "Hello");

    let finished = events
        .iter()
        .find_map(|e| match e {
            FlowEvent::Finished {
                request_id,
                message,
                finish_reason,
            } => Some((*request_id, message.clone(), finish_reason.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(finished.0, id);
    assert_eq!(finished.1.text(), "Hello");
    assert_eq!(finished.1.reasoning(), Some("thinking"));
    assert_eq!(finished.2.as_deref(), Some("stop"));

    let session = h.engine.session();
    assert_eq!(session.len(), 3);
    assert_eq!(session.get_last(None).unwrap().id(), finished.1.id());

    let payloads = h.transport.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0]["model"], "test-model");
    assert_eq!(payloads[0]["messages"].as_array().unwrap().len(), 2);
    assert!(payloads[0].get("tools").is_none());

    assert_eq!(h.engine.state(), EngineState::Idle);
    assert_eq!(h.engine.current_request_id(), None);
}

#[tokio::test]
async fn test_stream_is_rewritten() {
    let mut h = harness_with(
        vec![vec![
            delta("As a"),
            delta("n AI, hello"),
            done(Message::assistant("As an AI, hello"), "stop"),
        ]],
        ToolPolicy::default(),
        &[RewriteRule::literal("As an AI", "I")],
        preprocessor(),
    );

    h.engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    assert_eq!(deltas(&events), "I, hello");
    let last_full = events
        .iter()
        .rev()
        .find_map(|e| match e {
            FlowEvent::FullContent { text, .. } => Some(text.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_full, "I, hello");
    assert_eq!(h.engine.session().get_last(None).unwrap().text(), "I, hello");
}

#[tokio::test]
async fn test_unknown_finish_reason_is_warned() {
    let mut h = harness(vec![vec![done(Message::assistant("x"), "eos_token")]]);
    h.engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;
    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::Warning { message, .. } if message == "unexpected finish reason: eos_token"
    )));
    assert_eq!(h.engine.session().len(), 3);
}

#[tokio::test]
async fn test_ordering_violation_refuses_send() {
    let mut h = harness(vec![]);
    h.engine.session().append(Message::assistant("already answered"));

    let err = h
        .engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap_err();
    assert!(matches!(err, FlowError::OrderingViolation(_)));

    let event = wait_for(&mut h.events, |e| matches!(e, FlowEvent::Error { .. })).await;
    assert!(matches!(
        event,
        FlowEvent::Error {
            request_id: None,
            kind: ErrorKind::OrderingViolation,
            ..
        }
    ));
    assert!(h.transport.payloads().is_empty());
    assert_eq!(h.engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn test_tool_continuation_requires_tool_result_last() {
    let h = harness(vec![]);
    let err = h
        .engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::ToolMessage)
        .unwrap_err();
    assert!(matches!(err, FlowError::OrderingViolation(_)));
}

#[tokio::test]
async fn test_unexecuted_calls_run_instead_of_sending() {
    let mut h = harness(vec![reply("done")]);
    let session = h.engine.session().clone();
    session.append(Message::assistant_with_tool_calls(
        "",
        vec![
            ToolCall::new("c0", "read_file", "{}"),
            ToolCall::new("c1", "read_file", r#"{"path":"b"}"#),
        ],
    ));
    session.append(Message::tool("c0", "first result"));

    h.engine
        .send_request(pack_with_tools(&["read_file"]), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    let (messages, will_resend) = &results[0];
    assert!(*will_resend);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tool_call_id(), Some("c1"));
    assert_eq!(messages[0].text(), "read_file result");

    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::RequestStarted {
            request_type: RequestType::ToolMessage,
            ..
        }
    )));
    // Only the continuation reached the network.
    assert_eq!(h.transport.payloads().len(), 1);

    let roles: Vec<Role> = session.messages().iter().map(Message::role).collect();
    assert_eq!(
        roles,
        vec![
            Role::System,
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Tool,
            Role::Assistant
        ]
    );
}

#[tokio::test]
async fn test_allowed_calls_run_in_parallel_and_keep_call_order() {
    let mut h = harness(vec![
        tool_reply(vec![
            ToolCall::new("c0", "slow", "{}"),
            ToolCall::new("c1", "fast", "{}"),
        ]),
        reply("done"),
    ]);

    let first = h
        .engine
        .send_request(pack_with_tools(&["slow", "fast"]), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::UpdateMessage { request_id, message } if *request_id == first && message.tool_calls().len() == 2
    )));
    assert!(!events.iter().any(|e| matches!(e, FlowEvent::AskForToolPermission { .. })));

    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    let (messages, will_resend) = &results[0];
    assert!(*will_resend);
    let ids: Vec<_> = messages.iter().map(|m| m.tool_call_id().unwrap()).collect();
    assert_eq!(ids, vec!["c0", "c1"]);
    assert_eq!(messages[0].text(), "slow result");
    assert_eq!(h.registry.finished(), vec!["fast", "slow"]);

    let started: Vec<(Uuid, RequestType)> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::RequestStarted {
                request_id,
                request_type,
            } => Some((*request_id, *request_type)),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 2);
    assert_eq!(started[0], (first, RequestType::UserMessage));
    assert_eq!(started[1].1, RequestType::ToolMessage);
    assert_ne!(started[1].0, first);

    let payloads = h.transport.payloads();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[1]["messages"].as_array().unwrap().len(), 5);
    assert_eq!(h.engine.session().len(), 6);
    assert_eq!(h.engine.session().get_last(None).unwrap().text(), "done");
}

#[tokio::test]
async fn test_denied_call_asks_for_permission() {
    let mut policy = ToolPolicy::default();
    policy.deny.insert("fast".to_string());
    let mut h = harness_with(
        vec![
            tool_reply(vec![
                ToolCall::new("c0", "read_file", "{}"),
                ToolCall::new("c1", "fast", "{}"),
            ]),
            reply("done"),
        ],
        policy,
        &[],
        preprocessor(),
    );

    let id = h
        .engine
        .send_request(pack_with_tools(&["read_file", "fast"]), RequestType::UserMessage)
        .unwrap();
    let ask = wait_for(&mut h.events, |e| {
        matches!(e, FlowEvent::AskForToolPermission { .. })
    })
    .await;
    let FlowEvent::AskForToolPermission {
        request_id,
        allowed,
        denied,
    } = ask
    else {
        unreachable!()
    };
    assert_eq!(request_id, id);
    assert_eq!(allowed.len(), 1);
    assert_eq!(allowed[0].tool_call.id, "c0");
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].status, ToolCallStatus::Denied);
    assert_eq!(denied[0].index, 1);

    assert_eq!(h.engine.state(), EngineState::ToolPermissionPending);
    assert_eq!(h.engine.current_request_id(), Some(id));
    assert!(h.registry.finished().is_empty());

    h.engine.exec_tool_calls(id, allowed, denied).unwrap();
    let events = until_idle(&mut h.events).await;

    let results = tool_results(&events);
    let (messages, will_resend) = &results[0];
    assert!(*will_resend);
    assert_eq!(messages[0].text(), "read_file result");
    assert_eq!(messages[1].text(), DENIED_BY_USER);
    assert_eq!(h.registry.finished(), vec!["read_file"]);
    assert_eq!(h.transport.payloads().len(), 2);
}

#[tokio::test]
async fn test_request_subscription_follows_one_request() {
    let gate = Arc::new(Notify::new());
    let h = harness(vec![vec![
        Step::Hold(Arc::clone(&gate)),
        delta("Hel"),
        delta("lo"),
        done(Message::assistant("Hello"), "stop"),
    ]]);

    let id = h
        .engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    let events = h.engine.subscribe_request(id);
    gate.notify_one();

    let events = tokio::time::timeout(WAIT, events.collect()).await.unwrap();
    assert!(events.iter().all(|e| e.request_id() == Some(id)));
    assert_eq!(deltas(&events), "Hello");
    assert!(matches!(events.last(), Some(FlowEvent::Finished { .. })));
}

#[tokio::test]
async fn test_second_decision_for_same_batch_is_rejected() {
    let mut policy = ToolPolicy::default();
    policy.deny.insert("fast".to_string());
    let mut h = harness_with(
        vec![
            tool_reply(vec![
                ToolCall::new("c0", "read_file", "{}"),
                ToolCall::new("c1", "fast", "{}"),
            ]),
            reply("done"),
        ],
        policy,
        &[],
        preprocessor(),
    );

    let id = h
        .engine
        .send_request(pack_with_tools(&["read_file", "fast"]), RequestType::UserMessage)
        .unwrap();
    let ask = wait_for(&mut h.events, |e| {
        matches!(e, FlowEvent::AskForToolPermission { .. })
    })
    .await;
    let FlowEvent::AskForToolPermission { allowed, denied, .. } = ask else {
        unreachable!()
    };

    h.engine
        .exec_tool_calls(id, allowed.clone(), denied.clone())
        .unwrap();
    let err = h.engine.exec_tool_calls(id, allowed, denied).unwrap_err();
    assert!(matches!(err, FlowError::NoPendingToolBatch { request_id } if request_id == id));

    let events = until_idle(&mut h.events).await;
    assert_eq!(tool_results(&events).len(), 1);
    assert_eq!(h.registry.finished(), vec!["read_file"]);
    assert_eq!(h.transport.payloads().len(), 2);
    let tools = h
        .engine
        .session()
        .messages()
        .iter()
        .filter(|m| m.role() == Role::Tool)
        .count();
    assert_eq!(tools, 2);
}

#[tokio::test]
async fn test_decision_only_covers_asked_calls() {
    let mut policy = ToolPolicy::default();
    policy.deny.insert("read_file".to_string());
    let mut h = harness_with(
        vec![tool_reply(vec![ToolCall::new("c0", "read_file", "{}")]), reply("done")],
        policy,
        &[],
        preprocessor(),
    );

    let id = h
        .engine
        .send_request(pack_with_tools(&["read_file", "fast"]), RequestType::UserMessage)
        .unwrap();
    wait_for(&mut h.events, |e| {
        matches!(e, FlowEvent::AskForToolPermission { .. })
    })
    .await;

    // Approves a call that was never asked about and says nothing of c0.
    let foreign = ToolCallRecord {
        tool_call: ToolCall::new("c9", "fast", "{}"),
        status: ToolCallStatus::Allowed,
        index: 0,
    };
    h.engine.exec_tool_calls(id, vec![foreign], Vec::new()).unwrap();
    let events = until_idle(&mut h.events).await;

    let results = tool_results(&events);
    let (messages, _) = &results[0];
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].tool_call_id(), Some("c0"));
    assert_eq!(messages[0].text(), DENIED_BY_USER);
    assert!(h.registry.finished().is_empty());
}

#[tokio::test]
async fn test_decision_for_superseded_request_is_stale() {
    let mut policy = ToolPolicy::default();
    policy.deny.insert("read_file".to_string());
    let mut h = harness_with(
        vec![tool_reply(vec![ToolCall::new("c0", "read_file", "{}")]), reply("done")],
        policy,
        &[],
        preprocessor(),
    );
    let pack = pack_with_tools(&["read_file"]);

    let first = h
        .engine
        .send_request(pack.clone(), RequestType::UserMessage)
        .unwrap();
    let ask = wait_for(&mut h.events, |e| {
        matches!(e, FlowEvent::AskForToolPermission { .. })
    })
    .await;
    let FlowEvent::AskForToolPermission { denied, .. } = ask else {
        unreachable!()
    };

    // Sending again re-evaluates the unanswered call under a new id.
    let second = h.engine.send_request(pack, RequestType::UserMessage).unwrap();
    assert_ne!(first, second);
    wait_for(&mut h.events, |e| {
        matches!(e, FlowEvent::AskForToolPermission { request_id, .. } if *request_id == second)
    })
    .await;

    let err = h
        .engine
        .exec_tool_calls(first, Vec::new(), denied.clone())
        .unwrap_err();
    assert!(matches!(err, FlowError::StaleRequest { request_id } if request_id == first));

    let approved: Vec<_> = denied
        .into_iter()
        .map(|mut r| {
            r.status = ToolCallStatus::Allowed;
            r
        })
        .collect();
    h.engine.exec_tool_calls(second, approved, Vec::new()).unwrap();
    let events = until_idle(&mut h.events).await;
    let results = tool_results(&events);
    assert_eq!(results.len(), 1);
    assert!(results.iter().all(|(messages, _)| messages.len() == 1));
    assert_eq!(h.registry.finished(), vec!["read_file"]);
    // One tool result in history, never two.
    let tools = h
        .engine
        .session()
        .messages()
        .iter()
        .filter(|m| m.role() == Role::Tool)
        .count();
    assert_eq!(tools, 1);
}

#[tokio::test]
async fn test_send_during_tool_execution_discards_old_results() {
    let mut h = harness(vec![
        tool_reply(vec![ToolCall::new("c0", "slow", "{}")]),
        reply("second"),
    ]);

    let first = h
        .engine
        .send_request(pack_with_tools(&["slow"]), RequestType::UserMessage)
        .unwrap();
    wait_for(&mut h.events, |e| {
        matches!(
            e,
            FlowEvent::StateChanged {
                state: EngineState::ToolExecuting
            }
        )
    })
    .await;

    h.engine.session().append(Message::user("never mind"));
    let second = h
        .engine
        .send_request(pack_with_tools(&["slow"]), RequestType::UserMessage)
        .unwrap();
    assert_ne!(first, second);
    let mut events = until_idle(&mut h.events).await;

    // Let the first batch's tool finish after the new request settled.
    tokio::time::sleep(Duration::from_millis(120)).await;
    while let Ok(event) = h.events.try_recv() {
        events.push(event);
    }

    assert!(!events.iter().any(|e| matches!(
        e,
        FlowEvent::ToolResults { request_id, .. } if *request_id == first
    )));
    let roles: Vec<Role> = h.engine.session().messages().iter().map(Message::role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(h.engine.session().get_last(None).unwrap().text(), "second");
}

#[tokio::test]
async fn test_tool_calls_without_offered_tools_raise_security_warning() {
    let mut h = harness(vec![tool_reply(vec![ToolCall::new("c0", "read_file", "{}")])]);

    let id = h
        .engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::SecurityWarning { request_id, .. } if *request_id == id
    )));
    let results = tool_results(&events);
    let (messages, will_resend) = &results[0];
    assert!(!*will_resend);
    assert!(messages[0].text().contains("was not offered"));
    assert!(h.registry.finished().is_empty());
    assert_eq!(h.transport.payloads().len(), 1);
}

#[tokio::test]
async fn test_call_to_unoffered_tool_is_force_denied() {
    let mut h = harness(vec![tool_reply(vec![
        ToolCall::new("c0", "read_file", "{}"),
        ToolCall::new("c1", "fast", "{}"),
    ])]);

    h.engine
        .send_request(pack_with_tools(&["read_file"]), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::SecurityWarning { message, .. } if message.contains("'fast'")
    )));
    let results = tool_results(&events);
    let (messages, will_resend) = &results[0];
    assert!(!*will_resend);
    assert_eq!(messages[0].text(), "read_file result");
    assert!(messages[1].text().contains("'fast' was not offered"));
    assert_eq!(h.registry.finished(), vec!["read_file"]);
    assert_eq!(h.transport.payloads().len(), 1);
}

#[tokio::test]
async fn test_pause_while_streaming_keeps_partial_reply() {
    let gate = Arc::new(Notify::new());
    let mut h = harness(vec![vec![
        delta("Partial"),
        Step::Hold(Arc::clone(&gate)),
        done(Message::assistant("Partial and more"), "stop"),
    ]]);

    let id = h
        .engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, FlowEvent::ContentDelta { .. })).await;

    assert_eq!(h.engine.pause(), Some(id));
    let finished = wait_for(&mut h.events, |e| matches!(e, FlowEvent::Finished { .. })).await;
    let FlowEvent::Finished {
        request_id,
        message,
        finish_reason,
    } = finished
    else {
        unreachable!()
    };
    assert_eq!(request_id, id);
    assert_eq!(message.text(), "Partial");
    assert_eq!(finish_reason.as_deref(), Some(PAUSED_FINISH_REASON));

    assert_eq!(h.engine.session().len(), 3);
    assert_eq!(h.engine.state(), EngineState::Idle);
    assert_eq!(h.engine.current_request_id(), None);
    assert_eq!(h.engine.pause(), None);
}

#[tokio::test]
async fn test_pause_with_pending_permission_denies_without_resend() {
    let mut policy = ToolPolicy::default();
    policy.deny.insert("read_file".to_string());
    let mut h = harness_with(
        vec![tool_reply(vec![ToolCall::new("c0", "read_file", "{}")])],
        policy,
        &[],
        preprocessor(),
    );

    let id = h
        .engine
        .send_request(pack_with_tools(&["read_file"]), RequestType::UserMessage)
        .unwrap();
    let ask = wait_for(&mut h.events, |e| {
        matches!(e, FlowEvent::AskForToolPermission { .. })
    })
    .await;
    let FlowEvent::AskForToolPermission { allowed, denied, .. } = ask else {
        unreachable!()
    };

    assert_eq!(h.engine.pause(), Some(id));
    h.engine.exec_tool_calls(id, allowed, denied).unwrap();
    let results = wait_for(&mut h.events, |e| matches!(e, FlowEvent::ToolResults { .. })).await;
    let FlowEvent::ToolResults {
        messages,
        will_resend,
        ..
    } = results
    else {
        unreachable!()
    };
    assert!(!will_resend);
    assert_eq!(messages[0].text(), DENIED_PAUSED);
    assert!(h.registry.finished().is_empty());
    assert_eq!(h.transport.payloads().len(), 1);
    assert_eq!(h.engine.session().get_last(None).unwrap().role(), Role::Tool);
}

#[tokio::test]
async fn test_new_send_abandons_streaming_request() {
    let gate = Arc::new(Notify::new());
    let mut h = harness(vec![
        vec![delta("old"), Step::Hold(Arc::clone(&gate)), done(Message::assistant("old"), "stop")],
        reply("new"),
    ]);
    let pack = CompletionRequestPack::new("test-model");

    let first = h
        .engine
        .send_request(pack.clone(), RequestType::UserMessage)
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, FlowEvent::ContentDelta { .. })).await;

    let second = h.engine.send_request(pack, RequestType::UserMessage).unwrap();
    gate.notify_one();
    let events = until_idle(&mut h.events).await;

    assert!(!events.iter().any(|e| matches!(
        e,
        FlowEvent::Finished { request_id, .. } if *request_id == first
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::Finished { request_id, .. } if *request_id == second
    )));
    let texts: Vec<String> = h.engine.session().messages().iter().map(Message::text).collect();
    assert_eq!(texts, vec!["You are helpful.", "hi", "new"]);
}

#[tokio::test]
async fn test_transport_error_leaves_history_untouched() {
    let mut h = harness(vec![vec![
        delta("par"),
        Step::Fail(TransportError::Provider {
            message: "boom".to_string(),
        }),
    ]]);

    let id = h
        .engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::Error { request_id: Some(rid), kind: ErrorKind::Transport, message }
            if *rid == id && message.contains("boom")
    )));
    assert_eq!(h.engine.session().len(), 2);
}

#[tokio::test]
async fn test_hook_failure_aborts_before_network() {
    let preprocessor = preprocessor().with_hook(Arc::new(FnHook::new(
        "reject",
        |_: &mut Vec<Message>, _: &CompletionRequestPack| Err("nope".to_string()),
    )));
    let mut h = harness_with(vec![], ToolPolicy::default(), &[], preprocessor);

    h.engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    let events = until_idle(&mut h.events).await;

    assert!(events.iter().any(|e| matches!(
        e,
        FlowEvent::Error { kind: ErrorKind::Pipeline, message, .. } if message.contains("reject")
    )));
    assert!(h.transport.payloads().is_empty());
    assert_eq!(h.engine.session().len(), 2);
}

#[tokio::test]
async fn test_abandon_drops_output() {
    let gate = Arc::new(Notify::new());
    let mut h = harness(vec![vec![
        delta("abc"),
        Step::Hold(Arc::clone(&gate)),
        done(Message::assistant("abc"), "stop"),
    ]]);

    h.engine
        .send_request(CompletionRequestPack::new("test-model"), RequestType::UserMessage)
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, FlowEvent::ContentDelta { .. })).await;

    h.engine.abandon();
    gate.notify_one();
    let events = until_idle(&mut h.events).await;
    assert!(events.contains(&FlowEvent::StateChanged {
        state: EngineState::Abandoned
    }));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.engine.session().len(), 2);
    assert_eq!(h.engine.current_request_id(), None);
    while let Ok(event) = h.events.try_recv() {
        assert!(!matches!(event, FlowEvent::Finished { .. }));
    }
}

#[tokio::test]
async fn test_policy_change_applies_to_next_classification() {
    let mut h = harness(vec![
        tool_reply(vec![ToolCall::new("c0", "read_file", "{}")]),
        reply("done"),
    ]);
    let mut policy = h.engine.tool_policy();
    policy.revoke("read_file");
    h.engine.set_tool_policy(policy);

    h.engine
        .send_request(pack_with_tools(&["read_file"]), RequestType::UserMessage)
        .unwrap();
    let ask = wait_for(&mut h.events, |e| {
        matches!(e, FlowEvent::AskForToolPermission { .. })
    })
    .await;
    assert!(matches!(ask, FlowEvent::AskForToolPermission { denied, .. } if denied.len() == 1));
}
