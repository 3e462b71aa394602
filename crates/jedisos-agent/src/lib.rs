//! The ReAct-style turn loop: recall context, reason with the model,
//! dispatch any requested tool calls through the policy decision point,
//! feed results back, and repeat until the model settles on a text answer
//! or the iteration bound is hit.

use std::collections::HashMap;
use std::sync::Arc;

use jedisos_envelope::{Envelope, EnvelopeState};
use jedisos_llm::{CallOverrides, ChatMessage, LlmRouter, ToolCall};
use jedisos_memory::{bank_id_for, MemoryClient};
use jedisos_policy::{AuditRecord, AuditSink, Decision, PdpRequest, PolicyDecisionPoint};
use jedisos_tools::ToolRegistry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Tool-call name that signals the model wants a brand-new tool built
/// rather than an existing one invoked.
pub const FORGE_TRIGGER_TOOL_NAME: &str = "create_tool";

/// Hard bound on reason → tool-dispatch round trips within a single turn.
const MAX_ITERATIONS: usize = 10;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Envelope(#[from] jedisos_envelope::EngineError),
    #[error(transparent)]
    Llm(#[from] jedisos_llm::LlmError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultInfo {
    pub name: String,
    pub success: bool,
    pub output: String,
}

/// Streamed out of a turn as it progresses, for a channel adapter or UI to
/// render live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackendEvent {
    Token(String),
    ToolCallStart(ToolCallInfo),
    ToolCallEnd(ToolResultInfo),
    ForgeRequested { goal: String },
    Done,
    Error(String),
}

fn channel_label(envelope: &Envelope) -> String {
    serde_json::to_value(envelope.channel)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn emit(events: &mpsc::Sender<BackendEvent>, event: BackendEvent) {
    if events.try_send(event).is_err() {
        warn!("backend event dropped — receiver lagging or closed");
    }
}

fn value_to_args_map(value: &serde_json::Value) -> HashMap<String, serde_json::Value> {
    value
        .as_object()
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Wires the model, tool registry, memory client, and policy decision
/// point together for one conversational turn at a time. Cheap to
/// construct; holds only shared handles.
pub struct Agent {
    llm: LlmRouter,
    tools: Arc<ToolRegistry>,
    memory: MemoryClient,
    pdp: PolicyDecisionPoint,
    audit: Arc<dyn AuditSink>,
}

impl Agent {
    pub fn new(
        llm: LlmRouter,
        tools: Arc<ToolRegistry>,
        memory: MemoryClient,
        pdp: PolicyDecisionPoint,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { llm, tools, memory, pdp, audit }
    }

    async fn audit_best_effort(&self, record: AuditRecord) {
        if let Err(err) = self.audit.append(record).await {
            warn!(error = %err, "failed to append audit record");
        }
    }

    /// Runs a full turn against `envelope`, mutating its state in place.
    /// `system_prompt` carries the caller's identity/persona text; the
    /// agent itself is persona-agnostic.
    pub async fn run_turn(
        &self,
        envelope: &mut Envelope,
        system_prompt: &str,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), AgentError> {
        let channel = channel_label(envelope);

        let message_decision = self.pdp.evaluate(&PdpRequest {
            user_id: envelope.user_id.clone(),
            channel: channel.clone(),
            subject: "message".to_string(),
            is_tool: false,
        });
        self.audit_best_effort(AuditRecord::new(envelope.id, &envelope.user_id, &channel, &message_decision, "message"))
            .await;
        if let Decision::Deny(reason) = message_decision {
            envelope.deny(reason.clone())?;
            emit(&events, BackendEvent::Error(reason));
            return Ok(());
        }

        envelope.transition(EnvelopeState::Authorized)?;
        envelope.transition(EnvelopeState::Processing)?;

        let bank_id = bank_id_for(&channel, &envelope.user_id);
        let memory_context = self.memory.recall_or_empty(&bank_id, &envelope.content).await;
        envelope.memory_context = memory_context
            .records
            .iter()
            .map(|r| jedisos_envelope::MemoryRecord { id: r.id.clone(), content: r.content.clone() })
            .collect();

        let mut messages = vec![ChatMessage::system(system_prompt.to_string())];
        if !memory_context.records.is_empty() {
            let recalled = memory_context
                .records
                .iter()
                .map(|r| format!("- {}", r.content))
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(ChatMessage::system(format!("Relevant memory:\n{recalled}")));
        }
        messages.push(ChatMessage::user(envelope.content.clone()));

        let mut last_content = String::new();

        for iteration in 0..MAX_ITERATIONS {
            let tools_schema = self.tools.list_schemas_for_llm().await;
            let force_text = iteration == MAX_ITERATIONS - 1;
            let effective_tools = if force_text || !tools_schema.as_array().is_some_and(|a| !a.is_empty()) {
                None
            } else {
                Some(&tools_schema)
            };

            let response = self.llm.chat(&messages, effective_tools, None, CallOverrides::default()).await?;
            last_content = response.content.clone();

            if response.tool_calls.is_empty() {
                emit(&events, BackendEvent::Token(response.content.clone()));
                envelope.complete(response.content.clone())?;
                self.memory.retain_best_effort(&bank_id, &envelope.content, Some(&response.content)).await;
                emit(&events, BackendEvent::Done);
                return Ok(());
            }

            info!(iteration, count = response.tool_calls.len(), "model requested tool calls");
            messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));
            envelope.transition(EnvelopeState::ToolCalling)?;

            for call in &response.tool_calls {
                self.dispatch_tool_call(envelope, &channel, call, &mut messages, &events).await;
            }

            envelope.transition(EnvelopeState::Processing)?;
        }

        // The bound is hit, not a failure: the turn exits cleanly with
        // whatever the last reasoning step produced, same as a normal
        // text-only completion.
        warn!(tool_call_count = envelope.tool_calls.len(), "turn hit the iteration bound without a final text answer");
        emit(&events, BackendEvent::Token(last_content.clone()));
        envelope.complete(last_content.clone())?;
        self.memory.retain_best_effort(&bank_id, &envelope.content, Some(&last_content)).await;
        emit(&events, BackendEvent::Done);
        Ok(())
    }

    async fn dispatch_tool_call(
        &self,
        envelope: &mut Envelope,
        channel: &str,
        call: &ToolCall,
        messages: &mut Vec<ChatMessage>,
        events: &mpsc::Sender<BackendEvent>,
    ) {
        let name = call.function.name.clone();
        let args = call.function.arguments.clone();

        if name == FORGE_TRIGGER_TOOL_NAME {
            let goal = args
                .get("goal")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| args.to_string());
            emit(events, BackendEvent::ForgeRequested { goal: goal.clone() });
            let note = "a new tool is being built for this request and will be available shortly; continue with what is already known".to_string();
            messages.push(ChatMessage::tool_result(&call.id, &note));
            envelope.tool_calls.push(jedisos_envelope::ToolCallRecord {
                name,
                arguments: args,
                result: Some(note),
                error: None,
            });
            return;
        }

        emit(events, BackendEvent::ToolCallStart(ToolCallInfo { name: name.clone(), arguments: args.clone() }));

        let decision = self.pdp.evaluate(&PdpRequest {
            user_id: envelope.user_id.clone(),
            channel: channel.to_string(),
            subject: name.clone(),
            is_tool: true,
        });
        self.audit_best_effort(AuditRecord::new(envelope.id, &envelope.user_id, channel, &decision, &name)).await;

        let (success, output, error) = match decision {
            Decision::Deny(reason) => (false, format!("tool call denied: {reason}"), Some(reason)),
            Decision::Allow => match self.tools.get(&name).await {
                None => {
                    let msg = format!("no tool named '{name}' is registered");
                    (false, msg.clone(), Some(msg))
                }
                Some(handle) => {
                    let args_map = value_to_args_map(&args);
                    match handle.invoke(&args_map).await {
                        Ok(output) => (output.success, output.output, None),
                        Err(err) => (false, err.to_string(), Some(err.to_string())),
                    }
                }
            },
        };

        emit(events, BackendEvent::ToolCallEnd(ToolResultInfo { name: name.clone(), success, output: output.clone() }));
        messages.push(ChatMessage::tool_result(&call.id, &output));
        envelope.tool_calls.push(jedisos_envelope::ToolCallRecord { name, arguments: args, result: Some(output), error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jedisos_envelope::Channel;
    use jedisos_llm::{ChatProvider, ChatResponse, LlmProviderEntry, ToolCallFunction};
    use jedisos_policy::{JsonlAuditSink, Policy};
    use jedisos_tools::{ParamType, Tool, ToolHandle, ToolOutput, ToolParam, ToolSpec, PackageSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "echoes its input".to_string(),
                params: vec![ToolParam {
                    name: "text".to_string(),
                    description: "text to echo".to_string(),
                    r#type: ParamType::String,
                    required: true,
                }],
            }
        }

        async fn run(&self, args: &HashMap<String, serde_json::Value>) -> anyhow::Result<ToolOutput> {
            let text = args.get("text").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(ToolOutput { success: true, output: text.to_string() })
        }
    }

    /// First call requests `echo`, second call returns plain text.
    struct ToolThenText {
        calls: AtomicUsize,
        transcript: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl ChatProvider for ToolThenText {
        async fn chat(
            &self,
            _entry: &LlmProviderEntry,
            messages: &[ChatMessage],
            _tools: Option<&serde_json::Value>,
            _overrides: &CallOverrides,
        ) -> Result<ChatResponse, jedisos_llm::LlmError> {
            self.transcript.lock().unwrap().push(messages.to_vec());
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            if call_index == 0 {
                Ok(ChatResponse {
                    model_id: "stub".to_string(),
                    content: String::new(),
                    tool_calls: vec![ToolCall {
                        id: "call-1".to_string(),
                        r#type: "function".to_string(),
                        function: ToolCallFunction { name: "echo".to_string(), arguments: serde_json::json!({"text": "hi"}) },
                    }],
                    finish_reason: "tool_calls".to_string(),
                    usage: None,
                })
            } else {
                Ok(ChatResponse {
                    model_id: "stub".to_string(),
                    content: "all done".to_string(),
                    tool_calls: vec![],
                    finish_reason: "stop".to_string(),
                    usage: None,
                })
            }
        }

        async fn chat_stream(
            &self,
            entry: &LlmProviderEntry,
            messages: &[ChatMessage],
            tools: Option<&serde_json::Value>,
            overrides: &CallOverrides,
            _tx: mpsc::Sender<String>,
        ) -> Result<ChatResponse, jedisos_llm::LlmError> {
            self.chat(entry, messages, tools, overrides).await
        }
    }

    fn test_agent(provider: ToolThenText) -> (Agent, Arc<ToolRegistry>) {
        let registry = Arc::new(ToolRegistry::new());
        let llm = LlmRouter::new(Arc::new(provider), vec![LlmProviderEntry::new("stub-model", "http://unused")]);
        let memory = MemoryClient::new("http://127.0.0.1:1");
        let pdp = PolicyDecisionPoint::new(Policy::allow_all(1000));
        let tmp = tempfile_path();
        let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(tmp));
        (Agent::new(llm, registry.clone(), memory, pdp, audit), registry)
    }

    fn tempfile_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("jedisos-agent-test-{}.jsonl", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn turn_completes_without_tool_calls() {
        let (agent, _registry) = test_agent(ToolThenText { calls: AtomicUsize::new(1), transcript: Mutex::new(vec![]) });
        let mut envelope = Envelope::new(Channel::Cli, "u1", "Alice", "hello");
        let (tx, _rx) = mpsc::channel(16);
        agent.run_turn(&mut envelope, "be helpful", tx).await.unwrap();
        assert_eq!(envelope.state, EnvelopeState::Completed);
        assert_eq!(envelope.response.as_deref(), Some("all done"));
    }

    #[tokio::test]
    async fn turn_dispatches_a_tool_call_then_completes() {
        let (agent, registry) = test_agent(ToolThenText { calls: AtomicUsize::new(0), transcript: Mutex::new(vec![]) });
        registry.register(ToolHandle::new(Arc::new(Echo), PackageSource::Builtin), false).await.unwrap();

        let mut envelope = Envelope::new(Channel::Cli, "u1", "Alice", "echo hi");
        let (tx, mut rx) = mpsc::channel(16);
        agent.run_turn(&mut envelope, "be helpful", tx).await.unwrap();

        assert_eq!(envelope.state, EnvelopeState::Completed);
        assert_eq!(envelope.tool_calls.len(), 1);
        assert_eq!(envelope.tool_calls[0].name, "echo");

        let mut saw_tool_end = false;
        while let Ok(event) = rx.try_recv() {
            if let BackendEvent::ToolCallEnd(info) = event {
                assert_eq!(info.output, "hi");
                saw_tool_end = true;
            }
        }
        assert!(saw_tool_end);
    }

    #[tokio::test]
    async fn blocked_tool_is_denied_not_invoked() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(ToolHandle::new(Arc::new(Echo), PackageSource::Builtin), false).await.unwrap();
        let provider = ToolThenText { calls: AtomicUsize::new(0), transcript: Mutex::new(vec![]) };
        let llm = LlmRouter::new(Arc::new(provider), vec![LlmProviderEntry::new("stub-model", "http://unused")]);
        let memory = MemoryClient::new("http://127.0.0.1:1");
        let mut policy = Policy::allow_all(1000);
        policy.blocked_tools.insert("echo".to_string());
        let pdp = PolicyDecisionPoint::new(policy);
        let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(tempfile_path()));
        let agent = Agent::new(llm, registry, memory, pdp, audit);

        let mut envelope = Envelope::new(Channel::Cli, "u1", "Alice", "echo hi");
        let (tx, _rx) = mpsc::channel(16);
        agent.run_turn(&mut envelope, "be helpful", tx).await.unwrap();

        assert_eq!(envelope.tool_calls[0].error.as_deref(), Some("tool is blocked"));
    }

    /// A model that always emits a tool call, no matter how many times it
    /// is asked, must not be allowed to loop forever — the turn halts
    /// cleanly at `MAX_ITERATIONS` with whatever the last reasoning step
    /// produced, rather than failing the envelope.
    struct AlwaysToolCall;

    #[async_trait]
    impl ChatProvider for AlwaysToolCall {
        async fn chat(
            &self,
            _entry: &LlmProviderEntry,
            _messages: &[ChatMessage],
            _tools: Option<&serde_json::Value>,
            _overrides: &CallOverrides,
        ) -> Result<ChatResponse, jedisos_llm::LlmError> {
            Ok(ChatResponse {
                model_id: "stub".to_string(),
                content: "still working on it".to_string(),
                tool_calls: vec![ToolCall {
                    id: "call-n".to_string(),
                    r#type: "function".to_string(),
                    function: ToolCallFunction { name: "echo".to_string(), arguments: serde_json::json!({"text": "again"}) },
                }],
                finish_reason: "tool_calls".to_string(),
                usage: None,
            })
        }

        async fn chat_stream(
            &self,
            entry: &LlmProviderEntry,
            messages: &[ChatMessage],
            tools: Option<&serde_json::Value>,
            overrides: &CallOverrides,
            _tx: mpsc::Sender<String>,
        ) -> Result<ChatResponse, jedisos_llm::LlmError> {
            self.chat(entry, messages, tools, overrides).await
        }
    }

    #[tokio::test]
    async fn iteration_bound_halts_cleanly_not_as_a_failure() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(ToolHandle::new(Arc::new(Echo), PackageSource::Builtin), false).await.unwrap();
        let llm = LlmRouter::new(Arc::new(AlwaysToolCall), vec![LlmProviderEntry::new("stub-model", "http://unused")]);
        let memory = MemoryClient::new("http://127.0.0.1:1");
        let pdp = PolicyDecisionPoint::new(Policy::allow_all(10_000));
        let audit: Arc<dyn AuditSink> = Arc::new(JsonlAuditSink::new(tempfile_path()));
        let agent = Agent::new(llm, registry, memory, pdp, audit);

        let mut envelope = Envelope::new(Channel::Cli, "u1", "Alice", "loop forever please");
        let (tx, _rx) = mpsc::channel(64);
        agent.run_turn(&mut envelope, "be helpful", tx).await.unwrap();

        assert_eq!(envelope.state, EnvelopeState::Completed);
        assert!(envelope.error.is_none());
        assert!(envelope.response.is_some());
        assert!(envelope.tool_calls.len() <= super::MAX_ITERATIONS);
    }
}
