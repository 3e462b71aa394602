//! Composes the agent, forge, tool registry, and session layer into one
//! process-wide context a channel adapter drives. Replaces the pattern of
//! reaching for global singletons: every dependency is an explicit field
//! here, constructed once at startup and handed to whichever adapter needs
//! it.

pub mod channel;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use jedisos_agent::{Agent, BackendEvent, FORGE_TRIGGER_TOOL_NAME};
use jedisos_envelope::Envelope;
use jedisos_forge::{Forge, ForgeRequest};
use jedisos_identity::Identity;
use jedisos_tools::ToolRegistry;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use channel::ChannelAdapter;
pub use session::SessionManager;

const TURN_EVENT_QUEUE_CAPACITY: usize = 64;

/// One request-processing engine instance. Construct once per process;
/// every channel adapter submits envelopes through the same instance so
/// tool state, memory, and sessions stay consistent across adapters.
pub struct Engine {
    agent: Arc<Agent>,
    forge: Arc<Forge>,
    tools: Arc<ToolRegistry>,
    identity: Identity,
    sessions: Arc<SessionManager>,
}

impl Engine {
    pub fn new(agent: Agent, forge: Forge, tools: Arc<ToolRegistry>, identity: Identity, sessions: SessionManager) -> Self {
        Self { agent: Arc::new(agent), forge: Arc::new(forge), tools, identity, sessions: Arc::new(sessions) }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }
}

#[async_trait]
impl ChannelAdapter for Engine {
    /// Runs the turn on a background task and returns the receiving half
    /// immediately, so a slow or unbounded turn never blocks the adapter's
    /// own event loop. A tool call named [`FORGE_TRIGGER_TOOL_NAME`]
    /// spawns a forge attempt decoupled from this turn: the turn keeps
    /// going with what it already knows, and the new tool (if the forge
    /// run succeeds) becomes available for the next turn.
    fn submit(&self, mut envelope: Envelope) -> mpsc::Receiver<BackendEvent> {
        let (out_tx, out_rx) = mpsc::channel(TURN_EVENT_QUEUE_CAPACITY);
        let (agent_tx, mut agent_rx) = mpsc::channel(TURN_EVENT_QUEUE_CAPACITY);

        let agent = self.agent.clone();
        let forge = self.forge.clone();
        let tools = self.tools.clone();
        let sessions = self.sessions.clone();
        let persona = self.identity.text().to_string();
        let user_id = envelope.user_id.clone();

        tokio::spawn(async move {
            let forwarder_user_id = user_id.clone();
            let forwarder_forge = forge.clone();
            let forwarder_tools = tools.clone();
            let forwarder_sessions = sessions.clone();
            let forwarder_out = out_tx.clone();

            let forwarder = tokio::spawn(async move {
                while let Some(event) = agent_rx.recv().await {
                    if let BackendEvent::ForgeRequested { goal } = &event {
                        spawn_forge_attempt(
                            forwarder_forge.clone(),
                            forwarder_tools.clone(),
                            forwarder_sessions.clone(),
                            forwarder_user_id.clone(),
                            goal.clone(),
                        );
                    }
                    if forwarder_out.send(event).await.is_err() {
                        break;
                    }
                }
            });

            if let Err(err) = agent.run_turn(&mut envelope, &persona, agent_tx).await {
                let _ = out_tx.send(BackendEvent::Error(err.to_string())).await;
            }
            let _ = forwarder.await;
        });

        out_rx
    }

    async fn notify(&self, user_id: &str, message: &str) {
        self.sessions.notify(user_id, BackendEvent::Token(message.to_string())).await;
    }
}

/// Runs one forge attempt to completion on its own task, registers any
/// produced tool handles, and notifies the requesting user of the outcome.
/// At most one attempt runs per trigger — callers do not retry a forge
/// request themselves, the forge's own bounded retry covers that.
fn spawn_forge_attempt(
    forge: Arc<Forge>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    user_id: String,
    goal: String,
) {
    tokio::spawn(async move {
        let request = ForgeRequest { user_id: user_id.clone(), goal };
        match forge.run(&request).await {
            Ok(outcome) => {
                for handle in outcome.handles {
                    let tool_name = handle.spec.name.clone();
                    if let Err(err) = tools.register(handle, false).await {
                        warn!(tool_name, error = %err, "forge produced a tool but registration failed");
                        continue;
                    }
                    info!(tool_name, package = %outcome.package_name, "forge-built tool registered");
                }
                let message = format!("I built and enabled a new tool: {}.", outcome.tool_name);
                sessions.notify(&user_id, BackendEvent::Token(message)).await;
            }
            Err(err) => {
                warn!(user_id, error = %err, "forge attempt failed");
                let message = format!("I couldn't finish building that tool: {err}");
                sessions.notify(&user_id, BackendEvent::Error(message)).await;
            }
        }
    });
}

/// Name the agent's tool schema should advertise for the forge-trigger
/// sentinel, so a channel adapter assembling its own system prompt can
/// mention it without importing `jedisos-agent` directly.
pub fn forge_trigger_tool_name() -> &'static str {
    FORGE_TRIGGER_TOOL_NAME
}
