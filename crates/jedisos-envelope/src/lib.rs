//! The Envelope: the immutable-shell request record carried through the engine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Fixed set of channels an Envelope may have originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Telegram,
    Discord,
    Slack,
    Cli,
    Api,
    Web,
}

/// The Envelope's explicit state machine. See [`Envelope::transition`] for
/// the allowed graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeState {
    Created,
    Authorized,
    Denied,
    Processing,
    ToolCalling,
    Completed,
    Failed,
}

impl EnvelopeState {
    fn allowed_next(self) -> &'static [EnvelopeState] {
        use EnvelopeState::*;
        match self {
            Created => &[Authorized, Denied],
            Authorized => &[Processing],
            Processing => &[ToolCalling, Completed, Failed],
            ToolCalling => &[Processing, Completed, Failed],
            Denied | Completed | Failed => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EnvelopeState::Denied | EnvelopeState::Completed | EnvelopeState::Failed
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid envelope transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: EnvelopeState,
        to: EnvelopeState,
    },
}

/// One tool invocation attempted while processing an Envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// A single memory record attached to an Envelope after recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
}

/// Represents one user request through the system. Constructed once by a
/// channel adapter, mutated only by the agent and the policy decision point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub channel: Channel,
    pub user_id: String,
    pub user_name: String,
    pub content: String,
    pub state: EnvelopeState,
    pub metadata: HashMap<String, String>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub memory_context: Vec<MemoryRecord>,
}

impl Envelope {
    /// Constructs a new Envelope in the `created` state with a time-sortable
    /// id (UUIDv7: lexicographic order tracks creation order).
    pub fn new(channel: Channel, user_id: impl Into<String>, user_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            created_at: Utc::now(),
            channel,
            user_id: user_id.into(),
            user_name: user_name.into(),
            content: content.into(),
            state: EnvelopeState::Created,
            metadata: HashMap::new(),
            response: None,
            error: None,
            tool_calls: Vec::new(),
            memory_context: Vec::new(),
        }
    }

    /// Moves to `to`, failing if the transition is not in the allowed graph.
    pub fn transition(&mut self, to: EnvelopeState) -> Result<(), EngineError> {
        if !self.state.allowed_next().contains(&to) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn complete(&mut self, response: impl Into<String>) -> Result<(), EngineError> {
        self.transition(EnvelopeState::Completed)?;
        self.response = Some(response.into());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), EngineError> {
        self.transition(EnvelopeState::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn deny(&mut self, reason: impl Into<String>) -> Result<(), EngineError> {
        self.transition(EnvelopeState::Denied)?;
        self.error = Some(reason.into());
        Ok(())
    }
}
