//! The contract every transport (CLI, and — out of scope here — Telegram,
//! Discord, Slack, the web dashboard) implements to hand a user turn to the
//! engine and receive background notifications back.

use async_trait::async_trait;
use jedisos_agent::BackendEvent;
use jedisos_envelope::Envelope;
use tokio::sync::mpsc;

/// Submitting an envelope returns immediately with an event stream; the
/// adapter renders `Token`/`ToolCallStart`/`ToolCallEnd`/`Done`/`Error`
/// events as they arrive rather than blocking on a single response value.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn submit(&self, envelope: Envelope) -> mpsc::Receiver<BackendEvent>;

    /// Out-of-band message to a user not currently mid-turn — e.g. a forge
    /// completion notice. Adapters without a persistent connection to the
    /// user (e.g. a one-shot CLI invocation) may no-op this.
    async fn notify(&self, user_id: &str, message: &str);
}
