//! Unix-socket daemon: one reference, long-lived process other local
//! adapters can submit turns to, grounded on the source material's
//! `DaemonClient`/`UnixStream` line-protocol pattern — a newline-delimited
//! JSON request followed by a newline-delimited JSON stream of events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use jedisos_agent::BackendEvent;
use jedisos_engine::{ChannelAdapter, Engine};
use jedisos_envelope::{Channel, Envelope};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::services;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    SubmitTurn { user_id: String, user_name: String, content: String },
    Health,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Stream { content: String },
    Done,
    Notification { message: String },
    Error { message: String },
}

impl From<BackendEvent> for ServerEvent {
    fn from(event: BackendEvent) -> Self {
        match event {
            BackendEvent::Token(text) => ServerEvent::Stream { content: text },
            BackendEvent::ToolCallStart(info) => {
                ServerEvent::Stream { content: format!("[calling {}]", info.name) }
            }
            BackendEvent::ToolCallEnd(info) => {
                ServerEvent::Stream { content: format!("[{} -> {}]", info.name, info.output) }
            }
            BackendEvent::ForgeRequested { goal } => {
                ServerEvent::Stream { content: format!("[building a tool for: {goal}]") }
            }
            BackendEvent::Done => ServerEvent::Done,
            BackendEvent::Error(message) => ServerEvent::Error { message },
        }
    }
}

pub fn socket_path() -> PathBuf {
    services::state_dir().join("daemon.sock")
}

/// Binds the Unix socket and serves connections until the process is
/// killed. Each connection gets its own Envelope-submitting task; the
/// underlying `Engine` (and therefore the tool registry, policy state, and
/// audit sink) is shared across every connection.
pub async fn run(socket: &Path) -> Result<()> {
    if socket.exists() {
        std::fs::remove_file(socket).context("removing stale daemon socket")?;
    }
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let engine = Arc::new(services::build_engine().await.context("building engine")?);
    let listener = UnixListener::bind(socket).with_context(|| format!("binding {}", socket.display()))?;
    info!(socket = %socket.display(), "daemon listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &engine).await {
                warn!(error = %err, "connection handling failed");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, engine: &Engine) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let command: ClientCommand = serde_json::from_str(line.trim())?;
    match command {
        ClientCommand::Health => {
            write_event(&mut write_half, &ServerEvent::Done).await?;
        }
        ClientCommand::SubmitTurn { user_id, user_name, content } => {
            let envelope = Envelope::new(Channel::Api, &user_id, &user_name, &content);
            let mut events = engine.submit(envelope);
            while let Some(event) = events.recv().await {
                write_event(&mut write_half, &ServerEvent::from(event)).await?;
            }
        }
    }
    Ok(())
}

async fn write_event(write_half: &mut tokio::net::unix::OwnedWriteHalf, event: &ServerEvent) -> Result<()> {
    let mut line = serde_json::to_string(event)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}

/// True if a daemon is listening on `socket` right now.
pub async fn is_running(socket: &Path) -> bool {
    UnixStream::connect(socket).await.is_ok()
}

pub async fn connect_with_backoff(socket: &Path, max_attempts: usize) -> Result<UnixStream> {
    let mut delay = std::time::Duration::from_millis(100);
    for attempt in 0..max_attempts.max(1) {
        match UnixStream::connect(socket).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if attempt + 1 == max_attempts.max(1) {
                    bail!("could not connect to daemon at {}: {err}", socket.display());
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(std::time::Duration::from_secs(2));
            }
        }
    }
    unreachable!()
}
