//! Thin client for the Unix-socket daemon, used by `chat`/`health` when a
//! `jedisos serve` process is already running.

use std::io::Write as _;
use std::path::Path;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::daemon::{ClientCommand, ServerEvent};

/// Submits one turn to the daemon and prints streamed content to stdout as
/// it arrives. Returns once the turn reaches `Done` or `Error`.
pub async fn submit_turn(socket: &Path, user_id: &str, user_name: &str, content: &str) -> Result<()> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();

    let command = ClientCommand::SubmitTurn {
        user_id: user_id.to_string(),
        user_name: user_name.to_string(),
        content: content.to_string(),
    };
    let mut line = serde_json::to_string(&command)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    let mut buf = String::new();
    loop {
        buf.clear();
        let bytes = reader.read_line(&mut buf).await?;
        if bytes == 0 {
            break;
        }
        let trimmed = buf.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<ServerEvent>(trimmed)? {
            ServerEvent::Stream { content } => {
                print!("{content}");
                std::io::stdout().flush().ok();
            }
            ServerEvent::Done => {
                println!();
                break;
            }
            ServerEvent::Notification { message } => println!("\n[notification] {message}"),
            ServerEvent::Error { message } => {
                eprintln!("\nerror: {message}");
                break;
            }
        }
    }
    Ok(())
}

pub async fn health(socket: &Path) -> Result<bool> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_string(&ClientCommand::Health)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    let mut buf = String::new();
    reader.read_line(&mut buf).await?;
    Ok(serde_json::from_str::<ServerEvent>(buf.trim()).is_ok())
}
