//! Reference device agent. Pairs with a server over its websocket and runs
//! every command it is handed through a local shell.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dispatch_proto::{
    BatchId, ClientMessage, CommandResultMessage, ServerMessage, SystemInformationMessage,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::AgentArgs;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(args: AgentArgs) -> Result<()> {
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<ClientMessage>(64);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let keepalive_tx = tx.clone();
    let keepalive = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if keepalive_tx.send(ClientMessage::Ping).await.is_err() {
                break;
            }
        }
    });

    let outcome = drive(&args, &tx, &mut ws_rx).await;
    keepalive.abort();
    writer.abort();
    outcome
}

async fn drive<S>(args: &AgentArgs, tx: &mpsc::Sender<ClientMessage>, ws_rx: &mut S) -> Result<()>
where
    S: futures_util::stream::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut registered = false;

    while let Some(frame) = ws_rx.next().await {
        let text = match frame.context("websocket read failed")? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let message = match serde_json::from_str::<ServerMessage>(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "ignoring unrecognised server frame");
                continue;
            }
        };

        match message {
            ServerMessage::Connected { connection_token } => {
                info!(%connection_token, "connected; registering device");
                send(
                    tx,
                    ClientMessage::Register {
                        device_id: args.device_id.clone(),
                        pairing_code: args.pairing_code.clone(),
                    },
                )
                .await?;
            }
            ServerMessage::Registered { .. } => {
                registered = true;
                info!(device_id = %args.device_id, "device registered");
                send(
                    tx,
                    ClientMessage::SystemInformation(system_snapshot(&args.device_id)),
                )
                .await?;
            }
            ServerMessage::Execute { batch_id, commands } => {
                info!(%batch_id, commands = commands.len(), "executing batch");
                for (index, command) in commands.into_iter().enumerate() {
                    let tx = tx.clone();
                    let shell = args.shell.clone();
                    tokio::spawn(async move {
                        let result = run_command(&shell, batch_id, index, command).await;
                        let _ = tx.send(ClientMessage::CommandResult(result)).await;
                    });
                }
            }
            ServerMessage::Error { message } if !registered => {
                bail!("registration rejected: {message}");
            }
            ServerMessage::Error { message } => warn!(%message, "server reported an error"),
            ServerMessage::Pong => debug!("pong"),
        }
    }

    info!("server closed the connection");
    Ok(())
}

async fn send(tx: &mpsc::Sender<ClientMessage>, message: ClientMessage) -> Result<()> {
    tx.send(message)
        .await
        .map_err(|_| anyhow!("websocket writer stopped"))
}

/// Run one command through `shell -c` and package the outcome.
pub async fn run_command(
    shell: &str,
    batch_id: BatchId,
    index: usize,
    command: String,
) -> CommandResultMessage {
    let (output, success) = match Command::new(shell).arg("-c").arg(&command).output().await {
        Ok(out) => (
            json!({
                "stdout": String::from_utf8_lossy(&out.stdout),
                "stderr": String::from_utf8_lossy(&out.stderr),
                "exitCode": out.status.code(),
            }),
            out.status.success(),
        ),
        Err(err) => (json!({ "error": err.to_string() }), false),
    };
    CommandResultMessage {
        batch_id,
        index: json!(index),
        command: Some(command),
        output: Some(output),
        success: Some(success),
    }
}

pub fn system_snapshot(device_id: &str) -> SystemInformationMessage {
    let mut fields = Map::new();
    fields.insert("hostname".into(), Value::String(hostname()));
    fields.insert("os".into(), json!(std::env::consts::OS));
    fields.insert("arch".into(), json!(std::env::consts::ARCH));
    fields.insert(
        "cpus".into(),
        json!(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
    );
    fields.insert("reportedAt".into(), json!(chrono::Utc::now()));
    SystemInformationMessage {
        device_id: Some(device_id.to_string()),
        fields,
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".into())
}
