//! One agent socket, from accept to teardown.
//!
//! `Connected -> Registered -> Closed`, never back. The reader side is driven
//! by [`AgentSession::handle_frame`]; everything written to the agent goes
//! through one bounded channel drained by a dedicated writer task, which the
//! fanout router feeds as well.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use dispatch_proto::{
    ClientMessage, CommandResultMessage, ConnectionToken, ServerMessage, SystemInformationMessage,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ids::{DeviceId, InvalidId, UserId};
use crate::registry::RegistryError;
use crate::state::AppState;

pub const OUTBOUND_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device is not registered on this connection")]
    NotRegistered,
    #[error("device already registered on this connection")]
    AlreadyRegistered,
    #[error(transparent)]
    InvalidDevice(#[from] InvalidId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid message format: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Registered { user_id: UserId, device_id: DeviceId },
    Closed,
}

pub struct AgentSession {
    app: AppState,
    connection_token: ConnectionToken,
    outbound: mpsc::Sender<String>,
    state: SessionState,
}

impl AgentSession {
    /// Claim a fresh connection token on this instance and greet the agent.
    pub async fn open(app: AppState, outbound: mpsc::Sender<String>) -> Self {
        let connection_token = ConnectionToken::mint();
        app.fanout.attach(connection_token, outbound.clone());
        counter!("beach_dispatch_connections_opened_total", 1);

        let session = Self {
            app,
            connection_token,
            outbound,
            state: SessionState::Connected,
        };
        session
            .send(&ServerMessage::Connected { connection_token })
            .await;
        debug!(connection_token = %connection_token, "agent socket accepted");
        session
    }

    pub fn connection_token(&self) -> ConnectionToken {
        self.connection_token
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Process one inbound text payload. Failures are reported back to the
    /// agent; the session always survives them.
    pub async fn handle_frame(&mut self, text: &str) {
        let outcome = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(message).await,
            Err(err) => Err(SessionError::Malformed(err)),
        };
        if let Err(err) = outcome {
            warn!(connection_token = %self.connection_token, error = %err, "rejected agent message");
            self.send(&ServerMessage::error(err.to_string())).await;
        }
    }

    async fn handle_message(&mut self, message: ClientMessage) -> Result<(), SessionError> {
        match message {
            ClientMessage::Ping => {
                self.send(&ServerMessage::Pong).await;
                Ok(())
            }
            ClientMessage::Register {
                device_id,
                pairing_code,
            } => self.register(&device_id, &pairing_code).await,
            ClientMessage::CommandResult(result) => self.command_result(result).await,
            ClientMessage::SystemInformation(snapshot) => self.system_information(snapshot).await,
        }
    }

    async fn register(&mut self, raw_device: &str, pairing_code: &str) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Connected) {
            return Err(SessionError::AlreadyRegistered);
        }
        let device_id = DeviceId::parse(raw_device)?;

        let user_id = match self
            .app
            .registry
            .register(&device_id, self.connection_token, pairing_code)
            .await
        {
            Ok(user_id) => user_id,
            Err(err) => {
                counter!("beach_dispatch_registrations_total", 1, "outcome" => "failed");
                return Err(err.into());
            }
        };
        counter!("beach_dispatch_registrations_total", 1, "outcome" => "ok");

        self.state = SessionState::Registered { user_id, device_id };
        self.send(&ServerMessage::Registered { success: true }).await;
        Ok(())
    }

    async fn command_result(&self, result: CommandResultMessage) -> Result<(), SessionError> {
        self.registered_device()?;
        if let Err(err) = self.app.dispatcher.forward_result(&result).await {
            warn!(batch_id = %result.batch_id, error = %err, "failed to forward command result");
        }
        Ok(())
    }

    async fn system_information(
        &self,
        snapshot: SystemInformationMessage,
    ) -> Result<(), SessionError> {
        let device_id = self.registered_device()?;
        if let Some(claimed) = snapshot.device_id.as_deref() {
            if claimed != device_id.as_str() {
                warn!(bound = %device_id, claimed, "system information names another device; storing under bound id");
            }
        }

        let mut fields = snapshot.fields;
        fields.insert("deviceId".into(), Value::String(device_id.to_string()));
        if let Err(err) = self
            .app
            .system_info
            .save(device_id, &Value::Object(fields))
            .await
        {
            warn!(device_id = %device_id, error = %err, "failed to store system information");
        }
        Ok(())
    }

    fn registered_device(&self) -> Result<&DeviceId, SessionError> {
        match &self.state {
            SessionState::Registered { device_id, .. } => Ok(device_id),
            _ => Err(SessionError::NotRegistered),
        }
    }

    /// Release the connection token and, if a device was bound, its slot.
    pub async fn close(mut self) {
        self.app.fanout.detach(&self.connection_token);
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Registered { user_id, device_id } = previous {
            if let Err(err) = self.app.registry.unregister(&device_id).await {
                warn!(device_id = %device_id, error = %err, "failed to unregister device");
            }
            info!(user_id = %user_id, device_id = %device_id, "agent disconnected");
        }
        counter!("beach_dispatch_connections_closed_total", 1);
    }

    async fn send(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                // Writer gone means the socket is closing; nothing left to tell.
                let _ = self.outbound.send(json).await;
            }
            Err(err) => warn!(error = %err, "failed to encode server message"),
        }
    }
}

pub async fn agent_socket(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, app))
}

async fn run_socket(socket: WebSocket, app: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut session = AgentSession::open(app, tx).await;
    let token = session.connection_token();

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection_token = %token, error = %err, "socket read failed");
                break;
            }
        };
        match frame {
            Message::Text(text) => session.handle_frame(&text).await,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => session.handle_frame(&text).await,
                Err(_) => debug!(connection_token = %token, "ignoring non-utf8 binary frame"),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    session.close().await;
    writer.abort();
    debug!(connection_token = %token, "agent socket closed");
}
