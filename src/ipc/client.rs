// src/ipc/client.rs

//! Hub client: connects to the hub, performs the handshake, maintains a
//! reconnect loop, and dispatches incoming commands/events.
//!
//! Grounded in original `ipc_client.py` (`_start`'s reconnect-generator
//! loop, `_handshake`, `_recv_loop`) and `base_client.py`
//! (`_broadcast_info_loop`), with the outbound-connect/reconnect/backoff
//! shape borrowed from `discord_proxy/mod.rs` and `discord_proxy/connection.rs`
//! (split sink/stream over a background writer task, `tokio::select!`
//! event loop, full-jitter backoff between attempts).

use crate::error::FleetError;
use crate::ipc::backoff::Backoff;
use crate::ipc::callbacks::{CallbackHandler, CallbackResult};
use crate::ipc::dispatch::{CommandGroup, CommandOutcome, EventGroup};
use crate::ipc::payload::{INVALID_TOKEN_CLOSE_CODE, Payload, PresenceFrame, Uid};
use crate::ipc::tasks::TaskSupervisor;
use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

const RECONNECT_BASE_MS: u64 = 250;
const RECONNECT_MAX_MS: u64 = 30_000;
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Deserialize)]
struct HandshakeAck {
    uid: Uid,
    client_uids: Vec<Uid>,
}

/// Static configuration for a hub client connection.
pub struct HubClientConfig {
    pub uri: String,
    pub token: String,
    pub reconnect: bool,
}

/// A connected or reconnecting hub client.
///
/// Register command/event handlers via [`Self::commands`]/[`Self::events`]
/// before calling [`Self::run`].
pub struct HubClient {
    config: HubClientConfig,
    commands: CommandGroup,
    events: EventGroup,
    callbacks: CallbackHandler,
    client_uids: Arc<DashSet<Uid>>,
    own_uid: Arc<AtomicU32>,
    outbound_tx: Arc<Mutex<Option<mpsc::Sender<Payload>>>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: TaskSupervisor,
}

impl Clone for HubClient {
    /// Clones the shared connection handle (commands, events, callbacks,
    /// presence, outbound channel) so a role can hand a lightweight copy
    /// to its background announce/placement tasks while the original
    /// keeps driving [`Self::run`]. The clone gets its own
    /// [`TaskSupervisor`], since task bookkeeping isn't meant to be
    /// shared across handles.
    fn clone(&self) -> Self {
        Self {
            config: HubClientConfig {
                uri: self.config.uri.clone(),
                token: self.config.token.clone(),
                reconnect: self.config.reconnect,
            },
            commands: self.commands.clone(),
            events: self.events.clone(),
            callbacks: self.callbacks.clone(),
            client_uids: self.client_uids.clone(),
            own_uid: self.own_uid.clone(),
            outbound_tx: self.outbound_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            tasks: TaskSupervisor::new(),
        }
    }
}

impl HubClient {
    pub fn new(config: HubClientConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            commands: CommandGroup::new(),
            events: EventGroup::new(),
            callbacks: CallbackHandler::new(),
            client_uids: Arc::new(DashSet::new()),
            own_uid: Arc::new(AtomicU32::new(0)),
            outbound_tx: Arc::new(Mutex::new(None)),
            shutdown_tx,
            tasks: TaskSupervisor::new(),
        }
    }

    pub fn commands(&self) -> &CommandGroup {
        &self.commands
    }

    pub fn events(&self) -> &EventGroup {
        &self.events
    }

    pub fn uid(&self) -> Uid {
        self.own_uid.load(Ordering::Relaxed)
    }

    /// All uids currently known to be connected to the hub (including our own).
    pub fn client_uids(&self) -> Vec<Uid> {
        self.client_uids.iter().map(|e| *e).collect()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Send a command and await a response from every recipient, or
    /// `timeout` elapsing (default 3s, matching the original).
    pub async fn send_command(
        &self,
        recipients: &[Uid],
        name: &str,
        data: Value,
    ) -> Result<HashMap<Uid, CallbackResult>, FleetError> {
        self.send_command_timeout(recipients, name, data, DEFAULT_COMMAND_TIMEOUT)
            .await
    }

    pub async fn send_command_timeout(
        &self,
        recipients: &[Uid],
        name: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<HashMap<Uid, CallbackResult>, FleetError> {
        let (callback, _guard) = self.callbacks.register(recipients);
        let payload = Payload::Command {
            author: self.uid(),
            recipients: recipients.to_vec(),
            callback,
            name: name.to_string(),
            data,
        };
        self.send(payload).await?;
        Ok(self.callbacks.wait(callback, timeout).await)
    }

    pub async fn send_event(&self, recipients: &[Uid], name: &str, data: Value) -> Result<(), FleetError> {
        let payload = Payload::Event {
            author: self.uid(),
            recipients: recipients.to_vec(),
            name: name.to_string(),
            data,
        };
        self.send(payload).await
    }

    async fn send(&self, payload: Payload) -> Result<(), FleetError> {
        let guard = self.outbound_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(payload)
                .await
                .map_err(|_| FleetError::ChannelClosed),
            None => Err(FleetError::ChannelClosed),
        }
    }

    /// Run the connect/handshake/serve loop until shutdown, reconnecting
    /// with full-jitter backoff on every drop (per `ipc_client.py`'s
    /// reconnect generator). Returns once `request_shutdown` fires,
    /// immediately after the first disconnection if `reconnect` is false,
    /// or immediately on an invalid-token rejection regardless of
    /// `reconnect` — a bad token will never start working on retry.
    pub async fn run(&mut self) -> Result<(), FleetError> {
        let mut backoff = Backoff::new(RECONNECT_BASE_MS, RECONNECT_MAX_MS);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            match self.connect_and_serve(&mut shutdown_rx).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "hub connection lost");
                    *self.outbound_tx.lock().await = None;
                    if matches!(e, FleetError::InvalidIpcToken) || !self.config.reconnect {
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    info!(delay_ms = delay.as_millis(), "reconnecting to hub");
                    tokio::select! {
                        _ = shutdown_rx.recv() => return Ok(()),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_serve(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<(), FleetError> {
        info!(uri = %self.config.uri, "connecting to hub");
        let (ws, _response) = connect_async(&self.config.uri).await?;
        let (mut writer, mut reader) = ws.split();

        writer
            .send(Message::Text(
                serde_json::to_string(&serde_json::json!({ "token": self.config.token }))?.into(),
            ))
            .await?;

        let ack_text = match reader.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(frame))) => {
                if frame.is_some_and(|f| u16::from(f.code) == INVALID_TOKEN_CLOSE_CODE) {
                    return Err(FleetError::InvalidIpcToken);
                }
                return Err(FleetError::Protocol("hub closed connection during handshake".into()));
            }
            None => {
                return Err(FleetError::Protocol("hub closed connection during handshake".into()));
            }
            Some(Ok(_)) => {
                return Err(FleetError::Protocol("unexpected frame during handshake".into()));
            }
            Some(Err(e)) => return Err(e.into()),
        };
        let ack: HandshakeAck = serde_json::from_str(&ack_text)?;
        self.own_uid.store(ack.uid, Ordering::Relaxed);
        self.client_uids.clear();
        for uid in &ack.client_uids {
            self.client_uids.insert(*uid);
        }
        info!(uid = ack.uid, "handshake complete");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Payload>(256);
        *self.outbound_tx.lock().await = Some(outbound_tx.clone());

        let writer_handle = tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                let json = match payload.to_json() {
                    Ok(j) => j,
                    Err(e) => {
                        error!(error = %e, "failed to encode outgoing payload");
                        continue;
                    }
                };
                if writer.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        let result = self.event_loop(&mut reader, shutdown_rx).await;

        drop(outbound_tx);
        let _ = tokio::time::timeout(Duration::from_secs(2), writer_handle).await;

        result
    }

    async fn event_loop(
        &self,
        reader: &mut futures::stream::SplitStream<WsStream>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), FleetError> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Ok(()),
                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_incoming(&text).await,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(FleetError::Protocol("hub connection closed".into()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Decodes one inbound frame and routes it. Command and event dispatch
    /// are each handed to a freshly spawned task so a slow or hanging
    /// handler can never stall this connection's receive loop; responses
    /// to our own in-flight callbacks are cheap and handled inline.
    async fn handle_incoming(&self, text: &str) {
        // The hub's presence broadcast is a distinct, unrouted frame
        // (`internal: true`); everything else is a routed `Payload`.
        if let Ok(frame) = serde_json::from_str::<PresenceFrame>(text)
            && frame.internal
        {
            self.client_uids.clear();
            for uid in frame.client_uids {
                self.client_uids.insert(uid);
            }
            self.callbacks.check_disconnects(&self.client_uids());
            return;
        }

        let payload = match Payload::from_json(text) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to decode hub frame");
                return;
            }
        };

        match payload {
            Payload::Command {
                author,
                callback,
                name,
                data,
                ..
            } => {
                let client = self.clone();
                tokio::spawn(async move { client.dispatch_command(author, callback, name, data).await });
            }
            Payload::Event { author, name, data, .. } => {
                let events = self.events.clone();
                tokio::spawn(async move { events.dispatch(&name, author, data).await });
            }
            Payload::ResponseOk { author, callback, data, .. } => {
                self.callbacks.handle_response(callback, author, CallbackResult::Ok(data));
            }
            Payload::ResponseTraceback {
                author,
                callback,
                traceback,
                ..
            } => {
                self.callbacks
                    .handle_response(callback, author, CallbackResult::Traceback(traceback));
            }
            Payload::ResponseNotFound { author, callback, .. } => {
                self.callbacks.handle_response(callback, author, CallbackResult::NotFound);
            }
        }
    }

    async fn dispatch_command(&self, author: Uid, callback: u64, name: String, data: Value) {
        let outcome = self.commands.dispatch(&name, author, data).await;
        let response = match outcome {
            CommandOutcome::Ok(value) => Payload::ResponseOk {
                author: self.uid(),
                recipients: vec![author],
                callback,
                data: value,
            },
            CommandOutcome::Traceback(traceback) => Payload::ResponseTraceback {
                author: self.uid(),
                recipients: vec![author],
                callback,
                traceback,
            },
            CommandOutcome::NotFound => Payload::ResponseNotFound {
                author: self.uid(),
                recipients: vec![author],
                callback,
            },
        };
        if let Err(e) = self.send(response).await {
            debug!(error = %e, "failed to send command response");
        }
    }

    /// Exposes the client's task supervisor so a role client can spawn its
    /// own periodic `set_info_class` broadcast (per `base_client.py`'s
    /// `_broadcast_info_loop`) using [`Self::send_event`] with its own
    /// current `ServerInfo`/`ClusterInfo`/`BrainInfo` snapshot — the exact
    /// shape of that snapshot is role-specific, so it lives with the role,
    /// not here.
    pub fn tasks(&mut self) -> &mut TaskSupervisor {
        &mut self.tasks
    }

    pub fn shutdown_subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_ack_deserializes() {
        let ack: HandshakeAck = serde_json::from_str(r#"{"uid": 7, "client_uids": [1,2,7]}"#).unwrap();
        assert_eq!(ack.uid, 7);
        assert_eq!(ack.client_uids, vec![1, 2, 7]);
    }

    #[tokio::test]
    async fn send_without_connection_errors() {
        let client = HubClient::new(HubClientConfig {
            uri: "ws://127.0.0.1:1".into(),
            token: "t".into(),
            reconnect: false,
        });
        let err = client.send_event(&[1], "ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, FleetError::ChannelClosed));
    }
}
