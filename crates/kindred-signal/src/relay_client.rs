//! WebSocket client of the Kindred relay.
//!
//! A single background task owns the socket. Callers talk to it over a
//! command channel; every frame the client sends gets exactly one reply from
//! the relay, in order, so replies are matched against a FIFO of pending
//! requests. Signal frames are routed to the room's live subscriptions.
//!
//! On disconnect the task reconnects with capped exponential backoff and
//! re-subscribes every room that still has subscribers. When
//! `max_reconnect` consecutive attempts fail, every subscription is ended
//! and queued requests fail with [`TransportError::Closed`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use kindred_common::config::RelayClientSettings;
use kindred_common::models::{RelayFrame, RoomId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Ack, SUBSCRIPTION_BUFFER, SignalTransport, Subscription, TransportError};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub url: String,
    pub max_reconnect: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8090/signal".into(),
            max_reconnect: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl From<&RelayClientSettings> for RelayClientConfig {
    fn from(s: &RelayClientSettings) -> Self {
        Self {
            url: s.url.clone(),
            max_reconnect: s.max_reconnect,
            backoff_base: Duration::from_millis(s.backoff_base_ms),
            backoff_max: Duration::from_millis(s.backoff_max_ms),
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

enum Command {
    Publish {
        room: RoomId,
        raw: String,
        reply: oneshot::Sender<Result<Ack, TransportError>>,
    },
    Subscribe {
        room: RoomId,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Unsubscribe {
        room: RoomId,
    },
}

impl Command {
    fn fail(self) {
        match self {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(TransportError::Closed));
            }
            Command::Subscribe { reply, .. } => {
                let _ = reply.send(Err(TransportError::Closed));
            }
            Command::Unsubscribe { .. } => {}
        }
    }
}

/// A request waiting for its reply frame.
enum Pending {
    Publish {
        room: RoomId,
        reply: oneshot::Sender<Result<Ack, TransportError>>,
    },
    Subscribe {
        room: RoomId,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Ignore,
}

impl Pending {
    fn resolve(self, frame: RelayFrame) {
        match (self, frame) {
            (Pending::Publish { reply, .. }, RelayFrame::Ack { receivers, .. }) => {
                let _ = reply.send(Ok(Ack { receivers }));
            }
            (Pending::Subscribe { reply, .. }, RelayFrame::Subscribed { .. }) => {
                let _ = reply.send(Ok(()));
            }
            (Pending::Publish { room, reply }, RelayFrame::Error { code, message }) => {
                let _ = reply.send(Err(TransportError::Publish {
                    room,
                    message: format!("{code}: {message}"),
                }));
            }
            (Pending::Subscribe { room, reply }, RelayFrame::Error { code, message }) => {
                let _ = reply.send(Err(TransportError::Subscribe {
                    room,
                    message: format!("{code}: {message}"),
                }));
            }
            (Pending::Ignore, RelayFrame::Error { code, message }) => {
                warn!(code, %message, "Relay rejected background request");
            }
            (Pending::Ignore, _) => {}
            (pending, frame) => {
                warn!(?frame, "Unexpected reply from relay");
                pending.fail();
            }
        }
    }

    fn fail(self) {
        match self {
            Pending::Publish { reply, .. } => {
                let _ = reply.send(Err(TransportError::Closed));
            }
            Pending::Subscribe { reply, .. } => {
                let _ = reply.send(Err(TransportError::Closed));
            }
            Pending::Ignore => {}
        }
    }
}

/// Live subscription sinks, keyed by room then subscription id.
#[derive(Default)]
struct Rooms {
    sinks: Mutex<HashMap<RoomId, HashMap<Uuid, mpsc::Sender<String>>>>,
}

impl Rooms {
    fn insert(&self, room: &RoomId, id: Uuid, tx: mpsc::Sender<String>) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.entry(room.clone()).or_default().insert(id, tx);
        }
    }

    /// Remove one sink. Returns true when the room has no subscribers left.
    fn remove(&self, room: &RoomId, id: Uuid) -> bool {
        let Ok(mut sinks) = self.sinks.lock() else {
            return false;
        };
        let Some(room_sinks) = sinks.get_mut(room) else {
            return false;
        };
        room_sinks.remove(&id);
        if room_sinks.is_empty() {
            sinks.remove(room);
            return true;
        }
        false
    }

    fn names(&self) -> Vec<RoomId> {
        self.sinks
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Fan a relayed signal out to local subscribers. Never waits on a slow
    /// subscriber: a full [`SUBSCRIPTION_BUFFER`] drops the signal for it.
    fn deliver(&self, room: &RoomId, message: String) {
        let targets: Vec<mpsc::Sender<String>> = self
            .sinks
            .lock()
            .map(|s| s.get(room).map(|m| m.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default();

        for tx in targets {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(message.clone()) {
                warn!(room = %room, "Subscriber buffer full, signal dropped");
            }
        }
    }

    /// Drop every sink; subscribers observe the end of their stream.
    fn clear(&self) {
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.clear();
        }
    }
}

/// Relay-backed [`SignalTransport`]. Cheap to clone.
#[derive(Clone)]
pub struct RelayClient {
    commands: mpsc::Sender<Command>,
    rooms: Arc<Rooms>,
}

impl RelayClient {
    /// Spawn the connection task. Returns immediately; requests issued before
    /// the first connect are queued.
    pub fn spawn(config: RelayClientConfig) -> Self {
        let (commands, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let rooms = Arc::new(Rooms::default());
        tokio::spawn(run_connection(config, rx, rooms.clone()));
        Self { commands, rooms }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, TransportError>>) -> Command,
    ) -> Result<T, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl SignalTransport for RelayClient {
    async fn publish_raw(&self, room: &RoomId, raw: String) -> Result<Ack, TransportError> {
        let room = room.clone();
        self.request(|reply| Command::Publish { room, raw, reply }).await
    }

    async fn subscribe(&self, room: &RoomId) -> Result<Subscription, TransportError> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // Register first so nothing relayed after `Subscribed` is missed.
        self.rooms.insert(room, id, tx);

        let target = room.clone();
        if let Err(e) = self
            .request(|reply| Command::Subscribe { room: target, reply })
            .await
        {
            self.rooms.remove(room, id);
            return Err(e);
        }

        let rooms = self.rooms.clone();
        let commands = self.commands.clone();
        let hook_room = room.clone();
        Ok(Subscription::new(room.clone(), rx)
            .with_id(id)
            .on_cancel(move || {
                if rooms.remove(&hook_room, id) {
                    let _ = commands.try_send(Command::Unsubscribe { room: hook_room });
                }
            }))
    }
}

enum SessionEnd {
    /// Every client handle is gone.
    Shutdown,
    Lost(String),
}

async fn run_connection(config: RelayClientConfig, mut commands: mpsc::Receiver<Command>, rooms: Arc<Rooms>) {
    let mut attempts = 0u32;
    loop {
        let reason = match connect_async(config.url.as_str()).await {
            Ok((socket, _)) => {
                if attempts > 0 {
                    info!(url = %config.url, "Reconnected to relay");
                } else {
                    info!(url = %config.url, "Connected to relay");
                }
                attempts = 0;
                match run_session(socket, &mut commands, &rooms).await {
                    SessionEnd::Shutdown => {
                        debug!("Relay client dropped, closing connection");
                        return;
                    }
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        attempts += 1;
        if attempts > config.max_reconnect {
            error!(url = %config.url, %reason, "Relay unreachable, max reconnect attempts reached");
            rooms.clear();
            commands.close();
            while let Ok(cmd) = commands.try_recv() {
                cmd.fail();
            }
            return;
        }

        let delay = backoff_delay(config.backoff_base, config.backoff_max, attempts);
        warn!(%reason, attempt = attempts, ?delay, "Relay connection lost, reconnecting");
        sleep(delay).await;
    }
}

async fn run_session(socket: Socket, commands: &mut mpsc::Receiver<Command>, rooms: &Rooms) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let mut pending: VecDeque<Pending> = VecDeque::new();

    let end = 'session: {
        for room in rooms.names() {
            if let Err(e) = send_frame(&mut sink, &RelayFrame::Subscribe { room: room.clone() }).await {
                break 'session SessionEnd::Lost(e.to_string());
            }
            debug!(room = %room, "Re-subscribed after reconnect");
            pending.push_back(Pending::Ignore);
        }

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = sink.close().await;
                        break 'session SessionEnd::Shutdown;
                    };
                    let (frame, waiting) = match cmd {
                        Command::Publish { room, raw, reply } => (
                            RelayFrame::Publish { room: room.clone(), message: raw },
                            Pending::Publish { room, reply },
                        ),
                        Command::Subscribe { room, reply } => (
                            RelayFrame::Subscribe { room: room.clone() },
                            Pending::Subscribe { room, reply },
                        ),
                        Command::Unsubscribe { room } => (RelayFrame::Unsubscribe { room }, Pending::Ignore),
                    };
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        waiting.fail();
                        break 'session SessionEnd::Lost(e.to_string());
                    }
                    pending.push_back(waiting);
                }

                msg = stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break 'session SessionEnd::Lost("closed by relay".into()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break 'session SessionEnd::Lost(e.to_string()),
                    };
                    let frame: RelayFrame = match serde_json::from_str(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "Undecodable frame from relay");
                            continue;
                        }
                    };
                    match frame {
                        RelayFrame::Signal { room, message } => rooms.deliver(&room, message),
                        reply => match pending.pop_front() {
                            Some(waiting) => waiting.resolve(reply),
                            None => warn!(frame = ?reply, "Reply with no pending request"),
                        },
                    }
                }
            }
        }
    };

    for waiting in pending {
        waiting.fail();
    }
    end
}

async fn send_frame(
    sink: &mut futures_util::stream::SplitSink<Socket, Message>,
    frame: &RelayFrame,
) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}
