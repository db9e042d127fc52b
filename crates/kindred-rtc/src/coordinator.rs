//! Per-room negotiation coordinator.
//!
//! Each open session runs one task that owns its [`Negotiator`] and
//! serializes everything touching it: caller commands, inbound signals from
//! the room subscription, engine events, and the auto-offer and recovery
//! timers. Independent rooms run concurrently and never share state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kindred_common::config::AppConfig;
use kindred_common::models::{ParticipantId, RoomId, SessionDescription, SignalMessage};
use kindred_signal::{SignalTransport, Subscription};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::error::RtcError;
use crate::monitor::{ConnectionStatus, Recovery, RecoveryPolicy};
use crate::negotiator::{Applied, Negotiator};
use crate::peer::{MediaSource, PeerConnectionFactory, PeerEvent, RemoteTrack, RtcConfig};
use crate::session::{ConnectionState, PeerSession};

/// Engine events buffered between the engine and the room loop.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Offer on our own if no offer arrives within this window. `None`
    /// disables the fallback.
    pub auto_offer: Option<Duration>,
    pub command_buffer: usize,
    pub recovery: RecoveryPolicy,
    pub rtc: RtcConfig,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            auto_offer: Some(Duration::from_millis(1000)),
            command_buffer: 256,
            recovery: RecoveryPolicy::default(),
            rtc: RtcConfig::default(),
        }
    }
}

impl From<&AppConfig> for NegotiationConfig {
    fn from(cfg: &AppConfig) -> Self {
        let auto_offer_ms = cfg.negotiation.auto_offer_ms;
        Self {
            auto_offer: (auto_offer_ms > 0).then(|| Duration::from_millis(auto_offer_ms)),
            command_buffer: cfg.negotiation.command_buffer.max(1),
            recovery: RecoveryPolicy::from(&cfg.recovery),
            rtc: RtcConfig::from(&cfg.ice),
        }
    }
}

/// Collaborators shared by every session: the signal bus, the engine, and
/// local media.
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn SignalTransport>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaSource>,
    pub config: NegotiationConfig,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Requested,
    Replaced,
    SubscriptionLost,
}

/// Point-in-time view of a session, refreshed after every event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub session: PeerSession,
    pub status: ConnectionStatus,
    pub recovery_attempts: u32,
    pub queued_candidates: usize,
    /// Code of the most recent error raised inside the session loop (an
    /// inbound offer or answer, the auto-offer, recovery, or candidate
    /// trickling). Errors from handle calls are returned to the caller instead.
    pub last_error: Option<&'static str>,
    pub close_reason: Option<CloseReason>,
}

pub type ConnectionCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;
pub type RemoteMediaCallback = Box<dyn Fn(RemoteTrack) + Send + Sync>;

enum Command {
    Initiate {
        reply: oneshot::Sender<Result<SessionDescription, RtcError>>,
    },
    Message {
        message: SignalMessage,
        reply: oneshot::Sender<Result<Applied, RtcError>>,
    },
    OnConnectionState(ConnectionCallback),
    OnRemoteMedia(RemoteMediaCallback),
    Close {
        reason: CloseReason,
        reply: oneshot::Sender<()>,
    },
}

/// Caller-facing handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct CoordinatorHandle {
    room: RoomId,
    local: ParticipantId,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("room", &self.room)
            .field("local", &self.local)
            .finish()
    }
}

impl CoordinatorHandle {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    /// Publish an offer now. Returns the outstanding offer if one exists.
    pub async fn initiate(&self) -> Result<SessionDescription, RtcError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Initiate { reply }).await?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Feed a message received outside the room subscription.
    pub async fn on_message(&self, message: SignalMessage) -> Result<Applied, RtcError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Message { message, reply }).await?;
        rx.await.map_err(|_| self.closed_error())?
    }

    pub async fn on_connection_state_change(
        &self,
        callback: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Result<(), RtcError> {
        self.send(Command::OnConnectionState(Box::new(callback))).await
    }

    pub async fn on_remote_media(&self, callback: impl Fn(RemoteTrack) + Send + Sync + 'static) -> Result<(), RtcError> {
        self.send(Command::OnRemoteMedia(Box::new(callback))).await
    }

    /// Close the session. The room subscription is released before this
    /// returns. Safe to call repeatedly.
    pub async fn close(&self) {
        self.close_with(CloseReason::Requested).await;
    }

    async fn close_with(&self, reason: CloseReason) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close { reason, reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.snapshot.borrow().session.is_closed()
    }

    /// Watch snapshots as the session changes.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    async fn send(&self, command: Command) -> Result<(), RtcError> {
        self.commands.send(command).await.map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> RtcError {
        match self.snapshot.borrow().close_reason {
            Some(CloseReason::SubscriptionLost) => RtcError::SubscriptionLost {
                room: self.room.clone(),
            },
            _ => RtcError::Closed,
        }
    }
}

/// Open a session for `local` in `room`.
///
/// Acquires local media, creates the engine connection, subscribes to the
/// room, and spawns the dispatch loop. Pass `remote` when the pairing is
/// already known; otherwise the first foreign sender is bound.
pub async fn open(
    ctx: &SessionContext,
    room: RoomId,
    local: ParticipantId,
    remote: Option<ParticipantId>,
) -> Result<CoordinatorHandle, RtcError> {
    let tracks = ctx.media.local_tracks().await.map_err(|e| {
        warn!(room = %room, peer = %local, error = %e, "Local media unavailable");
        RtcError::from(e)
    })?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let peer = ctx.factory.create(&ctx.config.rtc, &tracks, events_tx).await?;

    let subscription = match ctx.transport.subscribe(&room).await {
        Ok(sub) => sub,
        Err(e) => {
            peer.close().await;
            return Err(e.into());
        }
    };

    let mut negotiator = Negotiator::new(
        room.clone(),
        local.clone(),
        peer,
        ctx.transport.clone(),
        ctx.config.recovery,
    );
    if let Some(remote) = remote {
        negotiator = negotiator.with_remote(remote);
    }

    let (commands, commands_rx) = mpsc::channel(ctx.config.command_buffer.max(1));
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
        session: negotiator.session().clone(),
        status: negotiator.monitor().status(),
        recovery_attempts: 0,
        queued_candidates: 0,
        last_error: None,
        close_reason: None,
    });

    let room_loop = RoomLoop {
        negotiator,
        subscription,
        commands: commands_rx,
        events: events_rx,
        snapshot: snapshot_tx,
        auto_offer: ctx.config.auto_offer,
        connection_callbacks: Vec::new(),
        media_callbacks: Vec::new(),
        last_error: None,
        close_reason: None,
    };
    tokio::spawn(room_loop.run());
    info!(room = %room, peer = %local, "Session opened");

    Ok(CoordinatorHandle {
        room,
        local,
        commands,
        snapshot: snapshot_rx,
    })
}

struct RoomLoop {
    negotiator: Negotiator,
    subscription: Subscription,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<PeerEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    auto_offer: Option<Duration>,
    connection_callbacks: Vec<ConnectionCallback>,
    media_callbacks: Vec<RemoteMediaCallback>,
    last_error: Option<&'static str>,
    close_reason: Option<CloseReason>,
}

impl RoomLoop {
    async fn run(mut self) {
        let auto_offer = sleep(self.auto_offer.unwrap_or_default());
        tokio::pin!(auto_offer);
        let mut auto_offer_armed = self.auto_offer.is_some();

        let recovery = sleep(Duration::ZERO);
        tokio::pin!(recovery);
        let mut recovery_armed = false;

        let mut events_open = true;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        // Every handle is gone.
                        self.shutdown(CloseReason::Requested).await;
                        break;
                    };
                    match cmd {
                        Command::Close { reason, reply } => {
                            self.shutdown(reason).await;
                            let _ = reply.send(());
                            break;
                        }
                        other => self.handle_command(other).await,
                    }
                }

                raw = self.subscription.recv() => {
                    let Some(raw) = raw else {
                        error!(room = %self.room(), "Room subscription lost, closing session");
                        self.shutdown(CloseReason::SubscriptionLost).await;
                        break;
                    };
                    match self.negotiator.on_raw(&raw).await {
                        Ok(applied) => debug!(room = %self.room(), ?applied, "Signal handled"),
                        Err(RtcError::MalformedSignal(e)) => {
                            warn!(room = %self.room(), error = %e, "Malformed signal dropped");
                        }
                        Err(e) => {
                            warn!(room = %self.room(), error = %e, "Signal handling failed");
                            self.last_error = Some(e.code());
                        }
                    }
                }

                event = self.events.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            if let Some(after) = self.handle_event(event).await {
                                recovery.as_mut().reset(Instant::now() + after);
                                recovery_armed = true;
                            }
                        }
                        None => events_open = false,
                    }
                }

                () = &mut auto_offer, if auto_offer_armed => {
                    auto_offer_armed = false;
                    self.auto_offer_fired().await;
                }

                () = &mut recovery, if recovery_armed => {
                    recovery_armed = false;
                    self.recover().await;
                }
            }

            self.publish_snapshot();
        }

        debug!(room = %self.room(), "Room loop stopped");
    }

    fn room(&self) -> &RoomId {
        &self.negotiator.session().room
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Initiate { reply } => {
                let _ = reply.send(self.negotiator.initiate().await);
            }
            Command::Message { message, reply } => {
                let _ = reply.send(self.negotiator.on_message(message).await);
            }
            Command::OnConnectionState(callback) => self.connection_callbacks.push(callback),
            Command::OnRemoteMedia(callback) => self.media_callbacks.push(callback),
            Command::Close { .. } => {}
        }
    }

    /// Returns a delay when a recovery attempt should be scheduled.
    async fn handle_event(&mut self, event: PeerEvent) -> Option<Duration> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.negotiator.send_candidate(candidate).await {
                    warn!(room = %self.room(), error = %e, "Could not send local candidate");
                    self.last_error = Some(e.code());
                }
                None
            }
            PeerEvent::RemoteTrack(track) => {
                info!(room = %self.room(), track = %track.id, kind = %track.kind, "Remote track received");
                for callback in &self.media_callbacks {
                    callback(track.clone());
                }
                None
            }
            PeerEvent::ConnectionState(state) => {
                let transition = self.negotiator.on_connection_state(state)?;
                for callback in &self.connection_callbacks {
                    callback(transition.to);
                }
                match transition.recovery {
                    Recovery::Renegotiate { attempt, after } => {
                        info!(room = %self.room(), attempt, ?after, "Scheduling renegotiation");
                        Some(after)
                    }
                    Recovery::GiveUp => {
                        warn!(room = %self.room(), "Connection not recovered, giving up");
                        None
                    }
                    Recovery::Wait => None,
                }
            }
        }
    }

    async fn auto_offer_fired(&mut self) {
        let session = self.negotiator.session();
        if self.negotiator.offer_received()
            || !session.is_stable()
            || session.local_description.is_some()
        {
            return;
        }
        info!(room = %self.room(), "No offer received, initiating");
        if let Err(e) = self.negotiator.initiate().await {
            warn!(room = %self.room(), error = %e, "Automatic offer failed");
            self.last_error = Some(e.code());
        }
    }

    async fn recover(&mut self) {
        let session = self.negotiator.session();
        if !session.connection_state.is_retryable() || !session.is_stable() {
            return;
        }
        if let Err(e) = self.negotiator.initiate().await {
            warn!(room = %self.room(), error = %e, "Renegotiation failed");
            self.last_error = Some(e.code());
        }
    }

    async fn shutdown(&mut self, reason: CloseReason) {
        self.subscription.cancel();
        if self.negotiator.close().await {
            self.close_reason = Some(reason);
            for callback in &self.connection_callbacks {
                callback(ConnectionState::Closed);
            }
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            session: self.negotiator.session().clone(),
            status: self.negotiator.monitor().status(),
            recovery_attempts: self.negotiator.monitor().attempts(),
            queued_candidates: self.negotiator.queued_candidates(),
            last_error: self.last_error,
            close_reason: self.close_reason,
        });
    }
}

/// One live session per (room, local participant).
#[derive(Clone)]
pub struct CoordinatorRegistry {
    ctx: SessionContext,
    sessions: Arc<Mutex<HashMap<(RoomId, ParticipantId), CoordinatorHandle>>>,
}

impl CoordinatorRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a session, closing any previous one for the same key first.
    ///
    /// The map lock is only held to swap entries, so a slow open in one room
    /// never delays another.
    pub async fn open(
        &self,
        room: RoomId,
        local: ParticipantId,
        remote: Option<ParticipantId>,
    ) -> Result<CoordinatorHandle, RtcError> {
        let key = (room.clone(), local.clone());
        let previous = self.sessions.lock().await.remove(&key);
        if let Some(previous) = previous {
            info!(room = %room, peer = %local, "Replacing existing session");
            previous.close_with(CloseReason::Replaced).await;
        }

        let handle = open(&self.ctx, room, local, remote).await?;
        // A concurrent open for the same key may have finished first.
        let displaced = self.sessions.lock().await.insert(key, handle.clone());
        if let Some(displaced) = displaced {
            displaced.close_with(CloseReason::Replaced).await;
        }
        Ok(handle)
    }

    pub async fn get(&self, room: &RoomId, local: &ParticipantId) -> Option<CoordinatorHandle> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&(room.clone(), local.clone()))
            .filter(|h| !h.is_closed())
            .cloned()
    }

    pub async fn close(&self, room: &RoomId, local: &ParticipantId) {
        let handle = self.sessions.lock().await.remove(&(room.clone(), local.clone()));
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    /// Room teardown: close every local session in `room`.
    pub async fn close_room(&self, room: &RoomId) {
        let handles: Vec<CoordinatorHandle> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<_> = sessions.keys().filter(|(r, _)| r == room).cloned().collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }

    /// Sessions still open.
    pub async fn active(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, h| !h.is_closed());
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, MediaCause};
    use crate::loopback::{LoopbackFactory, LoopbackMedia, Step};
    use crate::peer::{LocalTracks, TrackKind};
    use crate::session::{Politeness, SignalingState};
    use async_trait::async_trait;
    use kindred_common::models::{SdpType, SignalKind};
    use kindred_signal::{Ack, LocalBus, TransportError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const ROOM: &str = "room-1";

    fn context(bus: &LocalBus, factory: &LoopbackFactory, id: &str, auto_offer: Option<Duration>) -> SessionContext {
        SessionContext {
            transport: Arc::new(bus.clone()),
            factory: Arc::new(factory.clone()),
            media: Arc::new(LoopbackMedia::audio_video(id)),
            config: NegotiationConfig {
                auto_offer,
                recovery: RecoveryPolicy {
                    max_attempts: 2,
                    backoff: Duration::from_millis(100),
                },
                ..Default::default()
            },
        }
    }

    async fn open_pair(
        bus: &LocalBus,
        auto_offer: Option<Duration>,
    ) -> (CoordinatorHandle, CoordinatorHandle, LoopbackFactory, LoopbackFactory) {
        let fa = LoopbackFactory::new().without_candidates();
        let fb = LoopbackFactory::new().without_candidates();
        let a = open(&context(bus, &fa, "userA", auto_offer), RoomId::from(ROOM), "userA".into(), None)
            .await
            .unwrap();
        let b = open(&context(bus, &fb, "userB", auto_offer), RoomId::from(ROOM), "userB".into(), None)
            .await
            .unwrap();
        (a, b, fa, fb)
    }

    async fn wait_for(handle: &CoordinatorHandle, pred: impl Fn(&SessionSnapshot) -> bool) {
        let mut rx = handle.watch();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if pred(&rx.borrow_and_update()) {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .expect("session did not reach the expected state");
    }

    /// Everything published until the room stays quiet for 500ms.
    async fn drain(spy: &mut Subscription) -> Vec<SignalMessage> {
        let mut seen = Vec::new();
        while let Ok(Some(raw)) = tokio::time::timeout(Duration::from_millis(500), spy.recv()).await {
            seen.push(SignalMessage::from_json(&raw).unwrap());
        }
        seen
    }

    fn converged(a: &SessionSnapshot, b: &SessionSnapshot) -> bool {
        a.session.is_stable()
            && b.session.is_stable()
            && a.session.local_description.is_some()
            && a.session.local_description == b.session.remote_description
            && a.session.remote_description == b.session.local_description
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_offer_answer_without_chatter() {
        let bus = LocalBus::new();
        let mut spy = bus.subscribe(&RoomId::from(ROOM)).await.unwrap();
        let (a, b, _fa, _fb) = open_pair(&bus, None).await;

        a.initiate().await.unwrap();
        wait_for(&a, |s| s.session.is_stable() && s.session.remote_description.is_some()).await;

        let sent = drain(&mut spy).await;
        let kinds: Vec<_> = sent.iter().map(|m| (m.kind, m.sender.as_str())).collect();
        assert_eq!(kinds, vec![(SignalKind::Offer, "userA"), (SignalKind::Answer, "userB")]);
        assert!(converged(&a.snapshot(), &b.snapshot()));
        assert_eq!(b.snapshot().session.politeness, Some(Politeness::Polite));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_offer_fires_once_after_timeout() {
        let bus = LocalBus::new();
        let mut spy = bus.subscribe(&RoomId::from(ROOM)).await.unwrap();
        let factory = LoopbackFactory::new().without_candidates();
        let ctx = context(&bus, &factory, "userA", Some(Duration::from_millis(1000)));
        let start = Instant::now();
        let a = open(&ctx, RoomId::from(ROOM), "userA".into(), None).await.unwrap();

        let first = SignalMessage::from_json(&spy.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind, SignalKind::Offer);
        assert!(start.elapsed() >= Duration::from_millis(1000));

        assert!(drain(&mut spy).await.is_empty());
        assert_eq!(a.snapshot().session.signaling_state, SignalingState::HaveLocalOffer);
    }

    #[tokio::test(start_paused = true)]
    async fn received_offer_suppresses_auto_offer() {
        let bus = LocalBus::new();
        let mut spy = bus.subscribe(&RoomId::from(ROOM)).await.unwrap();
        let fa = LoopbackFactory::new().without_candidates();
        let fb = LoopbackFactory::new().without_candidates();
        let a = open(&context(&bus, &fa, "userA", Some(Duration::from_millis(1000))), RoomId::from(ROOM), "userA".into(), None)
            .await
            .unwrap();
        let b = open(&context(&bus, &fb, "userB", None), RoomId::from(ROOM), "userB".into(), None)
            .await
            .unwrap();

        b.initiate().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let sent = drain(&mut spy).await;
        let kinds: Vec<_> = sent.iter().map(|m| (m.kind, m.sender.as_str())).collect();
        assert_eq!(kinds, vec![(SignalKind::Offer, "userB"), (SignalKind::Answer, "userA")]);
        assert!(converged(&b.snapshot(), &a.snapshot()));
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_auto_offers_converge() {
        let bus = LocalBus::new();
        let (a, b, _fa, _fb) = open_pair(&bus, Some(Duration::from_millis(1000))).await;

        wait_for(&a, |s| s.session.is_stable() && s.session.remote_description.is_some()).await;
        wait_for(&b, |s| s.session.is_stable() && s.session.remote_description.is_some()).await;
        let (sa, sb) = (a.snapshot(), b.snapshot());
        assert!(converged(&sa, &sb));

        // userA is impolite, so its offer is the one that survives.
        let a_local = sa.session.local_description.as_ref().unwrap();
        let b_local = sb.session.local_description.as_ref().unwrap();
        assert_eq!(a_local.sdp_type, SdpType::Offer);
        assert_eq!(b_local.sdp_type, SdpType::Answer);
        assert_eq!(sb.session.remote_description.as_ref(), Some(a_local));
        assert!(sa.last_error.is_none() && sb.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_see_connectivity_and_remote_media() {
        let bus = LocalBus::new();
        let (a, b, _fa, _fb) = open_pair(&bus, None).await;

        let states = Arc::new(StdMutex::new(Vec::new()));
        let tracks = Arc::new(StdMutex::new(Vec::new()));
        let s = states.clone();
        a.on_connection_state_change(move |state| s.lock().unwrap().push(state))
            .await
            .unwrap();
        let t = tracks.clone();
        a.on_remote_media(move |track| t.lock().unwrap().push(track.kind))
            .await
            .unwrap();

        a.initiate().await.unwrap();
        wait_for(&a, |s| s.session.connection_state == ConnectionState::Connected).await;

        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(*tracks.lock().unwrap(), vec![TrackKind::Audio, TrackKind::Video]);

        b.close().await;
        a.close().await;
        assert_eq!(states.lock().unwrap().last(), Some(&ConnectionState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn trickled_candidates_reach_the_peer() {
        let bus = LocalBus::new();
        let fa = LoopbackFactory::new();
        let fb = LoopbackFactory::new();
        let a = open(&context(&bus, &fa, "userA", None), RoomId::from(ROOM), "userA".into(), None)
            .await
            .unwrap();
        let b = open(&context(&bus, &fb, "userB", None), RoomId::from(ROOM), "userB".into(), None)
            .await
            .unwrap();

        a.initiate().await.unwrap();
        wait_for(&a, |s| s.session.connection_state == ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fa.applied_candidates().len(), 1);
        assert_eq!(fb.applied_candidates().len(), 1);
        assert_eq!(a.snapshot().queued_candidates, 0);
        assert_eq!(b.snapshot().queued_candidates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_impolite_side_renegotiates_after_disconnect() {
        let bus = LocalBus::new();
        let (a, b, fa, fb) = open_pair(&bus, None).await;
        a.initiate().await.unwrap();
        wait_for(&a, |s| s.session.connection_state == ConnectionState::Connected).await;
        wait_for(&b, |s| s.session.connection_state == ConnectionState::Connected).await;

        let mut spy = bus.subscribe(&RoomId::from(ROOM)).await.unwrap();
        fa.set_connection_state(ConnectionState::Disconnected);
        fb.set_connection_state(ConnectionState::Disconnected);
        wait_for(&a, |s| s.status == ConnectionStatus::Interrupted && s.recovery_attempts == 1).await;
        wait_for(&b, |s| s.status == ConnectionStatus::Interrupted).await;
        assert_eq!(b.snapshot().recovery_attempts, 0);

        wait_for(&a, |s| s.session.connection_state == ConnectionState::Connected).await;
        assert_eq!(a.snapshot().recovery_attempts, 0);
        let sent = drain(&mut spy).await;
        let kinds: Vec<_> = sent.iter().map(|m| (m.kind, m.sender.as_str())).collect();
        assert_eq!(kinds, vec![(SignalKind::Offer, "userA"), (SignalKind::Answer, "userB")]);
        assert_eq!(b.snapshot().session.connection_state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_recovery_is_reported_in_snapshot() {
        let bus = LocalBus::new();
        let (a, b, fa, fb) = open_pair(&bus, None).await;
        a.initiate().await.unwrap();
        wait_for(&a, |s| s.session.connection_state == ConnectionState::Connected).await;
        wait_for(&b, |s| s.session.connection_state == ConnectionState::Connected).await;

        fa.fail_next(Step::CreateOffer);
        fa.set_connection_state(ConnectionState::Disconnected);
        fb.set_connection_state(ConnectionState::Disconnected);
        wait_for(&a, |s| s.last_error == Some("NEGOTIATION_ERROR")).await;

        let snap = a.snapshot();
        assert!(snap.session.is_stable());
        assert_eq!(snap.recovery_attempts, 1);
        assert!(b.snapshot().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_auto_offer_is_reported_in_snapshot() {
        let bus = LocalBus::new();
        let factory = LoopbackFactory::new().without_candidates();
        factory.fail_next(Step::CreateOffer);
        let ctx = context(&bus, &factory, "userA", Some(Duration::from_millis(1000)));
        let a = open(&ctx, RoomId::from(ROOM), "userA".into(), None).await.unwrap();
        assert!(a.snapshot().last_error.is_none());

        wait_for(&a, |s| s.last_error == Some("NEGOTIATION_ERROR")).await;
        let snap = a.snapshot();
        assert!(snap.session.is_stable());
        assert!(snap.session.local_description.is_none());
        assert!(!snap.session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_answer_to_inbound_offer_is_reported_in_snapshot() {
        let bus = LocalBus::new();
        let (a, b, _fa, fb) = open_pair(&bus, None).await;

        fb.fail_next(Step::CreateAnswer);
        a.initiate().await.unwrap();
        wait_for(&b, |s| s.last_error == Some("NEGOTIATION_ERROR")).await;

        let snap = b.snapshot();
        assert!(snap.session.is_stable());
        assert!(snap.session.remote_description.is_none());
        assert!(a.snapshot().last_error.is_none());
        assert_eq!(a.snapshot().session.signaling_state, SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn close_twice_is_silent_and_releases_subscription() {
        let bus = LocalBus::new();
        let factory = LoopbackFactory::new();
        let room = RoomId::from(ROOM);
        let a = open(&context(&bus, &factory, "userA", None), room.clone(), "userA".into(), None)
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count(&room).await, 1);

        a.close().await;
        a.close().await;
        assert!(a.is_closed());
        assert_eq!(a.snapshot().close_reason, Some(CloseReason::Requested));
        assert_eq!(factory.closed_peers(), 1);
        assert!(matches!(a.initiate().await, Err(RtcError::Closed)));

        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(bus.subscriber_count(&room).await, 0);
    }

    #[tokio::test]
    async fn media_failure_is_fatal_with_cause() {
        let bus = LocalBus::new();
        let mut ctx = context(&bus, &LoopbackFactory::new(), "userA", None);
        ctx.media = Arc::new(LoopbackMedia::unavailable(MediaCause::DeviceNotFound));

        let err = open(&ctx, RoomId::from(ROOM), "userA".into(), None).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, RtcError::MediaUnavailable { cause: MediaCause::DeviceNotFound }));
    }

    /// Transport whose subscriptions can be severed from the test.
    #[derive(Default)]
    struct SeverableBus {
        feeds: StdMutex<Vec<mpsc::Sender<String>>>,
    }

    #[async_trait]
    impl SignalTransport for SeverableBus {
        async fn publish_raw(&self, _room: &RoomId, _raw: String) -> Result<Ack, TransportError> {
            Ok(Ack { receivers: 0 })
        }

        async fn subscribe(&self, room: &RoomId) -> Result<Subscription, TransportError> {
            let (tx, rx) = mpsc::channel(8);
            self.feeds.lock().unwrap().push(tx);
            Ok(Subscription::new(room.clone(), rx))
        }
    }

    #[tokio::test]
    async fn subscription_loss_closes_the_session() {
        let bus = Arc::new(SeverableBus::default());
        let ctx = SessionContext {
            transport: bus.clone(),
            factory: Arc::new(LoopbackFactory::new()),
            media: Arc::new(LoopbackMedia::audio_video("userA")),
            config: NegotiationConfig {
                auto_offer: None,
                ..Default::default()
            },
        };
        let a = open(&ctx, RoomId::from(ROOM), "userA".into(), None).await.unwrap();

        bus.feeds.lock().unwrap().clear();
        wait_for(&a, |s| s.session.is_closed()).await;

        assert_eq!(a.snapshot().close_reason, Some(CloseReason::SubscriptionLost));
        assert!(matches!(a.initiate().await, Err(RtcError::SubscriptionLost { .. })));
    }

    #[tokio::test]
    async fn registry_keeps_one_session_per_participant() {
        let bus = LocalBus::new();
        let factory = LoopbackFactory::new();
        let registry = CoordinatorRegistry::new(context(&bus, &factory, "userA", None));
        let room = RoomId::from(ROOM);
        let me = ParticipantId::from("userA");

        let first = registry.open(room.clone(), me.clone(), None).await.unwrap();
        let second = registry.open(room.clone(), me.clone(), None).await.unwrap();
        assert!(first.is_closed());
        assert_eq!(first.snapshot().close_reason, Some(CloseReason::Replaced));
        assert!(!second.is_closed());
        assert_eq!(registry.active().await, 1);

        let other = registry
            .open(RoomId::from("room-2"), me.clone(), Some("userC".into()))
            .await
            .unwrap();
        assert_eq!(other.snapshot().session.politeness, Some(Politeness::Impolite));
        assert_eq!(registry.active().await, 2);

        registry.close_room(&room).await;
        assert!(second.is_closed());
        assert!(registry.get(&room, &me).await.is_none());
        assert!(registry.get(&RoomId::from("room-2"), &me).await.is_some());
        assert_eq!(registry.active().await, 1);
    }

    /// Media source whose first acquisition blocks until released.
    struct GatedMedia {
        inner: LoopbackMedia,
        gate: tokio::sync::Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MediaSource for GatedMedia {
        async fn local_tracks(&self) -> Result<LocalTracks, EngineError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.gate.notified().await;
            }
            self.inner.local_tracks().await
        }
    }

    #[tokio::test]
    async fn slow_open_does_not_block_other_rooms() {
        let bus = LocalBus::new();
        let media = Arc::new(GatedMedia {
            inner: LoopbackMedia::audio_video("userA"),
            gate: tokio::sync::Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let mut ctx = context(&bus, &LoopbackFactory::new(), "userA", None);
        ctx.media = media.clone();
        let registry = CoordinatorRegistry::new(ctx);
        let me = ParticipantId::from("userA");

        let slow = {
            let registry = registry.clone();
            let me = me.clone();
            tokio::spawn(async move { registry.open(RoomId::from(ROOM), me, None).await })
        };
        while media.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let other = tokio::time::timeout(
            Duration::from_secs(5),
            registry.open(RoomId::from("room-2"), me.clone(), None),
        )
        .await
        .expect("open in another room was blocked")
        .unwrap();
        assert!(!other.is_closed());
        assert_eq!(registry.active().await, 1);

        media.gate.notify_one();
        let first = slow.await.unwrap().unwrap();
        assert!(!first.is_closed());
        assert_eq!(registry.active().await, 2);
    }
}
