//! Connection State Machine
//!
//! `SessionController` owns the room connection, the local capture, and the
//! event subscription of one session at a time:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnecting -> Idle
//!            |              |
//!            +--> Error <---+        (Error -> Connecting on caller retry)
//! ```
//!
//! Inbound room events are drained by a single pump task. Each event is handled
//! to completion under the controller lock, so handlers never interleave. Work
//! that waits on the outside world (starting playback, closing the room) runs
//! without the lock, and connect attempts and room closes run as their own
//! tasks so they settle even if the caller stops waiting.

use crate::{
    error::SessionError,
    media::{LocalCapture, MediaPipeline, RemoteTrackRegistry},
    state::{ConnectionStatus, SessionSnapshot},
    token::{Credential, TokenClient},
};
use chrono::Utc;
use futures::StreamExt;
use secrecy::ExposeSecret;
use std::{collections::HashSet, sync::Arc};
use tokio::{
    sync::{Mutex, MutexGuard, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, instrument, warn};
use voice_agent_core::{
    payload::ChannelPayload,
    reconciler::MessageReconciler,
    transport::{RemoteTrack, Room, RoomConnector, RoomEvent, RoomEventStream, TransportError},
};

const REMOTE_DISCONNECT_NOTICE: &str = "Voice session ended by the remote side.";
const UNDELIVERED_NOTICE: &str = "Your last message could not be delivered.";

/// Resources held by a connected session. Dropped as a unit on teardown.
struct ActiveSession {
    room_name: String,
    room: Arc<dyn Room>,
    capture: LocalCapture,
    tracks: RemoteTrackRegistry,
    events: Option<JoinHandle<()>>,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    status: ConnectionStatus,
    error: Option<String>,
    reconciler: MessageReconciler,
    session: Option<ActiveSession>,
    /// Set by `disconnect()` while a connect attempt is in flight.
    cancel_requested: bool,
    reconnecting: bool,
    participants: HashSet<String>,
    generation: u64,
}

impl Inner {
    fn owns(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    fn snapshot(&self) -> SessionSnapshot {
        let activity = self.reconciler.activity();
        SessionSnapshot {
            status: self.status,
            error: self.error.clone(),
            messages: self.reconciler.messages().to_vec(),
            agent_speaking: activity.agent_speaking,
            user_speaking: activity.user_speaking,
            reconnecting: self.reconnecting,
            remote_participants: self.participants.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Local,
    Remote,
}

/// State shared between the controller, its connect attempts, and its event pump.
struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionSnapshot>,
    media: MediaPipeline,
}

impl Shared {
    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.snapshot());
    }

    /// Settles a failed attempt: `Idle` if a disconnect was requested meanwhile,
    /// `Error` otherwise.
    fn fail(&self, inner: &mut Inner, e: SessionError) -> SessionError {
        if inner.cancel_requested {
            info!(error = %e, "Connect failed after disconnect was requested");
            inner.status = ConnectionStatus::Idle;
            inner.cancel_requested = false;
        } else {
            error!(error = %e, "Connect failed");
            inner.status = ConnectionStatus::Error;
            inner.error = Some(e.to_string());
        }
        self.publish(inner);
        e
    }

    /// Releases every resource of the active session and settles in `Idle`.
    ///
    /// Local resources are released under the lock, the capture device before
    /// the room. The room itself is closed on a separate task once the lock is
    /// gone; the state stays `Disconnecting` until that finishes.
    async fn teardown(self: &Arc<Self>, mut inner: MutexGuard<'_, Inner>, cause: Teardown) {
        inner.status = ConnectionStatus::Disconnecting;
        let room = inner.session.take().map(|mut session| {
            if let Some(handle) = session.events.take() {
                // A remote teardown runs on the pump itself; dropping the handle detaches it.
                if cause == Teardown::Local {
                    handle.abort();
                }
            }
            session.capture.stop();
            let detached = session.tracks.clear();
            info!(room = %session.room_name, ?cause, detached, "Releasing session");
            session.room
        });

        inner.reconciler.close_streams();
        inner.participants.clear();
        inner.reconnecting = false;
        if cause == Teardown::Remote {
            inner
                .reconciler
                .push_system(REMOTE_DISCONNECT_NOTICE, Utc::now());
        }
        self.publish(&inner);
        drop(inner);

        let shared = Arc::clone(self);
        let close = tokio::spawn(
            async move {
                if let Some(room) = room {
                    room.disconnect().await;
                }
                let mut inner = shared.inner.lock().await;
                inner.status = ConnectionStatus::Idle;
                shared.publish(&inner);
                debug!("Session closed");
            }
            .in_current_span(),
        );
        if let Err(e) = close.await {
            error!(error = %e, "Room close task failed");
        }
    }

    /// Starts playback for a subscribed track. The lock is not held while the
    /// output starts, so a stalled sink never blocks the controller.
    async fn attach_track(&self, generation: u64, participant: &str, track: &RemoteTrack) {
        {
            let inner = self.inner.lock().await;
            match inner.session.as_ref() {
                Some(session) if session.generation == generation => {
                    if !self.media.wants_remote(&session.tracks, participant, track) {
                        return;
                    }
                }
                _ => return,
            }
        }

        let Some(mut playback) = self.media.start_playback(participant, track).await else {
            return;
        };

        let mut inner = self.inner.lock().await;
        match inner.session.as_mut() {
            Some(session) if session.generation == generation => {
                self.media
                    .register_remote(&mut session.tracks, participant, track, playback);
            }
            _ => {
                debug!(%participant, track = %track.sid, "Session ended while playback was starting");
                playback.detach();
            }
        }
    }

    fn handle_event(&self, inner: &mut Inner, event: RoomEvent) {
        let changed = match event {
            RoomEvent::TrackUnsubscribed {
                participant,
                track_sid,
            } => {
                if let Some(session) = inner.session.as_mut() {
                    self.media
                        .detach_remote(&mut session.tracks, &participant, &track_sid);
                }
                false
            }
            RoomEvent::ParticipantConnected { identity } => {
                info!(%identity, "Participant joined");
                inner.participants.insert(identity)
            }
            RoomEvent::ParticipantDisconnected { identity } => {
                info!(%identity, "Participant left");
                if let Some(session) = inner.session.as_mut() {
                    session.tracks.remove_participant(&identity);
                }
                inner.participants.remove(&identity)
            }
            RoomEvent::ChatMessage {
                id,
                sender,
                text,
                timestamp,
            } => {
                debug!(sender = ?sender, server_time = ?timestamp, "Chat message received");
                inner
                    .reconciler
                    .ingest_chat(id, sender.as_deref(), &text, Utc::now())
                    .changed()
            }
            RoomEvent::TranscriptionReceived {
                participant,
                segments,
            } => inner
                .reconciler
                .ingest_transcription(participant.as_deref(), &segments, Utc::now())
                .changed(),
            RoomEvent::DataReceived {
                participant,
                payload,
            } => match inner
                .reconciler
                .ingest_data(participant.as_deref(), &payload, Utc::now())
            {
                Ok(outcome) => outcome.changed(),
                Err(e) => {
                    warn!(error = %e, participant = ?participant, "Dropping malformed data payload");
                    false
                }
            },
            RoomEvent::Reconnecting => {
                warn!("Room connection interrupted; transport is reconnecting");
                inner.reconnecting = true;
                true
            }
            RoomEvent::Reconnected => {
                info!("Room connection restored");
                inner.reconnecting = false;
                true
            }
            // Handled by the pump, which must give up the lock for them.
            RoomEvent::TrackSubscribed { .. } | RoomEvent::Disconnected { .. } => false,
        };

        if changed {
            self.publish(inner);
        }
    }
}

/// Drains a session's event stream until the session ends.
async fn run_event_pump(shared: Arc<Shared>, mut events: RoomEventStream, generation: u64) {
    while let Some(event) = events.next().await {
        let mut inner = shared.inner.lock().await;
        if !inner.owns(generation) {
            debug!("Event pump outlived its session; exiting");
            return;
        }
        match event {
            RoomEvent::Disconnected { reason } => {
                info!(reason = ?reason, "Room disconnected remotely");
                shared.teardown(inner, Teardown::Remote).await;
                return;
            }
            RoomEvent::TrackSubscribed { participant, track } => {
                drop(inner);
                shared.attach_track(generation, &participant, &track).await;
            }
            event => shared.handle_event(&mut inner, event),
        }
    }

    let inner = shared.inner.lock().await;
    if inner.owns(generation) {
        warn!("Room event stream ended without a disconnect event");
        shared.teardown(inner, Teardown::Remote).await;
    }
}

/// What a successful connect sequence hands back before the session is committed.
struct Opened {
    credential: Credential,
    room: Box<dyn Room>,
    capture: LocalCapture,
}

/// One connect attempt. Runs on its own task so it always settles, releasing
/// whatever it acquired, even when the caller of `connect` gives up waiting.
struct Attempt {
    shared: Arc<Shared>,
    tokens: Arc<dyn TokenClient>,
    connector: Arc<dyn RoomConnector>,
    generation: u64,
}

impl Attempt {
    async fn run(self, agent_id: Option<String>) -> Result<ConnectionStatus, SessionError> {
        let attempt = self.open(agent_id).await;

        let mut inner = self.shared.inner.lock().await;
        let opened = match attempt {
            Ok(Opened {
                room, mut capture, ..
            }) if inner.cancel_requested => {
                info!("Disconnect requested during connect; releasing session");
                drop(inner);
                capture.stop();
                room.disconnect().await;
                let mut inner = self.shared.inner.lock().await;
                inner.status = ConnectionStatus::Idle;
                inner.cancel_requested = false;
                self.shared.publish(&inner);
                return Err(SessionError::Cancelled);
            }
            Ok(opened) => opened,
            Err(e) => return Err(self.shared.fail(&mut inner, e)),
        };

        let room: Arc<dyn Room> = Arc::from(opened.room);
        let mut capture = opened.capture;
        let events = match room.events() {
            Ok(events) => events,
            Err(e) => {
                drop(inner);
                capture.stop();
                room.disconnect().await;
                let mut inner = self.shared.inner.lock().await;
                return Err(self.shared.fail(&mut inner, e.into()));
            }
        };

        inner.reconciler.set_local_identity(room.local_identity());
        let room_name = opened.credential.room_name;
        let generation = self.generation;
        let pump = tokio::spawn(
            run_event_pump(Arc::clone(&self.shared), events, generation)
                .instrument(tracing::info_span!("room_events", room = %room_name, generation)),
        );
        inner.session = Some(ActiveSession {
            room_name: room_name.clone(),
            room,
            capture,
            tracks: RemoteTrackRegistry::default(),
            events: Some(pump),
            generation,
        });
        inner.status = ConnectionStatus::Connected;
        self.shared.publish(&inner);
        info!(room = %room_name, "Voice session connected");
        Ok(ConnectionStatus::Connected)
    }

    /// Credential, room, microphone, publish. Anything acquired before a
    /// failing step is released before returning.
    async fn open(&self, agent_id: Option<String>) -> Result<Opened, SessionError> {
        let credential = self.tokens.fetch_credential(agent_id).await?;
        let room = self
            .connector
            .connect(&credential.room_url, credential.token.expose_secret())
            .await?;

        let mut capture = match self.shared.media.acquire().await {
            Ok(capture) => capture,
            Err(e) => {
                room.disconnect().await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.shared.media.publish(room.as_ref(), &capture).await {
            capture.stop();
            room.disconnect().await;
            return Err(e.into());
        }

        Ok(Opened {
            credential,
            room,
            capture,
        })
    }
}

/// Owns the connection lifecycle of one voice session at a time.
pub struct SessionController {
    shared: Arc<Shared>,
    tokens: Arc<dyn TokenClient>,
    connector: Arc<dyn RoomConnector>,
}

impl SessionController {
    pub fn new(
        tokens: Arc<dyn TokenClient>,
        connector: Arc<dyn RoomConnector>,
        media: MediaPipeline,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(SessionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                state_tx,
                media,
            }),
            tokens,
            connector,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.state_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.state_tx.borrow().status
    }

    /// Opens a session. Returns the current status unchanged if one is already
    /// connecting or connected. Calling from `Error` clears the error and retries.
    ///
    /// Dropping the returned future does not abandon the attempt: it keeps
    /// running and settles the state on its own.
    #[instrument(name = "connect", skip_all, fields(agent_id = agent_id.as_deref().unwrap_or("default")))]
    pub async fn connect(&self, agent_id: Option<String>) -> Result<ConnectionStatus, SessionError> {
        let generation = {
            let mut inner = self.shared.inner.lock().await;
            match inner.status {
                ConnectionStatus::Connecting
                | ConnectionStatus::Connected
                | ConnectionStatus::Disconnecting => {
                    debug!(status = ?inner.status, "Session already active; connect ignored");
                    return Ok(inner.status);
                }
                ConnectionStatus::Error => info!("Resetting from error state"),
                ConnectionStatus::Idle => {}
            }
            inner.generation += 1;
            inner.status = ConnectionStatus::Connecting;
            inner.error = None;
            inner.cancel_requested = false;
            inner.reconnecting = false;
            inner.participants.clear();
            inner.reconciler.reset();
            self.shared.publish(&inner);
            inner.generation
        };

        let attempt = Attempt {
            shared: Arc::clone(&self.shared),
            tokens: Arc::clone(&self.tokens),
            connector: Arc::clone(&self.connector),
            generation,
        };
        match tokio::spawn(attempt.run(agent_id).in_current_span()).await {
            Ok(result) => result,
            Err(e) => {
                let mut inner = self.shared.inner.lock().await;
                let err = SessionError::Aborted(e.to_string());
                if inner.status == ConnectionStatus::Connecting && inner.generation == generation {
                    return Err(self.shared.fail(&mut inner, err));
                }
                Err(err)
            }
        }
    }

    /// Ends the session. Safe in every state: a no-op when idle, a reset from
    /// `Error`, and a deferred cancel while a connect is in flight.
    #[instrument(name = "disconnect", skip_all)]
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        let status = inner.status;
        match status {
            ConnectionStatus::Idle | ConnectionStatus::Disconnecting => {}
            ConnectionStatus::Error => {
                inner.status = ConnectionStatus::Idle;
                inner.error = None;
                self.shared.publish(&inner);
            }
            ConnectionStatus::Connecting => {
                info!("Disconnect requested while connecting; will release once settled");
                inner.cancel_requested = true;
            }
            ConnectionStatus::Connected => {
                self.shared.teardown(inner, Teardown::Local).await;
            }
        }
    }

    /// Sends a line of text, appending it to the log optimistically.
    ///
    /// Uses the room's native chat and falls back to the data channel when the
    /// native send fails.
    pub async fn send_text(&self, body: &str) -> Result<(), SessionError> {
        let text = body.trim();
        let room = {
            let mut inner = self.shared.inner.lock().await;
            let room = match (inner.status, inner.session.as_ref()) {
                (ConnectionStatus::Connected, Some(session)) => Arc::clone(&session.room),
                _ => return Err(SessionError::NotConnected),
            };
            if text.is_empty() {
                return Ok(());
            }
            if inner.reconciler.push_local(text, Utc::now()).changed() {
                self.shared.publish(&inner);
            }
            room
        };

        let native = match room.send_text(text).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(error = %native, "Native chat send failed; falling back to data channel");

        let fallback = match ChannelPayload::user_chat(text).encode() {
            Ok(bytes) => room.publish_data(bytes).await,
            Err(e) => Err(TransportError::Send(e.to_string())),
        };
        if let Err(e) = fallback {
            error!(error = %e, "Failed to deliver text message");
            let mut inner = self.shared.inner.lock().await;
            inner.reconciler.push_system(UNDELIVERED_NOTICE, Utc::now());
            self.shared.publish(&inner);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let Ok(mut inner) = self.shared.inner.try_lock() else {
            warn!("Controller dropped while busy; session resources released by their owners");
            return;
        };
        if inner.status == ConnectionStatus::Connecting {
            // The in-flight attempt releases what it acquired when it settles.
            inner.cancel_requested = true;
        }
        let Some(mut session) = inner.session.take() else {
            return;
        };
        if let Some(handle) = session.events.take() {
            handle.abort();
        }
        session.capture.stop();
        session.tracks.clear();
        let room = session.room;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { room.disconnect().await });
            }
            Err(_) => warn!("No runtime available to close the room on drop"),
        }
        inner.status = ConnectionStatus::Idle;
    }
}
