//! In-memory stand-ins for the room transport, microphone, and speaker.

use crate::{
    media::{AudioSink, CaptureConstraints, CaptureDevice, CaptureStream, MediaAcquisitionError, Playback},
    state::{ConnectionStatus, SessionSnapshot},
    token::Credential,
};
use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Notify, mpsc, watch};
use voice_agent_core::transport::{
    LocalAudioTrack, RemoteTrack, Room, RoomConnector, RoomEvent, RoomEventStream,
    TransportError,
};

const WAIT: Duration = Duration::from_secs(2);

type OrderLog = Arc<Mutex<Vec<&'static str>>>;

pub fn credential() -> Credential {
    Credential {
        room_url: "wss://rtc.example.com".to_string(),
        token: SecretString::from("test-token".to_string()),
        room_name: "voice_chat".to_string(),
    }
}

/// Waits until the snapshot reports `status`, failing the test after a short timeout.
pub async fn wait_for_status(
    rx: &watch::Receiver<SessionSnapshot>,
    status: ConnectionStatus,
) -> SessionSnapshot {
    let mut rx = rx.clone();
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.status == status))
        .await
        .expect("timed out waiting for status")
        .expect("controller dropped")
        .clone()
}

/// Polls `check` until it holds, failing the test after a short timeout.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

/// Pushes a reconnect round-trip through the room and waits for it, so every
/// event emitted earlier has been handled.
pub async fn flush(room: &RoomProbe, rx: &watch::Receiver<SessionSnapshot>) -> SessionSnapshot {
    let mut rx = rx.clone();
    room.emit(RoomEvent::Reconnecting);
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.reconnecting))
        .await
        .expect("timed out flushing events")
        .expect("controller dropped");
    room.emit(RoomEvent::Reconnected);
    tokio::time::timeout(WAIT, rx.wait_for(|s| !s.reconnecting))
        .await
        .expect("timed out flushing events")
        .expect("controller dropped")
        .clone()
}

/// Observable state of the fake room, shared between the test and every
/// `FakeRoom` the connector hands out.
pub struct RoomProbe {
    identity: String,
    events_tx: Mutex<Option<mpsc::UnboundedSender<RoomEvent>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RoomEvent>>>,
    events_taken: AtomicUsize,
    disconnects: AtomicUsize,
    published: Mutex<Vec<LocalAudioTrack>>,
    sent_text: Mutex<Vec<String>>,
    sent_data: Mutex<Vec<Bytes>>,
    fail_publish: AtomicBool,
    fail_native_send: AtomicBool,
    fail_data_send: AtomicBool,
    order: OrderLog,
}

impl RoomProbe {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            identity: "user_alice".to_string(),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            events_taken: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
            sent_text: Mutex::new(Vec::new()),
            sent_data: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            fail_native_send: AtomicBool::new(false),
            fail_data_send: AtomicBool::new(false),
            order: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn identity(&self) -> String {
        self.identity.clone()
    }

    pub fn emit(&self, event: RoomEvent) {
        if let Some(tx) = self.events_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Ends the event stream without a disconnect event.
    pub fn close_events(&self) {
        self.events_tx.lock().unwrap().take();
    }

    /// Gives the room a fresh event channel for the next session.
    pub fn rearm(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().unwrap() = Some(tx);
        *self.events_rx.lock().unwrap() = Some(rx);
    }

    pub fn events_taken(&self) -> usize {
        self.events_taken.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<LocalAudioTrack> {
        self.published.lock().unwrap().clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent_text.lock().unwrap().clone()
    }

    pub fn sent_data(&self) -> Vec<Bytes> {
        self.sent_data.lock().unwrap().clone()
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_native_send(&self, fail: bool) {
        self.fail_native_send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_data_send(&self, fail: bool) {
        self.fail_data_send.store(fail, Ordering::SeqCst);
    }

    pub fn teardown_order(&self) -> Vec<&'static str> {
        self.order.lock().unwrap().clone()
    }

    pub fn order_log(&self) -> OrderLog {
        Arc::clone(&self.order)
    }
}

struct FakeRoom(Arc<RoomProbe>);

#[async_trait]
impl Room for FakeRoom {
    fn local_identity(&self) -> String {
        self.0.identity.clone()
    }

    async fn publish_track(&self, track: LocalAudioTrack) -> Result<(), TransportError> {
        if self.0.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("track rejected".to_string()));
        }
        self.0.published.lock().unwrap().push(track);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if self.0.fail_native_send.load(Ordering::SeqCst) {
            return Err(TransportError::Send("chat unsupported".to_string()));
        }
        self.0.sent_text.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn publish_data(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.0.fail_data_send.load(Ordering::SeqCst) {
            return Err(TransportError::Send("data channel closed".to_string()));
        }
        self.0.sent_data.lock().unwrap().push(payload);
        Ok(())
    }

    fn events(&self) -> Result<RoomEventStream, TransportError> {
        let rx = self
            .0
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(TransportError::EventsTaken)?;
        self.0.events_taken.fetch_add(1, Ordering::SeqCst);
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }

    async fn disconnect(&self) {
        self.0.disconnects.fetch_add(1, Ordering::SeqCst);
        self.0.order.lock().unwrap().push("room_disconnected");
    }
}

pub struct FakeConnector {
    pub room: Arc<RoomProbe>,
    connects: AtomicUsize,
    last_url: Mutex<Option<String>>,
    failure: Mutex<Option<TransportError>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            room: Arc::new(RoomProbe::new()),
            connects: AtomicUsize::new(0),
            last_url: Mutex::new(None),
            failure: Mutex::new(None),
            gate: Mutex::new(None),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        self.last_url.lock().unwrap().clone()
    }

    pub fn fail_with(&self, error: TransportError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Makes `connect` wait until the returned gate is notified.
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Lets a held `connect` through and stops holding later ones.
    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl RoomConnector for FakeConnector {
    async fn connect(&self, url: &str, _token: &str) -> Result<Box<dyn Room>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock().unwrap() = Some(url.to_string());
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let failure = self.failure.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(Box::new(FakeRoom(Arc::clone(&self.room))))
    }
}

struct FakeStream {
    track: LocalAudioTrack,
    stops: Arc<AtomicUsize>,
    order: Option<OrderLog>,
}

impl CaptureStream for FakeStream {
    fn track(&self) -> LocalAudioTrack {
        self.track.clone()
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(order) = &self.order {
            order.lock().unwrap().push("capture_stopped");
        }
    }
}

pub struct FakeMicrophone {
    acquisitions: AtomicUsize,
    stops: Arc<AtomicUsize>,
    last_constraints: Mutex<Option<CaptureConstraints>>,
    order: Option<OrderLog>,
}

impl FakeMicrophone {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// A microphone that records its stops in the room's teardown log.
    pub fn logging_to(order: OrderLog) -> Arc<Self> {
        Self::build(Some(order))
    }

    fn build(order: Option<OrderLog>) -> Arc<Self> {
        Arc::new(Self {
            acquisitions: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            last_constraints: Mutex::new(None),
            order,
        })
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        *self.last_constraints.lock().unwrap()
    }
}

#[async_trait]
impl CaptureDevice for FakeMicrophone {
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, MediaAcquisitionError> {
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        *self.last_constraints.lock().unwrap() = Some(constraints);
        Ok(Box::new(FakeStream {
            track: LocalAudioTrack {
                id: format!("mic-{n}"),
            },
            stops: Arc::clone(&self.stops),
            order: self.order.clone(),
        }))
    }
}

struct FakePlayback {
    plays: Arc<AtomicUsize>,
    detaches: Arc<AtomicUsize>,
    fail_play: bool,
    hang_play: bool,
}

#[async_trait]
impl Playback for FakePlayback {
    async fn play(&mut self) -> anyhow::Result<()> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        if self.hang_play {
            std::future::pending::<()>().await;
        }
        if self.fail_play {
            anyhow::bail!("autoplay blocked");
        }
        Ok(())
    }

    fn detach(&mut self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeSink {
    attaches: AtomicUsize,
    plays: Arc<AtomicUsize>,
    detaches: Arc<AtomicUsize>,
    fail_attach: AtomicBool,
    fail_play: AtomicBool,
    hang_play: AtomicBool,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attaches: AtomicUsize::new(0),
            plays: Arc::new(AtomicUsize::new(0)),
            detaches: Arc::new(AtomicUsize::new(0)),
            fail_attach: AtomicBool::new(false),
            fail_play: AtomicBool::new(false),
            hang_play: AtomicBool::new(false),
        })
    }

    pub fn attaches(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn detaches(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    pub fn fail_play(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }

    /// Makes every later playback hang forever in `play`.
    pub fn hang_play(&self, hang: bool) {
        self.hang_play.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn attach(
        &self,
        _participant: &str,
        _track: &RemoteTrack,
    ) -> anyhow::Result<Box<dyn Playback>> {
        if self.fail_attach.load(Ordering::SeqCst) {
            anyhow::bail!("no output device");
        }
        self.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePlayback {
            plays: Arc::clone(&self.plays),
            detaches: Arc::clone(&self.detaches),
            fail_play: self.fail_play.load(Ordering::SeqCst),
            hang_play: self.hang_play.load(Ordering::SeqCst),
        }))
    }
}
