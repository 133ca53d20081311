//! Media Pipeline
//!
//! Owns the local microphone capture and the playback handles attached to
//! remote audio tracks. Devices and sinks are platform concerns, so they are
//! reached through the `CaptureDevice` and `AudioSink` traits.

use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use voice_agent_core::transport::{
    LocalAudioTrack, RemoteTrack, Room, TrackKind, TransportError,
};

/// How long attaching a remote track, or starting its playback, may take
/// before it is given up on.
pub const PLAYBACK_START_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("Microphone permission was denied")]
    PermissionDenied,
    #[error("No audio capture device is available")]
    DeviceUnavailable,
    #[error("Audio capture failed: {0}")]
    Other(String),
}

/// Processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A running microphone capture.
pub trait CaptureStream: Send + Sync {
    fn track(&self) -> LocalAudioTrack;
    fn stop(&mut self);
}

/// Source of audio-only capture streams.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, MediaAcquisitionError>;
}

/// A remote track bound to an output.
#[async_trait]
pub trait Playback: Send + Sync {
    async fn play(&mut self) -> anyhow::Result<()>;
    fn detach(&mut self);
}

/// Where remote audio is rendered.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn attach(
        &self,
        participant: &str,
        track: &RemoteTrack,
    ) -> anyhow::Result<Box<dyn Playback>>;
}

/// The local capture handle. Stopped at most once: explicitly through
/// [`LocalCapture::stop`], or on drop if a session is torn down abnormally.
pub struct LocalCapture {
    stream: Option<Box<dyn CaptureStream>>,
    track: LocalAudioTrack,
}

impl LocalCapture {
    pub fn new(stream: Box<dyn CaptureStream>) -> Self {
        let track = stream.track();
        Self {
            stream: Some(stream),
            track,
        }
    }

    pub fn track(&self) -> &LocalAudioTrack {
        &self.track
    }

    pub fn is_stopped(&self) -> bool {
        self.stream.is_none()
    }

    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!(track = %self.track.id, "Local capture stopped");
        }
    }
}

impl Drop for LocalCapture {
    fn drop(&mut self) {
        if self.stream.is_some() {
            warn!(track = %self.track.id, "Local capture dropped while live; stopping it");
            self.stop();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub participant: String,
    pub track_sid: String,
}

impl TrackKey {
    pub fn new(participant: impl Into<String>, track_sid: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            track_sid: track_sid.into(),
        }
    }
}

/// Remote tracks currently attached to playback, keyed by participant and track.
#[derive(Default)]
pub struct RemoteTrackRegistry {
    entries: HashMap<TrackKey, Box<dyn Playback>>,
}

impl RemoteTrackRegistry {
    pub fn contains(&self, key: &TrackKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, key: TrackKey, playback: Box<dyn Playback>) {
        self.entries.insert(key, playback);
    }

    /// Detaches one track. Returns false if it was not attached.
    pub fn remove(&mut self, key: &TrackKey) -> bool {
        match self.entries.remove(key) {
            Some(mut playback) => {
                playback.detach();
                true
            }
            None => false,
        }
    }

    /// Detaches every track belonging to `participant`.
    pub fn remove_participant(&mut self, participant: &str) -> usize {
        let keys: Vec<TrackKey> = self
            .entries
            .keys()
            .filter(|k| k.participant == participant)
            .cloned()
            .collect();
        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Detaches everything.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut playback) in self.entries.drain() {
            playback.detach();
        }
        count
    }
}

/// Capture and playback plumbing shared by every session of a controller.
pub struct MediaPipeline {
    device: Arc<dyn CaptureDevice>,
    sink: Arc<dyn AudioSink>,
    constraints: CaptureConstraints,
    playback_timeout: Duration,
}

impl MediaPipeline {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        sink: Arc<dyn AudioSink>,
        constraints: CaptureConstraints,
    ) -> Self {
        Self {
            device,
            sink,
            constraints,
            playback_timeout: PLAYBACK_START_TIMEOUT,
        }
    }

    pub fn with_playback_timeout(mut self, timeout: Duration) -> Self {
        self.playback_timeout = timeout;
        self
    }

    pub async fn acquire(&self) -> Result<LocalCapture, MediaAcquisitionError> {
        let stream = self.device.acquire(self.constraints).await?;
        let capture = LocalCapture::new(stream);
        info!(track = %capture.track().id, constraints = ?self.constraints, "Microphone acquired");
        Ok(capture)
    }

    pub async fn publish(&self, room: &dyn Room, capture: &LocalCapture) -> Result<(), TransportError> {
        room.publish_track(capture.track().clone()).await?;
        info!(track = %capture.track().id, "Local audio track published");
        Ok(())
    }

    /// Attaches a remote audio track and starts playback.
    ///
    /// Already-attached tracks are left alone. Attach and playback failures are
    /// logged only. Returns true when a new entry was registered.
    pub async fn attach_remote(
        &self,
        registry: &mut RemoteTrackRegistry,
        participant: &str,
        track: &RemoteTrack,
    ) -> bool {
        if !self.wants_remote(registry, participant, track) {
            return false;
        }
        match self.start_playback(participant, track).await {
            Some(playback) => self.register_remote(registry, participant, track, playback),
            None => false,
        }
    }

    /// True for an audio track that is not attached yet.
    pub fn wants_remote(
        &self,
        registry: &RemoteTrackRegistry,
        participant: &str,
        track: &RemoteTrack,
    ) -> bool {
        if track.kind != TrackKind::Audio {
            debug!(%participant, track = %track.sid, "Ignoring non-audio track");
            return false;
        }
        if registry.contains(&TrackKey::new(participant, track.sid.as_str())) {
            debug!(%participant, track = %track.sid, "Remote track already attached");
            return false;
        }
        true
    }

    /// Binds `track` to the sink and starts it. Neither step may take longer
    /// than the playback timeout. A playback that fails or stalls while starting
    /// is still returned, since the output stays bound.
    pub async fn start_playback(
        &self,
        participant: &str,
        track: &RemoteTrack,
    ) -> Option<Box<dyn Playback>> {
        let attached =
            tokio::time::timeout(self.playback_timeout, self.sink.attach(participant, track)).await;
        let mut playback = match attached {
            Ok(Ok(playback)) => playback,
            Ok(Err(e)) => {
                warn!(%participant, track = %track.sid, error = ?e, "Failed to attach remote track");
                return None;
            }
            Err(_) => {
                warn!(%participant, track = %track.sid, "Timed out attaching remote track");
                return None;
            }
        };
        match tokio::time::timeout(self.playback_timeout, playback.play()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%participant, track = %track.sid, error = ?e, "Remote audio playback failed to start")
            }
            Err(_) => warn!(%participant, track = %track.sid, "Remote audio playback did not start in time"),
        }
        Some(playback)
    }

    /// Records a started playback. If the track got attached meanwhile, the
    /// new playback is detached again and false is returned.
    pub fn register_remote(
        &self,
        registry: &mut RemoteTrackRegistry,
        participant: &str,
        track: &RemoteTrack,
        mut playback: Box<dyn Playback>,
    ) -> bool {
        let key = TrackKey::new(participant, track.sid.as_str());
        if registry.contains(&key) {
            playback.detach();
            return false;
        }
        registry.insert(key, playback);
        info!(%participant, track = %track.sid, "Remote audio attached");
        true
    }

    pub fn detach_remote(
        &self,
        registry: &mut RemoteTrackRegistry,
        participant: &str,
        track_sid: &str,
    ) -> bool {
        let detached = registry.remove(&TrackKey::new(participant, track_sid));
        if detached {
            info!(%participant, track = %track_sid, "Remote audio detached");
        }
        detached
    }
}
