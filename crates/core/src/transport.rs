//! Real-time Room Transport Abstraction
//!
//! The session controller never loads or discovers a media library itself. It is
//! handed an already-resolved `RoomConnector`, and everything it knows about the
//! room flows through the `Room` trait and the `RoomEvent` stream defined here.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::pin::Pin;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to room: {0}")]
    Connect(String),
    #[error("Failed to publish local track: {0}")]
    Publish(String),
    #[error("Failed to send data: {0}")]
    Send(String),
    #[error("Room event stream was already taken")]
    EventsTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// The locally captured microphone track, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAudioTrack {
    pub id: String,
}

/// A track published by a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub sid: String,
    pub kind: TrackKind,
}

/// A unit of speech-to-text output.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionSegment {
    pub id: String,
    pub text: String,
    pub is_final: bool,
}

/// Everything the room can report back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    TrackSubscribed {
        participant: String,
        track: RemoteTrack,
    },
    TrackUnsubscribed {
        participant: String,
        track_sid: String,
    },
    ParticipantConnected {
        identity: String,
    },
    ParticipantDisconnected {
        identity: String,
    },
    /// A message from the room's structured chat protocol.
    ChatMessage {
        id: Option<String>,
        sender: Option<String>,
        text: String,
        timestamp: Option<DateTime<Utc>>,
    },
    TranscriptionReceived {
        participant: Option<String>,
        segments: Vec<TranscriptionSegment>,
    },
    DataReceived {
        participant: Option<String>,
        payload: Bytes,
    },
    Reconnecting,
    Reconnected,
    Disconnected {
        reason: Option<String>,
    },
}

/// The stream of events produced by a connected room.
pub type RoomEventStream = Pin<Box<dyn Stream<Item = RoomEvent> + Send>>;

/// A live connection to a room.
#[async_trait]
pub trait Room: Send + Sync {
    /// Identity of the local participant as the room sees it.
    fn local_identity(&self) -> String;

    async fn publish_track(&self, track: LocalAudioTrack) -> Result<(), TransportError>;

    /// Sends a line through the room's native chat protocol.
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    /// Publishes raw bytes on the custom data channel.
    async fn publish_data(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Hands out the room's event stream. A room yields its stream once.
    fn events(&self) -> Result<RoomEventStream, TransportError>;

    async fn disconnect(&self);
}

/// Opens room connections. This is the injected transport-library handle.
#[async_trait]
pub trait RoomConnector: Send + Sync {
    async fn connect(&self, url: &str, token: &str) -> Result<Box<dyn Room>, TransportError>;
}
