use crate::{media::MediaAcquisitionError, token::CredentialError};
use voice_agent_core::transport::TransportError;

/// The single user-facing error type of a voice session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Could not obtain a session credential: {0}")]
    Credential(#[from] CredentialError),
    #[error("Microphone unavailable: {0}")]
    MediaAcquisition(#[from] MediaAcquisitionError),
    #[error("Voice connection failed: {0}")]
    Transport(#[from] TransportError),
    #[error("Not connected to a voice session")]
    NotConnected,
    #[error("Connect attempt was cancelled by a disconnect request")]
    Cancelled,
    #[error("Connect attempt aborted: {0}")]
    Aborted(String),
}
