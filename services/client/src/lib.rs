//! Voice Agent Client Library Crate
//!
//! Session plumbing for a browser-style voice agent widget: fetching a room
//! credential, driving the room connection, capturing and playing audio, and
//! reconciling every inbound text source into one message log. The
//! `voice-token` binary is a thin diagnostic wrapper around this library.

pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod session;
pub mod state;
pub mod token;

#[cfg(test)]
mod test_support;

pub use error::SessionError;
pub use session::VoiceSession;
pub use state::{ConnectionStatus, SessionSnapshot};
