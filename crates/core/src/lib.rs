//! Transport-neutral building blocks for a real-time voice agent session:
//! the conversation log model, the multi-source message reconciler, the
//! data-channel payload codec, and the abstraction over the injected room
//! transport.

pub mod agent;
pub mod message;
pub mod payload;
pub mod reconciler;
pub mod transport;
