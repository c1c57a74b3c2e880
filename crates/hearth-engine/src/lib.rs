//! The realtime coordination core: connection registry, presence
//! coordinator, chat relay, and call-signaling engine. One process owns all
//! state; each live connection is serviced by its own task that dispatches
//! into these components.

pub mod chat;
pub mod error;
pub mod policy;
pub mod presence;
pub mod push;
pub mod registry;
pub mod signaling;

pub use error::EngineError;
