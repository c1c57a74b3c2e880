//! Domain types shared across the Hearth workspace: branded ids, the wire
//! envelope, the per-namespace message catalog, and the auth collaborator
//! contract. No I/O lives here.

pub mod auth;
pub mod envelope;
pub mod ids;
pub mod types;
