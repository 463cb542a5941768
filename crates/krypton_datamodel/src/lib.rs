//! Serde wire types for the Krypton daemon.
//!
//! No logic lives here beyond constructors and conversions; the core crate
//! owns all behavior.

pub mod remote;
pub mod server;
pub mod webserver;
pub mod websocket;
