//! Beacon signaling relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, binds client-chosen user ids to them,
//! fans out presence transitions, and forwards negotiation envelopes
//! between registered peers without interpreting their contents.

pub mod admission;
pub mod config;
pub mod reaper;
pub mod registry;
pub mod relay;
