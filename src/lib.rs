//! Switchboard: a multi-tenant chat session orchestrator.
//!
//! Hosts many concurrent sessions against a chat network, each owned by a
//! tenant. A session is paired by QR code, supervised with bounded
//! reconnection, and torn down on logout or shutdown. Inbound messages are
//! normalized, persisted idempotently and published as live events; failed
//! persistence is retried with bounded attempts.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod logging;
pub mod message;
pub mod session;
pub mod store;
pub mod transport;

pub mod broadcast;
pub mod contacts;
pub mod hints;
pub mod ingest;
pub mod registry;
pub mod retry;

pub mod orchestrator;
pub mod reaper;
pub mod supervisor;

pub use orchestrator::{Switchboard, SwitchboardBuilder, SwitchboardConfig};
