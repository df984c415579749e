//! The forge-mail broker daemon.
//!
//! A long-running process, typically one per project root, that layers push
//! delivery on top of the `.fmail/` file store with identical semantics:
//! every accepted message is persisted through the store (producing the
//! authoritative id) before it is acked or fanned out, so standalone
//! readers observe the same history.
//!
//! Clients connect over `.fmail/forged.sock` (Unix) or TCP loopback and
//! speak the newline-delimited JSON protocol defined in
//! [`forge_mail_core::proto`].

mod connection;
mod hub;
mod server;

pub use server::{BrokerHandle, start};
