//! Providers for forge-mail: the client-side subscription and query engine.
//!
//! A provider exposes the uniform contract consumed by front-ends and UIs:
//! one-shot queries (`messages`, `topics`, `dms`), a `send` path, and live
//! `subscribe` streams. Three variants share the contract:
//!
//! - [`FileProvider`] polls the `.fmail/` store with adaptive backoff and
//!   works with nothing but a filesystem.
//! - [`BrokerProvider`] speaks the newline-delimited-JSON broker protocol
//!   for push delivery, reconnecting with sequence-numbered replay.
//! - [`HybridProvider`] is the default outward provider: broker-preferred,
//!   file-backed, deduplicating by message id so a broker outage drops
//!   nothing and a recovery duplicates nothing.

mod broker;
mod cache;
mod dedupe;
pub mod discovery;
mod error;
mod file;
mod hybrid;
mod provider;
mod subscription;

pub use broker::{BrokerProvider, query_broker_status};
pub use discovery::BrokerEndpoint;
pub use error::ProviderError;
pub use file::FileProvider;
pub use hybrid::{HybridProvider, HybridStatus, Transport};
pub use provider::Provider;
pub use subscription::Subscription;
pub use forge_mail_core::schema::WatchTarget;
