//! Core types and engine for forge-mail (fmail)
//!
//! This crate provides the mailbox engine shared by every fmail process: the
//! `.fmail/` on-disk message store, name and body validation, sortable
//! message-id generation, message filtering, and the broker wire protocol
//! types.
//!
//! All schema types are designed to:
//! - Preserve unknown fields for forward compatibility
//! - Round-trip through serde without data loss
//! - Keep the filesystem readable by standalone tools (one JSON file per
//!   message, named by its id)

pub mod config;
pub mod filter;
pub mod logging;
pub mod msgid;
pub mod proto;
pub mod root;
pub mod schema;
pub mod store;
pub mod validate;

pub use filter::{FilterError, MessageFilter};
pub use msgid::IdGenerator;
pub use schema::{
    AgentRecord, DmConversation, Message, Priority, ProjectMeta, Target, TopicInfo, WatchTarget,
};
pub use store::{Draft, MailStore, StoreError};
pub use validate::ValidationError;
