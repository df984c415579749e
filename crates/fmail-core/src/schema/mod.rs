//! On-disk schema types for the `.fmail/` tree.

mod agent_record;
mod message;
mod project;
mod summary;
mod target;

pub use agent_record::AgentRecord;
pub use message::{Message, Priority};
pub use project::ProjectMeta;
pub use summary::{DmConversation, TopicInfo};
pub use target::{Target, WatchTarget, dm_dir_name, split_dm_dir};
