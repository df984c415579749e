//! The uniform provider contract.

use crate::error::ProviderError;
use crate::subscription::Subscription;
use forge_mail_core::schema::WatchTarget;
use async_trait::async_trait;
use forge_mail_core::filter::MessageFilter;
use forge_mail_core::schema::{DmConversation, Message, TopicInfo};
use forge_mail_core::store::Draft;

/// Capability set shared by the file, broker, and hybrid providers.
///
/// One-shot queries are bounded (a default limit applies when the filter
/// has none) and may be served from a short-TTL cache. Subscriptions stream
/// until cancelled and ignore the filter's `limit`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Validate and publish one message, returning it with its assigned id.
    async fn send(&self, draft: &Draft) -> Result<Message, ProviderError>;

    /// Bounded query of one target, ascending id order.
    async fn messages(
        &self,
        target: &WatchTarget,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, ProviderError>;

    /// Topic summaries.
    async fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError>;

    /// DM conversation summaries for this provider's identity.
    async fn dms(&self) -> Result<Vec<DmConversation>, ProviderError>;

    /// Open a live stream of messages matching `target` and `filter`.
    async fn subscribe(
        &self,
        target: WatchTarget,
        filter: MessageFilter,
    ) -> Result<Subscription, ProviderError>;
}
