//! Live subscription handles.

use crate::error::ProviderError;
use forge_mail_core::schema::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered messages per subscription before the producer awaits.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 256;

/// A live message stream returned by `subscribe`.
///
/// Carries three primitives: the message channel, a fatal-error channel
/// (project mismatch, unreadable store), and a cancellation token. Dropping
/// the handle cancels the producer; explicit [`cancel`](Self::cancel) does
/// the same. Producers stop emitting within one maximum poll interval of
/// cancellation.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::Receiver<Message>,
    errors: mpsc::Receiver<ProviderError>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Next message, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Message> {
        self.messages.recv().await
    }

    /// Non-blocking poll for a message.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.messages.try_recv().ok()
    }

    /// Fatal error, if the producer reported one.
    pub fn take_error(&mut self) -> Option<ProviderError> {
        self.errors.try_recv().ok()
    }

    /// Await a fatal error (used by consumers that split message and error
    /// handling across tasks).
    pub async fn next_error(&mut self) -> Option<ProviderError> {
        self.errors.recv().await
    }

    /// Stop the producer. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observed by the producer; consumers may tie their own tasks
    /// to it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer half held by the provider's emit task.
#[derive(Debug, Clone)]
pub(crate) struct SubscriptionSender {
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<ProviderError>,
    cancel: CancellationToken,
}

impl SubscriptionSender {
    /// Deliver one message. Returns `false` when the consumer is gone.
    pub(crate) async fn emit(&self, message: Message) -> bool {
        self.messages.send(message).await.is_ok()
    }

    /// Report a fatal condition. Best-effort; the consumer may already
    /// have dropped the handle.
    pub(crate) async fn fail(&self, error: ProviderError) {
        let _ = self.errors.send(error).await;
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Build a linked producer/consumer pair.
pub(crate) fn channel() -> (SubscriptionSender, Subscription) {
    let (msg_tx, msg_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let (err_tx, err_rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    (
        SubscriptionSender {
            messages: msg_tx,
            errors: err_tx,
            cancel: cancel.clone(),
        },
        Subscription {
            messages: msg_rx,
            errors: err_rx,
            cancel,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn msg(id: &str) -> Message {
        Message {
            id: id.to_string(),
            from: "a".to_string(),
            to: "t".to_string(),
            time: String::new(),
            body: "x".to_string(),
            reply_to: None,
            priority: None,
            tags: None,
            unknown_fields: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn emits_in_order() {
        let (tx, mut sub) = channel();
        assert!(tx.emit(msg("20260210-051902-0001")).await);
        assert!(tx.emit(msg("20260210-051902-0002")).await);
        assert_eq!(sub.recv().await.unwrap().id, "20260210-051902-0001");
        assert_eq!(sub.recv().await.unwrap().id, "20260210-051902-0002");
    }

    #[tokio::test]
    async fn drop_cancels_producer() {
        let (tx, sub) = channel();
        let token = tx.token().clone();
        drop(sub);
        assert!(token.is_cancelled());
        assert!(!tx.emit(msg("20260210-051902-0001")).await);
    }

    #[tokio::test]
    async fn errors_reach_consumer() {
        let (tx, mut sub) = channel();
        tx.fail(ProviderError::InvalidProject).await;
        assert!(matches!(
            sub.take_error(),
            Some(ProviderError::InvalidProject)
        ));
    }
}
