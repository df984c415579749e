//! File provider: polling subscriptions over the `.fmail/` store.

use crate::cache::QueryCache;
use crate::error::ProviderError;
use crate::provider::Provider;
use crate::subscription::{self, Subscription, SubscriptionSender};
use forge_mail_core::schema::WatchTarget;
use async_trait::async_trait;
use forge_mail_core::config::ProviderConfig;
use forge_mail_core::filter::MessageFilter;
use forge_mail_core::msgid::id_floor;
use forge_mail_core::schema::{DmConversation, Message, TopicInfo};
use forge_mail_core::store::{Draft, MailStore, StoreError};
use forge_mail_core::validate::ValidationError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Filesystem-only provider. Works with no broker anywhere: one-shot
/// queries scan the store, subscriptions poll it cooperatively with
/// adaptive backoff.
#[derive(Debug)]
pub struct FileProvider {
    store: Arc<MailStore>,
    me: Option<String>,
    cfg: ProviderConfig,
    cache: QueryCache,
}

impl FileProvider {
    pub fn new(store: Arc<MailStore>, me: Option<String>) -> Self {
        Self::with_config(store, me, ProviderConfig::default())
    }

    pub fn with_config(store: Arc<MailStore>, me: Option<String>, cfg: ProviderConfig) -> Self {
        let cache = QueryCache::new(cfg.cache_ttl());
        Self {
            store,
            me,
            cfg,
            cache,
        }
    }

    pub fn store(&self) -> &Arc<MailStore> {
        &self.store
    }

    pub fn identity(&self) -> Option<&str> {
        self.me.as_deref()
    }

    pub(crate) fn config(&self) -> &ProviderConfig {
        &self.cfg
    }

    fn bounded(&self, filter: &MessageFilter) -> MessageFilter {
        let mut filter = filter.clone();
        if filter.limit.is_none() {
            filter.limit = Some(self.cfg.default_limit);
        }
        filter
    }
}

#[async_trait]
impl Provider for FileProvider {
    async fn send(&self, draft: &Draft) -> Result<Message, ProviderError> {
        let store = self.store.clone();
        let draft = draft.clone();
        run_blocking(move || store.send(&draft)).await
    }

    async fn messages(
        &self,
        target: &WatchTarget,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, ProviderError> {
        let filter = self.bounded(filter);
        filter.validate()?;
        let key = target.wire_name();
        if let Some(hit) = self.cache.get(&key, &filter) {
            return Ok(hit);
        }
        let store = self.store.clone();
        let scan_target = target.clone();
        let scan_filter = filter.clone();
        let messages = run_blocking(move || scan(&store, &scan_target, &scan_filter)).await?;
        self.cache.put(&key, &filter, messages.clone());
        Ok(messages)
    }

    async fn topics(&self) -> Result<Vec<TopicInfo>, ProviderError> {
        let store = self.store.clone();
        run_blocking(move || store.list_topics()).await
    }

    async fn dms(&self) -> Result<Vec<DmConversation>, ProviderError> {
        let me = self
            .me
            .clone()
            .ok_or(ProviderError::Validation(ValidationError::MissingSelf))?;
        let store = self.store.clone();
        run_blocking(move || store.list_dms(&me)).await
    }

    async fn subscribe(
        &self,
        target: WatchTarget,
        filter: MessageFilter,
    ) -> Result<Subscription, ProviderError> {
        filter.validate()?;
        let (sender, sub) = subscription::channel();
        let store = self.store.clone();
        let min = self.cfg.poll_min();
        let max = self.cfg.poll_max();
        tokio::spawn(async move {
            poll_loop(store, target, filter, sender, min, max).await;
        });
        Ok(sub)
    }
}

/// Run a blocking store operation off the subscription scheduler.
async fn run_blocking<T, F>(f: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::Task(e.to_string()))?
        .map_err(ProviderError::from)
}

/// One-shot scan of a watch target. For `AllTopics` the per-topic scans are
/// merged in id order before the limit is applied.
pub(crate) fn scan(
    store: &MailStore,
    target: &WatchTarget,
    filter: &MessageFilter,
) -> Result<Vec<Message>, StoreError> {
    match target {
        WatchTarget::Topic(topic) => store.list_topic(topic, filter),
        WatchTarget::Dm { me, peer } => store.list_dm(me, peer, filter),
        WatchTarget::AllTopics => {
            let unbounded = MessageFilter {
                limit: None,
                ..filter.clone()
            };
            let mut all = Vec::new();
            for topic in store.topic_names()? {
                all.extend(store.list_topic(&topic, &unbounded)?);
            }
            all.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(filter.apply(all))
        }
    }
}

/// Directories a watch target maps onto right now. `AllTopics` is
/// re-enumerated every tick so new topics are picked up live.
fn target_dirs(store: &MailStore, target: &WatchTarget) -> Result<Vec<PathBuf>, StoreError> {
    Ok(match target {
        WatchTarget::Topic(topic) => vec![store.topic_dir(topic)],
        WatchTarget::Dm { me, peer } => vec![store.dm_dir(me, peer)],
        WatchTarget::AllTopics => store
            .topic_names()?
            .into_iter()
            .map(|t| store.topic_dir(&t))
            .collect(),
    })
}

/// Cooperative polling loop.
///
/// Per-directory cursor = last id seen; each tick scans for entries past
/// the cursor, emits matches in id order, and advances the cursor whether
/// or not the filter matched. Quiet ticks stretch the interval by 1.5x up
/// to the ceiling; any activity snaps it back to the floor.
async fn poll_loop(
    store: Arc<MailStore>,
    target: WatchTarget,
    filter: MessageFilter,
    sender: SubscriptionSender,
    min_interval: Duration,
    max_interval: Duration,
) {
    // Initial cursors: the current tail of each directory, or the floor of
    // `since` so history from that instant is replayed.
    let since_cursor = filter.since.map(id_floor);
    let mut cursors: HashMap<PathBuf, String> = HashMap::new();
    {
        let store = store.clone();
        let target = target.clone();
        let since_cursor = since_cursor.clone();
        match tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            let mut cursors = HashMap::new();
            for dir in target_dirs(&store, &target)? {
                let cursor = match &since_cursor {
                    Some(floor) => floor.clone(),
                    None => store.ids_after(&dir, None)?.pop().unwrap_or_default(),
                };
                cursors.insert(dir, cursor);
            }
            Ok(cursors)
        })
        .await
        {
            Ok(Ok(initial)) => cursors = initial,
            Ok(Err(e)) => {
                sender.fail(e.into()).await;
                return;
            }
            Err(e) => {
                sender.fail(ProviderError::Task(e.to_string())).await;
                return;
            }
        }
    }

    let mut interval = min_interval;
    debug!(watch = %target, "file subscription polling");

    loop {
        tokio::select! {
            _ = sender.token().cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let store_tick = store.clone();
        let target_tick = target.clone();
        let mut tick_cursors = cursors.clone();
        let since_floor = since_cursor.clone();
        let scanned = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
            let mut fresh: Vec<Message> = Vec::new();
            for dir in target_dirs(&store_tick, &target_tick)? {
                let cursor = tick_cursors
                    .entry(dir.clone())
                    .or_insert_with(|| since_floor.clone().unwrap_or_default());
                let new_ids = store_tick.ids_after(&dir, Some(cursor.as_str()))?;
                for id in new_ids {
                    match store_tick.read_message(&dir.join(format!("{id}.json"))) {
                        Ok(msg) => fresh.push(msg),
                        Err(StoreError::Json { path, source }) => {
                            warn!("skipping malformed message {}: {source}", path.display());
                        }
                        // A sweep may race the scan; a vanished file is not fatal.
                        Err(StoreError::Io { source, .. })
                            if source.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                    if id > *cursor {
                        *cursor = id;
                    }
                }
            }
            fresh.sort_by(|a, b| a.id.cmp(&b.id));
            Ok((fresh, tick_cursors))
        })
        .await;

        let (fresh, new_cursors) = match scanned {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                sender.fail(e.into()).await;
                break;
            }
            Err(e) => {
                sender.fail(ProviderError::Task(e.to_string())).await;
                break;
            }
        };
        cursors = new_cursors;

        if fresh.is_empty() {
            interval = (interval.mul_f64(1.5)).min(max_interval);
            continue;
        }
        interval = min_interval;

        for msg in fresh {
            // Mismatches are skipped but the cursor already advanced.
            if !filter.matches(&msg) {
                continue;
            }
            if !sender.emit(msg).await {
                return;
            }
        }
        if sender.is_cancelled() {
            break;
        }
    }
    debug!(watch = %target, "file subscription stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Arc<MailStore>) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(MailStore::init(tmp.path()).unwrap());
        (tmp, store)
    }

    fn fast_config() -> ProviderConfig {
        ProviderConfig {
            poll_min_ms: 10,
            poll_max_ms: 50,
            cache_ttl_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn one_shot_query_applies_default_limit() {
        let (_tmp, store) = fixture();
        for i in 0..5 {
            store
                .send(&Draft::new("alice", "task", format!("m{i}")))
                .unwrap();
        }
        let provider = FileProvider::with_config(
            store,
            None,
            ProviderConfig {
                default_limit: 3,
                cache_ttl_ms: 0,
                ..Default::default()
            },
        );
        let got = provider
            .messages(
                &WatchTarget::Topic("task".to_string()),
                &MessageFilter::default(),
            )
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[2].body, "m4");
    }

    #[tokio::test]
    async fn subscription_tails_new_sends_in_order() {
        let (_tmp, store) = fixture();
        // Pre-existing history must not be replayed.
        store.send(&Draft::new("alice", "task", "old")).unwrap();

        let provider = FileProvider::with_config(store.clone(), None, fast_config());
        let mut sub = provider
            .subscribe(
                WatchTarget::Topic("task".to_string()),
                MessageFilter::default(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.send(&Draft::new("alice", "task", "a")).unwrap();
        store.send(&Draft::new("alice", "task", "b")).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.body, "a");
        assert_eq!(second.body, "b");
        assert!(first.id < second.id);

        // After cancel, a third send is not observed.
        sub.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        store.send(&Draft::new("alice", "task", "c")).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscription_filter_mismatch_advances_cursor() {
        let (_tmp, store) = fixture();
        let provider = FileProvider::with_config(store.clone(), None, fast_config());
        let filter = MessageFilter {
            from: Some("bob".to_string()),
            ..Default::default()
        };
        let mut sub = provider
            .subscribe(WatchTarget::Topic("task".to_string()), filter)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.send(&Draft::new("alice", "task", "not bob")).unwrap();
        store.send(&Draft::new("bob", "task", "from bob")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.from, "bob");
        assert!(sub.try_recv().is_none(), "mismatch was not re-emitted");
    }

    #[tokio::test]
    async fn all_topics_subscription_sees_new_topics() {
        let (_tmp, store) = fixture();
        let provider = FileProvider::with_config(store.clone(), None, fast_config());
        let mut sub = provider
            .subscribe(WatchTarget::AllTopics, MessageFilter::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        // A topic that did not exist at subscribe time.
        store.send(&Draft::new("alice", "fresh-topic", "hi")).unwrap();
        // DMs stay invisible to `*`.
        store.send(&Draft::new("alice", "@bob", "psst")).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.to, "fresh-topic");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn since_filter_replays_history() {
        let (_tmp, store) = fixture();
        store.send(&Draft::new("alice", "task", "past")).unwrap();

        let provider = FileProvider::with_config(store.clone(), None, fast_config());
        let filter = MessageFilter {
            since: Some(chrono::Utc::now() - chrono::Duration::hours(1)),
            ..Default::default()
        };
        let mut sub = provider
            .subscribe(WatchTarget::Topic("task".to_string()), filter)
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body, "past");
    }

    #[tokio::test]
    async fn dms_requires_identity() {
        let (_tmp, store) = fixture();
        let provider = FileProvider::new(store, None);
        let err = provider.dms().await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Validation(ValidationError::MissingSelf)
        ));
    }
}
