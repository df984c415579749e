//! The broker provider speaking to a live broker.

use forge_mail_core::config::{BrokerConfig, ProviderConfig};
use forge_mail_core::filter::MessageFilter;
use forge_mail_core::schema::WatchTarget;
use forge_mail_core::store::{Draft, MailStore};
use forge_mail_provider::{BrokerEndpoint, BrokerProvider, Provider, ProviderError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _tmp: TempDir,
    store: Arc<MailStore>,
    endpoint: BrokerEndpoint,
    cancel: CancellationToken,
    _handle: forge_mail_broker::BrokerHandle,
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MailStore::init(tmp.path()).unwrap());
    let cfg = BrokerConfig {
        tcp: true,
        tcp_port: 0,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let handle = forge_mail_broker::start(store.clone(), cfg, cancel.clone())
        .await
        .unwrap();
    let endpoint = BrokerEndpoint::Tcp(handle.tcp_addr.unwrap());
    Fixture {
        _tmp: tmp,
        store,
        endpoint,
        cancel,
        _handle: handle,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_and_subscribe_through_the_broker() {
    let fx = fixture().await;
    let provider = BrokerProvider::with_config(
        fx.store.clone(),
        Some("alice".to_string()),
        fx.endpoint.clone(),
        ProviderConfig {
            cache_ttl_ms: 0,
            reconnect_ms: 100,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let mut sub = provider
        .subscribe(
            WatchTarget::Topic("task".to_string()),
            MessageFilter::default(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = provider
        .send(&Draft::new("alice", "task", "pushed"))
        .await
        .unwrap();
    assert!(sent.id.len() == 20);

    let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.id, sent.id);
    assert_eq!(got.body, "pushed");

    // One-shot queries read the authoritative replica.
    let listed = provider
        .messages(
            &WatchTarget::Topic("task".to_string()),
            &MessageFilter::default(),
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    fx.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_query_reports_the_session() {
    let fx = fixture().await;
    let project = fx.store.project_id().unwrap();

    let payload = forge_mail_provider::query_broker_status(&fx.endpoint, &project, "alice")
        .await
        .unwrap();
    assert!(payload["session"].as_str().unwrap().starts_with("s-"));
    assert_eq!(payload["project"], project);

    fx.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_project_surfaces_invalid_project() {
    let fx = fixture().await;

    // A second project on its own directory, pointed at the first broker.
    let other = TempDir::new().unwrap();
    let other_store = Arc::new(MailStore::init(other.path()).unwrap());
    let provider = BrokerProvider::new(other_store, Some("alice".to_string()), fx.endpoint.clone())
        .await
        .unwrap();

    let err = provider
        .send(&Draft::new("alice", "task", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::InvalidProject), "{err}");

    fx.cancel.cancel();
}
