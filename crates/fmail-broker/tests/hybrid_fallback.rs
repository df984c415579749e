//! Broker-fallback continuity: the hybrid provider keeps delivering across
//! a broker outage and restart without dropping or duplicating messages.

#![cfg(unix)]

use forge_mail_core::config::{BrokerConfig, ProviderConfig};
use forge_mail_core::filter::MessageFilter;
use forge_mail_core::schema::WatchTarget;
use forge_mail_core::store::{Draft, MailStore};
use forge_mail_provider::{HybridProvider, Provider, Subscription, Transport};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn broker_cfg() -> BrokerConfig {
    BrokerConfig {
        tcp: false, // unix socket only; discovery finds it via .fmail/forged.sock
        ..Default::default()
    }
}

fn provider_cfg() -> ProviderConfig {
    ProviderConfig {
        poll_min_ms: 10,
        poll_max_ms: 100,
        cache_ttl_ms: 0,
        reconnect_ms: 100,
        ..Default::default()
    }
}

async fn recv_body(sub: &mut Subscription, timeout: Duration) -> String {
    tokio::time::timeout(timeout, sub.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription ended unexpectedly")
        .body
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn continuity_across_broker_outage_and_restart() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MailStore::init(tmp.path()).unwrap());

    // Broker up first so the hybrid discovers it.
    let cancel = CancellationToken::new();
    let handle = forge_mail_broker::start(store.clone(), broker_cfg(), cancel.clone())
        .await
        .unwrap();

    let provider =
        HybridProvider::with_config(store.clone(), Some("alice".to_string()), provider_cfg())
            .await
            .unwrap();
    assert_eq!(provider.status().transport, Transport::Broker);

    let mut sub = provider
        .subscribe(
            WatchTarget::Topic("task".to_string()),
            MessageFilter::default(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Phase 1: broker path.
    for body in ["m1", "m2"] {
        provider.send(&Draft::new("alice", "task", body)).await.unwrap();
    }
    assert_eq!(recv_body(&mut sub, Duration::from_secs(5)).await, "m1");
    assert_eq!(recv_body(&mut sub, Duration::from_secs(5)).await, "m2");

    // Phase 2: kill the broker; sends demote to the file store and the
    // subscriber keeps observing through the file poller.
    cancel.cancel();
    drop(handle); // removes the socket file
    tokio::time::sleep(Duration::from_millis(200)).await;

    provider.send(&Draft::new("alice", "task", "m3")).await.unwrap();
    assert_eq!(recv_body(&mut sub, Duration::from_secs(5)).await, "m3");
    assert_eq!(provider.status().transport, Transport::File);

    provider.send(&Draft::new("alice", "task", "m4")).await.unwrap();
    assert_eq!(recv_body(&mut sub, Duration::from_secs(5)).await, "m4");

    // Phase 3: restart the broker on the same project; the next send goes
    // back through it, and nothing from phase 2 is re-delivered.
    let cancel2 = CancellationToken::new();
    let _handle2 = forge_mail_broker::start(store.clone(), broker_cfg(), cancel2.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    provider.send(&Draft::new("alice", "task", "m5")).await.unwrap();
    assert_eq!(provider.status().transport, Transport::Broker);
    assert_eq!(recv_body(&mut sub, Duration::from_secs(10)).await, "m5");

    // No duplicates ever surfaced.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sub.try_recv().is_none(), "duplicate delivery detected");

    // And the file store holds exactly the five messages, all unique.
    let all = store.list_topic("task", &MessageFilter::default()).unwrap();
    assert_eq!(all.len(), 5);
    let unique: HashSet<_> = all.iter().map(|m| &m.id).collect();
    assert_eq!(unique.len(), 5);

    cancel2.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broker_sends_are_observed_by_standalone_readers() {
    // Any message accepted by the broker is on disk before the ack, so a
    // plain file scan from another "process" view sees identical history.
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MailStore::init(tmp.path()).unwrap());

    let cancel = CancellationToken::new();
    let _handle = forge_mail_broker::start(store.clone(), broker_cfg(), cancel.clone())
        .await
        .unwrap();

    let provider =
        HybridProvider::with_config(store.clone(), Some("alice".to_string()), provider_cfg())
            .await
            .unwrap();
    let sent = provider
        .send(&Draft::new("alice", "task", "durable"))
        .await
        .unwrap();

    let reader = MailStore::open(tmp.path()).unwrap();
    let listed = reader.list_topic("task", &MessageFilter::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, sent.id);
    assert_eq!(listed[0].body, "durable");

    cancel.cancel();
}
