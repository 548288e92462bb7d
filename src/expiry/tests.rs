//! Expiry Bridge Tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::coordination::local::LocalBackend;
use crate::coordination::types::Ttl;
use crate::coordination::BackendHandle;
use crate::expiry::ExpiryBridge;

#[tokio::test]
async fn test_every_subscriber_sees_the_event() {
    let backend = LocalBackend::new();
    let handle = BackendHandle::new(backend);
    let bridge = ExpiryBridge::new(handle.clone());

    let mut first = bridge.subscribe();
    let mut second = bridge.subscribe();

    let map = handle.map("presence", None);
    map.put("ghost", b"boo".to_vec(), Ttl::After(Duration::from_millis(80)))
        .await
        .unwrap();

    for subscription in [&mut first, &mut second] {
        let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await
            .expect("event delivered")
            .expect("stream open");
        assert_eq!(event.key, "ghost");
        assert_eq!(event.last_value, b"boo".to_vec());
    }
}

#[tokio::test]
async fn test_channel_opens_with_first_and_closes_with_last() {
    let handle = BackendHandle::new(LocalBackend::new());
    let bridge = ExpiryBridge::new(handle);

    assert!(!bridge.is_pumping(), "no subscriber, no channel");

    let first = bridge.subscribe();
    let second = bridge.subscribe();
    assert!(bridge.is_pumping());

    drop(first);
    assert!(bridge.is_pumping(), "one subscriber remains");

    drop(second);
    assert!(!bridge.is_pumping(), "last subscriber closed the channel");
}

#[tokio::test]
async fn test_dead_subscriber_does_not_block_the_rest() {
    let handle = BackendHandle::new(LocalBackend::new());
    let bridge = ExpiryBridge::new(handle.clone());

    let short_lived = bridge.subscribe();
    let mut survivor = bridge.subscribe();

    let map = handle.map("m", None);
    map.put("a", b"1".to_vec(), Ttl::After(Duration::from_millis(60)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    drop(short_lived);

    map.put("b", b"2".to_vec(), Ttl::After(Duration::from_millis(60)))
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(2), survivor.recv())
            .await
            .expect("event delivered")
            .expect("stream open");
        seen.push(event.key);
    }
    seen.sort();
    assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_bridge_follows_backend_swap() {
    let old_backend = LocalBackend::new();
    let handle = BackendHandle::new(old_backend);
    let bridge = ExpiryBridge::new(handle.clone());
    let mut subscription = bridge.subscribe();

    let new_backend = LocalBackend::new();
    handle.swap(new_backend.clone());
    // Give the swap watcher a beat to rewire the pump.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let map = handle.map("rooms", None);
    map.put("r1", b"x".to_vec(), Ttl::After(Duration::from_millis(60)))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("event from swapped backend")
        .expect("stream open");
    assert_eq!(event.map, "rooms");
    assert_eq!(event.key, "r1");
}

#[tokio::test]
async fn test_events_keep_flowing_while_subscribers_churn() {
    let handle = BackendHandle::new(LocalBackend::new());
    let bridge = ExpiryBridge::new(handle.clone());
    let delivered = Arc::new(AtomicUsize::new(0));

    let mut stable = bridge.subscribe();
    let delivered_clone = delivered.clone();
    let collector = tokio::spawn(async move {
        while let Some(_) = stable.recv().await {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    let map = handle.map("churn", None);
    for i in 0..5 {
        let transient = bridge.subscribe();
        map.put(
            &format!("k{}", i),
            vec![i as u8],
            Ttl::After(Duration::from_millis(40)),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(transient);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 5);
    collector.abort();
}
