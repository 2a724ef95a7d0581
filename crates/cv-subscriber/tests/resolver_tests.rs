//! Conflict resolver scenario tests:
//! - mutual exclusion per key
//! - FIFO admission within a key
//! - conflict annotation against the queue tail
//! - TTL expiry of hung head-of-line leases

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cv_subscriber::{ConflictResolver, Error, LockCallback};
use parking_lot::Mutex;

#[tokio::test]
async fn at_most_one_lease_is_admitted_per_key() {
    let resolver = ConflictResolver::new();
    let in_critical = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for priority in 0..8u64 {
        let resolver = resolver.clone();
        let in_critical = in_critical.clone();
        let max_seen = max_seen.clone();
        tasks.push(tokio::spawn(async move {
            let (id, _) = resolver.enter("account-1", priority).await;
            let inside = in_critical.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(inside, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_critical.fetch_sub(1, Ordering::SeqCst);
            resolver.leave("account-1", id).unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn admission_order_is_insertion_order() {
    let resolver = ConflictResolver::new();
    let admitted = Arc::new(Mutex::new(Vec::new()));

    // Hold the head so every later claim queues up.
    let (head_id, _) = resolver.enter("doc", 100).await;

    let mut tasks = Vec::new();
    for n in 0..5u64 {
        let resolver = resolver.clone();
        let admitted = admitted.clone();
        tasks.push(tokio::spawn(async move {
            // Priorities descend; admission order must not care.
            let (id, _) = resolver.enter("doc", 50 - n).await;
            admitted.lock().push(n);
            resolver.leave("doc", id).unwrap();
        }));
        // Settle the insertion order before queueing the next claim.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    resolver.leave("doc", head_id).unwrap();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*admitted.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn equal_priority_is_flagged_as_conflict() {
    let resolver = ConflictResolver::new();

    let (first_id, first_conflict) = resolver.enter("x", 10).await;
    assert_eq!(first_id, 1);
    assert!(!first_conflict);

    let blocked = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.enter("x", 10).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    resolver.leave("x", first_id).unwrap();
    let (second_id, second_conflict) = blocked.await.unwrap();
    assert_eq!(second_id, 2);
    assert!(second_conflict);
}

#[tokio::test]
async fn higher_priority_claim_is_not_reordered() {
    let resolver = ConflictResolver::new();

    let (head_id, _) = resolver.enter("x", 5).await;

    // Higher priority than the tail: no conflict flag, but still FIFO.
    let high = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.enter("x", 99).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let low = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.enter("x", 1).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    resolver.leave("x", head_id).unwrap();
    let (high_id, high_conflict) = high.await.unwrap();
    assert!(!high_conflict);

    // The low-priority claim entered behind priority 99: flagged, and
    // admitted only after the high-priority lease leaves.
    assert!(!low.is_finished());
    resolver.leave("x", high_id).unwrap();
    let (low_id, low_conflict) = low.await.unwrap();
    assert!(low_conflict);
    resolver.leave("x", low_id).unwrap();
}

fn collector() -> (LockCallback, Arc<Mutex<Vec<String>>>) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    let callback: LockCallback = Arc::new(move |message| sink.lock().push(message));
    (callback, messages)
}

#[tokio::test]
async fn hung_head_is_expired_and_successor_admitted() {
    let resolver = ConflictResolver::new();
    let (err_fn, errors) = collector();
    resolver.check_locks(
        Duration::from_millis(10),
        Duration::from_millis(50),
        Some(err_fn),
        None,
    );

    // Head that never leaves.
    let (hung_id, _) = resolver.enter("x", 1).await;

    let successor = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.enter("x", 2).await })
    };

    // Admitted as soon as the reaper expires the hung head.
    let (successor_id, _) = tokio::time::timeout(Duration::from_millis(200), successor)
        .await
        .expect("successor should be admitted after TTL expiry")
        .unwrap();
    resolver.leave("x", successor_id).unwrap();

    let messages = errors.lock().clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains('x'));
    assert!(messages[0].contains("ttl(50ms)"));

    // The hung caller's own release is non-fatal.
    assert!(matches!(
        resolver.leave("x", hung_id),
        Err(Error::LockForIdNotFound)
    ));
}

#[tokio::test]
async fn zero_ttl_expires_every_head_on_first_tick() {
    let resolver = ConflictResolver::new();
    let (err_fn, errors) = collector();
    resolver.check_locks(
        Duration::from_millis(10),
        Duration::ZERO,
        Some(err_fn),
        None,
    );

    let _ = resolver.enter("a", 1).await;
    let _ = resolver.enter("b", 1).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(errors.lock().len(), 2);
}

#[tokio::test]
async fn reconfiguring_replaces_the_previous_reaper() {
    let resolver = ConflictResolver::new();

    let (stale_err, stale_messages) = collector();
    resolver.check_locks(
        Duration::from_secs(3600),
        Duration::ZERO,
        Some(stale_err),
        None,
    );

    let (live_err, live_messages) = collector();
    resolver.check_locks(
        Duration::from_millis(10),
        Duration::ZERO,
        Some(live_err),
        None,
    );

    let _ = resolver.enter("x", 1).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(stale_messages.lock().is_empty());
    assert!(!live_messages.lock().is_empty());
}

#[tokio::test]
async fn info_callback_reports_queue_depths() {
    let resolver = ConflictResolver::new();
    let (info_fn, infos) = collector();
    resolver.check_locks(
        Duration::from_millis(10),
        Duration::from_secs(60),
        None,
        Some(info_fn),
    );

    let (id, _) = resolver.enter("orders", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    resolver.leave("orders", id).unwrap();

    let messages = infos.lock().clone();
    assert!(!messages.is_empty());
    assert!(messages
        .iter()
        .any(|message| message.contains("orders in queue 1")));
    assert!(messages.iter().all(|message| message.starts_with("processing: [")));
}
