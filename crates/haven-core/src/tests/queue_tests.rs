use super::{base_config, fast_policy, harness, harness_with_policy, temp_path};
use crate::event::NodeEvent;
use crate::policy::Policy;
use crate::queue::{RequestKind, RequestStatus};
use crate::time::ManualClock;
use crate::transport::MemoryCafe;
use crate::Node;
use haven_store::StaticKey;
use std::sync::Arc;

#[tokio::test]
async fn store_uploads_and_clears_row() {
    let h = harness("store-happy").await;
    h.register().await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    h.node.store("QmA", &h.cafes()).await.expect("put");
    assert_eq!(h.node.pending_requests().await.unwrap().len(), 1);

    h.node.flush().await.expect("flush");

    assert!(h.node.pending_requests().await.unwrap().is_empty());
    assert_eq!(h.cafe.stored_cids(&h.cafe_id).await, vec!["QmA".to_string()]);
    let codes = h.cafe.codes(&h.cafe_id).await;
    assert_eq!(codes.iter().filter(|c| **c == 56).count(), 1);
    assert_eq!(codes.iter().filter(|c| **c == 55).count(), 1);
}

#[tokio::test]
async fn missing_object_list_keeps_row_pending() {
    let h = harness("store-missing").await;
    h.register().await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    h.cafe.set_drop_uploads(&h.cafe_id, 1).await;
    h.node.store("QmA", &h.cafes()).await.expect("put");

    h.node.flush().await.expect("first flush");
    let rows = h.node.pending_requests().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempts, 1);
    assert_eq!(rows[0].status, RequestStatus::Pending);

    // Second dispatch after the backoff window; the re-upload lands.
    h.clock.advance(40_000);
    h.node.flush().await.expect("second flush");
    assert!(h.node.pending_requests().await.unwrap().is_empty());
    assert_eq!(h.cafe.stored_cids(&h.cafe_id).await, vec!["QmA".to_string()]);
}

#[tokio::test]
async fn opposite_kinds_cancel_before_dispatch() {
    let h = harness("opposite").await;
    h.register().await;
    h.node.store("t1", &h.cafes()).await.expect("store");
    h.node.unstore("t1", &h.cafes()).await.expect("unstore");

    assert!(h.node.pending_requests().await.unwrap().is_empty());
    h.node.flush().await.expect("flush");
    // Registration traffic only; nothing was dispatched for the target.
    let codes = h.cafe.codes(&h.cafe_id).await;
    assert!(codes.iter().all(|c| *c == 50 || *c == 52));
}

#[tokio::test]
async fn duplicate_puts_coalesce() {
    let h = harness("coalesce").await;
    h.register().await;
    h.node.store("t1", &h.cafes()).await.expect("put");
    h.node.store("t1", &h.cafes()).await.expect("put again");
    assert_eq!(h.node.pending_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn thread_pair_cancels_too() {
    let h = harness("thread-opposite").await;
    h.register().await;
    h.node.store_thread("th1", &h.cafes()).await.expect("put");
    h.node
        .unstore_thread("th1", &h.cafes())
        .await
        .expect("unput");
    assert!(h.node.pending_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_target_is_rejected_synchronously() {
    let h = harness("malformed-put").await;
    let err = h.node.store("", &h.cafes()).await.unwrap_err();
    assert!(matches!(err, crate::error::CoreError::Malformed(_)));
}

#[tokio::test]
async fn store_batches_cap_at_fifty_targets() {
    let h = harness("batching").await;
    h.register().await;
    for i in 0..60 {
        let cid = format!("Qm{:03}", i);
        h.objects.insert(&cid, vec![i as u8]).await;
        h.node.store(&cid, &h.cafes()).await.expect("put");
    }
    h.node.flush().await.expect("flush");
    assert!(h.node.pending_requests().await.unwrap().is_empty());
    let codes = h.cafe.codes(&h.cafe_id).await;
    // 60 uploads, but only two STORE round trips.
    assert_eq!(codes.iter().filter(|c| **c == 56).count(), 60);
    assert_eq!(codes.iter().filter(|c| **c == 55).count(), 2);
}

#[tokio::test]
async fn backoff_gates_retries_until_due() {
    let h = harness("backoff-gate").await;
    h.register().await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    h.cafe.set_fail_requests(&h.cafe_id, 1).await;
    h.node.store("QmA", &h.cafes()).await.expect("put");

    h.node.flush().await.expect("failing flush");
    assert_eq!(h.node.pending_requests().await.unwrap()[0].attempts, 1);

    // Inside the jittered 30 s window nothing moves.
    h.clock.advance(23_000);
    h.node.flush().await.expect("idle flush");
    assert_eq!(h.node.pending_requests().await.unwrap()[0].attempts, 1);

    // Past the window (36 s is the jitter ceiling) it goes through.
    h.clock.advance(14_000);
    h.node.flush().await.expect("retry flush");
    assert!(h.node.pending_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_attempts_go_failed_with_event() {
    let policy = Policy {
        max_attempts: 5,
        ..fast_policy()
    };
    let h = harness_with_policy("hard-failure", policy).await;
    h.register().await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    h.cafe.set_fail_requests(&h.cafe_id, u32::MAX).await;
    let mut events = h.node.subscribe();
    h.node.store("QmA", &h.cafes()).await.expect("put");

    for _ in 0..5 {
        h.node.flush().await.expect("flush");
        // Clear the cap plus 20 % jitter before the next pass.
        h.clock.advance(4_500_000);
    }

    let failed = h.node.failed_requests().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 5);
    assert!(h.node.pending_requests().await.unwrap().is_empty());
    match events.recv().await.expect("event") {
        NodeEvent::RequestFailed { id, cafe_id, kind } => {
            assert_eq!(id, failed[0].id);
            assert_eq!(cafe_id, h.cafe_id);
            assert_eq!(kind, RequestKind::Store);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Terminal: another pass makes no further attempts.
    h.clock.advance(4_500_000);
    h.node.flush().await.expect("idle flush");
    assert_eq!(h.node.failed_requests().await.unwrap()[0].attempts, 5);
}

#[tokio::test]
async fn failed_rows_can_be_retried_by_hand() {
    let policy = Policy {
        max_attempts: 1,
        ..fast_policy()
    };
    let h = harness_with_policy("retry-failed", policy).await;
    h.register().await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    h.cafe.set_fail_requests(&h.cafe_id, 1).await;
    h.node.store("QmA", &h.cafes()).await.expect("put");
    h.node.flush().await.expect("flush");
    let failed = h.node.failed_requests().await.unwrap();
    assert_eq!(failed.len(), 1);

    h.node.retry_request(&failed[0].id).await.expect("retry");
    h.node.flush().await.expect("flush again");
    assert!(h.node.failed_requests().await.unwrap().is_empty());
    assert_eq!(h.cafe.stored_cids(&h.cafe_id).await, vec!["QmA".to_string()]);
}

#[tokio::test]
async fn unstore_removes_remote_objects() {
    let h = harness("unstore").await;
    h.register().await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    h.node.store("QmA", &h.cafes()).await.expect("put");
    h.node.flush().await.expect("flush");
    assert_eq!(h.cafe.stored_cids(&h.cafe_id).await.len(), 1);

    h.node.unstore("QmA", &h.cafes()).await.expect("unstore");
    h.node.flush().await.expect("flush");
    assert!(h.cafe.stored_cids(&h.cafe_id).await.is_empty());
    assert!(h.node.pending_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn thread_head_replicates_encrypted() {
    let h = harness("store-thread").await;
    h.register().await;
    h.threads.set_head("th1", b"head-cid".to_vec()).await;
    h.node.store_thread("th1", &h.cafes()).await.expect("put");
    h.node.flush().await.expect("flush");
    assert!(h.cafe.has_thread(&h.cafe_id, "th1").await);
    assert!(h.node.pending_requests().await.unwrap().is_empty());

    h.node
        .unstore_thread("th1", &h.cafes())
        .await
        .expect("unput");
    h.node.flush().await.expect("flush");
    assert!(!h.cafe.has_thread(&h.cafe_id, "th1").await);
}

#[tokio::test]
async fn peer_identity_publishes() {
    let h = harness("publish-peer").await;
    h.register().await;
    h.node.publish_peer(&h.cafes()).await.expect("put");
    h.node.flush().await.expect("flush");
    let published = h
        .cafe
        .published_peer(&h.cafe_id, h.node.address())
        .await
        .expect("published");
    assert_eq!(published, h.node.address().as_bytes());
}

#[tokio::test]
async fn inbox_requests_deliver_one_way() {
    let h = harness("inbox-kind").await;
    h.register().await;
    h.objects.insert("QmMail", b"sealed-block".to_vec()).await;
    h.node
        .deliver_to_inbox("feedfacefeedface", "QmMail", &h.cafes())
        .await
        .expect("put");
    h.node.flush().await.expect("flush");
    assert!(h.node.pending_requests().await.unwrap().is_empty());
    assert_eq!(h.cafe.mailbox_len(&h.cafe_id, "feedfacefeedface").await, 1);
    let codes = h.cafe.codes(&h.cafe_id).await;
    assert_eq!(codes.iter().filter(|c| **c == 60).count(), 1);
}

#[tokio::test]
async fn rows_survive_restart() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let cafe = MemoryCafe::new(clock.clone());
    let cafe_id = cafe.add_cafe("token-1").await;
    let path = temp_path("restart");
    let objects = Arc::new(crate::objects::MemoryObjects::new());
    let threads = Arc::new(crate::threads::MemoryThreads::new());
    objects.insert("QmA", b"alpha".to_vec()).await;

    {
        let node = Node::init(
            base_config(path.clone()),
            fast_policy(),
            Arc::new(StaticKey(vec![7u8; 32])),
            clock.clone(),
            Arc::new(cafe.clone()),
            objects.clone(),
            threads.clone(),
        )
        .await
        .expect("node");
        node.cafe_register(&cafe_id, "token-1").await.expect("register");
        node.store("QmA", &[cafe_id.clone()]).await.expect("put");
        node.stop().await;
    }

    let node = Node::init(
        base_config(path),
        fast_policy(),
        Arc::new(StaticKey(vec![7u8; 32])),
        clock,
        Arc::new(cafe.clone()),
        objects,
        threads,
    )
    .await
    .expect("reopened node");
    assert_eq!(node.pending_requests().await.unwrap().len(), 1);
    node.flush().await.expect("flush");
    assert!(node.pending_requests().await.unwrap().is_empty());
    assert_eq!(cafe.stored_cids(&cafe_id).await, vec!["QmA".to_string()]);
}

#[tokio::test]
async fn unauthorized_cafe_fails_its_rows() {
    let h = harness("unauthorized").await;
    h.register().await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    let mut events = h.node.subscribe();
    h.node.store("QmA", &h.cafes()).await.expect("put");

    // Sessions revoked server side; refresh cannot save us.
    h.cafe.revoke(&h.cafe_id).await;
    h.node.flush().await.expect("flush");

    let failed = h.node.failed_requests().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(h.node.cafe_session(&h.cafe_id).await.unwrap().is_none());
    let first = events.recv().await.expect("event");
    let second = events.recv().await.expect("event");
    assert!(matches!(first, NodeEvent::SessionRevoked { .. }));
    assert!(matches!(second, NodeEvent::RequestFailed { .. }));
}

#[tokio::test]
async fn missing_local_object_drops_the_row() {
    let h = harness("missing-local").await;
    h.register().await;
    h.node.store("QmGone", &h.cafes()).await.expect("put");
    h.node.flush().await.expect("flush");
    assert!(h.node.pending_requests().await.unwrap().is_empty());
    assert!(h.node.failed_requests().await.unwrap().is_empty());
    assert!(h.cafe.stored_cids(&h.cafe_id).await.is_empty());
}
