use super::harness;
use crate::error::CoreError;
use crate::time::Clock;

#[tokio::test]
async fn registration_creates_one_session() {
    let h = harness("register").await;
    h.register().await;
    let sessions = h.node.cafe_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].cafe_id, h.cafe_id);
    assert!(!sessions[0].access.is_empty());
    assert!(!sessions[0].refresh.is_empty());
    assert!(sessions[0].expiry_ms > h.clock.now_ms());
    assert_eq!(h.cafe.session_count(&h.cafe_id).await, 1);
}

#[tokio::test]
async fn registration_rejects_wrong_token() {
    let h = harness("register-denied").await;
    let err = h
        .node
        .cafe_register(&h.cafe_id, "wrong-token")
        .await
        .unwrap_err();
    match err {
        CoreError::Cafe { code, .. } => assert_eq!(code, 403),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.node.cafe_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_access_refreshes_exactly_once_on_401() {
    let h = harness("refresh-401").await;
    h.register().await;
    let before = h.node.cafe_session(&h.cafe_id).await.unwrap().unwrap();

    h.cafe.expire_sessions(&h.cafe_id).await;
    h.objects.insert("QmA", b"alpha".to_vec()).await;
    h.node.store("QmA", &h.cafes()).await.expect("put");
    h.node.flush().await.expect("flush");

    // The 401 path refreshed once and the retried call went through.
    let codes = h.cafe.codes(&h.cafe_id).await;
    assert_eq!(codes.iter().filter(|c| **c == 54).count(), 1);
    assert!(h.node.pending_requests().await.unwrap().is_empty());
    let after = h.node.cafe_session(&h.cafe_id).await.unwrap().unwrap();
    assert_ne!(after.access, before.access);
}

#[tokio::test]
async fn near_expiry_refreshes_before_the_call() {
    let h = harness("refresh-skew").await;
    h.register().await;

    // Wander into the expiry skew window; the next authenticated call
    // refreshes up front instead of eating a 401.
    h.clock.advance(3_600_000);
    h.node.check_mail().await.expect("check");

    let codes = h.cafe.codes(&h.cafe_id).await;
    let refresh_at = codes.iter().position(|c| *c == 54).expect("refresh");
    let check_at = codes.iter().position(|c| *c == 61).expect("check");
    assert!(refresh_at < check_at);
    assert_eq!(codes.iter().filter(|c| **c == 54).count(), 1);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let h = harness("refresh-single-flight").await;
    h.register().await;
    h.clock.advance(3_600_000);

    let client = h.node.client.clone();
    let mut calls = Vec::new();
    for _ in 0..4 {
        let client = client.clone();
        let cafe_id = h.cafe_id.clone();
        calls.push(tokio::spawn(async move {
            client.check_messages(&cafe_id, 0).await
        }));
    }
    for call in calls {
        call.await.expect("join").expect("check");
    }
    let codes = h.cafe.codes(&h.cafe_id).await;
    assert_eq!(codes.iter().filter(|c| **c == 54).count(), 1);
    assert_eq!(codes.iter().filter(|c| **c == 61).count(), 4);
}

#[tokio::test]
async fn deregistration_deletes_session_both_sides() {
    let h = harness("deregister").await;
    h.register().await;
    h.node.cafe_deregister(&h.cafe_id).await.expect("deregister");
    assert!(h.node.cafe_sessions().await.unwrap().is_empty());
    assert_eq!(h.cafe.session_count(&h.cafe_id).await, 0);
}

#[tokio::test]
async fn deregistration_survives_unreachable_cafe() {
    let h = harness("deregister-offline").await;
    h.register().await;
    h.cafe.set_fail_requests(&h.cafe_id, u32::MAX).await;
    h.node.cafe_deregister(&h.cafe_id).await.expect("deregister");
    assert!(h.node.cafe_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn deregistering_unknown_cafe_errors() {
    let h = harness("deregister-unknown").await;
    let err = h.node.cafe_deregister(&h.cafe_id).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound));
}

#[tokio::test]
async fn revoked_refresh_surfaces_unauthorized() {
    let h = harness("revoked").await;
    h.register().await;
    h.cafe.revoke(&h.cafe_id).await;
    let err = h
        .node
        .client
        .check_messages(&h.cafe_id, 0)
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert!(h.node.cafe_session(&h.cafe_id).await.unwrap().is_none());
}

#[tokio::test]
async fn reregistration_replaces_the_session() {
    let h = harness("reregister").await;
    h.register().await;
    let first = h.node.cafe_session(&h.cafe_id).await.unwrap().unwrap();
    h.register().await;
    let second = h.node.cafe_session(&h.cafe_id).await.unwrap().unwrap();
    assert_ne!(first.access, second.access);
    assert_eq!(h.node.cafe_sessions().await.unwrap().len(), 1);
}
