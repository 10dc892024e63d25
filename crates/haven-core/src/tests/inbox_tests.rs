use super::{harness, harness_with_policy, fast_policy};
use crate::event::NodeEvent;
use crate::policy::Policy;
use haven_wire::MailKind;

#[tokio::test]
async fn mailbox_drains_and_acks() {
    let h = harness("inbox-ack").await;
    h.register().await;
    let client = h.node.address().to_string();
    let m1 = h
        .cafe
        .seed_mail(&h.cafe_id, &client, MailKind::Block, b"block-1".to_vec())
        .await;
    let m2 = h
        .cafe
        .seed_mail(&h.cafe_id, &client, MailKind::Block, b"block-2".to_vec())
        .await;

    h.node.check_mail().await.expect("check");

    let blocks = h.threads.blocks().await;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0], b"block-1".to_vec());
    assert_eq!(blocks[1], b"block-2".to_vec());
    assert!(h.objects.is_pinned(&m1).await);
    assert!(h.objects.is_pinned(&m2).await);
    assert_eq!(h.cafe.mailbox_len(&h.cafe_id, &client).await, 0);
    let codes = h.cafe.codes(&h.cafe_id).await;
    assert_eq!(codes.iter().filter(|c| **c == 63).count(), 1);

    // Second poll finds an empty mailbox and sends no delete.
    h.node.check_mail().await.expect("check again");
    assert_eq!(h.threads.blocks().await.len(), 2);
    let codes = h.cafe.codes(&h.cafe_id).await;
    assert_eq!(codes.iter().filter(|c| **c == 63).count(), 1);
}

#[tokio::test]
async fn invites_route_to_the_invite_path() {
    let h = harness("inbox-invite").await;
    h.register().await;
    let client = h.node.address().to_string();
    h.cafe
        .seed_mail(&h.cafe_id, &client, MailKind::Invite, b"invite-1".to_vec())
        .await;

    h.node.check_mail().await.expect("check");

    assert_eq!(h.threads.invites().await.len(), 1);
    assert!(h.threads.blocks().await.is_empty());
}

#[tokio::test]
async fn poisoned_message_quarantines_after_three_attempts() {
    let policy = Policy {
        msg_max_attempts: 3,
        ..fast_policy()
    };
    let h = harness_with_policy("inbox-quarantine", policy).await;
    h.register().await;
    let client = h.node.address().to_string();
    let poisoned = h
        .cafe
        .seed_mail(&h.cafe_id, &client, MailKind::Block, b"garbage".to_vec())
        .await;
    h.threads.fail_next_blocks(3);
    let mut events = h.node.subscribe();

    h.node.check_mail().await.expect("first");
    assert_eq!(h.cafe.mailbox_len(&h.cafe_id, &client).await, 1);
    h.node.check_mail().await.expect("second");
    assert_eq!(h.cafe.mailbox_len(&h.cafe_id, &client).await, 1);
    h.node.check_mail().await.expect("third");
    assert_eq!(h.cafe.mailbox_len(&h.cafe_id, &client).await, 0);

    match events.recv().await.expect("event") {
        NodeEvent::MessageQuarantined { id, cafe_id } => {
            assert_eq!(id, poisoned);
            assert_eq!(cafe_id, h.cafe_id);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(h.threads.blocks().await.is_empty());
}

#[tokio::test]
async fn failed_message_does_not_block_the_rest() {
    let h = harness("inbox-partial").await;
    h.register().await;
    let client = h.node.address().to_string();
    h.cafe
        .seed_mail(&h.cafe_id, &client, MailKind::Block, b"bad".to_vec())
        .await;
    h.cafe
        .seed_mail(&h.cafe_id, &client, MailKind::Block, b"good".to_vec())
        .await;
    h.threads.fail_next_blocks(1);

    h.node.check_mail().await.expect("check");

    // The good one landed and was acked; the bad one is still held.
    assert_eq!(h.threads.blocks().await, vec![b"good".to_vec()]);
    assert_eq!(h.cafe.mailbox_len(&h.cafe_id, &client).await, 1);

    h.node.check_mail().await.expect("retry");
    assert_eq!(h.threads.blocks().await.len(), 2);
    assert_eq!(h.cafe.mailbox_len(&h.cafe_id, &client).await, 0);
}

#[tokio::test]
async fn mail_push_triggers_a_check() {
    let h = harness("inbox-push").await;
    h.register().await;
    let client = h.node.address().to_string();

    // Background poller with a long interval; only the push can wake it.
    let inbox = h.node.inbox.clone();
    let handle = tokio::spawn(async move {
        inbox.run(600_000).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    h.cafe
        .seed_mail(&h.cafe_id, &client, MailKind::Block, b"pushed".to_vec())
        .await;
    h.cafe.notify_mail(&h.cafe_id);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(h.threads.blocks().await, vec![b"pushed".to_vec()]);
    h.node.stop().await;
    handle.abort();
}
