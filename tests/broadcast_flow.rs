//! End-to-end broadcast flows: send, reply fidelity, edit, delete.

mod common;

use common::{TestRelay, peer, push, push_reply, wait_for, wait_for_copies};
use relay_sdk::mock::SentKind;
use std::time::Duration;

#[tokio::test]
async fn basic_broadcast_reaches_everyone_else() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    let carol = peer(12, "Carol");
    t.join(&alice).await;
    t.join(&bob).await;
    t.join(&carol).await;

    let sent = push(&t.client, &alice, "hello");

    let bob_copies = wait_for_copies(&t.client, bob.id, 1).await;
    let carol_copies = wait_for_copies(&t.client, carol.id, 1).await;

    // The authoritative message row records the mask used.
    let record = t.message_of(&alice, sent.mid).await;
    let expected = format!("{} | hello", record.mask);
    assert_eq!(bob_copies[0].body.as_deref(), Some(expected.as_str()));
    assert_eq!(carol_copies[0].body.as_deref(), Some(expected.as_str()));

    // Exactly one redirect per recipient.
    let bob_member = t.member(&bob).await;
    let carol_member = t.member(&carol).await;
    let bob_redirect = t
        .db
        .messages()
        .redirect_for(record.id, bob_member.id)
        .await
        .unwrap()
        .expect("bob redirect");
    assert_eq!(bob_redirect.mid, bob_copies[0].mid);
    assert!(
        t.db.messages()
            .redirect_for(record.id, carol_member.id)
            .await
            .unwrap()
            .is_some()
    );

    // The sender's own mask is remembered on the membership.
    let alice_member = t.member(&alice).await;
    assert_eq!(alice_member.last_mask.as_deref(), Some(record.mask.as_str()));

    // requests = |eligible recipients|: the creator plus B and C minus the
    // sender herself. Counters are reported just before the op signals, so
    // poll briefly.
    let relay = t.relay.clone();
    let status = wait_for(Duration::from_secs(5), move || {
        let relay = relay.clone();
        async move {
            let status = relay.worker_status().snapshot().await;
            (status.requests == 3).then_some(status)
        }
    })
    .await
    .expect("broadcast accounted");
    assert_eq!(status.errors, 0);
    t.stop().await;
}

#[tokio::test]
async fn reply_targets_follow_the_redirect_index() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    let carol = peer(12, "Carol");
    t.join(&alice).await;
    t.join(&bob).await;
    t.join(&carol).await;

    let hello = push(&t.client, &alice, "hello");
    let bob_copies = wait_for_copies(&t.client, bob.id, 1).await;
    wait_for_copies(&t.client, carol.id, 1).await;
    let source = t.message_of(&alice, hello.mid).await;

    // Bob replies to his copy of Alice's message.
    push_reply(&t.client, &bob, "hi", bob_copies[0].mid);

    let alice_copies = wait_for_copies(&t.client, alice.id, 1).await;
    let carol_copies = wait_for_copies(&t.client, carol.id, 2).await;

    // Alice sees the reply anchored at her original message.
    assert_eq!(alice_copies[0].reply_to_mid, Some(source.mid));

    // Carol sees it anchored at her own copy of the original.
    let carol_member = t.member(&carol).await;
    let carol_redirect = t
        .db
        .messages()
        .redirect_for(source.id, carol_member.id)
        .await
        .unwrap()
        .expect("carol redirect");
    assert_eq!(carol_copies[1].reply_to_mid, Some(carol_redirect.mid));
    t.stop().await;
}

#[tokio::test]
async fn reply_to_a_copy_the_recipient_never_got_has_no_anchor() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    t.join(&alice).await;
    t.join(&bob).await;

    let hello = push(&t.client, &alice, "hello");
    let bob_copies = wait_for_copies(&t.client, bob.id, 1).await;

    // Carol joins only after the original broadcast.
    let carol = peer(12, "Carol");
    t.join(&carol).await;

    push_reply(&t.client, &bob, "hi", bob_copies[0].mid);
    let carol_copies = wait_for_copies(&t.client, carol.id, 1).await;
    assert_eq!(carol_copies[0].reply_to_mid, None, "no redirect, no anchor");

    // The reply is still linked to the source on the relay side.
    let source = t.message_of(&alice, hello.mid).await;
    let bob_member = t.member(&bob).await;
    let replies: Vec<_> = t
        .db
        .messages()
        .recent(source.group_id, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.member_id == bob_member.id)
        .collect();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].reply_to_id, Some(source.id));
    t.stop().await;
}

#[tokio::test]
async fn edit_rewrites_existing_copies_only() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    t.join(&alice).await;
    t.join(&bob).await;

    let hello = push(&t.client, &alice, "hello");
    wait_for_copies(&t.client, bob.id, 1).await;
    let record = t.message_of(&alice, hello.mid).await;

    t.client.push_edit(hello, "hello2");

    let expected = format!("{} | hello2", record.mask);
    let client = t.client.clone();
    let bob_id = bob.id;
    let edit = wait_for(Duration::from_secs(10), move || {
        let client = client.clone();
        let expected = expected.clone();
        async move {
            client
                .edits()
                .into_iter()
                .find(|(chat, _, text)| *chat == bob_id && text == &expected)
        }
    })
    .await
    .expect("bob's copy was edited");

    // The edit targeted the existing redirect; no new copy appeared.
    let bob_member = t.member(&bob).await;
    let redirect = t
        .db
        .messages()
        .redirect_for(record.id, bob_member.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edit.1, redirect.mid);
    assert_eq!(
        t.client
            .sent_to(bob.id)
            .iter()
            .filter(|r| r.kind == SentKind::Copy)
            .count(),
        1
    );

    // The mask is unchanged.
    assert_eq!(t.message_of(&alice, record.mid).await.mask, record.mask);
    t.stop().await;
}

#[tokio::test]
async fn delete_by_author_removes_all_copies() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    let carol = peer(12, "Carol");
    t.join(&alice).await;
    t.join(&bob).await;
    t.join(&carol).await;

    let hello = push(&t.client, &alice, "hello");
    let bob_copies = wait_for_copies(&t.client, bob.id, 1).await;
    let carol_copies = wait_for_copies(&t.client, carol.id, 1).await;
    let record = t.message_of(&alice, hello.mid).await;

    // Wait until the broadcast itself is fully accounted before measuring
    // the deletion's share of the counters.
    let relay = t.relay.clone();
    let before = wait_for(Duration::from_secs(5), move || {
        let relay = relay.clone();
        async move {
            let status = relay.worker_status().snapshot().await;
            (status.requests >= 3).then_some(status)
        }
    })
    .await
    .expect("broadcast accounted");
    push_reply(&t.client, &alice, "/delete", hello.mid);

    let client = t.client.clone();
    let wanted = vec![
        (alice.id, record.mid),
        (bob.id, bob_copies[0].mid),
        (carol.id, carol_copies[0].mid),
    ];
    let wanted_probe = wanted.clone();
    wait_for(Duration::from_secs(10), move || {
        let client = client.clone();
        let wanted = wanted_probe.clone();
        async move {
            let deletions = client.deletions();
            wanted
                .iter()
                .all(|pair| deletions.contains(pair))
                .then_some(())
        }
    })
    .await
    .expect("all three deletions observed");

    // Deletion enumerates the full group: creator, Alice, Bob, Carol.
    let relay = t.relay.clone();
    let base = before.requests;
    let after = wait_for(Duration::from_secs(5), move || {
        let relay = relay.clone();
        async move {
            let status = relay.worker_status().snapshot().await;
            (status.requests > base).then_some(status)
        }
    })
    .await
    .expect("deletion accounted");
    assert_eq!(after.requests - before.requests, 4);
    assert_eq!(after.errors, before.errors);
    t.stop().await;
}

#[tokio::test]
async fn broadcast_to_a_group_of_one_completes_with_zero_requests() {
    let t = TestRelay::spawn().await;
    // Only the creator is present.
    let creator = t.creator.clone();
    push(&t.client, &creator, "talking to myself");

    // The completion notice proves the broadcast was signaled.
    let client = t.client.clone();
    let chat = creator.id;
    wait_for(Duration::from_secs(10), move || {
        let client = client.clone();
        async move {
            client
                .edits()
                .into_iter()
                .find(|(c, _, text)| *c == chat && text.starts_with("✅ Sent (0/0)"))
        }
    })
    .await
    .expect("broadcast completed");

    let status = t.relay.worker_status().snapshot().await;
    assert_eq!(status.requests, 0);
    assert_eq!(status.errors, 0);
    t.stop().await;
}

#[tokio::test]
async fn unreachable_recipients_are_downgraded_to_left() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    t.join(&alice).await;
    t.join(&bob).await;

    t.client.fail_chat(bob.id, relay_sdk::SdkError::UserBlocked);
    push(&t.client, &alice, "hello");

    let t_ref = &t;
    let bob_ref = &bob;
    wait_for(Duration::from_secs(10), move || async move {
        let member = t_ref.member(bob_ref).await;
        (member.role == maskrelay::db::models::MemberRole::Left).then_some(())
    })
    .await
    .expect("bob downgraded to LEFT");

    let relay = t.relay.clone();
    wait_for(Duration::from_secs(5), move || {
        let relay = relay.clone();
        async move {
            let status = relay.worker_status().snapshot().await;
            (status.errors >= 1).then_some(())
        }
    })
    .await
    .expect("failure counted");

    // Later broadcasts skip him entirely.
    t.client.heal_chat(bob.id);
    push(&t.client, &alice, "again");
    let creator_chat = t.creator.id;
    wait_for_copies(&t.client, creator_chat, 2).await;
    assert!(
        t.client
            .sent_to(bob.id)
            .iter()
            .filter(|r| r.kind == SentKind::Copy)
            .count()
            <= 1
    );
    t.stop().await;
}
