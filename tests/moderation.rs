//! Moderation flows: bans, the role ladder, content checks, pins.

mod common;

use common::{TestRelay, peer, push, push_reply, wait_for, wait_for_copies};
use maskrelay::db::models::{BanType, MemberRole, UserRole};
use relay_sdk::mock::SentKind;
use std::time::Duration;

#[tokio::test]
async fn ban_cascade_silences_and_skips_the_target() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    t.join(&alice).await;
    t.join(&bob).await;

    // Bob talks; the creator receives a copy and bans him through it.
    let hi = push(&t.client, &bob, "hi all");
    let creator = t.creator.clone();
    let creator_copies = wait_for_copies(&t.client, creator.id, 1).await;
    let _ = hi;

    push_reply(&t.client, &creator, "/ban", creator_copies[0].mid);
    let t_ref = &t;
    let bob_ref = &bob;
    wait_for(Duration::from_secs(5), move || async move {
        let member = t_ref.member(bob_ref).await;
        (member.role == MemberRole::Banned).then_some(())
    })
    .await
    .expect("bob banned");

    // Alice's next broadcast skips Bob.
    push(&t.client, &alice, "hello");
    wait_for_copies(&t.client, creator.id, 2).await;
    assert_eq!(
        t.client
            .sent_to(bob.id)
            .iter()
            .filter(|r| r.kind == SentKind::Copy)
            .count(),
        0,
        "banned members receive nothing"
    );

    // A banned member cannot moderate anyone.
    let alice_member = t.member(&alice).await;
    let bob_member = t.member(&bob).await;
    assert!(bob_member.require(MemberRole::AdminBan).is_err());
    assert!(alice_member.role < MemberRole::AdminBan);
    t.stop().await;
}

#[tokio::test]
async fn moderation_honors_the_role_ladder() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    let bob = peer(11, "Bob");
    t.join(&alice).await;
    t.join(&bob).await;

    // Bob talks so Alice holds a copy to aim at.
    push(&t.client, &bob, "hi");
    let alice_copies = wait_for_copies(&t.client, alice.id, 1).await;

    // A plain member cannot ban.
    push_reply(&t.client, &alice, "/ban", alice_copies[0].mid);
    common::settle().await;
    let bob_member = t.member(&bob).await;
    assert_ne!(bob_member.role, MemberRole::Banned);

    // A ban admin can.
    t.set_role(&alice, MemberRole::AdminBan).await;
    push_reply(&t.client, &alice, "/ban", alice_copies[0].mid);
    let t_ref = &t;
    let bob_ref = &bob;
    wait_for(Duration::from_secs(5), move || async move {
        let member = t_ref.member(bob_ref).await;
        (member.role == MemberRole::Banned).then_some(())
    })
    .await
    .expect("ban admin can ban");
    t.stop().await;
}

#[tokio::test]
async fn group_default_message_ban_refuses_sends() {
    let t = TestRelay::spawn().await;
    let alice = peer(10, "Alice");
    t.join(&alice).await;

    let group = t.db.groups().by_token(common::TOKEN).await.unwrap().unwrap();
    t.db.groups()
        .replace_default_ban_group(&group, &[BanType::Message], None)
        .await
        .unwrap();

    push(&t.client, &alice, "should not go through");
    common::settle().await;

    // No message row was created and nothing was broadcast.
    let alice_member = t.member(&alice).await;
    assert_eq!(t.db.members().n_messages(alice_member.id).await.unwrap(), 0);
    let creator_copies: Vec<_> = t
        .client
        .sent_to(t.creator.id)
        .into_iter()
        .filter(|r| r.kind == SentKind::Copy)
        .collect();
    assert!(creator_copies.is_empty());

    // Admins bypass the default ban.
    let creator = t.creator.clone();
    push(&t.client, &creator, "admins still talk");
    wait_for_copies(&t.client, alice.id, 1).await;
    t.stop().await;
}

#[tokio::test]
async fn pins_propagate_to_every_copy() {
    let t = TestRelay::spawn().await;
    // Pinning needs PRIME on the group creator or the actor.
    let creator_row = t.user(&t.creator.clone()).await;
    t.db.users()
        .add_role(creator_row.id, &[UserRole::Awarded], Some(30))
        .await
        .unwrap();

    let alice = peer(10, "Alice");
    t.join(&alice).await;

    let hello = push(&t.client, &alice, "pin me");
    wait_for_copies(&t.client, t.creator.id, 1).await;
    let record = t.message_of(&alice, hello.mid).await;

    let creator = t.creator.clone();
    let creator_copies = wait_for_copies(&t.client, creator.id, 1).await;
    push_reply(&t.client, &creator, "/pin", creator_copies[0].mid);

    let client = t.client.clone();
    let expected = vec![(alice.id, record.mid), (creator.id, creator_copies[0].mid)];
    let probe = expected.clone();
    wait_for(Duration::from_secs(10), move || {
        let client = client.clone();
        let probe = probe.clone();
        async move {
            let pins = client.pins();
            probe.iter().all(|p| pins.contains(p)).then_some(())
        }
    })
    .await
    .expect("pins reached both sides");

    // The message row carries the pinned flag for later catch-up replay.
    assert!(t.message_of(&alice, hello.mid).await.pinned);
    t.stop().await;
}

#[tokio::test]
async fn guests_confirm_the_instruction_before_their_first_send() {
    let t = TestRelay::spawn().await;
    let group = t.db.groups().by_token(common::TOKEN).await.unwrap().unwrap();
    t.db.groups()
        .set_chat_instruction(group.id, Some("be kind"))
        .await
        .unwrap();

    let alice = peer(10, "Alice");
    let member = t.join(&alice).await;
    assert_eq!(member.role, MemberRole::Guest);

    // The first send parks on the instruction prompt.
    push(&t.client, &alice, "hello");
    let client = t.client.clone();
    let chat = alice.id;
    wait_for(Duration::from_secs(5), move || {
        let client = client.clone();
        async move {
            client
                .sent_to(chat)
                .into_iter()
                .find(|r| r.body.as_deref().is_some_and(|b| b.contains("be kind")))
        }
    })
    .await
    .expect("instruction prompt shown");

    // Any next message acknowledges; the parked send then goes out and the
    // guest becomes a member.
    push(&t.client, &alice, "ok");
    let copies = wait_for_copies(&t.client, t.creator.id, 1).await;
    assert!(copies[0].body.as_deref().unwrap().ends_with("| hello"));

    let t_ref = &t;
    let alice_ref = &alice;
    wait_for(Duration::from_secs(5), move || async move {
        let member = t_ref.member(alice_ref).await;
        (member.role == MemberRole::Member).then_some(())
    })
    .await
    .expect("guest promoted");
    t.stop().await;
}
