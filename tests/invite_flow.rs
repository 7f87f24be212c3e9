//! Invite and code flows: operator invites, group creation awards, and
//! per-group invite links.

mod common;

use common::{MockFactory, TestRelay, peer, wait_for};
use maskrelay::cache::{Cache, MemoryBacking};
use maskrelay::db::Database;
use maskrelay::db::models::{MemberRole, UserRole};
use maskrelay::father::Father;
use maskrelay::fleet::Fleet;
use maskrelay::voice::PassthroughVoice;
use relay_sdk::mock::MockClient;
use relay_sdk::{SdkError, Update};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FATHER_TOKEN: &str = "99999999:FFFFFFFFFFFFFFFFFFFFffffffffffFFFFF";
const GROUP_TOKEN: &str = "12345678:AAAAAAAAAABBBBBBBBBBccccccccccDDDDD";

struct Operator {
    db: Database,
    fleet: Arc<Fleet>,
    father: Arc<Father>,
    father_client: MockClient,
    factory: Arc<MockFactory>,
    shutdown: CancellationToken,
}

impl Operator {
    async fn spawn() -> Operator {
        let db = Database::new(":memory:").await.unwrap();
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        let factory = Arc::new(MockFactory::default());
        let father_client = MockClient::new(555, "fatherbot");
        factory.insert(FATHER_TOKEN, father_client.clone());

        let shutdown = CancellationToken::new();
        let fleet = Fleet::new(
            db.clone(),
            cache,
            factory.clone(),
            Arc::new(PassthroughVoice),
            180,
            shutdown.child_token(),
        );
        Arc::clone(&fleet).run().await.unwrap();
        let father = Father::new(
            Arc::new(father_client.clone()),
            db.clone(),
            Arc::clone(&fleet),
            180,
            shutdown.child_token(),
        );
        Operator {
            db,
            fleet,
            father,
            father_client,
            factory,
            shutdown,
        }
    }

    /// Drive one inbound operator message to completion.
    async fn tell(&self, from: &relay_sdk::PeerInfo, text: &str) {
        let msg = relay_sdk::InboundMessage {
            mid: 1_000_000 + rand_mid(),
            chat_id: from.id,
            from: from.clone(),
            text: Some(text.to_string()),
            caption: None,
            media: None,
            entities: Vec::new(),
            has_markup: false,
            reply_to_mid: None,
        };
        self.father.handle_update(Update::Message(msg)).await;
    }

    fn father_said(&self, chat: i64, needle: &str) -> bool {
        self.father_client
            .sent_to(chat)
            .iter()
            .any(|r| r.body.as_deref().is_some_and(|b| b.contains(needle)))
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.fleet.stop_all().await;
    }
}

fn rand_mid() -> i64 {
    use std::sync::atomic::{AtomicI64, Ordering};
    static SEQ: AtomicI64 = AtomicI64::new(0);
    SEQ.fetch_add(1, Ordering::Relaxed)
}

#[tokio::test]
async fn invite_fulfillment_awards_both_parties() {
    let op = Operator::spawn().await;
    let inviter = peer(20, "Yvonne");
    let invited = peer(21, "Xavier");

    // Yvonne creates an invite link through the operator.
    op.tell(&inviter, "/createcode").await;
    let link_msg = op
        .father_client
        .sent_to(inviter.id)
        .into_iter()
        .find(|r| r.body.as_deref().is_some_and(|b| b.contains("start=_c_")))
        .expect("invite link sent");
    let body = link_msg.body.unwrap();
    let code = body
        .split("start=_c_")
        .nth(1)
        .unwrap()
        .split_whitespace()
        .next()
        .unwrap()
        .to_string();

    // Xavier redeems it and is now INVITED.
    op.tell(&invited, &format!("/start _c_{code}")).await;
    let invited_row = op.db.users().by_uid(invited.id).await.unwrap().unwrap();
    assert!(
        op.db
            .users()
            .validate(invited_row.id, &[UserRole::Invited])
            .await
            .unwrap()
    );

    // Xavier hosts his first group; the fleet boots it from his token.
    op.factory
        .insert(GROUP_TOKEN, MockClient::new(7_000_000, "maskedbot"));
    op.tell(&invited, "/newgroup").await;
    op.tell(&invited, &format!("here: {GROUP_TOKEN}")).await;
    assert!(op.father_said(invited.id, "is live"), "group boot reported");

    let group = op.db.groups().by_token(GROUP_TOKEN).await.unwrap().unwrap();
    assert!(!group.disabled);

    // Creator member exists with CREATOR role.
    let member = op
        .db
        .members()
        .find(group.id, invited_row.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(member.role, MemberRole::Creator);

    // Grouper for the creator; AWARDED for both parties.
    let inviter_row = op.db.users().by_uid(inviter.id).await.unwrap().unwrap();
    let users = op.db.users();
    assert!(users.validate(invited_row.id, &[UserRole::Grouper]).await.unwrap());
    assert!(users.validate(invited_row.id, &[UserRole::Awarded]).await.unwrap());
    assert!(users.validate(inviter_row.id, &[UserRole::Awarded]).await.unwrap());
    op.stop().await;
}

#[tokio::test]
async fn rehosting_an_existing_token_is_refused() {
    let op = Operator::spawn().await;
    let user = peer(30, "Holly");
    op.factory
        .insert(GROUP_TOKEN, MockClient::new(7_000_000, "maskedbot"));

    op.tell(&user, "/newgroup").await;
    op.tell(&user, GROUP_TOKEN).await;
    assert!(op.father_said(user.id, "is live"));

    op.tell(&user, "/newgroup").await;
    op.tell(&user, GROUP_TOKEN).await;
    assert!(op.father_said(user.id, "already an anonymous group"));
    op.stop().await;
}

#[tokio::test]
async fn deactivated_credentials_disable_the_group() {
    let op = Operator::spawn().await;
    let user = peer(31, "Dana");
    let client = MockClient::new(7_000_000, "maskedbot");
    client.fail_connect(SdkError::UserDeactivated);
    op.factory.insert(GROUP_TOKEN, client);

    // Seed the group row so the failed boot has something to disable.
    let user_row = op.db.users().get_or_create(&user).await.unwrap();
    op.db
        .groups()
        .create_with_creator(
            GROUP_TOKEN,
            &relay_sdk::BotProfile {
                id: 7_000_000,
                username: "maskedbot".into(),
                name: "Masked".into(),
            },
            &user_row,
            180,
        )
        .await
        .unwrap();

    let result = op.fleet.start_group_bot(GROUP_TOKEN, None).await;
    assert!(result.is_err());

    let group = op.db.groups().by_token(GROUP_TOKEN).await.unwrap().unwrap();
    assert!(group.disabled, "revoked credential must disable the group");
    op.stop().await;
}

#[tokio::test]
async fn private_group_invite_links_admit_and_exhaust() {
    let t = TestRelay::spawn().await;
    let group = t.db.groups().by_token(common::TOKEN).await.unwrap().unwrap();
    t.db.groups().set_password(group.id, Some("hunter2")).await.unwrap();

    // The creator issues a single-use invite link.
    let creator = t.creator.clone();
    t.client.push_text(&creator, "/invite 1 7", None);
    let client = t.client.clone();
    let chat = creator.id;
    let link = wait_for(Duration::from_secs(5), move || {
        let client = client.clone();
        async move {
            client
                .sent_to(chat)
                .into_iter()
                .find(|r| r.body.as_deref().is_some_and(|b| b.contains("start=_c_")))
        }
    })
    .await
    .expect("invite link issued");
    let body = link.body.unwrap();
    let code = body
        .split("start=_c_")
        .nth(1)
        .unwrap()
        .split_whitespace()
        .next()
        .unwrap()
        .to_string();

    // A newcomer joins through the code, bypassing the password.
    let guest = peer(40, "Gina");
    t.client.push_text(&guest, &format!("/start _c_{code}"), None);
    let t_ref = &t;
    let guest_ref = &guest;
    let member = wait_for(Duration::from_secs(5), move || async move {
        let user = t_ref.db.users().by_uid(guest_ref.id).await.ok().flatten()?;
        let group = t_ref.db.groups().by_token(common::TOKEN).await.ok().flatten()?;
        let member = t_ref.db.members().find(group.id, user.id).await.ok().flatten()?;
        // The invitor back-pointer is written last; wait for it too.
        member.invitor_id.is_some().then_some(member)
    })
    .await
    .expect("guest admitted through the invite");
    assert_eq!(member.role, MemberRole::Guest);

    let creator_member = t.member(&creator).await;
    assert_eq!(member.invitor_id, Some(creator_member.id));

    // The single use is consumed: the next joiner is refused.
    let second = peer(41, "Sam");
    t.client.push_text(&second, &format!("/start _c_{code}"), None);
    common::settle().await;
    common::settle().await;
    let user = t.db.users().by_uid(second.id).await.unwrap();
    if let Some(user) = user {
        assert!(
            t.db.members().find(group.id, user.id).await.unwrap().is_none(),
            "exhausted codes admit nobody"
        );
    }
    t.stop().await;
}
