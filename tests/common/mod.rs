//! Shared harness for the integration suites: an in-memory database, the
//! memory cache backing, a mock platform client and a booted relay.

#![allow(dead_code)]

use maskrelay::cache::{Cache, MemoryBacking};
use maskrelay::db::Database;
use maskrelay::db::models::{MemberRole, MemberRow, UserRow};
use maskrelay::relay::Relay;
use maskrelay::voice::PassthroughVoice;
use maskrelay::worker::WorkerStatus;
use relay_sdk::mock::MockClient;
use relay_sdk::{ClientFactory, PeerInfo, PlatformClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TOKEN: &str = "12345678:AAAAAAAAAABBBBBBBBBBccccccccccDDDDD";

pub fn peer(id: i64, name: &str) -> PeerInfo {
    PeerInfo {
        id,
        username: Some(format!("user{id}")),
        first_name: Some(name.to_string()),
        last_name: None,
    }
}

/// A booted relay over mock infrastructure.
pub struct TestRelay {
    pub db: Database,
    pub cache: Cache,
    pub client: MockClient,
    pub relay: Arc<Relay>,
    pub creator: PeerInfo,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    /// Boot a relay for a fresh group whose creator is `peer(1, "Creator")`.
    pub async fn spawn() -> TestRelay {
        let db = Database::new(":memory:").await.expect("database");
        let cache = Cache::new(Arc::new(MemoryBacking::new()));
        Self::spawn_with(db, cache).await
    }

    pub async fn spawn_with(db: Database, cache: Cache) -> TestRelay {
        let creator = peer(1, "Creator");
        let creator_row = db.users().get_or_create(&creator).await.expect("creator row");

        let client = MockClient::new(7_000_000, "maskedbot");
        let global_status = Arc::new(WorkerStatus::new(
            cache.clone(),
            "system.statistics.worker.status",
        ));
        let shutdown = CancellationToken::new();
        let relay = Relay::new(
            TOKEN.to_string(),
            Arc::new(client.clone()),
            db.clone(),
            cache.clone(),
            global_status,
            Arc::new(PassthroughVoice),
            Some(creator_row),
            180,
            shutdown.child_token(),
        );
        let task = tokio::spawn(Arc::clone(&relay).run());

        tokio::time::timeout(Duration::from_secs(5), relay.booted.wait())
            .await
            .expect("relay boot timed out");
        assert!(relay.boot_error().is_none(), "boot failed: {:?}", relay.boot_error());
        TestRelay {
            db,
            cache,
            client,
            relay,
            creator,
            shutdown,
            task,
        }
    }

    /// Join a peer through the `/start` flow and wait for the membership.
    pub async fn join(&self, peer: &PeerInfo) -> MemberRow {
        self.client.push_text(peer, "/start", None);
        let db = self.db.clone();
        let peer_id = peer.id;
        let member = wait_for(Duration::from_secs(5), move || {
            let db = db.clone();
            async move {
                let user = db.users().by_uid(peer_id).await.ok().flatten()?;
                let group = db.groups().by_token(TOKEN).await.ok().flatten()?;
                db.members().find(group.id, user.id).await.ok().flatten()
            }
        })
        .await
        .expect("join did not complete");
        member
    }

    pub async fn user(&self, peer: &PeerInfo) -> UserRow {
        self.db
            .users()
            .by_uid(peer.id)
            .await
            .expect("user lookup")
            .expect("user exists")
    }

    pub async fn member(&self, peer: &PeerInfo) -> MemberRow {
        let user = self.user(peer).await;
        let group = self
            .db
            .groups()
            .by_token(TOKEN)
            .await
            .expect("group lookup")
            .expect("group exists");
        self.db
            .members()
            .find(group.id, user.id)
            .await
            .expect("member lookup")
            .expect("member exists")
    }

    pub async fn set_role(&self, peer: &PeerInfo, role: MemberRole) {
        let member = self.member(peer).await;
        self.db.members().set_role(member.id, role).await.expect("set role");
    }

    /// The authoritative message row for a sender-side mid.
    pub async fn message_of(&self, peer: &PeerInfo, mid: i64) -> maskrelay::db::models::MessageRow {
        let member = self.member(peer).await;
        self.db
            .messages()
            .find_by_mid_member(mid, member.id)
            .await
            .expect("message lookup")
            .expect("message exists")
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Poll `f` every 50 ms until it yields `Some`, or give up.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut f: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = f().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Wait until the client has recorded `n` copies delivered to `chat`.
pub async fn wait_for_copies(client: &MockClient, chat: i64, n: usize) -> Vec<relay_sdk::mock::SentRecord> {
    let client = client.clone();
    wait_for(Duration::from_secs(10), move || {
        let client = client.clone();
        async move {
            let copies: Vec<_> = client
                .sent_to(chat)
                .into_iter()
                .filter(|r| r.kind == relay_sdk::mock::SentKind::Copy)
                .collect();
            (copies.len() >= n).then_some(copies)
        }
    })
    .await
    .unwrap_or_else(|| panic!("chat {chat} never received {n} copies"))
}

/// Client factory handing out pre-registered mock clients by token.
#[derive(Default)]
pub struct MockFactory {
    clients: dashmap::DashMap<String, MockClient>,
}

impl MockFactory {
    pub fn insert(&self, token: &str, client: MockClient) {
        self.clients.insert(token.to_string(), client);
    }
}

impl ClientFactory for MockFactory {
    fn create(&self, token: &str) -> Arc<dyn PlatformClient> {
        let client = self
            .clients
            .get(token)
            .map(|c| c.clone())
            .unwrap_or_else(|| MockClient::new(0, "unregistered"));
        Arc::new(client)
    }
}

/// Drain and discard any pending update-side effects for a duration.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Convenience: inject a text message and return it.
pub fn push(client: &MockClient, from: &PeerInfo, text: &str) -> relay_sdk::InboundMessage {
    client.push_text(from, text, None)
}

/// Convenience: inject a reply and return it.
pub fn push_reply(
    client: &MockClient,
    from: &PeerInfo,
    text: &str,
    reply_to: i64,
) -> relay_sdk::InboundMessage {
    client.push_text(from, text, Some(reply_to))
}
