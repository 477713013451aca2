//! Feed session integration tests
//!
//! Drives full reconciliation rounds against the in-process network:
//! - quorum gathering across shards with scripted peers
//! - backfill of references that live on other shards
//! - identity trust checks, including forged records
//! - single-flight, pagination, timeouts and caller misuse

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::oneshot;

use feed_reconciler::config::Config;
use feed_reconciler::feed::{ContentFeed, FeedEvent, FeedFilter, FeedProfile, TagFeed};
use feed_reconciler::identity::{IdentityCache, PublisherIdentityRecord, TrustFailure};
use feed_reconciler::model::{ChainId, FeedItem, Hash256, ItemKind, ItemRef};
use feed_reconciler::reconcile::{FeedSession, LoadOutcome, ReconcileWarning, SessionPhase};
use feed_reconciler::transport::{MemoryNetwork, MemoryShard, PeerBehavior};
use feed_reconciler::FeedError;

fn chain(label: &str) -> ChainId {
    Hash256::from_label(label)
}

fn post(label: &str, chain_label: &str, ts: u64, publisher: &str) -> FeedItem {
    FeedItem::new(
        Hash256::from_label(label),
        ItemKind::Post,
        chain(chain_label),
        ts,
        Hash256::from_label(publisher),
    )
}

fn reply(label: &str, chain_label: &str, ts: u64, publisher: &str, parent: &FeedItem) -> FeedItem {
    FeedItem::new(
        Hash256::from_label(label),
        ItemKind::Reply,
        chain(chain_label),
        ts,
        Hash256::from_label(publisher),
    )
    .with_parent(ItemRef::new(parent.chain_id, parent.id))
}

fn network() -> Arc<MemoryNetwork> {
    Arc::new(
        MemoryNetwork::new("feed")
            .with_latency(Duration::from_millis(1))
            .with_timeout(Duration::from_millis(60)),
    )
}

fn config(quorum: usize) -> Config {
    let mut config = Config::default();
    config.reconcile.quorum = quorum;
    config.reconcile.round_timeout_ms = 2_000;
    config
}

fn session_with(
    profile: Arc<dyn FeedProfile>,
    network: &Arc<MemoryNetwork>,
    cache: &Arc<IdentityCache>,
    config: Config,
) -> Arc<FeedSession> {
    Arc::new(FeedSession::new(profile, network.clone(), cache.clone(), config))
}

fn content_session(network: &Arc<MemoryNetwork>, quorum: usize) -> Arc<FeedSession> {
    session_with(
        Arc::new(ContentFeed::subscriptions()),
        network,
        &Arc::new(IdentityCache::with_defaults()),
        config(quorum),
    )
}

async fn published(session: &FeedSession, filter: FeedFilter) -> feed_reconciler::FeedReport {
    match session.load(filter, None).await.unwrap() {
        LoadOutcome::Published(report) => report,
        LoadOutcome::Dropped => panic!("load was dropped"),
    }
}

// =============================================================================
// Quorum Gathering
// =============================================================================

#[tokio::test]
async fn test_three_shards_three_confirmations_each() {
    let network = network();
    let a1 = post("a1", "a", 20, "alice");
    let a2 = post("a2", "a", 10, "alice");
    let c1 = reply("c1", "c", 21, "carol", &a1);

    let scripted = |items: Vec<FeedItem>| PeerBehavior::Scripted(items);
    network.add_shard(MemoryShard::new(chain("a")).with_peers(vec![
        scripted(vec![a1.clone(), a2.clone()]),
        scripted(vec![a1.clone(), a2.clone()]),
        scripted(vec![a1.clone(), a2.clone()]),
    ]));
    network.add_shard(MemoryShard::new(chain("b")).with_peers(vec![
        scripted(vec![]),
        scripted(vec![]),
        scripted(vec![]),
    ]));
    network.add_shard(MemoryShard::new(chain("c")).with_peers(vec![
        scripted(vec![c1.clone()]),
        scripted(vec![c1.clone()]),
        scripted(vec![c1.clone(), a1.clone()]),
    ]));

    let session = content_session(&network, 3);
    let report = published(&session, FeedFilter::Subscriptions).await;

    assert_eq!(report.summary.arrivals, 9);
    assert!(report.summary.quorate);
    assert!(report.summary.warnings.is_empty());
    assert_eq!(report.feed.ids(), vec![a1.id, a2.id]);

    let top = report.feed.get(0).unwrap();
    assert_eq!(top.replies.len(), 1);
    assert_eq!(top.replies[0].item.id, c1.id);
    assert_eq!(network.scatter_requests().len(), 3);
    assert!(network.scatter_requests().iter().all(|r| r.quorum == 3));
}

#[tokio::test]
async fn test_silent_shard_is_excluded() {
    let network = network();
    let a1 = post("a1", "a", 5, "alice");
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![a1.clone()]));
    network.add_shard(
        MemoryShard::new(chain("b"))
            .with_items(vec![post("b1", "b", 9, "bob")])
            .with_peers(vec![PeerBehavior::Honest, PeerBehavior::Silent, PeerBehavior::Silent]),
    );

    let session = content_session(&network, 2);
    let report = published(&session, FeedFilter::Subscriptions).await;

    assert!(!report.summary.quorate);
    assert_eq!(report.summary.timed_out, vec![chain("b")]);
    assert_eq!(report.feed.ids(), vec![a1.id]);
    assert!(matches!(
        report.summary.warnings.as_slice(),
        [ReconcileWarning::QuorumTimeout { arrivals: 1, quorum: 2, purged: 1, .. }]
    ));
}

#[tokio::test]
async fn test_every_shard_silent_fails_with_timeout() {
    let network = network();
    for label in ["a", "b"] {
        network.add_shard(MemoryShard::new(chain(label)).with_peers(vec![PeerBehavior::Silent; 3]));
    }

    let session = content_session(&network, 2);
    let err = session.load(FeedFilter::Subscriptions, None).await.unwrap_err();
    assert_eq!(err.code(), "E_TIMEOUT");
    assert!(!session.is_processing());
}

#[tokio::test]
async fn test_global_feed_requires_agreement() {
    let network = network();
    let honest = post("real", "a", 10, "alice");
    let fake = post("fake", "a", 99, "mallory");
    network.add_shard(
        MemoryShard::new(chain("a"))
            .with_items(vec![honest.clone()])
            .with_peers(vec![PeerBehavior::Honest, PeerBehavior::Inject(vec![fake])]),
    );

    let session = session_with(
        Arc::new(ContentFeed::global(2)),
        &network,
        &Arc::new(IdentityCache::with_defaults()),
        config(2),
    );
    let report = published(&session, FeedFilter::Global).await;
    assert_eq!(report.feed.ids(), vec![honest.id]);
}

// =============================================================================
// Backfill
// =============================================================================

#[tokio::test]
async fn test_parent_on_other_shard_is_backfilled() {
    let network = network();
    let parent = post("p", "b", 1, "alice");
    let child = reply("r", "a", 2, "bob", &parent);
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![child.clone()]));
    network.add_shard(MemoryShard::new(chain("b")).with_items(vec![parent.clone()]));

    let session = content_session(&network, 2);
    let filter = FeedFilter::Publisher {
        publisher_id: Hash256::from_label("bob"),
    };
    let report = published(&session, filter).await;

    assert_eq!(report.summary.backfill_rounds, 1);
    assert!(report.summary.unresolved_refs.is_empty());
    assert_eq!(report.feed.ids(), vec![parent.id]);
    assert_eq!(report.feed.get(0).unwrap().replies[0].item.id, child.id);
}

#[tokio::test]
async fn test_missing_parent_stays_top_level() {
    let network = network();
    let lost = post("lost", "b", 1, "alice");
    let child = reply("r", "a", 2, "bob", &lost);
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![child.clone()]));
    network.add_shard(MemoryShard::new(chain("b")));

    let mut config = config(2);
    config.reconcile.max_backfill_rounds = 2;
    let session = session_with(
        Arc::new(ContentFeed::subscriptions()),
        &network,
        &Arc::new(IdentityCache::with_defaults()),
        config,
    );
    let report = published(&session, FeedFilter::Subscriptions).await;

    assert_eq!(report.feed.ids(), vec![child.id]);
    assert_eq!(report.summary.unresolved_refs.len(), 1);
    assert!(report
        .summary
        .warnings
        .iter()
        .any(|w| w.code() == "W_BACKFILL_EXHAUSTED"));
}

// =============================================================================
// Identity Trust
// =============================================================================

fn signed(seed: u8, chain_label: &str, claims: &str, name: &str) -> PublisherIdentityRecord {
    PublisherIdentityRecord::sign(
        &SigningKey::from_bytes(&[seed; 32]),
        chain(chain_label),
        Hash256::from_label(claims),
        name,
        name.to_lowercase(),
    )
}

#[tokio::test]
async fn test_trusted_identity_is_attached_and_cached() {
    let network = network();
    let record = signed(1, "a", "alice", "Alice");
    let item = post("a1", "a", 5, "alice").with_publisher_info(ItemRef::new(chain("a"), record.id));
    network.add_shard(
        MemoryShard::new(chain("a"))
            .with_items(vec![item])
            .with_identity(record.clone()),
    );

    let cache = Arc::new(IdentityCache::with_defaults());
    let session = session_with(Arc::new(ContentFeed::subscriptions()), &network, &cache, config(2));
    let report = published(&session, FeedFilter::Subscriptions).await;

    let publisher = report.feed.get(0).unwrap().publisher.as_ref().unwrap();
    assert_eq!(publisher.name, "Alice");
    assert_eq!(report.summary.unresolved_identities, 0);
    assert!(cache.contains(&record.id));

    // a fresh session resolves from the cache even once the record is gone
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![
        post("a1", "a", 5, "alice").with_publisher_info(ItemRef::new(chain("a"), record.id)),
    ]));
    let second = session_with(Arc::new(ContentFeed::subscriptions()), &network, &cache, config(2));
    let report = published(&second, FeedFilter::Subscriptions).await;
    assert!(report.feed.get(0).unwrap().publisher.is_some());
}

#[tokio::test]
async fn test_forged_identity_is_rejected() {
    let network = network();
    // signed by mallory, claims to describe mallory, referenced by alice's post
    let forged = signed(9, "a", "mallory", "Alice");
    let item = post("a1", "a", 5, "alice").with_publisher_info(ItemRef::new(chain("a"), forged.id));
    network.add_shard(
        MemoryShard::new(chain("a"))
            .with_items(vec![item])
            .with_identity(forged.clone()),
    );

    let cache = Arc::new(IdentityCache::with_defaults());
    let session = session_with(Arc::new(ContentFeed::subscriptions()), &network, &cache, config(2));
    let report = published(&session, FeedFilter::Subscriptions).await;

    assert_eq!(report.feed.len(), 1);
    assert!(report.feed.get(0).unwrap().publisher.is_none());
    assert!(cache.is_empty());
    assert_eq!(report.summary.unresolved_identities, 1);
    assert_eq!(
        report.summary.warnings,
        vec![ReconcileWarning::TrustRejected {
            info_id: forged.id,
            failure: TrustFailure::BackReference {
                expected: Hash256::from_label("alice"),
                found: Hash256::from_label("mallory"),
            },
        }]
    );
}

#[tokio::test]
async fn test_tampered_identity_fails_content_address() {
    let network = network();
    let mut tampered = signed(3, "a", "alice", "Alice");
    let info = ItemRef::new(chain("a"), tampered.id);
    tampered.name = "Alicia".into();
    network.add_shard(
        MemoryShard::new(chain("a"))
            .with_items(vec![post("a1", "a", 5, "alice").with_publisher_info(info)])
            .with_identity(tampered),
    );

    let session = content_session(&network, 2);
    let report = published(&session, FeedFilter::Subscriptions).await;
    assert!(matches!(
        report.summary.warnings.as_slice(),
        [ReconcileWarning::TrustRejected {
            failure: TrustFailure::ContentAddress,
            ..
        }]
    ));
}

// =============================================================================
// Session Lifecycle
// =============================================================================

#[tokio::test]
async fn test_concurrent_load_is_dropped() {
    let network = network();
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![post("a1", "a", 1, "alice")]));
    let session = content_session(&network, 2);

    let (first, second) = tokio::join!(
        session.load(FeedFilter::Subscriptions, None),
        session.load(FeedFilter::Subscriptions, None)
    );
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_dropped()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.report().is_some()).count(), 1);

    // reusable once idle
    assert!(!session.is_processing());
    assert!(session.load(FeedFilter::Subscriptions, None).await.unwrap().report().is_some());
}

#[tokio::test]
async fn test_refresh_replaces_previous_feed() {
    let network = network();
    let alice1 = post("alice1", "a", 2, "alice");
    let bob1 = post("bob1", "a", 1, "bob");
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![alice1.clone(), bob1.clone()]));
    let session = content_session(&network, 2);

    let alice = FeedFilter::Publisher { publisher_id: Hash256::from_label("alice") };
    let report = published(&session, alice).await;
    assert_eq!(report.feed.ids(), vec![alice1.id]);

    let bob = FeedFilter::Publisher { publisher_id: Hash256::from_label("bob") };
    let report = published(&session, bob).await;
    assert_eq!(report.feed.ids(), vec![bob1.id]);
    assert_eq!(session.feed().await.ids(), vec![bob1.id]);
    assert!(session.locate(&alice1.id.to_hex()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_feed() {
    let network = network();
    let a1 = post("a1", "a", 1, "alice");
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![a1.clone()]));
    let session = content_session(&network, 2);
    published(&session, FeedFilter::Subscriptions).await;

    network.remove_shard(&chain("a"));
    network.add_shard(MemoryShard::new(chain("a")).with_peers(vec![PeerBehavior::Silent; 3]));
    let err = session.load(FeedFilter::Subscriptions, None).await.unwrap_err();
    assert_eq!(err.code(), "E_TIMEOUT");
    assert_eq!(session.feed().await.ids(), vec![a1.id]);
}

#[tokio::test]
async fn test_cancelled_load_leaves_session_usable() {
    let network = network();
    network.add_shard(MemoryShard::new(chain("a")).with_peers(vec![PeerBehavior::Silent; 3]));
    let session = content_session(&network, 2);

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        session.load(FeedFilter::Subscriptions, None),
    )
    .await;
    assert!(cancelled.is_err(), "silent shard should outlast the caller");
    assert!(!session.is_processing());
    assert_eq!(session.phase().await, SessionPhase::Idle);

    let a1 = post("a1", "a", 1, "alice");
    network.remove_shard(&chain("a"));
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![a1.clone()]));
    let report = published(&session, FeedFilter::Subscriptions).await;
    assert_eq!(report.feed.ids(), vec![a1.id]);

    // a cancelled page load is recoverable too
    network.add_shard(MemoryShard::new(chain("b")).with_peers(vec![PeerBehavior::Silent; 3]));
    let token = session.next_page().await;
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        session.load(FeedFilter::Subscriptions, Some(token)),
    )
    .await;
    assert!(cancelled.is_err());
    network.remove_shard(&chain("b"));

    let token = session.next_page().await;
    let outcome = session.load(FeedFilter::Subscriptions, Some(token)).await.unwrap();
    assert_eq!(outcome.report().unwrap().appended, Some(false));
    assert_eq!(session.feed().await.ids(), vec![a1.id]);
}

#[tokio::test]
async fn test_no_shards_requests_state_refresh() {
    let network = network();
    let session = content_session(&network, 2);

    let err = session.load(FeedFilter::Subscriptions, None).await.unwrap_err();
    assert!(matches!(err, FeedError::NoShards(_)));
    assert_eq!(err.code(), "E_CHAINS_ABSENT");
    assert_eq!(network.state_requests(), 1);
}

#[tokio::test]
async fn test_caller_misuse_never_reaches_network() {
    let network = network();
    network.add_shard(MemoryShard::new(chain("a")));
    let session = session_with(
        Arc::new(TagFeed::new(2)),
        &network,
        &Arc::new(IdentityCache::with_defaults()),
        config(2),
    );

    let err = session
        .load(FeedFilter::Tag { tag: "two words".into() }, None)
        .await
        .unwrap_err();
    assert!(err.is_caller_misuse());
    assert!(session.load(FeedFilter::Global, None).await.unwrap_err().is_caller_misuse());
    assert!(network.scatter_requests().is_empty());

    let err = session.locate("not-hex").await.unwrap_err();
    assert_eq!(err.code(), "E_INVALID_ID");
}

#[tokio::test]
async fn test_tag_filter_is_normalised() {
    let network = network();
    let tagged = post("t", "a", 3, "alice").with_payload(serde_json::json!({ "tags": ["rust"] }));
    network.add_shard(
        MemoryShard::new(chain("a")).with_items(vec![tagged.clone(), post("u", "a", 4, "alice")]),
    );
    let session = session_with(
        Arc::new(TagFeed::new(2)),
        &network,
        &Arc::new(IdentityCache::with_defaults()),
        config(2),
    );

    let report = published(&session, FeedFilter::Tag { tag: "#Rust".into() }).await;
    assert_eq!(report.feed.ids(), vec![tagged.id]);
    assert_eq!(
        network.scatter_requests()[0].filter,
        FeedFilter::Tag { tag: "rust".into() }
    );
}

#[tokio::test]
async fn test_pages_append_until_exhausted() {
    let network = network();
    let items = (1..=5).map(|i| post(&format!("p{i}"), "a", i, "alice"));
    network.add_shard(MemoryShard::new(chain("a")).with_items(items));
    let mut config = config(2);
    config.reconcile.page_size = 2;
    let session = session_with(
        Arc::new(ContentFeed::subscriptions()),
        &network,
        &Arc::new(IdentityCache::with_defaults()),
        config,
    );

    let first = published(&session, FeedFilter::Subscriptions).await;
    assert_eq!(first.feed.len(), 2);
    assert_eq!(first.appended, None);

    let mut sizes = Vec::new();
    let mut appended = Vec::new();
    for _ in 0..3 {
        let token = session.next_page().await;
        assert!(!token.is_empty());
        let outcome = session.load(FeedFilter::Subscriptions, Some(token)).await.unwrap();
        let report = outcome.report().unwrap();
        sizes.push(report.feed.len());
        appended.push(report.appended);
    }
    assert_eq!(sizes, vec![4, 5, 5]);
    assert_eq!(appended, vec![Some(true), Some(true), Some(false)]);

    let ids = session.feed().await.ids();
    let expected: Vec<_> = (1..=5).rev().map(|i| Hash256::from_label(&format!("p{i}"))).collect();
    assert_eq!(ids, expected);

    let found = session.locate(&Hash256::from_label("p3").to_hex()).await.unwrap();
    assert_eq!(found.unwrap().timestamp, 3);
}

#[tokio::test]
async fn test_observers_see_new_items() {
    let network = network();
    let a1 = post("a1", "a", 1, "alice");
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![a1.clone()]));
    let session = content_session(&network, 2);
    let mut events = session.subscribe();

    published(&session, FeedFilter::Subscriptions).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&FeedEvent::ItemNew(a1.key())));
    assert!(seen.contains(&FeedEvent::LargeUpdate));
}

#[tokio::test]
async fn test_spawn_load_reports_through_callbacks() {
    let network = network();
    network.add_shard(MemoryShard::new(chain("a")).with_items(vec![post("a1", "a", 1, "alice")]));
    let session = content_session(&network, 2);

    let (ready_tx, ready_rx) = oneshot::channel();
    session
        .spawn_load(
            FeedFilter::Subscriptions,
            None,
            move |report| {
                let _ = ready_tx.send(report.feed.len());
            },
            |code, message| panic!("unexpected error {code}: {message}"),
        )
        .await
        .unwrap();
    assert_eq!(ready_rx.await.unwrap(), 1);

    let empty = content_session(&Arc::new(MemoryNetwork::new("feed")), 2);
    let (error_tx, error_rx) = oneshot::channel();
    empty
        .spawn_load(
            FeedFilter::Subscriptions,
            None,
            |_| panic!("nothing to publish"),
            move |code, _| {
                let _ = error_tx.send(code);
            },
        )
        .await
        .unwrap();
    assert_eq!(error_rx.await.unwrap(), "E_CHAINS_ABSENT");
}
