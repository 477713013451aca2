//! Demo network fixture integration tests
//!
//! Loads `demos/network.json` and reconciles it end to end with the
//! content and global feeds.

use std::path::Path;
use std::sync::Arc;

use feed_reconciler::config::Config;
use feed_reconciler::feed::{ContentFeed, FeedFilter, FeedProfile};
use feed_reconciler::identity::{IdentityCache, TrustFailure};
use feed_reconciler::model::Hash256;
use feed_reconciler::reconcile::{FeedReport, FeedSession, LoadOutcome, ReconcileWarning};
use feed_reconciler::transport::NetworkFixture;

async fn load_demo(profile: Arc<dyn FeedProfile>, filter: FeedFilter) -> FeedReport {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/network.json");
    let fixture = NetworkFixture::load(&path).unwrap();
    let network = Arc::new(fixture.build().unwrap());

    let mut config = Config::default();
    config.network.app_name = fixture.app_name.clone();
    config.reconcile.round_timeout_ms = 5_000;

    let cache = Arc::new(IdentityCache::with_defaults());
    let session = FeedSession::new(profile, network, cache, config);
    match session.load(filter, None).await.unwrap() {
        LoadOutcome::Published(report) => report,
        LoadOutcome::Dropped => panic!("load was dropped"),
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_demo_subscriptions_feed() {
    let report = load_demo(Arc::new(ContentFeed::subscriptions()), FeedFilter::Subscriptions).await;

    assert!(report.summary.quorate);
    assert_eq!(report.summary.backfill_rounds, 0);

    // union admits what a single lying peer injected
    assert!(report.feed.ids().contains(&Hash256::from_label("fake")));

    let a1 = report
        .feed
        .iter()
        .find(|e| e.item.id == Hash256::from_label("a1"))
        .unwrap();
    assert_eq!(a1.publisher.as_ref().unwrap().name, "Alice");
    assert_eq!(a1.replies[0].item.id, Hash256::from_label("b2"));

    let b1 = report
        .feed
        .iter()
        .find(|e| e.item.id == Hash256::from_label("b1"))
        .unwrap();
    assert_eq!(b1.replies.len(), 1);
    assert_eq!(b1.replies[0].item.id, Hash256::from_label("g1"));

    let rejected: Vec<_> = report
        .summary
        .warnings
        .iter()
        .filter_map(|w| match w {
            ReconcileWarning::TrustRejected { failure, .. } => Some(*failure),
            _ => None,
        })
        .collect();
    assert_eq!(
        rejected,
        vec![TrustFailure::BackReference {
            expected: Hash256::from_label("mallory"),
            found: Hash256::from_label("bob"),
        }]
    );
}

// =============================================================================
// Global
// =============================================================================

#[tokio::test]
async fn test_demo_global_feed_drops_injected_item() {
    let report = load_demo(Arc::new(ContentFeed::global(2)), FeedFilter::Global).await;
    let ids = report.feed.ids();
    assert!(!ids.contains(&Hash256::from_label("fake")));
    assert!(ids.contains(&Hash256::from_label("a1")));
    assert!(ids.contains(&Hash256::from_label("b1")));
}
