//! JSON description of a simulated network.
//!
//! Identifiers are written as labels and hashed, so a fixture reads like
//! `"parent": "alpha/a1"` rather than a pair of digests. Identity records are
//! signed at build time from a seed label; items point at them by `identity`
//! label because a record's id is only known once it is signed.
//!
//! ```json
//! {
//!   "app_name": "feed",
//!   "shards": [{
//!     "chain": "alpha",
//!     "peers": 3,
//!     "items": [
//!       { "id": "a1", "kind": "post", "timestamp": 100, "publisher": "alice",
//!         "identity": "alice" }
//!     ],
//!     "identities": [
//!       { "label": "alice", "publisher": "alice", "name": "Alice", "seed": "alice-key" }
//!     ],
//!     "peer_overrides": [{ "peer": 2, "behavior": "silent" }]
//!   }]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::memory::{MemoryNetwork, MemoryShard, PeerBehavior};
use crate::error::{FeedError, Result};
use crate::identity::PublisherIdentityRecord;
use crate::model::{ChainId, FeedItem, Hash256, ItemId, ItemKind, ItemRef};

fn default_app_name() -> String {
    "feed".to_string()
}

fn default_latency_ms() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_peers() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFixture {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    /// How long a shard short of answering peers waits before timing out
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub shards: Vec<ShardFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardFixture {
    pub chain: String,
    #[serde(default = "default_peers")]
    pub peers: usize,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub items: Vec<ItemFixture>,
    #[serde(default)]
    pub identities: Vec<IdentityFixture>,
    #[serde(default)]
    pub peer_overrides: Vec<PeerFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFixture {
    pub id: String,
    pub kind: ItemKind,
    pub timestamp: u64,
    pub publisher: String,
    /// Defaults to the enclosing shard
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub score: u64,
    /// `chain/label`
    #[serde(default)]
    pub parent: Option<String>,
    /// `chain/label`
    #[serde(default)]
    pub root: Option<String>,
    /// Label of an identity record declared anywhere in the fixture
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
    /// Publisher on the other side of a conversation
    #[serde(default)]
    pub counterpart: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityFixture {
    pub label: String,
    /// Publisher the signed record claims to describe
    pub publisher: String,
    pub name: String,
    #[serde(default)]
    pub alias: String,
    /// Signing keys are derived from this label
    pub seed: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerFixture {
    pub peer: usize,
    #[serde(flatten)]
    pub behavior: BehaviorFixture,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum BehaviorFixture {
    Honest,
    Silent,
    Omit { items: Vec<String> },
    Inject { items: Vec<ItemFixture> },
    Scripted { items: Vec<ItemFixture> },
}

/// Either 64 hex digits or a label to hash.
fn fixture_id(s: &str) -> Hash256 {
    s.parse().unwrap_or_else(|_| Hash256::from_label(s))
}

fn fixture_ref(s: &str) -> Result<ItemRef> {
    let (chain, id) = s.split_once('/').ok_or_else(|| {
        FeedError::Config(format!("fixture reference must be chain/label, got {s}"))
    })?;
    Ok(ItemRef::new(fixture_id(chain), fixture_id(id)))
}

impl NetworkFixture {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Sign every identity record, keyed by fixture label.
    fn identities(&self) -> Result<BTreeMap<String, PublisherIdentityRecord>> {
        let mut records = BTreeMap::new();
        for shard in &self.shards {
            let chain_id = fixture_id(&shard.chain);
            for identity in &shard.identities {
                let key = SigningKey::from_bytes(Hash256::from_label(&identity.seed).as_bytes());
                let record = PublisherIdentityRecord::sign(
                    &key,
                    chain_id,
                    fixture_id(&identity.publisher),
                    identity.name.clone(),
                    identity.alias.clone(),
                );
                if records.insert(identity.label.clone(), record).is_some() {
                    return Err(FeedError::Config(format!(
                        "duplicate identity label {}",
                        identity.label
                    )));
                }
            }
        }
        Ok(records)
    }

    fn item(
        fixture: &ItemFixture,
        shard_chain: ChainId,
        identities: &BTreeMap<String, PublisherIdentityRecord>,
    ) -> Result<FeedItem> {
        let chain_id = fixture.chain.as_deref().map(fixture_id).unwrap_or(shard_chain);
        let mut item = FeedItem::new(
            fixture_id(&fixture.id),
            fixture.kind,
            chain_id,
            fixture.timestamp,
            fixture_id(&fixture.publisher),
        )
        .with_score(fixture.score);

        if let Some(parent) = &fixture.parent {
            item = item.with_parent(fixture_ref(parent)?);
        }
        if let Some(root) = &fixture.root {
            item = item.with_root(fixture_ref(root)?);
        }
        if let Some(label) = &fixture.identity {
            let record = identities
                .get(label)
                .ok_or_else(|| FeedError::Config(format!("unknown identity label {label}")))?;
            item = item.with_publisher_info(ItemRef::new(record.chain_id, record.id));
        }

        let mut payload = serde_json::Map::new();
        if let Some(text) = &fixture.text {
            payload.insert("text".into(), text.clone().into());
        }
        if !fixture.tags.is_empty() {
            payload.insert("tags".into(), fixture.tags.clone().into());
        }
        if let Some(counterpart) = &fixture.counterpart {
            payload.insert("counterpart".into(), fixture_id(counterpart).to_hex().into());
        }
        if !payload.is_empty() {
            item = item.with_payload(serde_json::Value::Object(payload));
        }
        Ok(item)
    }

    fn items(
        fixtures: &[ItemFixture],
        shard_chain: ChainId,
        identities: &BTreeMap<String, PublisherIdentityRecord>,
    ) -> Result<Vec<FeedItem>> {
        fixtures
            .iter()
            .map(|f| Self::item(f, shard_chain, identities))
            .collect()
    }

    /// Materialise the fixture as a [`MemoryNetwork`].
    pub fn build(&self) -> Result<MemoryNetwork> {
        let identities = self.identities()?;
        let network = MemoryNetwork::new(self.app_name.clone())
            .with_latency(Duration::from_millis(self.latency_ms))
            .with_timeout(Duration::from_millis(self.timeout_ms));

        for shard in &self.shards {
            let chain_id = fixture_id(&shard.chain);
            let mut peers = vec![PeerBehavior::Honest; shard.peers];

            for over in &shard.peer_overrides {
                let slot = peers.get_mut(over.peer).ok_or_else(|| {
                    FeedError::Config(format!(
                        "shard {} has {} peers, cannot override peer {}",
                        shard.chain, shard.peers, over.peer
                    ))
                })?;
                *slot = match &over.behavior {
                    BehaviorFixture::Honest => PeerBehavior::Honest,
                    BehaviorFixture::Silent => PeerBehavior::Silent,
                    BehaviorFixture::Omit { items } => PeerBehavior::Omit(
                        items.iter().map(|s| fixture_id(s)).collect::<BTreeSet<ItemId>>(),
                    ),
                    BehaviorFixture::Inject { items } => {
                        PeerBehavior::Inject(Self::items(items, chain_id, &identities)?)
                    }
                    BehaviorFixture::Scripted { items } => {
                        PeerBehavior::Scripted(Self::items(items, chain_id, &identities)?)
                    }
                };
            }

            let mut memory = MemoryShard::new(chain_id)
                .with_peers(peers)
                .with_latency(Duration::from_millis(shard.latency_ms))
                .with_items(Self::items(&shard.items, chain_id, &identities)?);
            for identity in &shard.identities {
                if let Some(record) = identities.get(&identity.label) {
                    memory = memory.with_identity(record.clone());
                }
            }
            network.add_shard(memory);
        }

        info!(
            app = %self.app_name,
            shards = self.shards.len(),
            identities = identities.len(),
            "fixture network built"
        );
        Ok(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RequestProcessor;

    const FIXTURE: &str = r#"{
        "app_name": "feed",
        "shards": [
            {
                "chain": "alpha",
                "items": [
                    {
                        "id": "a1", "kind": "post", "timestamp": 100, "publisher": "alice",
                        "identity": "alice", "tags": ["Rust"]
                    },
                    {
                        "id": "r1", "kind": "reply", "timestamp": 120, "publisher": "bob",
                        "parent": "alpha/a1"
                    }
                ],
                "identities": [
                    { "label": "alice", "publisher": "alice", "name": "Alice", "seed": "alice-key" }
                ],
                "peer_overrides": [{ "peer": 2, "behavior": "omit", "items": ["r1"] }]
            },
            { "chain": "beta", "peers": 2 }
        ]
    }"#;

    #[tokio::test]
    async fn test_build_network() {
        let fixture = NetworkFixture::from_json(FIXTURE).unwrap();
        let network = fixture.build().unwrap();
        let chains = network.collect_chains("feed").await;
        assert_eq!(chains.len(), 2);
        assert!(chains.contains(&Hash256::from_label("alpha")));
    }

    #[test]
    fn test_items_point_at_signed_identity() {
        let fixture = NetworkFixture::from_json(FIXTURE).unwrap();
        let identities = fixture.identities().unwrap();
        let record = &identities["alice"];
        assert!(record.verify_content_address());
        assert!(record.verify_signature());

        let item = NetworkFixture::item(
            &fixture.shards[0].items[0],
            Hash256::from_label("alpha"),
            &identities,
        )
        .unwrap();
        assert_eq!(item.publisher_info.unwrap().id, record.id);
        assert_eq!(item.tags().collect::<Vec<_>>(), vec!["Rust"]);
    }

    #[test]
    fn test_unknown_identity_label_rejected() {
        let json = r#"{ "shards": [{ "chain": "a", "items": [
            { "id": "x", "kind": "post", "timestamp": 1, "publisher": "p", "identity": "ghost" }
        ]}]}"#;
        let err = NetworkFixture::from_json(json).unwrap().build().unwrap_err();
        assert_eq!(err.code(), "E_CONFIG");
    }

    #[test]
    fn test_override_out_of_range_rejected() {
        let json = r#"{ "shards": [{ "chain": "a", "peers": 1,
            "peer_overrides": [{ "peer": 4, "behavior": "silent" }] }]}"#;
        assert!(NetworkFixture::from_json(json).unwrap().build().is_err());
    }
}
