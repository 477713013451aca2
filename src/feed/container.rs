//! Feed container: the merge engine.
//!
//! Holds admitted items keyed by `(id, kind)` with an ordered index of
//! top-level entries and per-parent reply indexes. Partial shard responses
//! are merged as they arrive; the merge is idempotent and the final state
//! does not depend on arrival order.
//!
//! # Threading
//!
//! Replies and messages nest under their parent when the parent is held.
//! Otherwise they stay top-level and are recorded as orphans keyed by the
//! missing parent id until [`FeedContainer::cross_merge`] adopts them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::mem;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::policy::{ConfirmationTally, MergePolicy};
use super::snapshot::{FeedEntry, FeedEvent, FeedSnapshot};
use crate::identity::PublisherProfile;
use crate::model::{
    ChainId, FeedItem, FeedKey, Grouping, ItemId, ItemRef, OrderKey, PeerId, PublisherId,
};
use crate::reconcile::PendingReferenceSet;

type IndexEntry = (OrderKey, FeedKey);

// =============================================================================
// Inputs and outcomes
// =============================================================================

/// One peer's answer to a shard request.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardResponse {
    pub chain_id: ChainId,
    pub peer: PeerId,
    pub items: Vec<FeedItem>,
}

impl ShardResponse {
    pub fn new(chain_id: ChainId, peer: impl Into<PeerId>, items: Vec<FeedItem>) -> Self {
        Self {
            chain_id,
            peer: peer.into(),
            items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub policy: MergePolicy,
    pub grouping: Grouping,
    /// Upper bound on held items; `None` is unbounded
    pub capacity: Option<usize>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            policy: MergePolicy::Union,
            grouping: Grouping::Timestamp,
            capacity: Some(300),
        }
    }
}

/// Counts from a single merge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Items still short of agreement under an intersect policy
    pub deferred: usize,
}

enum Admission {
    Inserted,
    Updated,
    Unchanged,
}

// =============================================================================
// Container
// =============================================================================

pub struct FeedContainer {
    config: ContainerConfig,
    items: HashMap<FeedKey, FeedItem>,
    by_id: HashMap<ItemId, BTreeSet<FeedKey>>,
    roots: BTreeSet<IndexEntry>,
    children: HashMap<FeedKey, BTreeSet<IndexEntry>>,
    parent_of: HashMap<FeedKey, FeedKey>,
    /// missing parent id -> threaded items waiting for it
    orphans: BTreeMap<ItemId, BTreeSet<FeedKey>>,
    profiles: HashMap<ItemId, PublisherProfile>,
    tally: ConfirmationTally,
    round_admitted: HashSet<FeedKey>,
    fresh: BTreeSet<FeedKey>,
    changed: BTreeSet<FeedKey>,
    evicted: HashSet<ItemId>,
    events: Option<broadcast::Sender<FeedEvent>>,
}

impl FeedContainer {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            items: HashMap::new(),
            by_id: HashMap::new(),
            roots: BTreeSet::new(),
            children: HashMap::new(),
            parent_of: HashMap::new(),
            orphans: BTreeMap::new(),
            profiles: HashMap::new(),
            tally: ConfirmationTally::new(),
            round_admitted: HashSet::new(),
            fresh: BTreeSet::new(),
            changed: BTreeSet::new(),
            evicted: HashSet::new(),
            events: None,
        }
    }

    /// Deliver change notifications to `events`.
    pub fn with_events(mut self, events: broadcast::Sender<FeedEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &FeedKey) -> Option<&FeedItem> {
        self.items.get(key)
    }

    pub fn contains_key(&self, key: &FeedKey) -> bool {
        self.items.contains_key(key)
    }

    pub fn contains_id(&self, id: &ItemId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Look up an item by id; content kinds are preferred over reactions.
    pub fn locate(&self, id: &ItemId) -> Option<&FeedItem> {
        let keys = self.by_id.get(id)?;
        keys.iter()
            .find(|k| k.kind.is_content())
            .or_else(|| keys.iter().next())
            .and_then(|k| self.items.get(k))
    }

    pub fn parent_of(&self, key: &FeedKey) -> Option<FeedKey> {
        self.parent_of.get(key).copied()
    }

    /// Threaded items still waiting for their parent.
    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(BTreeSet::len).sum()
    }

    pub fn profile(&self, info_id: &ItemId) -> Option<&PublisherProfile> {
        self.profiles.get(info_id)
    }

    /// Start a new reconciliation round: forget unconfirmed candidates and
    /// which items this round introduced.
    pub fn begin_round(&mut self) {
        self.tally.clear();
        self.round_admitted.clear();
    }

    pub fn clear(&mut self) {
        let events = self.events.take();
        *self = Self::new(self.config.clone());
        self.events = events;
    }

    // -------------------------------------------------------------------------
    // Merging
    // -------------------------------------------------------------------------

    /// Merge one peer's partial response under the container's policy.
    ///
    /// `notify` marks the final merge of a round: observers are told about
    /// everything admitted or changed since the previous notifying merge.
    pub fn merge(&mut self, response: &ShardResponse, notify: bool) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let agreement = self.config.policy.agreement();

        for item in &response.items {
            let admitted = if agreement > 1 {
                if self.tally.confirm(item, &response.peer) < agreement {
                    outcome.deferred += 1;
                    continue;
                }
                match self.tally.take(&item.key()) {
                    Some(confirmed) => self.admit(confirmed),
                    None => continue,
                }
            } else {
                self.admit(item.clone())
            };
            outcome.record(admitted);
        }

        self.enforce_capacity();
        if notify {
            self.announce();
        }

        debug!(
            chain = %response.chain_id.short(),
            peer = %response.peer,
            inserted = outcome.inserted,
            updated = outcome.updated,
            deferred = outcome.deferred,
            "merged shard response"
        );
        outcome
    }

    /// Admit items directly, bypassing the agreement tally. Used for
    /// backfilled references that were requested by id.
    pub fn merge_items(&mut self, items: Vec<FeedItem>, notify: bool) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for item in items {
            let admitted = self.admit(item);
            outcome.record(admitted);
        }
        self.enforce_capacity();
        if notify {
            self.announce();
        }
        outcome
    }

    /// Re-link threaded items whose parent arrived after they did.
    /// Returns the number of items adopted.
    pub fn cross_merge(&mut self, notify: bool) -> usize {
        let ready: Vec<(ItemId, FeedKey)> = self
            .orphans
            .keys()
            .filter_map(|parent_id| self.content_key(parent_id).map(|k| (*parent_id, k)))
            .collect();

        let mut adopted = 0;
        for (parent_id, parent_key) in ready {
            let Some(waiting) = self.orphans.remove(&parent_id) else {
                continue;
            };
            for child in waiting {
                let Some(item) = self.items.get(&child) else {
                    continue;
                };
                let order = OrderKey::of(item, self.config.grouping);
                if child == parent_key || self.is_ancestor(child, parent_key) {
                    warn!(child = %child, parent = %parent_key, "refusing cyclic reply link");
                    continue;
                }
                self.roots.remove(&(order, child));
                self.link(parent_key, child, order);
                adopted += 1;
            }
        }

        if adopted > 0 {
            debug!(adopted, remaining = self.orphan_count(), "cross-merge adopted orphans");
        }
        if notify {
            self.announce();
        }
        adopted
    }

    /// Splice a page of older (or newer) items into this feed without
    /// notifying observers. Returns whether anything was added.
    pub fn merge_append(&mut self, items: Vec<FeedItem>) -> bool {
        let mut added = false;
        for item in items {
            if self.items.contains_key(&item.key()) {
                continue;
            }
            if let Admission::Inserted = self.admit(item) {
                added = true;
            }
        }
        self.cross_merge(false);
        self.fresh.clear();
        self.changed.clear();
        added
    }

    /// Take over a page reconciled into a separate container.
    pub fn absorb(&mut self, page: FeedContainer) -> bool {
        let FeedContainer {
            items, profiles, ..
        } = page;
        let mut items: Vec<FeedItem> = items.into_values().collect();
        items.sort_by_key(|i| (i.timestamp, i.key()));
        self.profiles.extend(profiles);
        self.merge_append(items)
    }

    /// Drop items first admitted this round from `chain_id`.
    pub fn purge_round(&mut self, chain_id: &ChainId) -> usize {
        let keys: Vec<FeedKey> = self
            .round_admitted
            .iter()
            .filter(|k| self.items.get(k).map(|i| &i.chain_id) == Some(chain_id))
            .copied()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    // -------------------------------------------------------------------------
    // References
    // -------------------------------------------------------------------------

    /// Scan held items for references to ids the container does not hold.
    pub fn collect_pending_items<F>(&self, extract: F) -> PendingReferenceSet
    where
        F: Fn(&FeedItem) -> Vec<ItemRef>,
    {
        let mut pending = PendingReferenceSet::new();
        for item in self.items.values() {
            for reference in extract(item) {
                if !self.contains_id(&reference.id) && !self.evicted.contains(&reference.id) {
                    pending.insert(reference.chain_id, reference.id);
                }
            }
        }
        pending
    }

    /// Identity records referenced by held items that have not been attached,
    /// with the publisher each referencing item claims.
    pub fn unresolved_identities(&self) -> Vec<(ItemRef, PublisherId)> {
        let mut unresolved: BTreeMap<ItemId, (ItemRef, PublisherId)> = BTreeMap::new();
        let mut keys: Vec<&FeedKey> = self.items.keys().collect();
        keys.sort();
        for key in keys {
            let Some(item) = self.items.get(key) else {
                continue;
            };
            if let Some(info) = item.publisher_info {
                if !self.profiles.contains_key(&info.id) {
                    unresolved
                        .entry(info.id)
                        .or_insert((info, item.publisher_id));
                }
            }
        }
        unresolved.into_values().collect()
    }

    /// Associate a trusted identity with the items referencing it.
    pub fn attach_identity(&mut self, profile: PublisherProfile) -> usize {
        let info_id = profile.info_id;
        let referencing: Vec<FeedKey> = self
            .items
            .values()
            .filter(|i| i.publisher_info.map(|r| r.id) == Some(info_id))
            .map(FeedItem::key)
            .collect();
        for key in &referencing {
            if !self.fresh.contains(key) {
                self.changed.insert(*key);
            }
        }
        self.profiles.insert(info_id, profile);
        referencing.len()
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    /// Ordered view of the feed, newest first, replies nested oldest first.
    pub fn feed(&self) -> FeedSnapshot {
        FeedSnapshot::new(
            self.roots
                .iter()
                .rev()
                .filter_map(|(_, k)| self.entry(k))
                .collect(),
        )
    }

    fn entry(&self, key: &FeedKey) -> Option<FeedEntry> {
        let item = self.items.get(key)?.clone();
        let publisher = item
            .publisher_info
            .and_then(|r| self.profiles.get(&r.id))
            .cloned();
        let replies = self
            .children
            .get(key)
            .map(|set| set.iter().filter_map(|(_, k)| self.entry(k)).collect())
            .unwrap_or_default();
        Some(FeedEntry {
            item,
            publisher,
            replies,
        })
    }

    /// Per shard, the lowest-ranked (`oldest = true`) or highest-ranked
    /// top-level item held.
    pub fn boundaries(&self, oldest: bool) -> BTreeMap<ChainId, &FeedItem> {
        let mut bounds = BTreeMap::new();
        let mut visit = |key: &FeedKey| {
            if let Some(item) = self.items.get(key) {
                bounds.entry(item.chain_id).or_insert(item);
            }
        };
        if oldest {
            self.roots.iter().for_each(|(_, k)| visit(k));
        } else {
            self.roots.iter().rev().for_each(|(_, k)| visit(k));
        }
        bounds
    }

    /// Flush pending change notifications to observers.
    pub fn announce(&mut self) {
        let fresh = mem::take(&mut self.fresh);
        let changed = mem::take(&mut self.changed);
        let Some(events) = &self.events else {
            return;
        };
        if fresh.is_empty() && changed.is_empty() {
            return;
        }
        // no receivers is not an error
        for key in &fresh {
            let _ = events.send(FeedEvent::ItemNew(*key));
        }
        for key in changed.difference(&fresh) {
            let _ = events.send(FeedEvent::ItemUpdated(*key));
        }
        let _ = events.send(FeedEvent::LargeUpdate);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn admit(&mut self, item: FeedItem) -> Admission {
        let key = item.key();
        let order = OrderKey::of(&item, self.config.grouping);

        if let Some(existing) = self.items.get(&key) {
            if *existing == item {
                return Admission::Unchanged;
            }
            let previous = OrderKey::of(existing, self.config.grouping);
            let threaded = key.kind.is_threaded();
            let held_parent = existing.parent.filter(|_| threaded);
            let parent = item.parent.filter(|_| threaded);

            if held_parent != parent {
                debug!(key = %key, "reply moved to a different parent");
                self.detach(key, previous, held_parent);
                self.items.insert(key, item);
                self.place(key, parent, order);
            } else {
                if previous != order {
                    self.reposition(key, previous, order);
                }
                self.items.insert(key, item);
            }
            if !self.fresh.contains(&key) {
                self.changed.insert(key);
            }
            return Admission::Updated;
        }

        self.evicted.remove(&item.id);
        self.by_id.entry(item.id).or_default().insert(key);
        let parent = item.parent.filter(|_| key.kind.is_threaded());
        self.items.insert(key, item);
        self.place(key, parent, order);

        self.round_admitted.insert(key);
        self.fresh.insert(key);
        Admission::Inserted
    }

    /// Put `key` under its parent, or at the top level while the parent is
    /// missing.
    fn place(&mut self, key: FeedKey, parent: Option<ItemRef>, order: OrderKey) {
        let Some(parent) = parent else {
            self.roots.insert((order, key));
            return;
        };
        match self.content_key(&parent.id) {
            Some(parent_key) if parent_key == key || self.is_ancestor(key, parent_key) => {
                warn!(child = %key, parent = %parent_key, "refusing cyclic reply link");
                self.roots.insert((order, key));
            }
            Some(parent_key) => self.link(parent_key, key, order),
            None => {
                self.orphans.entry(parent.id).or_default().insert(key);
                self.roots.insert((order, key));
                if let Some(events) = &self.events {
                    let _ = events.send(FeedEvent::ItemAbsent(parent));
                }
            }
        }
    }

    /// Undo [`place`](Self::place). Replies of `key` stay attached to it.
    fn detach(&mut self, key: FeedKey, order: OrderKey, parent: Option<ItemRef>) {
        match self.parent_of.remove(&key) {
            Some(parent_key) => {
                if let Some(siblings) = self.children.get_mut(&parent_key) {
                    siblings.remove(&(order, key));
                }
                if !self.fresh.contains(&parent_key) {
                    self.changed.insert(parent_key);
                }
            }
            None => {
                self.roots.remove(&(order, key));
            }
        }
        if let Some(parent) = parent {
            if let Some(waiting) = self.orphans.get_mut(&parent.id) {
                waiting.remove(&key);
                if waiting.is_empty() {
                    self.orphans.remove(&parent.id);
                }
            }
        }
    }

    fn content_key(&self, id: &ItemId) -> Option<FeedKey> {
        self.by_id
            .get(id)?
            .iter()
            .find(|k| k.kind.is_content())
            .copied()
    }

    fn link(&mut self, parent: FeedKey, child: FeedKey, order: OrderKey) {
        self.children.entry(parent).or_default().insert((order, child));
        self.parent_of.insert(child, parent);
        if !self.fresh.contains(&parent) {
            self.changed.insert(parent);
        }
    }

    /// Whether `ancestor` is on the parent chain above `node`.
    fn is_ancestor(&self, ancestor: FeedKey, node: FeedKey) -> bool {
        let mut current = node;
        for _ in 0..=self.parent_of.len() {
            match self.parent_of.get(&current) {
                Some(parent) if *parent == ancestor => return true,
                Some(parent) => current = *parent,
                None => return false,
            }
        }
        false
    }

    fn reposition(&mut self, key: FeedKey, previous: OrderKey, order: OrderKey) {
        let index = match self.parent_of.get(&key) {
            Some(parent) => self.children.entry(*parent).or_default(),
            None => &mut self.roots,
        };
        index.remove(&(previous, key));
        index.insert((order, key));
    }

    fn remove(&mut self, key: &FeedKey) -> Option<FeedItem> {
        let item = self.items.remove(key)?;
        let order = OrderKey::of(&item, self.config.grouping);

        match self.parent_of.remove(key) {
            Some(parent) => {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.remove(&(order, *key));
                }
            }
            None => {
                self.roots.remove(&(order, *key));
            }
        }

        if let Some(parent) = item.parent {
            if let Some(waiting) = self.orphans.get_mut(&parent.id) {
                waiting.remove(key);
                if waiting.is_empty() {
                    self.orphans.remove(&parent.id);
                }
            }
        }

        // replies fall back to top-level orphans
        if let Some(replies) = self.children.remove(key) {
            for (child_order, child) in replies {
                self.parent_of.remove(&child);
                self.roots.insert((child_order, child));
                self.orphans.entry(key.id).or_default().insert(child);
            }
        }

        if let Some(keys) = self.by_id.get_mut(&key.id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_id.remove(&key.id);
            }
        }
        self.round_admitted.remove(key);
        self.fresh.remove(key);
        self.changed.remove(key);
        Some(item)
    }

    fn evict_subtree(&mut self, root: FeedKey) -> usize {
        let mut stack = vec![root];
        let mut order = Vec::new();
        while let Some(key) = stack.pop() {
            order.push(key);
            if let Some(replies) = self.children.get(&key) {
                stack.extend(replies.iter().map(|(_, k)| *k));
            }
        }

        let mut removed = 0;
        for key in order.into_iter().rev() {
            if self.remove(&key).is_some() {
                self.evicted.insert(key.id);
                removed += 1;
            }
        }
        // the evicted thread is gone; nothing waits for it
        self.orphans.remove(&root.id);
        removed
    }

    fn enforce_capacity(&mut self) {
        let Some(capacity) = self.config.capacity else {
            return;
        };
        while self.items.len() > capacity {
            let Some(&(_, oldest)) = self.roots.iter().next() else {
                break;
            };
            let removed = self.evict_subtree(oldest);
            debug!(key = %oldest, removed, capacity, "evicted oldest entry");
        }
    }
}

impl MergeOutcome {
    fn record(&mut self, admission: Admission) {
        match admission {
            Admission::Inserted => self.inserted += 1,
            Admission::Updated => self.updated += 1,
            Admission::Unchanged => {}
        }
    }
}
