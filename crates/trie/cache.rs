use crate::{merkle_value::MerkleValue, nibbles::Nibbles, node::DecodedNode};
use ethereum_types::H256;
use std::collections::BTreeMap;
use tracing::trace;

/// A node change not yet flushed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    Update(PendingNode),
    Remove,
}

/// Created or rewritten node together with its freshly computed merkle
/// value, so readers never go to the store for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNode {
    pub merkle_value: MerkleValue,
    pub node: DecodedNode,
}

impl PendingNode {
    pub fn new(merkle_value: MerkleValue, node: DecodedNode) -> Self {
        Self { merkle_value, node }
    }
}

/// Where the trie root currently lives, as far as pending changes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRoot {
    /// The pending entry at this full key is the current root.
    At(Nibbles),
    /// Every node was deleted; the trie is pending-empty.
    Cleared,
}

/// Ordered overlay of not-yet-persisted node changes, keyed by each node's
/// full key path. Reads consult this before the store; mutations accumulate
/// here until a flush.
#[derive(Debug, Default)]
pub struct TrieChanges {
    changes: BTreeMap<Nibbles, PendingChange>,
    preimages: BTreeMap<H256, Vec<u8>>,
    root: Option<PendingRoot>,
}

impl TrieChanges {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.root.is_none()
    }

    pub fn get(&self, key: &Nibbles) -> Option<&PendingChange> {
        self.changes.get(key)
    }

    pub fn insert(&mut self, key: Nibbles, change: PendingChange) {
        self.changes.insert(key, change);
    }

    pub fn extend(&mut self, entries: BTreeMap<Nibbles, PendingChange>) {
        trace!(entries = entries.len(), "merging changes into overlay");
        self.changes.extend(entries);
    }

    pub fn remove_entry(&mut self, key: &Nibbles) {
        self.changes.remove(key);
    }

    /// Pending-update ancestors of `key`, shallowest first. Only strict
    /// prefixes of `key` qualify; an entry at `key` itself is not returned.
    pub fn ancestors(&self, key: &Nibbles) -> Vec<(Nibbles, PendingNode)> {
        let mut out = Vec::new();
        for len in 0..key.len() {
            let prefix = key.slice(0, len);
            if let Some(PendingChange::Update(update)) = self.changes.get(&prefix) {
                out.push((prefix, update.clone()));
            }
        }
        out
    }

    /// The pending node sitting under `nibble` of the node at `parent_key`,
    /// if that child itself has a pending update. A pending entry is the
    /// child exactly when its key decomposes as parent, nibble, partial key.
    pub fn child_at(&self, parent_key: &Nibbles, nibble: u8) -> Option<(Nibbles, PendingNode)> {
        let prefix = parent_key.append_new(nibble);
        for (key, change) in self
            .changes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            if let PendingChange::Update(update) = change {
                if *key == prefix.concat(&update.node.partial_key) {
                    return Some((key.clone(), update.clone()));
                }
            }
        }
        None
    }

    pub fn root(&self) -> Option<&PendingRoot> {
        self.root.as_ref()
    }

    pub fn set_root(&mut self, root: PendingRoot) {
        self.root = Some(root);
    }

    /// The pending root node, when the root was rewritten this overlay.
    pub fn root_node(&self) -> Option<(&Nibbles, &PendingNode)> {
        match self.root.as_ref()? {
            PendingRoot::At(key) => match self.changes.get(key) {
                Some(PendingChange::Update(update)) => Some((key, update)),
                _ => None,
            },
            PendingRoot::Cleared => None,
        }
    }

    pub fn record_preimage(&mut self, hash: H256, value: Vec<u8>) {
        self.preimages.insert(hash, value);
    }

    pub fn preimage(&self, hash: &H256) -> Option<&[u8]> {
        self.preimages.get(hash).map(Vec::as_slice)
    }

    pub fn changes(&self) -> impl Iterator<Item = (&Nibbles, &PendingChange)> {
        self.changes.iter()
    }

    pub fn preimages(&self) -> impl Iterator<Item = (&H256, &Vec<u8>)> {
        self.preimages.iter()
    }

    pub fn clear(&mut self) {
        trace!(entries = self.changes.len(), "clearing overlay");
        self.changes.clear();
        self.preimages.clear();
        self.root = None;
    }
}
