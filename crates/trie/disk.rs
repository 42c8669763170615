use crate::{
    accessor::{CHILD_STORAGE_PREFIX, DeleteByPrefixResult, TrieAccessor},
    cache::{PendingChange, PendingNode, PendingRoot, TrieChanges},
    db::TrieDB,
    error::TrieError,
    merkle_value::{MerkleValue, blake2b_256},
    nibbles::Nibbles,
    node::{DecodedNode, StateVersion, StorageValue},
};
use ethereum_types::H256;
use std::{
    collections::{BTreeMap, HashMap},
    mem,
    sync::Arc,
};
use tracing::{debug, trace};

/// Disk-backed trie engine. Node state lives in a content-addressed store
/// (`merkle value -> node encoding`) overlaid with a [`TrieChanges`] cache of
/// pending mutations; traversal consults the overlay first and falls back to
/// the store. Nothing reaches the store before [`persist_changes`].
///
/// [`persist_changes`]: TrieAccessor::persist_changes
pub struct DiskTrie {
    db: Arc<dyn TrieDB>,
    changes: TrieChanges,
    persisted_root: Option<H256>,
    version: StateVersion,
    child_tries: HashMap<Vec<u8>, DiskTrie>,
}

/// One node visited on the way to a key, with children as loaded. The list
/// of traversed nodes is the parent chain used to propagate merkle changes
/// upward after a mutation.
#[derive(Debug, Clone)]
struct TraversedNode {
    full_key: Nibbles,
    partial_key: Nibbles,
    children: [Option<MerkleValue>; 16],
    storage_value: Option<StorageValue>,
}

impl TraversedNode {
    fn from_node(node: &DecodedNode, full_key: Nibbles) -> Self {
        Self {
            full_key,
            partial_key: node.partial_key.clone(),
            children: node.children.clone(),
            storage_value: node.storage_value.clone(),
        }
    }
}

/// Outcome of a finished traversal. `traversed` is the chain of strict
/// ancestors, shallowest first; the sought node itself is never in it.
enum Traversal {
    Found {
        traversed: Vec<TraversedNode>,
        found: TraversedNode,
    },
    NotFound {
        traversed: Vec<TraversedNode>,
    },
}

/// The overlay alone can prove presence or absence; when it cannot, the
/// traversal continues against the store from the deepest overlay ancestor.
enum CacheStep {
    Finished(Traversal),
    Unfinished(Vec<TraversedNode>),
}

impl DiskTrie {
    pub fn new(db: Arc<dyn TrieDB>, version: StateVersion) -> Self {
        Self {
            db,
            changes: TrieChanges::default(),
            persisted_root: None,
            version,
            child_tries: HashMap::new(),
        }
    }

    /// Opens the trie persisted under `root`. The empty-trie hash is
    /// accepted and opens an empty trie.
    pub fn from_root(db: Arc<dyn TrieDB>, root: H256, version: StateVersion) -> Self {
        let persisted_root = (root != *crate::EMPTY_TRIE_HASH).then_some(root);
        Self {
            db,
            changes: TrieChanges::default(),
            persisted_root,
            version,
            child_tries: HashMap::new(),
        }
    }

    /// Current root hash across overlay and persisted state.
    pub fn current_root_hash(&self) -> Result<H256, TrieError> {
        match self.changes.root() {
            Some(PendingRoot::At(key)) => match self.changes.get(key) {
                Some(PendingChange::Update(update)) => update
                    .merkle_value
                    .hash()
                    .ok_or(TrieError::InconsistentTree),
                _ => Err(TrieError::InconsistentTree),
            },
            Some(PendingRoot::Cleared) => Ok(*crate::EMPTY_TRIE_HASH),
            None => Ok(self.persisted_root.unwrap_or(*crate::EMPTY_TRIE_HASH)),
        }
    }

    /// Decodes the node addressed by `merkle`. Inline merkle values embed
    /// the encoding directly; hashed ones go through the store.
    fn load_node(&self, merkle: &MerkleValue, at: &Nibbles) -> Result<DecodedNode, TrieError> {
        match merkle {
            MerkleValue::Inline(encoding) => Ok(DecodedNode::decode(encoding)?),
            MerkleValue::Hashed(hash) => match self.db.get(hash.as_bytes())? {
                Some(encoding) => Ok(DecodedNode::decode(&encoding)?),
                None => Err(TrieError::MissingNode(at.clone())),
            },
        }
    }

    /// Resolves the child of the node at `parent_key` under `nibble`,
    /// preferring a pending overlay entry whose merkle value may not exist
    /// on disk yet.
    fn resolve_child(
        &self,
        parent_key: &Nibbles,
        nibble: u8,
        merkle: &MerkleValue,
    ) -> Result<DecodedNode, TrieError> {
        if let Some((_, pending)) = self.changes.child_at(parent_key, nibble) {
            return Ok(pending.node);
        }
        self.load_node(merkle, &parent_key.append_new(nibble))
    }

    /// The node currently acting as root, together with its full key, or
    /// `None` for an empty trie.
    fn current_root_node(&self) -> Result<Option<(Nibbles, DecodedNode)>, TrieError> {
        if let Some(pending) = self.changes.root() {
            return match pending {
                PendingRoot::Cleared => Ok(None),
                PendingRoot::At(key) => match self.changes.get(key) {
                    Some(PendingChange::Update(update)) => {
                        Ok(Some((key.clone(), update.node.clone())))
                    }
                    _ => Err(TrieError::InconsistentTree),
                },
            };
        }
        match self.persisted_root {
            None => Ok(None),
            Some(root) => {
                let node = self.load_node(&MerkleValue::Hashed(root), &Nibbles::default())?;
                Ok(Some((node.partial_key.clone(), node)))
            }
        }
    }

    fn traverse_cache(&self, key: &Nibbles) -> CacheStep {
        let ancestors = |key: &Nibbles| -> Vec<TraversedNode> {
            self.changes
                .ancestors(key)
                .into_iter()
                .map(|(full_key, pending)| TraversedNode::from_node(&pending.node, full_key))
                .collect()
        };

        match self.changes.get(key) {
            Some(PendingChange::Update(update)) => {
                let found = TraversedNode::from_node(&update.node, key.clone());
                return CacheStep::Finished(Traversal::Found {
                    traversed: ancestors(key),
                    found,
                });
            }
            Some(PendingChange::Remove) => {
                return CacheStep::Finished(Traversal::NotFound {
                    traversed: ancestors(key),
                });
            }
            None => {}
        }

        let traversed = ancestors(key);
        let Some(closest) = traversed.last() else {
            return CacheStep::Unfinished(Vec::new());
        };
        let index = key.at(closest.full_key.len());
        if closest.children[index].is_none() {
            // The slot the key would hang off is empty; no such key exists.
            CacheStep::Finished(Traversal::NotFound { traversed })
        } else {
            CacheStep::Unfinished(traversed)
        }
    }

    /// Walks the trie from `node` (whose partial key starts at `position`)
    /// towards `key`, resolving children overlay-first.
    fn walk(
        &self,
        mut node: DecodedNode,
        mut position: Nibbles,
        key: &Nibbles,
        mut traversed: Vec<TraversedNode>,
    ) -> Result<Traversal, TrieError> {
        loop {
            let remaining = key.offset(position.len());
            if !remaining.starts_with(&node.partial_key) {
                return Ok(Traversal::NotFound { traversed });
            }
            let full_key = position.concat(&node.partial_key);
            let current = TraversedNode::from_node(&node, full_key.clone());
            if full_key.len() == key.len() {
                return Ok(Traversal::Found {
                    traversed,
                    found: current,
                });
            }
            let index = key.at(full_key.len());
            let Some(merkle) = current.children[index].clone() else {
                traversed.push(current);
                return Ok(Traversal::NotFound { traversed });
            };
            traversed.push(current);
            node = self.resolve_child(&full_key, index as u8, &merkle)?;
            position = full_key.append_new(index as u8);
        }
    }

    fn traverse_trie(&self, key: &Nibbles) -> Result<Traversal, TrieError> {
        let traversed = match self.traverse_cache(key) {
            CacheStep::Finished(traversal) => return Ok(traversal),
            CacheStep::Unfinished(traversed) => traversed,
        };
        match traversed.last() {
            Some(ancestor) => {
                let index = key.at(ancestor.full_key.len());
                let merkle = ancestor.children[index]
                    .clone()
                    .ok_or(TrieError::InconsistentTree)?;
                let node = self.resolve_child(&ancestor.full_key, index as u8, &merkle)?;
                let position = ancestor.full_key.append_new(index as u8);
                self.walk(node, position, key, traversed)
            }
            None => match self.current_root_node()? {
                None => Ok(Traversal::NotFound {
                    traversed: Vec::new(),
                }),
                Some((_, root)) => self.walk(root, Nibbles::default(), key, Vec::new()),
            },
        }
    }

    /// Resolves a storage value to its raw bytes, chasing hashed values
    /// through overlay preimages and then the store.
    fn resolve_value(&self, storage_value: &StorageValue) -> Result<Vec<u8>, TrieError> {
        if !storage_value.is_hashed {
            return Ok(storage_value.value.clone());
        }
        if storage_value.value.len() != 32 {
            return Err(TrieError::InconsistentTree);
        }
        let hash = H256::from_slice(&storage_value.value);
        if let Some(preimage) = self.changes.preimage(&hash) {
            return Ok(preimage.to_vec());
        }
        self.db
            .get(hash.as_bytes())?
            .ok_or(TrieError::MissingValuePreimage)
    }

    fn pending_from_parts(
        storage_value: Option<StorageValue>,
        partial_key: Nibbles,
        children: [Option<MerkleValue>; 16],
        is_root: bool,
    ) -> PendingNode {
        let node = DecodedNode::new(children, partial_key, storage_value);
        let merkle_value = node.merkle_value(is_root);
        PendingNode::new(merkle_value, node)
    }

    /// Like [`Self::pending_from_parts`] but applies the engine's state
    /// version to a raw value, recording the preimage when it gets hashed.
    fn pending_from_raw(
        &mut self,
        value: Option<Vec<u8>>,
        partial_key: Nibbles,
        children: [Option<MerkleValue>; 16],
        is_root: bool,
    ) -> PendingNode {
        let storage_value = value.map(|raw| {
            let storage_value = StorageValue::from_value(raw.clone(), self.version);
            if storage_value.is_hashed {
                self.changes.record_preimage(blake2b_256(&raw), raw);
            }
            storage_value
        });
        Self::pending_from_parts(storage_value, partial_key, children, is_root)
    }

    /// Rewrites every traversed ancestor, deepest first, so each points at
    /// the freshly computed merkle value below it. The shallowest entry of
    /// `updates` seeds the chain. Marks the chain's top as pending root.
    fn propagate(
        &mut self,
        traversed: &[TraversedNode],
        updates: &mut BTreeMap<Nibbles, PendingChange>,
    ) {
        let successor = updates.iter().find_map(|(key, change)| match change {
            PendingChange::Update(update) => {
                Some((key.clone(), Some(update.merkle_value.clone())))
            }
            PendingChange::Remove => None,
        });
        let (mut successor_key, mut successor_merkle) = match successor {
            Some(seed) => seed,
            None => match updates.keys().next() {
                Some(key) => (key.clone(), None),
                None => return,
            },
        };

        for (i, node) in traversed.iter().enumerate().rev() {
            let index = successor_key.at(node.full_key.len());
            let mut children = node.children.clone();
            children[index] = successor_merkle.clone();
            let update = Self::pending_from_parts(
                node.storage_value.clone(),
                node.partial_key.clone(),
                children,
                i == 0,
            );
            successor_key = node.full_key.clone();
            successor_merkle = Some(update.merkle_value.clone());
            updates.insert(node.full_key.clone(), PendingChange::Update(update));
        }

        if let Some(top) = traversed.first() {
            self.changes.set_root(PendingRoot::At(top.full_key.clone()));
        }
    }

    /// Builds the pending entries for inserting `key`, splitting an existing
    /// node or creating a branch where the paths diverge.
    fn execute_insert(
        &mut self,
        key: &Nibbles,
        value: Vec<u8>,
        ancestor: Option<&TraversedNode>,
    ) -> Result<BTreeMap<Nibbles, PendingChange>, TrieError> {
        let mut updates = BTreeMap::new();

        // Resolve the node already occupying the slot the new key needs, if
        // any. With no ancestor the current root takes that role.
        let (existing_key, existing, new_partial_key, base) = match ancestor {
            None => match self.current_root_node()? {
                None => {
                    let leaf =
                        self.pending_from_raw(Some(value), key.clone(), Default::default(), true);
                    updates.insert(key.clone(), PendingChange::Update(leaf));
                    self.changes.set_root(PendingRoot::At(key.clone()));
                    return Ok(updates);
                }
                Some((root_key, root)) => (root_key, root, key.clone(), Nibbles::default()),
            },
            Some(ancestor) => {
                let index = key.at(ancestor.full_key.len());
                match ancestor.children[index].clone() {
                    None => {
                        let partial_key = key.offset(ancestor.full_key.len() + 1);
                        let leaf = self.pending_from_raw(
                            Some(value),
                            partial_key,
                            Default::default(),
                            false,
                        );
                        updates.insert(key.clone(), PendingChange::Update(leaf));
                        return Ok(updates);
                    }
                    Some(merkle) => {
                        let existing =
                            self.resolve_child(&ancestor.full_key, index as u8, &merkle)?;
                        let base = ancestor.full_key.append_new(index as u8);
                        let existing_key = base.concat(&existing.partial_key);
                        let new_partial_key = key.offset(base.len());
                        (existing_key, existing, new_partial_key, base)
                    }
                }
            }
        };

        let is_top = ancestor.is_none();
        let existing_partial_key = existing.partial_key.clone();

        if existing_partial_key.starts_with(&new_partial_key) {
            // The new node slots in between; the existing node keeps its
            // position with a shorter partial key.
            let child_index = existing_partial_key.at(new_partial_key.len());
            let moved = Self::pending_from_parts(
                existing.storage_value.clone(),
                existing_partial_key.offset(new_partial_key.len() + 1),
                existing.children.clone(),
                false,
            );
            let mut children: [Option<MerkleValue>; 16] = Default::default();
            children[child_index] = Some(moved.merkle_value.clone());
            updates.insert(existing_key, PendingChange::Update(moved));
            let new_node = self.pending_from_raw(Some(value), new_partial_key, children, is_top);
            updates.insert(key.clone(), PendingChange::Update(new_node));
            if is_top {
                self.changes.set_root(PendingRoot::At(key.clone()));
            }
        } else {
            // Paths diverge; a value-less branch takes the shared prefix
            // with the existing node and the new leaf beneath it.
            let common = new_partial_key.count_prefix(&existing_partial_key);
            let moved = Self::pending_from_parts(
                existing.storage_value.clone(),
                existing_partial_key.offset(common + 1),
                existing.children.clone(),
                false,
            );
            let leaf = self.pending_from_raw(
                Some(value),
                new_partial_key.offset(common + 1),
                Default::default(),
                false,
            );
            let mut children: [Option<MerkleValue>; 16] = Default::default();
            children[existing_partial_key.at(common)] = Some(moved.merkle_value.clone());
            children[new_partial_key.at(common)] = Some(leaf.merkle_value.clone());
            let branch_key = base.concat(&new_partial_key.slice(0, common));
            let branch = Self::pending_from_parts(
                None,
                new_partial_key.slice(0, common),
                children,
                is_top,
            );
            updates.insert(existing_key, PendingChange::Update(moved));
            updates.insert(key.clone(), PendingChange::Update(leaf));
            updates.insert(branch_key.clone(), PendingChange::Update(branch));
            if is_top {
                self.changes.set_root(PendingRoot::At(branch_key));
            }
        }

        Ok(updates)
    }

    /// Merges `node` into its single remaining child: the child keeps its
    /// position and data but absorbs the node's partial key.
    fn merge_into_only_child(
        &self,
        node: &TraversedNode,
        is_root: bool,
    ) -> Result<(Nibbles, PendingNode), TrieError> {
        let (index, merkle) = node
            .children
            .iter()
            .enumerate()
            .find_map(|(i, child)| child.as_ref().map(|merkle| (i, merkle.clone())))
            .ok_or(TrieError::InconsistentTree)?;
        let child = self.resolve_child(&node.full_key, index as u8, &merkle)?;
        let merged_partial_key = node
            .partial_key
            .append_new(index as u8)
            .concat(&child.partial_key);
        let merged_key = node
            .full_key
            .append_new(index as u8)
            .concat(&child.partial_key);
        let merged = Self::pending_from_parts(
            child.storage_value.clone(),
            merged_partial_key,
            child.children.clone(),
            is_root,
        );
        Ok((merged_key, merged))
    }

    /// Builds the pending entries for removing `found`, classified by its
    /// live children count. Returns the entries together with how many of
    /// the deepest traversed ancestors they already rewrote.
    fn execute_deletion(
        &mut self,
        found: &TraversedNode,
        traversed: &[TraversedNode],
    ) -> Result<(BTreeMap<Nibbles, PendingChange>, usize), TrieError> {
        let mut updates = BTreeMap::new();
        let live_children = found.children.iter().filter(|child| child.is_some()).count();

        let Some(parent) = traversed.last() else {
            match live_children {
                0 => {
                    updates.insert(found.full_key.clone(), PendingChange::Remove);
                    self.changes.set_root(PendingRoot::Cleared);
                }
                1 => {
                    let (merged_key, merged) = self.merge_into_only_child(found, true)?;
                    updates.insert(found.full_key.clone(), PendingChange::Remove);
                    self.changes.set_root(PendingRoot::At(merged_key.clone()));
                    updates.insert(merged_key, PendingChange::Update(merged));
                }
                _ => {
                    let update = Self::pending_from_parts(
                        None,
                        found.partial_key.clone(),
                        found.children.clone(),
                        true,
                    );
                    updates.insert(found.full_key.clone(), PendingChange::Update(update));
                    self.changes
                        .set_root(PendingRoot::At(found.full_key.clone()));
                }
            }
            return Ok((updates, 0));
        };

        match live_children {
            0 => {
                updates.insert(found.full_key.clone(), PendingChange::Remove);
                let parent_live = parent.children.iter().filter(|child| child.is_some()).count();
                // Removing the leaf would leave a value-less parent with a
                // single child; fold the parent into that child.
                if parent.storage_value.is_none() && parent_live == 2 {
                    let found_index = found.full_key.at(parent.full_key.len());
                    let mut parent_children = parent.children.clone();
                    parent_children[found_index] = None;
                    let trimmed_parent = TraversedNode {
                        children: parent_children,
                        ..parent.clone()
                    };
                    let parent_is_root = traversed.len() == 1;
                    let (merged_key, merged) =
                        self.merge_into_only_child(&trimmed_parent, parent_is_root)?;
                    updates.insert(parent.full_key.clone(), PendingChange::Remove);
                    if parent_is_root {
                        self.changes.set_root(PendingRoot::At(merged_key.clone()));
                        updates.insert(merged_key, PendingChange::Update(merged));
                        return Ok((updates, 1));
                    }
                    let grandparent = &traversed[traversed.len() - 2];
                    let parent_index = parent.full_key.at(grandparent.full_key.len());
                    let mut grandparent_children = grandparent.children.clone();
                    grandparent_children[parent_index] = Some(merged.merkle_value.clone());
                    updates.insert(merged_key, PendingChange::Update(merged));
                    let grandparent_is_root = traversed.len() == 2;
                    let update = Self::pending_from_parts(
                        grandparent.storage_value.clone(),
                        grandparent.partial_key.clone(),
                        grandparent_children,
                        grandparent_is_root,
                    );
                    updates.insert(grandparent.full_key.clone(), PendingChange::Update(update));
                    if grandparent_is_root {
                        self.changes
                            .set_root(PendingRoot::At(grandparent.full_key.clone()));
                    }
                    return Ok((updates, 2));
                }
            }
            1 => {
                let (merged_key, merged) = self.merge_into_only_child(found, false)?;
                updates.insert(found.full_key.clone(), PendingChange::Remove);
                updates.insert(merged_key, PendingChange::Update(merged));
            }
            _ => {
                let update = Self::pending_from_parts(
                    None,
                    found.partial_key.clone(),
                    found.children.clone(),
                    false,
                );
                updates.insert(found.full_key.clone(), PendingChange::Update(update));
            }
        }

        Ok((updates, 0))
    }

    /// Depth-first removal of the subtree hanging off `nibble` of the node
    /// at `parent_key`. Returns `None` when the budget ran out before the
    /// subtree was entered, `Some(None)` when the subtree is gone, and
    /// `Some(Some(merkle))` when the budget ran out inside it and the child
    /// was rewritten with its surviving children.
    fn delete_subtree(
        &mut self,
        parent_key: &Nibbles,
        nibble: u8,
        merkle: &MerkleValue,
        limit: Option<u64>,
        deleted: &mut u64,
    ) -> Result<Option<Option<MerkleValue>>, TrieError> {
        if limit.is_some_and(|limit| *deleted >= limit) {
            return Ok(None);
        }

        let node = self.resolve_child(parent_key, nibble, merkle)?;
        let full_key = parent_key.append_new(nibble).concat(&node.partial_key);
        let mut children = node.children.clone();
        for index in 0..16u8 {
            if let Some(child_merkle) = children[index as usize].clone() {
                if let Some(outcome) =
                    self.delete_subtree(&full_key, index, &child_merkle, limit, deleted)?
                {
                    children[index as usize] = outcome;
                }
            }
        }

        if limit.is_some_and(|limit| *deleted >= limit) {
            let update = Self::pending_from_parts(
                node.storage_value.clone(),
                node.partial_key.clone(),
                children,
                false,
            );
            let new_merkle = update.merkle_value.clone();
            self.changes
                .insert(full_key, PendingChange::Update(update));
            Ok(Some(Some(new_merkle)))
        } else {
            self.changes.insert(full_key, PendingChange::Remove);
            if node.storage_value.is_some() {
                *deleted += 1;
            }
            Ok(Some(None))
        }
    }

    /// Locates the node whose subtree a prefix deletion covers. A prefix
    /// ending inside a node's partial key covers that node.
    fn find_prefix_node(
        &self,
        prefix: &Nibbles,
    ) -> Result<Option<(Vec<TraversedNode>, TraversedNode)>, TrieError> {
        match self.traverse_trie(prefix)? {
            Traversal::Found { traversed, found } => Ok(Some((traversed, found))),
            Traversal::NotFound { traversed } => match traversed.last() {
                Some(ancestor) => {
                    let index = prefix.at(ancestor.full_key.len());
                    let Some(merkle) = ancestor.children[index].clone() else {
                        return Ok(None);
                    };
                    let child = self.resolve_child(&ancestor.full_key, index as u8, &merkle)?;
                    let remainder = prefix.offset(ancestor.full_key.len() + 1);
                    if !child.partial_key.starts_with(&remainder) {
                        return Ok(None);
                    }
                    let full_key = ancestor
                        .full_key
                        .append_new(index as u8)
                        .concat(&child.partial_key);
                    Ok(Some((traversed, TraversedNode::from_node(&child, full_key))))
                }
                None => match self.current_root_node()? {
                    Some((root_key, root)) if root_key.starts_with(prefix) => {
                        Ok(Some((Vec::new(), TraversedNode::from_node(&root, root_key))))
                    }
                    _ => Ok(None),
                },
            },
        }
    }

    fn find_next(
        &self,
        target: &Nibbles,
        node_key: Nibbles,
        node: &DecodedNode,
    ) -> Result<Option<Nibbles>, TrieError> {
        if node.storage_value.is_some() && node_key > *target {
            return Ok(Some(node_key));
        }
        for index in 0..16u8 {
            let Some(merkle) = node.children[index as usize].clone() else {
                continue;
            };
            let child = self.resolve_child(&node_key, index, &merkle)?;
            let child_key = node_key.append_new(index).concat(&child.partial_key);
            // Subtrees wholly before the target cannot hold its successor.
            if child_key.compare_prefix(target) == std::cmp::Ordering::Less {
                continue;
            }
            if let Some(found) = self.find_next(target, child_key, &child)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

impl TrieAccessor for DiskTrie {
    fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        let key = Nibbles::from_bytes(key);
        match self.changes.get(&key) {
            Some(PendingChange::Update(update)) => {
                return match &update.node.storage_value {
                    Some(storage_value) => self.resolve_value(storage_value).map(Some),
                    None => Ok(None),
                };
            }
            Some(PendingChange::Remove) => return Ok(None),
            None => {}
        }
        match self.traverse_trie(&key)? {
            Traversal::Found { found, .. } => match &found.storage_value {
                Some(storage_value) => self.resolve_value(storage_value).map(Some),
                None => Ok(None),
            },
            Traversal::NotFound { .. } => Ok(None),
        }
    }

    fn save(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        let key = Nibbles::from_bytes(key);
        trace!(key = %key, len = value.len(), "saving storage value");

        let mut updates;
        let traversed = match self.traverse_trie(&key)? {
            Traversal::Found { traversed, found } => {
                let is_root = traversed.is_empty();
                let update = self.pending_from_raw(
                    Some(value),
                    found.partial_key.clone(),
                    found.children.clone(),
                    is_root,
                );
                updates = BTreeMap::from([(key.clone(), PendingChange::Update(update))]);
                if is_root {
                    self.changes.set_root(PendingRoot::At(key.clone()));
                }
                traversed
            }
            Traversal::NotFound { traversed } => {
                updates = self.execute_insert(&key, value, traversed.last())?;
                traversed
            }
        };

        self.propagate(&traversed, &mut updates);
        self.changes.extend(updates);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        let key = Nibbles::from_bytes(key);
        match self.traverse_trie(&key)? {
            Traversal::NotFound { .. } => {
                debug!(key = %key, "delete of absent key");
                Ok(())
            }
            Traversal::Found { traversed, found } => {
                let (mut updates, handled) = self.execute_deletion(&found, &traversed)?;
                let keep = traversed.len() - handled;
                self.propagate(&traversed[..keep], &mut updates);
                self.changes.extend(updates);
                Ok(())
            }
        }
    }

    fn delete_by_prefix(
        &mut self,
        prefix: &[u8],
        limit: Option<u64>,
    ) -> Result<DeleteByPrefixResult, TrieError> {
        let prefix = Nibbles::from_bytes(prefix);
        let Some((traversed, prefix_node)) = self.find_prefix_node(&prefix)? else {
            return Ok(DeleteByPrefixResult {
                deleted: 0,
                all_deleted: true,
            });
        };

        let mut deleted = 0u64;
        let mut pruned = prefix_node.children.clone();
        for index in 0..16u8 {
            if let Some(merkle) = pruned[index as usize].clone() {
                if let Some(outcome) = self.delete_subtree(
                    &prefix_node.full_key,
                    index,
                    &merkle,
                    limit,
                    &mut deleted,
                )? {
                    pruned[index as usize] = outcome;
                }
            }
        }

        let exhausted = limit.is_some_and(|limit| deleted >= limit);
        let survivors = pruned.iter().any(Option::is_some);
        if exhausted && (survivors || prefix_node.storage_value.is_some()) {
            // Budget ran out with content left under the prefix: keep the
            // prefix node, but with only its surviving children.
            let update = Self::pending_from_parts(
                prefix_node.storage_value.clone(),
                prefix_node.partial_key.clone(),
                pruned,
                traversed.is_empty(),
            );
            let mut updates = BTreeMap::from([(
                prefix_node.full_key.clone(),
                PendingChange::Update(update),
            )]);
            if traversed.is_empty() {
                self.changes
                    .set_root(PendingRoot::At(prefix_node.full_key.clone()));
            }
            self.propagate(&traversed, &mut updates);
            self.changes.extend(updates);
            return Ok(DeleteByPrefixResult {
                deleted,
                all_deleted: false,
            });
        }

        if prefix_node.storage_value.is_some() {
            deleted += 1;
        }
        let emptied = TraversedNode {
            children: pruned,
            ..prefix_node
        };
        let (mut updates, handled) = self.execute_deletion(&emptied, &traversed)?;
        let keep = traversed.len() - handled;
        self.propagate(&traversed[..keep], &mut updates);
        self.changes.extend(updates);
        Ok(DeleteByPrefixResult {
            deleted,
            all_deleted: true,
        })
    }

    fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        let key = Nibbles::from_bytes(key);
        let Some((root_key, root)) = self.current_root_node()? else {
            return Ok(None);
        };
        Ok(self
            .find_next(&key, root_key, &root)?
            .map(|next| next.to_bytes()))
    }

    fn merkle_root(&mut self, version: StateVersion) -> Result<H256, TrieError> {
        if version != self.version {
            return Err(TrieError::StateVersionMismatch);
        }
        self.current_root_hash()
    }

    fn persist_changes(&mut self) -> Result<(), TrieError> {
        // Children flush first so their roots can be upserted into this trie
        // as ordinary values before its own flush.
        let children = mem::take(&mut self.child_tries);
        let mut flushed = HashMap::new();
        for (child_key, mut child) in children {
            child.persist_changes()?;
            let child_root = child.current_root_hash()?;
            let mut full_key = CHILD_STORAGE_PREFIX.to_vec();
            full_key.extend_from_slice(&child_key);
            self.save(&full_key, child_root.as_bytes().to_vec())?;
            flushed.insert(child_key, child);
        }
        self.child_tries = flushed;

        let mut batch = Vec::new();
        for (_, change) in self.changes.changes() {
            if let PendingChange::Update(update) = change {
                // Inline nodes are embedded in their parent's encoding and
                // are never stored on their own.
                if let MerkleValue::Hashed(hash) = &update.merkle_value {
                    batch.push((hash.as_bytes().to_vec(), update.node.encode()));
                }
            }
        }
        for (hash, value) in self.changes.preimages() {
            batch.push((hash.as_bytes().to_vec(), value.clone()));
        }

        let root = self.current_root_hash()?;
        debug!(
            nodes = batch.len(),
            root = %hex::encode(root),
            "flushing pending trie changes",
        );
        self.db.put_batch(batch)?;
        self.persisted_root = (root != *crate::EMPTY_TRIE_HASH).then_some(root);
        self.changes.clear();
        Ok(())
    }

    fn get_child_trie(&mut self, key: &[u8]) -> Result<&mut Self, TrieError> {
        if !self.child_tries.contains_key(key) {
            let mut full_key = CHILD_STORAGE_PREFIX.to_vec();
            full_key.extend_from_slice(key);
            let child = match self.find(&full_key)? {
                Some(root) if root.len() == 32 => {
                    Self::from_root(self.db.clone(), H256::from_slice(&root), self.version)
                }
                Some(_) => return Err(TrieError::InconsistentTree),
                None => Self::new(self.db.clone(), self.version),
            };
            self.child_tries.insert(key.to_vec(), child);
        }
        match self.child_tries.get_mut(key) {
            Some(child) => Ok(child),
            None => unreachable!(),
        }
    }
}
