mod accessor;
mod cache;
pub mod db;
mod disk;
pub mod error;
mod merkle_value;
mod merkleize;
mod nibbles;
mod node;
mod scale;
mod structure;

use ethereum_types::H256;
use std::{collections::HashMap, mem, sync::Arc};
use tracing::{debug, trace};

pub use self::accessor::{
    CHILD_STORAGE_PREFIX, DeleteByPrefixResult, TrieAccessor, child_trie_key,
};
pub use self::db::{InMemoryTrieDB, TrieDB};
pub use self::disk::DiskTrie;
pub use self::error::{NodeDecodeError, TrieError};
pub use self::merkle_value::{MerkleValue, blake2b_256};
pub use self::merkleize::{NodeData, build_trie_structure, root_merkle_value};
pub use self::nibbles::Nibbles;
pub use self::node::{DecodedNode, StateVersion, StorageValue};
pub use self::structure::{Entry, NodeHandle, NodeIndex, TrieStructure};

use self::merkleize::{decoded_node, recalculate_merkle_values};
use self::structure::DirtyPath;

use lazy_static::lazy_static;

lazy_static! {
    // Root hash of an empty trie: the blake2b-256 hash of the empty node
    // encoding, a single 0x00 header byte.
    pub static ref EMPTY_TRIE_HASH: H256 = DecodedNode::default()
        .merkle_value(true)
        .hash()
        .unwrap_or_else(|| unreachable!("the root merkle value is always hashed"));
}

/// In-memory trie accessor. The whole state lives in a [`TrieStructure`]
/// arena with per-node cached merkle values; mutations clear the cache along
/// the dirty path so a root request only re-hashes what changed.
/// [`persist_changes`] writes the content-addressed node set to the store,
/// from where [`DiskTrie`] can reopen it by root hash.
///
/// [`persist_changes`]: TrieAccessor::persist_changes
pub struct Trie {
    structure: TrieStructure<NodeData>,
    db: Arc<dyn TrieDB>,
    version: StateVersion,
    child_tries: HashMap<Vec<u8>, Trie>,
}

impl Trie {
    pub fn new(db: Arc<dyn TrieDB>, version: StateVersion) -> Self {
        Self {
            structure: TrieStructure::new(),
            db,
            version,
            child_tries: HashMap::new(),
        }
    }

    /// Builds the trie from key/value entries in one pass.
    pub fn from_entries(
        db: Arc<dyn TrieDB>,
        entries: impl IntoIterator<Item = (Vec<u8>, Vec<u8>)>,
        version: StateVersion,
    ) -> Result<Self, TrieError> {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (Nibbles::from_bytes(&key), value));
        let structure = build_trie_structure(entries, version)?;
        Ok(Self {
            structure,
            db,
            version,
            child_tries: HashMap::new(),
        })
    }

    /// Clears the cached merkle value of a node and every ancestor of it.
    fn invalidate_from(&mut self, index: NodeIndex) {
        let mut current = Some(index);
        while let Some(i) = current {
            self.structure.user_data_mut(i).merkle_value = None;
            current = self.structure.parent(i).map(|(parent, _)| parent);
        }
    }

    fn invalidate(&mut self, dirty: DirtyPath) {
        if let Some(reparented) = dirty.reparented {
            self.structure.user_data_mut(reparented).merkle_value = None;
        }
        if let Some(deepest) = dirty.deepest {
            self.invalidate_from(deepest);
        }
    }

    fn remove_value_at(&mut self, index: NodeIndex) {
        self.structure.user_data_mut(index).value = None;
        let dirty = self.structure.remove_storage_value(index);
        self.invalidate(dirty);
    }
}

impl TrieAccessor for Trie {
    fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        let key = Nibbles::from_bytes(key);
        Ok(self
            .structure
            .get(&key)
            .filter(|handle| handle.has_storage_value())
            .and_then(|handle| self.structure.user_data(handle.index()).value.clone()))
    }

    fn save(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        let key = Nibbles::from_bytes(key);
        match self.structure.node(&key) {
            Entry::Occupied(handle) => {
                let index = handle.index();
                self.structure.mark_storage_value(index);
                self.structure.user_data_mut(index).value = Some(value);
                self.invalidate_from(index);
            }
            Entry::Vacant(vacant) => {
                let plan = self.structure.prepare_insert(&vacant);
                let (_, dirty) =
                    self.structure
                        .insert(plan, NodeData::with_value(value), NodeData::default());
                self.invalidate(dirty);
            }
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        let key = Nibbles::from_bytes(key);
        let Some(handle) = self
            .structure
            .get(&key)
            .filter(|handle| handle.has_storage_value())
        else {
            debug!(key = %hex::encode(key.to_bytes()), "delete target not present");
            return Ok(());
        };
        self.remove_value_at(handle.index());
        Ok(())
    }

    fn delete_by_prefix(
        &mut self,
        prefix: &[u8],
        limit: Option<u64>,
    ) -> Result<DeleteByPrefixResult, TrieError> {
        let prefix = Nibbles::from_bytes(prefix);
        let Some((subtree, _)) = self.structure.subtree_at_prefix(&prefix) else {
            return Ok(DeleteByPrefixResult {
                deleted: 0,
                all_deleted: true,
            });
        };
        // Deletions restructure the arena, so the value-bearing keys are
        // collected up front.
        let mut keys = Vec::new();
        let mut stack = vec![subtree];
        while let Some(index) = stack.pop() {
            if self.structure.has_storage_value(index) {
                keys.push(self.structure.node_full_key(index));
            }
            for (_, child) in self.structure.children(index) {
                stack.push(child);
            }
        }
        keys.sort();

        let budget = limit.unwrap_or(u64::MAX);
        let mut deleted = 0u64;
        for key in &keys {
            if deleted >= budget {
                trace!(deleted, "prefix deletion budget exhausted");
                return Ok(DeleteByPrefixResult {
                    deleted,
                    all_deleted: false,
                });
            }
            let handle = self
                .structure
                .get(key)
                .ok_or(TrieError::InconsistentTree)?;
            self.remove_value_at(handle.index());
            deleted += 1;
        }
        Ok(DeleteByPrefixResult {
            deleted,
            all_deleted: true,
        })
    }

    fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        Ok(self
            .structure
            .next_storage_key(&Nibbles::from_bytes(key))
            .map(|next| next.to_bytes()))
    }

    fn merkle_root(&mut self, version: StateVersion) -> Result<H256, TrieError> {
        if version != self.version {
            return Err(TrieError::StateVersionMismatch);
        }
        if self.structure.is_empty() {
            return Ok(*EMPTY_TRIE_HASH);
        }
        let updated = recalculate_merkle_values(&mut self.structure, self.version)?;
        if !updated.is_empty() {
            trace!(recomputed = updated.len(), "re-hashed dirty path");
        }
        root_merkle_value(&self.structure)
            .and_then(|merkle| merkle.hash())
            .ok_or(TrieError::InconsistentTree)
    }

    fn persist_changes(&mut self) -> Result<(), TrieError> {
        let mut children = mem::take(&mut self.child_tries);
        for (key, child) in children.iter_mut() {
            child.persist_changes()?;
            let child_root = child.merkle_root(child.version)?;
            let mut storage_key = Vec::with_capacity(CHILD_STORAGE_PREFIX.len() + key.len());
            storage_key.extend_from_slice(CHILD_STORAGE_PREFIX);
            storage_key.extend_from_slice(key);
            self.save(&storage_key, child_root.as_bytes().to_vec())?;
        }
        self.child_tries = children;

        // Recomputes any stale merkle value before the node walk below.
        let root = self.merkle_root(self.version)?;
        let mut batch = Vec::new();
        for index in self.structure.lexicographic_indices() {
            let data = self.structure.user_data(index);
            let Some(MerkleValue::Hashed(hash)) = &data.merkle_value else {
                // Inline nodes live inside their parent's encoding.
                continue;
            };
            let node = decoded_node(&self.structure, index, self.version)?;
            if let (Some(raw), Some(stored)) = (&data.value, &node.storage_value) {
                if stored.is_hashed {
                    batch.push((stored.value.clone(), raw.clone()));
                }
            }
            batch.push((hash.as_bytes().to_vec(), node.encode()));
        }
        debug!(
            root = %hex::encode(root.as_bytes()),
            nodes = batch.len(),
            "flushing trie to store"
        );
        self.db.put_batch(batch)
    }

    /// Child accessors build state from scratch; reopening a persisted child
    /// trie by its stored root goes through [`DiskTrie`].
    fn get_child_trie(&mut self, key: &[u8]) -> Result<&mut Self, TrieError> {
        let db = Arc::clone(&self.db);
        let version = self.version;
        Ok(self
            .child_tries
            .entry(key.to_vec())
            .or_insert_with(|| Trie::new(db, version)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use proptest::{collection::vec, prelude::*};
    use std::collections::BTreeMap;

    fn new_temp() -> Trie {
        Trie::new(Arc::new(InMemoryTrieDB::new_empty()), StateVersion::V1)
    }

    fn reference_root(entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> H256 {
        if entries.is_empty() {
            return *EMPTY_TRIE_HASH;
        }
        let entries = entries
            .iter()
            .map(|(key, value)| (Nibbles::from_bytes(key), value.clone()));
        let structure = build_trie_structure(entries, StateVersion::V1).unwrap();
        root_merkle_value(&structure).unwrap().hash().unwrap()
    }

    #[test]
    fn empty_trie_hash_matches_the_known_constant() {
        assert_eq!(
            EMPTY_TRIE_HASH.as_bytes(),
            hex!("03170a2e7597b7b7e3d84c05391d139a62b157e78786d8c082f29dcf4c111314")
        );
        let mut trie = new_temp();
        assert_eq!(
            trie.merkle_root(StateVersion::V1).unwrap(),
            *EMPTY_TRIE_HASH
        );
    }

    #[test]
    fn find_after_save_and_delete() {
        let mut trie = new_temp();
        assert_eq!(trie.find(b"doe").unwrap(), None);

        trie.save(b"doe", b"reindeer".to_vec()).unwrap();
        trie.save(b"dog", b"puppy".to_vec()).unwrap();
        trie.save(b"dogglesworth", b"cat".to_vec()).unwrap();
        assert_eq!(trie.find(b"doe").unwrap(), Some(b"reindeer".to_vec()));
        assert_eq!(trie.find(b"dog").unwrap(), Some(b"puppy".to_vec()));

        trie.save(b"dog", b"hound".to_vec()).unwrap();
        assert_eq!(trie.find(b"dog").unwrap(), Some(b"hound".to_vec()));

        trie.delete(b"dog").unwrap();
        assert_eq!(trie.find(b"dog").unwrap(), None);
        assert_eq!(
            trie.find(b"dogglesworth").unwrap(),
            Some(b"cat".to_vec())
        );
        // Deleting an absent key is a no-op.
        trie.delete(b"dog").unwrap();
    }

    #[test]
    fn insertion_order_does_not_change_root() {
        let entries = vec![
            (b"doe".to_vec(), b"reindeer".to_vec()),
            (b"dog".to_vec(), b"puppy".to_vec()),
            (b"dogglesworth".to_vec(), b"cat".to_vec()),
            (b"horse".to_vec(), b"stallion".to_vec()),
        ];
        let mut reference = new_temp();
        for (key, value) in &entries {
            reference.save(key, value.clone()).unwrap();
        }
        let expected = reference.merkle_root(StateVersion::V1).unwrap();

        for rotation in 1..entries.len() {
            let mut permuted = entries.clone();
            permuted.rotate_left(rotation);
            let mut trie = new_temp();
            for (key, value) in &permuted {
                trie.save(key, value.clone()).unwrap();
            }
            assert_eq!(trie.merkle_root(StateVersion::V1).unwrap(), expected);
        }
    }

    #[test]
    fn incremental_root_matches_bulk_construction() {
        let mut entries = BTreeMap::new();
        for (key, value) in [
            (b"doe".to_vec(), b"reindeer".to_vec()),
            (b"dog".to_vec(), b"puppy".to_vec()),
            (b"dogglesworth".to_vec(), b"cat".to_vec()),
        ] {
            entries.insert(key, value);
        }
        let mut trie = new_temp();
        for (key, value) in &entries {
            trie.save(key, value.clone()).unwrap();
        }
        assert_eq!(
            trie.merkle_root(StateVersion::V1).unwrap(),
            reference_root(&entries)
        );

        // Mutating after a root request only re-hashes the dirty path and
        // must land on the same root as a fresh build.
        trie.delete(b"dog").unwrap();
        entries.remove(&b"dog".to_vec());
        trie.save(b"door", b"hinge".to_vec()).unwrap();
        entries.insert(b"door".to_vec(), b"hinge".to_vec());
        assert_eq!(
            trie.merkle_root(StateVersion::V1).unwrap(),
            reference_root(&entries)
        );
    }

    #[test]
    fn from_entries_agrees_with_incremental_saves() {
        let entries = vec![
            (b"alpha".to_vec(), b"1".to_vec()),
            (b"beta".to_vec(), b"2".to_vec()),
            (b"betamax".to_vec(), b"3".to_vec()),
        ];
        let mut bulk = Trie::from_entries(
            Arc::new(InMemoryTrieDB::new_empty()),
            entries.clone(),
            StateVersion::V1,
        )
        .unwrap();
        let mut incremental = new_temp();
        for (key, value) in &entries {
            incremental.save(key, value.clone()).unwrap();
        }
        assert_eq!(
            bulk.merkle_root(StateVersion::V1).unwrap(),
            incremental.merkle_root(StateVersion::V1).unwrap()
        );
        assert_eq!(bulk.find(b"betamax").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut trie = new_temp();
        assert!(matches!(
            trie.merkle_root(StateVersion::V0),
            Err(TrieError::StateVersionMismatch)
        ));
    }

    #[test]
    fn next_key_walks_in_byte_order() {
        let mut trie = new_temp();
        let keys: Vec<Vec<u8>> = vec![
            b"ab".to_vec(),
            b"abc".to_vec(),
            b"b".to_vec(),
            b"zz".to_vec(),
        ];
        for key in &keys {
            trie.save(key, b"v".to_vec()).unwrap();
        }
        let mut cursor = Vec::new();
        let mut seen = Vec::new();
        while let Some(next) = trie.next_key(&cursor).unwrap() {
            cursor = next.clone();
            seen.push(next);
        }
        assert_eq!(seen, keys);
    }

    #[test]
    fn bounded_prefix_deletion_reports_progress() {
        let mut trie = new_temp();
        trie.save(b"aaa1", b"1".to_vec()).unwrap();
        trie.save(b"aaa2", b"2".to_vec()).unwrap();
        trie.save(b"aaa3", b"3".to_vec()).unwrap();
        trie.save(b"bbb", b"4".to_vec()).unwrap();

        let first = trie.delete_by_prefix(b"aaa", Some(2)).unwrap();
        assert_eq!(
            first,
            DeleteByPrefixResult {
                deleted: 2,
                all_deleted: false
            }
        );

        let second = trie.delete_by_prefix(b"aaa", None).unwrap();
        assert_eq!(
            second,
            DeleteByPrefixResult {
                deleted: 1,
                all_deleted: true
            }
        );
        assert_eq!(trie.find(b"aaa3").unwrap(), None);
        assert_eq!(trie.find(b"bbb").unwrap(), Some(b"4".to_vec()));

        // Nothing left under the prefix.
        let third = trie.delete_by_prefix(b"aaa", Some(5)).unwrap();
        assert_eq!(
            third,
            DeleteByPrefixResult {
                deleted: 0,
                all_deleted: true
            }
        );
    }

    #[test]
    fn prefix_deletion_with_exact_budget_reports_completion() {
        let mut trie = new_temp();
        trie.save(b"pre1", b"1".to_vec()).unwrap();
        trie.save(b"pre2", b"2".to_vec()).unwrap();
        let result = trie.delete_by_prefix(b"pre", Some(2)).unwrap();
        assert_eq!(
            result,
            DeleteByPrefixResult {
                deleted: 2,
                all_deleted: true
            }
        );
    }

    #[test]
    fn persisted_nodes_reopen_through_the_disk_engine() {
        let db: Arc<dyn TrieDB> = Arc::new(InMemoryTrieDB::new_empty());
        let mut memory = Trie::new(Arc::clone(&db), StateVersion::V1);
        memory.save(b"doe", b"reindeer".to_vec()).unwrap();
        // Hashed under V1, so the preimage must be persisted too.
        memory.save(b"dog", vec![0xcd; 64]).unwrap();
        memory.persist_changes().unwrap();
        let root = memory.merkle_root(StateVersion::V1).unwrap();

        let mut disk = DiskTrie::from_root(db, root, StateVersion::V1);
        assert_eq!(disk.find(b"doe").unwrap(), Some(b"reindeer".to_vec()));
        assert_eq!(disk.find(b"dog").unwrap(), Some(vec![0xcd; 64]));
        assert_eq!(disk.merkle_root(StateVersion::V1).unwrap(), root);
    }

    #[test]
    fn memory_and_disk_engines_agree_on_roots() {
        let ops: Vec<(Vec<u8>, Option<Vec<u8>>)> = vec![
            (b"alpha".to_vec(), Some(b"1".to_vec())),
            (b"beta".to_vec(), Some(b"2".to_vec())),
            (b"betamax".to_vec(), Some(vec![0xee; 40])),
            (b"beta".to_vec(), None),
            (b"gamma".to_vec(), Some(b"3".to_vec())),
        ];
        let mut memory = new_temp();
        let mut disk = DiskTrie::new(Arc::new(InMemoryTrieDB::new_empty()), StateVersion::V1);
        for (key, value) in ops {
            match value {
                Some(value) => {
                    memory.save(&key, value.clone()).unwrap();
                    disk.save(&key, value).unwrap();
                }
                None => {
                    memory.delete(&key).unwrap();
                    disk.delete(&key).unwrap();
                }
            }
        }
        assert_eq!(
            memory.merkle_root(StateVersion::V1).unwrap(),
            disk.merkle_root(StateVersion::V1).unwrap()
        );
    }

    #[test]
    fn child_trie_roots_persist_into_the_parent() {
        let db: Arc<dyn TrieDB> = Arc::new(InMemoryTrieDB::new_empty());
        let mut parent = Trie::new(Arc::clone(&db), StateVersion::V1);
        parent.save(b"top", b"level".to_vec()).unwrap();
        let child = parent.get_child_trie(b"assets").unwrap();
        child.save(b"coin", b"100".to_vec()).unwrap();
        let child_root = child.merkle_root(StateVersion::V1).unwrap();
        parent.persist_changes().unwrap();

        let mut stored_key = CHILD_STORAGE_PREFIX.to_vec();
        stored_key.extend_from_slice(b"assets");
        assert_eq!(
            parent.find(&stored_key).unwrap(),
            Some(child_root.as_bytes().to_vec())
        );

        // The persisted state reopens through the disk engine, child
        // included.
        let root = parent.merkle_root(StateVersion::V1).unwrap();
        let mut disk = DiskTrie::from_root(db, root, StateVersion::V1);
        let disk_child = disk.get_child_trie(b"assets").unwrap();
        assert_eq!(disk_child.find(b"coin").unwrap(), Some(b"100".to_vec()));
    }

    proptest! {
        #[test]
        fn proptest_memory_trie_matches_model(
            ops in vec((vec(0u8..4, 1..4), vec(any::<u8>(), 1..40), any::<bool>()), 1..60)
        ) {
            let mut trie = new_temp();
            let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
            for (key, value, is_save) in ops {
                if is_save {
                    trie.save(&key, value.clone()).unwrap();
                    model.insert(key, value);
                } else {
                    trie.delete(&key).unwrap();
                    model.remove(&key);
                }
            }
            for (key, value) in &model {
                prop_assert_eq!(trie.find(key).unwrap(), Some(value.clone()));
            }
            // Enumeration visits exactly the model's keys, in order.
            let mut cursor = Vec::new();
            let mut seen = Vec::new();
            while let Some(next) = trie.next_key(&cursor).unwrap() {
                cursor = next.clone();
                seen.push(next);
            }
            let expected: Vec<_> = model.keys().cloned().collect();
            prop_assert_eq!(seen, expected);
            prop_assert_eq!(
                trie.merkle_root(StateVersion::V1).unwrap(),
                reference_root(&model)
            );
        }
    }
}
