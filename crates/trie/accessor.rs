use crate::{error::TrieError, nibbles::Nibbles, node::StateVersion};
use ethereum_types::H256;

/// Reserved key prefix under which a child trie's root hash lives as an
/// ordinary value in its parent trie.
pub const CHILD_STORAGE_PREFIX: &[u8] = b":child_storage:default:";

/// Full parent-trie key for the child trie registered under `key`.
pub fn child_trie_key(key: &[u8]) -> Nibbles {
    let mut full = Vec::with_capacity(CHILD_STORAGE_PREFIX.len() + key.len());
    full.extend_from_slice(CHILD_STORAGE_PREFIX);
    full.extend_from_slice(key);
    Nibbles::from_bytes(&full)
}

/// Outcome of a bounded prefix deletion. `all_deleted` is true exactly when
/// a further unbounded call with the same prefix would delete nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteByPrefixResult {
    pub deleted: u64,
    pub all_deleted: bool,
}

/// Mutable facade over one state trie, shared by the in-memory
/// [`Trie`](crate::Trie) and the disk-backed [`DiskTrie`](crate::DiskTrie)
/// so callers stay engine-agnostic.
pub trait TrieAccessor {
    /// Storage value currently associated with `key`.
    fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError>;

    /// Inserts or overwrites the value at `key`.
    fn save(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError>;

    /// Removes the value at `key`. Absent keys are a no-op.
    fn delete(&mut self, key: &[u8]) -> Result<(), TrieError>;

    /// Deletes value-bearing keys under `prefix`, at most `limit` of them.
    fn delete_by_prefix(
        &mut self,
        prefix: &[u8],
        limit: Option<u64>,
    ) -> Result<DeleteByPrefixResult, TrieError>;

    /// Smallest value-bearing key strictly greater than `key`.
    fn next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError>;

    /// Root hash of the current state. `version` must match the version the
    /// accessor was opened with.
    fn merkle_root(&mut self, version: StateVersion) -> Result<H256, TrieError>;

    /// Flushes pending state, including every loaded child trie, to the
    /// backing store.
    fn persist_changes(&mut self) -> Result<(), TrieError>;

    /// Nested accessor for the child trie registered under `key`, loading it
    /// on first use. Its root is stored in this trie at [`child_trie_key`].
    fn get_child_trie(&mut self, key: &[u8]) -> Result<&mut Self, TrieError>
    where
        Self: Sized;
}
