use crate::{
    error::TrieError,
    merkle_value::MerkleValue,
    nibbles::Nibbles,
    node::{DecodedNode, StateVersion, StorageValue},
    structure::{Entry, NodeIndex, TrieStructure},
};

/// Per-node payload of a value-bearing trie: the raw storage value and the
/// node's cached merkle value. A `None` merkle value marks the node dirty.
#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub value: Option<Vec<u8>>,
    pub merkle_value: Option<MerkleValue>,
}

impl NodeData {
    pub fn with_value(value: Vec<u8>) -> Self {
        Self {
            value: Some(value),
            merkle_value: None,
        }
    }
}

/// External view of one node, with children resolved to their already
/// computed merkle values.
pub fn decoded_node(
    trie: &TrieStructure<NodeData>,
    index: NodeIndex,
    version: StateVersion,
) -> Result<DecodedNode, TrieError> {
    let mut children: [Option<MerkleValue>; 16] = Default::default();
    for (nibble, child) in trie.children(index) {
        let merkle = trie
            .user_data(child)
            .merkle_value
            .clone()
            .ok_or_else(|| TrieError::Build(format!("missing merkle value for child {nibble}")))?;
        children[nibble as usize] = Some(merkle);
    }
    let storage_value = trie
        .user_data(index)
        .value
        .as_ref()
        .map(|value| StorageValue::from_value(value.clone(), version));
    Ok(DecodedNode::new(
        children,
        trie.partial_key(index).clone(),
        storage_value,
    ))
}

/// Assigns every node's merkle value. Processing the lexicographic order in
/// reverse visits children strictly before their parents.
pub fn calculate_merkle_values(
    trie: &mut TrieStructure<NodeData>,
    version: StateVersion,
) -> Result<(), TrieError> {
    for index in trie.lexicographic_indices().into_iter().rev() {
        let node = decoded_node(trie, index, version)?;
        let is_root = trie.parent(index).is_none();
        trie.user_data_mut(index).merkle_value = Some(node.merkle_value(is_root));
    }
    Ok(())
}

/// Like [`calculate_merkle_values`] but skips nodes whose cached merkle
/// value is still present, re-hashing only the dirty path. Returns the
/// indices that were recomputed.
pub fn recalculate_merkle_values(
    trie: &mut TrieStructure<NodeData>,
    version: StateVersion,
) -> Result<Vec<NodeIndex>, TrieError> {
    let mut updated = Vec::new();
    for index in trie.lexicographic_indices().into_iter().rev() {
        if trie.user_data(index).merkle_value.is_some() {
            continue;
        }
        let node = decoded_node(trie, index, version)?;
        let is_root = trie.parent(index).is_none();
        trie.user_data_mut(index).merkle_value = Some(node.merkle_value(is_root));
        updated.push(index);
    }
    Ok(updated)
}

/// Builds a trie from key/value entries in one pass and computes every
/// merkle value.
pub fn build_trie_structure(
    entries: impl IntoIterator<Item = (Nibbles, Vec<u8>)>,
    version: StateVersion,
) -> Result<TrieStructure<NodeData>, TrieError> {
    let mut trie: TrieStructure<NodeData> = TrieStructure::new();
    for (key, value) in entries {
        match trie.node(&key) {
            Entry::Occupied(handle) => {
                let index = handle.index();
                trie.mark_storage_value(index);
                trie.user_data_mut(index).value = Some(value);
            }
            Entry::Vacant(vacant) => {
                let plan = trie.prepare_insert(&vacant);
                trie.insert(plan, NodeData::with_value(value), NodeData::default());
            }
        }
    }
    calculate_merkle_values(&mut trie, version)?;
    Ok(trie)
}

/// The root's merkle value after a calculation pass. Always a hash.
pub fn root_merkle_value(trie: &TrieStructure<NodeData>) -> Option<MerkleValue> {
    trie.root()
        .and_then(|root| trie.user_data(root).merkle_value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_entries() -> Vec<(Nibbles, Vec<u8>)> {
        vec![
            (Nibbles::from_hex(&[0xa, 0x1, 0xb]), vec![1, 2, 3]),
            (Nibbles::from_hex(&[0xa, 0x8, 0x1, 0x3, 0xf]), vec![1, 4, 8]),
            (Nibbles::from_hex(&[0xa, 0xb, 0x2]), vec![6, 2, 5]),
            (Nibbles::from_hex(&[0xa, 0x8, 0x1]), vec![6, 2, 5]),
        ]
    }

    #[test]
    fn insertion_order_does_not_change_root() {
        let entries = example_entries();
        let reference = build_trie_structure(entries.clone(), StateVersion::V1).unwrap();
        let expected = root_merkle_value(&reference).unwrap();
        assert!(expected.is_hashed());

        // Rotations plus a full reversal cover every attachment case.
        for rotation in 0..entries.len() {
            let mut permuted = entries.clone();
            permuted.rotate_left(rotation);
            let trie = build_trie_structure(permuted, StateVersion::V1).unwrap();
            assert_eq!(root_merkle_value(&trie).unwrap(), expected);
        }
        let mut reversed = entries.clone();
        reversed.reverse();
        let trie = build_trie_structure(reversed, StateVersion::V1).unwrap();
        assert_eq!(root_merkle_value(&trie).unwrap(), expected);
    }

    #[test]
    fn small_child_is_inlined_in_parent_encoding() {
        let trie = build_trie_structure(example_entries(), StateVersion::V1).unwrap();
        let root = trie.root().unwrap();
        let root_node = decoded_node(&trie, root, StateVersion::V1).unwrap();
        // Every child of the root here has a tiny encoding and must appear
        // inline rather than as a hash.
        let children: Vec<_> = root_node.children.iter().flatten().collect();
        assert!(!children.is_empty());
        assert!(children.iter().all(|child| !child.is_hashed()));
    }

    #[test]
    fn recalculate_skips_cached_nodes() {
        let mut trie = build_trie_structure(example_entries(), StateVersion::V1).unwrap();
        assert_eq!(
            recalculate_merkle_values(&mut trie, StateVersion::V1).unwrap(),
            vec![]
        );

        // Dirty one leaf and its ancestor chain, as a mutation would.
        let target = Nibbles::from_hex(&[0xa, 0x8, 0x1, 0x3, 0xf]);
        let index = trie.get(&target).unwrap().index();
        trie.user_data_mut(index).value = Some(vec![9, 9, 9]);
        let mut current = Some(index);
        while let Some(i) = current {
            trie.user_data_mut(i).merkle_value = None;
            current = trie.parent(i).map(|(parent, _)| parent);
        }

        let updated = recalculate_merkle_values(&mut trie, StateVersion::V1).unwrap();
        // Leaf, its parent "a81" and the root branch "a"
        assert_eq!(updated.len(), 3);
        assert!(updated.contains(&index));
    }

    #[test]
    fn versions_yield_different_roots_for_large_values() {
        let entries = vec![(Nibbles::from_hex(&[0xa, 0x1]), vec![0xcd; 64])];
        let v0 = build_trie_structure(entries.clone(), StateVersion::V0).unwrap();
        let v1 = build_trie_structure(entries, StateVersion::V1).unwrap();
        assert_ne!(root_merkle_value(&v0), root_merkle_value(&v1));
    }

    #[test]
    fn missing_child_merkle_is_a_build_error() {
        let mut trie = TrieStructure::new();
        for (key, value) in example_entries() {
            if let Entry::Vacant(vacant) = trie.node(&key) {
                let plan = trie.prepare_insert(&vacant);
                trie.insert(plan, NodeData::with_value(value), NodeData::default());
            }
        }
        let root = trie.root().unwrap();
        // No bottom-up pass ran, so resolving the root's children must fail.
        assert!(matches!(
            decoded_node(&trie, root, StateVersion::V1),
            Err(TrieError::Build(_))
        ));
    }
}
