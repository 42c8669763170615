use slab::Slab;

use crate::nibbles::Nibbles;

/// Stable handle to a node slot inside a [`TrieStructure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(usize);

/// Arena-backed trie skeleton. Nodes are addressed by stable indices and
/// linked through parent and child slots; the storage values themselves live
/// in the per-node user data.
///
/// Invariant: a node without a storage value has at least two children. A
/// single-child pass-through is always collapsed into its child.
#[derive(Debug)]
pub struct TrieStructure<T> {
    nodes: Slab<TrieNode<T>>,
    root: Option<usize>,
}

#[derive(Debug)]
struct TrieNode<T> {
    /// Parent index and the child slot this node occupies under it.
    /// `None` for the root.
    parent: Option<(usize, u8)>,
    partial_key: Nibbles,
    children: [Option<usize>; 16],
    has_storage_value: bool,
    user_data: T,
}

/// Result of looking up a key: a handle to the existing node, or a vacancy
/// that can be analyzed into an insertion plan.
#[derive(Debug)]
pub enum Entry {
    Occupied(NodeHandle),
    Vacant(Vacant),
}

/// What a node currently is: a storage node carries a value, a branch node
/// is purely structural. The two convert into each other in place when a
/// value is added or removed without changing the node's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHandle {
    Storage(NodeIndex),
    Branch(NodeIndex),
}

impl NodeHandle {
    pub fn index(self) -> NodeIndex {
        match self {
            Self::Storage(index) | Self::Branch(index) => index,
        }
    }

    pub fn has_storage_value(self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// A missing key, remembering the deepest existing ancestor whose full key
/// prefixes it.
#[derive(Debug)]
pub struct Vacant {
    key: Nibbles,
    closest_ancestor: Option<NodeIndex>,
}

/// Pure analysis of how to complete an insertion. No mutation happens until
/// the plan is passed to [`TrieStructure::insert`].
#[derive(Debug)]
pub enum InsertPlan {
    /// The trie is empty, the new node becomes the root.
    Empty { partial_key: Nibbles },
    /// One new node. It may adopt an existing node whose partial key
    /// extended past the new key.
    One {
        parent: Option<(NodeIndex, u8)>,
        partial_key: Nibbles,
        adopt: Option<Adoption>,
    },
    /// The new key and an existing node diverge mid-path: a structural
    /// branch node takes the common prefix, holding both as children.
    Two {
        parent: Option<(NodeIndex, u8)>,
        branch_partial_key: Nibbles,
        existing: Adoption,
        storage_nibble: u8,
        storage_partial_key: Nibbles,
    },
}

/// An existing node re-parented under a newly created one, with its partial
/// key truncated by the consumed prefix plus the child nibble.
#[derive(Debug)]
pub struct Adoption {
    pub node: NodeIndex,
    pub child_nibble: u8,
    pub new_partial_key: Nibbles,
}

/// Nodes whose cached user data became stale after a mutation: the deepest
/// changed node (walk its ancestors) plus any node whose partial key was
/// rewritten by re-parenting.
#[derive(Debug)]
pub struct DirtyPath {
    pub deepest: Option<NodeIndex>,
    pub reparented: Option<NodeIndex>,
}

impl<T> Default for TrieStructure<T> {
    fn default() -> Self {
        Self {
            nodes: Slab::new(),
            root: None,
        }
    }
}

impl<T> TrieStructure<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> Option<NodeIndex> {
        self.root.map(NodeIndex)
    }

    pub fn partial_key(&self, index: NodeIndex) -> &Nibbles {
        &self.nodes[index.0].partial_key
    }

    pub fn parent(&self, index: NodeIndex) -> Option<(NodeIndex, u8)> {
        self.nodes[index.0]
            .parent
            .map(|(parent, nibble)| (NodeIndex(parent), nibble))
    }

    pub fn child(&self, index: NodeIndex, nibble: u8) -> Option<NodeIndex> {
        self.nodes[index.0].children[nibble as usize].map(NodeIndex)
    }

    pub fn children(&self, index: NodeIndex) -> impl Iterator<Item = (u8, NodeIndex)> + '_ {
        self.nodes[index.0]
            .children
            .iter()
            .enumerate()
            .filter_map(|(nibble, child)| child.map(|child| (nibble as u8, NodeIndex(child))))
    }

    pub fn has_storage_value(&self, index: NodeIndex) -> bool {
        self.nodes[index.0].has_storage_value
    }

    pub fn user_data(&self, index: NodeIndex) -> &T {
        &self.nodes[index.0].user_data
    }

    pub fn user_data_mut(&mut self, index: NodeIndex) -> &mut T {
        &mut self.nodes[index.0].user_data
    }

    /// Converts a structural branch node into a storage node in place.
    pub fn mark_storage_value(&mut self, index: NodeIndex) {
        self.nodes[index.0].has_storage_value = true;
    }

    /// Full key of a node: ancestor child nibbles and partial keys followed
    /// by the node's own partial key.
    pub fn node_full_key(&self, index: NodeIndex) -> Nibbles {
        let mut segments = Vec::new();
        let mut current = Some(index.0);
        while let Some(i) = current {
            let node = &self.nodes[i];
            segments.push((node.parent.map(|(_, nibble)| nibble), &node.partial_key));
            current = node.parent.map(|(parent, _)| parent);
        }
        let mut key = Nibbles::default();
        for (nibble, partial_key) in segments.into_iter().rev() {
            if let Some(nibble) = nibble {
                key.append(nibble);
            }
            key.extend(partial_key);
        }
        key
    }

    /// Walks from the root consuming whole partial keys per step, O(depth).
    pub fn node(&self, key: &Nibbles) -> Entry {
        let Some(root) = self.root else {
            return Entry::Vacant(Vacant {
                key: key.clone(),
                closest_ancestor: None,
            });
        };
        let mut ancestor: Option<usize> = None;
        let mut current = root;
        let mut consumed = 0;
        loop {
            let node = &self.nodes[current];
            let remainder = key.offset(consumed);
            if !remainder.starts_with(&node.partial_key) {
                // The node's edge extends past or diverges from the key.
                return Entry::Vacant(Vacant {
                    key: key.clone(),
                    closest_ancestor: ancestor.map(NodeIndex),
                });
            }
            consumed += node.partial_key.len();
            if consumed == key.len() {
                let handle = if node.has_storage_value {
                    NodeHandle::Storage(NodeIndex(current))
                } else {
                    NodeHandle::Branch(NodeIndex(current))
                };
                return Entry::Occupied(handle);
            }
            let nibble = key.at(consumed);
            match node.children[nibble] {
                Some(child) => {
                    ancestor = Some(current);
                    consumed += 1;
                    current = child;
                }
                None => {
                    return Entry::Vacant(Vacant {
                        key: key.clone(),
                        closest_ancestor: Some(NodeIndex(current)),
                    });
                }
            }
        }
    }

    pub fn get(&self, key: &Nibbles) -> Option<NodeHandle> {
        match self.node(key) {
            Entry::Occupied(handle) => Some(handle),
            Entry::Vacant(_) => None,
        }
    }

    /// Determines how many nodes an insertion needs and where they attach.
    pub fn prepare_insert(&self, vacant: &Vacant) -> InsertPlan {
        match vacant.closest_ancestor {
            None => match self.root {
                None => InsertPlan::Empty {
                    partial_key: vacant.key.clone(),
                },
                Some(root) => self.analyze_conflict(None, NodeIndex(root), vacant.key.clone()),
            },
            Some(ancestor) => {
                let ancestor_len = self.node_full_key(ancestor).len();
                let child_nibble = vacant.key.at(ancestor_len) as u8;
                let new_partial = vacant.key.offset(ancestor_len + 1);
                match self.nodes[ancestor.0].children[child_nibble as usize] {
                    None => InsertPlan::One {
                        parent: Some((ancestor, child_nibble)),
                        partial_key: new_partial,
                        adopt: None,
                    },
                    Some(existing) => self.analyze_conflict(
                        Some((ancestor, child_nibble)),
                        NodeIndex(existing),
                        new_partial,
                    ),
                }
            }
        }
    }

    fn analyze_conflict(
        &self,
        parent: Option<(NodeIndex, u8)>,
        existing: NodeIndex,
        new_partial: Nibbles,
    ) -> InsertPlan {
        let existing_pk = &self.nodes[existing.0].partial_key;
        if existing_pk.starts_with(&new_partial) {
            // Strictly longer: the new node becomes the existing one's parent.
            let child_nibble = existing_pk.at(new_partial.len()) as u8;
            InsertPlan::One {
                parent,
                adopt: Some(Adoption {
                    node: existing,
                    child_nibble,
                    new_partial_key: existing_pk.offset(new_partial.len() + 1),
                }),
                partial_key: new_partial,
            }
        } else {
            let branch_len = new_partial.count_prefix(existing_pk);
            InsertPlan::Two {
                parent,
                branch_partial_key: new_partial.slice(0, branch_len),
                existing: Adoption {
                    node: existing,
                    child_nibble: existing_pk.at(branch_len) as u8,
                    new_partial_key: existing_pk.offset(branch_len + 1),
                },
                storage_nibble: new_partial.at(branch_len) as u8,
                storage_partial_key: new_partial.offset(branch_len + 1),
            }
        }
    }

    /// Commits an insertion plan. Returns the storage node's index and the
    /// dirty path for cache invalidation.
    pub fn insert(&mut self, plan: InsertPlan, user_data: T, branch_user_data: T) -> (NodeIndex, DirtyPath) {
        match plan {
            InsertPlan::Empty { partial_key } => {
                let index = self.nodes.insert(TrieNode {
                    parent: None,
                    partial_key,
                    children: [None; 16],
                    has_storage_value: true,
                    user_data,
                });
                self.root = Some(index);
                (
                    NodeIndex(index),
                    DirtyPath {
                        deepest: Some(NodeIndex(index)),
                        reparented: None,
                    },
                )
            }
            InsertPlan::One {
                parent,
                partial_key,
                adopt,
            } => {
                let mut children = [None; 16];
                if let Some(adoption) = &adopt {
                    children[adoption.child_nibble as usize] = Some(adoption.node.0);
                }
                let index = self.nodes.insert(TrieNode {
                    parent: parent.map(|(p, nibble)| (p.0, nibble)),
                    partial_key,
                    children,
                    has_storage_value: true,
                    user_data,
                });
                self.attach(parent, index);
                let reparented = adopt.map(|adoption| {
                    self.reparent(adoption.node, (index, adoption.child_nibble), adoption.new_partial_key);
                    adoption.node
                });
                (
                    NodeIndex(index),
                    DirtyPath {
                        deepest: Some(NodeIndex(index)),
                        reparented,
                    },
                )
            }
            InsertPlan::Two {
                parent,
                branch_partial_key,
                existing,
                storage_nibble,
                storage_partial_key,
            } => {
                let branch = self.nodes.insert(TrieNode {
                    parent: parent.map(|(p, nibble)| (p.0, nibble)),
                    partial_key: branch_partial_key,
                    children: [None; 16],
                    has_storage_value: false,
                    user_data: branch_user_data,
                });
                self.attach(parent, branch);
                let storage = self.nodes.insert(TrieNode {
                    parent: Some((branch, storage_nibble)),
                    partial_key: storage_partial_key,
                    children: [None; 16],
                    has_storage_value: true,
                    user_data,
                });
                self.nodes[branch].children[storage_nibble as usize] = Some(storage);
                self.nodes[branch].children[existing.child_nibble as usize] = Some(existing.node.0);
                self.reparent(existing.node, (branch, existing.child_nibble), existing.new_partial_key);
                (
                    NodeIndex(storage),
                    DirtyPath {
                        deepest: Some(NodeIndex(storage)),
                        reparented: Some(existing.node),
                    },
                )
            }
        }
    }

    fn attach(&mut self, parent: Option<(NodeIndex, u8)>, index: usize) {
        match parent {
            Some((parent, nibble)) => self.nodes[parent.0].children[nibble as usize] = Some(index),
            None => self.root = Some(index),
        }
    }

    fn reparent(&mut self, node: NodeIndex, new_parent: (usize, u8), new_partial_key: Nibbles) {
        let node = &mut self.nodes[node.0];
        node.parent = Some(new_parent);
        node.partial_key = new_partial_key;
    }

    /// Removes the storage value of a node and restructures the trie to
    /// uphold the branch invariant. The node itself may disappear.
    pub fn remove_storage_value(&mut self, index: NodeIndex) -> DirtyPath {
        debug_assert!(self.nodes[index.0].has_storage_value);
        let children_count = self.children(index).count();
        match children_count {
            0 => {
                let parent = self.nodes[index.0].parent;
                self.detach(index.0);
                self.nodes.remove(index.0);
                let Some((parent, _)) = parent else {
                    return DirtyPath {
                        deepest: None,
                        reparented: None,
                    };
                };
                let parent = NodeIndex(parent);
                // A value-less parent left with a single child is a
                // pass-through and collapses into that child.
                if !self.nodes[parent.0].has_storage_value
                    && self.children(parent).count() == 1
                {
                    let merged = self.merge_into_single_child(parent);
                    DirtyPath {
                        deepest: Some(merged),
                        reparented: Some(merged),
                    }
                } else {
                    DirtyPath {
                        deepest: Some(parent),
                        reparented: None,
                    }
                }
            }
            1 => {
                let merged = self.merge_into_single_child(index);
                DirtyPath {
                    deepest: Some(merged),
                    reparented: Some(merged),
                }
            }
            _ => {
                self.nodes[index.0].has_storage_value = false;
                DirtyPath {
                    deepest: Some(index),
                    reparented: None,
                }
            }
        }
    }

    /// Replaces a single-child node by that child, concatenating partial
    /// keys. Returns the surviving child's index.
    fn merge_into_single_child(&mut self, node: NodeIndex) -> NodeIndex {
        let (nibble, child) = self
            .children(node)
            .next()
            .unwrap_or_else(|| unreachable!("caller checked a single child exists"));
        let parent = self.nodes[node.0].parent;
        let mut merged_key = self.nodes[node.0].partial_key.clone();
        merged_key.append(nibble);
        merged_key.extend(&self.nodes[child.0].partial_key);

        let child_node = &mut self.nodes[child.0];
        child_node.partial_key = merged_key;
        child_node.parent = parent;
        match parent {
            Some((parent, slot)) => self.nodes[parent].children[slot as usize] = Some(child.0),
            None => self.root = Some(child.0),
        }
        self.nodes.remove(node.0);
        child
    }

    fn detach(&mut self, index: usize) {
        match self.nodes[index].parent {
            Some((parent, nibble)) => self.nodes[parent].children[nibble as usize] = None,
            None => self.root = None,
        }
    }

    /// Deepest node whose subtree contains exactly the keys extending
    /// `prefix`, together with its full key. Handles prefixes that end in
    /// the middle of a node's edge.
    pub fn subtree_at_prefix(&self, prefix: &Nibbles) -> Option<(NodeIndex, Nibbles)> {
        let mut current = self.root?;
        let mut consumed = 0;
        loop {
            let node = &self.nodes[current];
            let remainder = prefix.offset(consumed);
            if remainder.len() <= node.partial_key.len() {
                return node
                    .partial_key
                    .starts_with(&remainder)
                    .then(|| (NodeIndex(current), self.node_full_key(NodeIndex(current))));
            }
            if !remainder.starts_with(&node.partial_key) {
                return None;
            }
            consumed += node.partial_key.len();
            let nibble = prefix.at(consumed);
            current = node.children[nibble]?;
            consumed += 1;
        }
    }

    /// All node indices in lexicographic full-key order. Children are
    /// visited in ascending nibble order, parents before descendants.
    pub fn lexicographic_indices(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(index) = stack.pop() {
            order.push(NodeIndex(index));
            let node = &self.nodes[index];
            for child in node.children.iter().rev().flatten() {
                stack.push(*child);
            }
        }
        order
    }

    /// Smallest storage-bearing full key strictly greater than `key`.
    pub fn next_storage_key(&self, key: &Nibbles) -> Option<Nibbles> {
        let root = self.root?;
        let root_path = self.nodes[root].partial_key.clone();
        self.next_storage_key_in(root, root_path, key)
    }

    fn next_storage_key_in(&self, index: usize, path: Nibbles, key: &Nibbles) -> Option<Nibbles> {
        let node = &self.nodes[index];
        if node.has_storage_value && path > *key {
            return Some(path);
        }
        for (nibble, child) in node.children.iter().enumerate() {
            let Some(child) = *child else { continue };
            let mut child_path = path.clone();
            child_path.append(nibble as u8);
            child_path.extend(&self.nodes[child].partial_key);
            // A subtree on a smaller diverging path holds no candidate.
            if child_path.compare_prefix(key) == std::cmp::Ordering::Less {
                continue;
            }
            if let Some(found) = self.next_storage_key_in(child, child_path, key) {
                return Some(found);
            }
        }
        None
    }
}
