use crate::{
    error::NodeDecodeError,
    merkle_value::{MerkleValue, blake2b_256},
    nibbles::Nibbles,
    scale,
};

/// Longest partial key the header length accumulator accepts.
const MAX_PARTIAL_KEY_LEN: usize = u16::MAX as usize;

/// Policy flag controlling whether large storage values are hashed before
/// being embedded in a node's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateVersion {
    V0,
    #[default]
    V1,
}

/// Values of 33 bytes or more are replaced by their hash under V1.
const VALUE_HASHING_THRESHOLD: usize = 33;

/// A storage value as it appears inside a node encoding: either the raw
/// bytes, or their 32-byte hash with the preimage stored out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageValue {
    pub value: Vec<u8>,
    pub is_hashed: bool,
}

impl StorageValue {
    /// Applies the state version's hashing policy to a raw value.
    pub fn from_value(value: Vec<u8>, version: StateVersion) -> Self {
        if version == StateVersion::V1 && value.len() >= VALUE_HASHING_THRESHOLD {
            Self {
                value: blake2b_256(&value).as_bytes().to_vec(),
                is_hashed: true,
            }
        } else {
            Self {
                value,
                is_hashed: false,
            }
        }
    }
}

/// Node kind selector encoded in the high bits of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeVariant {
    Empty,
    Leaf,
    LeafWithHashedValue,
    Branch,
    BranchWithValue,
    BranchWithHashedValue,
}

impl NodeVariant {
    fn header_bits(self) -> u8 {
        match self {
            Self::Empty => 0b0000_0000,
            Self::Leaf => 0b0100_0000,
            Self::LeafWithHashedValue => 0b0010_0000,
            Self::Branch => 0b1000_0000,
            Self::BranchWithValue => 0b1100_0000,
            Self::BranchWithHashedValue => 0b0001_0000,
        }
    }

    /// Bits of the header byte left for the partial key length.
    fn partial_key_len_bits(self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Leaf | Self::Branch | Self::BranchWithValue => 6,
            Self::LeafWithHashedValue => 5,
            Self::BranchWithHashedValue => 4,
        }
    }

    fn has_children(self) -> bool {
        matches!(
            self,
            Self::Branch | Self::BranchWithValue | Self::BranchWithHashedValue
        )
    }
}

/// External, link-free view of one trie node: child merkle values, partial
/// key and optional storage value. This is the unit of the wire format and
/// of merkle value computation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedNode {
    pub children: [Option<MerkleValue>; 16],
    pub partial_key: Nibbles,
    pub storage_value: Option<StorageValue>,
}

impl DecodedNode {
    pub fn new(
        children: [Option<MerkleValue>; 16],
        partial_key: Nibbles,
        storage_value: Option<StorageValue>,
    ) -> Self {
        Self {
            children,
            partial_key,
            storage_value,
        }
    }

    pub fn children_bitmap(&self) -> u16 {
        let mut bitmap = 0u16;
        for (i, child) in self.children.iter().enumerate() {
            if child.is_some() {
                bitmap |= 1 << i;
            }
        }
        bitmap
    }

    fn variant(&self) -> NodeVariant {
        let has_children = self.children.iter().any(Option::is_some);
        match (&self.storage_value, has_children) {
            (None, false) => NodeVariant::Empty,
            (None, true) => NodeVariant::Branch,
            (Some(value), false) if value.is_hashed => NodeVariant::LeafWithHashedValue,
            (Some(_), false) => NodeVariant::Leaf,
            (Some(value), true) if value.is_hashed => NodeVariant::BranchWithHashedValue,
            (Some(_), true) => NodeVariant::BranchWithValue,
        }
    }

    /// Encodes the node into its canonical byte format
    pub fn encode(&self) -> Vec<u8> {
        let variant = self.variant();
        let mut out = Vec::new();
        encode_header(variant, self.partial_key.len(), &mut out);
        if variant == NodeVariant::Empty {
            return out;
        }
        out.extend_from_slice(&self.partial_key.to_padded_bytes());
        if variant.has_children() {
            out.extend_from_slice(&self.children_bitmap().to_le_bytes());
        }
        match &self.storage_value {
            Some(value) if value.is_hashed => out.extend_from_slice(&value.value),
            Some(value) => {
                scale::encode_compact(value.value.len() as u32, &mut out);
                out.extend_from_slice(&value.value);
            }
            None => {}
        }
        for child in self.children.iter().flatten() {
            let bytes = child.as_bytes();
            scale::encode_compact(bytes.len() as u32, &mut out);
            out.extend_from_slice(bytes);
        }
        out
    }

    /// Decodes a node from its canonical byte format
    pub fn decode(encoding: &[u8]) -> Result<Self, NodeDecodeError> {
        let mut input = encoding;
        let (variant, partial_key_len) = decode_header(&mut input)?;
        if variant == NodeVariant::Empty {
            if !input.is_empty() {
                return Err(NodeDecodeError::TrailingBytes);
            }
            return Ok(Self::default());
        }

        let packed_len = partial_key_len.div_ceil(2);
        let packed = input
            .get(..packed_len)
            .ok_or(NodeDecodeError::UnexpectedEof)?;
        if partial_key_len % 2 == 1 && packed[0] >> 4 != 0 {
            return Err(NodeDecodeError::NonZeroPadding);
        }
        let partial_key = Nibbles::from_packed(packed, partial_key_len);
        input = &input[packed_len..];

        let bitmap = if variant.has_children() {
            let bytes: [u8; 2] = input
                .get(..2)
                .and_then(|b| b.try_into().ok())
                .ok_or(NodeDecodeError::UnexpectedEof)?;
            input = &input[2..];
            let bitmap = u16::from_le_bytes(bytes);
            if bitmap == 0 {
                return Err(NodeDecodeError::EmptyChildrenBitmap);
            }
            bitmap
        } else {
            0
        };

        let storage_value = match variant {
            NodeVariant::Leaf | NodeVariant::BranchWithValue => {
                let len = scale::decode_compact(&mut input)? as usize;
                let value = input.get(..len).ok_or(NodeDecodeError::UnexpectedEof)?;
                let value = value.to_vec();
                input = &input[len..];
                Some(StorageValue {
                    value,
                    is_hashed: false,
                })
            }
            NodeVariant::LeafWithHashedValue | NodeVariant::BranchWithHashedValue => {
                let hash = input.get(..32).ok_or(NodeDecodeError::UnexpectedEof)?;
                let value = hash.to_vec();
                input = &input[32..];
                Some(StorageValue {
                    value,
                    is_hashed: true,
                })
            }
            NodeVariant::Branch => None,
            NodeVariant::Empty => unreachable!(),
        };

        let mut children: [Option<MerkleValue>; 16] = Default::default();
        for (i, child) in children.iter_mut().enumerate() {
            if bitmap & (1 << i) == 0 {
                continue;
            }
            let len = scale::decode_compact(&mut input)? as usize;
            if len > 32 {
                return Err(NodeDecodeError::ChildTooLong(len));
            }
            let bytes = input.get(..len).ok_or(NodeDecodeError::UnexpectedEof)?;
            *child = Some(MerkleValue::from_bytes(bytes));
            input = &input[len..];
        }

        if !input.is_empty() {
            return Err(NodeDecodeError::TrailingBytes);
        }

        Ok(Self {
            children,
            partial_key,
            storage_value,
        })
    }

    /// Computes the node's merkle value. The root is hashed unconditionally,
    /// other nodes only when their encoding reaches 32 bytes.
    pub fn merkle_value(&self, is_root: bool) -> MerkleValue {
        MerkleValue::from_encoding(&self.encode(), is_root)
    }
}

fn encode_header(variant: NodeVariant, partial_key_len: usize, out: &mut Vec<u8>) {
    let len_bits = variant.partial_key_len_bits();
    if len_bits == 0 {
        out.push(variant.header_bits());
        return;
    }
    let max_inline = (1usize << len_bits) - 1;
    if partial_key_len < max_inline {
        out.push(variant.header_bits() | partial_key_len as u8);
        return;
    }
    out.push(variant.header_bits() | max_inline as u8);
    let mut remaining = partial_key_len - max_inline;
    while remaining >= 255 {
        out.push(255);
        remaining -= 255;
    }
    out.push(remaining as u8);
}

fn decode_header(input: &mut &[u8]) -> Result<(NodeVariant, usize), NodeDecodeError> {
    let header = *input.first().ok_or(NodeDecodeError::UnexpectedEof)?;
    *input = &input[1..];

    let variant = match header >> 6 {
        0b01 => NodeVariant::Leaf,
        0b10 => NodeVariant::Branch,
        0b11 => NodeVariant::BranchWithValue,
        _ => {
            if header == 0 {
                return Ok((NodeVariant::Empty, 0));
            } else if header >> 5 == 0b001 {
                NodeVariant::LeafWithHashedValue
            } else if header >> 4 == 0b0001 {
                NodeVariant::BranchWithHashedValue
            } else {
                return Err(NodeDecodeError::UnknownHeader(header));
            }
        }
    };

    let max_inline = (1usize << variant.partial_key_len_bits()) - 1;
    let mut len = (header as usize) & max_inline;
    if len == max_inline {
        // Continuation bytes, each adding up to 255, ending at the first
        // byte below 255.
        loop {
            let byte = *input.first().ok_or(NodeDecodeError::UnexpectedEof)?;
            *input = &input[1..];
            len = len
                .checked_add(byte as usize)
                .filter(|len| *len <= MAX_PARTIAL_KEY_LEN)
                .ok_or(NodeDecodeError::PartialKeyLenOverflow)?;
            if byte < 255 {
                break;
            }
        }
    }
    Ok((variant, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{collection::vec, option, prelude::*};

    fn leaf(partial_key: &[u8], value: &[u8]) -> DecodedNode {
        DecodedNode::new(
            Default::default(),
            Nibbles::from_hex(partial_key),
            Some(StorageValue {
                value: value.to_vec(),
                is_hashed: false,
            }),
        )
    }

    #[test]
    fn leaf_header_example() {
        // Leaf variant 0b01 with a single-nibble partial key
        let encoding = leaf(&[0x9], &[0xde, 0xad]).encode();
        assert_eq!(encoding[0], 0b0100_0001);
        assert_eq!(encoding, vec![0b0100_0001, 0x09, 0x08, 0xde, 0xad]);
    }

    #[test]
    fn unknown_header_is_rejected() {
        assert_eq!(
            DecodedNode::decode(&[0x01]),
            Err(NodeDecodeError::UnknownHeader(0x01))
        );
    }

    #[test]
    fn empty_node_round_trip() {
        let empty = DecodedNode::default();
        assert_eq!(empty.encode(), vec![0x00]);
        assert_eq!(DecodedNode::decode(&[0x00]).unwrap(), empty);
    }

    #[test]
    fn nonzero_padding_is_rejected() {
        // Odd partial key whose pad nibble is 0xf
        let mut encoding = leaf(&[0x9], &[0xde, 0xad]).encode();
        encoding[1] = 0xf9;
        assert_eq!(
            DecodedNode::decode(&encoding),
            Err(NodeDecodeError::NonZeroPadding)
        );
    }

    #[test]
    fn zero_children_bitmap_is_rejected() {
        // Branch-without-value header, empty partial key, zeroed bitmap
        let encoding = vec![0b1000_0000, 0x00, 0x00];
        assert_eq!(
            DecodedNode::decode(&encoding),
            Err(NodeDecodeError::EmptyChildrenBitmap)
        );
    }

    #[test]
    fn oversized_child_is_rejected() {
        let mut node = DecodedNode::default();
        node.children[3] = Some(MerkleValue::Hashed(blake2b_256(b"child")));
        let mut encoding = node.encode();
        // Grow the child's recorded length past 32
        let child_len_at = encoding.len() - 33;
        encoding[child_len_at] = 33 << 2;
        encoding.push(0xaa);
        assert_eq!(
            DecodedNode::decode(&encoding),
            Err(NodeDecodeError::ChildTooLong(33))
        );
    }

    #[test]
    fn long_partial_key_uses_continuation_bytes() {
        let node = leaf(&vec![0x1; 700], &[0xff]);
        let encoding = node.encode();
        // 6-bit field saturated at 63, then 255 + 255 + 127
        assert_eq!(&encoding[..4], &[0b0111_1111, 255, 255, 127]);
        assert_eq!(DecodedNode::decode(&encoding).unwrap(), node);
    }

    #[test]
    fn truncated_continuation_is_rejected() {
        assert_eq!(
            DecodedNode::decode(&[0b0111_1111, 255]),
            Err(NodeDecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn hashed_value_leaf_round_trip() {
        let value = vec![0xab; 100];
        let node = DecodedNode::new(
            Default::default(),
            Nibbles::from_hex(&[0x1, 0x2]),
            Some(StorageValue::from_value(value.clone(), StateVersion::V1)),
        );
        let storage = node.storage_value.as_ref().unwrap();
        assert!(storage.is_hashed);
        assert_eq!(storage.value, blake2b_256(&value).as_bytes());
        let encoding = node.encode();
        assert_eq!(encoding[0] >> 5, 0b001);
        assert_eq!(DecodedNode::decode(&encoding).unwrap(), node);
    }

    #[test]
    fn v0_never_hashes_values() {
        let storage = StorageValue::from_value(vec![0xab; 100], StateVersion::V0);
        assert!(!storage.is_hashed);
        let storage = StorageValue::from_value(vec![0xab; 32], StateVersion::V1);
        assert!(!storage.is_hashed);
    }

    #[test]
    fn small_node_is_inlined_root_is_not() {
        let node = leaf(&[0x9], &[0xde, 0xad]);
        assert!(node.encode().len() < 32);
        assert!(!node.merkle_value(false).is_hashed());
        assert!(node.merkle_value(true).is_hashed());
    }

    fn merkle_value_strategy() -> impl Strategy<Value = MerkleValue> {
        vec(any::<u8>(), 0..=32).prop_map(|bytes| {
            if bytes.len() == 32 {
                MerkleValue::from_bytes(&bytes)
            } else {
                MerkleValue::Inline(bytes)
            }
        })
    }

    fn decoded_node_strategy() -> impl Strategy<Value = DecodedNode> {
        (
            vec(option::of(merkle_value_strategy()), 16),
            vec(0u8..16, 0..80),
            option::of((vec(any::<u8>(), 0..64), any::<bool>())),
        )
            .prop_map(|(children, partial_key, value)| {
                let mut slots: [Option<MerkleValue>; 16] = Default::default();
                for (slot, child) in slots.iter_mut().zip(children) {
                    *slot = child;
                }
                let storage_value = value.map(|(value, is_hashed)| {
                    if is_hashed {
                        StorageValue {
                            value: blake2b_256(&value).as_bytes().to_vec(),
                            is_hashed: true,
                        }
                    } else {
                        StorageValue {
                            value,
                            is_hashed: false,
                        }
                    }
                });
                DecodedNode::new(slots, Nibbles::from_hex(&partial_key), storage_value)
            })
    }

    proptest! {
        #[test]
        fn proptest_encode_decode_round_trip(node in decoded_node_strategy()) {
            let encoding = node.encode();
            let decoded = DecodedNode::decode(&encoding)?;
            // The empty-node encoding drops the partial key, everything else
            // must survive unchanged.
            if node.storage_value.is_some() || node.children_bitmap() != 0 {
                prop_assert_eq!(decoded, node);
            } else {
                prop_assert_eq!(encoding, vec![0x00]);
            }
        }
    }
}
