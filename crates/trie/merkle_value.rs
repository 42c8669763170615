use blake2::{Blake2b, Digest, digest::consts::U32};
use ethereum_types::H256;

pub type Blake2b256 = Blake2b<U32>;

pub fn blake2b_256(data: &[u8]) -> H256 {
    H256::from_slice(&Blake2b256::digest(data))
}

/// Content address of a node: the Blake2b-256 hash of its encoding, or the
/// encoding itself when it is shorter than 32 bytes and the node is not the
/// root. Inlined nodes live inside their parent's encoding and are never
/// stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MerkleValue {
    Hashed(H256),
    Inline(Vec<u8>),
}

impl MerkleValue {
    /// Computes the merkle value of a node encoding. The root is always
    /// hashed regardless of size.
    pub fn from_encoding(encoding: &[u8], is_root: bool) -> Self {
        if is_root || encoding.len() >= 32 {
            Self::Hashed(blake2b_256(encoding))
        } else {
            Self::Inline(encoding.to_vec())
        }
    }

    /// Reconstructs a merkle value from the bytes a parent recorded for a
    /// child. Exactly 32 bytes always means a hash, since any encoding that
    /// long would itself have been hashed.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() == 32 {
            Self::Hashed(H256::from_slice(bytes))
        } else {
            Self::Inline(bytes.to_vec())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Hashed(hash) => hash.as_bytes(),
            Self::Inline(encoding) => encoding,
        }
    }

    pub fn is_hashed(&self) -> bool {
        matches!(self, Self::Hashed(_))
    }

    /// The hash, for merkle values known to be hashed (e.g. the root).
    pub fn hash(&self) -> Option<H256> {
        match self {
            Self::Hashed(hash) => Some(*hash),
            Self::Inline(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_encoding_is_inlined() {
        let encoding = vec![0x41, 0x01, 0x04, 0xff];
        assert_eq!(
            MerkleValue::from_encoding(&encoding, false),
            MerkleValue::Inline(encoding)
        );
    }

    #[test]
    fn root_is_always_hashed() {
        let encoding = vec![0x41, 0x01, 0x04, 0xff];
        let merkle = MerkleValue::from_encoding(&encoding, true);
        assert_eq!(merkle, MerkleValue::Hashed(blake2b_256(&encoding)));
    }

    #[test]
    fn long_encoding_is_hashed() {
        let encoding = vec![0xab; 32];
        let merkle = MerkleValue::from_encoding(&encoding, false);
        assert!(merkle.is_hashed());
        assert_eq!(merkle.as_bytes().len(), 32);
    }

    #[test]
    fn from_bytes_distinguishes_by_length() {
        assert!(MerkleValue::from_bytes(&[0u8; 32]).is_hashed());
        assert!(!MerkleValue::from_bytes(&[0u8; 31]).is_hashed());
    }
}
