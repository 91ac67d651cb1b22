//! Record decoders for every DDS section.
//!
//! Decoders receive exactly the bytes of one record (the length prefix
//! included for variable-width records) and bounds-check every field.

use super::format::*;
use super::loader::DataSetError;
use crate::collection::Record;
use crate::types::{PropertyFlags, SignatureFlags};

fn need(bytes: &[u8], len: usize, what: &str) -> Result<(), DataSetError> {
    if bytes.len() < len {
        Err(DataSetError::CorruptData(format!(
            "{what} record needs {len} bytes, has {}",
            bytes.len()
        )))
    } else {
        Ok(())
    }
}

fn u32_list(bytes: &[u8], start: usize, count: usize) -> Vec<u32> {
    (0..count).map(|i| read_u32_le(bytes, start + i * 4)).collect()
}

// =============================================================================
// Catalog
// =============================================================================

/// Header name entry.
#[derive(Debug, Clone, Copy)]
pub struct HeaderRecord {
    pub name_offset: u32,
    pub name_length: u32,
}

impl Record for HeaderRecord {
    const FIXED_SIZE: Option<usize> = Some(HEADER_ENTRY_SIZE);

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        need(bytes, HEADER_ENTRY_SIZE, "header")?;
        Ok(Self {
            name_offset: read_u32_le(bytes, 0),
            name_length: read_u32_le(bytes, 4),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ComponentRecord {
    pub name_offset: u32,
    pub name_length: u32,
    pub default_profile_id: u32,
    pub headers: Vec<u32>,
}

impl Record for ComponentRecord {
    const FIXED_SIZE: Option<usize> = None;

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        use component_record::*;
        need(bytes, COMPONENT_FIXED_SIZE, "component")?;
        let count = read_u32_le(bytes, HEADER_COUNT) as usize;
        need(bytes, COMPONENT_FIXED_SIZE + count * 4, "component")?;
        Ok(Self {
            name_offset: read_u32_le(bytes, NAME_OFFSET),
            name_length: read_u32_le(bytes, NAME_LENGTH),
            default_profile_id: read_u32_le(bytes, DEFAULT_PROFILE_ID),
            headers: u32_list(bytes, COMPONENT_FIXED_SIZE, count),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PropertyRecord {
    pub name_offset: u32,
    pub name_length: u32,
    pub component: u8,
    pub flags: PropertyFlags,
    pub first_value: u32,
    pub value_count: u32,
    pub overrides_property: Option<u32>,
    pub suppress_headers: Vec<u32>,
}

impl Record for PropertyRecord {
    const FIXED_SIZE: Option<usize> = None;

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        use property_record::*;
        need(bytes, PROPERTY_FIXED_SIZE, "property")?;
        let count = read_u32_le(bytes, SUPPRESS_COUNT) as usize;
        need(bytes, PROPERTY_FIXED_SIZE + count * 4, "property")?;
        let overrides = read_u32_le(bytes, OVERRIDES_PROPERTY);
        Ok(Self {
            name_offset: read_u32_le(bytes, NAME_OFFSET),
            name_length: read_u32_le(bytes, NAME_LENGTH),
            component: bytes[COMPONENT],
            flags: PropertyFlags::from_bits_truncate(bytes[FLAGS]),
            first_value: read_u32_le(bytes, FIRST_VALUE),
            value_count: read_u32_le(bytes, VALUE_COUNT),
            overrides_property: (overrides != NO_INDEX).then_some(overrides),
            suppress_headers: u32_list(bytes, PROPERTY_FIXED_SIZE, count),
        })
    }
}

/// A property value string.
#[derive(Debug, Clone, Copy)]
pub struct ValueRecord {
    pub property: u32,
    pub name_offset: u32,
    pub name_length: u32,
}

impl Record for ValueRecord {
    const FIXED_SIZE: Option<usize> = Some(VALUE_ENTRY_SIZE);

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        need(bytes, VALUE_ENTRY_SIZE, "value")?;
        Ok(Self {
            property: read_u32_le(bytes, 0),
            name_offset: read_u32_le(bytes, 4),
            name_length: read_u32_le(bytes, 8),
        })
    }
}

// =============================================================================
// Profiles
// =============================================================================

/// A profile: the values of one component for one device facet.
#[derive(Debug, Clone)]
pub struct Profile {
    pub component: u8,
    pub profile_id: u32,
    /// Value indexes, ascending (and therefore grouped by property).
    pub values: Vec<u32>,
}

impl Record for Profile {
    const FIXED_SIZE: Option<usize> = None;

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        use profile_record::*;
        need(bytes, PROFILE_FIXED_SIZE, "profile")?;
        let count = read_u32_le(bytes, VALUE_COUNT) as usize;
        need(bytes, PROFILE_FIXED_SIZE + count * 4, "profile")?;
        Ok(Self {
            component: bytes[COMPONENT],
            profile_id: read_u32_le(bytes, PROFILE_ID),
            values: u32_list(bytes, PROFILE_FIXED_SIZE, count),
        })
    }
}

/// Profile id to profile record offset.
#[derive(Debug, Clone, Copy)]
pub struct ProfileOffset {
    pub profile_id: u32,
    pub offset: u32,
}

impl Record for ProfileOffset {
    const FIXED_SIZE: Option<usize> = Some(PROFILE_OFFSET_ENTRY_SIZE);

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        need(bytes, PROFILE_OFFSET_ENTRY_SIZE, "profile offset")?;
        Ok(Self {
            profile_id: read_u32_le(bytes, 0),
            offset: read_u32_le(bytes, 4),
        })
    }
}

// =============================================================================
// Pattern engine
// =============================================================================

/// Numeric child: digit-only child key parsed to its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericChild {
    pub value: i32,
    pub offset: u32,
}

/// Pattern node.
///
/// A node at `position` covers the target characters
/// `position + 1 ..= root position`; `characters` holds them. Every child of
/// a node has a key of `child_key_length` characters, ending at the node's
/// own position.
#[derive(Debug, Clone)]
pub struct Node {
    pub position: i16,
    pub next_char_position: i16,
    pub parent_offset: u32,
    pub signature_count: u32,
    pub first_signature: u32,
    pub child_key_length: u16,
    pub children: Vec<u32>,
    keys: Vec<u8>,
    pub numeric_children: Vec<NumericChild>,
    pub characters: Vec<u8>,
}

impl Node {
    /// A complete node ends a significant substring.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.next_char_position != NO_POSITION
    }

    /// First target index covered by the node.
    #[inline]
    pub fn start(&self) -> i32 {
        self.position as i32 + 1
    }

    pub fn child_key(&self, index: usize) -> &[u8] {
        let len = self.child_key_length as usize;
        &self.keys[index * len..(index + 1) * len]
    }

    /// Binary search the children for an exact key.
    pub fn find_child(&self, key: &[u8]) -> Option<u32> {
        if key.len() != self.child_key_length as usize || self.children.is_empty() {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.children.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.child_key(mid).cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(self.children[mid]),
            }
        }
        None
    }
}

impl Record for Node {
    const FIXED_SIZE: Option<usize> = None;

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        use node_record::*;
        need(bytes, NODE_FIXED_SIZE, "node")?;
        let children_count = read_u16_le(bytes, CHILDREN_COUNT) as usize;
        let numeric_count = read_u16_le(bytes, NUMERIC_CHILDREN_COUNT) as usize;
        let characters_length = read_u16_le(bytes, CHARACTERS_LENGTH) as usize;
        let child_key_length = read_u16_le(bytes, CHILD_KEY_LENGTH);

        let children_start = NODE_FIXED_SIZE;
        let keys_start = children_start + children_count * 4;
        let numeric_start = keys_start + children_count * child_key_length as usize;
        let characters_start = numeric_start + numeric_count * NUMERIC_CHILD_SIZE;
        need(bytes, characters_start + characters_length, "node")?;

        let numeric_children = (0..numeric_count)
            .map(|i| {
                let at = numeric_start + i * NUMERIC_CHILD_SIZE;
                NumericChild {
                    value: read_i32_le(bytes, at),
                    offset: read_u32_le(bytes, at + 4),
                }
            })
            .collect();

        Ok(Self {
            position: read_i16_le(bytes, POSITION),
            next_char_position: read_i16_le(bytes, NEXT_CHAR_POSITION),
            parent_offset: read_u32_le(bytes, PARENT_OFFSET),
            signature_count: read_u32_le(bytes, SIGNATURE_COUNT),
            first_signature: read_u32_le(bytes, FIRST_SIGNATURE),
            child_key_length,
            children: u32_list(bytes, children_start, children_count),
            keys: bytes[keys_start..numeric_start].to_vec(),
            numeric_children,
            characters: bytes[characters_start..characters_start + characters_length].to_vec(),
        })
    }
}

/// Pattern signature.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub first_node: u32,
    pub node_count: u16,
    pub flags: SignatureFlags,
    pub rank: u32,
}

impl Record for Signature {
    const FIXED_SIZE: Option<usize> = Some(SIGNATURE_ENTRY_SIZE);

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        use signature_entry::*;
        need(bytes, SIGNATURE_ENTRY_SIZE, "signature")?;
        Ok(Self {
            first_node: read_u32_le(bytes, FIRST_NODE),
            node_count: read_u16_le(bytes, NODE_COUNT),
            flags: SignatureFlags::from_bits_truncate(read_u16_le(bytes, FLAGS)),
            rank: read_u32_le(bytes, RANK),
        })
    }
}

// =============================================================================
// Graph engine
// =============================================================================

/// Graph roots for one (component, header) pair.
#[derive(Debug, Clone, Copy)]
pub struct GraphRecord {
    pub component: u16,
    pub header: u16,
    pub performance_root: u32,
    pub predictive_root: u32,
}

impl Record for GraphRecord {
    const FIXED_SIZE: Option<usize> = Some(GRAPH_ENTRY_SIZE);

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        need(bytes, GRAPH_ENTRY_SIZE, "graph")?;
        Ok(Self {
            component: read_u16_le(bytes, 0),
            header: read_u16_le(bytes, 2),
            performance_root: read_u32_le(bytes, 4),
            predictive_root: read_u32_le(bytes, 8),
        })
    }
}

/// Graph hash table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSlot {
    pub hash: u32,
    pub value: i32,
}

/// Graph node: a perfect hash table of substring hashes expected to start
/// within `first_index..=last_index`.
#[derive(Debug, Clone)]
pub struct HashNode {
    pub first_index: i16,
    pub last_index: i16,
    pub length: u16,
    pub modulo: u32,
    pub unmatched: i32,
    pub hash_count: u32,
    pub slots: Vec<HashSlot>,
}

impl HashNode {
    /// Child value stored for `hash`, if any.
    #[inline]
    pub fn lookup(&self, hash: u32) -> Option<i32> {
        if self.modulo == 0 {
            return None;
        }
        let slot = self.slots[(hash % self.modulo) as usize];
        (slot.hash == hash && slot.value != GRAPH_NO_MATCH).then_some(slot.value)
    }
}

impl Record for HashNode {
    const FIXED_SIZE: Option<usize> = None;

    fn decode(bytes: &[u8]) -> Result<Self, DataSetError> {
        use hash_node_record::*;
        need(bytes, HASH_NODE_FIXED_SIZE, "graph node")?;
        let modulo = read_u32_le(bytes, MODULO);
        need(bytes, HASH_NODE_FIXED_SIZE + modulo as usize * HASH_SLOT_SIZE, "graph node")?;
        let slots = (0..modulo as usize)
            .map(|i| {
                let at = HASH_NODE_FIXED_SIZE + i * HASH_SLOT_SIZE;
                HashSlot {
                    hash: read_u32_le(bytes, at),
                    value: read_i32_le(bytes, at + 4),
                }
            })
            .collect();
        Ok(Self {
            first_index: read_i16_le(bytes, FIRST_INDEX),
            last_index: read_i16_le(bytes, LAST_INDEX),
            length: read_u16_le(bytes, SUBSTRING_LENGTH),
            modulo,
            unmatched: read_i32_le(bytes, UNMATCHED),
            hash_count: read_u32_le(bytes, HASH_COUNT),
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_bytes(keys: &[&[u8]], characters: &[u8]) -> Vec<u8> {
        use node_record::*;
        let key_len = keys.first().map_or(0, |k| k.len());
        let mut out = vec![0u8; NODE_FIXED_SIZE];
        out[POSITION..POSITION + 2].copy_from_slice(&3i16.to_le_bytes());
        out[NEXT_CHAR_POSITION..NEXT_CHAR_POSITION + 2].copy_from_slice(&NO_POSITION.to_le_bytes());
        out[CHILDREN_COUNT..CHILDREN_COUNT + 2].copy_from_slice(&(keys.len() as u16).to_le_bytes());
        out[CHARACTERS_LENGTH..CHARACTERS_LENGTH + 2].copy_from_slice(&(characters.len() as u16).to_le_bytes());
        out[CHILD_KEY_LENGTH..CHILD_KEY_LENGTH + 2].copy_from_slice(&(key_len as u16).to_le_bytes());
        for i in 0..keys.len() {
            out.extend_from_slice(&(100 + i as u32).to_le_bytes());
        }
        for key in keys {
            out.extend_from_slice(key);
        }
        out.extend_from_slice(characters);
        let len = out.len() as u32;
        out[..4].copy_from_slice(&len.to_le_bytes());
        out
    }

    #[test]
    fn node_finds_children_by_key() {
        let node = Node::decode(&node_bytes(&[b"ab", b"cd", b"xy"], b"Mobile")).unwrap();
        assert!(!node.is_complete());
        assert_eq!(node.start(), 4);
        assert_eq!(node.characters, b"Mobile");
        assert_eq!(node.find_child(b"cd"), Some(101));
        assert_eq!(node.find_child(b"xy"), Some(102));
        assert_eq!(node.find_child(b"zz"), None);
        assert_eq!(node.find_child(b"c"), None);
    }

    #[test]
    fn truncated_node_is_corrupt() {
        let mut bytes = node_bytes(&[b"ab"], b"Mobile");
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(Node::decode(&bytes), Err(DataSetError::CorruptData(_))));
    }

    #[test]
    fn hash_node_lookup_ignores_empty_slots() {
        let node = HashNode {
            first_index: 0,
            last_index: 0,
            length: 2,
            modulo: 3,
            unmatched: GRAPH_NO_MATCH,
            hash_count: 1,
            slots: vec![
                HashSlot { hash: 0, value: GRAPH_NO_MATCH },
                HashSlot { hash: 7, value: 40 },
                HashSlot { hash: 0, value: GRAPH_NO_MATCH },
            ],
        };
        assert_eq!(node.lookup(7), Some(40));
        assert_eq!(node.lookup(10), None);
        assert_eq!(node.lookup(0), None);
    }
}
