//! DDS Data Set Format v1 Constants
//!
//! All values are little-endian. A data set is a 64 byte header, a section
//! directory and a run of 4-byte aligned sections. Every section starts with
//! a `u32` record count. Fixed-width sections are addressed by record index,
//! variable-width sections by byte offset from the first record, and every
//! variable-width record starts with its own `u32` total length.

/// Magic bytes: "DDS1"
pub const DDS_MAGIC: [u8; 4] = [0x44, 0x44, 0x53, 0x31];

/// Format version this build reads.
pub const DDS_VERSION_MAJOR: u16 = 1;
pub const DDS_VERSION_MINOR: u16 = 0;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Section directory entry size
pub const SECTION_ENTRY_SIZE: usize = 24;

/// Size of the record count that prefixes every section.
pub const SECTION_COUNT_SIZE: usize = 4;

// =============================================================================
// Header Field Offsets
// =============================================================================

/// Header field byte offsets.
pub mod header {
    /// u8[4] magic = "DDS1"
    pub const MAGIC: usize = 0;
    /// u16 major version
    pub const VERSION_MAJOR: usize = 4;
    /// u16 minor version
    pub const VERSION_MINOR: usize = 6;
    /// u16 flags
    pub const FLAGS: usize = 8;
    /// u16 component count
    pub const COMPONENT_COUNT: usize = 10;
    /// u32 headerBytes (always 64)
    pub const HEADER_BYTES: usize = 12;
    /// u32 sectionCount
    pub const SECTION_COUNT: usize = 16;
    /// u32 sectionDirOffset
    pub const SECTION_DIR_OFFSET: usize = 20;
    /// u32 sectionDirBytes
    pub const SECTION_DIR_BYTES: usize = 24;
    /// u32 buildId
    pub const BUILD_ID: usize = 28;
    /// u32 dataSetCrc32
    pub const DATA_SET_CRC32: usize = 32;
    /// u32 published, seconds since the epoch
    pub const PUBLISHED: usize = 36;
    /// u32 name offset in the string pool
    pub const NAME_OFFSET: usize = 40;
    /// u32 name length
    pub const NAME_LENGTH: usize = 44;
}

// =============================================================================
// Section Directory Entry Offsets
// =============================================================================

pub mod section_entry {
    /// u16 section id
    pub const ID: usize = 0;
    /// u16 flags
    pub const FLAGS: usize = 2;
    /// u32 file offset
    pub const OFFSET: usize = 4;
    /// u32 byte length
    pub const LENGTH: usize = 8;
    /// u32 uncompressed length (0 if not compressed)
    pub const UNCOMPRESSED_LENGTH: usize = 12;
    /// u32 CRC32 (0 if unused)
    pub const CRC32: usize = 16;
}

// =============================================================================
// Section IDs
// =============================================================================

/// Section type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum SectionId {
    /// String pool for all interned strings
    StrPool = 0x0001,
    /// HTTP header names
    Headers = 0x0002,
    /// Components with their default profile and header precedence
    Components = 0x0003,
    /// Property catalog
    Properties = 0x0004,
    /// Property values, grouped by property
    Values = 0x0005,
    /// Profiles (variable width, offset addressed)
    Profiles = 0x0006,
    /// `{profile_id, offset}` pairs sorted by id
    ProfileOffsets = 0x0007,
    /// Pattern root node offset per character position
    RootNodes = 0x0008,
    /// Pattern nodes (variable width, offset addressed)
    Nodes = 0x0009,
    /// Pattern signatures
    Signatures = 0x000A,
    /// Node offsets referenced by signatures
    SignatureNodeOffsets = 0x000B,
    /// Profile offsets per signature and component
    SignatureProfiles = 0x000C,
    /// Ranked signature indexes referenced by nodes
    NodeRankedSignatureIndexes = 0x000D,
    /// Signature index by rank
    RankedSignatureIndexes = 0x000E,
    /// Graph roots per component and header
    HashGraphs = 0x000F,
    /// Graph nodes (variable width, offset addressed)
    HashNodes = 0x0010,
}

impl TryFrom<u16> for SectionId {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::StrPool),
            0x0002 => Ok(Self::Headers),
            0x0003 => Ok(Self::Components),
            0x0004 => Ok(Self::Properties),
            0x0005 => Ok(Self::Values),
            0x0006 => Ok(Self::Profiles),
            0x0007 => Ok(Self::ProfileOffsets),
            0x0008 => Ok(Self::RootNodes),
            0x0009 => Ok(Self::Nodes),
            0x000A => Ok(Self::Signatures),
            0x000B => Ok(Self::SignatureNodeOffsets),
            0x000C => Ok(Self::SignatureProfiles),
            0x000D => Ok(Self::NodeRankedSignatureIndexes),
            0x000E => Ok(Self::RankedSignatureIndexes),
            0x000F => Ok(Self::HashGraphs),
            0x0010 => Ok(Self::HashNodes),
            _ => Err(()),
        }
    }
}

// =============================================================================
// Record Layouts
// =============================================================================

/// Header entry: name offset, name length.
pub const HEADER_ENTRY_SIZE: usize = 8;

/// Fixed part of a component record; header indexes (u32) follow.
pub const COMPONENT_FIXED_SIZE: usize = 20;

pub mod component_record {
    pub const LENGTH: usize = 0;
    pub const NAME_OFFSET: usize = 4;
    pub const NAME_LENGTH: usize = 8;
    /// u32 id of the profile used when nothing matched
    pub const DEFAULT_PROFILE_ID: usize = 12;
    /// u32 number of header indexes, highest precedence first
    pub const HEADER_COUNT: usize = 16;
}

/// Fixed part of a property record; suppress header indexes (u32) follow.
pub const PROPERTY_FIXED_SIZE: usize = 32;

pub mod property_record {
    pub const LENGTH: usize = 0;
    pub const NAME_OFFSET: usize = 4;
    pub const NAME_LENGTH: usize = 8;
    /// u8 component index
    pub const COMPONENT: usize = 12;
    /// u8 property flags
    pub const FLAGS: usize = 13;
    /// u32 index of the first value in the Values section
    pub const FIRST_VALUE: usize = 16;
    /// u32 number of values
    pub const VALUE_COUNT: usize = 20;
    /// u32 index of the property this one calculates, or NO_INDEX
    pub const OVERRIDES_PROPERTY: usize = 24;
    /// u32 number of suppress header indexes
    pub const SUPPRESS_COUNT: usize = 28;
}

/// Value entry: property index, name offset, name length.
pub const VALUE_ENTRY_SIZE: usize = 12;

/// Profile offset entry: profile id, offset.
pub const PROFILE_OFFSET_ENTRY_SIZE: usize = 8;

/// Signature entry.
pub const SIGNATURE_ENTRY_SIZE: usize = 12;

pub mod signature_entry {
    /// u32 index of the first node offset in SignatureNodeOffsets
    pub const FIRST_NODE: usize = 0;
    /// u16 node count
    pub const NODE_COUNT: usize = 4;
    /// u16 flags
    pub const FLAGS: usize = 6;
    /// u32 rank
    pub const RANK: usize = 8;
}

/// Graph entry: component, header, performance root, predictive root.
pub const GRAPH_ENTRY_SIZE: usize = 16;

/// Fixed part of a profile record.
pub const PROFILE_FIXED_SIZE: usize = 16;

pub mod profile_record {
    pub const LENGTH: usize = 0;
    /// u8 component index
    pub const COMPONENT: usize = 4;
    /// u32 profile id
    pub const PROFILE_ID: usize = 8;
    /// u32 value count
    pub const VALUE_COUNT: usize = 12;
}

/// Fixed part of a node record.
pub const NODE_FIXED_SIZE: usize = 28;

pub mod node_record {
    pub const LENGTH: usize = 0;
    /// i16 position
    pub const POSITION: usize = 4;
    /// i16 next character position
    pub const NEXT_CHAR_POSITION: usize = 6;
    /// u32 parent offset
    pub const PARENT_OFFSET: usize = 8;
    /// u16 children count
    pub const CHILDREN_COUNT: usize = 12;
    /// u16 numeric children count
    pub const NUMERIC_CHILDREN_COUNT: usize = 14;
    /// u32 signature count
    pub const SIGNATURE_COUNT: usize = 16;
    /// u32 first index into NodeRankedSignatureIndexes
    pub const FIRST_SIGNATURE: usize = 20;
    /// u16 length of the node's character string
    pub const CHARACTERS_LENGTH: usize = 24;
    /// u16 length of every child key
    pub const CHILD_KEY_LENGTH: usize = 26;
}

/// Numeric child entry: i32 value, u32 node offset.
pub const NUMERIC_CHILD_SIZE: usize = 8;

/// Fixed part of a graph node record.
pub const HASH_NODE_FIXED_SIZE: usize = 24;

pub mod hash_node_record {
    pub const LENGTH: usize = 0;
    /// i16 first expected start position
    pub const FIRST_INDEX: usize = 4;
    /// i16 last expected start position
    pub const LAST_INDEX: usize = 6;
    /// u16 substring length
    pub const SUBSTRING_LENGTH: usize = 8;
    /// u32 hash table size
    pub const MODULO: usize = 12;
    /// i32 child value used when no hash matches
    pub const UNMATCHED: usize = 16;
    /// u32 number of occupied slots
    pub const HASH_COUNT: usize = 20;
}

/// Graph hash slot: u32 hash, i32 child value.
pub const HASH_SLOT_SIZE: usize = 8;

// =============================================================================
// Sentinels
// =============================================================================

/// No node / no profile offset on disk.
pub const NO_OFFSET: u32 = 0xFFFF_FFFF;

/// Node has no next character position (not complete).
pub const NO_POSITION: i16 = i16::MIN;

/// Optional index not present.
pub const NO_INDEX: u32 = 0xFFFF_FFFF;

/// Graph child value meaning "no match"; also marks empty hash slots.
pub const GRAPH_NO_MATCH: i32 = i32::MIN;

/// Encode a profile offset as a graph leaf value.
#[inline]
pub const fn graph_leaf(profile_offset: u32) -> i32 {
    -(profile_offset as i32) - 1
}

/// Decode a graph leaf value. `None` for node offsets and the no-match leaf.
#[inline]
pub const fn graph_leaf_profile(value: i32) -> Option<u32> {
    if value >= 0 || value == GRAPH_NO_MATCH {
        None
    } else {
        Some((-(value + 1)) as u32)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Align offset to boundary.
#[inline]
pub const fn align_offset(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Validate magic bytes.
#[inline]
pub fn validate_magic(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == DDS_MAGIC
}

/// Read u16 little-endian.
#[inline]
pub fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Read u32 little-endian.
#[inline]
pub fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// Read i16 little-endian.
#[inline]
pub fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

/// Read i32 little-endian.
#[inline]
pub fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}
