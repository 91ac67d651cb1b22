//! DDS header and section directory loader

use std::collections::HashMap;
use std::path::PathBuf;

use bitflags::bitflags;

use super::format::*;
use crate::collection::Source;
use crate::hash::Crc32;

/// Error type for data set loading and record access.
///
/// Every variant is fatal when raised while a data set is being constructed.
/// Raised from a record read during matching, the engine degrades the
/// affected result instead of surfacing it.
#[derive(Debug, thiserror::Error)]
pub enum DataSetError {
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Incorrect data set version: {major}.{minor} (expected {DDS_VERSION_MAJOR}.{DDS_VERSION_MINOR})")]
    IncorrectVersion { major: u16, minor: u16 },
    #[error("CRC32 mismatch: stored={stored}, computed={computed}")]
    Crc32Mismatch { stored: u32, computed: u32 },
    #[error("Data too short")]
    DataTooShort,
    #[error("Corrupt data: {0}")]
    CorruptData(String),
    #[error("Missing section: {0:?}")]
    MissingSection(SectionId),
    #[error("Index {index} out of range ({count} records)")]
    OutOfRange { index: u32, count: u32 },
    #[error("Invalid collection configuration: {0}")]
    InvalidCollectionConfig(String),
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("No data set file to reload from")]
    NoReloadSource,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

bitflags! {
    /// Data set header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DataSetFlags: u16 {
        /// Data set includes a CRC32 checksum
        const HAS_CRC32 = 1 << 0;
        /// Pattern engine sections present
        const HAS_PATTERN = 1 << 1;
        /// Graph engine sections present
        const HAS_HASH = 1 << 2;
    }
}

/// Section metadata.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub id: SectionId,
    pub flags: u16,
    pub offset: usize,
    pub length: usize,
    pub uncompressed_length: usize,
    pub crc32: u32,
}

/// Parsed data set header and section directory.
#[derive(Debug, Clone)]
pub struct DataSetHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: DataSetFlags,
    pub component_count: u16,
    pub build_id: u32,
    pub published: u32,
    pub name_offset: u32,
    pub name_length: u32,
    sections: HashMap<SectionId, SectionInfo>,
}

impl DataSetHeader {
    /// Read and validate the header and section directory.
    pub fn load(source: &Source, verify_crc: bool) -> Result<Self, DataSetError> {
        if source.len() < HEADER_SIZE as u64 {
            return Err(DataSetError::DataTooShort);
        }
        let data = source.read(0, HEADER_SIZE)?;

        // Validate magic
        if !validate_magic(&data) {
            return Err(DataSetError::InvalidMagic);
        }

        let version_major = read_u16_le(&data, header::VERSION_MAJOR);
        let version_minor = read_u16_le(&data, header::VERSION_MINOR);
        if version_major != DDS_VERSION_MAJOR || version_minor != DDS_VERSION_MINOR {
            return Err(DataSetError::IncorrectVersion {
                major: version_major,
                minor: version_minor,
            });
        }

        let flags = DataSetFlags::from_bits_truncate(read_u16_le(&data, header::FLAGS));
        let component_count = read_u16_le(&data, header::COMPONENT_COUNT);
        let section_count = read_u32_le(&data, header::SECTION_COUNT) as usize;
        let section_dir_offset = read_u32_le(&data, header::SECTION_DIR_OFFSET) as usize;
        let build_id = read_u32_le(&data, header::BUILD_ID);
        let published = read_u32_le(&data, header::PUBLISHED);
        let name_offset = read_u32_le(&data, header::NAME_OFFSET);
        let name_length = read_u32_le(&data, header::NAME_LENGTH);

        if verify_crc && flags.contains(DataSetFlags::HAS_CRC32) {
            let stored = read_u32_le(&data, header::DATA_SET_CRC32);
            let computed = compute_crc(source)?;
            if stored != computed {
                return Err(DataSetError::Crc32Mismatch { stored, computed });
            }
        }

        let dir_bytes = section_count
            .checked_mul(SECTION_ENTRY_SIZE)
            .ok_or_else(|| DataSetError::CorruptData("section count overflow".to_string()))?;
        if (section_dir_offset + dir_bytes) as u64 > source.len() {
            return Err(DataSetError::CorruptData(format!(
                "section directory of {section_count} entries exceeds data set length"
            )));
        }
        let dir = source.read(section_dir_offset as u64, dir_bytes)?;

        // Parse section directory
        let mut sections = HashMap::new();
        for i in 0..section_count {
            let entry_offset = i * SECTION_ENTRY_SIZE;

            let id_raw = read_u16_le(&dir, entry_offset + section_entry::ID);
            let id = match SectionId::try_from(id_raw) {
                Ok(id) => id,
                Err(_) => {
                    log::debug!("skipping unknown section id {id_raw:#06x}");
                    continue;
                }
            };

            let info = SectionInfo {
                id,
                flags: read_u16_le(&dir, entry_offset + section_entry::FLAGS),
                offset: read_u32_le(&dir, entry_offset + section_entry::OFFSET) as usize,
                length: read_u32_le(&dir, entry_offset + section_entry::LENGTH) as usize,
                uncompressed_length: read_u32_le(&dir, entry_offset + section_entry::UNCOMPRESSED_LENGTH)
                    as usize,
                crc32: read_u32_le(&dir, entry_offset + section_entry::CRC32),
            };

            if (info.offset + info.length) as u64 > source.len() {
                return Err(DataSetError::CorruptData(format!(
                    "section {:?} at {}+{} exceeds data set length {}",
                    id,
                    info.offset,
                    info.length,
                    source.len()
                )));
            }

            sections.insert(id, info);
        }

        Ok(Self {
            version_major,
            version_minor,
            flags,
            component_count,
            build_id,
            published,
            name_offset,
            name_length,
            sections,
        })
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Get section info.
    pub fn section(&self, id: SectionId) -> Option<&SectionInfo> {
        self.sections.get(&id)
    }

    /// Get section info, failing when absent.
    pub fn require(&self, id: SectionId) -> Result<&SectionInfo, DataSetError> {
        self.sections.get(&id).ok_or(DataSetError::MissingSection(id))
    }

    /// Sections ordered by id.
    pub fn sections(&self) -> Vec<&SectionInfo> {
        let mut all: Vec<_> = self.sections.values().collect();
        all.sort_by_key(|s| s.id);
        all
    }
}

/// CRC over everything except the CRC field itself.
fn compute_crc(source: &Source) -> Result<u32, DataSetError> {
    const CHUNK: usize = 64 * 1024;

    let mut crc = Crc32::new();
    let crc_field = header::DATA_SET_CRC32 as u64;
    let total = source.len();
    let mut offset = 0u64;
    while offset < total {
        let len = CHUNK.min((total - offset) as usize);
        let chunk = source.read(offset, len)?;
        let chunk_end = offset + len as u64;
        if offset <= crc_field && crc_field + 4 <= chunk_end {
            let rel = (crc_field - offset) as usize;
            crc.update(&chunk[..rel]);
            crc.update(&chunk[rel + 4..]);
        } else {
            crc.update(&chunk);
        }
        offset = chunk_end;
    }
    Ok(crc.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_header(major: u16, minor: u16) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_SIZE];
        data[..4].copy_from_slice(&DDS_MAGIC);
        data[header::VERSION_MAJOR..header::VERSION_MAJOR + 2].copy_from_slice(&major.to_le_bytes());
        data[header::VERSION_MINOR..header::VERSION_MINOR + 2].copy_from_slice(&minor.to_le_bytes());
        data[header::HEADER_BYTES..header::HEADER_BYTES + 4].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        data[header::SECTION_DIR_OFFSET..header::SECTION_DIR_OFFSET + 4]
            .copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        data
    }

    #[test]
    fn loads_empty_directory() {
        let source = Source::Memory(bare_header(DDS_VERSION_MAJOR, DDS_VERSION_MINOR));
        let header = DataSetHeader::load(&source, true).unwrap();
        assert_eq!(header.section_count(), 0);
        assert!(matches!(
            header.require(SectionId::Profiles),
            Err(DataSetError::MissingSection(SectionId::Profiles))
        ));
    }

    #[test]
    fn rejects_short_data() {
        let source = Source::Memory(vec![0u8; 10]);
        assert!(matches!(DataSetHeader::load(&source, true), Err(DataSetError::DataTooShort)));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = bare_header(DDS_VERSION_MAJOR, DDS_VERSION_MINOR);
        data[0] = b'X';
        let source = Source::Memory(data);
        assert!(matches!(DataSetHeader::load(&source, true), Err(DataSetError::InvalidMagic)));
    }

    #[test]
    fn rejects_other_versions() {
        let source = Source::Memory(bare_header(DDS_VERSION_MAJOR + 1, 0));
        assert!(matches!(
            DataSetHeader::load(&source, true),
            Err(DataSetError::IncorrectVersion { .. })
        ));
        let source = Source::Memory(bare_header(DDS_VERSION_MAJOR, DDS_VERSION_MINOR + 1));
        assert!(matches!(
            DataSetHeader::load(&source, true),
            Err(DataSetError::IncorrectVersion { .. })
        ));
    }

    #[test]
    fn detects_crc_mismatch() {
        let mut data = bare_header(DDS_VERSION_MAJOR, DDS_VERSION_MINOR);
        data[header::FLAGS..header::FLAGS + 2].copy_from_slice(&DataSetFlags::HAS_CRC32.bits().to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        let source = Source::Memory(data.clone());
        let computed = compute_crc(&source).unwrap();

        data[header::DATA_SET_CRC32..header::DATA_SET_CRC32 + 4].copy_from_slice(&computed.to_le_bytes());
        assert!(DataSetHeader::load(&Source::Memory(data.clone()), true).is_ok());

        let last = data.len() - 1;
        data[last] ^= 0xff;
        assert!(matches!(
            DataSetHeader::load(&Source::Memory(data.clone()), true),
            Err(DataSetError::Crc32Mismatch { .. })
        ));
        assert!(DataSetHeader::load(&Source::Memory(data), false).is_ok());
    }

    #[test]
    fn rejects_sections_past_end() {
        let mut data = bare_header(DDS_VERSION_MAJOR, DDS_VERSION_MINOR);
        data[header::SECTION_COUNT..header::SECTION_COUNT + 4].copy_from_slice(&1u32.to_le_bytes());
        let mut entry = vec![0u8; SECTION_ENTRY_SIZE];
        entry[..2].copy_from_slice(&(SectionId::Profiles as u16).to_le_bytes());
        entry[section_entry::OFFSET..section_entry::OFFSET + 4].copy_from_slice(&1000u32.to_le_bytes());
        entry[section_entry::LENGTH..section_entry::LENGTH + 4].copy_from_slice(&16u32.to_le_bytes());
        data.extend_from_slice(&entry);
        let source = Source::Memory(data);
        assert!(matches!(DataSetHeader::load(&source, true), Err(DataSetError::CorruptData(_))));
    }
}
