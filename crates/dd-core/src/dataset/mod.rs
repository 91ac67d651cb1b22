//! DDS Data Set Format and Loader
//!
//! This module provides the binary layout, the header loader
//! and [`DataSet`], the loaded catalog plus the engine structures every
//! request reads.

mod format;
mod loader;
mod records;

pub use format::*;
pub use loader::*;
pub use records::*;

use std::path::Path;
use std::sync::Arc;

use crate::collection::{Collection, MemoryTracker, Source, StringPool};
use crate::config::{DetectionConfig, EngineKind, LoadMode};
use crate::graph::GraphData;
use crate::pattern::PatternData;
use crate::types::PropertyFlags;

/// Logical grouping of properties.
#[derive(Debug, Clone)]
pub struct Component {
    pub index: u8,
    pub name: Arc<str>,
    pub default_profile_id: u32,
    /// Offset of the default profile, when the data set carries it.
    pub default_profile: Option<u32>,
    /// Header indexes, highest precedence first.
    pub headers: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Property {
    pub index: u32,
    pub name: Arc<str>,
    pub component: u8,
    pub flags: PropertyFlags,
    pub first_value: u32,
    pub value_count: u32,
    /// Property whose value this JavaScript property calculates.
    pub overrides_property: Option<u32>,
    /// Headers whose joint presence makes this property empty.
    pub suppress_headers: Vec<u32>,
}

/// Engine a data set answers requests with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveEngine {
    Pattern,
    Hash,
}

/// A loaded data set, configured for one set of required properties.
pub struct DataSet {
    source: Arc<Source>,
    header: DataSetHeader,
    config: DetectionConfig,
    engine: ActiveEngine,
    name: Arc<str>,
    strings: StringPool,
    headers: Vec<Arc<str>>,
    components: Vec<Component>,
    properties: Vec<Property>,
    required: Vec<u32>,
    values: Collection<ValueRecord>,
    profiles: Collection<Profile>,
    profile_offsets: Collection<ProfileOffset>,
    pattern: Option<PatternData>,
    graphs: Option<GraphData>,
    memory: MemoryTracker,
}

impl std::fmt::Debug for DataSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSet")
            .field("name", &self.name)
            .field("engine", &self.engine)
            .field("source", &self.source.kind())
            .field("components", &self.components.len())
            .field("properties", &self.properties.len())
            .finish()
    }
}

impl DataSet {
    /// Load from an owned buffer.
    pub fn from_memory(bytes: Vec<u8>, config: DetectionConfig) -> Result<Self, DataSetError> {
        Self::from_source(Source::Memory(bytes), config)
    }

    /// Load from a file using the configured load mode.
    pub fn from_file(path: &Path, config: DetectionConfig) -> Result<Self, DataSetError> {
        let source = match config.collection.mode {
            LoadMode::Memory => {
                let bytes = std::fs::read(path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => DataSetError::FileNotFound(path.to_path_buf()),
                    std::io::ErrorKind::PermissionDenied => DataSetError::PermissionDenied(path.to_path_buf()),
                    _ => DataSetError::Io(e),
                })?;
                Source::Memory(bytes)
            }
            LoadMode::Mapped => Source::map_file(path)?,
            LoadMode::File => Source::open_file(path, config.collection.concurrency)?,
        };
        log::debug!("loading data set {} ({})", path.display(), source.kind());
        Self::from_source(source, config)
    }

    /// Estimate the bytes a data set occupies when loaded with `config`.
    pub fn estimate_memory(path: &Path, config: DetectionConfig) -> Result<usize, DataSetError> {
        Ok(Self::from_file(path, config)?.memory().total())
    }

    pub fn from_source(source: Source, config: DetectionConfig) -> Result<Self, DataSetError> {
        let header = DataSetHeader::load(&source, config.collection.verify_crc)?;
        let source = Arc::new(source);
        let cache = config.collection.cache_capacity;

        let mut memory = MemoryTracker::new();
        if let Source::Memory(bytes) = source.as_ref() {
            memory.add(bytes.len());
        }

        let strings = StringPool::new(Arc::clone(&source), header.require(SectionId::StrPool)?, cache, &mut memory)?;
        let name = strings.get(header.name_offset, header.name_length)?;

        // Headers
        let header_records: Collection<HeaderRecord> =
            Collection::new(Arc::clone(&source), header.require(SectionId::Headers)?, 0, &mut memory)?;
        let mut headers = Vec::with_capacity(header_records.count() as usize);
        for i in 0..header_records.count() {
            let record = header_records.value(i)?;
            headers.push(strings.get(record.name_offset, record.name_length)?);
        }

        // Values and profiles are read on demand
        let values = Collection::new(Arc::clone(&source), header.require(SectionId::Values)?, cache, &mut memory)?;
        let profiles = Collection::new(Arc::clone(&source), header.require(SectionId::Profiles)?, cache, &mut memory)?;
        let profile_offsets =
            Collection::new(Arc::clone(&source), header.require(SectionId::ProfileOffsets)?, 0, &mut memory)?;

        // Components
        let component_records: Collection<ComponentRecord> =
            Collection::new(Arc::clone(&source), header.require(SectionId::Components)?, 0, &mut memory)?;
        if component_records.count() != header.component_count as u32 {
            return Err(DataSetError::CorruptData(format!(
                "header declares {} components, section holds {}",
                header.component_count,
                component_records.count()
            )));
        }
        let mut components = Vec::with_capacity(component_records.count() as usize);
        for (i, entry) in component_records.iter_offsets().enumerate() {
            let (_, record) = entry?;
            if let Some(bad) = record.headers.iter().find(|&&h| h as usize >= headers.len()) {
                return Err(DataSetError::CorruptData(format!("component {i} references header {bad}")));
            }
            let default_profile = if record.default_profile_id == 0 {
                None
            } else {
                find_profile_offset(&profile_offsets, record.default_profile_id)?
            };
            components.push(Component {
                index: i as u8,
                name: strings.get(record.name_offset, record.name_length)?,
                default_profile_id: record.default_profile_id,
                default_profile,
                headers: record.headers.clone(),
            });
        }

        // Properties
        let property_records: Collection<PropertyRecord> =
            Collection::new(Arc::clone(&source), header.require(SectionId::Properties)?, 0, &mut memory)?;
        let mut properties = Vec::with_capacity(property_records.count() as usize);
        for (i, entry) in property_records.iter_offsets().enumerate() {
            let (_, record) = entry?;
            if record.component as usize >= components.len() {
                return Err(DataSetError::CorruptData(format!(
                    "property {i} references component {}",
                    record.component
                )));
            }
            if record.first_value as u64 + record.value_count as u64 > values.count() as u64 {
                return Err(DataSetError::CorruptData(format!("property {i} values out of range")));
            }
            properties.push(Property {
                index: i as u32,
                name: strings.get(record.name_offset, record.name_length)?,
                component: record.component,
                flags: record.flags,
                first_value: record.first_value,
                value_count: record.value_count,
                overrides_property: record.overrides_property,
                suppress_headers: record.suppress_headers.clone(),
            });
        }
        memory.add(
            headers.iter().map(|h| h.len() + 16).sum::<usize>()
                + components.len() * std::mem::size_of::<Component>()
                + properties.len() * std::mem::size_of::<Property>(),
        );

        let required = required_properties(&properties, &config.properties);

        let pattern = if header.flags.contains(DataSetFlags::HAS_PATTERN) {
            Some(PatternData::load(&source, &header, cache, &mut memory)?)
        } else {
            None
        };
        let graphs = if header.flags.contains(DataSetFlags::HAS_HASH) {
            Some(GraphData::load(&source, &header, cache, &mut memory)?)
        } else {
            None
        };

        let engine = match (config.engine, pattern.is_some(), graphs.is_some()) {
            (EngineKind::Auto, _, true) | (EngineKind::Hash, _, true) => ActiveEngine::Hash,
            (EngineKind::Auto, true, false) | (EngineKind::Pattern, true, _) => ActiveEngine::Pattern,
            (EngineKind::Hash, _, false) => return Err(DataSetError::MissingSection(SectionId::HashGraphs)),
            _ => return Err(DataSetError::MissingSection(SectionId::RootNodes)),
        };

        log::debug!(
            "data set '{}': {} components, {} properties ({} required), engine {:?}",
            name,
            components.len(),
            properties.len(),
            required.len(),
            engine
        );

        Ok(Self {
            source,
            header,
            config,
            engine,
            name,
            strings,
            headers,
            components,
            properties,
            required,
            values,
            profiles,
            profile_offsets,
            pattern,
            graphs,
            memory,
        })
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &DataSetHeader {
        &self.header
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn engine(&self) -> ActiveEngine {
        self.engine
    }

    pub fn source_kind(&self) -> &'static str {
        self.source.kind()
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn pattern(&self) -> Option<&PatternData> {
        self.pattern.as_ref()
    }

    pub fn graphs(&self) -> Option<&GraphData> {
        self.graphs.as_ref()
    }

    // -------------------------------------------------------------------------
    // Catalog
    // -------------------------------------------------------------------------

    pub fn headers(&self) -> &[Arc<str>] {
        &self.headers
    }

    /// Index of a header name, ignoring case.
    pub fn header_index(&self, name: &str) -> Option<u32> {
        self.headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .map(|i| i as u32)
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Property indexes requested by the configuration, in request order.
    pub fn required_properties(&self) -> &[u32] {
        &self.required
    }

    pub fn required_property(&self, required_index: usize) -> Option<&Property> {
        self.required
            .get(required_index)
            .and_then(|&p| self.properties.get(p as usize))
    }

    pub fn required_index(&self, name: &str) -> Option<usize> {
        self.required
            .iter()
            .position(|&p| self.properties[p as usize].name.eq_ignore_ascii_case(name))
    }

    // -------------------------------------------------------------------------
    // Profiles and values
    // -------------------------------------------------------------------------

    pub fn profile_count(&self) -> u32 {
        self.profile_offsets.count()
    }

    /// Offset of the profile with `profile_id`.
    pub fn profile_offset(&self, profile_id: u32) -> Result<Option<u32>, DataSetError> {
        find_profile_offset(&self.profile_offsets, profile_id)
    }

    pub fn profile(&self, offset: u32) -> Result<Arc<Profile>, DataSetError> {
        self.profiles.get(offset)
    }

    /// Every profile offset entry, sorted by id.
    pub fn profile_offsets(&self) -> impl Iterator<Item = Result<ProfileOffset, DataSetError>> + '_ {
        (0..self.profile_offsets.count()).map(move |i| self.profile_offsets.value(i))
    }

    pub fn value_name(&self, value_index: u32) -> Result<Arc<str>, DataSetError> {
        let value = self.values.value(value_index)?;
        self.strings.get(value.name_offset, value.name_length)
    }

    /// Values `profile` holds for `property`.
    pub fn profile_values(&self, profile: &Profile, property: &Property) -> Result<Vec<Arc<str>>, DataSetError> {
        let first = property.first_value;
        let end = first + property.value_count;
        let start = profile.values.partition_point(|&v| v < first);
        profile.values[start..]
            .iter()
            .take_while(|&&v| v < end)
            .map(|&v| self.value_name(v))
            .collect()
    }
}

fn find_profile_offset(offsets: &Collection<ProfileOffset>, profile_id: u32) -> Result<Option<u32>, DataSetError> {
    let found = offsets.binary_search_by(|entry| Ok(entry.profile_id.cmp(&profile_id)))?;
    match found {
        Ok(index) => Ok(Some(offsets.value(index)?.offset)),
        Err(_) => Ok(None),
    }
}

fn required_properties(properties: &[Property], names: &[String]) -> Vec<u32> {
    if names.is_empty() {
        return properties.iter().map(|p| p.index).collect();
    }
    let mut required = Vec::with_capacity(names.len());
    for name in names {
        match properties.iter().find(|p| p.name.eq_ignore_ascii_case(name)) {
            Some(p) if !required.contains(&p.index) => required.push(p.index),
            Some(_) => {}
            None => log::warn!("required property '{name}' is not in the data set"),
        }
    }
    required
}
