use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use dd_core::collection::Record;
use dd_core::dataset::{
    align_offset, component_record, graph_leaf, hash_node_record, header, node_record, profile_record, property_record,
    read_u32_le, section_entry, signature_entry, DataSetError, DataSetFlags, Node, SectionId, COMPONENT_FIXED_SIZE,
    DDS_MAGIC, DDS_VERSION_MAJOR, DDS_VERSION_MINOR, GRAPH_ENTRY_SIZE, GRAPH_NO_MATCH, HASH_NODE_FIXED_SIZE,
    HEADER_SIZE, NODE_FIXED_SIZE, NO_INDEX, NO_OFFSET, NO_POSITION, NUMERIC_CHILD_SIZE,
    PROFILE_FIXED_SIZE, PROPERTY_FIXED_SIZE, SECTION_ENTRY_SIZE, SIGNATURE_ENTRY_SIZE,
};
use dd_core::hash::{rk_hash, Crc32};
use dd_core::pattern::{extract_nodes, NodeLookup};
use dd_core::types::{PropertyFlags, SignatureFlags};

use crate::source::{DataSetSource, GraphTarget, HashNodeSource, PatternSource, PropertyFlagName};
use crate::CompileError;

/// Largest hash table tried per graph node, as a multiple of its entries.
const MAX_MODULO_FACTOR: usize = 16;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Store a CRC32 of the image in the header.
    pub crc32: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { crc32: true }
    }
}

/// Build a DDS1 image from a data set source.
pub fn build_data_set(source: &DataSetSource, options: &BuildOptions) -> Result<Vec<u8>, CompileError> {
    if source.patterns.is_empty() && source.graphs.is_empty() {
        return Err(CompileError::NoEngine);
    }

    let mut str_pool = StringPool::new();
    let name = str_pool.intern(&source.name);
    let catalog = Catalog::resolve(source)?;

    let headers = build_headers_section(&catalog, &mut str_pool);
    let components = build_components_section(&catalog, &mut str_pool);
    let properties = build_properties_section(&catalog, &mut str_pool);
    let values = build_values_section(&catalog, &mut str_pool);
    let (profiles, profile_offsets, profile_index) = build_profiles_section(&catalog);

    let mut flags = DataSetFlags::empty();
    if options.crc32 {
        flags |= DataSetFlags::HAS_CRC32;
    }

    let mut sections = vec![
        SectionData::new(SectionId::Headers, headers),
        SectionData::new(SectionId::Components, components),
        SectionData::new(SectionId::Properties, properties),
        SectionData::new(SectionId::Values, values),
        SectionData::new(SectionId::Profiles, profiles),
        SectionData::new(SectionId::ProfileOffsets, profile_offsets),
    ];

    if !source.patterns.is_empty() {
        flags |= DataSetFlags::HAS_PATTERN;
        let pattern = build_pattern_sections(&source.patterns, &catalog, &profile_index)?;
        log::debug!(
            "pattern: {} nodes, {} signatures, {} root positions",
            pattern.node_count,
            pattern.signature_count,
            pattern.root_count
        );
        sections.extend(pattern.sections);
    }

    if !source.graphs.is_empty() {
        flags |= DataSetFlags::HAS_HASH;
        let (graphs, nodes) = build_graph_sections(source, &catalog, &profile_index)?;
        sections.push(SectionData::new(SectionId::HashGraphs, graphs));
        sections.push(SectionData::new(SectionId::HashNodes, nodes));
    }

    sections.insert(0, SectionData::new(SectionId::StrPool, str_pool.build()));

    let image = assemble(source, &catalog, flags, name, sections);
    log::info!(
        "built data set '{}': {} components, {} properties, {} profiles, {} bytes",
        source.name,
        catalog.components.len(),
        catalog.properties.len(),
        catalog.profiles.len(),
        image.len()
    );
    Ok(image)
}

fn assemble(
    source: &DataSetSource,
    catalog: &Catalog,
    flags: DataSetFlags,
    name: (u32, u32),
    mut sections: Vec<SectionData>,
) -> Vec<u8> {
    let section_count = sections.len();
    let section_dir_offset = HEADER_SIZE;
    let section_dir_bytes = section_count * SECTION_ENTRY_SIZE;
    let mut data_offset = align_offset(section_dir_offset + section_dir_bytes, 4);

    for section in &mut sections {
        section.offset = data_offset;
        data_offset = align_offset(data_offset + section.data.len(), 4);
    }

    let total_size = data_offset;
    let mut buffer = vec![0u8; total_size];

    buffer[0..4].copy_from_slice(&DDS_MAGIC);
    write_u16_le(&mut buffer, header::VERSION_MAJOR, DDS_VERSION_MAJOR);
    write_u16_le(&mut buffer, header::VERSION_MINOR, DDS_VERSION_MINOR);
    write_u16_le(&mut buffer, header::FLAGS, flags.bits());
    write_u16_le(&mut buffer, header::COMPONENT_COUNT, catalog.components.len() as u16);
    write_u32_le(&mut buffer, header::HEADER_BYTES, HEADER_SIZE as u32);
    write_u32_le(&mut buffer, header::SECTION_COUNT, section_count as u32);
    write_u32_le(&mut buffer, header::SECTION_DIR_OFFSET, section_dir_offset as u32);
    write_u32_le(&mut buffer, header::SECTION_DIR_BYTES, section_dir_bytes as u32);
    write_u32_le(&mut buffer, header::BUILD_ID, source.build_id);
    write_u32_le(&mut buffer, header::PUBLISHED, source.published);
    write_u32_le(&mut buffer, header::NAME_OFFSET, name.0);
    write_u32_le(&mut buffer, header::NAME_LENGTH, name.1);

    for (index, section) in sections.iter().enumerate() {
        let entry_offset = section_dir_offset + index * SECTION_ENTRY_SIZE;
        write_u16_le(&mut buffer, entry_offset + section_entry::ID, section.id as u16);
        write_u16_le(&mut buffer, entry_offset + section_entry::FLAGS, 0);
        write_u32_le(&mut buffer, entry_offset + section_entry::OFFSET, section.offset as u32);
        write_u32_le(&mut buffer, entry_offset + section_entry::LENGTH, section.data.len() as u32);
        write_u32_le(&mut buffer, entry_offset + section_entry::UNCOMPRESSED_LENGTH, 0);
        write_u32_le(&mut buffer, entry_offset + section_entry::CRC32, 0);

        let end = section.offset + section.data.len();
        buffer[section.offset..end].copy_from_slice(&section.data);
    }

    if flags.contains(DataSetFlags::HAS_CRC32) {
        let field = header::DATA_SET_CRC32;
        let mut crc = Crc32::new();
        crc.update(&buffer[..field]);
        crc.update(&buffer[field + 4..]);
        write_u32_le(&mut buffer, field, crc.finish());
    }

    buffer
}

struct SectionData {
    id: SectionId,
    data: Vec<u8>,
    offset: usize,
}

impl SectionData {
    fn new(id: SectionId, data: Vec<u8>) -> Self {
        Self { id, data, offset: 0 }
    }
}

struct StringPool {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl StringPool {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> (u32, u32) {
        if let Some(&offset) = self.index.get(s) {
            return (offset, s.len() as u32);
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.index.insert(s.to_string(), offset);
        (offset, s.len() as u32)
    }

    fn build(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

// =============================================================================
// Catalog
// =============================================================================

struct CatalogProperty {
    name: String,
    component: u8,
    flags: PropertyFlags,
    overrides: Option<u32>,
    suppress_headers: Vec<u32>,
    first_value: u32,
    values: Vec<String>,
}

struct CatalogProfile {
    id: u32,
    component: u8,
    /// Value indexes, ascending.
    values: Vec<u32>,
}

/// Names resolved to indexes and values numbered.
struct Catalog {
    headers: Vec<String>,
    components: Vec<(String, u32, Vec<u32>)>,
    properties: Vec<CatalogProperty>,
    /// Sorted by id.
    profiles: Vec<CatalogProfile>,
}

impl Catalog {
    fn resolve(source: &DataSetSource) -> Result<Self, CompileError> {
        let headers = unique_names(source.headers.iter().map(String::as_str), "header")?;
        let component_names = unique_names(source.components.iter().map(|c| c.name.as_str()), "component")?;
        if component_names.len() > u8::MAX as usize {
            return Err(CompileError::TooLarge(format!("{} components", component_names.len())));
        }

        let mut components = Vec::with_capacity(source.components.len());
        for component in &source.components {
            let header_indexes = component
                .headers
                .iter()
                .map(|h| index_of(&headers, h, "header"))
                .collect::<Result<Vec<_>, _>>()?;
            components.push((component.name.clone(), component.default_profile, header_indexes));
        }

        let property_names = unique_names(source.properties.iter().map(|p| p.name.as_str()), "property")?;
        let mut properties = Vec::with_capacity(source.properties.len());
        for property in &source.properties {
            let mut flags = PropertyFlags::empty();
            for flag in &property.flags {
                flags |= match flag {
                    PropertyFlagName::Overridable => PropertyFlags::OVERRIDABLE,
                    PropertyFlagName::Javascript => PropertyFlags::JAVASCRIPT,
                    PropertyFlagName::List => PropertyFlags::LIST,
                };
            }
            let overrides = property
                .overrides
                .as_deref()
                .map(|name| index_of(&property_names, name, "property"))
                .transpose()?;
            let suppress_headers = property
                .suppress_headers
                .iter()
                .map(|h| index_of(&headers, h, "header"))
                .collect::<Result<Vec<_>, _>>()?;

            let mut values: Vec<String> = Vec::new();
            for value in &property.values {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
            properties.push(CatalogProperty {
                name: property.name.clone(),
                component: index_of(&component_names, &property.component, "component")? as u8,
                flags,
                overrides,
                suppress_headers,
                first_value: 0,
                values,
            });
        }

        // Values found in profiles follow the declared ones.
        for profile in &source.profiles {
            for (name, values) in &profile.values {
                let property = &mut properties[index_of(&property_names, name, "property")? as usize];
                for value in values.as_slice() {
                    if !property.values.contains(value) {
                        property.values.push(value.clone());
                    }
                }
            }
        }
        let mut next_value = 0u32;
        for property in &mut properties {
            property.first_value = next_value;
            next_value += property.values.len() as u32;
        }

        let mut profiles = Vec::with_capacity(source.profiles.len());
        for profile in &source.profiles {
            if profile.id == 0 {
                return Err(CompileError::InvalidSource("profile id 0 is reserved".to_string()));
            }
            let component = index_of(&component_names, &profile.component, "component")? as u8;
            let mut values = Vec::new();
            for (name, listed) in &profile.values {
                let property = &properties[index_of(&property_names, name, "property")? as usize];
                if property.component != component {
                    return Err(CompileError::InvalidSource(format!(
                        "profile {} of {} sets {} of another component",
                        profile.id, profile.component, name
                    )));
                }
                for value in listed.as_slice() {
                    if let Some(i) = property.values.iter().position(|v| v == value) {
                        values.push(property.first_value + i as u32);
                    }
                }
            }
            values.sort_unstable();
            values.dedup();
            profiles.push(CatalogProfile {
                id: profile.id,
                component,
                values,
            });
        }
        profiles.sort_by_key(|p| p.id);
        if let Some(pair) = profiles.windows(2).find(|pair| pair[0].id == pair[1].id) {
            return Err(CompileError::InvalidSource(format!("duplicate profile id {}", pair[0].id)));
        }

        let catalog = Self {
            headers,
            components,
            properties,
            profiles,
        };
        for (name, default_profile, _) in &catalog.components {
            if *default_profile != 0 && catalog.profile(*default_profile).is_none() {
                return Err(CompileError::Unknown {
                    kind: "default profile",
                    name: format!("{default_profile} of {name}"),
                });
            }
        }
        Ok(catalog)
    }

    fn profile(&self, id: u32) -> Option<&CatalogProfile> {
        self.profiles
            .binary_search_by_key(&id, |p| p.id)
            .ok()
            .map(|i| &self.profiles[i])
    }
}

fn unique_names<'a>(names: impl Iterator<Item = &'a str>, kind: &'static str) -> Result<Vec<String>, CompileError> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        if out.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            return Err(CompileError::InvalidSource(format!("duplicate {kind} '{name}'")));
        }
        out.push(name.to_string());
    }
    Ok(out)
}

fn index_of(names: &[String], name: &str, kind: &'static str) -> Result<u32, CompileError> {
    names
        .iter()
        .position(|n| n.eq_ignore_ascii_case(name))
        .map(|i| i as u32)
        .ok_or_else(|| CompileError::Unknown {
            kind,
            name: name.to_string(),
        })
}

// =============================================================================
// Catalog Sections
// =============================================================================

fn build_headers_section(catalog: &Catalog, str_pool: &mut StringPool) -> Vec<u8> {
    let mut section = Vec::new();
    put_u32(&mut section, catalog.headers.len() as u32);
    for name in &catalog.headers {
        let (offset, len) = str_pool.intern(name);
        put_u32(&mut section, offset);
        put_u32(&mut section, len);
    }
    section
}

fn build_components_section(catalog: &Catalog, str_pool: &mut StringPool) -> Vec<u8> {
    let mut section = Vec::new();
    put_u32(&mut section, catalog.components.len() as u32);
    for (name, default_profile, headers) in &catalog.components {
        let (offset, len) = str_pool.intern(name);
        let start = begin_record(&mut section, COMPONENT_FIXED_SIZE);
        write_u32_le(&mut section, start + component_record::NAME_OFFSET, offset);
        write_u32_le(&mut section, start + component_record::NAME_LENGTH, len);
        write_u32_le(&mut section, start + component_record::DEFAULT_PROFILE_ID, *default_profile);
        write_u32_le(&mut section, start + component_record::HEADER_COUNT, headers.len() as u32);
        for &h in headers {
            put_u32(&mut section, h);
        }
        end_record(&mut section, start);
    }
    section
}

fn build_properties_section(catalog: &Catalog, str_pool: &mut StringPool) -> Vec<u8> {
    let mut section = Vec::new();
    put_u32(&mut section, catalog.properties.len() as u32);
    for property in &catalog.properties {
        let (offset, len) = str_pool.intern(&property.name);
        let start = begin_record(&mut section, PROPERTY_FIXED_SIZE);
        write_u32_le(&mut section, start + property_record::NAME_OFFSET, offset);
        write_u32_le(&mut section, start + property_record::NAME_LENGTH, len);
        section[start + property_record::COMPONENT] = property.component;
        section[start + property_record::FLAGS] = property.flags.bits();
        write_u32_le(&mut section, start + property_record::FIRST_VALUE, property.first_value);
        write_u32_le(&mut section, start + property_record::VALUE_COUNT, property.values.len() as u32);
        write_u32_le(
            &mut section,
            start + property_record::OVERRIDES_PROPERTY,
            property.overrides.unwrap_or(NO_INDEX),
        );
        write_u32_le(
            &mut section,
            start + property_record::SUPPRESS_COUNT,
            property.suppress_headers.len() as u32,
        );
        for &h in &property.suppress_headers {
            put_u32(&mut section, h);
        }
        end_record(&mut section, start);
    }
    section
}

fn build_values_section(catalog: &Catalog, str_pool: &mut StringPool) -> Vec<u8> {
    let count: usize = catalog.properties.iter().map(|p| p.values.len()).sum();
    let mut section = Vec::new();
    put_u32(&mut section, count as u32);
    for (index, property) in catalog.properties.iter().enumerate() {
        for value in &property.values {
            let (offset, len) = str_pool.intern(value);
            put_u32(&mut section, index as u32);
            put_u32(&mut section, offset);
            put_u32(&mut section, len);
        }
    }
    section
}

/// Profile id to (record offset, component).
type ProfileIndex = HashMap<u32, (u32, u8)>;

fn build_profiles_section(catalog: &Catalog) -> (Vec<u8>, Vec<u8>, ProfileIndex) {
    let mut profiles = Vec::new();
    let mut offsets = Vec::new();
    let mut index = HashMap::with_capacity(catalog.profiles.len());
    put_u32(&mut profiles, catalog.profiles.len() as u32);
    put_u32(&mut offsets, catalog.profiles.len() as u32);

    for profile in &catalog.profiles {
        let start = begin_record(&mut profiles, PROFILE_FIXED_SIZE);
        let offset = (start - 4) as u32;
        profiles[start + profile_record::COMPONENT] = profile.component;
        write_u32_le(&mut profiles, start + profile_record::PROFILE_ID, profile.id);
        write_u32_le(&mut profiles, start + profile_record::VALUE_COUNT, profile.values.len() as u32);
        for &v in &profile.values {
            put_u32(&mut profiles, v);
        }
        end_record(&mut profiles, start);

        put_u32(&mut offsets, profile.id);
        put_u32(&mut offsets, offset);
        index.insert(profile.id, (offset, profile.component));
    }
    (profiles, offsets, index)
}

/// Profile offset per component for a list of profile ids.
fn component_profiles(ids: &[u32], component_count: usize, index: &ProfileIndex) -> Result<Vec<u32>, CompileError> {
    let mut out = vec![NO_OFFSET; component_count];
    for &id in ids {
        let &(offset, component) = index.get(&id).ok_or_else(|| CompileError::Unknown {
            kind: "profile",
            name: id.to_string(),
        })?;
        let slot = &mut out[component as usize];
        if *slot != NO_OFFSET {
            return Err(CompileError::InvalidSource(format!(
                "profiles {ids:?} name two profiles of component {component}"
            )));
        }
        *slot = offset;
    }
    Ok(out)
}

// =============================================================================
// Pattern Sections
// =============================================================================

struct TreeNode {
    position: i16,
    complete: bool,
    parent: Option<usize>,
    characters: Vec<u8>,
    key_length: u16,
    /// Child key to node index, in key order.
    children: BTreeMap<Vec<u8>, usize>,
}

impl TreeNode {
    fn numeric_children(&self) -> Vec<(i32, usize)> {
        let mut numeric: Vec<(i32, usize)> = self
            .children
            .iter()
            .filter(|(key, _)| key.len() <= 9 && key.iter().all(u8::is_ascii_digit))
            .map(|(key, &child)| (key.iter().fold(0i32, |acc, b| acc * 10 + (b - b'0') as i32), child))
            .collect();
        numeric.sort_unstable();
        numeric
    }

    fn record_size(&self) -> usize {
        NODE_FIXED_SIZE
            + self.children.len() * (4 + self.key_length as usize)
            + self.numeric_children().len() * NUMERIC_CHILD_SIZE
            + self.characters.len()
    }
}

/// Node tree with one root per substring end position.
///
/// Below a node covering `n` characters, children are keyed by the `k`
/// characters to their left, where `k` is the shortest remaining length of
/// the substrings passing through the node. A node is complete when a
/// substring ends at it.
fn build_tree(patterns: &[PatternSource]) -> Result<(Vec<TreeNode>, Vec<Option<usize>>), CompileError> {
    let mut ends: BTreeMap<usize, BTreeSet<Vec<u8>>> = BTreeMap::new();
    for pattern in patterns {
        let target = pattern.target.as_bytes();
        for substring in &pattern.substrings {
            let text = substring.text.as_bytes();
            let end = substring.start + text.len();
            if text.is_empty() || target.get(substring.start..end) != Some(text) {
                return Err(CompileError::InvalidSource(format!(
                    "'{}' is not at {} in '{}'",
                    substring.text, substring.start, pattern.target
                )));
            }
            if end > i16::MAX as usize {
                return Err(CompileError::TooLarge(format!("substring ends at {end}")));
            }
            ends.entry(end - 1).or_default().insert(text.to_vec());
        }
    }

    let root_count = ends.keys().next_back().map_or(0, |&last| last + 1);
    let mut roots = vec![None; root_count];
    let mut nodes: Vec<TreeNode> = Vec::new();
    let mut queue: VecDeque<(usize, Vec<Vec<u8>>, usize)> = VecDeque::new();

    for (&end, texts) in &ends {
        roots[end] = Some(nodes.len());
        queue.push_back((nodes.len(), texts.iter().cloned().collect(), 0));
        nodes.push(TreeNode {
            position: end as i16,
            complete: false,
            parent: None,
            characters: Vec::new(),
            key_length: 0,
            children: BTreeMap::new(),
        });
    }

    while let Some((index, texts, covered)) = queue.pop_front() {
        let remaining: Vec<Vec<u8>> = texts.into_iter().filter(|t| t.len() > covered).collect();
        let Some(key_length) = remaining.iter().map(|t| t.len() - covered).min() else {
            continue;
        };
        if key_length > u16::MAX as usize {
            return Err(CompileError::TooLarge(format!("child key of {key_length} characters")));
        }

        let mut groups: BTreeMap<Vec<u8>, Vec<Vec<u8>>> = BTreeMap::new();
        for text in remaining {
            let key_end = text.len() - covered;
            groups.entry(text[key_end - key_length..key_end].to_vec()).or_default().push(text);
        }
        if groups.len() > u16::MAX as usize {
            return Err(CompileError::TooLarge(format!("{} children of one node", groups.len())));
        }

        let position = nodes[index].position;
        nodes[index].key_length = key_length as u16;
        let length = covered + key_length;
        for (key, group) in groups {
            let child = nodes.len();
            let first = &group[0];
            nodes.push(TreeNode {
                position: position - key_length as i16,
                complete: group.iter().any(|t| t.len() == length),
                parent: Some(index),
                characters: first[first.len() - length..].to_vec(),
                key_length: 0,
                children: BTreeMap::new(),
            });
            nodes[index].children.insert(key, child);
            queue.push_back((child, group, length));
        }
    }

    Ok((nodes, roots))
}

/// Encoded node records, readable the way the runtime reads them.
struct EncodedTree {
    roots: Vec<u32>,
    body: Vec<u8>,
}

impl NodeLookup for EncodedTree {
    fn root_count(&self) -> usize {
        self.roots.len()
    }

    fn root(&self, position: usize) -> Result<Option<u32>, DataSetError> {
        Ok(self.roots.get(position).copied().filter(|&o| o != NO_OFFSET))
    }

    fn node(&self, offset: u32) -> Result<Arc<Node>, DataSetError> {
        let start = offset as usize;
        let len = self
            .body
            .get(start..start + 4)
            .map(|bytes| read_u32_le(bytes, 0) as usize)
            .ok_or_else(|| DataSetError::CorruptData(format!("node offset {offset}")))?;
        let bytes = self
            .body
            .get(start..start + len)
            .ok_or_else(|| DataSetError::CorruptData(format!("node at {offset} of {len} bytes")))?;
        Ok(Arc::new(Node::decode(bytes)?))
    }
}

fn encode_tree(nodes: &[TreeNode], roots: &[Option<usize>]) -> (EncodedTree, Vec<u32>) {
    let mut offsets = Vec::with_capacity(nodes.len());
    let mut next = 0usize;
    for node in nodes {
        offsets.push(next as u32);
        next += node.record_size();
    }

    let mut body = Vec::with_capacity(next);
    for node in nodes {
        let start = begin_record(&mut body, NODE_FIXED_SIZE);
        let numeric = node.numeric_children();
        write_i16_le(&mut body, start + node_record::POSITION, node.position);
        let next_char = if node.complete { node.position } else { NO_POSITION };
        write_i16_le(&mut body, start + node_record::NEXT_CHAR_POSITION, next_char);
        let parent = node.parent.map_or(NO_OFFSET, |p| offsets[p]);
        write_u32_le(&mut body, start + node_record::PARENT_OFFSET, parent);
        write_u16_le(&mut body, start + node_record::CHILDREN_COUNT, node.children.len() as u16);
        write_u16_le(&mut body, start + node_record::NUMERIC_CHILDREN_COUNT, numeric.len() as u16);
        write_u16_le(&mut body, start + node_record::CHARACTERS_LENGTH, node.characters.len() as u16);
        write_u16_le(&mut body, start + node_record::CHILD_KEY_LENGTH, node.key_length);

        for &child in node.children.values() {
            put_u32(&mut body, offsets[child]);
        }
        for key in node.children.keys() {
            body.extend_from_slice(key);
        }
        for (value, child) in numeric {
            put_i32(&mut body, value);
            put_u32(&mut body, offsets[child]);
        }
        body.extend_from_slice(&node.characters);
        end_record(&mut body, start);
    }
    debug_assert_eq!(body.len(), next);

    let roots = roots.iter().map(|r| r.map_or(NO_OFFSET, |i| offsets[i])).collect();
    (EncodedTree { roots, body }, offsets)
}

struct SignatureBuild {
    profiles: Vec<u32>,
    /// Declared rank, then source order.
    order: (u32, usize),
    flags: SignatureFlags,
}

struct PatternSections {
    sections: Vec<SectionData>,
    node_count: usize,
    signature_count: usize,
    root_count: usize,
}

fn build_pattern_sections(
    patterns: &[PatternSource],
    catalog: &Catalog,
    profile_index: &ProfileIndex,
) -> Result<PatternSections, CompileError> {
    let component_count = catalog.components.len();
    let (nodes, roots) = build_tree(patterns)?;
    let (mut tree, offsets) = encode_tree(&nodes, &roots);
    let index_of_offset: HashMap<u32, usize> = offsets.iter().enumerate().map(|(i, &o)| (o, i)).collect();

    // A signature is whatever the runtime extracts from its training string.
    let mut signatures: BTreeMap<Vec<u32>, SignatureBuild> = BTreeMap::new();
    for (position, pattern) in patterns.iter().enumerate() {
        let found = extract_nodes(&tree, pattern.target.as_bytes(), false)?;
        if found.is_empty() {
            log::warn!("no nodes found in '{}', skipping", pattern.target);
            continue;
        }
        let mut key: Vec<u32> = found.iter().map(|f| f.offset).collect();
        key.sort_unstable();
        key.dedup();
        if key.len() > u16::MAX as usize {
            return Err(CompileError::TooLarge(format!("signature of {} nodes", key.len())));
        }

        let profiles = component_profiles(&pattern.profiles, component_count, profile_index)?;
        let mut flags = SignatureFlags::empty();
        if found.iter().any(|f| f.node.characters.iter().any(u8::is_ascii_digit)) {
            flags |= SignatureFlags::HAS_NUMERIC;
        }
        let order = (pattern.rank.unwrap_or(u32::MAX), position);

        match signatures.get_mut(&key) {
            Some(existing) => {
                if existing.profiles != profiles {
                    log::warn!(
                        "'{}' has the same signature as an earlier entry with other profiles",
                        pattern.target
                    );
                    existing.flags |= SignatureFlags::CONFLICTED;
                }
            }
            None => {
                signatures.insert(key, SignatureBuild { profiles, order, flags });
            }
        }
    }

    // Rank 0 is the most popular signature.
    let mut ranked: Vec<u32> = (0..signatures.len() as u32).collect();
    let orders: Vec<(u32, usize)> = signatures.values().map(|s| s.order).collect();
    ranked.sort_by_key(|&i| orders[i as usize]);
    let mut rank_of = vec![0u32; signatures.len()];
    for (rank, &index) in ranked.iter().enumerate() {
        rank_of[index as usize] = rank as u32;
    }

    let mut node_ranks: Vec<Vec<u32>> = vec![Vec::new(); nodes.len()];
    let mut signature_section = Vec::new();
    let mut node_offsets_section = Vec::new();
    let mut profiles_section = Vec::new();
    put_u32(&mut signature_section, signatures.len() as u32);
    put_u32(&mut node_offsets_section, 0);
    put_u32(&mut profiles_section, (signatures.len() * component_count) as u32);

    let mut first_node = 0u32;
    for (index, (key, signature)) in signatures.iter().enumerate() {
        let start = signature_section.len();
        signature_section.resize(start + SIGNATURE_ENTRY_SIZE, 0);
        write_u32_le(&mut signature_section, start + signature_entry::FIRST_NODE, first_node);
        write_u16_le(&mut signature_section, start + signature_entry::NODE_COUNT, key.len() as u16);
        write_u16_le(&mut signature_section, start + signature_entry::FLAGS, signature.flags.bits());
        write_u32_le(&mut signature_section, start + signature_entry::RANK, rank_of[index]);

        for &offset in key {
            put_u32(&mut node_offsets_section, offset);
            node_ranks[index_of_offset[&offset]].push(rank_of[index]);
        }
        first_node += key.len() as u32;

        for &profile in &signature.profiles {
            put_u32(&mut profiles_section, profile);
        }
    }
    write_u32_le(&mut node_offsets_section, 0, first_node);

    // Node signature lists, patched into the encoded nodes.
    let mut node_ranked = Vec::new();
    put_u32(&mut node_ranked, 0);
    let mut first_signature = 0u32;
    for (index, ranks) in node_ranks.iter_mut().enumerate() {
        ranks.sort_unstable();
        let at = offsets[index] as usize;
        write_u32_le(&mut tree.body, at + node_record::SIGNATURE_COUNT, ranks.len() as u32);
        write_u32_le(&mut tree.body, at + node_record::FIRST_SIGNATURE, first_signature);
        for &rank in ranks.iter() {
            put_u32(&mut node_ranked, rank);
        }
        first_signature += ranks.len() as u32;
    }
    write_u32_le(&mut node_ranked, 0, first_signature);

    let mut ranked_section = Vec::new();
    put_u32(&mut ranked_section, ranked.len() as u32);
    for &index in &ranked {
        put_u32(&mut ranked_section, index);
    }

    let mut root_section = Vec::new();
    put_u32(&mut root_section, tree.roots.len() as u32);
    for &root in &tree.roots {
        put_u32(&mut root_section, root);
    }

    let mut node_section = Vec::with_capacity(4 + tree.body.len());
    put_u32(&mut node_section, nodes.len() as u32);
    node_section.extend_from_slice(&tree.body);

    let conflicted = signatures
        .values()
        .filter(|s| s.flags.contains(SignatureFlags::CONFLICTED))
        .count();
    if conflicted > 0 {
        log::warn!("{conflicted} signatures are shared by entries with different profiles");
    }

    Ok(PatternSections {
        node_count: nodes.len(),
        signature_count: signatures.len(),
        root_count: tree.roots.len(),
        sections: vec![
            SectionData::new(SectionId::RootNodes, root_section),
            SectionData::new(SectionId::Nodes, node_section),
            SectionData::new(SectionId::Signatures, signature_section),
            SectionData::new(SectionId::SignatureNodeOffsets, node_offsets_section),
            SectionData::new(SectionId::SignatureProfiles, profiles_section),
            SectionData::new(SectionId::NodeRankedSignatureIndexes, node_ranked),
            SectionData::new(SectionId::RankedSignatureIndexes, ranked_section),
        ],
    })
}

// =============================================================================
// Graph Sections
// =============================================================================

struct GraphWriter<'a> {
    body: Vec<u8>,
    count: u32,
    component: u8,
    profile_index: &'a ProfileIndex,
}

impl GraphWriter<'_> {
    /// Encode a node and everything below it, children first. Returns the
    /// node's offset.
    fn node(&mut self, input: &HashNodeSource) -> Result<u32, CompileError> {
        if input.first_index < 0 || input.last_index < input.first_index {
            return Err(CompileError::InvalidSource(format!(
                "graph node range {}..={}",
                input.first_index, input.last_index
            )));
        }
        let length = input.children.first().map_or(0, |c| c.substring.len());
        if length > u16::MAX as usize {
            return Err(CompileError::TooLarge(format!("graph substring of {length} characters")));
        }

        let mut entries: Vec<(u32, i32)> = Vec::with_capacity(input.children.len());
        for child in &input.children {
            if child.substring.is_empty() || child.substring.len() != length {
                return Err(CompileError::InvalidSource(format!(
                    "graph substring '{}' is not {length} characters",
                    child.substring
                )));
            }
            let hash = rk_hash(child.substring.as_bytes());
            if entries.iter().any(|&(h, _)| h == hash) {
                return Err(CompileError::InvalidSource(format!(
                    "graph substring '{}' collides with a sibling",
                    child.substring
                )));
            }
            let value = self.target(&child.target)?;
            entries.push((hash, value));
        }
        let unmatched = self.target(&input.unmatched)?;

        let hashes: Vec<u32> = entries.iter().map(|&(h, _)| h).collect();
        let modulo = perfect_modulo(&hashes)?;
        let mut slots = vec![(0u32, GRAPH_NO_MATCH); modulo as usize];
        for (hash, value) in entries {
            slots[(hash % modulo) as usize] = (hash, value);
        }

        let start = begin_record(&mut self.body, HASH_NODE_FIXED_SIZE);
        let offset = start as u32;
        write_i16_le(&mut self.body, start + hash_node_record::FIRST_INDEX, input.first_index);
        write_i16_le(&mut self.body, start + hash_node_record::LAST_INDEX, input.last_index);
        write_u16_le(&mut self.body, start + hash_node_record::SUBSTRING_LENGTH, length as u16);
        write_u32_le(&mut self.body, start + hash_node_record::MODULO, modulo);
        write_i32_le(&mut self.body, start + hash_node_record::UNMATCHED, unmatched);
        write_u32_le(&mut self.body, start + hash_node_record::HASH_COUNT, hashes.len() as u32);
        for (hash, value) in slots {
            put_u32(&mut self.body, hash);
            put_i32(&mut self.body, value);
        }
        end_record(&mut self.body, start);
        self.count += 1;
        Ok(offset)
    }

    fn target(&mut self, target: &GraphTarget) -> Result<i32, CompileError> {
        match target {
            GraphTarget::NoMatch => Ok(GRAPH_NO_MATCH),
            GraphTarget::Profile(id) => {
                let &(offset, component) = self.profile_index.get(id).ok_or_else(|| CompileError::Unknown {
                    kind: "profile",
                    name: id.to_string(),
                })?;
                if component != self.component {
                    return Err(CompileError::InvalidSource(format!(
                        "graph of component {} leads to profile {id} of component {component}",
                        self.component
                    )));
                }
                Ok(graph_leaf(offset))
            }
            GraphTarget::Node(spec) => {
                let offset = self.node(spec)?;
                i32::try_from(offset).map_err(|_| CompileError::TooLarge(format!("graph node offset {offset}")))
            }
        }
    }
}

/// Smallest table size at which every hash lands in its own slot.
fn perfect_modulo(hashes: &[u32]) -> Result<u32, CompileError> {
    if hashes.is_empty() {
        return Ok(0);
    }
    let mut used = Vec::new();
    for modulo in hashes.len()..=hashes.len() * MAX_MODULO_FACTOR {
        used.clear();
        used.resize(modulo, false);
        let collision_free = hashes.iter().all(|&h| {
            let slot = &mut used[(h % modulo as u32) as usize];
            !std::mem::replace(slot, true)
        });
        if collision_free {
            return Ok(modulo as u32);
        }
    }
    Err(CompileError::NoPerfectHash(hashes.len()))
}

fn build_graph_sections(
    source: &DataSetSource,
    catalog: &Catalog,
    profile_index: &ProfileIndex,
) -> Result<(Vec<u8>, Vec<u8>), CompileError> {
    let component_names: Vec<String> = catalog.components.iter().map(|(n, _, _)| n.clone()).collect();
    let mut writer = GraphWriter {
        body: Vec::new(),
        count: 0,
        component: 0,
        profile_index,
    };

    let mut graphs = Vec::new();
    put_u32(&mut graphs, source.graphs.len() as u32);
    let mut seen: Vec<(u32, u32)> = Vec::new();
    for graph in &source.graphs {
        let component = index_of(&component_names, &graph.component, "component")?;
        let header_index = index_of(&catalog.headers, &graph.header, "header")?;
        if seen.contains(&(component, header_index)) {
            return Err(CompileError::InvalidSource(format!(
                "two graphs for {} / {}",
                graph.component, graph.header
            )));
        }
        seen.push((component, header_index));

        writer.component = component as u8;
        let performance = graph.performance.as_ref().map(|n| writer.node(n)).transpose()?;
        let predictive = graph.predictive.as_ref().map(|n| writer.node(n)).transpose()?;

        let start = graphs.len();
        graphs.resize(start + GRAPH_ENTRY_SIZE, 0);
        write_u16_le(&mut graphs, start, component as u16);
        write_u16_le(&mut graphs, start + 2, header_index as u16);
        write_u32_le(&mut graphs, start + 4, performance.unwrap_or(NO_OFFSET));
        write_u32_le(&mut graphs, start + 8, predictive.unwrap_or(NO_OFFSET));
    }

    log::debug!("graphs: {} graphs, {} nodes", source.graphs.len(), writer.count);
    let mut nodes = Vec::with_capacity(4 + writer.body.len());
    put_u32(&mut nodes, writer.count);
    nodes.extend_from_slice(&writer.body);
    Ok((graphs, nodes))
}

// =============================================================================
// Helpers
// =============================================================================

/// Reserve the fixed part of a variable-width record; returns its start.
fn begin_record(buf: &mut Vec<u8>, fixed_size: usize) -> usize {
    let start = buf.len();
    buf.resize(start + fixed_size, 0);
    start
}

/// Store the record length now that the record is complete.
fn end_record(buf: &mut [u8], start: usize) {
    let len = (buf.len() - start) as u32;
    write_u32_le(buf, start, len);
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u16_le(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_i16_le(buf: &mut [u8], offset: usize, value: i16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_i32_le(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
