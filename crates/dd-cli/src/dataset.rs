use std::fs;
use std::path::Path;
use std::time::Instant;

use clap::ValueEnum;
use dd_compiler::{build_data_set, BuildOptions, DataSetSource};
use dd_core::{DataSet, DetectionConfig, EngineKind, LoadMode};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum EngineArg {
    Auto,
    Pattern,
    Hash,
}

impl From<EngineArg> for EngineKind {
    fn from(engine: EngineArg) -> Self {
        match engine {
            EngineArg::Auto => EngineKind::Auto,
            EngineArg::Pattern => EngineKind::Pattern,
            EngineArg::Hash => EngineKind::Hash,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ModeArg {
    Memory,
    Mapped,
    File,
}

impl From<ModeArg> for LoadMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Memory => LoadMode::Memory,
            ModeArg::Mapped => LoadMode::Mapped,
            ModeArg::File => LoadMode::File,
        }
    }
}

/// Flags that shape a [`DetectionConfig`], applied over an optional file.
#[derive(Debug, Clone, Default)]
pub struct ConfigArgs {
    pub config: Option<String>,
    pub engine: Option<EngineArg>,
    pub mode: Option<ModeArg>,
    pub properties: Option<String>,
}

impl ConfigArgs {
    pub fn build(&self) -> Result<DetectionConfig, String> {
        let mut config = match &self.config {
            Some(path) => DetectionConfig::from_json_file(Path::new(path)).map_err(|e| e.to_string())?,
            None => DetectionConfig::new(),
        };
        if let Some(engine) = self.engine {
            config = config.with_engine(engine.into());
        }
        if let Some(mode) = self.mode {
            config = config.with_mode(mode.into());
        }
        if let Some(properties) = &self.properties {
            config = config.with_properties(properties);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct CompileStats {
    pub components: usize,
    pub properties: usize,
    pub profiles: usize,
    pub patterns: usize,
    pub graphs: usize,
    pub total_ms: f64,
}

pub fn compile_data_set_bytes(input: &Path, crc32: bool, verbose: bool) -> Result<(Vec<u8>, CompileStats), String> {
    let start = Instant::now();
    let content = fs::read_to_string(input).map_err(|e| format!("Failed to read '{}': {}", input.display(), e))?;
    let source = DataSetSource::from_json(&content).map_err(|e| format!("'{}': {}", input.display(), e))?;

    if verbose {
        for component in &source.components {
            println!(
                "  component {} - headers [{}], default profile {}",
                component.name,
                component.headers.join(", "),
                component.default_profile
            );
        }
    }

    let bytes = build_data_set(&source, &BuildOptions { crc32 }).map_err(|e| e.to_string())?;

    DataSet::from_memory(bytes.clone(), DetectionConfig::new())
        .map_err(|e| format!("Generated data set failed validation: {}", e))?;

    let stats = CompileStats {
        components: source.components.len(),
        properties: source.properties.len(),
        profiles: source.profiles.len(),
        patterns: source.patterns.len(),
        graphs: source.graphs.len(),
        total_ms: start.elapsed().as_secs_f64() * 1000.0,
    };
    Ok((bytes, stats))
}

pub fn write_data_set(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create '{}': {}", parent.display(), e))?;
    }
    fs::write(path, bytes).map_err(|e| format!("Failed to write '{}': {}", path.display(), e))?;
    Ok(())
}

pub fn load_data_set(path: &Path, config: DetectionConfig) -> Result<DataSet, String> {
    DataSet::from_file(path, config).map_err(|e| format!("Invalid data set '{}': {}", path.display(), e))
}
