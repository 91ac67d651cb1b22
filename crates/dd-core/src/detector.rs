//! Detector with hot reload
//!
//! [`DeviceDetector`] holds the current data set behind an `ArcSwap`.
//! Every request takes its own `Arc<DataSet>`, so a reload installs the new
//! data set for later requests while in-flight [`Results`] keep reading the
//! one they started with until they are dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::DetectionConfig;
use crate::dataset::{DataSet, DataSetError};
use crate::evidence::Evidence;
use crate::results::Results;

pub struct DeviceDetector {
    current: ArcSwap<DataSet>,
    config: DetectionConfig,
    path: Option<PathBuf>,
    generation: AtomicU64,
}

impl DeviceDetector {
    pub fn from_file(path: &Path, config: DetectionConfig) -> Result<Self, DataSetError> {
        let data_set = DataSet::from_file(path, config.clone())?;
        Ok(Self {
            current: ArcSwap::from_pointee(data_set),
            config,
            path: Some(path.to_path_buf()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn from_memory(bytes: Vec<u8>, config: DetectionConfig) -> Result<Self, DataSetError> {
        let data_set = DataSet::from_memory(bytes, config.clone())?;
        Ok(Self {
            current: ArcSwap::from_pointee(data_set),
            config,
            path: None,
            generation: AtomicU64::new(0),
        })
    }

    /// Acquire the current data set.
    pub fn data_set(&self) -> Arc<DataSet> {
        self.current.load_full()
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Number of completed reloads.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Reload from the file the detector was created from.
    ///
    /// On error the current data set stays installed.
    pub fn reload_from_file(&self) -> Result<(), DataSetError> {
        let path = self.path.as_deref().ok_or(DataSetError::NoReloadSource)?;
        let data_set = DataSet::from_file(path, self.config.clone())?;
        self.install(data_set);
        Ok(())
    }

    /// Replace the data set with one loaded from `bytes`.
    pub fn reload_from_memory(&self, bytes: Vec<u8>) -> Result<(), DataSetError> {
        let data_set = DataSet::from_memory(bytes, self.config.clone())?;
        self.install(data_set);
        Ok(())
    }

    fn install(&self, data_set: DataSet) {
        log::info!("installing data set '{}'", data_set.name());
        self.current.store(Arc::new(data_set));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn process_evidence(&self, evidence: &Evidence) -> Results {
        self.data_set().process_evidence(evidence)
    }

    pub fn process_user_agent(&self, user_agent: &str) -> Results {
        self.data_set().process_user_agent(user_agent)
    }

    pub fn process_device_id(&self, device_id: &str) -> Results {
        self.data_set().process_device_id(device_id)
    }
}
