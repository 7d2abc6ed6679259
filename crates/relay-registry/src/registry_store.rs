//! File-backed, read-through registry of service descriptors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info};

use crate::atomic_io::write_json_atomic;
use crate::service_descriptor::{CommandValidationError, ServiceDescriptor};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] CommandValidationError),
    #[error("failed to persist service registry to {path}: {detail}")]
    Persist { path: String, detail: String },
}

/// In-memory service map mirrored to a JSON file on every change.
#[derive(Debug)]
pub struct ServiceRegistry {
    path: PathBuf,
    services: RwLock<BTreeMap<String, ServiceDescriptor>>,
}

impl ServiceRegistry {
    /// Loads the registry file, creating its parent directory when missing.
    ///
    /// A missing file yields an empty registry. A file that exists but cannot
    /// be parsed is an error, so a later save never clobbers it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let services = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse_registry_file(&raw)
                .with_context(|| format!("failed to parse service registry {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        info!(
            path = %path.display(),
            services = services.len(),
            "service registry loaded"
        );
        Ok(Self {
            path,
            services: RwLock::new(services),
        })
    }

    /// Builds a registry that is not yet backed by an existing file.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            services: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn get(&self, id: &str) -> Option<ServiceDescriptor> {
        self.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Inserts or replaces `descriptor` and persists the whole map.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        descriptor.validate()?;
        let mut services = self.write();
        let service_id = descriptor.id.clone();
        let previous = services.insert(service_id.clone(), descriptor);
        if let Err(error) = self.persist(&services) {
            match previous {
                Some(previous) => {
                    services.insert(service_id, previous);
                }
                None => {
                    services.remove(service_id.as_str());
                }
            }
            return Err(error);
        }
        info!(service = %service_id, replaced = previous.is_some(), "service registered");
        Ok(())
    }

    /// Removes `id`, returning whether it was present.
    pub fn remove(&self, id: &str) -> Result<bool, RegistryError> {
        let mut services = self.write();
        let Some(removed) = services.remove(id) else {
            debug!(service = %id, "service removal skipped: not registered");
            return Ok(false);
        };
        if let Err(error) = self.persist(&services) {
            services.insert(id.to_string(), removed);
            return Err(error);
        }
        info!(service = %id, "service removed");
        Ok(true)
    }

    fn persist(&self, services: &BTreeMap<String, ServiceDescriptor>) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, services).map_err(|error| RegistryError::Persist {
            path: self.path.display().to_string(),
            detail: format!("{error:#}"),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, ServiceDescriptor>> {
        match self.services.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, ServiceDescriptor>> {
        match self.services.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn parse_registry_file(raw: &str) -> Result<BTreeMap<String, ServiceDescriptor>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let parsed: BTreeMap<String, ServiceDescriptor> = serde_json::from_str(raw)?;
    let mut services = BTreeMap::new();
    for (key, mut descriptor) in parsed {
        // The map key wins when an entry's embedded id disagrees with it.
        if descriptor.id != key {
            descriptor.id = key.clone();
        }
        descriptor
            .validate()
            .with_context(|| format!("service '{key}' is invalid"))?;
        services.insert(key, descriptor);
    }
    Ok(services)
}
