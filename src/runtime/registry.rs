//! Runtime identifier -> container image table.
//!
//! The table is immutable once built. A process-wide instance is installed once
//! at startup and shared through an `Arc`.

use crate::config::loader::{default_runtimes, RuntimeEntry};
use crate::config::types::{LauncherError, Result};
use crate::runtime::image::ImageRef;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

static GLOBAL_REGISTRY: OnceCell<Arc<ImageRegistry>> = OnceCell::new();

/// A supported runtime and the image that provides it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RuntimeSpec {
    pub id: String,
    pub image: ImageRef,
    pub aliases: Vec<String>,
    pub base_image: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug)]
pub struct ImageRegistry {
    runtimes: Vec<RuntimeSpec>,
    /// Lower-cased id or alias -> index into `runtimes`
    index: HashMap<String, usize>,
}

impl ImageRegistry {
    pub fn from_entries(entries: &[RuntimeEntry]) -> Result<Self> {
        if entries.is_empty() {
            return Err(LauncherError::Config("runtime table is empty".to_string()));
        }

        let mut runtimes = Vec::with_capacity(entries.len());
        let mut index = HashMap::new();

        for entry in entries {
            let image = ImageRef::parse(&entry.image).map_err(|e| {
                LauncherError::Config(format!("runtime '{}': {}", entry.id, e))
            })?;
            let slot = runtimes.len();
            for name in std::iter::once(&entry.id).chain(entry.aliases.iter()) {
                let key = normalize(name);
                if key.is_empty() {
                    return Err(LauncherError::Config("empty runtime identifier".to_string()));
                }
                if index.insert(key, slot).is_some() {
                    return Err(LauncherError::Config(format!(
                        "runtime identifier '{}' is declared twice",
                        name
                    )));
                }
            }
            runtimes.push(RuntimeSpec {
                id: entry.id.clone(),
                image,
                aliases: entry.aliases.clone(),
                base_image: entry.base_image.clone(),
                description: entry.description.clone(),
            });
        }

        Ok(Self { runtimes, index })
    }

    /// Table built from the stock `code-runner-*` images
    pub fn builtin() -> Self {
        // The stock table is static data and always parses.
        Self::from_entries(&default_runtimes()).unwrap_or_else(|e| {
            unreachable!("built-in runtime table is invalid: {e}")
        })
    }

    /// Pure lookup; no side effects.
    pub fn resolve(&self, runtime_id: &str) -> Result<&RuntimeSpec> {
        self.index
            .get(&normalize(runtime_id))
            .map(|&slot| &self.runtimes[slot])
            .ok_or_else(|| LauncherError::UnsupportedRuntime(runtime_id.to_string()))
    }

    /// Every supported runtime, in table order
    pub fn runtimes(&self) -> &[RuntimeSpec] {
        &self.runtimes
    }

    pub fn is_supported(&self, runtime_id: &str) -> bool {
        self.index.contains_key(&normalize(runtime_id))
    }
}

fn normalize(runtime_id: &str) -> String {
    runtime_id.trim().to_ascii_lowercase()
}

/// Install the process-wide table. Fails if one is already installed.
pub fn install_global(registry: ImageRegistry) -> Result<Arc<ImageRegistry>> {
    let registry = Arc::new(registry);
    GLOBAL_REGISTRY
        .set(Arc::clone(&registry))
        .map_err(|_| LauncherError::Config("image registry already installed".to_string()))?;
    log::info!(
        "Installed image registry with {} runtimes",
        registry.runtimes().len()
    );
    Ok(registry)
}

/// Process-wide table; the built-in one if nothing was installed.
pub fn global() -> Arc<ImageRegistry> {
    Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(ImageRegistry::builtin())))
}
