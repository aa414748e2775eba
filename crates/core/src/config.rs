use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::error::{Error, Result};

/// Named roots every new machine gets, each seeded under `nasRoot`.
pub const DEFAULT_ROOTS: [&str; 4] = ["clips", "downloads", "imports", "libraries"];

const CONFIG_FILE_NAME: &str = "path-mapping.json";

/// Per-machine view of the shared library. Lives outside the catalog and is
/// never sent to other machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMappingConfig {
    pub computer_id: String,
    pub computer_name: String,
    pub os: String,
    pub nas_root: PathBuf,
    pub path_mappings: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nas_fs_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PathMappingConfig {
    pub fn new(computer_name: impl Into<String>, nas_root: impl Into<PathBuf>) -> Self {
        let nas_root = nas_root.into();
        let path_mappings = DEFAULT_ROOTS
            .iter()
            .map(|name| (name.to_string(), nas_root.join(name)))
            .collect();
        let now = Utc::now();
        Self {
            computer_id: uuid::Uuid::new_v4().to_string(),
            computer_name: computer_name.into(),
            os: std::env::consts::OS.to_string(),
            nas_root,
            path_mappings,
            nas_fs_type: None,
            created_at: now,
            last_updated: now,
        }
    }

    pub fn mapping(&self, name: &str) -> Option<&Path> {
        self.path_mappings.get(name).map(PathBuf::as_path)
    }

    pub fn set_mapping(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.path_mappings.insert(name.into(), path.into());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Loads the machine's [`PathMappingConfig`] on first use and keeps it until
/// [`ConfigStore::reload`] is called.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    cached: Option<PathMappingConfig>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
        }
    }

    /// `<config dir>/clipvault/path-mapping.json`.
    pub fn default_location() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            Error::InvalidArgument("no per-user config directory on this platform".to_string())
        })?;
        Ok(base.join("clipvault").join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn cached(&self) -> Option<&PathMappingConfig> {
        self.cached.as_ref()
    }

    pub fn load(&mut self) -> Result<&PathMappingConfig> {
        if self.cached.is_none() {
            let config = self.read()?;
            self.cached = Some(config);
        }
        self.cached
            .as_ref()
            .ok_or_else(|| Error::ConfigMissing {
                path: self.path.clone(),
            })
    }

    pub fn reload(&mut self) -> Result<&PathMappingConfig> {
        self.cached = None;
        self.load()
    }

    pub fn save(&mut self, config: PathMappingConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&config)?;
        write_atomic(&self.path, &json)?;
        tracing::debug!(path = %self.path.display(), computer_id = %config.computer_id, "saved path mapping config");
        self.cached = Some(config);
        Ok(())
    }

    fn read(&self) -> Result<PathMappingConfig> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::ConfigMissing {
                    path: self.path.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}
