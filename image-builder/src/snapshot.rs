//! Persisted description of a provisioned environment.
//!
//! Code started later inside the environment reads the snapshot to learn
//! its namespace root instead of depending on ambient process state. The
//! snapshot holds no timestamps, so identical inputs give identical bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::base::BaseImage;
use crate::error::{ProvisionError, ProvisionResult};

/// Directory under the environment root holding provisioning metadata
pub const METADATA_DIR: &str = ".provision";
pub const SNAPSHOT_FILE: &str = "environment.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub base_image: BaseImage,
    pub workdir: PathBuf,
    /// Variable name that carries the namespace root
    pub search_path_var: String,
    pub env: BTreeMap<String, String>,
    pub manifest: PathBuf,
    pub payload: PathBuf,
    /// Directory the installed packages live in
    pub packages: PathBuf,
    pub requirements: Vec<String>,
    pub mirror_url: String,
    pub force_upgrade: String,
}

impl EnvironmentSnapshot {
    pub fn path(root: &Path) -> PathBuf {
        root.join(METADATA_DIR).join(SNAPSHOT_FILE)
    }

    /// Namespace root later processes should import from
    pub fn namespace_root(&self) -> Option<&str> {
        self.env.get(&self.search_path_var).map(String::as_str)
    }

    pub fn save(&self, root: &Path) -> ProvisionResult<PathBuf> {
        let path = Self::path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProvisionError::Unwritable {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        std::fs::write(&path, json).map_err(|e| ProvisionError::Unwritable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(path)
    }

    pub fn load(root: &Path) -> ProvisionResult<Self> {
        let path = Self::path(root);
        if !path.is_file() {
            return Err(ProvisionError::MissingSource {
                what: "environment snapshot",
                path,
            });
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
