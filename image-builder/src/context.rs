//! State threaded through the provisioning steps.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::base::BaseImage;
use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::executor::CommandExecutor;
use crate::manifest::DependencyManifest;
use crate::mirror::{MirrorConfig, MIRROR_CONFIG_VAR};

/// The environment under construction.
///
/// `root` is the host directory standing in for the environment's
/// filesystem. Paths recorded in `env` are environment paths (as seen by
/// code running inside it); [`ProvisionContext::host_path`] maps them onto
/// the host.
pub struct ProvisionContext {
    pub config: ProvisionConfig,
    pub root: PathBuf,
    pub executor: Arc<dyn CommandExecutor>,
    pub base: Option<BaseImage>,
    pub env: BTreeMap<String, String>,
    pub manifest: Option<DependencyManifest>,
    pub mirror: Option<MirrorConfig>,
}

impl ProvisionContext {
    pub fn new(
        config: ProvisionConfig,
        root: impl Into<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            config,
            root: root.into(),
            executor,
            base: None,
            env: BTreeMap::new(),
            manifest: None,
            mirror: None,
        }
    }

    /// Map an absolute environment path onto the host root
    pub fn host_path(&self, env_path: &Path) -> PathBuf {
        map_to_host(&self.root, env_path)
    }

    pub fn host_workdir(&self) -> PathBuf {
        self.host_path(&self.config.workdir)
    }

    /// Host directory the installer writes packages into
    pub fn host_packages(&self) -> PathBuf {
        self.host_path(&self.config.package_dir)
    }

    /// Environment for installer invocations, with environment paths mapped to the host
    pub fn installer_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        for key in [self.config.search_path_var.as_str(), MIRROR_CONFIG_VAR] {
            if let Some(value) = env.get_mut(key) {
                *value = self.host_path(Path::new(value.as_str())).display().to_string();
            }
        }
        env
    }
}

/// Map an absolute environment path onto `root`, never escaping it
pub fn map_to_host(root: &Path, env_path: &Path) -> PathBuf {
    let mut host = root.to_path_buf();
    for component in env_path.components() {
        match component {
            Component::Normal(part) => host.push(part),
            Component::ParentDir => {
                if host != root {
                    host.pop();
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    host
}

/// Join search-path entries with the platform separator
pub fn join_search_path(entries: &[PathBuf]) -> ProvisionResult<String> {
    let joined = std::env::join_paths(entries).map_err(|e| {
        ProvisionError::InvalidConfig(format!("cannot build search path: {}", e))
    })?;
    joined.into_string().map_err(|raw| {
        ProvisionError::InvalidConfig(format!(
            "search path {} is not valid UTF-8",
            raw.to_string_lossy()
        ))
    })
}
