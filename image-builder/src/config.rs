use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::base::BaseImage;
use crate::error::{ProvisionError, ProvisionResult};
use crate::manifest::Requirement;
use crate::mirror::MirrorConfig;

pub const DEFAULT_BASE_IMAGE: &str = "pytorch/pytorch:2.1.0-cuda12.1-cudnn8-runtime";
pub const DEFAULT_WORKDIR: &str = "/workspace";
pub const DEFAULT_SEARCH_PATH_VAR: &str = "PYTHONPATH";
pub const DEFAULT_MIRROR_URL: &str = "https://pypi.tuna.tsinghua.edu.cn/simple";
pub const DEFAULT_FORCE_UPGRADE: &str = "transformers";
pub const DEFAULT_PACKAGE_DIR: &str = "/opt/site-packages";

/// File name the manifest is given inside the working directory
pub const MANIFEST_FILE_NAME: &str = "requirements.txt";

/// Where the inputs to provisioning come from on the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Dependency manifest file
    pub manifest: PathBuf,
    /// Application payload directory
    pub payload: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from(MANIFEST_FILE_NAME),
            payload: PathBuf::from("api"),
        }
    }
}

/// How the package installer is invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Installer program, e.g. `pip` or `python3`
    pub program: String,
    /// Arguments placed before the installer subcommand, e.g. `["-m", "pip"]`
    pub args: Vec<String>,
    /// Mirror every install is fetched from
    pub mirror_url: String,
    /// Skip the installer's download cache
    pub no_cache: bool,
    /// Package reinstalled at its latest version after the bulk install
    pub force_upgrade: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: "pip".to_string(),
            args: Vec::new(),
            mirror_url: DEFAULT_MIRROR_URL.to_string(),
            no_cache: true,
            force_upgrade: DEFAULT_FORCE_UPGRADE.to_string(),
        }
    }
}

impl InstallerConfig {
    /// Installer program plus leading args, rendered as one shell word list
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Declarative description of an environment to provision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub base_image: String,
    /// Absolute working directory inside the environment
    pub workdir: PathBuf,
    /// Variable that makes `workdir` an importable namespace root
    pub search_path_var: String,
    /// Directory inside the environment that locally provisioned packages are installed into
    pub package_dir: PathBuf,
    /// Check the mirror answers before installing
    pub probe_mirror: bool,
    pub sources: SourceConfig,
    pub installer: InstallerConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            workdir: PathBuf::from(DEFAULT_WORKDIR),
            search_path_var: DEFAULT_SEARCH_PATH_VAR.to_string(),
            package_dir: PathBuf::from(DEFAULT_PACKAGE_DIR),
            probe_mirror: false,
            sources: SourceConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

impl ProvisionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a config file. Relative source paths resolve against the file's directory.
    pub fn from_file(path: &Path) -> ProvisionResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ProvisionError::MissingSource {
                what: "config file",
                path: path.to_path_buf(),
            },
            _ => ProvisionError::Io(e),
        })?;
        let config = Self::from_toml_str(&content)?;
        let base_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Ok(config.resolve_sources(base_dir))
    }

    pub fn from_toml_str(content: &str) -> ProvisionResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Make relative source paths relative to `base_dir`
    pub fn resolve_sources(mut self, base_dir: &Path) -> Self {
        if self.sources.manifest.is_relative() {
            self.sources.manifest = base_dir.join(&self.sources.manifest);
        }
        if self.sources.payload.is_relative() {
            self.sources.payload = base_dir.join(&self.sources.payload);
        }
        self
    }

    /// Apply `PROVISION_*` overrides from the given variables
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            match key.as_ref() {
                "PROVISION_BASE_IMAGE" => self.base_image = value.into(),
                "PROVISION_MIRROR_URL" => self.installer.mirror_url = value.into(),
                "PROVISION_FORCE_UPGRADE" => self.installer.force_upgrade = value.into(),
                "PROVISION_WORKDIR" => self.workdir = PathBuf::from(value.into()),
                "PROVISION_PACKAGE_DIR" => self.package_dir = PathBuf::from(value.into()),
                _ => {}
            }
        }
        self
    }

    pub fn with_base_image(mut self, base_image: impl Into<String>) -> Self {
        self.base_image = base_image.into();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_package_dir(mut self, package_dir: impl Into<PathBuf>) -> Self {
        self.package_dir = package_dir.into();
        self
    }

    pub fn with_manifest(mut self, manifest: impl Into<PathBuf>) -> Self {
        self.sources.manifest = manifest.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<PathBuf>) -> Self {
        self.sources.payload = payload.into();
        self
    }

    pub fn with_mirror_url(mut self, mirror_url: impl Into<String>) -> Self {
        self.installer.mirror_url = mirror_url.into();
        self
    }

    pub fn with_force_upgrade(mut self, package: impl Into<String>) -> Self {
        self.installer.force_upgrade = package.into();
        self
    }

    pub fn with_installer(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.installer.program = program.into();
        self.installer.args = args;
        self
    }

    pub fn with_probe_mirror(mut self, probe: bool) -> Self {
        self.probe_mirror = probe;
        self
    }

    pub fn base(&self) -> ProvisionResult<BaseImage> {
        BaseImage::parse(&self.base_image)
    }

    pub fn mirror(&self) -> ProvisionResult<MirrorConfig> {
        MirrorConfig::new(&self.installer.mirror_url)
    }

    /// Name of the payload directory inside the working directory
    pub fn payload_name(&self) -> ProvisionResult<String> {
        self.sources
            .payload
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ProvisionError::InvalidConfig(format!(
                    "payload path '{}' has no directory name",
                    self.sources.payload.display()
                ))
            })
    }

    /// Absolute path of the manifest inside the environment
    pub fn manifest_target(&self) -> PathBuf {
        self.workdir.join(MANIFEST_FILE_NAME)
    }

    /// Absolute path of the payload inside the environment
    pub fn payload_target(&self) -> ProvisionResult<PathBuf> {
        Ok(self.workdir.join(self.payload_name()?))
    }

    pub fn validate(&self) -> ProvisionResult<()> {
        self.base()?;
        self.mirror()?;

        if !self.workdir.is_absolute() {
            return Err(ProvisionError::InvalidConfig(format!(
                "workdir '{}' must be an absolute path",
                self.workdir.display()
            )));
        }

        if !self.package_dir.is_absolute() {
            return Err(ProvisionError::InvalidConfig(format!(
                "package_dir '{}' must be an absolute path",
                self.package_dir.display()
            )));
        }

        if self.search_path_var.is_empty()
            || self.search_path_var.contains('=')
            || self.search_path_var.chars().any(char::is_whitespace)
        {
            return Err(ProvisionError::InvalidConfig(format!(
                "'{}' is not a valid environment variable name",
                self.search_path_var
            )));
        }

        if self.installer.program.trim().is_empty() {
            return Err(ProvisionError::InvalidConfig(
                "installer program cannot be empty".to_string(),
            ));
        }

        let forced = Requirement::parse(&self.installer.force_upgrade).map_err(|reason| {
            ProvisionError::InvalidConfig(format!("force_upgrade: {}", reason))
        })?;
        if !forced.is_unconstrained() || forced.marker.is_some() {
            return Err(ProvisionError::InvalidConfig(format!(
                "force_upgrade '{}' must be a bare package name; it is always upgraded to the latest version",
                self.installer.force_upgrade
            )));
        }

        self.payload_name()?;
        Ok(())
    }
}
