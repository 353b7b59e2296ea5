//! Post-provisioning checks of installed package versions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::InstallerConfig;
use crate::context::{join_search_path, map_to_host};
use crate::error::ProvisionResult;
use crate::executor::CommandExecutor;
use crate::installer::Installer;
use crate::manifest::{normalize_name, DependencyManifest};
use crate::mirror::MIRROR_CONFIG_VAR;
use crate::snapshot::EnvironmentSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinCheck {
    pub package: String,
    pub expected: String,
    pub installed: Option<String>,
}

impl PinCheck {
    pub fn matches(&self) -> bool {
        self.installed
            .as_deref()
            .is_some_and(|installed| same_version(&self.expected, installed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForcedUpgradeCheck {
    pub package: String,
    pub installed: Option<String>,
    /// Newest version the mirror offers, when it could be determined
    pub latest: Option<String>,
}

impl ForcedUpgradeCheck {
    pub fn is_latest(&self) -> bool {
        match (&self.installed, &self.latest) {
            (Some(installed), Some(latest)) => installed == latest,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub pins: Vec<PinCheck>,
    pub forced_upgrade: ForcedUpgradeCheck,
}

impl VerificationReport {
    pub fn mismatches(&self) -> impl Iterator<Item = &PinCheck> {
        self.pins
            .iter()
            .filter(|check| check.installed.is_some() && !check.matches())
    }

    pub fn missing(&self) -> impl Iterator<Item = &PinCheck> {
        self.pins.iter().filter(|check| check.installed.is_none())
    }

    pub fn is_ok(&self) -> bool {
        self.pins.iter().all(PinCheck::matches) && self.forced_upgrade.is_latest()
    }
}

/// Queries the installer about what ended up in the environment
pub struct Verifier {
    installer: InstallerConfig,
    executor: Arc<dyn CommandExecutor>,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
}

impl Verifier {
    pub fn new(
        installer: InstallerConfig,
        executor: Arc<dyn CommandExecutor>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            installer,
            executor,
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    /// Verifier for an environment provisioned into `root`.
    ///
    /// The environment's package directory is appended to its search path
    /// so queries see what was installed there.
    pub fn for_snapshot(
        root: &Path,
        snapshot: &EnvironmentSnapshot,
        mut installer: InstallerConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> ProvisionResult<Self> {
        installer.force_upgrade = snapshot.force_upgrade.clone();

        let mut env = snapshot.env.clone();
        if let Some(value) = env.get_mut(MIRROR_CONFIG_VAR) {
            *value = map_to_host(root, Path::new(value.as_str()))
                .display()
                .to_string();
        }

        let mut search_path: Vec<PathBuf> = snapshot
            .namespace_root()
            .map(|entry| map_to_host(root, Path::new(entry)))
            .into_iter()
            .collect();
        search_path.push(map_to_host(root, &snapshot.packages));
        env.insert(
            snapshot.search_path_var.clone(),
            join_search_path(&search_path)?,
        );

        Ok(Self::new(installer, executor, map_to_host(root, &snapshot.workdir)).with_env(env))
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Installed version of `package`, or `None` if it is not installed
    pub async fn installed_version(&self, package: &str) -> ProvisionResult<Option<String>> {
        let invocation = Installer::new(&self.installer).show(package, &self.cwd, &self.env);
        let output = self.executor.run(&invocation).await?;
        if !output.is_success() {
            debug!("`{}` reported {} as not installed", invocation.display(), package);
            return Ok(None);
        }
        Ok(parse_show_version(&output.stdout))
    }

    /// Newest version of `package` available from the configured index
    pub async fn latest_version(&self, package: &str) -> ProvisionResult<Option<String>> {
        let invocation =
            Installer::new(&self.installer).index_versions(package, &self.cwd, &self.env);
        let output = self.executor.run(&invocation).await?;
        if !output.is_success() {
            warn!(
                "Could not query latest version of {}: {}",
                package,
                output.combined()
            );
            return Ok(None);
        }
        Ok(parse_index_latest(&output.stdout, package))
    }

    pub async fn verify(&self, manifest: &DependencyManifest) -> ProvisionResult<VerificationReport> {
        let mut pins = Vec::new();
        for (package, expected) in manifest.pins() {
            pins.push(PinCheck {
                package: package.to_string(),
                expected: expected.to_string(),
                installed: self.installed_version(package).await?,
            });
        }

        let forced = self.installer.force_upgrade.clone();
        let forced_upgrade = ForcedUpgradeCheck {
            installed: self.installed_version(&forced).await?,
            latest: self.latest_version(&forced).await?,
            package: forced,
        };

        Ok(VerificationReport {
            pins,
            forced_upgrade,
        })
    }
}

/// Compare two versions the way the installer does for `==` pins.
///
/// Release segments compare numerically with trailing zeros ignored, so
/// `1.24` equals `1.24.0`. A local label (`+cu121`) on the installed version
/// is ignored unless the expected version names one.
pub fn same_version(expected: &str, installed: &str) -> bool {
    let expected = expected.trim().to_ascii_lowercase();
    let mut installed = installed.trim().to_ascii_lowercase();
    if !expected.contains('+') {
        if let Some((public, _local)) = installed.split_once('+') {
            installed = public.to_string();
        }
    }
    normalized_version(&expected) == normalized_version(&installed)
}

fn normalized_version(version: &str) -> (Vec<u64>, String) {
    let version = version.strip_prefix('v').unwrap_or(version);
    let (epoch, rest) = match version.split_once('!') {
        Some((epoch, rest)) => (epoch.parse::<u64>().unwrap_or(0), rest),
        None => (0, version),
    };

    let release_end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (release, suffix) = rest.split_at(release_end);
    // A trailing '.' belongs to the suffix (`1.0.post1`).
    let release = release.trim_end_matches('.');

    let mut segments = vec![epoch];
    segments.extend(
        release
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u64>().unwrap_or(0)),
    );
    while segments.len() > 2 && segments.last() == Some(&0) {
        segments.pop();
    }
    let suffix = suffix.trim_start_matches(['.', '-', '_']).to_string();
    (segments, suffix)
}

/// Extract `Version:` from `show` output
pub fn parse_show_version(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.strip_prefix("Version:")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    })
}

/// Extract the version from an `index versions` header line such as `numpy (1.26.4)`
pub fn parse_index_latest(output: &str, package: &str) -> Option<String> {
    let wanted = normalize_name(package);
    output.lines().find_map(|line| {
        let (name, rest) = line.trim().split_once(' ')?;
        if normalize_name(name) != wanted {
            return None;
        }
        let version = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
        Some(version.trim().to_string())
    })
}
