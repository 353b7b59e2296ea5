//! Package installer invocations and failure classification.

use std::collections::BTreeMap;
use std::path::Path;

use crate::config::InstallerConfig;
use crate::error::ProvisionError;
use crate::executor::{CommandOutput, Invocation};

const MIRROR_FAILURE_MARKERS: &[&str] = &[
    "Failed to establish a new connection",
    "Could not fetch URL",
    "NewConnectionError",
    "Name or service not known",
    "Temporary failure in name resolution",
    "ConnectionError",
    "ConnectTimeoutError",
];

const RESOLUTION_FAILURE_MARKERS: &[&str] = &[
    "Could not find a version that satisfies",
    "No matching distribution found",
    "ResolutionImpossible",
];

/// Builds installer invocations from the configured program
#[derive(Debug, Clone)]
pub struct Installer<'a> {
    config: &'a InstallerConfig,
    target: Option<&'a Path>,
}

impl<'a> Installer<'a> {
    pub fn new(config: &'a InstallerConfig) -> Self {
        Self {
            config,
            target: None,
        }
    }

    /// Install into `dir` instead of the interpreter running the installer
    pub fn with_target(mut self, dir: &'a Path) -> Self {
        self.target = Some(dir);
        self
    }

    fn base(&self, cwd: &Path, env: &BTreeMap<String, String>) -> Invocation {
        Invocation::new(&self.config.program)
            .args(self.config.args.iter().cloned())
            .current_dir(cwd)
            .envs(env)
    }

    /// Options shared by both installs
    fn install_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.config.no_cache {
            args.push("--no-cache-dir".to_string());
        }
        if let Some(target) = self.target {
            args.push("--target".to_string());
            args.push(target.display().to_string());
        }
        args
    }

    /// Bulk install of every manifest entry
    pub fn install_manifest(
        &self,
        manifest: &Path,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Invocation {
        self.base(cwd, env)
            .arg("install")
            .args(self.install_args())
            .arg("-r")
            .arg(manifest.display().to_string())
    }

    /// Reinstall the forced package at its newest available version
    pub fn force_upgrade(&self, cwd: &Path, env: &BTreeMap<String, String>) -> Invocation {
        self.base(cwd, env)
            .arg("install")
            .args(self.install_args())
            .arg("--upgrade")
            .arg(&self.config.force_upgrade)
    }

    pub fn show(&self, package: &str, cwd: &Path, env: &BTreeMap<String, String>) -> Invocation {
        self.base(cwd, env).arg("show").arg(package)
    }

    pub fn index_versions(
        &self,
        package: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Invocation {
        self.base(cwd, env).args(["index", "versions", package])
    }

    /// Map a non-zero installer exit to the error taxonomy
    pub fn classify_failure(&self, invocation: &Invocation, output: &CommandOutput) -> ProvisionError {
        classify_failure(invocation, output, &self.config.mirror_url)
    }
}

/// Map a failed installer invocation to a mirror, resolution or generic error
pub fn classify_failure(
    invocation: &Invocation,
    output: &CommandOutput,
    mirror_url: &str,
) -> ProvisionError {
    let text = output.combined();
    // Signal-terminated processes have no exit code.
    let exit_code = output.exit_code.unwrap_or(1);

    if RESOLUTION_FAILURE_MARKERS.iter().any(|m| text.contains(m)) {
        // Exhausted connection retries surface as resolution errors too.
        if MIRROR_FAILURE_MARKERS.iter().any(|m| text.contains(m)) && !text.contains("Collecting")
        {
            return ProvisionError::MirrorUnreachable {
                url: mirror_url.to_string(),
                reason: text,
                exit_code: Some(exit_code),
            };
        }
        return ProvisionError::DependencyResolution {
            exit_code,
            output: text,
        };
    }

    if MIRROR_FAILURE_MARKERS.iter().any(|m| text.contains(m)) {
        return ProvisionError::MirrorUnreachable {
            url: mirror_url.to_string(),
            reason: text,
            exit_code: Some(exit_code),
        };
    }

    ProvisionError::InstallerFailed {
        command: invocation.display(),
        exit_code,
        output: text,
    }
}
