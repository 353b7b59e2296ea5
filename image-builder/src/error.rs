use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::ProvisionReport;
use crate::steps::StepKind;

/// Errors raised while provisioning an environment
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// A source file or directory required by a step does not exist
    #[error("Missing {what} at '{path}'")]
    MissingSource { what: &'static str, path: PathBuf },

    /// The environment root already holds content from an earlier run
    #[error("Environment root '{path}' is not empty. Discard it and provision from a clean base.")]
    DirtyEnvironment { path: PathBuf },

    /// A destination inside the environment could not be written
    #[error("Failed to write '{path}': {reason}")]
    Unwritable { path: PathBuf, reason: String },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Base image reference could not be parsed
    #[error("Invalid base image '{reference}': {reason}")]
    InvalidBaseImage { reference: String, reason: String },

    /// Manifest line could not be parsed
    #[error("Invalid manifest at line {line}: {reason}")]
    InvalidManifest { line: usize, reason: String },

    /// The configured package source is unreachable or rejected the request
    #[error("Package mirror '{url}' unreachable: {reason}")]
    MirrorUnreachable {
        url: String,
        reason: String,
        exit_code: Option<i32>,
    },

    /// A requested package/version could not be satisfied
    #[error("Dependency resolution failed (exit code {exit_code}): {output}")]
    DependencyResolution { exit_code: i32, output: String },

    /// The installer exited non-zero for another reason
    #[error("Installer `{command}` failed with exit code {exit_code}: {output}")]
    InstallerFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// An external program could not be located or spawned
    #[error("Failed to run `{program}`: {reason}")]
    CommandSpawn { program: String, reason: String },

    /// A step failed; later steps were not run
    #[error("Provisioning aborted at step '{step}': {source}")]
    StepAborted {
        step: StepKind,
        #[source]
        source: Box<ProvisionError>,
        report: Box<ProvisionReport>,
    },

    /// Config file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Exit code of the external command behind this error, if any
    pub fn command_exit_code(&self) -> Option<i32> {
        match self {
            ProvisionError::MirrorUnreachable { exit_code, .. } => *exit_code,
            ProvisionError::DependencyResolution { exit_code, .. }
            | ProvisionError::InstallerFailed { exit_code, .. } => Some(*exit_code),
            ProvisionError::StepAborted { source, .. } => source.command_exit_code(),
            _ => None,
        }
    }

    /// Process exit code to report for this error. Never zero.
    pub fn exit_code(&self) -> i32 {
        match self.command_exit_code() {
            Some(code) if code != 0 => code,
            _ => 1,
        }
    }

    /// Whether this failure happened before any installer invocation
    pub fn is_pre_install(&self) -> bool {
        match self {
            ProvisionError::StepAborted { step, .. } => step.precedes_install(),
            ProvisionError::MirrorUnreachable { exit_code, .. } => exit_code.is_none(),
            ProvisionError::DependencyResolution { .. }
            | ProvisionError::InstallerFailed { .. } => false,
            _ => true,
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
