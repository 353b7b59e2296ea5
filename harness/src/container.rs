use image_builder::{containerfile, ProvisionConfig, ProvisionError};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

/// Container runtime types supported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerRuntime {
    /// Podman container runtime
    Podman,
    /// Docker container runtime
    Docker,
    /// Docker-compatible CLI at an explicit path
    Custom(PathBuf),
    /// No container runtime available
    None,
}

impl ContainerRuntime {
    /// Get the command name for this runtime
    pub fn command(&self) -> &OsStr {
        match self {
            ContainerRuntime::Podman => OsStr::new("podman"),
            ContainerRuntime::Docker => OsStr::new("docker"),
            ContainerRuntime::Custom(path) => path.as_os_str(),
            ContainerRuntime::None => OsStr::new(""),
        }
    }

    /// Check if this runtime is available
    pub fn is_available(&self) -> bool {
        !matches!(self, ContainerRuntime::None)
    }

    /// Parse a runtime given on the command line: `podman`, `docker` or a path
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "podman" => Some(ContainerRuntime::Podman),
            "docker" => Some(ContainerRuntime::Docker),
            _ if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') => {
                Some(ContainerRuntime::Custom(PathBuf::from(name)))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerRuntime::None => f.write_str("none"),
            other => write!(f, "{}", Path::new(other.command()).display()),
        }
    }
}

/// Container backend errors
#[derive(Error, Debug)]
pub enum ContainerError {
    /// No container runtime is available
    #[error("No container runtime available. Please install Docker or Podman to build environment images.")]
    NoRuntimeAvailable,

    /// Build context is missing an input
    #[error("Build context is missing {what} at '{path}'")]
    MissingInput { what: &'static str, path: PathBuf },

    /// The runtime's build exited non-zero
    #[error("Image build for '{tag}' failed with exit code {exit_code}: {output}")]
    BuildFailed {
        tag: String,
        exit_code: i32,
        output: String,
    },

    /// Image removal failed
    #[error("Failed to remove image '{tag}': {reason}")]
    RemoveFailed { tag: String, reason: String },

    /// Command execution failed
    #[error("Command execution failed: {command}")]
    CommandFailed { command: String },

    /// Containerfile could not be rendered
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Process exit code to report for this error. Never zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            ContainerError::BuildFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
            ContainerError::Provision(e) => e.exit_code(),
            _ => 1,
        }
    }
}

/// Configuration for building an environment image
#[derive(Debug, Clone)]
pub struct ContainerBuildConfig {
    /// Environment description
    pub provision: ProvisionConfig,
    /// Directory handed to the runtime as build context
    pub context: PathBuf,
    /// Tag of the resulting image
    pub tag: String,
    /// Additional build arguments
    pub additional_args: Vec<String>,
}

impl ContainerBuildConfig {
    pub fn new(provision: ProvisionConfig, context: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            provision,
            context: context.into(),
            tag: tag.into(),
            additional_args: Vec::new(),
        }
    }
}

/// Detect available container runtime in order of preference
pub fn detect_runtime() -> ContainerRuntime {
    // Try Podman first (often better for rootless containers)
    if Command::new("podman")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
    {
        return ContainerRuntime::Podman;
    }

    // Fall back to Docker
    if Command::new("docker")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
    {
        return ContainerRuntime::Docker;
    }

    ContainerRuntime::None
}

/// Verify that a container image exists locally
pub fn verify_image_exists(
    runtime: &ContainerRuntime,
    image_name: &str,
) -> Result<bool, ContainerError> {
    if !runtime.is_available() {
        return Err(ContainerError::NoRuntimeAvailable);
    }

    let output = Command::new(runtime.command())
        .args(["image", "inspect", image_name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|_e| ContainerError::CommandFailed {
            command: format!("{} image inspect {}", runtime, image_name),
        })?;

    Ok(output.status.success())
}

/// Check the build context holds the manifest and payload
pub fn check_build_inputs(config: &ContainerBuildConfig) -> Result<(), ContainerError> {
    let sources = &config.provision.sources;
    if !sources.manifest.is_file() {
        return Err(ContainerError::MissingInput {
            what: "dependency manifest",
            path: sources.manifest.clone(),
        });
    }
    if !sources.payload.is_dir() {
        return Err(ContainerError::MissingInput {
            what: "application payload directory",
            path: sources.payload.clone(),
        });
    }
    Ok(())
}

/// Assemble the runtime's build command
pub fn build_command(
    runtime: &ContainerRuntime,
    config: &ContainerBuildConfig,
    containerfile: &Path,
) -> Command {
    let mut cmd = Command::new(runtime.command());
    cmd.args(["build", "-t", &config.tag, "-f"])
        .arg(containerfile)
        .args(&config.additional_args)
        .arg(&config.context);
    cmd
}

/// Render the Containerfile and build it with `runtime`
pub fn build_environment_image(
    runtime: &ContainerRuntime,
    config: &ContainerBuildConfig,
) -> Result<String, ContainerError> {
    if !runtime.is_available() {
        return Err(ContainerError::NoRuntimeAvailable);
    }

    check_build_inputs(config)?;
    let rendered = containerfile::render(&config.provision, &config.context)?;

    // The Containerfile lives outside the context so the context stays untouched.
    let scratch = tempfile::Builder::new().prefix("provision-").tempdir()?;
    let containerfile_path = scratch.path().join("Containerfile");
    std::fs::write(&containerfile_path, &rendered)?;
    debug!("Rendered Containerfile:\n{}", rendered);

    info!(
        "Building {} with {} from {}",
        config.tag,
        runtime,
        config.context.display()
    );
    let output = build_command(runtime, config, &containerfile_path)
        .output()
        .map_err(|_e| ContainerError::CommandFailed {
            command: format!("{} build -t {}", runtime, config.tag),
        })?;

    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(ContainerError::BuildFailed {
            tag: config.tag.clone(),
            exit_code: output.status.code().unwrap_or(1),
            output: text,
        });
    }

    println!("✅ Built environment image: {}", config.tag);
    Ok(config.tag.clone())
}

/// Build the image, first removing any existing image with the same tag
pub fn rebuild_environment_image(
    runtime: &ContainerRuntime,
    config: &ContainerBuildConfig,
) -> Result<String, ContainerError> {
    if !runtime.is_available() {
        return Err(ContainerError::NoRuntimeAvailable);
    }
    check_build_inputs(config)?;
    if verify_image_exists(runtime, &config.tag)? {
        info!("Replacing existing image {}", config.tag);
        remove_image(runtime, &config.tag)?;
    }
    build_environment_image(runtime, config)
}

/// Remove a built image
pub fn remove_image(runtime: &ContainerRuntime, tag: &str) -> Result<(), ContainerError> {
    if !runtime.is_available() {
        return Ok(()); // Nothing to clean up
    }

    let output = Command::new(runtime.command())
        .args(["rmi", "-f", tag])
        .output()
        .map_err(|e| ContainerError::RemoveFailed {
            tag: tag.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ContainerError::RemoveFailed {
            tag: tag.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    println!("✅ Image removed: {}", tag);
    Ok(())
}
