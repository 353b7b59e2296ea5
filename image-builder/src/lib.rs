//! Reproducible environment provisioning.
//!
//! An environment is described declaratively by a [`ProvisionConfig`]: a
//! base image, a working directory made importable through a search-path
//! variable, a dependency manifest, an application payload, and a package
//! mirror. The [`Provisioner`] turns that description into an environment
//! by running a fixed, strictly sequential list of steps and stopping at
//! the first failure. The same description can be rendered as a
//! Containerfile for container runtimes.

pub mod base;
pub mod config;
pub mod containerfile;
pub mod context;
pub mod error;
pub mod executor;
pub mod installer;
pub mod manifest;
pub mod mirror;
pub mod pipeline;
pub mod snapshot;
pub mod steps;
pub mod verify;

pub use base::BaseImage;
pub use config::{InstallerConfig, ProvisionConfig, SourceConfig};
pub use context::{map_to_host, ProvisionContext};
pub use error::{ProvisionError, ProvisionResult};
pub use executor::{CommandExecutor, CommandOutput, DryRunExecutor, Invocation, SystemExecutor};
pub use manifest::{DependencyManifest, ManifestEntry, Requirement};
pub use mirror::MirrorConfig;
pub use pipeline::{ProvisionReport, Provisioner, StepRecord, StepStatus};
pub use snapshot::EnvironmentSnapshot;
pub use steps::{ProvisionStep, StepKind, StepOutcome};
pub use verify::{VerificationReport, Verifier};
