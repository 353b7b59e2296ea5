//! Individual provisioning steps.
//!
//! Each step reads and extends the [`ProvisionContext`] left by the steps
//! before it. None of them retries or undoes work; the runner stops at the
//! first error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::context::ProvisionContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::installer::Installer;
use crate::manifest::DependencyManifest;
use crate::mirror::{MIRROR_CONFIG_PATH, MIRROR_CONFIG_VAR};
use crate::snapshot::EnvironmentSnapshot;

/// Identifies a step in the fixed provisioning order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SelectBase,
    EstablishWorkdir,
    SetSearchPath,
    PlaceManifest,
    CreatePayloadDir,
    PlacePayload,
    ConfigureMirror,
    InstallManifest,
    ForceUpgrade,
    RecordEnvironment,
}

impl StepKind {
    pub const ALL: [StepKind; 10] = [
        StepKind::SelectBase,
        StepKind::EstablishWorkdir,
        StepKind::SetSearchPath,
        StepKind::PlaceManifest,
        StepKind::CreatePayloadDir,
        StepKind::PlacePayload,
        StepKind::ConfigureMirror,
        StepKind::InstallManifest,
        StepKind::ForceUpgrade,
        StepKind::RecordEnvironment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::SelectBase => "select_base",
            StepKind::EstablishWorkdir => "establish_workdir",
            StepKind::SetSearchPath => "set_search_path",
            StepKind::PlaceManifest => "place_manifest",
            StepKind::CreatePayloadDir => "create_payload_dir",
            StepKind::PlacePayload => "place_payload",
            StepKind::ConfigureMirror => "configure_mirror",
            StepKind::InstallManifest => "install_manifest",
            StepKind::ForceUpgrade => "force_upgrade",
            StepKind::RecordEnvironment => "record_environment",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StepKind::SelectBase => "Select the base environment",
            StepKind::EstablishWorkdir => "Create the working directory",
            StepKind::SetSearchPath => "Make the working directory an importable namespace root",
            StepKind::PlaceManifest => "Copy the dependency manifest",
            StepKind::CreatePayloadDir => "Create the payload directory",
            StepKind::PlacePayload => "Copy the application payload",
            StepKind::ConfigureMirror => "Point the installer at the package mirror",
            StepKind::InstallManifest => "Install manifest dependencies without caching",
            StepKind::ForceUpgrade => "Upgrade the forced package to its latest version",
            StepKind::RecordEnvironment => "Write the environment snapshot",
        }
    }

    /// Whether the step runs before the installer is first invoked
    pub fn precedes_install(&self) -> bool {
        !matches!(
            self,
            StepKind::InstallManifest | StepKind::ForceUpgrade | StepKind::RecordEnvironment
        )
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a successful step did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub detail: String,
}

impl StepOutcome {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ProvisionStep: Send + Sync {
    fn kind(&self) -> StepKind;
    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome>;
}

/// The standard step sequence
pub fn default_steps() -> Vec<Box<dyn ProvisionStep>> {
    vec![
        Box::new(SelectBase),
        Box::new(EstablishWorkdir),
        Box::new(SetSearchPath),
        Box::new(PlaceManifest),
        Box::new(CreatePayloadDir),
        Box::new(PlacePayload),
        Box::new(ConfigureMirror),
        Box::new(InstallManifest),
        Box::new(ForceUpgrade),
        Box::new(RecordEnvironment),
    ]
}

fn unwritable(path: &Path, error: impl fmt::Display) -> ProvisionError {
    ProvisionError::Unwritable {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

fn create_dir(path: &Path) -> ProvisionResult<()> {
    std::fs::create_dir_all(path).map_err(|e| unwritable(path, e))
}

/// Copy a directory tree verbatim, keeping symlinks as symlinks
pub fn copy_tree(source: &Path, destination: &Path) -> ProvisionResult<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| ProvisionError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| unwritable(entry.path(), e))?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            create_dir(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            copy_symlink(&link, &target)?;
            copied += 1;
        } else {
            std::fs::copy(entry.path(), &target).map_err(|e| unwritable(&target, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> ProvisionResult<()> {
    std::os::unix::fs::symlink(link, target).map_err(|e| unwritable(target, e))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> ProvisionResult<()> {
    let resolved = target.parent().map_or_else(|| link.to_path_buf(), |p| p.join(link));
    std::fs::copy(&resolved, target)
        .map(|_| ())
        .map_err(|e| unwritable(target, e))
}

pub struct SelectBase;

#[async_trait]
impl ProvisionStep for SelectBase {
    fn kind(&self) -> StepKind {
        StepKind::SelectBase
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let base = ctx.config.base()?;

        if ctx.root.exists() {
            if !ctx.root.is_dir() {
                return Err(unwritable(&ctx.root, "not a directory"));
            }
            let mut entries = std::fs::read_dir(&ctx.root)?;
            if entries.next().is_some() {
                return Err(ProvisionError::DirtyEnvironment {
                    path: ctx.root.clone(),
                });
            }
        }
        create_dir(&ctx.root)?;

        info!("Base environment: {}", base);
        let detail = base.to_string();
        ctx.base = Some(base);
        Ok(StepOutcome::new(detail))
    }
}

pub struct EstablishWorkdir;

#[async_trait]
impl ProvisionStep for EstablishWorkdir {
    fn kind(&self) -> StepKind {
        StepKind::EstablishWorkdir
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        create_dir(&ctx.host_workdir())?;
        Ok(StepOutcome::new(ctx.config.workdir.display().to_string()))
    }
}

pub struct SetSearchPath;

#[async_trait]
impl ProvisionStep for SetSearchPath {
    fn kind(&self) -> StepKind {
        StepKind::SetSearchPath
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let key = ctx.config.search_path_var.clone();
        let value = ctx.config.workdir.display().to_string();
        ctx.env.insert(key.clone(), value.clone());
        Ok(StepOutcome::new(format!("{}={}", key, value)))
    }
}

pub struct PlaceManifest;

#[async_trait]
impl ProvisionStep for PlaceManifest {
    fn kind(&self) -> StepKind {
        StepKind::PlaceManifest
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let source = ctx.config.sources.manifest.clone();
        let manifest = DependencyManifest::from_file(&source)?;
        if manifest.packages().is_empty() {
            warn!("Manifest {} declares no requirements", source.display());
        }

        let target = ctx.host_path(&ctx.config.manifest_target());
        std::fs::copy(&source, &target).map_err(|e| unwritable(&target, e))?;

        let detail = format!(
            "{} entries -> {}",
            manifest.len(),
            ctx.config.manifest_target().display()
        );
        ctx.manifest = Some(manifest);
        Ok(StepOutcome::new(detail))
    }
}

pub struct CreatePayloadDir;

#[async_trait]
impl ProvisionStep for CreatePayloadDir {
    fn kind(&self) -> StepKind {
        StepKind::CreatePayloadDir
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let target = ctx.config.payload_target()?;
        create_dir(&ctx.host_path(&target))?;
        Ok(StepOutcome::new(target.display().to_string()))
    }
}

pub struct PlacePayload;

#[async_trait]
impl ProvisionStep for PlacePayload {
    fn kind(&self) -> StepKind {
        StepKind::PlacePayload
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let source = ctx.config.sources.payload.clone();
        if !source.is_dir() {
            return Err(ProvisionError::MissingSource {
                what: "application payload directory",
                path: source,
            });
        }

        let target = ctx.config.payload_target()?;
        let host_target = ctx.host_path(&target);
        if !host_target.is_dir() {
            return Err(unwritable(&host_target, "payload directory was not created"));
        }

        let copied = copy_tree(&source, &host_target)?;
        debug!("Copied {} payload files into {}", copied, host_target.display());
        Ok(StepOutcome::new(format!(
            "{} files -> {}",
            copied,
            target.display()
        )))
    }
}

pub struct ConfigureMirror;

#[async_trait]
impl ProvisionStep for ConfigureMirror {
    fn kind(&self) -> StepKind {
        StepKind::ConfigureMirror
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let mirror = ctx.config.mirror()?;
        if ctx.config.probe_mirror {
            mirror.probe().await?;
        }

        let config_path = PathBuf::from(MIRROR_CONFIG_PATH);
        let host_config = ctx.host_path(&config_path);
        if let Some(parent) = host_config.parent() {
            create_dir(parent)?;
        }
        std::fs::write(&host_config, mirror.render_config())
            .map_err(|e| unwritable(&host_config, e))?;

        ctx.env.insert(
            MIRROR_CONFIG_VAR.to_string(),
            config_path.display().to_string(),
        );
        info!("Installer index set to {}", mirror.url());
        let detail = mirror.url().to_string();
        ctx.mirror = Some(mirror);
        Ok(StepOutcome::new(detail))
    }
}

pub struct InstallManifest;

#[async_trait]
impl ProvisionStep for InstallManifest {
    fn kind(&self) -> StepKind {
        StepKind::InstallManifest
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let count = match (&ctx.manifest, &ctx.mirror) {
            (Some(manifest), Some(_)) => manifest.packages().len(),
            (None, _) => {
                return Err(ProvisionError::InvalidConfig(
                    "manifest must be placed before installing".to_string(),
                ))
            }
            (_, None) => {
                return Err(ProvisionError::InvalidConfig(
                    "mirror must be configured before installing".to_string(),
                ))
            }
        };

        let packages = ctx.host_packages();
        create_dir(&packages)?;
        let installer = Installer::new(&ctx.config.installer).with_target(&packages);
        let manifest_path = ctx.host_path(&ctx.config.manifest_target());
        let invocation =
            installer.install_manifest(&manifest_path, &ctx.host_workdir(), &ctx.installer_env());

        info!("Installing {} requirements: `{}`", count, invocation.display());
        let output = ctx.executor.run(&invocation).await?;
        if !output.is_success() {
            return Err(installer.classify_failure(&invocation, &output));
        }
        Ok(StepOutcome::new(format!(
            "{} requirements installed into {}",
            count,
            ctx.config.package_dir.display()
        )))
    }
}

pub struct ForceUpgrade;

#[async_trait]
impl ProvisionStep for ForceUpgrade {
    fn kind(&self) -> StepKind {
        StepKind::ForceUpgrade
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        if ctx.mirror.is_none() {
            return Err(ProvisionError::InvalidConfig(
                "mirror must be configured before installing".to_string(),
            ));
        }

        let packages = ctx.host_packages();
        let installer = Installer::new(&ctx.config.installer).with_target(&packages);
        let invocation = installer.force_upgrade(&ctx.host_workdir(), &ctx.installer_env());

        info!(
            "Upgrading {} to latest: `{}`",
            ctx.config.installer.force_upgrade,
            invocation.display()
        );
        let output = ctx.executor.run(&invocation).await?;
        if !output.is_success() {
            return Err(installer.classify_failure(&invocation, &output));
        }
        Ok(StepOutcome::new(format!(
            "{} upgraded",
            ctx.config.installer.force_upgrade
        )))
    }
}

pub struct RecordEnvironment;

#[async_trait]
impl ProvisionStep for RecordEnvironment {
    fn kind(&self) -> StepKind {
        StepKind::RecordEnvironment
    }

    async fn apply(&self, ctx: &mut ProvisionContext) -> ProvisionResult<StepOutcome> {
        let base_image = match &ctx.base {
            Some(base) => base.clone(),
            None => ctx.config.base()?,
        };
        let requirements = ctx
            .manifest
            .as_ref()
            .map(DependencyManifest::packages)
            .unwrap_or_default();

        let snapshot = EnvironmentSnapshot {
            base_image,
            workdir: ctx.config.workdir.clone(),
            search_path_var: ctx.config.search_path_var.clone(),
            env: ctx.env.clone(),
            manifest: ctx.config.manifest_target(),
            payload: ctx.config.payload_target()?,
            packages: ctx.config.package_dir.clone(),
            requirements,
            mirror_url: ctx.config.installer.mirror_url.clone(),
            force_upgrade: ctx.config.installer.force_upgrade.clone(),
        };
        let path = snapshot.save(&ctx.root)?;
        Ok(StepOutcome::new(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionConfig;
    use crate::executor::DryRunExecutor;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(root: &Path, sources: &Path) -> ProvisionContext {
        let config = ProvisionConfig::default()
            .with_manifest(sources.join("requirements.txt"))
            .with_payload(sources.join("api"));
        ProvisionContext::new(config, root, Arc::new(DryRunExecutor::new()))
    }

    #[test]
    fn test_step_order_matches_kinds() {
        let kinds: Vec<StepKind> = default_steps().iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, StepKind::ALL.to_vec());
    }

    #[test]
    fn test_precedes_install() {
        assert!(StepKind::PlaceManifest.precedes_install());
        assert!(StepKind::ConfigureMirror.precedes_install());
        assert!(!StepKind::InstallManifest.precedes_install());
        assert_eq!(StepKind::ForceUpgrade.to_string(), "force_upgrade");
    }

    #[tokio::test]
    async fn test_select_base_rejects_dirty_root() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("leftover"), "x").unwrap();
        let mut ctx = context(root.path(), root.path());

        let result = SelectBase.apply(&mut ctx).await;
        assert!(matches!(
            result,
            Err(ProvisionError::DirtyEnvironment { .. })
        ));
    }

    #[tokio::test]
    async fn test_select_base_creates_missing_root() {
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("env");
        let mut ctx = context(&root, parent.path());

        SelectBase.apply(&mut ctx).await.unwrap();
        assert!(root.is_dir());
        assert!(ctx.base.is_some());
    }

    #[tokio::test]
    async fn test_place_manifest_missing_source() {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let mut ctx = context(root.path(), sources.path());
        EstablishWorkdir.apply(&mut ctx).await.unwrap();

        let result = PlaceManifest.apply(&mut ctx).await;
        assert!(matches!(
            result,
            Err(ProvisionError::MissingSource {
                what: "dependency manifest",
                ..
            })
        ));
        assert!(ctx.manifest.is_none());
    }

    #[tokio::test]
    async fn test_install_requires_mirror() {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        std::fs::write(sources.path().join("requirements.txt"), "numpy==1.24.0\n").unwrap();
        let mut ctx = context(root.path(), sources.path());
        EstablishWorkdir.apply(&mut ctx).await.unwrap();
        PlaceManifest.apply(&mut ctx).await.unwrap();

        let result = InstallManifest.apply(&mut ctx).await;
        assert!(matches!(result, Err(ProvisionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_configure_mirror_writes_installer_config() {
        let root = TempDir::new().unwrap();
        let mut ctx = context(root.path(), root.path());

        ConfigureMirror.apply(&mut ctx).await.unwrap();

        let written = std::fs::read_to_string(root.path().join("etc/pip.conf")).unwrap();
        assert!(written.contains("index-url = https://pypi.tuna.tsinghua.edu.cn/simple"));
        assert_eq!(ctx.env[MIRROR_CONFIG_VAR], "/etc/pip.conf");
    }

    #[test]
    fn test_copy_tree_preserves_layout() {
        let source = TempDir::new().unwrap();
        let destination = TempDir::new().unwrap();
        std::fs::create_dir_all(source.path().join("routes/v1")).unwrap();
        std::fs::write(source.path().join("server.py"), "app = None\n").unwrap();
        std::fs::write(source.path().join("routes/v1/chat.py"), "# chat\n").unwrap();

        let copied = copy_tree(source.path(), destination.path()).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(
            std::fs::read_to_string(destination.path().join("routes/v1/chat.py")).unwrap(),
            "# chat\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_keeps_symlinks() {
        let source = TempDir::new().unwrap();
        let destination = TempDir::new().unwrap();
        std::fs::write(source.path().join("real.py"), "x = 1\n").unwrap();
        std::os::unix::fs::symlink("real.py", source.path().join("alias.py")).unwrap();

        copy_tree(source.path(), destination.path()).unwrap();
        let link = std::fs::read_link(destination.path().join("alias.py")).unwrap();
        assert_eq!(link, PathBuf::from("real.py"));
    }
}
