use async_trait::async_trait;
use image_builder::{
    CommandExecutor, CommandOutput, EnvironmentSnapshot, Invocation, ProvisionConfig,
    ProvisionError, ProvisionResult, Provisioner, StepKind, StepStatus,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Records every invocation and fails those whose command line contains `fail_on`
#[derive(Default)]
struct RecordingExecutor {
    invocations: Mutex<Vec<Invocation>>,
    fail_on: Option<(&'static str, CommandOutput)>,
}

impl RecordingExecutor {
    fn failing_on(pattern: &'static str, output: CommandOutput) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            fail_on: Some((pattern, output)),
        }
    }

    fn command_lines(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(Invocation::display)
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, invocation: &Invocation) -> ProvisionResult<CommandOutput> {
        self.invocations.lock().unwrap().push(invocation.clone());
        match &self.fail_on {
            Some((pattern, output)) if invocation.display().contains(pattern) => {
                Ok(output.clone())
            }
            _ => Ok(CommandOutput::success("Successfully installed\n")),
        }
    }
}

struct Fixture {
    sources: TempDir,
    roots: TempDir,
    config: ProvisionConfig,
}

impl Fixture {
    fn new() -> Self {
        let sources = TempDir::new().unwrap();
        std::fs::write(
            sources.path().join("requirements.txt"),
            "numpy==1.24.0\nfastapi>=0.100\n",
        )
        .unwrap();
        let api = sources.path().join("api");
        std::fs::create_dir_all(api.join("routes")).unwrap();
        std::fs::write(api.join("__init__.py"), "").unwrap();
        std::fs::write(api.join("server.py"), "from api.routes import chat\n").unwrap();
        std::fs::write(api.join("routes/chat.py"), "def chat(): ...\n").unwrap();

        let config = ProvisionConfig::default()
            .with_base_image("python:3.10-slim")
            .with_mirror_url("https://mirror.example/simple")
            .resolve_sources(sources.path());

        Self {
            sources,
            roots: TempDir::new().unwrap(),
            config,
        }
    }

    fn root(&self, name: &str) -> PathBuf {
        self.roots.path().join(name)
    }

    fn sources(&self) -> &Path {
        self.sources.path()
    }
}

fn relative_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .display()
                .to_string()
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_valid_inputs_produce_complete_environment() {
    let fixture = Fixture::new();
    let executor = Arc::new(RecordingExecutor::default());
    let provisioner = Provisioner::new(executor.clone());
    let root = fixture.root("env");

    let report = provisioner
        .run(fixture.config.clone(), &root)
        .await
        .unwrap();

    assert!(report.succeeded());
    assert_eq!(
        report.steps.iter().map(|r| r.step).collect::<Vec<_>>(),
        StepKind::ALL.to_vec()
    );

    // Manifest and payload at their fixed paths.
    assert_eq!(
        std::fs::read_to_string(root.join("workspace/requirements.txt")).unwrap(),
        "numpy==1.24.0\nfastapi>=0.100\n"
    );
    assert!(root.join("workspace/api/server.py").is_file());
    assert!(root.join("workspace/api/routes/chat.py").is_file());

    // Namespace root recorded for later processes.
    let snapshot = EnvironmentSnapshot::load(&root).unwrap();
    assert_eq!(snapshot.namespace_root(), Some("/workspace"));
    assert_eq!(snapshot.base_image.to_string(), "python:3.10-slim");
    assert_eq!(snapshot.requirements, vec!["numpy==1.24.0", "fastapi>=0.100"]);
    assert_eq!(snapshot.env["PIP_CONFIG_FILE"], "/etc/pip.conf");

    // Mirror configured, then bulk install, then the forced upgrade.
    assert!(std::fs::read_to_string(root.join("etc/pip.conf"))
        .unwrap()
        .contains("index-url = https://mirror.example/simple"));
    let manifest_on_host = root.join("workspace/requirements.txt");
    let packages_on_host = root.join("opt/site-packages");
    assert_eq!(
        executor.command_lines(),
        vec![
            format!(
                "pip install --no-cache-dir --target {} -r {}",
                packages_on_host.display(),
                manifest_on_host.display()
            ),
            format!(
                "pip install --no-cache-dir --target {} --upgrade transformers",
                packages_on_host.display()
            ),
        ]
    );
    assert!(packages_on_host.is_dir());
    assert_eq!(snapshot.packages, PathBuf::from("/opt/site-packages"));

    let invocations = executor.invocations.lock().unwrap();
    let bulk = &invocations[0];
    assert_eq!(bulk.cwd.as_deref(), Some(root.join("workspace").as_path()));
    assert_eq!(
        bulk.env["PYTHONPATH"],
        root.join("workspace").display().to_string()
    );
    assert_eq!(
        bulk.env["PIP_CONFIG_FILE"],
        root.join("etc/pip.conf").display().to_string()
    );
}

#[tokio::test]
async fn test_installs_stay_inside_environment_root() {
    let fixture = Fixture::new();
    let executor = Arc::new(RecordingExecutor::default());
    let root = fixture.root("env");

    Provisioner::new(executor.clone())
        .run(fixture.config.clone(), &root)
        .await
        .unwrap();

    let invocations = executor.invocations.lock().unwrap();
    assert_eq!(invocations.len(), 2);
    for invocation in invocations.iter() {
        let target = invocation
            .args
            .iter()
            .position(|arg| arg == "--target")
            .map(|i| PathBuf::from(&invocation.args[i + 1]))
            .unwrap_or_else(|| panic!("`{}` installs outside the root", invocation.display()));
        assert!(target.starts_with(&root), "{} is outside {}", target.display(), root.display());
    }
}

#[tokio::test]
async fn test_checked_mirror_that_never_answers_aborts_before_install() {
    let fixture = Fixture::new();
    let executor = Arc::new(RecordingExecutor::default());
    // Nothing listens on the discard port.
    let config = fixture
        .config
        .clone()
        .with_mirror_url("http://127.0.0.1:9/simple")
        .with_probe_mirror(true);

    let error = Provisioner::new(executor.clone())
        .run(config, fixture.root("env"))
        .await
        .unwrap_err();

    assert!(executor.command_lines().is_empty());
    assert!(error.is_pre_install());
    match error {
        ProvisionError::StepAborted {
            step,
            source,
            report,
        } => {
            assert_eq!(step, StepKind::ConfigureMirror);
            assert!(matches!(*source, ProvisionError::MirrorUnreachable { .. }));
            assert_eq!(
                report.status_of(StepKind::InstallManifest),
                Some(StepStatus::Skipped)
            );
        }
        other => panic!("expected StepAborted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_manifest_fails_before_any_install() {
    let fixture = Fixture::new();
    std::fs::remove_file(fixture.sources().join("requirements.txt")).unwrap();
    let executor = Arc::new(RecordingExecutor::default());

    let error = Provisioner::new(executor.clone())
        .run(fixture.config.clone(), fixture.root("env"))
        .await
        .unwrap_err();

    assert!(executor.command_lines().is_empty());
    assert!(error.is_pre_install());
    assert_eq!(error.exit_code(), 1);
    match error {
        ProvisionError::StepAborted {
            step,
            source,
            report,
        } => {
            assert_eq!(step, StepKind::PlaceManifest);
            assert!(matches!(*source, ProvisionError::MissingSource { .. }));
            assert_eq!(
                report.status_of(StepKind::InstallManifest),
                Some(StepStatus::Skipped)
            );
        }
        other => panic!("expected StepAborted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_payload_fails_fast() {
    let fixture = Fixture::new();
    std::fs::remove_dir_all(fixture.sources().join("api")).unwrap();
    let executor = Arc::new(RecordingExecutor::default());

    let error = Provisioner::new(executor.clone())
        .run(fixture.config.clone(), fixture.root("env"))
        .await
        .unwrap_err();

    assert!(executor.command_lines().is_empty());
    assert!(matches!(
        error,
        ProvisionError::StepAborted {
            step: StepKind::PlacePayload,
            ..
        }
    ));
}

#[tokio::test]
async fn test_unreachable_mirror_skips_forced_upgrade() {
    let fixture = Fixture::new();
    let executor = Arc::new(RecordingExecutor::failing_on(
        " -r ",
        CommandOutput::failure(
            1,
            "WARNING: Retrying after connection broken by 'NewConnectionError': Failed to establish a new connection\nERROR: Could not find a version that satisfies the requirement numpy==1.24.0\nERROR: No matching distribution found for numpy==1.24.0",
        ),
    ));

    let error = Provisioner::new(executor.clone())
        .run(fixture.config.clone(), fixture.root("env"))
        .await
        .unwrap_err();

    assert_eq!(executor.command_lines().len(), 1);
    assert_eq!(error.exit_code(), 1);
    match error {
        ProvisionError::StepAborted {
            step,
            source,
            report,
        } => {
            assert_eq!(step, StepKind::InstallManifest);
            assert!(matches!(*source, ProvisionError::MirrorUnreachable { .. }));
            assert_eq!(
                report.status_of(StepKind::ForceUpgrade),
                Some(StepStatus::Skipped)
            );
        }
        other => panic!("expected StepAborted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_forced_upgrade_fails_provisioning() {
    let fixture = Fixture::new();
    let executor = Arc::new(RecordingExecutor::failing_on(
        "--upgrade",
        CommandOutput::failure(3, "ERROR: could not write to site-packages"),
    ));
    let root = fixture.root("env");

    let error = Provisioner::new(executor.clone())
        .run(fixture.config.clone(), &root)
        .await
        .unwrap_err();

    assert_eq!(executor.command_lines().len(), 2);
    assert_eq!(error.exit_code(), 3);
    assert!(!error.is_pre_install());
    match error {
        ProvisionError::StepAborted { step, report, .. } => {
            assert_eq!(step, StepKind::ForceUpgrade);
            assert_eq!(
                report.status_of(StepKind::InstallManifest),
                Some(StepStatus::Succeeded)
            );
            assert_eq!(
                report.status_of(StepKind::RecordEnvironment),
                Some(StepStatus::Skipped)
            );
        }
        other => panic!("expected StepAborted, got {:?}", other),
    }
    // No rollback, and no snapshot for a failed run.
    assert!(root.join("workspace/api/server.py").is_file());
    assert!(!EnvironmentSnapshot::path(&root).exists());
}

#[tokio::test]
async fn test_rerun_from_clean_base_is_identical() {
    let fixture = Fixture::new();
    let first = fixture.root("first");
    let second = fixture.root("second");

    Provisioner::new(Arc::new(RecordingExecutor::default()))
        .run(fixture.config.clone(), &first)
        .await
        .unwrap();
    Provisioner::new(Arc::new(RecordingExecutor::default()))
        .run(fixture.config.clone(), &second)
        .await
        .unwrap();

    assert_eq!(relative_files(&first), relative_files(&second));
    assert_eq!(
        std::fs::read(EnvironmentSnapshot::path(&first)).unwrap(),
        std::fs::read(EnvironmentSnapshot::path(&second)).unwrap()
    );
}

#[tokio::test]
async fn test_rerun_into_used_root_is_rejected() {
    let fixture = Fixture::new();
    let root = fixture.root("env");
    let provisioner = Provisioner::new(Arc::new(RecordingExecutor::default()));

    provisioner.run(fixture.config.clone(), &root).await.unwrap();
    let error = provisioner
        .run(fixture.config.clone(), &root)
        .await
        .unwrap_err();

    match error {
        ProvisionError::StepAborted { step, source, .. } => {
            assert_eq!(step, StepKind::SelectBase);
            assert!(matches!(*source, ProvisionError::DirtyEnvironment { .. }));
        }
        other => panic!("expected StepAborted, got {:?}", other),
    }
}
