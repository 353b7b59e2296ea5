use clap::{Parser, Subcommand};
use harness::container::{
    build_environment_image, detect_runtime, rebuild_environment_image, ContainerBuildConfig,
    ContainerError, ContainerRuntime,
};
use image_builder::{
    containerfile, map_to_host, CommandExecutor, DependencyManifest, DryRunExecutor,
    EnvironmentSnapshot, ProvisionConfig, ProvisionError, ProvisionReport, Provisioner,
    StepStatus, SystemExecutor, Verifier,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Parser)]
#[command(name = "provision")]
#[command(about = "Provision a reproducible environment from a declarative description")]
struct Cli {
    /// Environment description
    #[arg(short, long, global = true, default_value = "provision.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision an environment into a directory
    Provision {
        /// Environment root; must be absent or empty
        #[arg(short, long)]
        root: PathBuf,
        /// Log installer invocations without running them
        #[arg(long)]
        dry_run: bool,
        /// Check the mirror answers before installing
        #[arg(long)]
        probe_mirror: bool,
        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the Containerfile for the environment
    Render {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Build an environment image with podman or docker
    Build {
        /// Tag of the resulting image
        #[arg(short, long)]
        tag: String,
        /// Container runtime (podman or docker); detected when omitted
        #[arg(long)]
        runtime: Option<String>,
        /// Remove an existing image with the same tag first
        #[arg(long)]
        replace: bool,
    },
    /// Check installed versions in a provisioned environment
    Verify {
        #[arg(short, long)]
        root: PathBuf,
    },
    /// List the provisioning steps
    Plan,
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("Unknown container runtime '{0}' (expected podman, docker or a path)")]
    UnknownRuntime(String),
    #[error("Verification failed")]
    VerificationFailed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Provision(e) => e.exit_code(),
            CliError::Container(e) => e.exit_code(),
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("✗ {}", e);
        if let CliError::Provision(ProvisionError::StepAborted { report, .. }) = &e {
            print_report(report);
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Provision {
            root,
            dry_run,
            probe_mirror,
            report,
        } => {
            let config = load_config(&cli.config)?;
            let config = if probe_mirror {
                config.with_probe_mirror(true)
            } else {
                config
            };
            provision(config, &root, dry_run, report.as_deref()).await?;
        }
        Commands::Render { output } => {
            let config = load_config(&cli.config)?;
            let rendered = containerfile::render(&config, &context_dir(&cli.config))?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)?;
                    println!("Wrote {}", path.display());
                }
                None => print!("{}", rendered),
            }
        }
        Commands::Build {
            tag,
            runtime,
            replace,
        } => {
            let runtime = match runtime {
                Some(name) => {
                    ContainerRuntime::from_name(&name).ok_or(CliError::UnknownRuntime(name))?
                }
                None => detect_runtime(),
            };
            let config = load_config(&cli.config)?;
            let build = ContainerBuildConfig::new(config, context_dir(&cli.config), tag);
            if replace {
                rebuild_environment_image(&runtime, &build)?;
            } else {
                build_environment_image(&runtime, &build)?;
            }
        }
        Commands::Verify { root } => {
            let config = load_config(&cli.config)?;
            verify(config, &root).await?;
        }
        Commands::Plan => {
            let provisioner = Provisioner::new(Arc::new(DryRunExecutor::new()));
            for (index, step) in provisioner.plan().iter().enumerate() {
                println!("{:>2}. {:<20} {}", index + 1, step, step.description());
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<ProvisionConfig, CliError> {
    let config =
        ProvisionConfig::from_file(path)?.with_overrides(provision_overrides(std::env::vars_os()));
    config.validate()?;
    info!("Loaded environment description from {}", path.display());
    Ok(config)
}

/// `PROVISION_*` variables, skipping any that are not valid UTF-8
fn provision_overrides(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> Vec<(String, String)> {
    vars.into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .filter(|(key, _)| key.starts_with("PROVISION_"))
        .collect()
}

/// Build context: the directory holding the config file
fn context_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn provision(
    config: ProvisionConfig,
    root: &Path,
    dry_run: bool,
    report_path: Option<&Path>,
) -> Result<(), CliError> {
    let executor: Arc<dyn CommandExecutor> = if dry_run {
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(SystemExecutor::new())
    };

    let result = Provisioner::new(executor).run(config, root).await;

    if let Some(path) = report_path {
        let report = match &result {
            Ok(report) => Some(report),
            Err(ProvisionError::StepAborted { report, .. }) => Some(&**report),
            Err(_) => None,
        };
        if let Some(report) = report {
            std::fs::write(path, report.to_json()?)?;
        }
    }

    let report = result?;
    print_report(&report);
    println!("✅ Environment provisioned at {}", root.display());
    Ok(())
}

fn print_report(report: &ProvisionReport) {
    println!("Run {}", report.run_id);
    for record in &report.steps {
        let marker = match record.status {
            StepStatus::Succeeded => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Skipped => "-",
        };
        println!(
            "  {} {:<20} {:>6}ms  {}",
            marker, record.step, record.duration_ms, record.detail
        );
    }
}

async fn verify(config: ProvisionConfig, root: &Path) -> Result<(), CliError> {
    let snapshot = EnvironmentSnapshot::load(root)?;
    let manifest = DependencyManifest::from_file(&map_to_host(root, &snapshot.manifest))?;

    let verifier = Verifier::for_snapshot(
        root,
        &snapshot,
        config.installer,
        Arc::new(SystemExecutor::new()),
    )?;
    let report = verifier.verify(&manifest).await?;

    for check in &report.pins {
        let marker = if check.matches() { "✓" } else { "✗" };
        println!(
            "  {} {}=={} (installed: {})",
            marker,
            check.package,
            check.expected,
            check.installed.as_deref().unwrap_or("missing")
        );
    }
    let forced = &report.forced_upgrade;
    println!(
        "  {} {} installed {} (latest: {})",
        if forced.is_latest() { "✓" } else { "✗" },
        forced.package,
        forced.installed.as_deref().unwrap_or("missing"),
        forced.latest.as_deref().unwrap_or("unknown")
    );

    if report.is_ok() {
        println!("✅ Environment matches its manifest");
        Ok(())
    } else {
        Err(CliError::VerificationFailed)
    }
}
