//! External command execution.
//!
//! Installer calls go through [`CommandExecutor`] so the runner never
//! touches process state directly. Environment variables are passed per
//! invocation rather than set on the current process.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProvisionError, ProvisionResult};

/// A single external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Command line as a human-readable string
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of an invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout and stderr joined, trimmed
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.trim_end().to_string();
        if !self.stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(self.stderr.trim_end());
        }
        combined
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> ProvisionResult<CommandOutput>;
}

/// Runs invocations as real child processes
#[derive(Debug, Default, Clone)]
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn run(&self, invocation: &Invocation) -> ProvisionResult<CommandOutput> {
        let program =
            which::which(&invocation.program).map_err(|e| ProvisionError::CommandSpawn {
                program: invocation.program.clone(),
                reason: e.to_string(),
            })?;

        debug!("Running `{}`", invocation.display());
        let mut command = Command::new(program);
        command.args(&invocation.args).envs(&invocation.env);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        let output = command
            .output()
            .await
            .map_err(|e| ProvisionError::CommandSpawn {
                program: invocation.program.clone(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Records invocations and reports success without running anything
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    invocations: Mutex<Vec<Invocation>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommandExecutor for DryRunExecutor {
    async fn run(&self, invocation: &Invocation) -> ProvisionResult<CommandOutput> {
        debug!("Dry run: `{}`", invocation.display());
        if let Ok(mut guard) = self.invocations.lock() {
            guard.push(invocation.clone());
        }
        Ok(CommandOutput::success(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder() {
        let mut env = BTreeMap::new();
        env.insert("PYTHONPATH".to_string(), "/workspace".to_string());

        let invocation = Invocation::new("pip")
            .args(["install", "--no-cache-dir"])
            .arg("-r")
            .arg("requirements.txt")
            .current_dir("/workspace")
            .envs(&env);

        assert_eq!(
            invocation.display(),
            "pip install --no-cache-dir -r requirements.txt"
        );
        assert_eq!(invocation.cwd, Some(PathBuf::from("/workspace")));
        assert_eq!(invocation.env.get("PYTHONPATH").unwrap(), "/workspace");
    }

    #[test]
    fn test_combined_output() {
        let output = CommandOutput {
            exit_code: Some(1),
            stdout: "Collecting numpy\n".to_string(),
            stderr: "ERROR: boom\n".to_string(),
        };
        assert_eq!(output.combined(), "Collecting numpy\nERROR: boom");
        assert!(!output.is_success());
        assert_eq!(CommandOutput::failure(3, "x").combined(), "x");
    }

    #[tokio::test]
    async fn test_dry_run_records() {
        let executor = DryRunExecutor::new();
        let output = executor
            .run(&Invocation::new("pip").arg("--version"))
            .await
            .unwrap();
        assert!(output.is_success());
        assert_eq!(executor.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_system_executor_missing_program() {
        let executor = SystemExecutor::new();
        let result = executor
            .run(&Invocation::new("definitely-not-an-installer-xyz"))
            .await;
        assert!(matches!(result, Err(ProvisionError::CommandSpawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_executor_passes_env_and_exit_code() {
        let executor = SystemExecutor::new();
        let mut env = BTreeMap::new();
        env.insert("PROVISION_PROBE".to_string(), "hello".to_string());

        let output = executor
            .run(
                &Invocation::new("sh")
                    .args(["-c", "echo $PROVISION_PROBE; exit 3"])
                    .envs(&env),
            )
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
    }
}
