//! Sequential provisioning runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::ProvisionConfig;
use crate::context::ProvisionContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::executor::CommandExecutor;
use crate::steps::{default_steps, ProvisionStep, StepKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: StepKind,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub detail: String,
}

/// Record of one provisioning run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub run_id: Uuid,
    pub root: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
}

impl ProvisionReport {
    pub fn succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|record| record.status == StepStatus::Succeeded)
    }

    pub fn failed_step(&self) -> Option<StepKind> {
        self.steps
            .iter()
            .find(|record| record.status == StepStatus::Failed)
            .map(|record| record.step)
    }

    pub fn status_of(&self, step: StepKind) -> Option<StepStatus> {
        self.steps
            .iter()
            .find(|record| record.step == step)
            .map(|record| record.status)
    }

    pub fn to_json(&self) -> ProvisionResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs provisioning steps in order and stops at the first failure
pub struct Provisioner {
    steps: Vec<Box<dyn ProvisionStep>>,
    executor: Arc<dyn CommandExecutor>,
}

impl Provisioner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            steps: default_steps(),
            executor,
        }
    }

    /// Replace the step sequence
    pub fn with_steps(mut self, steps: Vec<Box<dyn ProvisionStep>>) -> Self {
        self.steps = steps;
        self
    }

    /// Steps that would run, in order
    pub fn plan(&self) -> Vec<StepKind> {
        self.steps.iter().map(|step| step.kind()).collect()
    }

    /// Provision `root` from `config`.
    ///
    /// Configuration is validated before any step runs. On failure the
    /// returned [`ProvisionError::StepAborted`] carries the report, with
    /// every step after the failing one marked skipped. Nothing already
    /// written to `root` is removed.
    pub async fn run(
        &self,
        config: ProvisionConfig,
        root: impl Into<PathBuf>,
    ) -> ProvisionResult<ProvisionReport> {
        config.validate()?;

        let root = root.into();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("Provisioning run {} into {}", run_id, root.display());

        let mut ctx = ProvisionContext::new(config, root.clone(), Arc::clone(&self.executor));
        let mut records = Vec::with_capacity(self.steps.len());
        let mut failure = None;

        for step in &self.steps {
            let kind = step.kind();
            if failure.is_some() {
                records.push(StepRecord {
                    step: kind,
                    status: StepStatus::Skipped,
                    duration_ms: 0,
                    detail: String::new(),
                });
                continue;
            }

            info!("[{}] {}", kind, kind.description());
            let start = Instant::now();
            let result = step.apply(&mut ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => records.push(StepRecord {
                    step: kind,
                    status: StepStatus::Succeeded,
                    duration_ms,
                    detail: outcome.detail,
                }),
                Err(e) => {
                    error!("[{}] failed: {}", kind, e);
                    records.push(StepRecord {
                        step: kind,
                        status: StepStatus::Failed,
                        duration_ms,
                        detail: e.to_string(),
                    });
                    failure = Some((kind, e));
                }
            }
        }

        let report = ProvisionReport {
            run_id,
            root,
            started_at,
            finished_at: Utc::now(),
            steps: records,
        };

        match failure {
            Some((step, source)) => Err(ProvisionError::StepAborted {
                step,
                source: Box::new(source),
                report: Box::new(report),
            }),
            None => {
                info!("Provisioning run {} complete", run_id);
                Ok(report)
            }
        }
    }
}
