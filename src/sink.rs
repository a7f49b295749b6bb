//! Durable storage of iteration results and run summaries.
//!
//! Every artifact is camelCase JSON. The file sink writes one file per
//! iteration, overwrites `latest-summary.json` after each iteration and
//! writes one run summary when the loop finishes.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    conversation::RoleLabels,
    record::{IterationSummary, OptimizationRun, StopReason},
};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("sink rejected write: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub simulation_id: usize,
    pub start_index: usize,
    pub duration_ms: u64,
    pub terminal_state: String,
    pub overall_passed: bool,
    pub role_passed: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLine {
    pub role: String,
    /// Scenario label id of the speaker, e.g. `sales_agent`.
    pub agent: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationArtifact {
    pub simulation_id: usize,
    pub start_index: usize,
    pub conversation: Vec<ConversationLine>,
    pub evaluation: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationArtifact {
    pub scenario: String,
    pub iteration: usize,
    pub total_simulations: usize,
    pub passed_simulations: usize,
    pub pass_rate: f64,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_error: Option<String>,
    #[serde(default)]
    pub excluded_failures: usize,
    pub results: Vec<ResultRow>,
    pub conversations: Vec<ConversationArtifact>,
}

impl IterationArtifact {
    pub fn from_summary(
        scenario: &str,
        summary: &IterationSummary,
        labels: &RoleLabels,
    ) -> Result<Self, SinkError> {
        let mut results = Vec::with_capacity(summary.records.len());
        let mut conversations = Vec::with_capacity(summary.records.len());

        for record in &summary.records {
            results.push(ResultRow {
                simulation_id: record.simulation_id,
                start_index: record.start_index,
                duration_ms: record.duration_ms,
                terminal_state: serde_json::to_value(record.terminal_state)?
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                overall_passed: record.passed(),
                role_passed: serde_json::to_value(record.evaluation.role_passed())?,
                error: record.error.clone(),
            });
            conversations.push(ConversationArtifact {
                simulation_id: record.simulation_id,
                start_index: record.start_index,
                conversation: record
                    .transcript
                    .iter()
                    .map(|step| ConversationLine {
                        role: step.role.to_string(),
                        agent: labels.get(step.role).id.clone(),
                        message: step.text.clone(),
                    })
                    .collect(),
                evaluation: serde_json::to_value(&record.evaluation)?,
            });
        }

        Ok(Self {
            scenario: scenario.to_string(),
            iteration: summary.iteration,
            total_simulations: summary.total_simulations(),
            passed_simulations: summary.passed_simulations(),
            pass_rate: summary.pass_rate(),
            prompt: summary.prompt.clone(),
            optimized_prompt: summary.optimized_prompt.clone(),
            optimizer_error: summary.optimizer_error.clone(),
            excluded_failures: summary.excluded_failures,
            results,
            conversations,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestSummary {
    pub total_simulations: usize,
    pub passed_simulations: usize,
    pub pass_rate: f64,
    pub timestamp: DateTime<Utc>,
    /// Seconds spent on the iteration.
    pub duration: f64,
}

impl LatestSummary {
    pub fn new(summary: &IterationSummary, elapsed: Duration) -> Self {
        Self {
            total_simulations: summary.total_simulations(),
            passed_simulations: summary.passed_simulations(),
            pass_rate: summary.pass_rate(),
            timestamp: Utc::now(),
            duration: elapsed.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRate {
    pub iteration: usize,
    pub pass_rate: f64,
    pub total_simulations: usize,
    pub passed_simulations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub iterations: Vec<IterationRate>,
    pub first_pass_rate: Option<f64>,
    pub last_pass_rate: Option<f64>,
    pub improvement: f64,
    pub final_prompt: String,
    pub stop_reason: Option<StopReason>,
}

impl RunSummary {
    pub fn from_run(run: &OptimizationRun) -> Self {
        Self {
            scenario: run.scenario_id.clone(),
            started_at: run.started_at,
            iterations: run
                .iterations
                .iter()
                .map(|summary| IterationRate {
                    iteration: summary.iteration,
                    pass_rate: summary.pass_rate(),
                    total_simulations: summary.total_simulations(),
                    passed_simulations: summary.passed_simulations(),
                })
                .collect(),
            first_pass_rate: run.first_pass_rate(),
            last_pass_rate: run.last_pass_rate(),
            improvement: run.improvement(),
            final_prompt: run.final_prompt.clone(),
            stop_reason: run.stop_reason,
        }
    }
}

/// Append-only destination for loop results.
pub trait ResultsSink: Send + Sync {
    fn write_iteration(&self, artifact: &IterationArtifact) -> Result<(), SinkError>;

    fn write_latest_summary(&self, summary: &LatestSummary) -> Result<(), SinkError>;

    fn write_run_summary(&self, summary: &RunSummary) -> Result<(), SinkError>;
}

/// Writes pretty-printed JSON files into one directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn write_json<T: Serialize>(
        &self,
        file_name: &str,
        value: &T,
    ) -> Result<PathBuf, SinkError> {
        fs::create_dir_all(&self.dir).map_err(|source| SinkError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(file_name);
        let body = serde_json::to_vec_pretty(value)?;
        fs::write(&path, body).map_err(|source| SinkError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "wrote artifact");
        Ok(path)
    }
}

/// Filesystem-safe UTC timestamp used in artifact names.
pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S%.3fZ").to_string()
}

impl ResultsSink for JsonFileSink {
    fn write_iteration(&self, artifact: &IterationArtifact) -> Result<(), SinkError> {
        let name = format!(
            "iteration-{}-{}.json",
            artifact.iteration,
            file_timestamp(Utc::now())
        );
        self.write_json(&name, artifact).map(|_| ())
    }

    fn write_latest_summary(&self, summary: &LatestSummary) -> Result<(), SinkError> {
        self.write_json("latest-summary.json", summary).map(|_| ())
    }

    fn write_run_summary(&self, summary: &RunSummary) -> Result<(), SinkError> {
        let name = format!("run-summary-{}.json", file_timestamp(Utc::now()));
        self.write_json(&name, summary).map(|_| ())
    }
}

/// Keeps artifacts in memory. `failing()` rejects every write.
#[derive(Debug, Default)]
pub struct MemorySink {
    iterations: Mutex<Vec<IterationArtifact>>,
    latest: Mutex<Option<LatestSummary>>,
    runs: Mutex<Vec<RunSummary>>,
    fail: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn iterations(&self) -> Vec<IterationArtifact> {
        self.iterations.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    pub fn latest(&self) -> Option<LatestSummary> {
        self.latest.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn runs(&self) -> Vec<RunSummary> {
        self.runs.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Rejected("memory sink configured to fail".to_string()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> SinkError {
    SinkError::Rejected("memory sink lock poisoned".to_string())
}

impl ResultsSink for MemorySink {
    fn write_iteration(&self, artifact: &IterationArtifact) -> Result<(), SinkError> {
        self.check()?;
        self.iterations.lock().map_err(poisoned)?.push(artifact.clone());
        Ok(())
    }

    fn write_latest_summary(&self, summary: &LatestSummary) -> Result<(), SinkError> {
        self.check()?;
        *self.latest.lock().map_err(poisoned)? = Some(summary.clone());
        Ok(())
    }

    fn write_run_summary(&self, summary: &RunSummary) -> Result<(), SinkError> {
        self.check()?;
        self.runs.lock().map_err(poisoned)?.push(summary.clone());
        Ok(())
    }
}
