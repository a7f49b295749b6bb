//! Measures how often the judge agrees with hand-labeled transcripts.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    conversation::{ConversationScript, Role, RoleLabels, ScriptEntry, Transcript},
    judge::{EvaluationResult, Judge, Rubric},
    models::StructuredModel,
    optimizer::{self, OptimizeError},
    prompts,
    record::percent,
    scenario::ScenarioError,
    sink::{file_timestamp, JsonFileSink, SinkError},
};

/// The verdicts a human assigned to one transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedEvaluation {
    #[serde(alias = "salesAgentPassed", alias = "supportAgentPassed")]
    pub agent_passed: bool,
    #[serde(alias = "customerAgentPassed")]
    pub customer_passed: bool,
    pub overall_passed: bool,
    #[serde(default, alias = "salesAgentFeedback", alias = "supportAgentFeedback")]
    pub agent_feedback: Option<String>,
    #[serde(default, alias = "customerAgentFeedback")]
    pub customer_feedback: Option<String>,
}

impl ExpectedEvaluation {
    pub fn passed(&self, role: Role) -> bool {
        match role {
            Role::Agent => self.agent_passed,
            Role::Customer => self.customer_passed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabeledTranscript {
    pub simulation_number: usize,
    #[serde(default)]
    pub start_index: usize,
    #[serde(default)]
    pub duration: f64,
    pub conversation: Vec<ScriptEntry>,
    pub evaluation: ExpectedEvaluation,
}

/// Reads a JSON array of labeled transcripts.
pub fn load_labeled(path: impl AsRef<Path>) -> Result<Vec<LabeledTranscript>, ScenarioError> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|error| ScenarioError::Parse {
        path: path.to_path_buf(),
        message: error.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdicts {
    pub agent_passed: Option<bool>,
    pub customer_passed: Option<bool>,
    pub overall_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_feedback: Option<String>,
}

impl Verdicts {
    fn from_expected(expected: &ExpectedEvaluation) -> Self {
        Self {
            agent_passed: Some(expected.agent_passed),
            customer_passed: Some(expected.customer_passed),
            overall_passed: expected.overall_passed,
            agent_feedback: None,
            customer_feedback: None,
        }
    }

    fn from_result(result: &EvaluationResult) -> Self {
        Self {
            agent_passed: result.passed(Role::Agent),
            customer_passed: result.passed(Role::Customer),
            overall_passed: result.overall_passed(),
            agent_feedback: result.feedback(Role::Agent).map(str::to_string),
            customer_feedback: result.feedback(Role::Customer).map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationCase {
    pub transcript_number: usize,
    pub accurate: bool,
    pub agent_match: bool,
    pub customer_match: bool,
    pub overall_match: bool,
    pub expected: Verdicts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<Verdicts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationSummary {
    pub total_evaluations: usize,
    pub accurate_evaluations: usize,
    /// Two-decimal percentage, e.g. `"66.67%"`.
    pub accuracy_rate: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub summary: CalibrationSummary,
    pub evaluations: Vec<CalibrationCase>,
}

impl CalibrationReport {
    pub fn accuracy(&self) -> f64 {
        if self.evaluations.is_empty() {
            return 0.0;
        }
        self.summary.accurate_evaluations as f64 / self.evaluations.len() as f64
    }

    /// Writes `grader-evaluation-results-<ts>.json` and overwrites
    /// `latest-grader-summary.json`. Returns the detailed file's path.
    pub fn write_to(&self, dir: impl Into<PathBuf>) -> Result<PathBuf, SinkError> {
        let sink = JsonFileSink::new(dir);
        let detailed = sink.write_json(
            &format!(
                "grader-evaluation-results-{}.json",
                file_timestamp(self.summary.timestamp)
            ),
            self,
        )?;
        sink.write_json("latest-grader-summary.json", &self.summary)?;
        Ok(detailed)
    }
}

/// Replays labeled transcripts through a judge and compares verdicts.
pub struct Calibrator {
    judge: Judge,
    rubric: Rubric,
    concurrency: usize,
}

impl Calibrator {
    pub fn new(judge: Judge, rubric: Rubric) -> Self {
        Self {
            judge,
            rubric,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn labels(&self) -> &RoleLabels {
        self.judge.labels()
    }

    pub async fn run(&self, transcripts: &[LabeledTranscript]) -> CalibrationReport {
        let started = Instant::now();

        let evaluations: Vec<CalibrationCase> =
            stream::iter(transcripts.iter().map(|labeled| self.evaluate_one(labeled)))
                .buffered(self.concurrency)
                .collect()
                .await;

        let accurate = evaluations.iter().filter(|case| case.accurate).count();
        let rate = if evaluations.is_empty() {
            0.0
        } else {
            accurate as f64 / evaluations.len() as f64
        };

        CalibrationReport {
            summary: CalibrationSummary {
                total_evaluations: evaluations.len(),
                accurate_evaluations: accurate,
                accuracy_rate: percent(rate),
                timestamp: Utc::now(),
                duration: started.elapsed().as_secs_f64(),
            },
            evaluations,
        }
    }

    async fn evaluate_one(&self, labeled: &LabeledTranscript) -> CalibrationCase {
        let expected = Verdicts::from_expected(&labeled.evaluation);
        let failed = |error: String| CalibrationCase {
            transcript_number: labeled.simulation_number,
            accurate: false,
            agent_match: false,
            customer_match: false,
            overall_match: false,
            expected: expected.clone(),
            actual: None,
            error: Some(error),
        };

        let script = match ConversationScript::from_entries(&labeled.conversation, self.labels()) {
            Ok(script) => script,
            Err(error) => return failed(error.to_string()),
        };
        let transcript = Transcript::from_steps(script.steps().to_vec());

        let result = match self.judge.evaluate(&transcript, &self.rubric).await {
            Ok(result) => result,
            Err(error) => {
                tracing::warn!(transcript = labeled.simulation_number, %error, "judge failed");
                return failed(error.to_string());
            }
        };

        // Roles the rubric does not grade count as matching.
        let role_match = |role: Role| {
            result
                .passed(role)
                .map_or(true, |actual| actual == labeled.evaluation.passed(role))
        };
        let agent_match = role_match(Role::Agent);
        let customer_match = role_match(Role::Customer);
        let overall_match = result.overall_passed() == labeled.evaluation.overall_passed;
        let accurate = agent_match && customer_match && overall_match;

        tracing::info!(
            transcript = labeled.simulation_number,
            agent_match,
            customer_match,
            overall_match,
            "grader {}",
            if accurate { "ACCURATE" } else { "INACCURATE" }
        );

        CalibrationCase {
            transcript_number: labeled.simulation_number,
            accurate,
            agent_match,
            customer_match,
            overall_match,
            expected,
            actual: Some(Verdicts::from_result(&result)),
            error: None,
        }
    }
}

/// Rubric criteria rewritten from the cases where the judge disagreed with
/// the human labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricRevision {
    pub rubric: Rubric,
    pub rationale: String,
    /// Transcript numbers the revision was derived from.
    pub examples: Vec<usize>,
}

#[derive(Serialize)]
struct VerdictLine {
    label: String,
    expected: bool,
    actual: &'static str,
    human_feedback: Option<String>,
}

#[derive(Serialize)]
struct ExampleView {
    number: usize,
    transcript: String,
    roles: Vec<VerdictLine>,
    error: Option<String>,
}

#[derive(Serialize)]
struct RefinerPromptData<'a> {
    kind: &'a str,
    rubric_id: &'a str,
    rubric_version: &'a str,
    criteria: &'a str,
    accurate: usize,
    total: usize,
    accuracy: &'a str,
    examples: Vec<ExampleView>,
}

impl RubricRevision {
    /// Writes `refined-rubric-<ts>.json` and returns its path.
    pub fn write_to(&self, dir: impl Into<PathBuf>) -> Result<PathBuf, SinkError> {
        JsonFileSink::new(dir).write_json(
            &format!("refined-rubric-{}.json", file_timestamp(Utc::now())),
            self,
        )
    }
}

/// Asks a model to rewrite rubric criteria so the judge matches human labels.
pub struct RubricRefiner {
    model: Arc<dyn StructuredModel>,
    labels: RoleLabels,
}

impl RubricRefiner {
    pub fn new(model: Arc<dyn StructuredModel>) -> Self {
        Self {
            model,
            labels: RoleLabels::default(),
        }
    }

    pub fn with_labels(mut self, labels: RoleLabels) -> Self {
        self.labels = labels;
        self
    }

    /// `report` must come from running `transcripts` through a
    /// [`Calibrator`]. Returns `None` when the judge already agrees on every
    /// transcript.
    pub async fn refine(
        &self,
        rubric: &Rubric,
        transcripts: &[LabeledTranscript],
        report: &CalibrationReport,
    ) -> Result<Option<RubricRevision>, OptimizeError> {
        let examples: Vec<ExampleView> = transcripts
            .iter()
            .zip(&report.evaluations)
            .filter(|(_, case)| !case.accurate)
            .filter_map(|(labeled, case)| self.example(labeled, case))
            .collect();
        if examples.is_empty() {
            return Ok(None);
        }

        let numbers: Vec<usize> = examples.iter().map(|example| example.number).collect();
        let data = RefinerPromptData {
            kind: rubric.kind.participants(),
            rubric_id: &rubric.id,
            rubric_version: &rubric.version,
            criteria: &rubric.criteria,
            accurate: report.summary.accurate_evaluations,
            total: report.summary.total_evaluations,
            accuracy: &report.summary.accuracy_rate,
            examples,
        };
        let prompt = prompts::render(prompts::RUBRIC_REFINER_TEMPLATE, &data)?;

        let revision = optimizer::revise(
            self.model.as_ref(),
            prompts::RUBRIC_REFINER_SYSTEM,
            prompt,
            "criteria_revision",
        )
        .await?;

        tracing::info!(rubric = %rubric.id, examples = ?numbers, "refined rubric criteria");

        let mut refined = rubric.clone();
        refined.criteria = revision.new_prompt;
        refined.version = format!("{}-refined", rubric.version);
        Ok(Some(RubricRevision {
            rubric: refined,
            rationale: revision.rationale,
            examples: numbers,
        }))
    }

    fn example(&self, labeled: &LabeledTranscript, case: &CalibrationCase) -> Option<ExampleView> {
        let script = ConversationScript::from_entries(&labeled.conversation, &self.labels).ok()?;
        let transcript = Transcript::from_steps(script.steps().to_vec());

        let verdict = |actual: Option<bool>| match actual {
            Some(true) => "PASS",
            Some(false) => "FAIL",
            None => "gave no verdict",
        };
        let roles = [Role::Agent, Role::Customer]
            .into_iter()
            .map(|role| {
                let actual = case.actual.as_ref().and_then(|actual| match role {
                    Role::Agent => actual.agent_passed,
                    Role::Customer => actual.customer_passed,
                });
                let human_feedback = match role {
                    Role::Agent => labeled.evaluation.agent_feedback.clone(),
                    Role::Customer => labeled.evaluation.customer_feedback.clone(),
                };
                VerdictLine {
                    label: self.labels.get(role).display.clone(),
                    expected: labeled.evaluation.passed(role),
                    actual: verdict(actual),
                    human_feedback,
                }
            })
            .collect();

        Some(ExampleView {
            number: labeled.simulation_number,
            transcript: transcript.render(&self.labels),
            roles,
            error: case.error.clone(),
        })
    }
}
