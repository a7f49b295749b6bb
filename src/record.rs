use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{conversation::Transcript, judge::EvaluationResult, simulation::SimulationState};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRecord {
    pub iteration: usize,
    pub simulation_id: usize,
    pub start_index: usize,
    pub transcript: Transcript,
    pub evaluation: EvaluationResult,
    pub duration_ms: u64,
    pub terminal_state: SimulationState,
    /// Set when the simulation failed before a verdict was reached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SimulationRecord {
    pub fn passed(&self) -> bool {
        self.evaluation.overall_passed()
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationSummary {
    pub iteration: usize,
    pub records: Vec<SimulationRecord>,
    /// Failed simulations left out of `records` under the exclude policy.
    pub excluded_failures: usize,
    /// Prompt the optimized role ran with during this iteration.
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer_rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer_error: Option<String>,
}

impl IterationSummary {
    pub fn new(iteration: usize, prompt: impl Into<String>, records: Vec<SimulationRecord>) -> Self {
        Self {
            iteration,
            records,
            excluded_failures: 0,
            prompt: prompt.into(),
            optimized_prompt: None,
            optimizer_rationale: None,
            optimizer_error: None,
        }
    }

    pub fn total_simulations(&self) -> usize {
        self.records.len()
    }

    pub fn passed_simulations(&self) -> usize {
        self.records.iter().filter(|record| record.passed()).count()
    }

    /// Fraction in `[0, 1]`; 0 for an iteration with no counted simulations.
    pub fn pass_rate(&self) -> f64 {
        let total = self.total_simulations();
        if total == 0 {
            return 0.0;
        }
        self.passed_simulations() as f64 / total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationLimit,
    ThresholdReached,
    /// Model calls kept failing; see `LoopConfig::unavailable_iterations`.
    ModelUnavailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRun {
    pub scenario_id: String,
    pub started_at: DateTime<Utc>,
    pub iterations: Vec<IterationSummary>,
    pub final_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub persistence_failures: Vec<String>,
}

impl OptimizationRun {
    pub fn new(scenario_id: impl Into<String>, initial_prompt: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            started_at: Utc::now(),
            iterations: Vec::new(),
            final_prompt: initial_prompt.into(),
            stop_reason: None,
            persistence_failures: Vec::new(),
        }
    }

    pub fn first_pass_rate(&self) -> Option<f64> {
        self.iterations.first().map(IterationSummary::pass_rate)
    }

    pub fn last_pass_rate(&self) -> Option<f64> {
        self.iterations.last().map(IterationSummary::pass_rate)
    }

    /// Last pass rate minus first; 0 before any iteration.
    pub fn improvement(&self) -> f64 {
        match (self.first_pass_rate(), self.last_pass_rate()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    pub fn has_persistence_failures(&self) -> bool {
        !self.persistence_failures.is_empty()
    }
}

/// Formats a `[0, 1]` rate as a two-decimal percentage.
pub fn percent(rate: f64) -> String {
    format!("{:.2}%", rate * 100.0)
}

#[cfg(test)]
mod tests {
    use crate::{
        conversation::{Role, Transcript},
        judge::{EvaluationResult, RoleVerdict},
        simulation::SimulationState,
    };

    use super::*;

    fn record(simulation_id: usize, passed: bool) -> SimulationRecord {
        SimulationRecord {
            iteration: 1,
            simulation_id,
            start_index: 0,
            transcript: Transcript::new(),
            evaluation: EvaluationResult::from_verdicts([(
                Role::Agent,
                RoleVerdict {
                    passed,
                    feedback: String::new(),
                },
            )]),
            duration_ms: 5,
            terminal_state: SimulationState::Exhausted,
            error: None,
        }
    }

    #[test]
    fn two_of_three_is_sixty_seven_percent() {
        let summary = IterationSummary::new(
            1,
            "prompt",
            vec![record(1, true), record(2, false), record(3, true)],
        );

        assert_eq!(summary.total_simulations(), 3);
        assert_eq!(summary.passed_simulations(), 2);
        assert!((summary.pass_rate() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(percent(summary.pass_rate()), "66.67%");
    }

    #[test]
    fn empty_iteration_has_zero_rate() {
        let summary = IterationSummary::new(1, "prompt", Vec::new());
        assert_eq!(summary.pass_rate(), 0.0);
    }

    #[test]
    fn improvement_is_last_minus_first() {
        let mut run = OptimizationRun::new("sales", "p0");
        assert_eq!(run.improvement(), 0.0);

        run.iterations.push(IterationSummary::new(1, "p0", vec![record(1, false), record(2, true)]));
        run.iterations.push(IterationSummary::new(2, "p1", vec![record(1, true), record(2, true)]));
        assert!((run.improvement() - 0.5).abs() < 1e-12);
    }
}
