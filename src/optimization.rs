//! The simulate → judge → optimize loop.

use std::{sync::Arc, time::Duration};

use futures_util::{stream, StreamExt};
use tokio::time::{self, Instant};

use crate::{
    config::{ConfigError, FailurePolicy, LoopConfig, StopPolicy},
    conversation::{ConversationScript, Role, RoleLabels, ScriptError, StartPicker, Transcript},
    judge::{EvaluationResult, Judge, JudgeError, Rubric},
    optimizer::Optimizer,
    record::{percent, IterationSummary, OptimizationRun, SimulationRecord, StopReason},
    simulation::{RolePrompts, SimulationError, SimulationRunner, SimulationState},
    sink::{IterationArtifact, LatestSummary, ResultsSink, RunSummary},
    LLMError,
};

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Rubric(#[from] JudgeError),
    #[error("every simulation of iteration {iteration} failed with a model error (last: {last_error})")]
    ModelUnavailable { iteration: usize, last_error: String },
}

/// One finished simulation plus the model fault that failed it, if any.
struct Attempt {
    record: SimulationRecord,
    fault: Option<ModelFault>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFault {
    Transient,
    Permanent,
}

impl ModelFault {
    fn of(error: &LLMError) -> Self {
        if error.is_permanent() {
            ModelFault::Permanent
        } else {
            ModelFault::Transient
        }
    }
}

/// Every simulation of an iteration failed on a model call.
struct Outage {
    last_error: String,
    permanent: bool,
}

pub struct OptimizationLoop {
    scenario_id: String,
    script: Arc<ConversationScript>,
    runner: SimulationRunner,
    judge: Judge,
    optimizer: Optimizer,
    rubric: Rubric,
    sink: Arc<dyn ResultsSink>,
    config: LoopConfig,
    judge_timeout: Duration,
}

impl OptimizationLoop {
    pub fn new(
        scenario_id: impl Into<String>,
        script: Arc<ConversationScript>,
        runner: SimulationRunner,
        judge: Judge,
        optimizer: Optimizer,
        rubric: Rubric,
        sink: Arc<dyn ResultsSink>,
    ) -> Self {
        let config = LoopConfig::default();
        Self {
            scenario_id: scenario_id.into(),
            script,
            runner,
            judge,
            optimizer: optimizer.with_target(config.optimized_role),
            rubric,
            sink,
            config,
            judge_timeout: Duration::from_secs(180),
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.optimizer = self.optimizer.with_target(config.optimized_role);
        self.config = config;
        self
    }

    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge_timeout = timeout;
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    fn labels(&self) -> &RoleLabels {
        self.judge.labels()
    }

    /// Runs iterations until the stop policy is satisfied. The optimized
    /// role's prompt for iteration `k + 1` is exactly the optimizer output of
    /// iteration `k`, or the unchanged prompt when the optimizer failed.
    pub async fn run(
        &self,
        initial: RolePrompts,
        picker: &mut dyn StartPicker,
    ) -> Result<OptimizationRun, LoopError> {
        self.config.validate()?;
        self.rubric.validate()?;

        let role = self.config.optimized_role;
        let mut prompts = initial;
        let mut run = OptimizationRun::new(self.scenario_id.clone(), prompts.get(role));

        tracing::info!(
            scenario = %self.scenario_id,
            max_iterations = self.config.max_iterations,
            simulations = self.config.simulations_per_iteration,
            concurrency = self.config.effective_concurrency(),
            "starting optimization run"
        );

        let mut outage_streak = 0usize;

        for iteration in 1..=self.config.max_iterations {
            let started = Instant::now();
            let (mut summary, outage) = self.run_iteration(iteration, &prompts, picker).await?;
            let elapsed = started.elapsed();
            let pass_rate = summary.pass_rate();

            tracing::info!(
                iteration,
                passed = summary.passed_simulations(),
                total = summary.total_simulations(),
                excluded = summary.excluded_failures,
                pass_rate = %percent(pass_rate),
                "iteration complete"
            );

            let fatal = match &outage {
                Some(outage) => {
                    outage_streak += 1;
                    tracing::warn!(
                        iteration,
                        streak = outage_streak,
                        last_error = %outage.last_error,
                        "every simulation failed on a model call"
                    );
                    (outage.permanent || outage_streak >= self.config.unavailable_iterations)
                        .then(|| outage.last_error.clone())
                }
                None => {
                    outage_streak = 0;
                    None
                }
            };

            let threshold_met = self.config.stop_policy == StopPolicy::PassRateThreshold
                && pass_rate >= self.config.required_pass_rate;
            let last = iteration == self.config.max_iterations;

            if outage.is_some() || summary.records.is_empty() {
                tracing::info!(iteration, "no judged simulations, keeping the current prompt");
            } else if !threshold_met && !last {
                match self
                    .optimizer
                    .optimize(prompts.get(role), &self.rubric, &summary.records)
                    .await
                {
                    Ok(revision) => {
                        summary.optimized_prompt = Some(revision.new_prompt.clone());
                        summary.optimizer_rationale = Some(revision.rationale);
                        prompts = prompts.with(role, revision.new_prompt);
                    }
                    Err(error) => {
                        tracing::warn!(iteration, %error, "optimizer failed, keeping the current prompt");
                        summary.optimizer_error = Some(error.to_string());
                    }
                }
            }

            self.persist_iteration(&summary, elapsed, &mut run);
            run.iterations.push(summary);
            run.final_prompt = prompts.get(role).to_string();

            if let Some(last_error) = fatal {
                tracing::error!(iteration, %last_error, "model unavailable, abandoning the run");
                run.stop_reason = Some(StopReason::ModelUnavailable);
                self.persist_run(&mut run);
                return Err(LoopError::ModelUnavailable {
                    iteration,
                    last_error,
                });
            }

            if threshold_met {
                tracing::info!(
                    iteration,
                    required = %percent(self.config.required_pass_rate),
                    "required pass rate reached"
                );
                run.stop_reason = Some(StopReason::ThresholdReached);
                break;
            }
        }

        if run.stop_reason.is_none() {
            run.stop_reason = Some(StopReason::IterationLimit);
        }
        self.persist_run(&mut run);

        Ok(run)
    }

    async fn run_iteration(
        &self,
        iteration: usize,
        prompts: &RolePrompts,
        picker: &mut dyn StartPicker,
    ) -> Result<(IterationSummary, Option<Outage>), LoopError> {
        let mut seeds = Vec::with_capacity(self.config.simulations_per_iteration);
        for simulation_id in 1..=self.config.simulations_per_iteration {
            let start_index = self.script.random_start_index(picker)?;
            let prefix = self.script.slice(start_index, self.config.prefix_length)?;
            seeds.push((simulation_id, start_index, prefix));
        }

        let attempts: Vec<Attempt> = stream::iter(seeds.into_iter().map(
            |(simulation_id, start_index, prefix)| {
                self.simulate(iteration, simulation_id, start_index, prefix, prompts)
            },
        ))
        .buffer_unordered(self.config.effective_concurrency())
        .collect()
        .await;

        let outage = if !attempts.is_empty() && attempts.iter().all(|attempt| attempt.fault.is_some()) {
            Some(Outage {
                last_error: attempts
                    .iter()
                    .filter_map(|attempt| attempt.record.error.clone())
                    .last()
                    .unwrap_or_default(),
                permanent: attempts
                    .iter()
                    .all(|attempt| attempt.fault == Some(ModelFault::Permanent)),
            })
        } else {
            None
        };

        let mut records: Vec<SimulationRecord> =
            attempts.into_iter().map(|attempt| attempt.record).collect();
        records.sort_by_key(|record| record.simulation_id);

        let mut excluded = 0;
        if self.config.failure_policy == FailurePolicy::Exclude {
            let before = records.len();
            records.retain(|record| !record.is_failure());
            excluded = before - records.len();
        }

        let mut summary =
            IterationSummary::new(iteration, prompts.get(self.config.optimized_role), records);
        summary.excluded_failures = excluded;
        Ok((summary, outage))
    }

    async fn simulate(
        &self,
        iteration: usize,
        simulation_id: usize,
        start_index: usize,
        prefix: Transcript,
        prompts: &RolePrompts,
    ) -> Attempt {
        let started = Instant::now();
        let roles = &self.rubric.evaluated_roles;

        let outcome = match self.runner.run(prefix, prompts).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(iteration, simulation_id, %error, "simulation failed");
                let transcript = error.partial_transcript().clone();
                let SimulationError::Turn { source, .. } = &error;
                let fault = Some(ModelFault::of(source));
                return Attempt {
                    record: self.failed_record(
                        iteration,
                        simulation_id,
                        start_index,
                        transcript,
                        started,
                        error.to_string(),
                        roles,
                    ),
                    fault,
                };
            }
        };

        let verdict = match time::timeout(
            self.judge_timeout,
            self.judge.evaluate(&outcome.transcript, &self.rubric),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(JudgeError::Model(LLMError::Timeout(
                self.judge_timeout.as_millis() as u64,
            ))),
        };

        match verdict {
            Ok(evaluation) => {
                let record = SimulationRecord {
                    iteration,
                    simulation_id,
                    start_index,
                    transcript: outcome.transcript,
                    evaluation,
                    duration_ms: started.elapsed().as_millis() as u64,
                    terminal_state: outcome.state,
                    error: None,
                };
                tracing::info!(
                    iteration,
                    simulation_id,
                    start_index,
                    turns = outcome.generated_turns,
                    state = ?record.terminal_state,
                    duration_ms = record.duration_ms,
                    passed = record.passed(),
                    "simulation {}",
                    if record.passed() { "PASSED" } else { "FAILED" }
                );
                Attempt { record, fault: None }
            }
            Err(error) => {
                tracing::warn!(iteration, simulation_id, %error, "judge failed");
                let fault = match &error {
                    JudgeError::Model(source) => Some(ModelFault::of(source)),
                    _ => None,
                };
                Attempt {
                    record: self.failed_record(
                        iteration,
                        simulation_id,
                        start_index,
                        outcome.transcript,
                        started,
                        error.to_string(),
                        roles,
                    ),
                    fault,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failed_record(
        &self,
        iteration: usize,
        simulation_id: usize,
        start_index: usize,
        transcript: Transcript,
        started: Instant,
        error: String,
        roles: &[Role],
    ) -> SimulationRecord {
        SimulationRecord {
            iteration,
            simulation_id,
            start_index,
            transcript,
            evaluation: EvaluationResult::failed(roles, error.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
            terminal_state: SimulationState::Failed,
            error: Some(error),
        }
    }

    fn persist_run(&self, run: &mut OptimizationRun) {
        if let Err(error) = self.sink.write_run_summary(&RunSummary::from_run(run)) {
            tracing::error!(%error, "failed to persist run summary");
            run.persistence_failures.push(error.to_string());
        }
    }

    fn persist_iteration(
        &self,
        summary: &IterationSummary,
        elapsed: Duration,
        run: &mut OptimizationRun,
    ) {
        let written = IterationArtifact::from_summary(&self.scenario_id, summary, self.labels())
            .and_then(|artifact| self.sink.write_iteration(&artifact));
        if let Err(error) = written {
            tracing::error!(iteration = summary.iteration, %error, "failed to persist iteration results");
            run.persistence_failures.push(error.to_string());
        }

        if let Err(error) = self
            .sink
            .write_latest_summary(&LatestSummary::new(summary, elapsed))
        {
            tracing::error!(iteration = summary.iteration, %error, "failed to persist latest summary");
            run.persistence_failures.push(error.to_string());
        }
    }
}
