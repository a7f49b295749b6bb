use std::{path::PathBuf, process, sync::Arc, time::Duration};

use clap::Parser;
use colored::Colorize;
use promptsmith::{
    config::{rate_from_percent, FailurePolicy, LoopConfig, ModelSettings, StopPolicy},
    providers::openai::OpenAI,
    record::percent,
    scenario::{self, Scenario},
    ConversationModel, Judge, LLMProvider, OptimizationLoop, OptimizationRun, Optimizer,
    ProviderModel, RandomStartPicker, Role, SimulationRunner, StructuredModel, TurnGenerator,
    JsonFileSink,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "promptsmith")]
#[command(about = "Simulate, judge and optimize agent system prompts")]
struct Args {
    /// Scenario ids to run, resolved against --scenarios-dir
    scenarios: Vec<String>,

    #[arg(long, env = "PROMPTSMITH_SCENARIOS_DIR", default_value = "scenarios")]
    scenarios_dir: PathBuf,

    /// Results are written to <out-dir>/<scenario-id>/
    #[arg(long, env = "PROMPTSMITH_OUT_DIR", default_value = "test-results")]
    out_dir: PathBuf,

    /// Model used for both conversation seats
    #[arg(long, env = "PROMPTSMITH_MODEL", default_value = "gpt-4o")]
    model: String,

    /// Model used by the judge and the optimizer
    #[arg(long, env = "PROMPTSMITH_JUDGE_MODEL", default_value = "gpt-4-turbo")]
    judge_model: String,

    #[arg(long, env = "PROMPTSMITH_MAX_ITERATIONS", default_value_t = 5)]
    max_iterations: usize,

    /// Simulations per iteration
    #[arg(long, env = "PROMPTSMITH_SIMULATIONS", default_value_t = 5)]
    simulations: usize,

    /// Generated turns per simulation; overrides the scenario value
    #[arg(long, env = "PROMPTSMITH_MAX_TURNS")]
    max_turns: Option<usize>,

    /// Recorded steps used as the simulation prefix; overrides the scenario value
    #[arg(long)]
    prefix_length: Option<usize>,

    /// Percent of simulations that must pass
    #[arg(long, env = "PROMPTSMITH_REQUIRED_PASS_RATE", default_value_t = 80.0)]
    required_pass_rate: f64,

    /// Stop as soon as an iteration reaches the required pass rate
    #[arg(long, env = "PROMPTSMITH_STOP_ON_THRESHOLD")]
    stop_on_threshold: bool,

    /// Simulations run at the same time within an iteration
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Seed for start-index selection
    #[arg(long)]
    seed: Option<u64>,

    /// Leave failed simulations out of the pass rate instead of counting them as failures
    #[arg(long)]
    exclude_failed: bool,

    /// Consecutive iterations with no successful model call before giving up
    #[arg(long, env = "PROMPTSMITH_UNAVAILABLE_ITERATIONS", default_value_t = 2)]
    unavailable_iterations: usize,

    /// Optimize the customer prompt instead of the agent prompt
    #[arg(long)]
    optimize_customer: bool,

    /// List the available scenarios and exit
    #[arg(long)]
    list: bool,
}

const DEFAULT_MAX_TURNS: usize = 8;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,promptsmith=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list {
        for scenario in scenario::load_scenarios(&args.scenarios_dir)? {
            println!(
                "{}  {}",
                scenario.id.bold(),
                scenario.description.unwrap_or_default()
            );
        }
        return Ok(());
    }

    if args.scenarios.is_empty() {
        eprintln!("Please provide at least one scenario id, e.g. `promptsmith sales-call`.");
        process::exit(1);
    }

    let base_config = match loop_config(&args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{} {error}", "configuration error:".red());
            process::exit(1);
        }
    };
    let settings = ModelSettings {
        conversation_model: args.model.clone(),
        judge_model: args.judge_model.clone(),
        ..ModelSettings::default()
    };
    if let Err(error) = settings.validate() {
        eprintln!("{} {error}", "configuration error:".red());
        process::exit(1);
    }

    let provider: Arc<dyn LLMProvider> = match OpenAI::from_env() {
        Ok(provider) => Arc::new(provider),
        Err(error) => {
            eprintln!("{} {error}", "configuration error:".red());
            process::exit(1);
        }
    };

    let mut scenarios = Vec::with_capacity(args.scenarios.len());
    for id in &args.scenarios {
        match scenario::resolve(&args.scenarios_dir, id).and_then(scenario::load_scenario) {
            Ok(scenario) => scenarios.push(scenario),
            Err(error) => {
                eprintln!("{} {error}", "configuration error:".red());
                process::exit(1);
            }
        }
    }

    let mut failed = false;
    for scenario in scenarios {
        let mut config = base_config.clone();
        if let Some(prefix_length) = args.prefix_length.or(scenario.prefix_length) {
            config.prefix_length = prefix_length;
        }
        let max_turns = args
            .max_turns
            .or(scenario.max_turns)
            .unwrap_or(DEFAULT_MAX_TURNS);

        let optimization = build_loop(
            &scenario,
            Arc::clone(&provider),
            &settings,
            config.clone(),
            max_turns,
            args.out_dir.join(&scenario.id),
        );
        let mut picker = args
            .seed
            .map(RandomStartPicker::seeded)
            .unwrap_or_default();

        match optimization.run(scenario.prompts.clone(), &mut picker).await {
            Ok(run) => {
                print_report(&run, &config);
                if run.has_persistence_failures() {
                    eprintln!(
                        "{} {} result file(s) could not be written for {}",
                        "error:".red(),
                        run.persistence_failures.len(),
                        scenario.id
                    );
                    failed = true;
                }
            }
            Err(error) => {
                eprintln!("{} {}: {error}", "run failed:".red(), scenario.id);
                failed = true;
            }
        }
    }

    if failed {
        process::exit(1);
    }
    Ok(())
}

fn loop_config(args: &Args) -> Result<LoopConfig, promptsmith::ConfigError> {
    let config = LoopConfig {
        max_iterations: args.max_iterations,
        simulations_per_iteration: args.simulations,
        stop_policy: if args.stop_on_threshold {
            StopPolicy::PassRateThreshold
        } else {
            StopPolicy::FixedIterations
        },
        required_pass_rate: rate_from_percent(args.required_pass_rate)?,
        concurrency: args.concurrency,
        failure_policy: if args.exclude_failed {
            FailurePolicy::Exclude
        } else {
            FailurePolicy::Record
        },
        optimized_role: if args.optimize_customer {
            Role::Customer
        } else {
            Role::Agent
        },
        unavailable_iterations: args.unavailable_iterations,
        ..LoopConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn build_loop(
    scenario: &Scenario,
    provider: Arc<dyn LLMProvider>,
    settings: &ModelSettings,
    config: LoopConfig,
    max_turns: usize,
    out_dir: PathBuf,
) -> OptimizationLoop {
    let conversation: Arc<dyn ConversationModel> = Arc::new(
        ProviderModel::new(Arc::clone(&provider), settings.conversation_model.clone())
            .with_timeout(settings.turn_timeout),
    );
    let structured: Arc<dyn StructuredModel> = Arc::new(
        ProviderModel::new(provider, settings.judge_model.clone())
            .with_timeout(settings.judge_timeout),
    );

    let mut runner = SimulationRunner::new(TurnGenerator::new(conversation), max_turns)
        .with_turn_timeout(settings.turn_timeout + Duration::from_secs(5));
    if let Some(opener) = scenario.opener {
        runner = runner.with_opener(opener);
    }

    OptimizationLoop::new(
        scenario.id.clone(),
        Arc::new(scenario.script.clone()),
        runner,
        Judge::new(Arc::clone(&structured)).with_labels(scenario.labels.clone()),
        Optimizer::new(structured).with_labels(scenario.labels.clone()),
        scenario.rubric.clone(),
        Arc::new(JsonFileSink::new(out_dir)),
    )
    .with_config(config)
    .with_judge_timeout(settings.judge_timeout + Duration::from_secs(5))
}

fn print_report(run: &OptimizationRun, config: &LoopConfig) {
    println!();
    println!("{}", format!("Optimization summary: {}", run.scenario_id).bold());
    for summary in &run.iterations {
        let rate = summary.pass_rate();
        let line = format!(
            "  Iteration {}: {}/{} passed ({})",
            summary.iteration,
            summary.passed_simulations(),
            summary.total_simulations(),
            percent(rate)
        );
        if rate >= config.required_pass_rate {
            println!("{}", line.green());
        } else {
            println!("{}", line.red());
        }
        for record in &summary.records {
            let verdict = if record.passed() { "PASS".green() } else { "FAIL".red() };
            println!(
                "    {} simulation {} (start {}, {} ms)",
                verdict, record.simulation_id, record.start_index, record.duration_ms
            );
        }
        if let Some(error) = &summary.optimizer_error {
            println!("    {} {}", "optimizer failed:".yellow(), error);
        }
    }

    let improvement = run.improvement() * 100.0;
    println!("  Improvement: {improvement:+.2} percentage points");
    if let Some(reason) = run.stop_reason {
        println!("  Stopped: {reason:?}");
    }
    println!("\n{}\n{}", "Final prompt:".bold(), run.final_prompt);
}
