use std::{path::PathBuf, process, sync::Arc};

use clap::Parser;
use colored::Colorize;
use promptsmith::{
    calibration::{load_labeled, CalibrationReport, Calibrator, RubricRefiner},
    config::rate_from_percent,
    providers::openai::OpenAI,
    record::percent,
    scenario, Judge, ProviderModel,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "judge-calibrate")]
#[command(about = "Check judge verdicts against hand-labeled transcripts")]
struct Args {
    /// JSON array of labeled transcripts
    #[arg(long)]
    labeled: PathBuf,

    /// Scenario whose rubric and labels the judge uses
    #[arg(long)]
    scenario: String,

    #[arg(long, env = "PROMPTSMITH_SCENARIOS_DIR", default_value = "scenarios")]
    scenarios_dir: PathBuf,

    #[arg(long, env = "PROMPTSMITH_OUT_DIR", default_value = "test-results")]
    out_dir: PathBuf,

    #[arg(long, env = "PROMPTSMITH_JUDGE_MODEL", default_value = "gpt-4o")]
    judge_model: String,

    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Exit with code 1 when fewer than this percent of verdicts agree
    #[arg(long, default_value_t = 0.0)]
    min_accuracy: f64,

    /// Rewrite the rubric criteria from the disagreements and calibrate again
    #[arg(long)]
    refine: bool,
}

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

    let provider = match OpenAI::from_env() {
        Ok(provider) => Arc::new(provider),
        Err(error) => {
            eprintln!("{} {error}", "configuration error:".red());
            process::exit(1);
        }
    };
    let scenario = scenario::load_scenario(scenario::resolve(&args.scenarios_dir, &args.scenario)?)?;
    let transcripts = load_labeled(&args.labeled)?;
    if transcripts.is_empty() {
        eprintln!("{} contains no transcripts", args.labeled.display());
        process::exit(1);
    }

    let min_accuracy = match rate_from_percent(args.min_accuracy) {
        Ok(rate) => rate,
        Err(error) => {
            eprintln!("{} {error}", "configuration error:".red());
            process::exit(1);
        }
    };

    let model = Arc::new(ProviderModel::new(provider, args.judge_model.clone()));
    let judge = Judge::new(model.clone()).with_labels(scenario.labels.clone());
    let report = Calibrator::new(judge.clone(), scenario.rubric.clone())
        .with_concurrency(args.concurrency)
        .run(&transcripts)
        .await;

    println!("\n{}", "Grader evaluation summary".bold());
    print_report(&report, min_accuracy);
    let path = report.write_to(&args.out_dir)?;
    println!("  Detailed results saved to {}", path.display());

    let mut accuracy = report.accuracy();
    if args.refine {
        let refiner = RubricRefiner::new(model).with_labels(scenario.labels.clone());
        match refiner.refine(&scenario.rubric, &transcripts, &report).await {
            Ok(Some(revision)) => {
                let refined = Calibrator::new(judge, revision.rubric.clone())
                    .with_concurrency(args.concurrency)
                    .run(&transcripts)
                    .await;
                println!("\n{}", "Refined rubric".bold());
                print_report(&refined, min_accuracy);
                println!(
                    "  Accuracy {} -> {}",
                    percent(report.accuracy()),
                    percent(refined.accuracy())
                );
                println!("\n{}\n{}", "Refined criteria:".bold(), revision.rubric.criteria);
                let path = revision.write_to(&args.out_dir)?;
                println!("  Refined rubric saved to {}", path.display());
                accuracy = refined.accuracy();
            }
            Ok(None) => println!("  Judge agrees on every transcript; nothing to refine"),
            Err(error) => {
                eprintln!("{} {error}", "refinement failed:".red());
                process::exit(1);
            }
        }
    }

    if accuracy < min_accuracy {
        process::exit(1);
    }
    Ok(())
}

fn print_report(report: &CalibrationReport, min_accuracy: f64) {
    for case in &report.evaluations {
        let verdict = if case.accurate {
            "ACCURATE".green()
        } else {
            "INACCURATE".red()
        };
        println!(
            "  Transcript #{}: {} (agent {}, customer {}, overall {})",
            case.transcript_number,
            verdict,
            match_label(case.agent_match),
            match_label(case.customer_match),
            match_label(case.overall_match)
        );
        if let Some(error) = &case.error {
            println!("    {} {error}", "error:".yellow());
        }
    }
    let line = format!(
        "  {}/{} evaluations accurate ({}) in {:.2}s",
        report.summary.accurate_evaluations,
        report.summary.total_evaluations,
        report.summary.accuracy_rate,
        report.summary.duration
    );
    if report.accuracy() >= min_accuracy {
        println!("{}", line.green());
    } else {
        println!("{}", line.red());
    }
}

fn match_label(matched: bool) -> colored::ColoredString {
    if matched {
        "match".green()
    } else {
        "mismatch".red()
    }
}
