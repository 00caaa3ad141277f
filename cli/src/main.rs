//! open-harness command-line front end.
//!
//! Exit code is non-zero only on catastrophic initialization failure; a
//! failed goal still exits 0 with the failure in the printed summary.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use open_harness::{Event, Harness, HarnessConfig, Tier};

#[derive(Debug, Parser)]
#[command(name = "open-harness", version, about = "Self-driving agent harness for weak local LMs")]
struct Args {
    /// Configuration file path (overrides discovery).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model tier for this session.
    #[arg(long, value_parser = ["small", "medium", "large"])]
    tier: Option<String>,

    /// Run a goal interactively and print the summary.
    #[arg(long)]
    goal: Option<String>,

    /// Submit a goal to the background task queue and print its id.
    #[arg(long)]
    task: Option<String>,

    /// Show the background task list.
    #[arg(long)]
    tasks: bool,

    /// Verbose logging and token streaming.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose { "open_harness=debug,info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match HarnessConfig::discover(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("open-harness: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(tier) = &args.tier {
        match tier.parse::<Tier>() {
            Ok(tier) => config.tier = Some(tier),
            Err(e) => {
                eprintln!("open-harness: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let root = match std::env::current_dir() {
        Ok(root) => root,
        Err(e) => {
            eprintln!("open-harness: cannot determine working directory: {e}");
            return ExitCode::FAILURE;
        }
    };

    let harness = match Harness::init(config, root) {
        Ok(harness) => harness,
        Err(e) => {
            eprintln!("open-harness: initialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(goal) = &args.goal {
        run_goal(&harness, goal, args.verbose).await;
    } else if let Some(goal) = &args.task {
        match harness.submit_task(goal) {
            Ok(task) => println!("submitted task {}", task.id),
            Err(e) => eprintln!("open-harness: {e}"),
        }
    } else if args.tasks {
        print_tasks(&harness);
    } else {
        eprintln!("nothing to do: pass --goal, --task or --tasks");
    }

    harness.shutdown().await;
    ExitCode::SUCCESS
}

/// Run one goal, streaming progress to the terminal.
async fn run_goal(harness: &Harness, goal: &str, verbose: bool) {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, cancelling goal...");
            interrupt.cancel();
        }
    });

    let mut events = harness.events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::LmTokenChunk { text } if verbose => {
                    print!("{text}");
                }
                Event::ToolStarted { name, .. } => eprintln!("→ {name}"),
                Event::ToolCompleted { name, ok, elapsed_ms, .. } => {
                    eprintln!("← {name} {} ({elapsed_ms} ms)", if ok { "ok" } else { "failed" });
                }
                Event::Compensation { class, strategy } => {
                    eprintln!("  compensation: {class} → {strategy}");
                }
                Event::PlanStepStarted { index, title } => {
                    eprintln!("step {}: {title}", index + 1);
                }
                Event::CheckpointRolledBack { snapshot } => {
                    eprintln!("  rolled back to {snapshot}");
                }
                Event::PolicyViolation { tool, detail } => {
                    eprintln!("  policy: {tool}: {detail}");
                }
                Event::ConsumerLag { dropped } => {
                    eprintln!("  ({dropped} events dropped)");
                }
                Event::GoalCompleted { .. } | Event::GoalFailed { .. } => break,
                _ => {}
            }
        }
    });

    let outcome = harness.run_goal(goal, cancel).await;
    let _ = printer.await;
    println!("\n{}", outcome.summary);
}

fn print_tasks(harness: &Harness) {
    match harness.list_tasks() {
        Ok(tasks) if tasks.is_empty() => println!("no tasks"),
        Ok(tasks) => {
            for task in tasks {
                println!(
                    "{}  {:<9}  {}",
                    task.id,
                    task.status.to_string(),
                    task.goal
                );
            }
        }
        Err(e) => eprintln!("open-harness: {e}"),
    }
}
