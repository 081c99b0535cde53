mod scenario;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use log::{debug, info};

use ebex_core::Result;
use scenario::Scenario;

/// Ebex: a priority-ordered event bus
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Print "pong" and exit
    #[arg(long)]
    ping: bool,

    /// Raise the log level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register the scenario's handlers and emit its batches
    Run {
        /// Scenario file (.json, .yaml, .yml or .toml)
        scenario: PathBuf,
    },
    /// Validate a scenario and list listener counts without emitting
    Check {
        /// Scenario file (.json, .yaml, .yml or .toml)
        scenario: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    if args.ping {
        println!("pong");
        return ExitCode::SUCCESS;
    }

    init_logging(args.verbose);

    let outcome = match args.command {
        Some(Commands::Run { scenario }) => run(&scenario).await,
        Some(Commands::Check { scenario }) => check(&scenario),
        None => {
            println!("No command specified. Try `ebex --help`.");
            Ok(())
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    let harness = scenario.build()?;
    info!("Loaded scenario '{}' on bus '{}'", path.display(), harness.bus.name());

    let mut emissions = 0;
    for (index, batch) in scenario.batches.iter().enumerate() {
        let mut pending = Vec::with_capacity(batch.emit.len());
        for emission in &batch.emit {
            pending.push((emission.event_name()?, emission.payload()));
        }
        debug!("Batch {} emits {} event(s) concurrently", index + 1, pending.len());

        let results = join_all(
            pending
                .iter()
                .map(|(event, data)| harness.bus.emit(event.as_str(), Some(data.clone()))),
        )
        .await;
        for result in results {
            result?;
        }
        emissions += pending.len();
    }

    harness.in_flight.settled().await;

    println!(
        "Finished: {} emission(s), {} handler invocation(s), {} failure(s) reported",
        emissions,
        harness.invocations.load(Ordering::SeqCst),
        harness.sink.failures()
    );
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    for batch in &scenario.batches {
        for emission in &batch.emit {
            emission.event_name()?;
        }
    }
    let harness = scenario.build()?;

    let events = harness.bus.events();
    if events.is_empty() {
        println!("No handlers registered.");
    }
    for event in &events {
        println!("{}: {} listener(s)", event, harness.bus.listener_count(Some(event.as_str()))?);
    }
    println!(
        "Scenario OK: {} handler(s) across {} event(s), {} batch(es)",
        harness.bus.listener_count(None)?,
        events.len(),
        scenario.batches.len()
    );
    Ok(())
}
