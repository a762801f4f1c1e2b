//! CLI entry point (§6 External Interfaces). Grounded on `bench-harness`'s `clap`-derive
//! `Args`/`Command` split and `tracing_subscriber::fmt` setup; cancellation wiring follows
//! `bench-harness::main`'s `ctrlc`-to-stop-flag pattern, generalized to `pipeline::CancelFlag`.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;

use grevling::case::Case;
use grevling::config;
use grevling::pipeline::CancelFlag;
use grevling::util::HumanReadableDuration;

#[derive(clap::Subcommand)]
enum Command {
    /// Run every not-yet-downloaded instance through prepare/run/download.
    Run {
        /// Number of concurrent script executions.
        #[clap(short = 'j', long, default_value_t = 1)]
        nprocs: usize,
    },
    /// Snapshot all downloaded instances into a CSV result table.
    Collect {
        /// Path to the CSV file to write.
        #[clap(short, long, default_value = "results.csv")]
        output: PathBuf,
    },
    /// Re-run capture over already-downloaded instances without re-executing scripts.
    Capture,
    /// List every enumerated instance and its current status.
    List,
}

#[derive(clap::Parser)]
struct Args {
    /// Path to the case definition file.
    #[clap(short, long, value_name = "FILE", default_value = "grevling.toml")]
    config: PathBuf,
    #[clap(subcommand)]
    command: Command,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_env_var("RUST_LOG")
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let spec = config::load_case_spec(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    let case = Case::new(spec)?;

    match &args.command {
        Command::Run { nprocs } => {
            let cancel = CancelFlag::new();
            let cancel_for_handler = cancel.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("interrupt received, finishing in-flight work then stopping");
                cancel_for_handler.trigger();
            })
            .context("installing ctrl-c handler")?;

            let start = std::time::Instant::now();
            let report = case.run(*nprocs, &cancel)?;
            let elapsed = HumanReadableDuration(start.elapsed());
            tracing::info!(
                submitted = report.submitted,
                downloaded = report.downloaded,
                failed = report.failed,
                elapsed = %elapsed,
                "run complete"
            );
            if report.failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Collect { output } => {
            let n = case.collect(output)?;
            tracing::info!(rows = n, path = %output.display(), "collected results");
            Ok(())
        }
        Command::Capture => {
            let n = case.capture()?;
            tracing::info!(n, "re-captured downloaded instances");
            Ok(())
        }
        Command::List => {
            for instance in case.instances()? {
                println!("{}\t{:?}", instance.logdir(), instance.status()?);
            }
            Ok(())
        }
    }
}
