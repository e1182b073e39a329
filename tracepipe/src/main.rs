//! # tracepipe - Main Entry Point
//!
//! - **record**: start the system trace collector and the drain, write a
//!   stream file until Ctrl+C or `--duration`
//! - **dump**: print a recorded stream as text or JSON lines

#![allow(clippy::cast_precision_loss)]

use std::fs;
use std::io::{self, BufWriter};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use tracepipe::cli::{Cli, Command, DumpArgs, RecordArgs};
use tracepipe::instrument;
use tracepipe::preflight::run_preflight_checks;
use tracepipe::queue;
use tracepipe::recorder::Session;
use tracepipe::systrace::ConnectionStatus;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Record(args) => record(&args).await,
        Command::Dump(args) => dump(&args),
    }
}

async fn record(args: &RecordArgs) -> Result<()> {
    let config = args.to_config();
    let quiet = args.quiet;
    run_preflight_checks(&config, quiet)?;

    if !quiet {
        println!("tracepipe v{}", env!("CARGO_PKG_VERSION"));
        println!("backend: {:?}", config.backend);
        println!("clock: {}", tracepipe::clock::SOURCE);
        println!("output: {}", config.output.display());
    }

    let session = Session::start(&config)?;
    if !session.system_trace_active() && !quiet {
        eprintln!("warning: system tracing unavailable, recording instrumentation only");
    }
    if config.on_demand && !quiet {
        println!("on-demand: paused, send SIGUSR1 to toggle capture");
    }
    instrument::message("recording started");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = async {
        match config.duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut toggle = ToggleSignal::new(config.on_demand)?;
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;

    let started = Instant::now();
    let exit_reason = loop {
        tokio::select! {
            () = &mut deadline => break "duration limit reached",
            _ = &mut ctrl_c => break "interrupted",
            () = toggle.recv() => {
                let connection = session.connection();
                let now = !connection.is_connected();
                connection.set_connected(now);
                info!("System event capture {}", if now { "resumed" } else { "paused" });
            }
            _ = status.tick() => {
                let stats = queue::global().stats();
                info!(
                    "{} producers, {} published, {} dropped",
                    stats.producers, stats.published, stats.dropped
                );
            }
        }
    };

    instrument::message("recording stopped");
    let (summary, _) = session.finish()?;

    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} records ({} drained, {} threads named, {} dropped)",
            exit_reason,
            started.elapsed().as_secs_f64(),
            summary.drain.written,
            summary.drain.drained,
            summary.drain.names_resolved,
            summary.queue.dropped,
        );
        println!("saved: {}", config.output.display());
    }
    Ok(())
}

fn dump(args: &DumpArgs) -> Result<()> {
    let data = fs::read(&args.file).with_context(|| format!("Failed to read {}", args.file.display()))?;
    let mut out = BufWriter::new(io::stdout().lock());
    tracepipe::dump::dump(&data, args.format(), &mut out)
        .with_context(|| format!("Failed to decode {}", args.file.display()))?;
    Ok(())
}

/// SIGUSR1 listener for `--on-demand`; never fires otherwise
struct ToggleSignal {
    #[cfg(unix)]
    signal: Option<tokio::signal::unix::Signal>,
}

impl ToggleSignal {
    #[cfg(unix)]
    fn new(enabled: bool) -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let signal = enabled
            .then(|| signal(SignalKind::user_defined1()))
            .transpose()
            .context("Failed to install SIGUSR1 handler")?;
        Ok(Self { signal })
    }

    #[cfg(not(unix))]
    #[allow(clippy::unnecessary_wraps)]
    fn new(_enabled: bool) -> Result<Self> {
        Ok(Self {})
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        if let Some(signal) = self.signal.as_mut() {
            signal.recv().await;
            return;
        }
        std::future::pending::<()>().await;
    }
}
