//! `mta-sts-daemon`: a Postfix socketmap responder for RFC 8461 MTA-STS
//! policies (spec.md §6 CLI surface).
//!
//! Grounded in
//! `examples/original_source/postfix_mta_sts_resolver/daemon.py`'s
//! `main`/`amain`: construct the responder (and, if enabled, the
//! proactive fetcher), start them, wait for a shutdown signal, stop them
//! in reverse order, tear down the cache.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use mta_sts_daemon::cache::{self, Cache};
use mta_sts_daemon::log::{LogLevel, Logger};
use mta_sts_daemon::notify::Notifier;
use mta_sts_daemon::proactive::ProactiveFetcher;
use mta_sts_daemon::resolver::STSResolver;
use mta_sts_daemon::responder::Responder;
use mta_sts_daemon::zone::Zones;
use mta_sts_daemon::Config;

#[derive(Parser)]
#[command(
    name = "mta-sts-daemon",
    version,
    about = "A Postfix socketmap responder for RFC 8461 MTA-STS policies."
)]
struct Args {
    /// Configuration file location.
    #[arg(short = 'c', long = "config", value_name = "FILE", default_value = "/etc/mta-sts-daemon.yml")]
    config: PathBuf,

    /// Log file location. Logs to stderr when omitted.
    #[arg(short = 'l', long = "logfile", value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// Logging verbosity.
    #[arg(short = 'v', long = "verbosity", value_enum, default_value_t = LogLevel::Info)]
    verbosity: LogLevel,

    /// Accepted for command-line compatibility with the original tool;
    /// a no-op, since this runtime has no alternate event-loop policy to
    /// select.
    #[arg(long = "disable-uvloop")]
    disable_uvloop: bool,

    /// Validate the configuration file and exit without starting the
    /// daemon.
    #[arg(long = "check-config")]
    check_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _ = args.disable_uvloop;

    if let Err(err) = Logger::launch(args.verbosity, args.logfile.as_deref()) {
        eprintln!("mta-sts-daemon could not start logging: {err}");
        return ExitCode::FAILURE;
    }
    tracing::info!(target: "main", "MTA-STS daemon starting...");

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("mta-sts-daemon couldn't be configured: {err}");
            return ExitCode::FAILURE;
        }
    };

    if args.check_config {
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("mta-sts-daemon couldn't start tokio: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let cache = match cache::build(&config.cache).await {
        Ok(cache) => cache,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let zones = match Zones::from_config(&config) {
        Ok(zones) => zones,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let responder = Responder::new(
        zones,
        Arc::clone(&cache),
        config.cache_grace,
        config.shutdown_timeout,
    );
    if let Err(err) = responder.start(&config).await {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    tracing::info!(target: "main", "server started");

    let proactive = if config.proactive_policy_fetching.enabled {
        let resolver = match STSResolver::new(config.default_zone.timeout) {
            Ok(resolver) => resolver,
            Err(err) => {
                eprintln!("could not build proactive-fetcher resolver: {err}");
                return ExitCode::FAILURE;
            }
        };
        let fetcher = ProactiveFetcher::new(Arc::clone(&cache), resolver, &config.proactive_policy_fetching);
        fetcher.start().await;
        Some(fetcher)
    } else {
        None
    };

    let notifier = Notifier::from_env();
    notifier.notify("READY=1");

    wait_for_shutdown_signal().await;
    tracing::debug!(target: "main", "event loop interrupted, shutting down server...");
    notifier.notify("STOPPING=1");

    if let Some(proactive) = &proactive {
        proactive.stop().await;
    }
    responder.stop().await;

    if let Err(err) = cache.teardown().await {
        tracing::warn!(target: "main", error = %err, "cache teardown failed");
    }

    tracing::info!(target: "main", "server finished its work");
    ExitCode::SUCCESS
}

/// Waits for the first SIGINT/SIGTERM, then spawns a watcher for a second
/// one that force-exits immediately (spec.md §5 "a second occurrence
/// force-exits the process"; `daemon.py`'s `exit_handler`).
async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    tracing::warn!(target: "main", "got first exit signal! terminating gracefully.");

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        tracing::warn!(target: "main", "got second exit signal! terminating hard.");
        std::process::exit(1);
    });
}
