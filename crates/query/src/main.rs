//! Ad-hoc MTA-STS policy resolver (spec.md §6: `mta-sts-query <domain>
//! [<known_version>]`), grounded in
//! `examples/original_source/postfix_mta_sts_resolver/__main__.py`.

use std::process::ExitCode;

use clap::Parser;
use mta_sts_daemon::log::LogLevel;
use mta_sts_daemon::resolver::STSResolver;

#[derive(Parser)]
#[command(name = "mta-sts-query", about = "Resolve a domain's MTA-STS policy")]
struct Args {
    /// Logging verbosity.
    #[arg(short = 'v', long, value_enum, default_value_t = LogLevel::Warn)]
    verbosity: LogLevel,

    /// Domain to fetch the MTA-STS policy for.
    domain: String,

    /// Latest known policy id, to exercise change detection.
    known_version: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::from(args.verbosity))
        .init();

    let resolver = match STSResolver::new(4.0) {
        Ok(resolver) => resolver,
        Err(err) => {
            eprintln!("could not build resolver: {err}");
            return ExitCode::FAILURE;
        }
    };

    let (status, policy) = resolver
        .resolve(&args.domain, args.known_version.as_deref())
        .await;

    println!("{status:?} {policy:?}");
    ExitCode::SUCCESS
}
