use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use pona_plugin::add::add;
use pona_plugin::check::check;
use pona_plugin::config::{Args, Command};
use pona_plugin::delete::delete;
use pona_plugin::response::Response;
use pona_plugin::types::Input;
use pona_plugin::version::{ensure_supported, version};
use pona_plugin::{CNI_VERSION, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_DIR: &str = "/var/log/pona";

fn main() -> ExitCode {
    let _guard = setup_logging();
    let args = Args::parse();
    let resp = match args.command {
        Command::Version => version(),
        Command::Gc | Command::Status => Response::Empty,
        Command::Add | Command::Delete | Command::Check => match read_input() {
            Ok((input, stdin)) => match ensure_supported(&input) {
                Err(e) => e.into_response(input.cni_version),
                Ok(()) => match args.command {
                    Command::Add => add(&args, input, stdin),
                    Command::Delete => delete(&args, input, stdin),
                    _ => check(&args, input, stdin),
                },
            },
            Err(e) => e.into_response(CNI_VERSION),
        },
    };

    resp.write_out()
}

fn read_input() -> Result<(Input, Vec<u8>)> {
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    let input = Input::parse(&buf)?;
    Ok((input, buf))
}

fn setup_logging() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(LOG_DIR, "pona.log");
    let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pona_plugin=info,pona=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(nonblocking))
        .init();
    guard
}
