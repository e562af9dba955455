use std::process::ExitCode;

use clap::Parser;
use mumble_cli::cli::{Args, program_name};
use mumble_cli::config::{ClientOptions, log_filter};
use mumble_cli::runtime;
use tracing_subscriber::EnvFilter;
use voice_bridge::AUDIO_LOG_ENV;

fn main() -> ExitCode {
    let prog = program_name(&std::env::args().next().unwrap_or_default());
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let rust_log = std::env::var("RUST_LOG").ok();
    let audio_log = std::env::var(AUDIO_LOG_ENV).ok();
    let filter = log_filter(rust_log.as_deref(), audio_log.as_deref());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{prog}: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    if args.list_devices {
        return voice_bridge::list_devices();
    }
    let options = ClientOptions::from_args(args)?;
    runtime::run(options)
}
