//! The `mimir` binary

// Fatal errors are reported on stderr before tracing may be initialized
#![allow(clippy::print_stderr)]

use mimir_daemon::cli;
use mimir_daemon::commands;
use mimir_daemon::error::{DaemonError, EXIT_FAILED, EXIT_OK};
use mimir_daemon::tracing::{TracingConfig, init_tracing};
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = cli::parse();

    if let Err(e) = init_tracing(TracingConfig {
        format: cli.format,
        level: cli.level.into(),
        filter: None,
    }) {
        return report(e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Fatal error: Failed to create tokio runtime: {e}");
            return ExitCode::from(EXIT_FAILED);
        }
    };

    match runtime.block_on(commands::execute(cli)) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => report(e),
    }
}

fn report(err: DaemonError) -> ExitCode {
    let code = err.exit_code();
    eprintln!("{:?}", miette::Report::new(err));
    ExitCode::from(code)
}
