use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;

use clap::Parser;

use finpulse_cli::{Args, execute};

fn main() -> ExitCode {
    finpulse_observability::init();

    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            return ExitCode::from(1);
        }
    };

    // A panic that escapes the runner is still a crash: exit 1, not 101.
    let result = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(execute(args))));

    match result {
        Ok(Ok(code)) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Ok(Err(e)) => {
            tracing::error!(error = ?e, "etl-daily crashed");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
        Err(_) => {
            tracing::error!("etl-daily panicked");
            ExitCode::from(1)
        }
    }
}
