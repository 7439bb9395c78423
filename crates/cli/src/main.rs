use std::process::ExitCode;

use clap::Parser;
use queuectl_cli::cli::Args;

// Workers are single-threaded; one runtime flavour serves every command.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    match queuectl_cli::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
