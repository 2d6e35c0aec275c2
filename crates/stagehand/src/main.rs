use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod ui;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let parsed = cli::Cli::parse();

    // Dispatch to CLI handler and handle special exit codes
    match parsed.dispatch().await {
        Ok(()) => Ok(()),
        Err(err) => {
            // The JSON result is already on stdout; exit code 2 marks a failed preview
            if let Some(failed) = err.downcast_ref::<commands::preview::PreviewFailedExit>() {
                eprintln!("Error: {}", failed);
                std::process::exit(2);
            }

            // For all other errors, return them normally
            Err(err)
        }
    }
}
