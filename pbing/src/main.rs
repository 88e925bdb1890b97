use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use common::{InitError, Pinger};
use tokio::signal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod args;
mod classify;
mod logger;
mod render;
mod session;

use render::{OutputFormat, Renderer};
use session::Session;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = args::Opts::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(args.log_level.into())
                .from_env_lossy(),
        )
        .init();

    let format = args.format.resolve(
        std::io::stdout().is_terminal(),
        std::env::var_os("NO_COLOR").is_some(),
    );
    if format == OutputFormat::Color {
        colored::control::set_override(true);
    }

    let host = args.destination.clone().unwrap_or_default();
    let mut session = Session::new(
        Pinger::new(host),
        args.session_config(),
        Renderer::new(std::io::stdout(), format),
    );

    let canceller = session.canceller();
    tokio::spawn(async move {
        while signal::ctrl_c().await.is_ok() {
            canceller.request_stop();
        }
    });

    match session.run().await {
        Ok(outcome) => {
            debug!(phase = ?outcome.phase, probes = outcome.probes, "done")
        }
        Err(err @ InitError::Resolve { .. }) => {
            println!("ERROR: {}", err);
            println!("See 'pbing -h' for usage");
        }
        Err(err) => println!("Failed to ping target host: {}", err),
    }
    Ok(())
}
