mod cli;
mod config;
mod error;
mod model;
mod providers;
mod scheduler;
mod store;
mod sync;
mod util;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = cli::parse_command(&args)?;
    cli::execute(command).await
}
