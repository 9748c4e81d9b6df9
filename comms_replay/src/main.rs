use clap::Parser;
use tracing_subscriber::EnvFilter;

use comms_replay::config::Opts;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    comms_replay::driver::run(opts).await
}
