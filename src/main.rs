mod app;
mod cli;
mod telemetry;

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::from_args().into_config()?;
    telemetry::initialise(&config.log_filter, config.log_format)?;
    app::run(config).await
}
