//! shell-query - asynchronous ad-hoc SQL execution against a remote engine.

use anyhow::Context;
use shell_query::app::App;
use shell_query::cli::Cli;
use shell_query::config::Config;
use shell_query::error::ShellQueryError;
use shell_query::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    match &cli.log_file {
        Some(path) => logging::init_file_logging(Some(path.clone())),
        None => logging::init_stderr_logging(),
    }

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<ShellQueryError>() {
            Some(err) => {
                error!("{}: {}", err.category(), err);
                eprintln!("{}: {}", err.category(), err);
            }
            None => {
                error!("{e:#}");
                eprintln!("Error: {e:#}");
            }
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load(&config_path)?;
    cli.apply_overrides(&mut config);

    let app = App::new(config)
        .await
        .context("Failed to initialize shell-query")?;
    let result = app.run_command(cli.command).await;
    app.close().await;
    Ok(result?)
}
