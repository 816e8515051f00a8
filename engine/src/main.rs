// Bulwark plugin host
// Main entry point for the bulwark binary

use anyhow::Context;
use bulwark_engine::cli::{Cli, Command, PluginAction, TrustAction};
use bulwark_engine::config::Config;
use bulwark_engine::handlers::{
    handle_plugins_install, handle_plugins_list, handle_plugins_load_all, handle_plugins_verify,
    handle_trust_add, handle_trust_list, handle_trust_remove, OutputFormat,
};
use bulwark_engine::telemetry::init_telemetry_with_level;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_config_path()?,
    };
    let mut config = if cli.config.is_some() {
        Config::load_from_path(&config_path)
    } else {
        Config::load_or_create()
    }
    .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    // --log wins over the config file; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    tracing::debug!("Bulwark v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Plugins { action } => match action {
            PluginAction::List => handle_plugins_list(&config, format).await,
            PluginAction::LoadAll => handle_plugins_load_all(&config, format).await,
            PluginAction::Verify { dir } => handle_plugins_verify(&dir, &config, format).await,
            PluginAction::Install { source } => {
                handle_plugins_install(&source, &config, format).await
            }
        },

        Command::Trust { action } => match action {
            TrustAction::List => handle_trust_list(&config, format),
            TrustAction::Add {
                thumbprint,
                official,
            } => handle_trust_add(&thumbprint, official, &mut config, &config_path),
            TrustAction::Remove { thumbprint } => {
                handle_trust_remove(&thumbprint, &mut config, &config_path)
            }
        },
    }
}
