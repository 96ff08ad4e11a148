// ABOUTME: CLI entry point for force-replicator
// ABOUTME: Loads configuration, logs in, connects the store and runs one replication pass

use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Password};
use force_replicator::config::{ReplicatorConfig, SourceConfig, DEFAULT_CONFIG_FILE};
use force_replicator::remote::client::LoginRejected;
use force_replicator::remote::{BulkExtractor, PollSettings, SalesforceClient};
use force_replicator::store::{Dialect, MySqlStore, PostgresStore, RelationalStore};
use force_replicator::sync::{Replicator, RunContext, SyncStats};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "force-replicator")]
#[command(about = "Incrementally replicate Salesforce objects into MySQL or PostgreSQL", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (JSON, or TOML when the extension is .toml)
    #[arg(long, short = 'c', env = "FORCE_REPLICATOR_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log: String,
    /// Continue with the next object when one object fails
    #[arg(long, default_value_t = false)]
    keep_going: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = ReplicatorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let client = login(&config.source).await?;
    tracing::info!("Connected to {}", client.instance_url());
    let extractor = BulkExtractor::new(client, PollSettings::from(&config.source));
    let context = RunContext::from_config(&config).keep_going(cli.keep_going);

    let stats = match config.store.dialect {
        Dialect::Mysql => {
            let store = MySqlStore::connect(&config.store).await?;
            replicate(context, extractor, store).await?
        }
        Dialect::Postgres => {
            let store = PostgresStore::connect(&config.store).await?;
            replicate(context, extractor, store).await?
        }
    };

    tracing::info!(
        "Replication finished in {}ms: {} object(s) synced, {} without new data, {} row(s)",
        stats.duration_ms,
        stats.objects_synced,
        stats.objects_without_data,
        stats.rows_synced
    );

    if !stats.is_success() {
        for error in &stats.errors {
            tracing::error!("{}", error);
        }
        anyhow::bail!("{} object(s) failed to sync", stats.errors.len());
    }

    Ok(())
}

async fn replicate<S: RelationalStore>(
    context: RunContext,
    extractor: BulkExtractor<SalesforceClient>,
    store: S,
) -> Result<SyncStats> {
    let mut replicator = Replicator::new(context, extractor, store);
    replicator.run().await
}

/// Log in with the configured password, or prompt until the login succeeds.
async fn login(source: &SourceConfig) -> Result<SalesforceClient> {
    let endpoint = source.login_endpoint();

    if let Some(pass) = &source.pass {
        return SalesforceClient::login(&endpoint, &source.user, pass, &source.api_version).await;
    }

    loop {
        let pass = Password::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Password for {}", source.user))
            .interact()
            .context("Password prompt cancelled")?;

        match SalesforceClient::login(&endpoint, &source.user, &pass, &source.api_version).await {
            Ok(client) => return Ok(client),
            Err(e) if e.downcast_ref::<LoginRejected>().is_some() => {
                println!("{}", e);
            }
            Err(e) => return Err(e),
        }
    }
}
