#![allow(missing_docs)]
#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use market_store::application::{HistorySync, OrderSync};
use market_store::domain::MarketStore;
use market_store::infrastructure::logging::{init_logging_with_config, log_system_info};
use market_store::infrastructure::sso::SsoCredentials;
use market_store::infrastructure::{
    AppConfig, ConfigManager, DatabaseConnection, EsiClient, SecretManager, SqliteStore, SsoTokenCache,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional explicit config file as the only argument
    let config_manager = match std::env::args().nth(1) {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = config_manager.load_config().await?;

    init_logging_with_config(&config.logging).context("Failed to initialize logging")?;
    log_system_info();
    info!("⚙️ Configuration loaded from {:?}", config_manager.config_path());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 Interrupted, cancelling refresh");
                cancel.cancel();
            }
        });
    }

    if let Err(e) = refresh(&config, &cancel).await {
        error!("❌ Refresh failed: {:#}", e);
        return Err(e);
    }
    info!("🎉 Refresh complete");
    Ok(())
}

async fn esi_client(config: &AppConfig) -> Result<EsiClient> {
    let client = EsiClient::new(&config.esi)?;
    let Some(path) = &config.secrets_path else {
        return Ok(client);
    };

    let secrets = SecretManager::load(path)
        .await
        .with_context(|| format!("Failed to load secrets from {:?}", path))?;
    let credentials = SsoCredentials::from_secrets(&secrets).context("SSO secrets are incomplete")?;
    let sso = SsoTokenCache::new(&config.esi.login_url, &config.esi.user_agent, credentials);
    info!("🔑 SSO credentials loaded");
    Ok(client.with_sso(Arc::new(sso)))
}

/// Orders, then the active work set, then regional and global histories
async fn refresh(config: &AppConfig, cancel: &CancellationToken) -> Result<()> {
    let database = DatabaseConnection::with_max_connections(
        &config.database.database_url()?,
        config.database.max_connections,
    )
    .await?;
    database.migrate().await.context("Failed to migrate database")?;

    let store: Arc<dyn MarketStore> = Arc::new(SqliteStore::new(
        database.pool().clone(),
        config.database.operation_timeout(),
    ));
    let client = esi_client(config).await?;

    let orders = OrderSync::new(client.clone(), store.clone(), config.orders.clone())
        .download(cancel)
        .await
        .context("Order download failed")?;
    info!(
        "📦 {} orders from {} regions, {} new markets",
        orders.orders, orders.regions, orders.new_markets
    );

    let history = HistorySync::new(client, store, config.history.clone());
    history.download(cancel).await.context("History download failed")?;
    history
        .compute_global_histories(cancel)
        .await
        .context("Global history pass failed")?;
    Ok(())
}
