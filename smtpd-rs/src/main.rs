use smtpd_rs::cluster::ClusterManager;
use smtpd_rs::config::Config;
use smtpd_rs::smtp::SmtpServer;
use smtpd_rs::storage::MemoryStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = if std::path::Path::new("config.toml").exists() {
        Config::from_file("config.toml")?
    } else {
        Config::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }

    info!("Starting smtpd-rs");
    info!("  SMTP listening on: {}", config.server.listen_addr);
    info!("  Server name: {}", config.server.server_name);
    info!("  Max message size: {} bytes", config.limits.max_message_size);

    if config.cluster.enabled {
        info!("  Cluster transport on: {}", config.cluster.bind_addr);
        let manager = ClusterManager::new(config.cluster.clone());
        manager.start().await?;
    }

    let store = Arc::new(MemoryStore::new());
    let server = SmtpServer::new(config, store)?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
