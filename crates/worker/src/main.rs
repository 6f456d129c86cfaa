//! Emission worker process.
//!
//! Run one per host (or several); claims are exclusive across processes.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use shopdesk_infra::cipher::SecretCipher;
use shopdesk_infra::config::AppConfig;
use shopdesk_infra::gateway::GatewayAdapter;
use shopdesk_infra::jobs::Worker;
use shopdesk_infra::postgres::PostgresBackend;
use shopdesk_infra::storage::build_artifact_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    shopdesk_observability::init(config.log_format);
    info!(config = ?config, "starting emission worker");

    let url = config.require_database_url()?;
    let backend = Arc::new(
        PostgresBackend::connect(url, config.database.max_connections)
            .await
            .context("failed to connect to Postgres")?,
    );
    backend.migrate().await.context("failed to run migrations")?;

    let artifacts = build_artifact_store(&config.storage)
        .await
        .context("failed to initialise artifact storage")?;
    let cipher = match config.cipher_key.as_deref() {
        Some(material) => Some(Arc::new(SecretCipher::from_config(Some(material))?)),
        None => {
            warn!("CERT_ENCRYPTION_KEY not set; issuers with stored certificates will fail");
            None
        }
    };
    let gateway = Arc::new(GatewayAdapter::from_settings(&config.provider, artifacts, cipher)?);
    let worker = Worker::new(backend.clone(), backend, gateway, &config.worker);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested, finishing current job");
        let _ = shutdown_tx.send(true);
    });

    let stats = worker.run(shutdown_rx).await;
    info!(stats = ?stats, "emission worker exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
