//! Control plane HTTP server and background loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use switchyard_telemetry::MetricsRegistry;

use crate::api::create_router;
use crate::certificates::{AcmeFileSource, CertificateMonitor, MonitorSettings};
use crate::config::ControlConfig;
use crate::context::OperationContext;
use crate::db::{self, ConfigStore, MemoryStore, PgStore};
use crate::discovery::{DiscoverySettings, DockerApiRuntime, ServiceDiscovery};
use crate::health::{HttpProxyProbe, NoopProbe, ProxyProbe};
use crate::plane::{ControlPlane, PlaneSettings};

/// Open the configured store, applying migrations to PostgreSQL.
pub async fn open_store(config: &ControlConfig) -> anyhow::Result<Arc<dyn ConfigStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            db::run_migrations(&pool).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
        None => {
            tracing::warn!("no database_url configured, state will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_probe(config: &ControlConfig) -> anyhow::Result<Arc<dyn ProxyProbe>> {
    match &config.proxy.health_url {
        Some(url) => Ok(Arc::new(HttpProxyProbe::new(
            url.clone(),
            config.proxy.api_url.clone(),
            config.request_timeout(),
        )?)),
        None => {
            tracing::warn!("no proxy health_url configured, publishes are not health gated");
            Ok(Arc::new(NoopProbe))
        }
    }
}

/// Run the control plane server until ctrl-c.
pub async fn run(config: ControlConfig, metrics: Arc<MetricsRegistry>) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let plane = Arc::new(ControlPlane::new(
        store.clone(),
        build_probe(&config)?,
        PlaneSettings {
            live_path: config.proxy.live_path.clone(),
            render: config.render_settings(),
            health: config.health_policy(),
            snapshot_retention: config.snapshots.retention,
        },
        metrics.clone(),
    ));

    switchyard_telemetry::log_startup!(
        live_path = %config.proxy.live_path.display(),
        persistent = config.database_url.is_some(),
        discovery = config.discovery.enabled,
        "control plane starting"
    );

    // Bring the live file in line with the stored state before taking writes.
    let ctx = OperationContext::system("startup");
    match plane.orchestrator().reconcile(&ctx).await {
        Ok(Some(report)) => tracing::info!(phase = ?report.phase, "live configuration reconciled"),
        Ok(None) => tracing::debug!("live configuration already current"),
        Err(e) => tracing::error!(error = %e, "startup reconciliation failed"),
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    if config.certificates.enabled {
        let monitor = Arc::new(CertificateMonitor::new(
            store.clone(),
            Arc::new(AcmeFileSource::new(&config.certificates.acme_path)),
            plane.orchestrator().lock_handle(),
            metrics.clone(),
            MonitorSettings {
                warning_days: config.certificates.warning_days,
                default_resolver: config
                    .proxy
                    .cert_resolver
                    .clone()
                    .unwrap_or_else(|| MonitorSettings::default().default_resolver),
            },
        ));
        let interval = Duration::from_secs(config.certificates.interval_secs);
        tokio::spawn(monitor.run(interval, shutdown_tx.subscribe()));
    }

    if config.discovery.enabled {
        let runtime = DockerApiRuntime::new(&config.discovery.endpoint, config.request_timeout())?;
        let discovery = Arc::new(ServiceDiscovery::new(
            Arc::new(runtime),
            plane.orchestrator().clone(),
            metrics.clone(),
            DiscoverySettings {
                label_prefix: config.discovery.label_prefix.clone(),
            },
        ));
        let interval = Duration::from_secs(config.discovery.interval_secs);
        tokio::spawn(discovery.run(interval, shutdown_tx.subscribe()));
    }

    let app = create_router(plane);

    let listener = TcpListener::bind(config.listen).await?;
    switchyard_telemetry::log_listening!(addr = %config.listen, "control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(());
        })
        .await?;

    Ok(())
}
