//! Node autoscaler for Magnum clusters
//!
//! Registers the cluster's node groups, keeps them in sync with the cloud,
//! serves probes and metrics, and optionally runs the vertical recommender.

use anyhow::{Context, Result};
use clap::Parser;
use autoscaler_lib::{
    api::{self, AppState},
    cloudprovider::{CloudProvider, HeatAdapter, NativeAdapter, ProviderAdapter},
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    openstack::{client::http_client, CloudConfig, KeystoneAuth, OpenStackClient},
    recommender::{
        checkpoint::CheckpointWriter,
        input::{oom_channel, ClusterFeeder},
        FileCheckpointStore, RecommenderRoutine, SnapshotSource,
    },
    ReconcileLoop,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{Args, AutoscalerConfig, ProviderKind};

const AUTOSCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capacity of the OOM event channel
const OOM_CHANNEL_CAPACITY: usize = 1024;

async fn connect(
    config: &AutoscalerConfig,
    client: &Arc<OpenStackClient>,
) -> Result<Arc<dyn ProviderAdapter>> {
    let cluster = &config.cluster_name;
    let adapter: Arc<dyn ProviderAdapter> = match config.provider {
        ProviderKind::Native => {
            let adapter = NativeAdapter::connect(cluster, client.clone(), client.clone(), client.clone())
                .await
                .with_context(|| format!("Failed to resolve cluster {}", cluster))?;
            client.set_cluster(adapter.cluster_id());
            Arc::new(adapter)
        }
        ProviderKind::Heat => {
            let adapter = HeatAdapter::connect(cluster, client.clone(), client.clone(), config.heat_settings())
                .await
                .with_context(|| format!("Failed to resolve cluster {}", cluster))?;
            client.set_cluster(adapter.cluster_id());
            Arc::new(adapter)
        }
    };
    Ok(adapter)
}

async fn recommender(
    config: &AutoscalerConfig,
    logger: &StructuredLogger,
) -> Result<Option<RecommenderRoutine>> {
    let Some(snapshot) = config.recommender_snapshot.as_ref().filter(|_| config.recommender_enabled) else {
        return Ok(None);
    };

    let store = FileCheckpointStore::new(&config.recommender.checkpoint_dir)
        .await
        .context("Failed to open checkpoint directory")?;
    // OOM kills reported by the exporter reach the feeder through the channel.
    let (oom_tx, oom_rx) = oom_channel(OOM_CHANNEL_CAPACITY);
    let source = Arc::new(
        SnapshotSource::new(snapshot, config.recommendations_dir.clone()).with_oom_events(oom_tx),
    );
    let feeder = ClusterFeeder::new(
        source.clone(),
        source,
        oom_rx,
        CheckpointWriter::new(Arc::new(store)),
        config.recommender.clone(),
    );

    let mut routine = RecommenderRoutine::new(feeder, config.recommender.clone(), logger.clone());
    match routine.initialize().await {
        Ok(loaded) => info!(checkpoints = loaded, "Loaded recommender checkpoints"),
        Err(e) => warn!(error = %e, "Failed to load recommender checkpoints"),
    }
    Ok(Some(routine))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = AutoscalerConfig::load(&args)?;
    info!(cluster = %config.cluster_name, provider = %config.provider, "Autoscaler configured");

    let health = HealthRegistry::new(config.max_inactivity());
    health.register(components::PROVIDER).await;
    health.register(components::DISCOVERY).await;
    if config.recommender_enabled {
        health.register(components::RECOMMENDER).await;
        health.register(components::CHECKPOINTS).await;
    }

    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(AUTOSCALER_VERSION, &config.provider.to_string());

    // Probes are served while the provider initializes.
    let state = Arc::new(AppState::new(health.clone()));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, state.clone()));

    let cloud = CloudConfig::load(&config.cloud_config)?;
    let http = http_client(cloud.global.ca_file.as_deref())?;
    let auth = Arc::new(KeystoneAuth::new(http.clone(), cloud));
    let client = Arc::new(OpenStackClient::new(http, auth, &config.cluster_name));

    let adapter = connect(&config, &client).await?;
    let provider = Arc::new(
        CloudProvider::initialize(adapter, config.discovery_mode()?, config.engine_settings())
            .await
            .context("Failed to register node groups")?,
    );
    state.set_provider(provider.clone());

    let mut builder = ReconcileLoop::builder()
        .provider(provider)
        .health(health.clone())
        .scan_interval(config.scan_interval());
    if let Some(routine) = recommender(&config, &logger).await? {
        builder = builder.recommender(routine, config.recommender.metrics_fetcher_interval());
    }
    let reconcile = builder.build()?;

    health.set_ready(true).await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let loop_handle = tokio::spawn(reconcile.run(shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut api_handle => {
            let reason = match result {
                Ok(Ok(())) => "API server stopped".to_string(),
                Ok(Err(e)) => format!("API server failed: {}", e),
                Err(e) => format!("API server task failed: {}", e),
            };
            error!(reason = %reason, "Stopping");
            logger.log_shutdown(&reason);
        }
    }

    let _ = shutdown_tx.send(());
    loop_handle.await.context("Reconcile loop panicked")?;
    info!("Shutting down");
    Ok(())
}
