use anyhow::{Context, Result};
use std::sync::Arc;
use telematics_uplink::config::Config;
use telematics_uplink::http;
use telematics_uplink::sensors::SensorTable;
use telematics_uplink::storage::controller::{run_controller, ControllerConfig};
use telematics_uplink::storage::engine::{EngineConfig, StorageEngine};
use telematics_uplink::transport::HttpTransport;
use telematics_uplink::uplink::{UplinkConfig, UploadCoordinator};

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telematics_uplink=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let sensors = SensorTable::load(&config.sensor_table_path)
        .with_context(|| format!("load {}", config.sensor_table_path.display()))?;

    let (engine, report) = StorageEngine::open(EngineConfig::from(&config), sensors)
        .context("open storage engine")?;
    let engine = Arc::new(engine);
    tracing::info!(
        recovered_records = report.total_records(),
        quarantined_sectors = report.total_quarantined(),
        "recovery complete"
    );

    let controller_engine = engine.clone();
    let controller_cfg = ControllerConfig::from(&config);
    let controller_handle = tokio::spawn(async move {
        run_controller(controller_engine, controller_cfg).await;
    });

    let transport = Arc::new(HttpTransport::new(config.uplink_endpoint.clone()));
    let uplink = UploadCoordinator::new(engine.clone(), transport, UplinkConfig::from(&config))
        .context("init upload coordinator")?;
    let uplink_stats = uplink.stats();
    let uplink_handle = tokio::spawn(uplink.run());

    let app = http::router(http::HttpState {
        engine: engine.clone(),
        uplink_stats,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("bind {}", config.http_bind))?;
    tracing::info!(bind = %config.http_bind, "telematics-uplink HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {}
    }

    // Cooperative shutdown: producers stop accepting, the uploader gets one
    // request timeout to resolve an in-flight packet, sidecars are flushed.
    engine.begin_shutdown();
    engine.pressure().notify_one();
    let drain = config.upload_request_timeout + config.uploader_poll_interval * 2;
    if tokio::time::timeout(drain, uplink_handle).await.is_err() {
        tracing::warn!("uploader did not drain in time");
    }
    controller_handle.abort();
    if let Err(err) = engine.flush() {
        tracing::warn!(error = %err, "failed to flush sidecars at shutdown");
    }
    tracing::info!("shutdown complete");

    Ok(())
}
