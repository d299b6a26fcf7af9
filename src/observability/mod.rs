//! Observability for the replicator.
//!
//! Provides logging and Prometheus metrics.

use crate::config::ObservabilityConfig;
use crate::error::{ReplicatorError, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| ReplicatorError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| ReplicatorError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Install the Prometheus recorder and serve `/metrics` on `metrics_addr`.
/// Must be called from within a tokio runtime.
pub fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(config.metrics_addr)
        .install()
        .map_err(|e| ReplicatorError::Internal(format!("Failed to install metrics exporter: {}", e)))?;

    register_metrics();
    info!(addr = %config.metrics_addr, "Metrics exporter listening");
    Ok(())
}

const JOB_KINDS: [&str; 4] = ["replicate", "remove", "repair", "seal"];

/// Register replicator metrics so they are exported before the first update.
pub fn register_metrics() {
    // Index sets
    gauge!("replicator_lost_chunks").set(0.0);
    gauge!("replicator_lost_vital_chunks").set(0.0);
    gauge!("replicator_overreplicated_chunks").set(0.0);
    gauge!("replicator_underreplicated_chunks").set(0.0);
    gauge!("replicator_unsafely_placed_chunks").set(0.0);
    gauge!("replicator_quorum_missing_chunks").set(0.0);
    gauge!("replicator_data_missing_chunks").set(0.0);
    gauge!("replicator_parity_missing_chunks").set(0.0);
    gauge!("replicator_precarious_chunks").set(0.0);
    gauge!("replicator_precarious_vital_chunks").set(0.0);

    // Queues
    gauge!("replicator_refresh_queue_size").set(0.0);
    gauge!("replicator_properties_update_queue_size").set(0.0);
    gauge!("replicator_repair_queue_size").set(0.0);

    // Jobs
    gauge!("replicator_jobs").set(0.0);
    gauge!("replicator_enabled").set(0.0);
    for kind in JOB_KINDS {
        counter!("replicator_jobs_started_total", "kind" => kind).absolute(0);
        counter!("replicator_jobs_completed_total", "kind" => kind).absolute(0);
        counter!("replicator_jobs_failed_total", "kind" => kind).absolute(0);
        counter!("replicator_jobs_aborted_total", "kind" => kind).absolute(0);
        counter!("replicator_jobs_timed_out_total", "kind" => kind).absolute(0);
    }
    counter!("replicator_jobs_missing_total").absolute(0);
}
