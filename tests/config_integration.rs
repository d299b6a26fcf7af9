//! Configuration integration tests
//!
//! Loads service configs from disk and checks they reach the replicator.

#[allow(dead_code)]
mod common;

use chunk_replicator::cluster::{ClusterState, Medium, MasterRole, Node, PlacementStrategy};
use chunk_replicator::config::ServiceConfig;
use chunk_replicator::{build_replicator, ReplicatorError};
use common::*;
use std::time::Duration;

#[test]
fn test_load_full_config() {
    let env = TestEnv::new();
    let path = env.write_file(
        "replicator.json",
        r#"{
            "cell_tag": 2,
            "role": "primary",
            "replicator": {
                "chunk_refresh_delay": "10s",
                "chunk_refresh_period": "250ms",
                "max_chunks_per_refresh": 500,
                "job_timeout": "1m",
                "safe_online_node_count": 3,
                "safe_lost_chunk_fraction": 0.25,
                "job_throttler": { "limit": 100, "period": "1s" }
            },
            "placement": {
                "strategy": "random",
                "max_replicas_per_rack": 2,
                "max_fill_factor": 0.9
            },
            "observability": {
                "metrics_enabled": false,
                "log_level": "warn"
            }
        }"#,
    );

    let config = ServiceConfig::from_file(&path).unwrap();
    assert_eq!(config.cell_tag, 2);
    assert_eq!(config.role, MasterRole::Primary);
    assert_eq!(config.replicator.chunk_refresh_delay, Duration::from_secs(10));
    assert_eq!(config.replicator.chunk_refresh_period, Duration::from_millis(250));
    assert_eq!(config.replicator.max_chunks_per_refresh, 500);
    assert_eq!(config.replicator.job_timeout, Duration::from_secs(60));
    assert_eq!(config.replicator.safe_online_node_count, 3);
    assert_eq!(config.replicator.job_throttler.limit, Some(100));
    assert_eq!(config.placement.strategy, PlacementStrategy::Random);
    assert_eq!(config.placement.max_replicas_per_rack, 2);
    assert!(!config.observability.metrics_enabled);
    assert_eq!(config.observability.log_level, "warn");

    // Unset fields keep their defaults.
    assert_eq!(config.replicator.replication_priority_count, 3);
}

#[test]
fn test_invalid_placement_is_rejected() {
    let env = TestEnv::new();
    let path = env.write_file(
        "replicator.json",
        r#"{ "placement": { "max_replicas_per_rack": 0 } }"#,
    );

    assert!(matches!(
        ServiceConfig::from_file(&path),
        Err(ReplicatorError::InvalidConfig { .. })
    ));
}

#[test]
fn test_missing_file() {
    let env = TestEnv::new();
    let path = env.temp_dir.path().join("absent.json");
    assert!(matches!(
        ServiceConfig::from_file(&path),
        Err(ReplicatorError::Config(_))
    ));
}

#[test]
fn test_loaded_config_drives_replicator() {
    let env = TestEnv::new();
    let path = env.write_file(
        "replicator.json",
        r#"{
            "cell_tag": 1,
            "replicator": { "chunk_refresh_delay": "0s" },
            "placement": { "max_replicas_per_rack": 1 }
        }"#,
    );
    let config = ServiceConfig::from_file(&path).unwrap();

    // Two racks only: a third replica cannot be placed safely.
    let mut state = ClusterState::new(config.cell_tag);
    state.register_medium(Medium::new(DEFAULT, "default")).unwrap();
    for id in 1..=4u64 {
        state
            .insert_node(
                Node::new(id, format!("10.0.0.{}:9012", id))
                    .with_rack((id % 2) as u32)
                    .with_fill_factor(DEFAULT, 0.3),
            )
            .unwrap();
    }

    let replicator = build_replicator(&config, state);
    let mut replicator = replicator.lock();
    assert_eq!(replicator.config().chunk_refresh_delay, Duration::ZERO);

    let id = add_regular_chunk(&mut replicator, 3, &[1]);
    replicator.on_refresh();
    enable(&mut replicator);

    let result = replicator.schedule_jobs(1, &[]).unwrap();
    assert_eq!(result.jobs_to_start.len(), 1);
    let job = &result.jobs_to_start[0];
    assert_eq!(job.chunk.id, id);
    assert_eq!(job.targets.len(), 1);
    // Node 1 sits in rack 1; the only target must come from rack 0.
    assert_eq!(job.targets[0].node % 2, 0);
}
