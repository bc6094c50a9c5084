mod config;

use common::domain::{Qos, StationIdentity};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use crate::config::ServiceConfig;
use edge_relay::buffer::EventBufferConfig;
use edge_relay::capture::{DirectoryCaptureSource, DirectoryPollConfig};
use edge_relay::domain::{MediaUploaderConfig, RetryPolicy, SessionRelayConfig};
use edge_relay::mqtt::BrokerClientConfig;
use edge_relay::{EdgeRelay, EdgeRelayConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};
use weighvision_runner::Runner;

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
    }) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        station_id = %config.station_id,
        device_id = %config.device_id,
        otel_enabled = config.otel_enabled,
        "Starting weighvision-edge"
    );
    debug!("Configuration: {:?}", config);

    let relay_config = match build_relay_config(&config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Invalid relay configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let poll = DirectoryPollConfig {
        capture_dir: PathBuf::from(&config.capture_dir),
        poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        stability_threshold_kg: config.weight_stability_threshold,
    };

    let edge_relay = match EdgeRelay::new(relay_config, move |markers| {
        Box::new(DirectoryCaptureSource::new(poll).with_markers(markers))
    }) {
        Ok(relay) => relay,
        Err(e) => {
            error!("Failed to initialize edge relay: {:#}", e);
            std::process::exit(1);
        }
    };

    let mut runner = Runner::new();
    for (name, process) in edge_relay.into_runner_processes() {
        runner = runner.with_named_process(name, process);
    }

    runner = runner
        .with_closer(move || async move {
            info!("Running cleanup tasks...");
            shutdown_telemetry(telemetry_providers);
            info!("Cleanup complete");
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10));

    runner.run().await;
}

fn build_relay_config(config: &ServiceConfig) -> anyhow::Result<EdgeRelayConfig> {
    let qos = Qos::from_u8(config.mqtt_qos)?;
    let broker_urls = config.broker_urls();
    if broker_urls.is_empty() {
        anyhow::bail!("WEIGHVISION_MQTT_BROKER_URLS lists no endpoints");
    }

    let retry = RetryPolicy::new(
        config.max_retries.max(1),
        Duration::from_millis(config.retry_base_delay_ms),
        Duration::from_millis(config.retry_max_delay_ms),
    );

    Ok(EdgeRelayConfig {
        identity: StationIdentity {
            tenant_id: config.tenant_id.clone(),
            farm_id: config.farm_id.clone(),
            barn_id: config.barn_id.clone(),
            station_id: config.station_id.clone(),
            device_id: config.device_id.clone(),
        },
        qos,
        broker: BrokerClientConfig {
            broker_urls,
            client_id: config.mqtt_client_id.clone(),
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
            reconnect_delay: Duration::from_secs(config.mqtt_reconnect_delay_secs),
            publish_timeout: Duration::from_secs(config.mqtt_publish_timeout_secs),
            ..Default::default()
        },
        buffer: EventBufferConfig {
            path: PathBuf::from(&config.buffer_path),
            replay_throttle: config.replay_throttle,
            replay_backoff_ms: config.replay_backoff_ms,
        },
        http_timeout: Duration::from_secs(config.http_timeout_secs),
        media: MediaUploaderConfig {
            media_store_url: config.media_store_url.clone(),
            retry: retry.clone(),
        },
        session_relay: SessionRelayConfig {
            session_api_url: config.session_api_url.clone(),
            retry,
        },
        state_db_path: PathBuf::from(&config.state_db_path),
        status_interval: (config.status_interval_secs > 0)
            .then(|| Duration::from_secs(config.status_interval_secs)),
    })
}
