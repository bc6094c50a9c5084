use crate::buffer::{EventBufferConfig, OfflineEventBuffer};
use crate::domain::{
    BackgroundSessionRelay, EventFactory, HttpSessionRelayClient, MediaUploaderConfig,
    PresignedMediaUploader, ProcessingLoop, SessionRelayConfig, SessionRelayWorker,
    SessionServices, RELAY_QUEUE_CAPACITY,
};
use crate::http::ReqwestHttpTransport;
use crate::mqtt::{run_broker_loop, BrokerClient, BrokerClientConfig, RumqttcTransport};
use crate::store::SqliteProcessedMarkerStore;
use anyhow::Context;
use common::domain::{CaptureSource, ProcessedMarkerStore, Qos, StationIdentity};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Long-running process handed to the runner
pub type RelayProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub struct EdgeRelayConfig {
    pub identity: StationIdentity,
    pub qos: Qos,
    pub broker: BrokerClientConfig,
    pub buffer: EventBufferConfig,
    pub http_timeout: Duration,
    pub media: MediaUploaderConfig,
    pub session_relay: SessionRelayConfig,
    pub state_db_path: PathBuf,
    /// Period of the `device.status` heartbeat, `None` disables it
    pub status_interval: Option<Duration>,
}

/// The device-side relay: broker connection, session relay worker and the
/// processing loop over one capture source
pub struct EdgeRelay {
    broker: Arc<BrokerClient>,
    transport: Arc<RumqttcTransport>,
    broker_config: BrokerClientConfig,
    processing_loop: ProcessingLoop,
    relay_worker: SessionRelayWorker,
    status_interval: Option<Duration>,
}

impl EdgeRelay {
    /// `source` builds the capture source over the relay's processed-marker
    /// store, so sources can skip captures that were already handled.
    pub fn new<S>(config: EdgeRelayConfig, source: S) -> anyhow::Result<Self>
    where
        S: FnOnce(Arc<dyn ProcessedMarkerStore>) -> Box<dyn CaptureSource>,
    {
        info!(
            station_id = %config.identity.station_id,
            device_id = %config.identity.device_id,
            "Initializing edge relay"
        );

        let factory = EventFactory::new(config.identity, config.qos);
        let buffer = Arc::new(OfflineEventBuffer::new(config.buffer));
        let transport = Arc::new(RumqttcTransport::new(config.broker.publish_timeout));
        let broker = Arc::new(BrokerClient::new(
            transport.clone(),
            buffer,
            factory.clone(),
        ));

        let http = Arc::new(
            ReqwestHttpTransport::new(config.http_timeout).context("failed to build HTTP client")?,
        );
        let uploader = Arc::new(PresignedMediaUploader::new(http.clone(), config.media));
        let relay_client = Arc::new(HttpSessionRelayClient::new(http, config.session_relay));
        let (relay, relay_worker) = BackgroundSessionRelay::new(relay_client, RELAY_QUEUE_CAPACITY);

        let markers: Arc<dyn ProcessedMarkerStore> = Arc::new(
            SqliteProcessedMarkerStore::open(&config.state_db_path)
                .context("failed to open processed marker store")?,
        );

        let processing_loop = ProcessingLoop::new(
            source(Arc::clone(&markers)),
            markers,
            SessionServices {
                factory,
                publisher: broker.clone(),
                uploader,
                relay: Arc::new(relay),
            },
        );

        info!("Edge relay initialized");

        Ok(Self {
            broker,
            transport,
            broker_config: config.broker,
            processing_loop,
            relay_worker,
            status_interval: config.status_interval,
        })
    }

    pub fn broker(&self) -> Arc<BrokerClient> {
        Arc::clone(&self.broker)
    }

    pub fn into_runner_processes(self) -> Vec<(&'static str, RelayProcess)> {
        let mut processes: Vec<(&'static str, RelayProcess)> = vec![
            (
                "broker_loop",
                Box::new({
                    let broker = Arc::clone(&self.broker);
                    let transport = self.transport;
                    let config = self.broker_config;
                    move |ctx| Box::pin(run_broker_loop(broker, transport, config, ctx))
                }),
            ),
            (
                "processing_loop",
                Box::new({
                    let processing_loop = self.processing_loop;
                    move |ctx| Box::pin(async move { processing_loop.run(ctx).await })
                }),
            ),
            (
                "session_relay",
                Box::new({
                    let worker = self.relay_worker;
                    move |ctx| Box::pin(async move { worker.run(ctx).await })
                }),
            ),
        ];

        if let Some(interval) = self.status_interval {
            let broker = self.broker;
            processes.push((
                "status_heartbeat",
                Box::new(move |ctx| Box::pin(run_status_heartbeat(broker, interval, ctx))),
            ));
        }

        processes
    }
}

/// Periodic `device.status` heartbeat through the publish-or-buffer path
pub async fn run_status_heartbeat(
    broker: Arc<BrokerClient>,
    interval: Duration,
    ctx: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = broker.publish_heartbeat().await {
                    warn!(error = %e, "failed to emit status heartbeat");
                }
            }
        }
    }

    debug!("status heartbeat stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RetryPolicy;
    use async_trait::async_trait;
    use common::domain::{CaptureRecord, DomainResult};
    use tempfile::TempDir;

    struct NoCaptures;

    #[async_trait]
    impl CaptureSource for NoCaptures {
        async fn next_capture(&mut self) -> DomainResult<Option<CaptureRecord>> {
            Ok(None)
        }
    }

    fn config(dir: &TempDir, status_interval: Option<Duration>) -> EdgeRelayConfig {
        let retry = RetryPolicy::new(1, Duration::ZERO, Duration::ZERO);
        EdgeRelayConfig {
            identity: StationIdentity {
                tenant_id: "t1".to_string(),
                farm_id: "f1".to_string(),
                barn_id: "b1".to_string(),
                station_id: "st1".to_string(),
                device_id: "d1".to_string(),
            },
            qos: Qos::AtLeastOnce,
            broker: BrokerClientConfig::default(),
            buffer: EventBufferConfig {
                path: dir.path().join("events.jsonl"),
                replay_throttle: 0.0,
                replay_backoff_ms: 0,
            },
            http_timeout: Duration::from_secs(1),
            media: MediaUploaderConfig {
                media_store_url: "http://media.local".to_string(),
                retry: retry.clone(),
            },
            session_relay: SessionRelayConfig {
                session_api_url: "http://api.local".to_string(),
                retry,
            },
            state_db_path: dir.path().join("state.db"),
            status_interval,
        }
    }

    #[test]
    fn test_processes_without_heartbeat() {
        let dir = TempDir::new().unwrap();
        let relay = EdgeRelay::new(config(&dir, None), |_| Box::new(NoCaptures)).unwrap();

        let names: Vec<&str> = relay
            .into_runner_processes()
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        assert_eq!(names, vec!["broker_loop", "processing_loop", "session_relay"]);
    }

    #[test]
    fn test_heartbeat_process_is_optional() {
        let dir = TempDir::new().unwrap();
        let relay = EdgeRelay::new(
            config(&dir, Some(Duration::from_secs(30))),
            |_| Box::new(NoCaptures),
        )
        .unwrap();

        let processes = relay.into_runner_processes();
        assert_eq!(processes.len(), 4);
        assert_eq!(processes[3].0, "status_heartbeat");
    }

    #[tokio::test]
    async fn test_heartbeat_buffers_while_offline() {
        let dir = TempDir::new().unwrap();
        let relay = EdgeRelay::new(config(&dir, None), |_| Box::new(NoCaptures)).unwrap();
        let broker = relay.broker();
        let ctx = CancellationToken::new();

        let handle = tokio::spawn(run_status_heartbeat(
            Arc::clone(&broker),
            Duration::from_millis(20),
            ctx.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(120)).await;
        ctx.cancel();
        handle.await.unwrap().unwrap();

        assert!(!broker.is_connected());
        assert!(broker.buffer().size().await.unwrap() >= 1);
    }
}
