use crate::mqtt::{parse_broker_url, validate_publish_topic, BrokerClient, MqttTransport};
use async_trait::async_trait;
use common::domain::{DomainError, DomainResult, Qos};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// rumqttc rejects keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// Time allowed to flush the offline status and DISCONNECT on shutdown
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BrokerClientConfig {
    /// Ordered candidate endpoints, tried in turn until one connects
    pub broker_urls: Vec<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    /// Capacity of the client request channel
    pub request_capacity: usize,
    /// How long a publish may wait for the broker acknowledgement
    pub publish_timeout: Duration,
}

impl Default for BrokerClientConfig {
    fn default() -> Self {
        Self {
            broker_urls: vec!["mqtt://localhost:1883".to_string()],
            client_id: "weighvision-edge".to_string(),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            request_capacity: 100,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct AckState {
    closed: bool,
    /// Publish requests not yet written out, in request order
    queued: VecDeque<oneshot::Sender<()>>,
    /// Written publishes awaiting PUBACK/PUBCOMP, by packet id
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

/// Matches publish requests of one connection to the broker acknowledgements.
///
/// rumqttc writes requests in the order they were queued and reports each
/// with `Outgoing::Publish(pkid)`, so the oldest queued waiter owns the next
/// packet id. Requests are queued under the state lock, which keeps the two
/// orders identical. QoS 0 publishes (pkid 0) complete once written.
#[derive(Default)]
pub(crate) struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    /// Queue a publish on `client` and return the waiter for its acknowledgement
    fn submit(
        &self,
        client: &AsyncClient,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> DomainResult<oneshot::Receiver<()>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DomainError::Transport(anyhow::anyhow!("ack tracker poisoned")))?;
        if state.closed {
            return Err(DomainError::Transport(anyhow::anyhow!(
                "broker connection closed"
            )));
        }
        client
            .try_publish(topic, to_mqtt_qos(qos), retain, payload)
            .map_err(|e| {
                DomainError::Transport(anyhow::anyhow!("failed to publish to {}: {}", topic, e))
            })?;

        let (tx, rx) = oneshot::channel();
        state.queued.push_back(tx);
        Ok(rx)
    }

    pub(crate) fn observe(&self, event: &Event) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match event {
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                if let Some(waiter) = state.queued.pop_front() {
                    if *pkid == 0 {
                        let _ = waiter.send(());
                    } else {
                        state.in_flight.insert(*pkid, waiter);
                    }
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                if let Some(waiter) = state.in_flight.remove(&ack.pkid) {
                    let _ = waiter.send(());
                }
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                if let Some(waiter) = state.in_flight.remove(&comp.pkid) {
                    let _ = waiter.send(());
                }
            }
            _ => {}
        }
    }

    /// Fail every waiter; the connection is gone
    pub(crate) fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.queued.clear();
            state.in_flight.clear();
        }
    }
}

struct Connection {
    client: AsyncClient,
    acks: Arc<AckTracker>,
}

/// `MqttTransport` over the rumqttc client of the current connection.
///
/// A publish succeeds only once the broker acknowledged it (QoS 1 and 2) or
/// it was written to the socket (QoS 0). Anything still queued when the
/// connection drops fails, so the caller keeps its copy.
pub struct RumqttcTransport {
    connection: RwLock<Option<Connection>>,
    publish_timeout: Duration,
}

impl RumqttcTransport {
    pub fn new(publish_timeout: Duration) -> Self {
        Self {
            connection: RwLock::new(None),
            publish_timeout,
        }
    }

    pub(crate) fn attach(&self, client: AsyncClient) -> Arc<AckTracker> {
        let acks = Arc::new(AckTracker::default());
        if let Ok(mut current) = self.connection.write() {
            if let Some(previous) = current.replace(Connection {
                client,
                acks: Arc::clone(&acks),
            }) {
                previous.acks.close();
            }
        }
        acks
    }

    fn detach(&self) {
        if let Ok(mut current) = self.connection.write() {
            if let Some(previous) = current.take() {
                previous.acks.close();
            }
        }
    }

    fn current(&self) -> Option<(AsyncClient, Arc<AckTracker>)> {
        self.connection.read().ok().and_then(|connection| {
            connection
                .as_ref()
                .map(|c| (c.client.clone(), Arc::clone(&c.acks)))
        })
    }
}

#[async_trait]
impl MqttTransport for RumqttcTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> DomainResult<()> {
        validate_publish_topic(topic)?;
        let (client, acks) = self
            .current()
            .ok_or_else(|| DomainError::Transport(anyhow::anyhow!("no broker connection")))?;

        let ack = acks.submit(&client, topic, payload, qos, retain)?;

        match tokio::time::timeout(self.publish_timeout, ack).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DomainError::Transport(anyhow::anyhow!(
                "connection lost before the broker acknowledged {}",
                topic
            ))),
            Err(_) => Err(DomainError::Transport(anyhow::anyhow!(
                "publish to {} not acknowledged within {:?}",
                topic,
                self.publish_timeout
            ))),
        }
    }
}

pub fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

enum SessionEnd {
    Cancelled,
    Failed { was_connected: bool },
}

/// Run the broker network loop until cancelled.
///
/// Endpoints are tried in order. A connection that was established and then
/// dropped restarts the walk from the first endpoint; an endpoint that never
/// connected hands over to the next one.
#[instrument(name = "broker_loop", skip_all, fields(client_id = %config.client_id))]
pub async fn run_broker_loop(
    broker: Arc<BrokerClient>,
    transport: Arc<RumqttcTransport>,
    config: BrokerClientConfig,
    ctx: CancellationToken,
) -> anyhow::Result<()> {
    if config.broker_urls.is_empty() {
        anyhow::bail!("no broker endpoints configured");
    }

    info!(endpoints = ?config.broker_urls, "starting broker loop");
    let mut index = 0;

    loop {
        if ctx.is_cancelled() {
            break;
        }

        let endpoint = config.broker_urls[index % config.broker_urls.len()].clone();
        let end = match mqtt_options(&broker, &config, &endpoint) {
            Ok(options) => {
                run_connection(&broker, &transport, &config, options, &endpoint, &ctx).await
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "invalid broker endpoint");
                SessionEnd::Failed {
                    was_connected: false,
                }
            }
        };

        match end {
            SessionEnd::Cancelled => break,
            SessionEnd::Failed { was_connected } => {
                index = if was_connected { 0 } else { index + 1 };
                debug!(
                    next_endpoint = %config.broker_urls[index % config.broker_urls.len()],
                    delay = ?config.reconnect_delay,
                    "reconnecting"
                );
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = tokio::time::sleep(config.reconnect_delay) => {}
                }
            }
        }
    }

    info!("broker loop stopped");
    Ok(())
}

fn mqtt_options(
    broker: &BrokerClient,
    config: &BrokerClientConfig,
    endpoint: &str,
) -> DomainResult<MqttOptions> {
    let (host, port) = parse_broker_url(endpoint)?;
    let will = broker.last_will()?;

    let mut options = MqttOptions::new(config.client_id.clone(), host, port);
    options.set_keep_alive(config.keep_alive.max(MIN_KEEP_ALIVE));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        will.topic,
        will.envelope.encode()?,
        to_mqtt_qos(will.qos),
        will.retain,
    ));
    Ok(options)
}

#[instrument(name = "broker_connection", skip_all, fields(endpoint = %endpoint))]
async fn run_connection(
    broker: &Arc<BrokerClient>,
    transport: &Arc<RumqttcTransport>,
    config: &BrokerClientConfig,
    options: MqttOptions,
    endpoint: &str,
    ctx: &CancellationToken,
) -> SessionEnd {
    let (client, mut eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
    let acks = transport.attach(client.clone());

    let mut was_connected = false;
    let mut go_live: Option<JoinHandle<()>> = None;
    let mut recovery = tokio::time::interval(config.reconnect_delay.max(Duration::from_millis(100)));
    recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!("shutdown signal received");
                if let Some(task) = go_live.take() {
                    task.abort();
                }
                shutdown(broker, &client, &mut eventloop, &acks).await;
                transport.detach();
                return SessionEnd::Cancelled;
            }
            _ = broker.recovery_requested(), if was_connected => {
                go_live = restart_go_live(broker, endpoint, go_live, false);
            }
            _ = recovery.tick(), if was_connected && !broker.is_connected() => {
                go_live = restart_go_live(broker, endpoint, go_live, false);
            }
            event = eventloop.poll() => {
                match event {
                    Ok(event) => {
                        acks.observe(&event);
                        match event {
                            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                                was_connected = true;
                                if let Some(task) = go_live.take() {
                                    task.abort();
                                }
                                go_live = restart_go_live(broker, endpoint, None, true);
                            }
                            Event::Incoming(Packet::ConnAck(ack)) => {
                                warn!(code = ?ack.code, "broker refused connection");
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, was_connected, "broker connection error");
                        if let Some(task) = go_live.take() {
                            task.abort();
                        }
                        broker.on_disconnected();
                        transport.detach();
                        return SessionEnd::Failed { was_connected };
                    }
                }
            }
        }
    }
}

/// Start a go-live pass unless one is still running. `connect` marks a fresh
/// CONNACK, which also records the endpoint.
fn restart_go_live(
    broker: &Arc<BrokerClient>,
    endpoint: &str,
    running: Option<JoinHandle<()>>,
    connect: bool,
) -> Option<JoinHandle<()>> {
    if let Some(task) = running {
        if !task.is_finished() {
            return Some(task);
        }
    }

    let broker = Arc::clone(broker);
    let endpoint = endpoint.to_string();
    Some(tokio::spawn(async move {
        if connect {
            broker.on_connected(&endpoint).await;
        } else {
            broker.resume().await;
        }
    }))
}

/// Publish `offline`, then DISCONNECT, while driving the event loop so both
/// actually go out. Bounded by the flush window.
async fn shutdown(
    broker: &BrokerClient,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    acks: &AckTracker,
) {
    let drained = tokio::time::timeout(SHUTDOWN_FLUSH, async {
        let offline = broker.publish_offline_status();
        tokio::pin!(offline);
        let mut offline_sent = false;

        loop {
            tokio::select! {
                _ = &mut offline, if !offline_sent => {
                    offline_sent = true;
                    if let Err(e) = client.try_disconnect() {
                        debug!(error = %e, "disconnect request not queued");
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(event) => acks.observe(&event),
                }
            }
        }
    })
    .await;

    acks.close();
    if drained.is_err() {
        debug!("broker flush window elapsed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{EventBufferConfig, OfflineEventBuffer, ReplayOutcome};
    use crate::domain::EventFactory;
    use common::domain::StationIdentity;
    use rumqttc::PubAck;
    use tempfile::TempDir;

    fn unpolled_client() -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 9), 10)
    }

    fn broker(dir: &TempDir, transport: Arc<RumqttcTransport>) -> Arc<BrokerClient> {
        let buffer = Arc::new(OfflineEventBuffer::new(EventBufferConfig {
            path: dir.path().join("events.jsonl"),
            replay_throttle: 0.0,
            replay_backoff_ms: 0,
        }));
        let factory = EventFactory::new(
            StationIdentity {
                tenant_id: "t1".to_string(),
                farm_id: "f1".to_string(),
                barn_id: "b1".to_string(),
                station_id: "st1".to_string(),
                device_id: "d1".to_string(),
            },
            Qos::AtLeastOnce,
        );
        Arc::new(BrokerClient::new(transport, buffer, factory))
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_mqtt_qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(Qos::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_detached_transport_rejects_publish() {
        let transport = RumqttcTransport::new(Duration::from_secs(1));

        let result = transport
            .publish("a/b", b"{}".to_vec(), Qos::AtLeastOnce, false)
            .await;

        assert!(matches!(result, Err(DomainError::Transport(_))));
    }

    #[tokio::test]
    async fn test_ack_waiters_follow_packet_ids() {
        let (client, _eventloop) = unpolled_client();
        let acks = AckTracker::default();
        let mut first = acks
            .submit(&client, "a/b", b"1".to_vec(), Qos::AtLeastOnce, false)
            .unwrap();
        let mut second = acks
            .submit(&client, "a/c", b"2".to_vec(), Qos::AtMostOnce, false)
            .unwrap();

        acks.observe(&Event::Outgoing(Outgoing::Publish(3)));
        acks.observe(&Event::Outgoing(Outgoing::Publish(0)));
        assert!(second.try_recv().is_ok());
        assert!(first.try_recv().is_err());

        acks.observe(&Event::Incoming(Packet::PubAck(PubAck::new(4))));
        assert!(first.try_recv().is_err());
        acks.observe(&Event::Incoming(Packet::PubAck(PubAck::new(3))));
        assert!(first.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_tracker_fails_waiters() {
        let (client, _eventloop) = unpolled_client();
        let acks = AckTracker::default();
        let pending = acks
            .submit(&client, "a/b", b"1".to_vec(), Qos::AtLeastOnce, false)
            .unwrap();

        acks.close();

        assert!(pending.await.is_err());
        assert!(matches!(
            acks.submit(&client, "a/b", b"2".to_vec(), Qos::AtLeastOnce, false),
            Err(DomainError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_unacknowledged_replay_keeps_buffer() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RumqttcTransport::new(Duration::from_millis(100)));
        let broker = broker(&dir, Arc::clone(&transport));
        for _ in 0..3 {
            broker.publish_heartbeat().await.unwrap();
        }
        // Requests are accepted but the event loop never delivers them.
        let (client, _eventloop) = unpolled_client();
        transport.attach(client);

        let outcome = broker.replay_buffer().await.unwrap();

        assert_eq!(
            outcome,
            ReplayOutcome::Interrupted {
                published: 0,
                remaining: 3
            }
        );
        assert_eq!(broker.buffer().size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_wildcard_topic_is_rejected_before_sending() {
        let transport = RumqttcTransport::new(Duration::from_millis(100));
        let (client, _eventloop) = unpolled_client();
        transport.attach(client);

        let result = transport
            .publish("iot/event/+/d1", b"{}".to_vec(), Qos::AtLeastOnce, false)
            .await;

        assert!(matches!(result, Err(DomainError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_mqtt_options_rejects_bad_endpoint() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RumqttcTransport::new(Duration::from_secs(1)));
        let broker = broker(&dir, transport);

        let result = mqtt_options(&broker, &BrokerClientConfig::default(), "mqtt://host:port");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_loop_without_endpoints_fails() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RumqttcTransport::new(Duration::from_secs(1)));
        let broker = broker(&dir, Arc::clone(&transport));
        let config = BrokerClientConfig {
            broker_urls: Vec::new(),
            ..Default::default()
        };

        let result = run_broker_loop(broker, transport, config, CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancellation_while_unreachable() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RumqttcTransport::new(Duration::from_secs(1)));
        let broker = broker(&dir, Arc::clone(&transport));
        let config = BrokerClientConfig {
            broker_urls: vec![
                "mqtt://127.0.0.1:9".to_string(),
                "mqtt://127.0.0.1:10".to_string(),
            ],
            reconnect_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let ctx = CancellationToken::new();

        let handle = tokio::spawn(run_broker_loop(
            Arc::clone(&broker),
            transport,
            config,
            ctx.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        ctx.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!broker.is_connected());
    }
}
