use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Station identity
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    #[serde(default = "default_farm_id")]
    pub farm_id: String,

    #[serde(default = "default_barn_id")]
    pub barn_id: String,

    #[serde(default = "default_station_id")]
    pub station_id: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    // MQTT configuration
    /// Ordered broker endpoints (comma-separated), tried in turn
    #[serde(default = "default_mqtt_broker_urls")]
    pub mqtt_broker_urls: String,

    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,

    #[serde(default = "default_mqtt_keep_alive_secs")]
    pub mqtt_keep_alive_secs: u64,

    #[serde(default = "default_mqtt_reconnect_delay_secs")]
    pub mqtt_reconnect_delay_secs: u64,

    #[serde(default = "default_mqtt_publish_timeout_secs")]
    pub mqtt_publish_timeout_secs: u64,

    /// QoS for every published event (0, 1 or 2)
    #[serde(default = "default_mqtt_qos")]
    pub mqtt_qos: u8,

    // Offline buffer configuration
    #[serde(default = "default_buffer_path")]
    pub buffer_path: String,

    /// Max events per second while replaying the buffer, 0 for unthrottled
    #[serde(default = "default_replay_throttle")]
    pub replay_throttle: f64,

    /// Upper bound of the random delay added before each replayed event
    #[serde(default = "default_replay_backoff_ms")]
    pub replay_backoff_ms: u64,

    // HTTP configuration
    #[serde(default = "default_media_store_url")]
    pub media_store_url: String,

    #[serde(default = "default_session_api_url")]
    pub session_api_url: String,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Attempts per HTTP step, first try included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    // Capture configuration
    #[serde(default = "default_capture_dir")]
    pub capture_dir: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// SQLite database holding processed markers
    #[serde(default = "default_state_db_path")]
    pub state_db_path: String,

    /// Largest spread across raw readings still treated as a stable weight (kg)
    #[serde(default = "default_weight_stability_threshold")]
    pub weight_stability_threshold: f64,

    /// Status heartbeat period, 0 disables the heartbeat
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Enable OpenTelemetry export
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    /// Service name for OpenTelemetry resource
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tenant_id() -> String {
    "default".to_string()
}

fn default_farm_id() -> String {
    "farm-01".to_string()
}

fn default_barn_id() -> String {
    "barn-01".to_string()
}

fn default_station_id() -> String {
    "station-01".to_string()
}

fn default_device_id() -> String {
    "weighvision-01".to_string()
}

fn default_mqtt_broker_urls() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_mqtt_client_id() -> String {
    "weighvision-edge".to_string()
}

fn default_mqtt_keep_alive_secs() -> u64 {
    30
}

fn default_mqtt_reconnect_delay_secs() -> u64 {
    5
}

fn default_mqtt_publish_timeout_secs() -> u64 {
    5
}

fn default_mqtt_qos() -> u8 {
    1
}

fn default_buffer_path() -> String {
    "/var/lib/weighvision/buffer/events.jsonl".to_string()
}

fn default_replay_throttle() -> f64 {
    10.0
}

fn default_replay_backoff_ms() -> u64 {
    250
}

fn default_media_store_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_session_api_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_capture_dir() -> String {
    "/var/lib/weighvision/captures".to_string()
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_state_db_path() -> String {
    "/var/lib/weighvision/state/processed.db".to_string()
}

fn default_weight_stability_threshold() -> f64 {
    0.5
}

fn default_status_interval_secs() -> u64 {
    60
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "weighvision-edge".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("WEIGHVISION"))
            .build()?
            .try_deserialize()
    }

    /// Broker endpoints in configured order
    pub fn broker_urls(&self) -> Vec<String> {
        self.mqtt_broker_urls
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
