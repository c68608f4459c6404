pub fn default_true() -> bool {
    true
}

pub fn default_service_name() -> String {
    "greekstream".to_string()
}

pub fn default_environment() -> String {
    "development".to_string()
}

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

// Feed

pub fn default_feed_endpoint() -> String {
    "wss://www.deribit.com/ws/api/v2".to_string()
}

pub fn default_currencies() -> Vec<String> {
    vec!["ETH".to_string()]
}

pub fn default_ticker_interval() -> String {
    "100ms".to_string()
}

pub fn default_connect_timeout_ms() -> u64 {
    10_000
}

pub fn default_subscribe_timeout_ms() -> u64 {
    10_000
}

pub fn default_feed_heartbeat_seconds() -> u64 {
    30
}

pub fn default_idle_timeout_seconds() -> u64 {
    90
}

pub fn default_reconnect_base_delay_ms() -> u64 {
    500
}

pub fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

pub fn default_reconnect_max_attempts() -> u32 {
    10
}

// Pipeline

pub fn default_snapshot_interval_seconds() -> u64 {
    60
}

pub fn default_coalesce_window_ms() -> u64 {
    100
}

pub fn default_risk_free_rate() -> f64 {
    0.05
}

// Broadcaster

pub fn default_broadcaster_port() -> u16 {
    8765
}

pub fn default_batch_size() -> usize {
    32
}

pub fn default_flush_delay_ms() -> u64 {
    10
}

pub fn default_heartbeat_interval_seconds() -> u64 {
    30
}

pub fn default_queue_capacity() -> usize {
    256
}

pub fn default_stale_after_seconds() -> u64 {
    120
}

// Persistence

pub fn default_archive_path() -> String {
    "data/greekstream.db".to_string()
}

pub fn default_persistence_max_attempts() -> u32 {
    3
}

pub fn default_base_backoff_ms() -> u64 {
    50
}

pub fn default_max_backoff_ms() -> u64 {
    1_000
}

pub fn default_busy_timeout_ms() -> u64 {
    250
}

pub fn default_archive_queue_capacity() -> usize {
    1024
}

// API

pub fn default_api_port() -> u16 {
    8080
}

pub fn default_request_timeout_seconds() -> u64 {
    30
}

// Scenarios

pub fn default_scenario_concurrency() -> usize {
    2
}

pub fn default_max_valuations() -> usize {
    200_000
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}
