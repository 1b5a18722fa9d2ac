use crate::error::FeedError;
use crate::transport::{TransportEndpoints, TransportKind};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUFFER_CAPACITY: usize = 250;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_JITTER_MS: u64 = 400;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_FAULT_WINDOW: usize = 16;
pub const DEFAULT_MAX_FAULTS_PER_WINDOW: usize = 5;
pub const MIN_BUFFER_CAPACITY: usize = 1;
pub const MAX_BUFFER_CAPACITY: usize = 10_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 120_000;
pub const MIN_IDLE_TIMEOUT_MS: u64 = 2_000;
pub const MAX_IDLE_TIMEOUT_MS: u64 = 600_000;
pub const MIN_CONNECT_TIMEOUT_MS: u64 = 100;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60_000;
pub const MIN_BASE_BACKOFF_MS: u64 = 10;
pub const MAX_MAX_BACKOFF_MS: u64 = 300_000;
pub const MAX_JITTER_MS: u64 = 10_000;
pub const MAX_FAULT_WINDOW: usize = 1_000;

/// Connection lifecycle as observed by the consumer. `Failed` is terminal
/// and only ever entered through an explicit cancel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Suspended,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalSide {
    Long,
    Short,
    Neutral,
}

impl SignalSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Neutral => "NEUTRAL",
        }
    }
}

/// A validated signal record. Structural invariants (`ts >= 0`, non-empty
/// `symbol`, finite numeric fields) are enforced by the wire codec before a
/// value of this type exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: Option<String>,
    pub ts: i64,
    pub symbol: String,
    pub tf: Option<String>,
    pub side: Option<SignalSide>,
    pub price: Option<f64>,
    pub reason: Option<String>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: ConnectionState,
    pub channel: String,
    pub transport: Option<TransportKind>,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn idle(channel: String) -> Self {
        Self {
            state: ConnectionState::Idle,
            channel,
            transport: None,
            reason: None,
        }
    }
}

/// Raw subscription options as supplied by the caller. Every field except
/// `channel` and `endpoints` is optional and falls back to a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeArgs {
    pub channel: String,
    pub endpoints: TransportEndpoints,
    pub buffer_capacity: Option<usize>,
    pub heartbeat_interval_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub base_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub fault_window: Option<usize>,
    pub max_faults_per_window: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub channel: String,
    pub endpoints: TransportEndpoints,
    pub buffer_capacity: usize,
    pub heartbeat_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    pub backoff_factor: f64,
    pub fault_window: usize,
    pub max_faults_per_window: usize,
}

fn valid_channel_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':')
}

impl SubscribeArgs {
    pub fn normalize(self) -> Result<FeedConfig, FeedError> {
        let channel = self.channel.trim().to_string();
        if channel.is_empty() || !channel.chars().all(valid_channel_char) {
            return Err(FeedError::InvalidConfig(
                "channel must be non-empty ASCII alphanumeric with -_.: allowed".to_string(),
            ));
        }

        let buffer_capacity = self.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY);
        if !(MIN_BUFFER_CAPACITY..=MAX_BUFFER_CAPACITY).contains(&buffer_capacity) {
            return Err(FeedError::InvalidConfig(format!(
                "bufferCapacity must be between {MIN_BUFFER_CAPACITY} and {MAX_BUFFER_CAPACITY}"
            )));
        }

        let heartbeat_interval_ms = self
            .heartbeat_interval_ms
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if !(MIN_HEARTBEAT_INTERVAL_MS..=MAX_HEARTBEAT_INTERVAL_MS)
            .contains(&heartbeat_interval_ms)
        {
            return Err(FeedError::InvalidConfig(format!(
                "heartbeatIntervalMs must be between {MIN_HEARTBEAT_INTERVAL_MS} and {MAX_HEARTBEAT_INTERVAL_MS}"
            )));
        }

        let idle_timeout_ms = self.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS);
        if !(MIN_IDLE_TIMEOUT_MS..=MAX_IDLE_TIMEOUT_MS).contains(&idle_timeout_ms) {
            return Err(FeedError::InvalidConfig(format!(
                "idleTimeoutMs must be between {MIN_IDLE_TIMEOUT_MS} and {MAX_IDLE_TIMEOUT_MS}"
            )));
        }
        if idle_timeout_ms <= heartbeat_interval_ms {
            return Err(FeedError::InvalidConfig(
                "idleTimeoutMs must exceed heartbeatIntervalMs".to_string(),
            ));
        }

        let connect_timeout_ms = self
            .connect_timeout_ms
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
        if !(MIN_CONNECT_TIMEOUT_MS..=MAX_CONNECT_TIMEOUT_MS).contains(&connect_timeout_ms) {
            return Err(FeedError::InvalidConfig(format!(
                "connectTimeoutMs must be between {MIN_CONNECT_TIMEOUT_MS} and {MAX_CONNECT_TIMEOUT_MS}"
            )));
        }

        let base_backoff_ms = self.base_backoff_ms.unwrap_or(DEFAULT_BASE_BACKOFF_MS);
        if base_backoff_ms < MIN_BASE_BACKOFF_MS {
            return Err(FeedError::InvalidConfig(format!(
                "baseBackoffMs must be at least {MIN_BASE_BACKOFF_MS}"
            )));
        }

        let max_backoff_ms = self.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS);
        if max_backoff_ms < base_backoff_ms || max_backoff_ms > MAX_MAX_BACKOFF_MS {
            return Err(FeedError::InvalidConfig(format!(
                "maxBackoffMs must be between baseBackoffMs and {MAX_MAX_BACKOFF_MS}"
            )));
        }

        let jitter_ms = self.jitter_ms.unwrap_or(DEFAULT_JITTER_MS);
        if jitter_ms > MAX_JITTER_MS {
            return Err(FeedError::InvalidConfig(format!(
                "jitterMs must not exceed {MAX_JITTER_MS}"
            )));
        }

        let backoff_factor = self.backoff_factor.unwrap_or(DEFAULT_BACKOFF_FACTOR);
        if !backoff_factor.is_finite() || !(1.0..=10.0).contains(&backoff_factor) {
            return Err(FeedError::InvalidConfig(
                "backoffFactor must be a finite number between 1.0 and 10.0".to_string(),
            ));
        }

        let fault_window = self.fault_window.unwrap_or(DEFAULT_FAULT_WINDOW);
        if !(1..=MAX_FAULT_WINDOW).contains(&fault_window) {
            return Err(FeedError::InvalidConfig(format!(
                "faultWindow must be between 1 and {MAX_FAULT_WINDOW}"
            )));
        }

        let max_faults_per_window = self
            .max_faults_per_window
            .unwrap_or(DEFAULT_MAX_FAULTS_PER_WINDOW);
        if max_faults_per_window == 0 || max_faults_per_window > fault_window {
            return Err(FeedError::InvalidConfig(
                "maxFaultsPerWindow must be between 1 and faultWindow".to_string(),
            ));
        }

        Ok(FeedConfig {
            channel,
            endpoints: self.endpoints,
            buffer_capacity,
            heartbeat_interval_ms,
            idle_timeout_ms,
            connect_timeout_ms,
            base_backoff_ms,
            max_backoff_ms,
            jitter_ms,
            backoff_factor,
            fault_window,
            max_faults_per_window,
        })
    }
}
