use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Largest leaderboard a hub keeps or the broker's score API returns.
pub const MAX_LEADERBOARD_SIZE: usize = 100;
/// Upper bound for `heartbeat.expiry_multiple`.
pub const MAX_EXPIRY_MULTIPLE: f64 = 100.0;
/// Upper bound for heartbeat and sweep periods (one day).
pub const MAX_HEARTBEAT_MS: u64 = 86_400_000;

/// Heartbeat and expiry tuning for presence topics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats sent by a joined session (ms)
    pub interval_ms: u64,
    /// A session expires after `expiry_multiple * interval` without a heartbeat
    pub expiry_multiple: f64,
    /// How often expired sessions are swept; defaults to the heartbeat interval
    pub sweep_interval_ms: Option<u64>,
    /// Mirror joins/leaves as PlayerJoined/PlayerLeft on the events topic
    pub announce_events: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            expiry_multiple: 2.0,
            sweep_interval_ms: None,
            announce_events: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Saturates on multiples that [`SyncConfig::validate`] rejects.
    pub fn expiry(&self) -> Duration {
        let secs = self.interval().as_secs_f64() * self.expiry_multiple.max(1.0);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.unwrap_or(self.interval_ms))
    }
}

/// Reconnection policy for the live transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay randomly added or removed (0.0 - 1.0)
    pub jitter: f64,
    /// Failed probes before giving up and settling in fallback
    pub max_attempts: u32,
    /// Overall reconnect budget before settling in fallback
    pub max_retry_duration_ms: u64,
    /// Background probe period while in fallback
    pub probe_interval_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.2,
            max_attempts: 5,
            max_retry_duration_ms: 60_000,
            probe_interval_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// `jitter_sample` is expected in `[-1.0, 1.0]`.
    pub fn delay(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp).min(self.max_delay_ms);
        let spread = raw as f64 * self.jitter.clamp(0.0, 1.0) * jitter_sample.clamp(-1.0, 1.0);
        let jittered = (raw as f64 + spread).max(0.0) as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }

    pub fn max_retry_duration(&self) -> Duration {
        Duration::from_millis(self.max_retry_duration_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardConfig {
    /// Top-N entries kept per (game, period)
    pub size: usize,
    /// Authoritative re-fetch period (ms)
    pub refresh_interval_ms: u64,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            size: 10,
            refresh_interval_ms: 60_000,
        }
    }
}

impl LeaderboardConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Low-level liveness ping on live links
    pub ping_interval_ms: u64,
    /// A live link with no inbound traffic for this long is declared dead
    pub ping_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Per-topic buffer of the in-process fallback bus
    pub channel_capacity: usize,
    /// How long a failed publish waits for its topic to be re-homed
    pub publish_retry_wait_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            ping_interval_ms: 10_000,
            ping_timeout_ms: 25_000,
            ack_timeout_ms: 5_000,
            channel_capacity: 256,
            publish_retry_wait_ms: 1_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn publish_retry_wait(&self) -> Duration {
        Duration::from_millis(self.publish_retry_wait_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the score store REST API; `None` keeps scores in memory
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Client-side configuration of a [`RealtimeHub`](crate::RealtimeHub).
///
/// `backend_url` is the presence/absence switch: without it the hub starts in
/// fallback mode and never tries to reach a broker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Broker WebSocket base, e.g. `ws://127.0.0.1:9400`
    pub backend_url: Option<String>,
    pub heartbeat: HeartbeatConfig,
    pub backoff: BackoffConfig,
    pub leaderboard: LeaderboardConfig,
    pub transport: TransportConfig,
    pub store: StoreConfig,
}

impl SyncConfig {
    /// In-process only configuration.
    pub fn fallback_only() -> Self {
        Self::default()
    }

    pub fn with_backend(url: impl Into<String>) -> Self {
        Self {
            backend_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `ARCADE_SYNC_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.backend_url = var("ARCADE_SYNC_BACKEND_URL").filter(|v| !v.trim().is_empty());
        config.store.base_url = var("ARCADE_SYNC_STORE_URL").filter(|v| !v.trim().is_empty());
        if let Some(v) = parse_var(&var, "ARCADE_SYNC_HEARTBEAT_MS")? {
            config.heartbeat.interval_ms = v;
        }
        if let Some(v) = parse_var(&var, "ARCADE_SYNC_EXPIRY_MULTIPLE")? {
            config.heartbeat.expiry_multiple = v;
        }
        if let Some(v) = parse_var(&var, "ARCADE_SYNC_LEADERBOARD_SIZE")? {
            config.leaderboard.size = v;
        }
        if let Some(v) = parse_var(&var, "ARCADE_SYNC_REFRESH_MS")? {
            config.leaderboard.refresh_interval_ms = v;
        }
        if let Some(v) = parse_var(&var, "ARCADE_SYNC_MAX_ATTEMPTS")? {
            config.backoff.max_attempts = v;
        }
        if let Some(v) = parse_var(&var, "ARCADE_SYNC_STORE_TIMEOUT_MS")? {
            config.store.timeout_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_HEARTBEAT_MS).contains(&self.heartbeat.interval_ms) {
            return Err(invalid("heartbeat.interval_ms", "must be between 1 and one day"));
        }
        if self.heartbeat.sweep_interval_ms.is_some_and(|ms| !(1..=MAX_HEARTBEAT_MS).contains(&ms)) {
            return Err(invalid("heartbeat.sweep_interval_ms", "must be between 1 and one day"));
        }
        // Also false for NaN
        if !(1.0..=MAX_EXPIRY_MULTIPLE).contains(&self.heartbeat.expiry_multiple) {
            return Err(invalid(
                "heartbeat.expiry_multiple",
                format!("must be between 1 and {MAX_EXPIRY_MULTIPLE}"),
            ));
        }
        if !(1..=MAX_LEADERBOARD_SIZE).contains(&self.leaderboard.size) {
            return Err(invalid(
                "leaderboard.size",
                format!("must be between 1 and {MAX_LEADERBOARD_SIZE}"),
            ));
        }
        if self.leaderboard.refresh_interval_ms == 0 {
            return Err(invalid("leaderboard.refresh_interval_ms", "must be positive"));
        }
        if self.backoff.base_delay_ms == 0 || self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(invalid("backoff", "need 0 < base_delay_ms <= max_delay_ms"));
        }
        if self.backoff.probe_interval_ms == 0 {
            return Err(invalid("backoff.probe_interval_ms", "must be positive"));
        }
        if self.transport.channel_capacity == 0 {
            return Err(invalid("transport.channel_capacity", "must be positive"));
        }
        if self.transport.ping_interval_ms == 0 || self.transport.ping_timeout_ms <= self.transport.ping_interval_ms {
            return Err(invalid("transport", "need 0 < ping_interval_ms < ping_timeout_ms"));
        }
        if let Some(url) = &self.backend_url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(invalid("backend_url", "expected a ws:// or wss:// url"));
            }
        }
        Ok(())
    }
}

/// Settings for the `arcade-broker` binary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub bind: String,
    /// Per-topic fan-out buffer
    pub channel_capacity: usize,
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9400".to_string(),
            channel_capacity: 1024,
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bind) = var("ARCADE_BROKER_BIND") {
            config.bind = bind;
        }
        if let Some(v) = parse_var(&var, "ARCADE_BROKER_CHANNEL_CAPACITY")? {
            config.channel_capacity = v;
        }
        if let Some(level) = var("ARCADE_BROKER_LOG") {
            config.log_level = level;
        }
        if config.channel_capacity == 0 {
            return Err(invalid("channel_capacity", "must be positive"));
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match var(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, format!("cannot parse '{raw}'"))),
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}
