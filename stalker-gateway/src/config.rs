use crate::stalker::chain::Chain;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Tuning for the per-chain workers
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Transaction ids remembered per wallet for debouncing
    pub debounce_capacity: usize,
    /// A wallet is active while its last event is younger than this
    pub active_threshold: Duration,
    /// How often liveness is re-evaluated
    pub sweep_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive failures before the link is reported as failed
    pub reconnect_max_attempts: u32,
    /// Retry interval once the link is in the failed state
    pub failed_retry_interval: Duration,
    /// Consecutive malformed frames tolerated before reconnecting
    pub max_protocol_errors: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_capacity: 100,
            active_threshold: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(3),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_max_attempts: 5,
            failed_retry_interval: Duration::from_secs(30),
            max_protocol_errors: 10,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Node WebSocket endpoint per enabled chain
    pub endpoints: HashMap<Chain, String>,
    pub monitor: MonitorConfig,
    /// Subscribe/unsubscribe acknowledgment (and connect) timeout
    pub ack_timeout: Duration,
    /// Idle time before the upstream link is pinged
    pub idle_ping: Duration,
    /// Outbound queue length per client session
    pub client_queue_capacity: usize,
    /// Release a session's watches when it disconnects
    pub release_on_disconnect: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let alchemy_key = var("ALCHEMY_API_KEY");
        let helius_key = var("HELIUS_API_KEY");

        let mut endpoints = HashMap::new();
        for chain in Chain::ALL {
            let explicit = var(&format!("{}_WSS_URL", chain.env_prefix()));
            let provider_key = match chain {
                Chain::Solana => helius_key.as_deref(),
                _ => alchemy_key.as_deref(),
            };
            let endpoint = explicit.or_else(|| provider_key.map(|k| chain.hosted_ws_url(k)));
            if let Some(endpoint) = endpoint {
                let parsed = url::Url::parse(&endpoint)
                    .map_err(|e| format!("{}_WSS_URL is not a valid URL: {}", chain.env_prefix(), e))?;
                if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                    return Err(format!(
                        "{}_WSS_URL must use ws:// or wss://",
                        chain.env_prefix()
                    ));
                }
                endpoints.insert(chain, endpoint);
            }
        }

        let defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            debounce_capacity: parse_or(&var, "STALKER_DEBOUNCE_CAPACITY", defaults.debounce_capacity)?,
            active_threshold: secs_or(&var, "STALKER_ACTIVE_THRESHOLD_SECS", defaults.active_threshold)?,
            sweep_interval: secs_or(&var, "STALKER_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            reconnect_base_delay: secs_or(
                &var,
                "STALKER_RECONNECT_BASE_DELAY_SECS",
                defaults.reconnect_base_delay,
            )?,
            reconnect_max_delay: secs_or(
                &var,
                "STALKER_RECONNECT_MAX_DELAY_SECS",
                defaults.reconnect_max_delay,
            )?,
            reconnect_max_attempts: parse_or(
                &var,
                "STALKER_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            )?,
            failed_retry_interval: secs_or(
                &var,
                "STALKER_FAILED_RETRY_SECS",
                defaults.failed_retry_interval,
            )?,
            max_protocol_errors: defaults.max_protocol_errors,
        };

        if monitor.debounce_capacity == 0 {
            return Err("STALKER_DEBOUNCE_CAPACITY must be at least 1".to_string());
        }

        Ok(Self {
            host: var("GATEWAY_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(&var, "GATEWAY_PORT", 9110)?,
            endpoints,
            monitor,
            ack_timeout: secs_or(&var, "STALKER_ACK_TIMEOUT_SECS", Duration::from_secs(10))?,
            idle_ping: secs_or(&var, "STALKER_IDLE_PING_SECS", Duration::from_secs(30))?,
            client_queue_capacity: parse_or(&var, "STALKER_CLIENT_QUEUE", 256)?,
            release_on_disconnect: parse_or(&var, "STALKER_RELEASE_ON_DISCONNECT", false)?,
        })
    }

    pub fn enabled_chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.endpoints.keys().copied().collect();
        chains.sort();
        chains
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, String> {
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn secs_or(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, String> {
    parse_or(var, key, default.as_secs()).map(Duration::from_secs)
}
