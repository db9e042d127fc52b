//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults
//!
//! Library crates never read the global; they take the typed settings below
//! (or their own `From<&...Settings>` conversions) as constructor arguments.

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Called once by the binary at startup.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration from defaults, `config.toml`, and the environment
/// without touching the global.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8090)?
        .set_default("log.format", "pretty")?
        .set_default("negotiation.auto_offer_ms", 1000)?
        .set_default("negotiation.command_buffer", 256)?
        .set_default("recovery.max_attempts", 2)?
        .set_default("recovery.backoff_ms", 1500)?
        .set_default("relay_client.url", "ws://127.0.0.1:8090/signal")?
        .set_default("relay_client.max_reconnect", 5)?
        .set_default("relay_client.backoff_base_ms", 500)?
        .set_default("relay_client.backoff_max_ms", 30_000)?
        .set_default(
            "ice.urls",
            vec![
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
                "stun:stun2.l.google.com:19302",
            ],
        )?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (KINDRED__SERVER__PORT, KINDRED__REDIS__URL, etc.)
        .add_source(
            config::Environment::with_prefix("KINDRED")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("ice.urls")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    pub log: LogConfig,
    pub negotiation: NegotiationSettings,
    pub recovery: RecoverySettings,
    pub relay_client: RelayClientSettings,
    pub ice: IceSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port of the signaling relay (`/signal` WebSocket + HTTP routes).
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    /// Redis connection URL. Omit for single-node, in-process fan-out.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// `pretty` (human readable) or `json` (one object per line).
    pub format: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationSettings {
    /// Wait before a silent session sends its own offer.
    pub auto_offer_ms: u64,
    /// Capacity of each room's command queue.
    pub command_buffer: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoverySettings {
    /// Renegotiation attempts after a `Disconnected` before giving up.
    pub max_attempts: u32,
    /// Delay before each renegotiation attempt.
    pub backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayClientSettings {
    /// WebSocket URL of the relay's `/signal` endpoint.
    pub url: String,
    pub max_reconnect: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IceSettings {
    /// STUN/TURN URLs handed to the session engine.
    pub urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_environment() {
        let cfg = load().expect("defaults are complete");
        assert_eq!(cfg.negotiation.auto_offer_ms, 1000);
        assert_eq!(cfg.recovery.max_attempts, 2);
        assert!(!cfg.ice.urls.is_empty());
    }
}
