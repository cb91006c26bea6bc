use crate::rate_limiter::RateLimitConfig;
use crate::session::{RebindPolicy, SessionConfig};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use sms_core::{BindMode, Credentials};
use std::env;
use std::time::Duration;

pub use config::ConfigError;

/// Application configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    /// Submission front end configuration
    pub server: ServerConfig,
    /// SMPP session configuration
    pub smpp: SmppConfig,
    /// Rebind policy
    pub rebind: RebindConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// Server configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 8080)
    pub port: u16,
}

/// SMPP session configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SmppConfig {
    /// SMSC address, host:port
    pub address: String,
    /// ESME system id
    pub system_id: String,
    /// ESME password
    pub password: String,
    /// ESME system type (default: empty)
    pub system_type: String,
    /// receiver, transmitter or transceiver (default: transceiver)
    pub bind_mode: BindMode,
    /// Bind handshake timeout (default: 5000)
    pub bind_timeout_ms: u64,
    /// Per-submit acknowledgement timeout (default: 1000)
    pub submit_timeout_ms: u64,
    /// enquire_link period, 0 disables (default: 10000)
    pub enquire_link_interval_ms: u64,
    /// Inbound events buffered for a slow handler (default: 256)
    pub inbound_queue_depth: usize,
    /// Status events buffered per subscriber (default: 64)
    pub status_buffer: usize,
}

/// How the session reacts to a lost link or failed bind
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RebindMode {
    Never,
    Immediate,
    Backoff,
}

/// Rebind configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RebindConfig {
    /// never, immediate or backoff (default: backoff)
    pub policy: RebindMode,
    /// First backoff delay (default: 1000)
    pub backoff_base_ms: u64,
    /// Backoff ceiling (default: 30000)
    pub backoff_max_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: json or pretty (default: json)
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for SmppConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:2775".to_string(),
            system_id: String::new(),
            password: String::new(),
            system_type: String::new(),
            bind_mode: BindMode::Transceiver,
            bind_timeout_ms: 5_000,
            submit_timeout_ms: 1_000,
            enquire_link_interval_ms: 10_000,
            inbound_queue_depth: 256,
            status_buffer: 64,
        }
    }
}

impl Default for RebindConfig {
    fn default() -> Self {
        Self {
            policy: RebindMode::Backoff,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl From<&RebindConfig> for RebindPolicy {
    fn from(config: &RebindConfig) -> Self {
        match config.policy {
            RebindMode::Never => RebindPolicy::Never,
            RebindMode::Immediate => RebindPolicy::Immediate,
            RebindMode::Backoff => {
                let base = Duration::from_millis(config.backoff_base_ms.max(1));
                let max = Duration::from_millis(config.backoff_max_ms).max(base);
                RebindPolicy::Backoff { base, max }
            }
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with default configuration
            .add_source(Config::try_from(&AppConfig::default())?)
            // Add configuration file based on environment
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (gitignored)
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables (prefixed with SMSGATE__)
            .add_source(
                Environment::with_prefix("SMSGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Strongly typed view handed to the session manager.
    pub fn session_config(&self) -> SessionConfig {
        let smpp = &self.smpp;
        let credentials = Credentials {
            system_id: smpp.system_id.clone(),
            password: smpp.password.clone(),
            system_type: smpp.system_type.clone(),
        };
        let enquire_link_interval = match smpp.enquire_link_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        SessionConfig {
            address: smpp.address.clone(),
            credentials,
            bind_mode: smpp.bind_mode,
            bind_timeout: Duration::from_millis(smpp.bind_timeout_ms),
            submit_timeout: Duration::from_millis(smpp.submit_timeout_ms),
            enquire_link_interval,
            inbound_queue_depth: smpp.inbound_queue_depth,
            status_buffer: smpp.status_buffer,
            rebind: RebindPolicy::from(&self.rebind),
            rate_limit: self.rate_limit.clone(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            smpp: SmppConfig::default(),
            rebind: RebindConfig::default(),
            logging: LoggingConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_valid_session_config() {
        let config = AppConfig::default().session_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_mode, BindMode::Transceiver);
        assert_eq!(config.enquire_link_interval, Some(Duration::from_secs(10)));
        assert_eq!(
            config.rebind,
            RebindPolicy::Backoff {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn zero_keepalive_disables_enquire_link() {
        let mut app = AppConfig::default();
        app.smpp.enquire_link_interval_ms = 0;
        assert_eq!(app.session_config().enquire_link_interval, None);
    }

    #[test]
    fn rebind_policy_mapping() {
        let mut rebind = RebindConfig::default();
        rebind.policy = RebindMode::Never;
        assert_eq!(RebindPolicy::from(&rebind), RebindPolicy::Never);

        rebind.policy = RebindMode::Backoff;
        rebind.backoff_base_ms = 500;
        rebind.backoff_max_ms = 100;
        assert_eq!(
            RebindPolicy::from(&rebind),
            RebindPolicy::Backoff {
                base: Duration::from_millis(500),
                max: Duration::from_millis(500)
            }
        );
    }

    #[test]
    fn defaults_round_trip_through_config_builder() {
        let built = Config::builder()
            .add_source(Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap();
        let app: AppConfig = built.try_deserialize().unwrap();
        assert_eq!(app.smpp.bind_mode, BindMode::Transceiver);
        assert_eq!(app.rebind.policy, RebindMode::Backoff);
        assert_eq!(app.server.port, 8080);
    }
}
