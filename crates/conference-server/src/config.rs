//! Conference server configuration.
//!
//! Configuration is loaded from environment variables. The engine attach token
//! is redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP + WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health and metrics bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default server instance ID prefix.
pub const DEFAULT_SERVER_ID_PREFIX: &str = "conf";

/// Default registry capacity.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default auto-close window for empty rooms, in minutes (0 closes at once).
pub const DEFAULT_MAX_EMPTY_MINUTES: u64 = 0;

/// Longest auto-close window a room may ask for (one week).
pub const MAX_EMPTY_MINUTES_LIMIT: u64 = 7 * 24 * 60;

/// Default base window before a pending local offer counts as jammed.
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 3000;

/// Default random extension of the jammed-offer window.
pub const DEFAULT_NEGOTIATION_JITTER_MS: u64 = 2000;

/// Conference server configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP + WebSocket bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this server instance.
    pub server_id: String,

    /// Maximum number of rooms the registry will hold.
    pub max_rooms: usize,

    /// Member cap applied when a create request omits one (`None` = unlimited).
    pub default_max_members: Option<usize>,

    /// Auto-close window applied when a create request omits one.
    pub default_max_empty_minutes: u64,

    /// Negotiation timings shared by every connection.
    pub negotiation: NegotiationTimings,

    /// Shared secret media engines present when attaching.
    /// Protected by `SecretString` to prevent accidental logging.
    pub engine_token: SecretString,

    /// Emit logs as JSON instead of the human-readable format.
    pub log_json: bool,
}

/// Jammed-negotiation recovery window.
///
/// A local offer that stays pending for `timeout + rand(0..jitter)` is rolled
/// back and renegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationTimings {
    pub timeout: Duration,
    pub jitter: Duration,
}

impl Default for NegotiationTimings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS),
            jitter: Duration::from_millis(DEFAULT_NEGOTIATION_JITTER_MS),
        }
    }
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("server_id", &self.server_id)
            .field("max_rooms", &self.max_rooms)
            .field("default_max_members", &self.default_max_members)
            .field("default_max_empty_minutes", &self.default_max_empty_minutes)
            .field("negotiation", &self.negotiation)
            .field("engine_token", &"[REDACTED]")
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional numeric variable, rejecting malformed values.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            ConfigError::InvalidValue(format!("{key} must be a non-negative integer, got '{raw}'"))
        }),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let engine_token = SecretString::from(
            vars.get("CONF_ENGINE_TOKEN")
                .ok_or_else(|| ConfigError::MissingEnvVar("CONF_ENGINE_TOKEN".to_string()))?
                .clone(),
        );

        let bind_address = vars
            .get("CONF_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("CONF_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let max_rooms = parse_var(vars, "CONF_MAX_ROOMS")?.unwrap_or(DEFAULT_MAX_ROOMS);
        if max_rooms == 0 {
            return Err(ConfigError::InvalidValue(
                "CONF_MAX_ROOMS must be greater than zero".to_string(),
            ));
        }

        let default_max_members: Option<usize> = parse_var(vars, "CONF_DEFAULT_MAX_MEMBERS")?;
        if default_max_members == Some(0) {
            return Err(ConfigError::InvalidValue(
                "CONF_DEFAULT_MAX_MEMBERS must be greater than zero".to_string(),
            ));
        }

        let default_max_empty_minutes = parse_var(vars, "CONF_DEFAULT_MAX_EMPTY_MINUTES")?
            .unwrap_or(DEFAULT_MAX_EMPTY_MINUTES);
        if default_max_empty_minutes > MAX_EMPTY_MINUTES_LIMIT {
            return Err(ConfigError::InvalidValue(format!(
                "CONF_DEFAULT_MAX_EMPTY_MINUTES must be at most {MAX_EMPTY_MINUTES_LIMIT}"
            )));
        }

        let timeout_ms = parse_var(vars, "CONF_NEGOTIATION_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_NEGOTIATION_TIMEOUT_MS);
        let jitter_ms = parse_var(vars, "CONF_NEGOTIATION_JITTER_MS")?
            .unwrap_or(DEFAULT_NEGOTIATION_JITTER_MS);

        let log_json = vars
            .get("CONF_LOG_JSON")
            .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        let server_id = vars.get("CONF_SERVER_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_SERVER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            server_id,
            max_rooms,
            default_max_members,
            default_max_empty_minutes,
            negotiation: NegotiationTimings {
                timeout: Duration::from_millis(timeout_ms),
                jitter: Duration::from_millis(jitter_ms),
            },
            engine_token,
            log_json,
        })
    }
}
