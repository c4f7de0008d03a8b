//! Call session configuration.
//!
//! Configuration is loaded from environment variables. The TURN credential is
//! redacted in Debug output.

use crate::backoff::Backoff;
use crate::media::MediaConstraints;
use crate::session::{SessionArgs, SessionSettings};
use crate::transport::{IceServer, TransportConfig};
use common::secret::SecretString;
use common::types::MeetingId;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default STUN server.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Default presence heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 20;

/// Default initial reconnect delay in milliseconds.
pub const DEFAULT_BACKOFF_FLOOR_MS: u64 = 3000;

/// Default reconnect delay ceiling in milliseconds.
pub const DEFAULT_BACKOFF_CEILING_MS: u64 = 30_000;

/// Default bound for each asynchronous leave step in milliseconds.
pub const DEFAULT_LEAVE_STEP_TIMEOUT_MS: u64 = 5000;

/// Default number of simulated participants in the loopback harness.
pub const DEFAULT_SIMULATED_PEERS: usize = 2;

/// Signaling server profile selected by `CALL_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Local signaling server on `localhost:9000`.
    Development,
    /// Hosted signaling server.
    Production,
}

impl Environment {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::InvalidValue(format!(
                "CALL_ENV must be 'development' or 'production', got '{other}'"
            ))),
        }
    }

    fn signaling_defaults(self) -> (&'static str, u16, &'static str, bool) {
        match self {
            Environment::Development => ("localhost", 9000, "/peerjs", false),
            Environment::Production => ("peerjs.com", 443, "/", true),
        }
    }
}

/// Call session configuration.
#[derive(Clone)]
pub struct Config {
    /// Meeting to join.
    pub meeting_id: MeetingId,

    /// Account identifier the participant identity is derived from.
    pub account_key: String,

    /// Presence display name (default: the account key).
    pub display_name: String,

    /// Presence avatar reference (default: empty).
    pub avatar_url: String,

    /// Signaling server profile.
    pub environment: Environment,

    /// Transport library settings, including ICE servers.
    pub transport: TransportConfig,

    /// Presence refresh interval (default: 20s).
    pub heartbeat_interval_seconds: u64,

    /// Initial reconnect delay (default: 3000ms).
    pub backoff_floor_ms: u64,

    /// Reconnect delay ceiling (default: 30000ms).
    pub backoff_ceiling_ms: u64,

    /// Per-step bound for asynchronous leave cleanup (default: 5000ms).
    pub leave_step_timeout_ms: u64,

    /// Prometheus endpoint for the harness binary. Disabled when unset.
    pub metrics_bind_address: Option<String>,

    /// Participants the loopback harness simulates (default: 2).
    pub simulated_peers: usize,
}

/// Custom Debug implementation that redacts the TURN credential.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("meeting_id", &self.meeting_id)
            .field("account_key", &self.account_key)
            .field("display_name", &self.display_name)
            .field("avatar_url", &self.avatar_url)
            .field("environment", &self.environment)
            .field("transport", &self.transport)
            .field("heartbeat_interval_seconds", &self.heartbeat_interval_seconds)
            .field("backoff_floor_ms", &self.backoff_floor_ms)
            .field("backoff_ceiling_ms", &self.backoff_ceiling_ms)
            .field("leave_step_timeout_ms", &self.leave_step_timeout_ms)
            .field("metrics_bind_address", &self.metrics_bind_address)
            .field("simulated_peers", &self.simulated_peers)
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

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let meeting_id = vars
            .get("CALL_MEETING_ID")
            .filter(|v| !v.trim().is_empty())
            .map(|v| MeetingId::new(v.trim()))
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_MEETING_ID".to_string()))?;

        let account_key = vars
            .get("CALL_ACCOUNT_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_ACCOUNT_KEY".to_string()))?
            .trim()
            .to_string();
        if account_key.is_empty() {
            return Err(ConfigError::InvalidValue(
                "CALL_ACCOUNT_KEY must not be empty".to_string(),
            ));
        }

        let display_name = vars
            .get("CALL_DISPLAY_NAME")
            .cloned()
            .unwrap_or_else(|| account_key.clone());

        let avatar_url = vars.get("CALL_AVATAR_URL").cloned().unwrap_or_default();

        let environment = match vars.get("CALL_ENV") {
            Some(raw) => Environment::parse(raw)?,
            None => Environment::Production,
        };
        let (default_host, default_port, default_path, default_secure) =
            environment.signaling_defaults();

        let host = vars
            .get("CALL_SIGNALING_HOST")
            .cloned()
            .unwrap_or_else(|| default_host.to_string());
        let port = parse_or("CALL_SIGNALING_PORT", vars, default_port)?;
        let path = vars
            .get("CALL_SIGNALING_PATH")
            .cloned()
            .unwrap_or_else(|| default_path.to_string());
        let secure = parse_or("CALL_SIGNALING_SECURE", vars, default_secure)?;

        let stun_urls: Vec<String> = vars
            .get("CALL_STUN_URLS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec![DEFAULT_STUN_URL.to_string()]);

        let mut ice_servers = Vec::new();
        if !stun_urls.is_empty() {
            ice_servers.push(IceServer::stun(stun_urls));
        }
        if let Some(turn_url) = vars.get("CALL_TURN_URL") {
            ice_servers.push(IceServer {
                urls: vec![turn_url.clone()],
                username: vars.get("CALL_TURN_USERNAME").cloned(),
                credential: vars
                    .get("CALL_TURN_CREDENTIAL")
                    .map(|c| SecretString::from(c.clone())),
            });
        }

        let heartbeat_interval_seconds = parse_or(
            "CALL_HEARTBEAT_INTERVAL_SECONDS",
            vars,
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;
        if heartbeat_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_HEARTBEAT_INTERVAL_SECONDS must be greater than 0".to_string(),
            ));
        }

        let backoff_floor_ms = parse_or("CALL_BACKOFF_FLOOR_MS", vars, DEFAULT_BACKOFF_FLOOR_MS)?;
        let backoff_ceiling_ms =
            parse_or("CALL_BACKOFF_CEILING_MS", vars, DEFAULT_BACKOFF_CEILING_MS)?;
        if backoff_floor_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_BACKOFF_FLOOR_MS must be greater than 0".to_string(),
            ));
        }
        if backoff_ceiling_ms < backoff_floor_ms {
            return Err(ConfigError::InvalidValue(format!(
                "CALL_BACKOFF_CEILING_MS ({backoff_ceiling_ms}) must be >= CALL_BACKOFF_FLOOR_MS ({backoff_floor_ms})"
            )));
        }

        let leave_step_timeout_ms = parse_or(
            "CALL_LEAVE_STEP_TIMEOUT_MS",
            vars,
            DEFAULT_LEAVE_STEP_TIMEOUT_MS,
        )?;

        let metrics_bind_address = vars
            .get("CALL_METRICS_BIND_ADDRESS")
            .filter(|v| !v.is_empty())
            .cloned();

        let simulated_peers = parse_or("CALL_SIMULATED_PEERS", vars, DEFAULT_SIMULATED_PEERS)?;

        Ok(Config {
            meeting_id,
            account_key,
            display_name,
            avatar_url,
            environment,
            transport: TransportConfig {
                host,
                port,
                path,
                secure,
                ice_servers,
            },
            heartbeat_interval_seconds,
            backoff_floor_ms,
            backoff_ceiling_ms,
            leave_step_timeout_ms,
            metrics_bind_address,
            simulated_peers,
        })
    }

    /// Join parameters for the local participant.
    pub fn session_args(&self) -> SessionArgs {
        SessionArgs {
            meeting_id: self.meeting_id.clone(),
            account_key: self.account_key.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }

    /// Timing and transport settings for a session.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_floor_ms),
                Duration::from_millis(self.backoff_ceiling_ms),
            ),
            leave_step_timeout: Duration::from_millis(self.leave_step_timeout_ms),
            transport: self.transport.clone(),
            media: MediaConstraints::default(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &str,
    vars: &HashMap<String, String>,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}: cannot parse '{raw}'"))),
        None => Ok(default),
    }
}
