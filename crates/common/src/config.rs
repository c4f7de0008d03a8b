//! Observability configuration shared by binaries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default `EnvFilter` directive.
pub const DEFAULT_LOG_FILTER: &str = "call_session=debug";

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Reads `CALL_LOG_FILTER` and `CALL_LOG_JSON` (`true`/`1`).
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            log_filter: vars
                .get("CALL_LOG_FILTER")
                .cloned()
                .unwrap_or(defaults.log_filter),
            json_logs: vars
                .get("CALL_LOG_JSON")
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        }
    }
}
