//! Configuration for the sync runtime.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Sync runtime configuration.
///
/// Libraries build it with the setters; the daemon loads it from the
/// environment with [`SyncConfig::from_env`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the remote record service
    pub remote_url: Option<String>,
    /// Bearer token sent with every remote request
    pub api_token: Option<String>,
    /// Directory holding the file-backed local store
    pub store_dir: PathBuf,
    /// Principal the daemon signs in as
    pub principal: Option<String>,
    /// Quiet period after the last save before a flush
    pub debounce: Duration,
    /// Safety-net flush interval
    pub periodic_interval: Duration,
    /// Upper bound on the teardown flush
    pub teardown_timeout: Duration,
    /// Per-request timeout for the HTTP client
    pub request_timeout: Duration,
    /// Remove local collections on sign-out
    pub wipe_on_sign_out: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            api_token: None,
            store_dir: PathBuf::from("./tandem-data"),
            principal: None,
            debounce: Duration::from_millis(2_000),
            periodic_interval: Duration::from_millis(30_000),
            teardown_timeout: Duration::from_millis(1_500),
            request_timeout: Duration::from_millis(10_000),
            wipe_on_sign_out: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| ConfigError::InvalidNumber { var: name, value: raw }),
            }
        };

        let wipe_on_sign_out = match lookup("TANDEM_WIPE_ON_SIGN_OUT") {
            None => defaults.wipe_on_sign_out,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidBool {
                        var: "TANDEM_WIPE_ON_SIGN_OUT",
                        value: raw,
                    })
                }
            },
        };

        Ok(Self {
            remote_url: lookup("TANDEM_REMOTE_URL"),
            api_token: lookup("TANDEM_API_TOKEN"),
            store_dir: lookup("TANDEM_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            principal: lookup("TANDEM_PRINCIPAL"),
            debounce: millis("TANDEM_DEBOUNCE_MS", defaults.debounce)?,
            periodic_interval: non_zero(
                "TANDEM_PERIODIC_MS",
                millis("TANDEM_PERIODIC_MS", defaults.periodic_interval)?,
            )?,
            teardown_timeout: millis("TANDEM_TEARDOWN_TIMEOUT_MS", defaults.teardown_timeout)?,
            request_timeout: millis("TANDEM_REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            wipe_on_sign_out,
        })
    }

    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the safety-net interval; clamped to at least one millisecond.
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_wipe_on_sign_out(mut self, wipe: bool) -> Self {
        self.wipe_on_sign_out = wipe;
        self
    }
}

fn non_zero(var: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        Err(ConfigError::ZeroInterval(var))
    } else {
        Ok(value)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingVar(&'static str),

    #[error("Invalid {var} value '{value}': expected milliseconds")]
    InvalidNumber { var: &'static str, value: String },

    #[error("Invalid {var} value '{value}': expected true or false")]
    InvalidBool { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.debounce, Duration::from_secs(2));
        assert_eq!(config.periodic_interval, Duration::from_secs(30));
        assert_eq!(config.teardown_timeout, Duration::from_millis(1500));
        assert_eq!(config.store_dir, PathBuf::from("./tandem-data"));
        assert!(config.wipe_on_sign_out);
        assert!(config.remote_url.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("TANDEM_REMOTE_URL", "https://sync.example.com/rest/v1"),
            ("TANDEM_DEBOUNCE_MS", "500"),
            ("TANDEM_WIPE_ON_SIGN_OUT", "false"),
            ("TANDEM_STORE_DIR", "/var/lib/tandem"),
        ]))
        .unwrap();

        assert_eq!(
            config.remote_url.as_deref(),
            Some("https://sync.example.com/rest/v1")
        );
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert!(!config.wipe_on_sign_out);
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/tandem"));
    }

    #[test]
    fn rejects_malformed_values() {
        let err = SyncConfig::from_lookup(lookup(&[("TANDEM_PERIODIC_MS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { var: "TANDEM_PERIODIC_MS", .. }
        ));

        let err =
            SyncConfig::from_lookup(lookup(&[("TANDEM_WIPE_ON_SIGN_OUT", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }

    #[test]
    fn rejects_zero_periodic_interval() {
        let err = SyncConfig::from_lookup(lookup(&[("TANDEM_PERIODIC_MS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInterval("TANDEM_PERIODIC_MS")));

        let config = SyncConfig::default().with_periodic_interval(Duration::ZERO);
        assert_eq!(config.periodic_interval, Duration::from_millis(1));
    }
}
