//! Environment-derived daemon configuration and secret preflight.
//!
//! Configuration is read once at startup. Secret material is held in
//! [`SecretString`] so it never lands in debug output or logs; the
//! preflight fails fast on missing required secrets and warns on weak
//! ones instead of discovering the problem on the first request.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use opsd_core::alerts::AlertConfig;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

/// Minimum recommended secret length; shorter secrets warn at startup.
pub const MIN_SECRET_LEN: usize = 16;

/// Default HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8787;

/// Default per-group backpressure limit on pending external calls.
pub const DEFAULT_BACKPRESSURE_LIMIT: i64 = 10;

/// Default per-provider rate limit (requests per window).
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 60;

/// Default rate-limit window in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Default per-provider daily call quota.
pub const DEFAULT_DAILY_QUOTA: i64 = 500;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required secret is absent.
    #[error("missing required secret: {name}")]
    MissingSecret {
        /// Environment variable name.
        name: &'static str,
    },

    /// A variable failed to parse.
    #[error("invalid value for {name}: {message}")]
    Invalid {
        /// Environment variable name.
        name: &'static str,
        /// What went wrong.
        message: String,
    },
}

/// Daemon configuration.
pub struct Config {
    /// Read-auth secret (`X-OS-SECRET`).
    pub http_secret: SecretString,
    /// Current write secret (`X-WRITE-SECRET`).
    pub write_secret_current: Option<SecretString>,
    /// Previous write secret, accepted during rotation.
    pub write_secret_previous: Option<SecretString>,
    /// Whether strict-mode validators are engaged.
    pub strict: bool,
    /// Telegram alert transport token; alerts disabled when absent.
    pub telegram_bot_token: Option<SecretString>,
    /// Telegram chat the alerts go to.
    pub telegram_chat_id: Option<String>,
    /// Alert rule tuning.
    pub alerts: AlertConfig,
    /// HMAC secret for ExtCall parameter hashing.
    pub ext_call_hmac_secret: SecretString,
    /// Per-group cap on pending external calls.
    pub ext_backpressure_limit: i64,
    /// Per-provider rate limit: max requests per window.
    pub ext_rate_limit_max: u32,
    /// Per-provider rate-limit window.
    pub ext_rate_limit_window: Duration,
    /// Per-provider daily quota.
    pub ext_daily_quota: i64,
    /// Chat-bus group identifier returned by `GET /ops/messages`.
    pub chat_group_jid: Option<String>,
    /// Store directory holding the database file.
    pub store_dir: PathBuf,
    /// HTTP listen port.
    pub http_port: u16,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secrets are deliberately absent from the debug form.
        f.debug_struct("Config")
            .field("strict", &self.strict)
            .field("store_dir", &self.store_dir)
            .field("http_port", &self.http_port)
            .field("ext_backpressure_limit", &self.ext_backpressure_limit)
            .field("telegram_enabled", &self.telegram_bot_token.is_some())
            .finish_non_exhaustive()
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_opt(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            message: e.to_string(),
        }),
    }
}

impl Config {
    /// Loads configuration from the environment and runs the secret
    /// preflight.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSecret`] when `OS_HTTP_SECRET` is
    /// absent and [`ConfigError::Invalid`] for unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_secret = env_opt("OS_HTTP_SECRET")
            .map(SecretString::from)
            .ok_or(ConfigError::MissingSecret {
                name: "OS_HTTP_SECRET",
            })?;
        preflight_length("OS_HTTP_SECRET", &http_secret);

        let write_secret_current = env_opt("COCKPIT_WRITE_SECRET_CURRENT").map(SecretString::from);
        let write_secret_previous =
            env_opt("COCKPIT_WRITE_SECRET_PREVIOUS").map(SecretString::from);
        if write_secret_current.is_none() {
            warn!("COCKPIT_WRITE_SECRET_CURRENT is not set; all writes will be rejected");
        }
        if let Some(secret) = &write_secret_current {
            preflight_length("COCKPIT_WRITE_SECRET_CURRENT", secret);
        }

        let ext_call_hmac_secret = match env_opt("EXT_CALL_HMAC_SECRET") {
            Some(secret) => SecretString::from(secret),
            None => {
                // Parameter hashes stay verifiable but rotate with the
                // HTTP secret; a dedicated secret is preferred.
                warn!("EXT_CALL_HMAC_SECRET is not set; falling back to OS_HTTP_SECRET");
                SecretString::from(http_secret.expose_secret().to_string())
            }
        };

        let strict = matches!(env_opt("GOV_STRICT").as_deref(), Some("1"));

        let telegram_bot_token = env_opt("ALERT_TELEGRAM_BOT_TOKEN").map(SecretString::from);
        let telegram_chat_id = env_opt("ALERT_TELEGRAM_CHAT_ID");
        if telegram_bot_token.is_some() != telegram_chat_id.is_some() {
            warn!("telegram alerting needs both ALERT_TELEGRAM_BOT_TOKEN and ALERT_TELEGRAM_CHAT_ID; alerts disabled");
        }

        let defaults = AlertConfig::default();
        let alerts = AlertConfig {
            worker_offline_grace: Duration::from_millis(env_parse(
                "WORKER_OFFLINE_GRACE_MS",
                u64::try_from(defaults.worker_offline_grace.as_millis()).unwrap_or(120_000),
            )?),
            dispatch_fail_threshold: env_parse(
                "DISPATCH_FAIL_THRESHOLD",
                defaults.dispatch_fail_threshold,
            )?,
            dispatch_fail_window: defaults.dispatch_fail_window,
            dedup_window: Duration::from_millis(env_parse(
                "ALERT_DEDUP_WINDOW_MS",
                u64::try_from(defaults.dedup_window.as_millis()).unwrap_or(300_000),
            )?),
        };

        Ok(Self {
            http_secret,
            write_secret_current,
            write_secret_previous,
            strict,
            telegram_bot_token,
            telegram_chat_id,
            alerts,
            ext_call_hmac_secret,
            ext_backpressure_limit: env_parse(
                "EXT_BACKPRESSURE_LIMIT",
                DEFAULT_BACKPRESSURE_LIMIT,
            )?,
            ext_rate_limit_max: env_parse("EXT_RATE_LIMIT_MAX", DEFAULT_RATE_LIMIT_MAX)?,
            ext_rate_limit_window: Duration::from_secs(env_parse(
                "EXT_RATE_LIMIT_WINDOW_SECS",
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )?),
            ext_daily_quota: env_parse("EXT_DAILY_QUOTA_DEFAULT", DEFAULT_DAILY_QUOTA)?,
            chat_group_jid: env_opt("CHAT_GROUP_JID"),
            store_dir: env_opt("OPSD_STORE_DIR")
                .map_or_else(|| PathBuf::from("opsd-store"), PathBuf::from),
            http_port: env_parse("OPSD_HTTP_PORT", DEFAULT_HTTP_PORT)?,
        })
    }

    /// Constant-time check of the read secret.
    #[must_use]
    pub fn read_secret_matches(&self, presented: &str) -> bool {
        ct_eq(self.http_secret.expose_secret(), presented)
    }

    /// Constant-time check of the write secret against `CURRENT` and
    /// `PREVIOUS` (dual-secret rotation).
    ///
    /// Both candidates are always compared so timing does not reveal
    /// which one matched.
    #[must_use]
    pub fn write_secret_matches(&self, presented: &str) -> bool {
        let current = self
            .write_secret_current
            .as_ref()
            .map_or(false, |s| ct_eq(s.expose_secret(), presented));
        let previous = self
            .write_secret_previous
            .as_ref()
            .map_or(false, |s| ct_eq(s.expose_secret(), presented));
        current | previous
    }

    /// Returns true when both Telegram settings are present.
    #[must_use]
    pub fn telegram_enabled(&self) -> bool {
        self.telegram_bot_token.is_some() && self.telegram_chat_id.is_some()
    }
}

fn ct_eq(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn preflight_length(name: &str, secret: &SecretString) {
    if secret.expose_secret().len() < MIN_SECRET_LEN {
        warn!(
            secret = name,
            min_length = MIN_SECRET_LEN,
            "secret is shorter than the recommended minimum"
        );
    }
}
