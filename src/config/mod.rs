//! Configuration for campclerk.
//!
//! Everything comes from env vars (loaded via dotenvy early in startup).
//! Missing required values and unparseable values fail fast at startup;
//! they are configuration errors, never retried.

pub(crate) mod helpers;

use std::path::PathBuf;

use secrecy::SecretString;
use url::Url;

use crate::error::ConfigError;

use self::helpers::{optional_env, parsed_env, require_env};

/// Main configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub notify: NotifyConfig,
    pub payments: PaymentsConfig,
    pub poller: PollerConfig,
    pub challenge: ChallengeConfig,
    pub checkpoints: CheckpointConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            server: ServerConfig::resolve()?,
            notify: NotifyConfig::resolve()?,
            payments: PaymentsConfig::resolve()?,
            poller: PollerConfig::resolve()?,
            challenge: ChallengeConfig::resolve()?,
            checkpoints: CheckpointConfig::resolve()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the embedded database file, or `:memory:`.
    pub path: PathBuf,
}

impl DatabaseConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let path = optional_env("CAMPCLERK_DB_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(default_db_path);
        Ok(Self { path })
    }
}

/// Default database location: `~/.campclerk/campclerk.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".campclerk")
        .join("campclerk.db")
}

/// Webhook server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret the settlement callback must present.
    pub callback_secret: SecretString,
    /// Shared token the SMS gateway signs inbound webhooks with.
    pub inbound_auth_token: SecretString,
    /// Bearer token for operator endpoints (status, resend).
    pub operator_token: SecretString,
}

impl ServerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            host: optional_env("SERVER_HOST")?.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parsed_env("SERVER_PORT")?.unwrap_or(8700),
            callback_secret: SecretString::from(require_env(
                "SETTLEMENT_CALLBACK_SECRET",
                "Shared secret for the executor's settlement callback.",
            )?),
            inbound_auth_token: SecretString::from(require_env(
                "INBOUND_AUTH_TOKEN",
                "Auth token configured on the SMS gateway's webhook.",
            )?),
            operator_token: SecretString::from(require_env(
                "OPERATOR_TOKEN",
                "Bearer token for operator endpoints.",
            )?),
        })
    }
}

/// Notification channel configuration. Either channel may be absent; the
/// notifier falls back across whatever is configured.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub sms: Option<SmsGatewayConfig>,
    pub email: Option<EmailConfig>,
}

#[derive(Debug, Clone)]
pub struct SmsGatewayConfig {
    pub endpoint: Url,
    pub auth_token: SecretString,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub endpoint: Url,
    pub api_key: SecretString,
    pub from: String,
}

impl NotifyConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let sms = match optional_env("SMS_GATEWAY_URL")? {
            Some(raw) => Some(SmsGatewayConfig {
                endpoint: parse_url("SMS_GATEWAY_URL", &raw)?,
                auth_token: SecretString::from(require_env(
                    "SMS_GATEWAY_TOKEN",
                    "API token for the SMS gateway.",
                )?),
                from: require_env("SMS_FROM", "Sending number for outbound SMS.")?,
            }),
            None => None,
        };

        let email = match optional_env("EMAIL_API_URL")? {
            Some(raw) => Some(EmailConfig {
                endpoint: parse_url("EMAIL_API_URL", &raw)?,
                api_key: SecretString::from(require_env(
                    "EMAIL_API_KEY",
                    "API key for the transactional email sender.",
                )?),
                from: require_env("EMAIL_FROM", "From address for outbound email.")?,
            }),
            None => None,
        };

        Ok(Self { sms, email })
    }
}

/// Payment processor configuration.
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub base_url: Url,
    pub secret: SecretString,
    /// Bounded attempts for transient capture/cancel failures.
    pub max_attempts: u32,
}

impl PaymentsConfig {
    fn resolve() -> Result<Self, ConfigError> {
        let raw = require_env(
            "PAYMENTS_API_URL",
            "Base URL of the payment processor API.",
        )?;
        Ok(Self {
            base_url: parse_url("PAYMENTS_API_URL", &raw)?,
            secret: SecretString::from(require_env(
                "PAYMENTS_API_SECRET",
                "API secret for the payment processor.",
            )?),
            max_attempts: parsed_env("PAYMENTS_MAX_ATTEMPTS")?.unwrap_or(3),
        })
    }
}

/// Poller cadence configuration. The tick is the uniform external trigger;
/// per-plan frequency comes from the proximity tiers.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub tick_secs: u64,
    pub probe_timeout_secs: u64,
}

impl PollerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            tick_secs: parsed_env("POLL_TICK_SECS")?.unwrap_or(60),
            probe_timeout_secs: parsed_env("PROBE_TIMEOUT_SECS")?.unwrap_or(10),
        })
    }
}

/// Challenge-ticket configuration.
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    /// Public base URL magic links are built from.
    pub public_base_url: String,
    pub ticket_ttl_secs: i64,
    pub resend_min_gap_secs: i64,
    pub sweep_interval_secs: u64,
}

impl ChallengeConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            public_base_url: require_env(
                "PUBLIC_BASE_URL",
                "Public base URL for magic resume links, e.g. https://clerk.example.com",
            )?,
            ticket_ttl_secs: parsed_env("TICKET_TTL_SECS")?.unwrap_or(600),
            resend_min_gap_secs: parsed_env("RESEND_MIN_GAP_SECS")?.unwrap_or(120),
            sweep_interval_secs: parsed_env("TICKET_SWEEP_SECS")?.unwrap_or(30),
        })
    }
}

/// Checkpoint retention configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub keep: usize,
    pub max_recovery_age_secs: i64,
}

impl CheckpointConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            keep: parsed_env("CHECKPOINT_KEEP")?.unwrap_or(10),
            max_recovery_age_secs: parsed_env("CHECKPOINT_MAX_AGE_SECS")?.unwrap_or(1800),
        })
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("must be a valid URL: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_poller_env() {
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("POLL_TICK_SECS");
            std::env::remove_var("PROBE_TIMEOUT_SECS");
        }
    }

    #[test]
    fn poller_defaults_apply() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_poller_env();

        let cfg = PollerConfig::resolve().expect("resolve");
        assert_eq!(cfg.tick_secs, 60);
        assert_eq!(cfg.probe_timeout_secs, 10);
    }

    #[test]
    fn poller_env_overrides_and_rejects_garbage() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_poller_env();

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("POLL_TICK_SECS", "30");
        }
        let cfg = PollerConfig::resolve().expect("resolve");
        assert_eq!(cfg.tick_secs, 30);

        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("POLL_TICK_SECS", "often");
        }
        let err = PollerConfig::resolve().expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        clear_poller_env();
    }

    #[test]
    fn missing_required_secret_names_the_key() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::remove_var("PAYMENTS_API_URL");
        }

        let err = PaymentsConfig::resolve().expect_err("missing");
        assert!(err.to_string().contains("PAYMENTS_API_URL"));
    }
}
