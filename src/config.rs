//! Runtime configuration, built from environment variables.
//!
//! Everything has a sensible default except the inbox account itself; the
//! binary refuses to start without `MAILFLOW_IMAP_HOST`.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Inbound (IMAP) account configuration.
#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Sender allowlist: exact email, `@domain`, bare domain, or `*`.
    pub allowed_senders: Vec<String>,
    pub poll_interval: Duration,
}

/// Outbound (SMTP) transport configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// When false the transport connects in the clear (local relays, tests).
    pub tls: bool,
    pub from_address: String,
    pub default_recipient: String,
    pub send_timeout: Duration,
}

/// Workflow engine tuning.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Max concurrently running steps within one run.
    pub step_concurrency: usize,
    /// Per-step deadline; expiry marks the step timed out.
    pub step_timeout: Duration,
    /// Abort the whole run on the first step failure.
    pub strict_fail: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_concurrency: 4,
            step_timeout: Duration::from_secs(60),
            strict_fail: false,
        }
    }
}

/// Inbox poll retry tuning.
#[derive(Debug, Clone)]
pub struct PollRetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for PollRetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub inbox: InboxConfig,
    pub smtp: SmtpConfig,
    pub engine: EngineSettings,
    pub retry: PollRetryConfig,
    /// Routing rules document (TOML).
    pub routing_config: PathBuf,
    /// Where the inbox checkpoint is persisted between polls.
    pub checkpoint_path: PathBuf,
    /// Max workflow runs in flight across the whole process.
    pub max_concurrent_runs: usize,
}

impl RuntimeConfig {
    /// Build from `MAILFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = std::env::var("MAILFLOW_IMAP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("MAILFLOW_IMAP_HOST".into()))?;

        let username = std::env::var("MAILFLOW_IMAP_USERNAME").unwrap_or_default();
        let password = std::env::var("MAILFLOW_IMAP_PASSWORD").unwrap_or_default();

        let smtp_host = std::env::var("MAILFLOW_SMTP_HOST")
            .unwrap_or_else(|_| imap_host.replace("imap", "smtp"));
        let smtp_username =
            std::env::var("MAILFLOW_SMTP_USERNAME").unwrap_or_else(|_| username.clone());
        let smtp_password =
            std::env::var("MAILFLOW_SMTP_PASSWORD").unwrap_or_else(|_| password.clone());
        let from_address =
            std::env::var("MAILFLOW_FROM_ADDRESS").unwrap_or_else(|_| smtp_username.clone());
        let default_recipient =
            std::env::var("MAILFLOW_DEFAULT_RECIPIENT").unwrap_or_else(|_| from_address.clone());

        let allowed_senders: Vec<String> = std::env::var("MAILFLOW_ALLOWED_SENDERS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let inbox = InboxConfig {
            imap_host,
            imap_port: env_or("MAILFLOW_IMAP_PORT", 993),
            username,
            password: SecretString::from(password),
            mailbox: std::env::var("MAILFLOW_MAILBOX").unwrap_or_else(|_| "INBOX".into()),
            allowed_senders,
            poll_interval: Duration::from_secs(env_or("MAILFLOW_POLL_INTERVAL_SECS", 60)),
        };

        let smtp = SmtpConfig {
            smtp_host,
            smtp_port: env_or("MAILFLOW_SMTP_PORT", 587),
            username: smtp_username,
            password: SecretString::from(smtp_password),
            tls: env_or("MAILFLOW_SMTP_TLS", true),
            from_address,
            default_recipient,
            send_timeout: Duration::from_secs(env_or("MAILFLOW_SMTP_TIMEOUT_SECS", 30)),
        };

        let engine = EngineSettings {
            step_concurrency: env_or("MAILFLOW_STEP_CONCURRENCY", 4).max(1),
            step_timeout: Duration::from_secs(env_or("MAILFLOW_STEP_TIMEOUT_SECS", 60)),
            strict_fail: env_or("MAILFLOW_STRICT_FAIL", false),
        };

        let retry = PollRetryConfig {
            base_delay: Duration::from_millis(env_or("MAILFLOW_POLL_BACKOFF_BASE_MS", 500)),
            multiplier: env_or("MAILFLOW_POLL_BACKOFF_MULTIPLIER", 2.0),
            max_delay: Duration::from_secs(env_or("MAILFLOW_POLL_BACKOFF_MAX_SECS", 30)),
            max_attempts: env_or("MAILFLOW_POLL_MAX_ATTEMPTS", 5).max(1),
        };

        Ok(Self {
            inbox,
            smtp,
            engine,
            retry,
            routing_config: std::env::var("MAILFLOW_ROUTING_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./config/routing.toml")),
            checkpoint_path: std::env::var("MAILFLOW_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/checkpoint.json")),
            max_concurrent_runs: env_or("MAILFLOW_MAX_CONCURRENT_RUNS", 4).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_settings_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.step_concurrency, 4);
        assert_eq!(settings.step_timeout, Duration::from_secs(60));
        assert!(!settings.strict_fail);
    }

    #[test]
    fn retry_defaults_are_bounded() {
        let retry = PollRetryConfig::default();
        assert!(retry.base_delay < retry.max_delay);
        assert!(retry.multiplier > 1.0);
        assert!(retry.max_attempts >= 1);
    }

    #[test]
    fn env_or_falls_back_on_missing() {
        // SAFETY: test-local variable name, no concurrent reader.
        unsafe { std::env::remove_var("MAILFLOW_TEST_UNSET") };
        assert_eq!(env_or("MAILFLOW_TEST_UNSET", 42_u16), 42);
    }
}
