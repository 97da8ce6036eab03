use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// ACME directory the manager talks to. Chosen once, at construction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcmeEndpoint {
    #[default]
    Production,
    Staging,
    Custom(String),
}

impl AcmeEndpoint {
    pub fn directory_url(&self) -> &str {
        match self {
            AcmeEndpoint::Production => LETS_ENCRYPT_PRODUCTION,
            AcmeEndpoint::Staging => LETS_ENCRYPT_STAGING,
            AcmeEndpoint::Custom(url) => url.as_str(),
        }
    }

    /// Accepts `production`, `staging` or a directory URL.
    pub fn parse(value: &str) -> Self {
        match value {
            "production" | "prod" => AcmeEndpoint::Production,
            "staging" => AcmeEndpoint::Staging,
            url => AcmeEndpoint::Custom(url.to_string()),
        }
    }
}

impl std::fmt::Display for AcmeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.directory_url())
    }
}

/// Key algorithm of the certificate private key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    #[default]
    Rsa2048,
    Rsa4096,
    EcdsaP256,
}

/// Bounded exponential backoff: the interval doubles after every attempt up
/// to `max_interval`, and gives up after `max_attempts`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            max_interval,
        }
    }
}

fn default_retry() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30))
}

fn default_poll() -> RetryPolicy {
    RetryPolicy::new(20, Duration::from_secs(1), Duration::from_secs(10))
}

fn default_renew_before_expiry() -> Duration {
    Duration::from_secs(30 * 24 * 3600)
}

fn default_order_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_start_wait() -> Duration {
    Duration::from_secs(30)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderManagerConfig {
    #[serde(default)]
    pub endpoint: AcmeEndpoint,
    #[serde(default)]
    pub account_email: Option<String>,
    /// Where the account key is kept between restarts. Without it a fresh
    /// account key is generated per process.
    #[serde(default)]
    pub account_key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_type: KeyType,
    /// Cached certificates with less remaining lifetime are reissued.
    #[serde(default = "default_renew_before_expiry", with = "humantime_serde")]
    pub renew_before_expiry: Duration,
    /// Deadline of one whole order attempt.
    #[serde(default = "default_order_timeout", with = "humantime_serde")]
    pub order_timeout: Duration,
    /// How long `order()` waits for a fresh order to publish its challenges.
    #[serde(default = "default_start_wait", with = "humantime_serde")]
    pub start_wait: Duration,
    #[serde(default = "default_retry")]
    pub retry: RetryPolicy,
    #[serde(default = "default_poll")]
    pub authorization_poll: RetryPolicy,
    #[serde(default = "default_poll")]
    pub finalize_poll: RetryPolicy,
}

impl Default for OrderManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: AcmeEndpoint::default(),
            account_email: None,
            account_key_path: None,
            key_type: KeyType::default(),
            renew_before_expiry: default_renew_before_expiry(),
            order_timeout: default_order_timeout(),
            start_wait: default_start_wait(),
            retry: default_retry(),
            authorization_poll: default_poll(),
            finalize_poll: default_poll(),
        }
    }
}
