//! DNS-01 challenge providers
//!
//! A provider publishes the TXT record `_acme-challenge.<domain>` holding the
//! challenge value, waits until it is visible, and removes it afterwards.
//!
//! Two providers are available:
//! - [`DnsimpleProvider`] manages records through the DNSimple v2 API.
//! - [`StandaloneProvider`] answers the TXT queries itself; the
//!   `_acme-challenge` names must be delegated (NS) to the host running it.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::client::ChallengeError;
use crate::config::{ConfigError, DnsSettings, ProviderKind};
use crate::error::IssueError;

pub mod dnsimple;
pub mod propagation;
pub mod standalone;

pub use dnsimple::DnsimpleProvider;
pub use standalone::StandaloneProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no hosted zone found for {0}")]
    ZoneNotFound(String),

    #[error("no record was created for {0}")]
    UnknownRecord(String),

    #[error("DNS lookup failed: {0}")]
    Resolve(#[from] trust_dns_resolver::error::ResolveError),

    #[error("{record} not visible after {attempts} attempts")]
    NotPropagated { record: String, attempts: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Publishes and removes DNS-01 TXT records.
pub trait DnsChallengeProvider {
    /// Publish `value` at `_acme-challenge.<domain>`.
    fn present(&self, domain: &str, value: &str) -> Result<(), ProviderError>;

    /// Remove what [`present`](Self::present) published.
    fn cleanup(&self, domain: &str, value: &str) -> Result<(), ProviderError>;

    /// Block until the record is visible to resolvers.
    fn wait_for_propagation(&self, domain: &str, value: &str) -> Result<(), ProviderError> {
        propagation::wait_for_txt(
            &challenge_record_name(domain),
            value,
            self.attempts(),
            self.interval(),
        )
    }

    /// How many lookups to make before giving up. Defaults to 30 tries.
    fn attempts(&self) -> usize {
        30
    }

    /// How long to wait between lookups. Defaults to 2 seconds.
    fn interval(&self) -> Duration {
        Duration::from_secs(2)
    }
}

/// `_acme-challenge.<domain>`, without wildcard label or trailing dot.
pub fn challenge_record_name(domain: &str) -> String {
    let domain = domain.trim_end_matches('.');
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    format!("_acme-challenge.{}", domain.to_ascii_lowercase())
}

/// Build the provider selected in `settings`.
pub fn new_provider(settings: &DnsSettings) -> Result<Box<dyn DnsChallengeProvider>, IssueError> {
    match settings.provider {
        ProviderKind::Dnsimple => {
            let token = settings
                .credentials
                .api_key
                .clone()
                .ok_or(ConfigError::MissingCredential {
                    provider: ProviderKind::Dnsimple,
                    missing: "an API key (--api-key)",
                })?;

            let mut builder = DnsimpleProvider::builder(token);
            if let Some(user) = &settings.credentials.user {
                builder = builder.user(user);
            }
            if let Some(url) = &settings.api_url {
                builder = builder.base_url(url.clone());
            }
            let provider = builder.build().map_err(IssueError::ProviderSetup)?;
            Ok(Box::new(provider))
        }
        ProviderKind::Standalone => Ok(Box::new(StandaloneProvider::new(settings.bind))),
    }
}

/// Present, await and validate one challenge, always cleaning up the record.
pub(crate) fn run_challenge<F>(
    provider: &dyn DnsChallengeProvider,
    domain: &str,
    value: &str,
    validate: F,
) -> Result<(), ChallengeError>
where
    F: FnOnce() -> Result<(), String>,
{
    debug!(domain = %domain, "Presenting DNS-01 challenge");
    provider
        .present(domain, value)
        .map_err(ChallengeError::Present)?;

    let outcome = provider
        .wait_for_propagation(domain, value)
        .map_err(ChallengeError::Propagation)
        .and_then(|_| validate().map_err(ChallengeError::Validation));

    if let Err(e) = provider.cleanup(domain, value) {
        warn!(domain = %domain, error = %e, "Failed to clean up DNS-01 challenge record");
    }

    outcome
}
