//! Run configuration: domains, account email, CA directory and storage root.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use reqwest::Url;
use thiserror::Error;

use crate::key::KeyType;

/// The Let's Encrypt staging ACMEv2 directory.
pub const LETS_ENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// The Let's Encrypt production ACMEv2 directory.
pub const LETS_ENCRYPT_PRODUCTION_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

pub const DEFAULT_DATA_ROOT: &str = ".data";

/// Placeholder replaced by the run's Unix timestamp in templated emails.
pub const TIMESTAMP_PLACEHOLDER: &str = "%v";

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no domains given")]
    NoDomains,

    #[error("domain list contains an empty entry at position {0}")]
    EmptyDomain(usize),

    #[error("invalid domain `{domain}`: {reason}")]
    InvalidDomain { domain: String, reason: &'static str },

    #[error("domain `{0}` is listed more than once")]
    DuplicateDomain(String),

    #[error("an email address is required")]
    MissingEmail,

    #[error("invalid email `{email}`: {reason}")]
    InvalidEmail { email: String, reason: &'static str },

    #[error("email `{0}` contains a %v placeholder; pass it as a template to substitute the timestamp")]
    UntemplatedPlaceholder(String),

    #[error("email template `{0}` has no %v placeholder")]
    TemplateWithoutPlaceholder(String),

    #[error("invalid ACME directory URL `{url}`: {reason}")]
    InvalidDirectoryUrl { url: String, reason: String },

    #[error("unknown DNS provider `{0}` (expected dnsimple or standalone)")]
    UnknownProvider(String),

    #[error("DNS provider {provider} needs {missing}")]
    MissingCredential {
        provider: ProviderKind,
        missing: &'static str,
    },
}

/// A validated, lowercase DNS name, optionally with a leading `*.` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(String);

impl Domain {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    /// The name the DNS-01 challenge is published under (wildcard stripped).
    pub fn base_name(&self) -> &str {
        self.0.strip_prefix("*.").unwrap_or(&self.0)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Domain {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().trim_end_matches('.').to_ascii_lowercase();
        let invalid = |reason| ConfigError::InvalidDomain {
            domain: s.to_string(),
            reason,
        };

        if name.len() > MAX_DOMAIN_LEN {
            return Err(invalid("longer than 253 characters"));
        }

        let base = name.strip_prefix("*.").unwrap_or(&name);
        let labels: Vec<&str> = base.split('.').collect();
        if labels.len() < 2 {
            return Err(invalid("needs at least two labels"));
        }

        for label in labels {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(invalid("label longer than 63 characters"));
            }
            if !label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
            {
                return Err(invalid("labels may only contain letters, digits and hyphens"));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(invalid("labels may not start or end with a hyphen"));
            }
        }

        Ok(Domain(name))
    }
}

/// Split a comma-separated domain list into validated, unique names,
/// preserving order.
pub fn parse_domains(list: &str) -> Result<Vec<Domain>, ConfigError> {
    if list.trim().is_empty() {
        return Err(ConfigError::NoDomains);
    }

    let mut seen = HashSet::new();
    let mut domains = Vec::new();
    for (position, entry) in list.split(',').enumerate() {
        if entry.trim().is_empty() {
            return Err(ConfigError::EmptyDomain(position + 1));
        }

        let domain: Domain = entry.parse()?;
        if !seen.insert(domain.clone()) {
            return Err(ConfigError::DuplicateDomain(domain.0));
        }
        domains.push(domain);
    }

    Ok(domains)
}

/// The operator contact address. Timestamp templating must be asked for
/// explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailAddress {
    Exact(String),
    /// Every `%v` is replaced with the run's Unix timestamp.
    Template(String),
}

impl EmailAddress {
    /// Produce the concrete address for a run started at `timestamp`.
    pub fn resolve(&self, timestamp: i64) -> Result<String, ConfigError> {
        let email = match self {
            EmailAddress::Exact(email) if email.contains(TIMESTAMP_PLACEHOLDER) => {
                return Err(ConfigError::UntemplatedPlaceholder(email.clone()))
            }
            EmailAddress::Exact(email) => email.clone(),
            EmailAddress::Template(template) if !template.contains(TIMESTAMP_PLACEHOLDER) => {
                return Err(ConfigError::TemplateWithoutPlaceholder(template.clone()))
            }
            EmailAddress::Template(template) => {
                template.replace(TIMESTAMP_PLACEHOLDER, &timestamp.to_string())
            }
        };

        validate_email(&email)?;
        Ok(email)
    }
}

// The address doubles as a directory name under `users/`.
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidEmail {
        email: email.to_string(),
        reason,
    };

    if email.is_empty() {
        return Err(ConfigError::MissingEmail);
    }
    if email.contains(['/', '\\', '\0']) || email.chars().any(char::is_whitespace) {
        return Err(invalid("contains path separators, NUL or whitespace"));
    }
    if email.starts_with('.') {
        return Err(invalid("may not start with a dot"));
    }

    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(())
        }
        _ => Err(invalid("expected local@domain")),
    }
}

/// Check that a directory URL is an absolute http(s) URL.
pub fn parse_directory_url(url: &str) -> Result<String, ConfigError> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidDirectoryUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "https" | "http" => Ok(url.to_string()),
        scheme => Err(ConfigError::InvalidDirectoryUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme `{}`", scheme),
        }),
    }
}

/// Everything the orchestrator needs for one issuance run.
#[derive(Debug, Clone)]
pub struct IssueConfig {
    pub directory_url: String,
    pub data_root: PathBuf,
    pub email: EmailAddress,
    pub account_key_type: KeyType,
    pub certificate_key_type: KeyType,
}

impl IssueConfig {
    pub fn new(email: EmailAddress) -> Self {
        IssueConfig {
            directory_url: LETS_ENCRYPT_STAGING_URL.to_string(),
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            email,
            account_key_type: KeyType::EcP256,
            certificate_key_type: KeyType::RSA2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Dnsimple,
    Standalone,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Dnsimple => f.write_str("dnsimple"),
            ProviderKind::Standalone => f.write_str("standalone"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dnsimple" => Ok(ProviderKind::Dnsimple),
            "standalone" => Ok(ProviderKind::Standalone),
            _ => Err(ConfigError::UnknownProvider(s.to_string())),
        }
    }
}

/// DNS provider credentials.
#[derive(Clone, Default)]
pub struct DnsCredentials {
    pub user: Option<String>,
    pub api_key: Option<String>,
}

impl fmt::Debug for DnsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCredentials")
            .field("user", &self.user)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub provider: ProviderKind,
    pub credentials: DnsCredentials,
    /// Overrides the provider's API endpoint (DNSimple sandbox, tests).
    pub api_url: Option<String>,
    /// Address the standalone responder listens on.
    pub bind: SocketAddr,
}

impl DnsSettings {
    pub fn new(provider: ProviderKind, credentials: DnsCredentials) -> Self {
        DnsSettings {
            provider,
            credentials,
            api_url: None,
            bind: SocketAddr::from(([0, 0, 0, 0], 53)),
        }
    }
}
