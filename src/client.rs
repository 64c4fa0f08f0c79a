//! The ACME client seam.
//!
//! The orchestrator only talks to the CA through [`AcmeClient`], obtained from
//! a [`Connector`]. The production implementation lives in [`crate::acme`].

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::account::{Account, RegistrationHandle};
use crate::certificate::IssuedCertificate;
use crate::config::Domain;
use crate::key::{KeyError, KeyType};
use crate::provider::{DnsChallengeProvider, ProviderError};

/// ACME challenge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChallengeType {
    Http01,
    TlsSni01,
    TlsAlpn01,
    Dns01,
}

impl ChallengeType {
    /// Every type except DNS-01.
    pub const NON_DNS: [ChallengeType; 3] = [
        ChallengeType::Http01,
        ChallengeType::TlsSni01,
        ChallengeType::TlsAlpn01,
    ];
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::TlsSni01 => "tls-sni-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::Dns01 => "dns-01",
        })
    }
}

#[derive(Debug, Error)]
pub enum AcmeError {
    /// Error reported by the CA or the protocol engine, kept verbatim.
    #[error("{0}")]
    Protocol(String),

    #[error("account key must be an EC P-256 key")]
    UnsupportedAccountKey,

    #[error("the CA registered a different key than the persisted account key")]
    KeyMismatch,

    #[error("account is already registered")]
    AlreadyRegistered,

    #[error("account is not registered")]
    NotRegistered,

    #[error("terms of service have not been agreed to")]
    TermsNotAgreed,
}

/// Why a single domain could not be validated.
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("failed to present TXT record: {0}")]
    Present(#[source] ProviderError),

    #[error("TXT record did not propagate: {0}")]
    Propagation(#[source] ProviderError),

    #[error("CA rejected the challenge: {0}")]
    Validation(String),
}

/// Per-domain validation failures; never empty when reported.
#[derive(Debug, Default)]
pub struct ChallengeFailures(BTreeMap<String, ChallengeError>);

impl ChallengeFailures {
    pub fn insert(&mut self, domain: impl Into<String>, error: ChallengeError) {
        self.0.insert(domain.into(), error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, domain: &str) -> Option<&ChallengeError> {
        self.0.get(domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl fmt::Display for ChallengeFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DNS-01 validation failed for {} domain(s)", self.0.len())?;
        for (domain, error) in &self.0 {
            write!(f, "; {}: {}", domain, error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ObtainError {
    #[error("no domains requested")]
    NoDomains,

    #[error("{count} domains requested without bundling; only one certificate covering all names can be issued")]
    BundleRequired { count: usize },

    #[error("no provider configured for the {0} challenge")]
    NoSolver(ChallengeType),

    #[error("{0}")]
    Challenges(ChallengeFailures),

    #[error("order was not ready after {0} refreshes")]
    OrderNotReady(usize),

    #[error("failed to generate certificate key: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Acme(#[from] AcmeError),
}

/// Operations the orchestrator needs from an ACME implementation.
pub trait AcmeClient {
    /// Never use the given challenge types.
    fn exclude_challenges(&mut self, types: &[ChallengeType]);

    /// Route DNS-01 challenges to `provider`.
    fn set_dns01_provider(&mut self, provider: Box<dyn DnsChallengeProvider>);

    /// Register the account the client was connected with.
    fn register(&mut self) -> Result<RegistrationHandle, AcmeError>;

    /// Accept the CA's current subscriber agreement.
    fn agree_to_tos(&mut self) -> Result<(), AcmeError>;

    /// Validate every domain and issue one certificate covering all of them.
    ///
    /// Any per-domain failure is reported as [`ObtainError::Challenges`] and
    /// no certificate is issued.
    fn obtain_certificate(
        &mut self,
        domains: &[Domain],
        bundle: bool,
    ) -> Result<IssuedCertificate, ObtainError>;
}

/// Builds an [`AcmeClient`] bound to a directory and an account.
pub trait Connector {
    fn connect(
        &self,
        directory_url: &str,
        account: &Account,
        certificate_key_type: KeyType,
    ) -> Result<Box<dyn AcmeClient>, AcmeError>;
}
