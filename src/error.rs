use thiserror::Error;

use crate::account::AccountError;
use crate::certificate::CertificateBundle;
use crate::client::{AcmeError, ChallengeFailures, ObtainError};
use crate::config::ConfigError;
use crate::key::{EncodingError, KeyError};
use crate::persist::StorageError;
use crate::provider::ProviderError;

/// Exit code for invalid invocations and configuration.
pub const EXIT_USAGE: u8 = 2;

/// Exit code for every failure after the configuration was accepted.
pub const EXIT_FAILURE: u8 = 1;

/// Terminal failure of an issuance run.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] KeyError),

    #[error("key encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("DNS provider could not be set up: {0}")]
    ProviderSetup(#[source] ProviderError),

    #[error("account key could not be saved: {0}")]
    AccountNotSaved(#[source] StorageError),

    #[error("cannot reach ACME directory: {0}")]
    Connect(#[source] AcmeError),

    #[error("account registration rejected: {0}")]
    Registration(#[source] AcmeError),

    #[error("terms of service agreement failed: {0}")]
    TermsOfService(#[source] AcmeError),

    #[error("{0}")]
    ChallengeValidation(ChallengeFailures),

    #[error("certificate issuance failed: {0}")]
    Issuance(#[source] ObtainError),

    #[error("certificate for {} was issued but could not be saved: {source}", .bundle.domain_list())]
    CertificateNotSaved {
        bundle: Box<CertificateBundle>,
        #[source]
        source: StorageError,
    },

    #[error("invalid account state: {0}")]
    InvalidState(#[from] AccountError),
}

impl IssueError {
    pub fn exit_code(&self) -> u8 {
        match self {
            IssueError::Configuration(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<ObtainError> for IssueError {
    fn from(err: ObtainError) -> Self {
        match err {
            ObtainError::Challenges(failures) => IssueError::ChallengeValidation(failures),
            other => IssueError::Issuance(other),
        }
    }
}
