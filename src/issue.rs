//! The issuance run.
//!
//! One run walks the states below in order and stops at the first failure:
//!
//! ```text
//! Initialized -> KeyGenerated -> AccountPersisted -> Registered -> TosAgreed
//!     -> Validating -> Issued -> Persisted
//! ```
//!
//! Nothing is retried. The account key is on disk before the CA is contacted,
//! and certificate files are only written once every domain has validated.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::account::{Account, RegistrationHandle};
use crate::certificate::CertificateBundle;
use crate::client::{ChallengeType, Connector};
use crate::config::{parse_domains, IssueConfig};
use crate::error::IssueError;
use crate::key;
use crate::persist::FileStore;
use crate::provider::DnsChallengeProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initialized,
    KeyGenerated,
    AccountPersisted,
    Registered,
    TosAgreed,
    Validating,
    Issued,
    Persisted,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a successful run produced.
#[derive(Debug)]
pub struct Issued {
    pub email: String,
    pub registration: RegistrationHandle,
    pub account_dir: PathBuf,
    pub certificate_dir: PathBuf,
    pub bundle: CertificateBundle,
}

pub struct Issuer<'a> {
    config: IssueConfig,
    connector: &'a dyn Connector,
    store: FileStore,
    state: State,
}

impl<'a> Issuer<'a> {
    pub fn new(config: IssueConfig, connector: &'a dyn Connector) -> Self {
        let store = FileStore::new(&config.data_root);
        Issuer {
            config,
            connector,
            store,
            state: State::Initialized,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Issue one certificate for the comma-separated `domains`.
    pub fn issue(
        &mut self,
        domains: &str,
        provider: Box<dyn DnsChallengeProvider>,
    ) -> Result<Issued, IssueError> {
        self.issue_at(domains, provider, Utc::now())
    }

    /// Like [`issue`](Self::issue), with an explicit run timestamp. The
    /// timestamp fills email templates and names the certificate directory.
    pub fn issue_at(
        &mut self,
        domains: &str,
        provider: Box<dyn DnsChallengeProvider>,
        now: DateTime<Utc>,
    ) -> Result<Issued, IssueError> {
        self.state = State::Initialized;
        let result = self.run(domains, provider, now);
        if let Err(e) = &result {
            debug!(state = %self.state, error = %e, "Issuance stopped");
            self.state = State::Failed;
        }
        result
    }

    /// Write an already issued bundle. Used by [`issue`](Self::issue) and
    /// available to retry after [`IssueError::CertificateNotSaved`].
    pub fn persist(&self, bundle: &CertificateBundle) -> Result<PathBuf, IssueError> {
        self.store
            .save_certificate(bundle)
            .map_err(|source| IssueError::CertificateNotSaved {
                bundle: Box::new(bundle.clone()),
                source,
            })
    }

    fn advance(&mut self, next: State) {
        info!(from = %self.state, to = %next, "Issuance state changed");
        self.state = next;
    }

    fn run(
        &mut self,
        domains: &str,
        provider: Box<dyn DnsChallengeProvider>,
        now: DateTime<Utc>,
    ) -> Result<Issued, IssueError> {
        let domains = parse_domains(domains)?;
        let email = self.config.email.resolve(now.timestamp())?;
        let mut account = Account::create(email, self.config.account_key_type)?;
        self.advance(State::KeyGenerated);

        let private_pem = key::encode_private_key(account.private_key())?;
        let public_pem = key::encode_public_key(account.private_key())?;
        let account_dir = self
            .store
            .save_account_keys(account.email(), &private_pem, &public_pem)
            .map_err(IssueError::AccountNotSaved)?;
        self.advance(State::AccountPersisted);

        let mut client = self
            .connector
            .connect(
                &self.config.directory_url,
                &account,
                self.config.certificate_key_type,
            )
            .map_err(IssueError::Connect)?;
        let registration = client.register().map_err(IssueError::Registration)?;
        account.attach_registration(registration.clone())?;
        self.advance(State::Registered);

        client.agree_to_tos().map_err(IssueError::TermsOfService)?;
        self.advance(State::TosAgreed);

        client.exclude_challenges(&ChallengeType::NON_DNS);
        client.set_dns01_provider(provider);
        self.advance(State::Validating);

        let issued = client.obtain_certificate(&domains, true)?;
        let bundle = CertificateBundle::from_issued(domains, issued, now);
        self.advance(State::Issued);

        let certificate_dir = self.persist(&bundle)?;
        self.advance(State::Persisted);

        Ok(Issued {
            email: account.email().to_string(),
            registration,
            account_dir,
            certificate_dir,
            bundle,
        })
    }
}
