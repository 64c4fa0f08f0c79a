//! [`AcmeClient`] backed by `acme-lib`.
//!
//! `acme-lib` keeps keys in a [`Persist`] store keyed by realm. The adapter
//! seeds an in-memory store with the account's own key, so the key written to
//! disk before registration is the one the CA sees.

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use acme_lib::persist::{MemoryPersist, Persist, PersistKey, PersistKind};
use acme_lib::{Directory, DirectoryUrl};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey};
use tracing::{debug, info};

use crate::account::{Account, RegistrationHandle};
use crate::certificate::IssuedCertificate;
use crate::client::{
    AcmeClient, AcmeError, ChallengeFailures, ChallengeType, Connector, ObtainError,
};
use crate::config::Domain;
use crate::key::{self, KeyType};
use crate::provider::{self, DnsChallengeProvider};

// name acme-lib stores the account key under
const ACCOUNT_KEY_NAME: &str = "acme_account";

/// Delay between status polls while the CA validates or finalizes.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(5);

/// How often the order is refreshed after all challenges passed before
/// giving up on it becoming ready.
const MAX_ORDER_REFRESHES: usize = 10;

fn protocol(err: acme_lib::Error) -> AcmeError {
    AcmeError::Protocol(err.to_string())
}

/// Connects [`DirectoryClient`]s.
#[derive(Debug, Clone)]
pub struct DirectoryConnector {
    poll_delay: Duration,
}

impl DirectoryConnector {
    pub fn new(poll_delay: Duration) -> Self {
        DirectoryConnector { poll_delay }
    }
}

impl Default for DirectoryConnector {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_DELAY)
    }
}

impl Connector for DirectoryConnector {
    fn connect(
        &self,
        directory_url: &str,
        account: &Account,
        certificate_key_type: KeyType,
    ) -> Result<Box<dyn AcmeClient>, AcmeError> {
        let client = DirectoryClient::connect(
            directory_url,
            account,
            certificate_key_type,
            self.poll_delay,
        )?;
        Ok(Box::new(client))
    }
}

pub struct DirectoryClient {
    directory: Directory<MemoryPersist>,
    email: String,
    contacts: Vec<String>,
    account_public_key: Vec<u8>,
    certificate_key_type: KeyType,
    poll_delay: Duration,
    account: Option<acme_lib::Account<MemoryPersist>>,
    terms_agreed: bool,
    excluded: BTreeSet<ChallengeType>,
    dns01: Option<Box<dyn DnsChallengeProvider>>,
}

impl DirectoryClient {
    /// Fetch the directory and prepare to act as `account`.
    pub fn connect(
        directory_url: &str,
        account: &Account,
        certificate_key_type: KeyType,
        poll_delay: Duration,
    ) -> Result<Self, AcmeError> {
        let key = account.private_key();
        let is_p256 = key.id() == Id::EC
            && key
                .ec_key()
                .ok()
                .and_then(|ec| ec.group().curve_name())
                == Some(Nid::X9_62_PRIME256V1);
        if !is_p256 {
            return Err(AcmeError::UnsupportedAccountKey);
        }

        let pem = key::encode_private_key(key).map_err(|e| AcmeError::Protocol(e.to_string()))?;
        let account_public_key = key
            .public_key_to_der()
            .map_err(|e| AcmeError::Protocol(e.to_string()))?;

        let persist = MemoryPersist::new();
        persist
            .put(
                &PersistKey::new(account.email(), PersistKind::AccountPrivateKey, ACCOUNT_KEY_NAME),
                &pem,
            )
            .map_err(protocol)?;

        let directory =
            Directory::from_url(persist, DirectoryUrl::Other(directory_url)).map_err(protocol)?;
        debug!(url = %directory_url, "Fetched ACME directory");

        Ok(DirectoryClient {
            directory,
            email: account.email().to_string(),
            contacts: account.contacts(),
            account_public_key,
            certificate_key_type,
            poll_delay,
            account: None,
            terms_agreed: false,
            excluded: BTreeSet::new(),
            dns01: None,
        })
    }

    fn poll_millis(&self) -> u64 {
        self.poll_delay.as_millis() as u64
    }
}

impl DirectoryClient {
    fn dns01_solver(&self) -> Option<&dyn DnsChallengeProvider> {
        if self.excluded.contains(&ChallengeType::Dns01) {
            return None;
        }
        self.dns01.as_deref()
    }
}

/// Preconditions for placing an order, checked before anything is sent.
fn check_order(
    domains: &[Domain],
    bundle: bool,
    registered: bool,
    terms_agreed: bool,
    has_solver: bool,
) -> Result<(), ObtainError> {
    if domains.is_empty() {
        return Err(ObtainError::NoDomains);
    }
    if !bundle && domains.len() > 1 {
        return Err(ObtainError::BundleRequired {
            count: domains.len(),
        });
    }
    if !registered {
        return Err(AcmeError::NotRegistered.into());
    }
    if !terms_agreed {
        return Err(AcmeError::TermsNotAgreed.into());
    }
    if !has_solver {
        return Err(ObtainError::NoSolver(ChallengeType::Dns01));
    }
    Ok(())
}

/// The CA must hold the key that was written to disk before registering.
fn check_registered_key(expected_der: &[u8], registered_pem: &str) -> Result<(), AcmeError> {
    let registered = PKey::private_key_from_pem(registered_pem.as_bytes())
        .and_then(|key| key.public_key_to_der())
        .map_err(|e| AcmeError::Protocol(e.to_string()))?;
    if registered != expected_der {
        return Err(AcmeError::KeyMismatch);
    }
    Ok(())
}

/// Maps authorization identifiers back to the requested names.
///
/// `example.com` and `*.example.com` are both authorized under the identifier
/// `example.com`; each requested name is handed out once, in request order.
struct RequestedNames<'d> {
    remaining: Vec<&'d Domain>,
}

impl<'d> RequestedNames<'d> {
    fn new(domains: &'d [Domain]) -> Self {
        RequestedNames {
            remaining: domains.iter().collect(),
        }
    }

    fn claim(&mut self, identifier: &str) -> String {
        let identifier = identifier.trim_end_matches('.');
        match self
            .remaining
            .iter()
            .position(|domain| domain.base_name().eq_ignore_ascii_case(identifier))
        {
            Some(index) => self.remaining.remove(index).as_str().to_string(),
            None => identifier.to_string(),
        }
    }
}

impl AcmeClient for DirectoryClient {
    fn exclude_challenges(&mut self, types: &[ChallengeType]) {
        self.excluded.extend(types.iter().copied());
    }

    fn set_dns01_provider(&mut self, provider: Box<dyn DnsChallengeProvider>) {
        self.dns01 = Some(provider);
    }

    fn register(&mut self) -> Result<RegistrationHandle, AcmeError> {
        if self.account.is_some() {
            return Err(AcmeError::AlreadyRegistered);
        }

        let account = self.directory.account(&self.email).map_err(protocol)?;

        check_registered_key(&self.account_public_key, &account.acme_private_key_pem())?;

        info!(email = %self.email, "Registered ACME account");
        self.account = Some(account);
        Ok(RegistrationHandle {
            uri: None,
            contacts: self.contacts.clone(),
            terms_of_service: None,
        })
    }

    // ACMEv2 carries the agreement in newAccount, which `register` sent.
    fn agree_to_tos(&mut self) -> Result<(), AcmeError> {
        if self.account.is_none() {
            return Err(AcmeError::NotRegistered);
        }

        self.terms_agreed = true;
        debug!(email = %self.email, "Subscriber agreement accepted");
        Ok(())
    }

    fn obtain_certificate(
        &mut self,
        domains: &[Domain],
        bundle: bool,
    ) -> Result<IssuedCertificate, ObtainError> {
        let provider = self.dns01_solver();
        check_order(
            domains,
            bundle,
            self.account.is_some(),
            self.terms_agreed,
            provider.is_some(),
        )?;
        let account = self.account.as_ref().ok_or(AcmeError::NotRegistered)?;
        let provider = provider.ok_or(ObtainError::NoSolver(ChallengeType::Dns01))?;
        let (primary, alternatives) = domains.split_first().ok_or(ObtainError::NoDomains)?;

        let alt_names: Vec<&str> = alternatives.iter().map(Domain::as_str).collect();
        let mut order = account
            .new_order(primary.as_str(), &alt_names)
            .map_err(protocol)?;
        info!(domains = domains.len(), "Created ACME order");

        let mut challenged = false;
        let mut refreshes = 0;
        let csr = loop {
            if let Some(csr) = order.confirm_validations() {
                break csr;
            }

            if challenged {
                refreshes += 1;
                if refreshes > MAX_ORDER_REFRESHES {
                    return Err(ObtainError::OrderNotReady(MAX_ORDER_REFRESHES));
                }
                thread::sleep(self.poll_delay);
            } else {
                let mut failures = ChallengeFailures::default();
                let mut names = RequestedNames::new(domains);
                for auth in order.authorizations().map_err(protocol)? {
                    let domain = auth.domain_name().to_string();
                    let name = names.claim(&domain);
                    if !auth.need_challenge() {
                        continue;
                    }

                    let challenge = auth.dns_challenge();
                    let proof = challenge.dns_proof();
                    let delay = self.poll_millis();

                    let outcome = provider::run_challenge(provider, &domain, &proof, || {
                        challenge.validate(delay).map_err(|e| e.to_string())
                    });
                    match outcome {
                        Ok(()) => info!(domain = %name, "DNS-01 challenge validated"),
                        Err(e) => {
                            info!(domain = %name, error = %e, "DNS-01 challenge failed");
                            failures.insert(name, e);
                        }
                    }
                }

                if !failures.is_empty() {
                    return Err(ObtainError::Challenges(failures));
                }
                challenged = true;
            }

            order.refresh().map_err(protocol)?;
        };

        let certificate_key = self.certificate_key_type.generate()?;
        let certificate = csr
            .finalize_pkey(certificate_key, self.poll_millis())
            .and_then(|order| order.download_and_save_cert())
            .map_err(protocol)?;
        info!(
            domains = domains.len(),
            valid_days = certificate.valid_days_left(),
            "Downloaded certificate"
        );

        Ok(IssuedCertificate {
            private_key: certificate.private_key().as_bytes().to_vec(),
            certificate_chain: certificate.certificate().as_bytes().to_vec(),
        })
    }
}
