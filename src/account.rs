use std::fmt;

use openssl::pkey::{PKey, Private};
use thiserror::Error;

use crate::key::{KeyError, KeyType};

/// CA-side reference to a registered account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    /// Account URL, when the CA (or the client library) exposes it.
    pub uri: Option<String>,
    /// Contacts submitted with the registration.
    pub contacts: Vec<String>,
    /// Subscriber agreement in force at registration time.
    pub terms_of_service: Option<String>,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account {email} is already registered")]
    AlreadyRegistered { email: String },
}

/// The operator's ACME identity for one run.
pub struct Account {
    email: String,
    key: PKey<Private>,
    registration: Option<RegistrationHandle>,
}

impl Account {
    /// Create an unregistered account with a freshly generated key.
    pub fn create<S: Into<String>>(email: S, key_type: KeyType) -> Result<Self, KeyError> {
        Ok(Account {
            email: email.into(),
            key: key_type.generate()?,
            registration: None,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.key
    }

    pub fn registration(&self) -> Option<&RegistrationHandle> {
        self.registration.as_ref()
    }

    /// Contact URIs submitted to the CA.
    pub fn contacts(&self) -> Vec<String> {
        vec![format!("mailto:{}", self.email)]
    }

    /// Record the CA registration. Can only happen once per account.
    pub fn attach_registration(&mut self, handle: RegistrationHandle) -> Result<(), AccountError> {
        if self.registration.is_some() {
            return Err(AccountError::AlreadyRegistered {
                email: self.email.clone(),
            });
        }

        self.registration = Some(handle);
        Ok(())
    }
}

// Key material stays out of logs.
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("email", &self.email)
            .field("key_bits", &self.key.bits())
            .field("registration", &self.registration)
            .finish()
    }
}
