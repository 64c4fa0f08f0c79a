//! One-shot ACME certificate issuance with DNS-01 validation.
//!
//! A run generates a fresh account key, registers it, proves control of every
//! requested domain through a DNS provider and stores the issued certificate
//! under a versioned directory layout:
//!
//! ```text
//! <root>/users/<email>/privkey.pem
//! <root>/users/<email>/pubkey.pem
//! <root>/certs/<unix timestamp>/privkey.pem
//! <root>/certs/<unix timestamp>/fullchain.pem
//! ```

#[macro_use]
extern crate packed_struct_codegen;

pub mod account;
pub mod acme;
pub mod certificate;
pub mod client;
pub mod config;
pub mod error;
pub mod issue;
pub mod key;
pub mod persist;
pub mod provider;

pub use account::{Account, RegistrationHandle};
pub use acme::DirectoryConnector;
pub use certificate::CertificateBundle;
pub use client::{AcmeClient, ChallengeType, Connector};
pub use config::{DnsSettings, EmailAddress, IssueConfig, ProviderKind};
pub use error::IssueError;
pub use issue::{Issued, Issuer, State};
pub use key::KeyType;
pub use persist::FileStore;
pub use provider::{new_provider, DnsChallengeProvider};
