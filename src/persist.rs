//! Versioned on-disk storage for account keys and issued certificates.
//!
//! ```text
//! <root>/
//! ├── users/<email>/
//! │   ├── privkey.pem
//! │   └── pubkey.pem
//! └── certs/<unix timestamp>/
//!     ├── privkey.pem
//!     └── fullchain.pem
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::certificate::CertificateBundle;

pub const PRIVATE_KEY_FILE: &str = "privkey.pem";
pub const PUBLIC_KEY_FILE: &str = "pubkey.pem";
pub const FULLCHAIN_FILE: &str = "fullchain.pem";

const USERS_DIR: &str = "users";
const CERTS_DIR: &str = "certs";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to overwrite existing {}", path.display())]
    AlreadyExists { path: PathBuf },
}

/// Who may read an artifact once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    /// Owner read/write only.
    Secret,
    /// World readable.
    Public,
}

impl Sensitivity {
    #[cfg(unix)]
    fn mode(self) -> u32 {
        match self {
            Sensitivity::Secret => 0o600,
            Sensitivity::Public => 0o644,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FileStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn account_dir(&self, email: &str) -> PathBuf {
        self.root.join(USERS_DIR).join(email)
    }

    pub fn certificate_dir(&self, bundle: &CertificateBundle) -> PathBuf {
        self.root
            .join(CERTS_DIR)
            .join(bundle.issued_at().timestamp().to_string())
    }

    /// Write `bytes` to `dir/filename`, creating `dir` and its ancestors.
    ///
    /// The data goes to a temporary file in `dir` first and is renamed into
    /// place after an fsync, so a crash never leaves a truncated file under
    /// the final name.
    pub fn write_artifact(
        &self,
        dir: &Path,
        filename: &str,
        bytes: &[u8],
        sensitivity: Sensitivity,
    ) -> Result<PathBuf, StorageError> {
        create_dir(dir)?;

        let path = dir.join(filename);
        let write_err = |source| StorageError::Write {
            path: path.clone(),
            source,
        };

        let mut file = NamedTempFile::new_in(dir).map_err(write_err)?;
        set_mode(file.path(), sensitivity).map_err(write_err)?;
        file.write_all(bytes).map_err(write_err)?;
        file.as_file().sync_all().map_err(write_err)?;
        file.persist(&path).map_err(|e| write_err(e.error))?;

        debug!(path = %path.display(), bytes = bytes.len(), "Wrote artifact");
        Ok(path)
    }

    /// Save the account key pair under `users/<email>/`.
    pub fn save_account_keys(
        &self,
        email: &str,
        private_pem: &[u8],
        public_pem: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let dir = self.account_dir(email);
        self.write_artifact(&dir, PRIVATE_KEY_FILE, private_pem, Sensitivity::Secret)?;
        self.write_artifact(&dir, PUBLIC_KEY_FILE, public_pem, Sensitivity::Public)?;

        info!(email = %email, path = %dir.display(), "Saved account key pair");
        Ok(dir)
    }

    /// Save an issued certificate under `certs/<issued at>/`.
    ///
    /// Both files are staged in a sibling temporary directory which is then
    /// renamed into place, so the certificate directory either holds both the
    /// key and the chain or does not exist. An existing directory is never
    /// replaced.
    pub fn save_certificate(&self, bundle: &CertificateBundle) -> Result<PathBuf, StorageError> {
        let dir = self.certificate_dir(bundle);
        if dir.exists() {
            return Err(StorageError::AlreadyExists { path: dir });
        }

        let certs_root = self.root.join(CERTS_DIR);
        create_dir(&certs_root)?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&certs_root)
            .map_err(|source| StorageError::CreateDir {
                path: certs_root.clone(),
                source,
            })?;

        self.write_artifact(
            staging.path(),
            PRIVATE_KEY_FILE,
            bundle.private_key(),
            Sensitivity::Secret,
        )?;
        self.write_artifact(
            staging.path(),
            FULLCHAIN_FILE,
            bundle.certificate_chain(),
            Sensitivity::Public,
        )?;

        if dir.exists() {
            return Err(StorageError::AlreadyExists { path: dir });
        }
        fs::rename(staging.path(), &dir).map_err(|source| StorageError::Write {
            path: dir.clone(),
            source,
        })?;

        info!(
            domains = %bundle.domain_list(),
            path = %dir.display(),
            "Saved certificate bundle"
        );
        Ok(dir)
    }
}

#[cfg(unix)]
fn create_dir(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|source| StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path).map_err(|source| StorageError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, sensitivity: Sensitivity) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(sensitivity.mode()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _sensitivity: Sensitivity) -> io::Result<()> {
    Ok(())
}
