//! Persistent node identity.
//!
//! The ed25519 key in `identity.key` keeps the node's peer id stable across
//! restarts, which bootnode address books depend on.

use std::io;
use std::path::Path;

use ed25519_dalek::SigningKey;
use thiserror::Error;

const IDENTITY_KEY_FILE: &str = "identity.key";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("read identity key: {0}")]
    Read(#[source] io::Error),

    #[error("write identity key: {0}")]
    Write(#[source] io::Error),

    #[error("identity key is {0} bytes, expected 32")]
    BadLength(usize),
}

/// Load the identity key from the data directory, generating and persisting
/// a fresh one (mode 0600) if none exists.
pub fn load_or_create_identity(data_dir: &Path) -> Result<SigningKey, IdentityError> {
    let key_path = data_dir.join(IDENTITY_KEY_FILE);

    match std::fs::read(&key_path) {
        Ok(data) => {
            let bytes: [u8; 32] = data
                .as_slice()
                .try_into()
                .map_err(|_| IdentityError::BadLength(data.len()))?;
            Ok(SigningKey::from_bytes(&bytes))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            std::fs::create_dir_all(data_dir).map_err(IdentityError::Write)?;
            std::fs::write(&key_path, key.to_bytes()).map_err(IdentityError::Write)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                    .map_err(IdentityError::Write)?;
            }
            Ok(key)
        }
        Err(e) => Err(IdentityError::Read(e)),
    }
}
