//! Username/password authentication
//!
//! Credentials are kept as PHC-format Argon2 hash strings, loaded from a
//! file with one `username:hash` entry per line (`#` starts a comment).
//! Verification never sees a plaintext table; the CONNECT handler asks
//! [`Credentials::verify`] and maps a failure to CONNACK code 4.

use std::collections::HashMap;
use std::path::Path;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, Salt, SaltString};
use argon2::Argon2;
use tracing::{error, info, warn};

use crate::error::{BrokerError, Result};

/// Broker-wide credential table, keyed by username.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    users: HashMap<String, String>,
}

impl Credentials {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads credentials from a password file.
    ///
    /// Malformed lines are skipped with a warning so one broken entry does
    /// not lock every user out.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!(
                "failed to read password file {}: {e}",
                path.display()
            ))
        })?;

        let mut users = HashMap::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((username, hash)) = line.split_once(':') else {
                warn!("invalid entry in password file at line {}", line_num + 1);
                continue;
            };
            let username = username.trim();
            if username.is_empty() {
                warn!("empty username in password file at line {}", line_num + 1);
                continue;
            }
            users.insert(username.to_string(), hash.trim().to_string());
        }

        info!(
            "loaded {} users from password file {}",
            users.len(),
            path.display()
        );
        Ok(Self { users })
    }

    /// Adds a user with a pre-computed hash.
    pub fn add_user_with_hash(&mut self, username: impl Into<String>, hash: impl Into<String>) {
        self.users.insert(username.into(), hash.into());
    }

    /// Adds a user, hashing the plaintext password.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn add_user(&mut self, username: impl Into<String>, password: &str) -> Result<()> {
        let hash = hash_password(password)?;
        self.users.insert(username.into(), hash);
        Ok(())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Checks a plaintext password against the stored hash for `username`.
    /// Unknown users and parse failures both verify as false.
    #[must_use]
    pub fn verify(&self, username: &str, password: &[u8]) -> bool {
        self.users
            .get(username)
            .is_some_and(|hash| verify_password(password, hash))
    }
}

/// Hashes a password with Argon2 and a fresh random salt, producing a
/// PHC-format string suitable for the password file.
///
/// # Errors
/// Returns an error if salt generation or hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let mut bytes = [0u8; Salt::RECOMMENDED_LENGTH];
    getrandom::fill(&mut bytes)
        .map_err(|e| BrokerError::PasswordHash(format!("salt generation failed: {e}")))?;
    let salt = SaltString::encode_b64(&bytes)
        .map_err(|e| BrokerError::PasswordHash(format!("salt encoding failed: {e}")))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| BrokerError::PasswordHash(e.to_string()))
}

#[must_use]
fn verify_password(password: &[u8], hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        error!("unparseable password hash in credential table");
        return false;
    };
    Argon2::default().verify_password(password, &parsed).is_ok()
}
