//! Login/passcode authentication.
//!
//! Passcodes are checked against SHA-256 hashes stored in configuration, so
//! plaintext passcodes never live in config files.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Outcome of a CONNECT login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    Accepted,
    UnknownUser,
    BadPasscode,
}

impl LoginResult {
    pub fn is_accepted(self) -> bool {
        self == LoginResult::Accepted
    }
}

/// Decides whether CONNECT credentials are valid.
pub trait AuthenticationService: Send + Sync {
    /// Returns whether credentials are checked at all. When inactive every
    /// CONNECT is accepted.
    fn is_active(&self) -> bool;

    /// Checks a login/passcode pair.
    fn login(&self, login: &str, passcode: &str) -> LoginResult;
}

/// Credentials keyed by login, holding SHA-256 passcode hashes.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    required: bool,
    users: HashMap<String, String>,
}

impl CredentialStore {
    /// Creates a store from `(login, hash)` pairs.
    pub fn new(required: bool, users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            required,
            users: users
                .into_iter()
                .map(|(login, hash)| (login, hash.to_ascii_lowercase()))
                .collect(),
        }
    }

    /// A store that accepts everyone.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Hashes a passcode using SHA-256, returning a lowercase hex string.
    pub fn hash_passcode(passcode: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(passcode.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl AuthenticationService for CredentialStore {
    fn is_active(&self) -> bool {
        self.required
    }

    fn login(&self, login: &str, passcode: &str) -> LoginResult {
        match self.users.get(login) {
            None => LoginResult::UnknownUser,
            Some(hash) if *hash == Self::hash_passcode(passcode) => LoginResult::Accepted,
            Some(_) => LoginResult::BadPasscode,
        }
    }
}
