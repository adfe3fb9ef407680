use std::fmt;

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A guest login secret. Kept out of `Debug` output so it never lands in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessCredential(String);

impl AccessCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessCredential(***)")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialGenerator {
    length: usize,
}

impl CredentialGenerator {
    pub const DEFAULT_LENGTH: usize = 16;

    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
        }
    }

    /// Draws `length` symbols uniformly from `[A-Za-z0-9]` using the OS RNG.
    pub fn generate(&self) -> AccessCredential {
        let secret: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect();
        AccessCredential(secret)
    }
}

impl Default for CredentialGenerator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LENGTH)
    }
}
