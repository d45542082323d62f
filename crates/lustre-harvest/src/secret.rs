// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-secret handling.
//!
//! Clients and servers authenticate frame headers with a digest over the
//! header bytes plus the contents of a secret file that only root can read.
//! The secret is loaded once at startup; a missing or empty file is a fatal
//! configuration error.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Opaque secret blob mixed into the header-auth digest.
///
/// Invariant: contains at least one non-whitespace byte.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap raw secret bytes, rejecting blank material.
    pub fn new(bytes: Vec<u8>) -> Result<Self, SecretError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(SecretError::Empty { path: None });
        }
        Ok(Self(bytes))
    }

    /// Load the secret file. Called once at startup.
    pub fn load(path: &Path) -> Result<Self, SecretError> {
        let raw = fs::read(path).map_err(|source| SecretError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Self::new(raw).map_err(|_| SecretError::Empty {
            path: Some(path.display().to_string()),
        })
    }

    /// Raw bytes, as fed to the header-auth digest.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// Never print secret material, not even in debug output.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// Secret-file loading errors. All of them are fatal at startup.
#[derive(Debug)]
pub enum SecretError {
    /// The file could not be read.
    Unreadable { path: String, source: io::Error },
    /// The file holds nothing but whitespace.
    Empty { path: Option<String> },
}

impl fmt::Display for SecretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable { path, source } => {
                write!(f, "problem reading secret file {}: {}", path, source)
            }
            Self::Empty { path: Some(path) } => {
                write!(f, "nothing in the shared secret file {}", path)
            }
            Self::Empty { path: None } => write!(f, "empty shared secret"),
        }
    }
}

impl std::error::Error for SecretError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Unreadable { source, .. } => Some(source),
            Self::Empty { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "hunter2").unwrap();

        let secret = Secret::load(&path).unwrap();
        assert_eq!(secret.as_bytes(), b"hunter2\n");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Secret::load(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, SecretError::Unreadable { .. }));
    }

    #[test]
    fn test_blank_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, "  \n\t\n").unwrap();

        let err = Secret::load(&path).unwrap_err();
        assert!(matches!(err, SecretError::Empty { .. }));
    }

    #[test]
    fn test_debug_redacts_material() {
        let secret = Secret::new(b"topsecret".to_vec()).unwrap();
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("topsecret"));
        assert!(printed.contains("9 bytes"));
    }
}
