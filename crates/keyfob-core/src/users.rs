//! The table of paired users.
//!
//! `users.txt` in the configuration directory holds one record per pairing:
//!
//! ```text
//! <username>:<phone-public-key-base64>:<symmetric-key-base64>
//! ```
//!
//! The phone public key is the Ed25519 verifying key the phone proves
//! possession of during the handshake; the symmetric key decrypts the user
//! token the phone sends as extra-data. Blank lines and lines starting with
//! `#` are ignored.
//!
//! A session authenticating a specific user works against the table
//! filtered to that username. An *empty* filter result must fail the
//! session up front: handing the handshake an empty table would otherwise
//! read as "any user is acceptable".

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Errors raised while loading the user table.
#[derive(Debug, Error)]
pub enum UsersError {
    /// The users file could not be read.
    #[error("failed to read users file: {0}")]
    Io(#[from] std::io::Error),

    /// A record line could not be parsed.
    #[error("users file line {line}: {reason}")]
    BadRecord {
        /// 1-based line number of the offending record.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
}

/// Symmetric key paired with one user, used to decrypt their token.
///
/// Zeroised on drop; the raw bytes never appear in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

/// One paired user record.
#[derive(Debug, Clone)]
pub struct UserEntry {
    /// Account name the pairing logs in as.
    pub name: String,
    /// The phone's Ed25519 verifying key.
    pub verifying_key: VerifyingKey,
    /// Key for decrypting the user token carried in extra-data.
    pub symmetric_key: SymmetricKey,
}

/// The set of paired users a session may authenticate.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    entries: Vec<UserEntry>,
}

impl UserTable {
    /// An empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Load the table from a users file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or any record is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UsersError> {
        let contents = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();

        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            entries.push(parse_record(index + 1, line)?);
        }

        Ok(Self { entries })
    }

    /// Build a table from records directly; used by pairing tooling and
    /// tests.
    #[must_use]
    pub fn from_entries(entries: Vec<UserEntry>) -> Self {
        Self { entries }
    }

    /// A new table containing only records for `name`.
    #[must_use]
    pub fn filter_by_name(&self, name: &str) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|entry| entry.name == name)
                .cloned()
                .collect(),
        }
    }

    /// Find the record matching a claimed username and verifying key.
    #[must_use]
    pub fn find(&self, name: &str, key: &VerifyingKey) -> Option<&UserEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name == name && entry.verifying_key == *key)
    }

    /// Number of records in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over the records.
    pub fn iter(&self) -> impl Iterator<Item = &UserEntry> {
        self.entries.iter()
    }
}

fn parse_record(line_no: usize, line: &str) -> Result<UserEntry, UsersError> {
    let mut fields = line.splitn(3, ':');
    let name = fields.next().unwrap_or_default();
    let public = fields.next();
    let symmetric = fields.next();

    let (Some(public), Some(symmetric)) = (public, symmetric) else {
        return Err(UsersError::BadRecord {
            line: line_no,
            reason: "expected name:public-key:symmetric-key".to_owned(),
        });
    };
    if name.is_empty() {
        return Err(UsersError::BadRecord {
            line: line_no,
            reason: "empty username".to_owned(),
        });
    }

    let verifying_key = decode_key(public)
        .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok())
        .ok_or_else(|| UsersError::BadRecord {
            line: line_no,
            reason: "invalid public key".to_owned(),
        })?;
    let symmetric_key = decode_key(symmetric)
        .map(SymmetricKey::from_bytes)
        .ok_or_else(|| UsersError::BadRecord {
            line: line_no,
            reason: "invalid symmetric key".to_owned(),
        })?;

    Ok(UserEntry {
        name: name.to_owned(),
        verifying_key,
        symmetric_key,
    })
}

fn decode_key(encoded: &str) -> Option<[u8; 32]> {
    let bytes = BASE64.decode(encoded.trim()).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ed25519_dalek::SigningKey;

    use super::*;

    fn record(name: &str) -> (String, VerifyingKey) {
        let key = SigningKey::generate(&mut rand::rngs::OsRng).verifying_key();
        let line = format!(
            "{name}:{}:{}",
            BASE64.encode(key.as_bytes()),
            BASE64.encode([7u8; 32]),
        );
        (line, key)
    }

    #[test]
    fn load_filters_and_finds() {
        let (alice, alice_key) = record("alice");
        let (bob, bob_key) = record("bob");
        let (alice2, _) = record("alice");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# paired users").unwrap();
        writeln!(file, "{alice}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{bob}").unwrap();
        writeln!(file, "{alice2}").unwrap();

        let table = UserTable::load(file.path()).unwrap();
        assert_eq!(table.len(), 3);

        let filtered = table.filter_by_name("alice");
        assert_eq!(filtered.len(), 2);
        assert!(filtered.find("alice", &alice_key).is_some());
        assert!(filtered.find("bob", &bob_key).is_none());

        assert!(table.filter_by_name("nosuchuser").is_empty());
    }

    #[test]
    fn find_requires_matching_key() {
        let (alice, _) = record("alice");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{alice}").unwrap();

        let table = UserTable::load(file.path()).unwrap();
        let stranger = SigningKey::generate(&mut rand::rngs::OsRng).verifying_key();
        assert!(table.find("alice", &stranger).is_none());
    }

    #[test]
    fn malformed_record_reports_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "just-a-name").unwrap();

        let err = UserTable::load(file.path()).unwrap_err();
        assert!(matches!(err, UsersError::BadRecord { line: 1, .. }));
    }

    #[test]
    fn bad_key_material_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "alice:notbase64!!:AAAA").unwrap();

        let err = UserTable::load(file.path()).unwrap_err();
        assert!(matches!(err, UsersError::BadRecord { .. }));
    }
}
