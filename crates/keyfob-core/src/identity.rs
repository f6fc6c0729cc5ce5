//! The service's long-term signing identity.
//!
//! Each deployment owns an Ed25519 keypair stored as a pair of DER files in
//! the configuration directory. The public half identifies the service to
//! phones; the private half signs invitation payloads and handshake
//! challenges.
//!
//! The *commitment* is the SHA-256 digest of the public key DER. It is the
//! stable, compact identifier of "this service" — phones recognise a
//! service by commitment, the attribute channel derives its advertised UUID
//! from it, and the registry uses it to spot two sessions talking to the
//! same service.

use std::fmt;
use std::path::Path;

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};

/// Errors raised while loading or using the service identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// A key file could not be read.
    #[error("failed to read key file {path}: {source}")]
    Io {
        /// Path of the offending file.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The private key file is not a valid PKCS#8 Ed25519 key.
    #[error("invalid private key: {0}")]
    BadPrivateKey(String),

    /// The public key file is not a valid SPKI Ed25519 key.
    #[error("invalid public key: {0}")]
    BadPublicKey(String),

    /// The stored public key does not belong to the stored private key.
    #[error("public key file does not match the private key")]
    KeyMismatch,
}

/// SHA-256 digest of the service public key DER.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Commitment([u8; 32]);

impl Commitment {
    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", self.to_hex())
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The service's long-term Ed25519 identity.
pub struct ServiceIdentity {
    signing: SigningKey,
    public_der: Vec<u8>,
}

impl ServiceIdentity {
    /// Load the identity keypair from `key_priv.der` and `key_pub.der`
    /// under the given configuration directory.
    ///
    /// # Errors
    ///
    /// Fails if either file is missing or malformed, or if the two files
    /// disagree about which keypair this service owns.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let dir = config_dir.as_ref();
        let private_path = dir.join(PRIVATE_KEY_FILE);
        let public_path = dir.join(PUBLIC_KEY_FILE);

        let private_der = read_key_file(&private_path)?;
        let public_der = read_key_file(&public_path)?;

        let signing = SigningKey::from_pkcs8_der(&private_der)
            .map_err(|err| IdentityError::BadPrivateKey(err.to_string()))?;
        let stored = VerifyingKey::from_public_key_der(&public_der)
            .map_err(|err| IdentityError::BadPublicKey(err.to_string()))?;

        if stored != signing.verifying_key() {
            return Err(IdentityError::KeyMismatch);
        }

        Ok(Self {
            signing,
            public_der,
        })
    }

    /// Generate a fresh identity.
    ///
    /// Deployments pair keys out of band; this exists for tests and for the
    /// pairing tool, not for the daemon itself.
    #[must_use]
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let public_der = signing
            .verifying_key()
            .to_public_key_der()
            .expect("ed25519 public keys always encode")
            .into_vec();
        Self {
            signing,
            public_der,
        }
    }

    /// Persist the identity as the DER file pair the daemon loads.
    ///
    /// Used by the pairing tool and by test fixtures; the daemon itself
    /// only ever reads keys. The private key file is written with owner-only
    /// permissions.
    ///
    /// # Errors
    ///
    /// Fails if either file cannot be written.
    pub fn save(&self, config_dir: impl AsRef<Path>) -> Result<(), IdentityError> {
        let dir = config_dir.as_ref();
        let private_path = dir.join(PRIVATE_KEY_FILE);
        let public_path = dir.join(PUBLIC_KEY_FILE);

        let private = self
            .signing
            .to_pkcs8_der()
            .map_err(|err| IdentityError::BadPrivateKey(err.to_string()))?;

        write_key_file(&private_path, private.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &private_path,
                std::fs::Permissions::from_mode(0o600),
            );
        }
        write_key_file(&public_path, &self.public_der)
    }

    /// The public key in DER form, exactly as stored on disk.
    #[must_use]
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// The verifying half of the identity keypair.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The service commitment: SHA-256 of the public key DER.
    #[must_use]
    pub fn commitment(&self) -> Commitment {
        commitment_of(&self.public_der)
    }

    /// Sign a message with the identity key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Verify a signature made with this identity.
    ///
    /// # Errors
    ///
    /// Fails if the signature does not verify.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), IdentityError> {
        self.signing
            .verifying_key()
            .verify(message, signature)
            .map_err(|err| IdentityError::BadPublicKey(err.to_string()))
    }
}

impl fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the signing key through Debug.
        f.debug_struct("ServiceIdentity")
            .field("commitment", &self.commitment())
            .finish_non_exhaustive()
    }
}

/// Compute the commitment of an arbitrary public key DER.
#[must_use]
pub fn commitment_of(public_key_der: &[u8]) -> Commitment {
    let digest = Sha256::digest(public_key_der);
    Commitment(digest.into())
}

fn read_key_file(path: &Path) -> Result<Vec<u8>, IdentityError> {
    std::fs::read(path).map_err(|source| IdentityError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn write_key_file(path: &Path, contents: &[u8]) -> Result<(), IdentityError> {
    std::fs::write(path, contents).map_err(|source| IdentityError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ServiceIdentity::generate();
        identity.save(dir.path()).unwrap();

        let loaded = ServiceIdentity::load(dir.path()).unwrap();
        assert_eq!(loaded.commitment(), identity.commitment());
        assert_eq!(loaded.public_key_der(), identity.public_key_der());
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        ServiceIdentity::generate().save(dir.path()).unwrap();

        let mode = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_keys_fail() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServiceIdentity::load(dir.path()).unwrap_err();
        assert!(matches!(err, IdentityError::Io { .. }));
    }

    #[test]
    fn mismatched_public_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let identity = ServiceIdentity::generate();
        identity.save(dir.path()).unwrap();

        // Overwrite the public half with a different key.
        let other = ServiceIdentity::generate();
        std::fs::write(dir.path().join(PUBLIC_KEY_FILE), other.public_key_der()).unwrap();

        let err = ServiceIdentity::load(dir.path()).unwrap_err();
        assert!(matches!(err, IdentityError::KeyMismatch));
    }

    #[test]
    fn commitment_is_stable_and_distinct() {
        let a = ServiceIdentity::generate();
        let b = ServiceIdentity::generate();
        assert_eq!(a.commitment(), a.commitment());
        assert_ne!(a.commitment(), b.commitment());
        assert_eq!(a.commitment().to_hex().len(), 64);
    }

    #[test]
    fn signatures_verify() {
        let identity = ServiceIdentity::generate();
        let signature = identity.sign(b"challenge");
        identity.verify(b"challenge", &signature).unwrap();
        assert!(identity.verify(b"other", &signature).is_err());
    }
}
