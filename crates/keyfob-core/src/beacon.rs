//! The invitation payload and the broadcast target list.
//!
//! A session advertises itself with a single signed payload carrying the
//! service name, the service public key, and the channel address a phone
//! should connect to. The same serialized payload is rendered as QR text by
//! the client and pushed over the air by the beacon engine — a phone cannot
//! tell which way it arrived.
//!
//! Targets for the out-of-band broadcast come from `bluetooth.txt`: one
//! address per line, `#` for comments. Lines are capped at
//! [`TARGET_LINE_MAX`] characters, enough for a colon-separated hardware
//! address.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::identity::ServiceIdentity;

/// Maximum significant length of one line in the targets file.
pub const TARGET_LINE_MAX: usize = 19;

/// Errors raised while handling invitation payloads.
#[derive(Debug, Error)]
pub enum BeaconError {
    /// The payload is not valid JSON.
    #[error("invalid invitation payload: {0}")]
    Malformed(String),

    /// The embedded public key or signature failed to decode or verify.
    #[error("invitation signature rejected: {0}")]
    BadSignature(String),
}

/// The signed invitation advertised to nearby phones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvitePayload {
    /// Human-readable service name, shown by the phone at pairing time.
    pub name: String,
    /// Service public key, base64 of the DER encoding.
    pub public_key: String,
    /// Channel address the phone should connect to.
    pub address: String,
    /// Base64 Ed25519 signature by the service identity key.
    pub signature: String,
}

impl InvitePayload {
    /// Build and sign an invitation for the given channel address.
    #[must_use]
    pub fn sign(identity: &ServiceIdentity, name: &str, address: &str) -> Self {
        let public_key = BASE64.encode(identity.public_key_der());
        let message = signed_message(name, address, &public_key);
        let signature = BASE64.encode(identity.sign(&message).to_bytes());
        Self {
            name: name.to_owned(),
            public_key,
            address: address.to_owned(),
            signature,
        }
    }

    /// Serialise the payload to its wire/QR form.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }

    /// Parse a payload from its wire/QR form.
    ///
    /// # Errors
    ///
    /// Fails if `json` is not a well-formed payload object.
    pub fn from_json(json: &str) -> Result<Self, BeaconError> {
        serde_json::from_str(json).map_err(|err| BeaconError::Malformed(err.to_string()))
    }

    /// Check the payload signature against the embedded public key.
    ///
    /// # Errors
    ///
    /// Fails if the key or signature fail to decode, or the signature does
    /// not cover this payload.
    pub fn verify(&self) -> Result<(), BeaconError> {
        let der = BASE64
            .decode(&self.public_key)
            .map_err(|err| BeaconError::BadSignature(err.to_string()))?;
        let key = VerifyingKey::from_public_key_der(&der)
            .map_err(|err| BeaconError::BadSignature(err.to_string()))?;
        let raw = BASE64
            .decode(&self.signature)
            .map_err(|err| BeaconError::BadSignature(err.to_string()))?;
        let signature = Signature::from_slice(&raw)
            .map_err(|err| BeaconError::BadSignature(err.to_string()))?;

        let message = signed_message(&self.name, &self.address, &self.public_key);
        key.verify(&message, &signature)
            .map_err(|err| BeaconError::BadSignature(err.to_string()))
    }
}

fn signed_message(name: &str, address: &str, public_key: &str) -> Vec<u8> {
    // Newline separation keeps the three fields unambiguous; none of them
    // may contain a newline.
    format!("keyfob-invite\n{name}\n{address}\n{public_key}").into_bytes()
}

/// Load the broadcast target list.
///
/// Returns the unique addresses in file order. A missing file yields an
/// empty list: broadcasting to nobody is a valid (if quiet) campaign.
///
/// # Errors
///
/// Fails only on read errors other than the file being absent.
pub fn load_targets(path: impl AsRef<Path>) -> Result<Vec<String>, std::io::Error> {
    let path = path.as_ref();
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no target list");
            return Ok(Vec::new());
        }
        Err(err) => return Err(err),
    };

    let mut targets: Vec<String> = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = if line.len() > TARGET_LINE_MAX {
            &line[..TARGET_LINE_MAX]
        } else {
            line
        };
        if !targets.iter().any(|known| known == line) {
            targets.push(line.to_owned());
        }
    }

    Ok(targets)
}
