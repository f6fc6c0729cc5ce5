//! User-token sealing.
//!
//! During the handshake the phone transmits an opaque extra-data string; in
//! this system it carries the user's login token, encrypted under the
//! symmetric key agreed at pairing time. The wire form is
//! `base64(nonce ‖ ciphertext)` with a ChaCha20-Poly1305 AEAD.
//!
//! A token that fails to decrypt is not a handshake failure: the
//! authentication outcome stands and the session proceeds with an empty
//! token. Callers decide what to log.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::users::SymmetricKey;

/// Size of the AEAD nonce prepended to the ciphertext.
const NONCE_LEN: usize = 12;

/// Errors raised while unsealing a token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The extra-data is not valid base64.
    #[error("extra-data is not base64")]
    Encoding,

    /// The decoded extra-data is too short to hold a nonce.
    #[error("extra-data too short")]
    TooShort,

    /// Authenticated decryption failed.
    #[error("token failed to decrypt")]
    Decrypt,

    /// The plaintext is not UTF-8.
    #[error("token is not valid UTF-8")]
    NotText,
}

/// Unseal the token carried in handshake extra-data.
///
/// # Errors
///
/// Fails if the extra-data is malformed or does not authenticate under
/// `key`. The caller treats this as a missing token, not as an
/// authentication failure.
pub fn unseal(key: &SymmetricKey, extra_data: &[u8]) -> Result<String, TokenError> {
    let decoded = BASE64
        .decode(extra_data)
        .map_err(|_| TokenError::Encoding)?;
    if decoded.len() < NONCE_LEN {
        return Err(TokenError::TooShort);
    }
    let (nonce, ciphertext) = decoded.split_at(NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenError::Decrypt)?,
    );

    String::from_utf8(plaintext.to_vec()).map_err(|_| TokenError::NotText)
}

/// Seal a token the way a phone does.
///
/// The daemon never seals tokens itself; this is the counterpart used by
/// the pairing tool and by tests simulating a phone.
#[must_use]
pub fn seal(key: &SymmetricKey, token: &str) -> String {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), token.as_bytes())
        .expect("chacha20poly1305 encryption is infallible for in-memory data");

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    BASE64.encode(sealed)
}
