//! The handshake state machine and its driver contract.
//!
//! The orchestrator and the handshake engine meet at a narrow, two-sided
//! contract. The engine consumes transport events — `connected`, `read`,
//! `disconnected`, `timeout`, `stop` — and calls back through
//! [`HandshakeDriver`] to write frames, arm timeouts and report progress.
//! The engine never touches a channel, a timer or a session directly, which
//! is what lets tests drive it with a scripted driver and lets the
//! orchestrator swap engines without caring what runs inside.
//!
//! [`SigChallengeFsm`] is the engine the daemon ships: a signature
//! challenge/response against the paired-user table. The phone opens with
//! `hello` naming a user and a public key; the service answers with a fresh
//! nonce; the phone proves possession of the paired key by signing the
//! nonce bound to the service commitment, attaching its encrypted user
//! token as extra-data. In continuous mode the service then keeps issuing
//! periodic proof challenges; a missed or invalid proof ends the session.

use std::rc::Rc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use keyfob_core::identity::{Commitment, ServiceIdentity};
use keyfob_core::users::{SymmetricKey, UserEntry, UserTable};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Wait for `hello` after the phone connects.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Wait for the challenge response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Gap between continuous-mode proof challenges.
const REAUTH_INTERVAL: Duration = Duration::from_secs(10);

/// Wait for a proof response before declaring contact lost.
const PROOF_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome reported through [`HandshakeDriver::on_authenticated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authentication succeeded; the session is done.
    Accepted,
    /// Authentication succeeded and the session continues re-proving.
    AcceptedContinue,
    /// Authentication failed.
    Rejected,
}

impl AuthOutcome {
    /// Whether the outcome is a success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Accepted | Self::AcceptedContinue)
    }
}

/// Progress states the engine reports through
/// [`HandshakeDriver::on_status_updated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Not yet started.
    Idle,
    /// Waiting for a phone to connect.
    Listening,
    /// A phone connected; waiting for `hello`.
    AwaitingHello,
    /// Challenge issued; waiting for the signed response.
    AwaitingResponse,
    /// Authenticated, session complete (non-continuous).
    Authenticated,
    /// Authenticated and in the continuous re-proof cycle.
    Continuing,
    /// A proof challenge is outstanding.
    AwaitingProof,
    /// Finished normally.
    Fin,
    /// Finished on a protocol failure.
    Failed,
}

/// Callbacks the orchestrator hands to the engine.
pub trait HandshakeDriver {
    /// Transmit one frame to the phone.
    fn write(&mut self, frame: &[u8]);
    /// Arm (or re-arm) the engine's single timeout.
    fn set_timeout(&mut self, after: Duration);
    /// The handshake failed irrecoverably.
    fn on_error(&mut self);
    /// The engine wants the transport listening for a connection.
    fn on_listen(&mut self);
    /// The engine wants the current connection closed.
    fn on_disconnect(&mut self);
    /// The handshake reached a terminal authentication outcome.
    fn on_authenticated(&mut self, outcome: AuthOutcome);
    /// A continuous session ended (contact lost or proof failed).
    fn on_session_ended(&mut self);
    /// The engine moved to a new state.
    fn on_status_updated(&mut self, state: HandshakeState);
}

/// Transport events the orchestrator feeds into an engine.
pub trait HandshakeFsm {
    /// Begin: the engine asks the driver to listen.
    fn start(&mut self, driver: &mut dyn HandshakeDriver);
    /// A phone connected.
    fn connected(&mut self, driver: &mut dyn HandshakeDriver);
    /// One frame arrived from the phone.
    fn read(&mut self, driver: &mut dyn HandshakeDriver, frame: &[u8]);
    /// The phone connection dropped.
    fn disconnected(&mut self, driver: &mut dyn HandshakeDriver);
    /// The armed timeout fired.
    fn timeout(&mut self, driver: &mut dyn HandshakeDriver);
    /// The session is stopping; wind the handshake down.
    fn stop(&mut self, driver: &mut dyn HandshakeDriver);

    /// The authenticated user, once there is one.
    fn authenticated_user(&self) -> Option<&str>;
    /// The authenticated user's symmetric key, once there is one.
    fn symmetric_key(&self) -> Option<&SymmetricKey>;
    /// The latest extra-data received from the phone (may be empty).
    fn received_extra_data(&self) -> &[u8];
}

/// Messages exchanged on the wire, one JSON object per frame.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Phone → service: claim an identity.
    Hello {
        /// Account name the phone wants to log in as.
        user: String,
        /// Base64 of the phone's Ed25519 verifying key.
        public_key: String,
    },
    /// Service → phone: prove you hold the paired key.
    Challenge {
        /// Base64 nonce to sign, bound to the service commitment.
        nonce: String,
        /// Base64 extra-data the service forwards to the phone.
        extra_data: String,
    },
    /// Phone → service: the proof, plus the encrypted user token.
    Response {
        /// Base64 signature over the challenge binding.
        signature: String,
        /// Opaque extra-data; here the sealed user token.
        extra_data: String,
    },
    /// Service → phone: authentication verdict.
    Status {
        /// Whether authentication succeeded.
        ok: bool,
        /// Whether the service expects the continuous re-proof cycle.
        resume: bool,
    },
    /// Service → phone: continuous-mode proof challenge.
    Proof {
        /// Base64 nonce to sign.
        nonce: String,
    },
    /// Phone → service: continuous-mode proof.
    ProofResponse {
        /// Base64 signature over the proof binding.
        signature: String,
    },
}

/// Byte string a response signature must cover.
#[must_use]
pub fn response_binding(nonce: &[u8], commitment: &Commitment) -> Vec<u8> {
    let mut message = b"keyfob-response\n".to_vec();
    message.extend_from_slice(nonce);
    message.extend_from_slice(commitment.as_bytes());
    message
}

/// Byte string a continuous proof signature must cover.
#[must_use]
pub fn proof_binding(nonce: &[u8], commitment: &Commitment) -> Vec<u8> {
    let mut message = b"keyfob-proof\n".to_vec();
    message.extend_from_slice(nonce);
    message.extend_from_slice(commitment.as_bytes());
    message
}

/// The built-in signature challenge/response engine.
pub struct SigChallengeFsm {
    identity: Rc<ServiceIdentity>,
    users: UserTable,
    continuous: bool,
    extra_data: Vec<u8>,
    state: HandshakeState,
    nonce: [u8; 32],
    matched: Option<UserEntry>,
    received_extra: Vec<u8>,
}

impl SigChallengeFsm {
    /// Engine for one session.
    ///
    /// `users` is the table of acceptable credentials — already filtered to
    /// one username unless the session allows any user. An empty table
    /// rejects every attempt; it never means "anyone".
    #[must_use]
    pub fn new(
        identity: Rc<ServiceIdentity>,
        users: UserTable,
        continuous: bool,
        extra_data: Vec<u8>,
    ) -> Self {
        Self {
            identity,
            users,
            continuous,
            extra_data,
            state: HandshakeState::Idle,
            nonce: [0u8; 32],
            matched: None,
            received_extra: Vec::new(),
        }
    }

    /// Current engine state.
    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn set_state(&mut self, driver: &mut dyn HandshakeDriver, state: HandshakeState) {
        debug!(from = ?self.state, to = ?state, "handshake state");
        self.state = state;
        driver.on_status_updated(state);
    }

    fn fresh_nonce(&mut self) -> String {
        rand::rngs::OsRng.fill_bytes(&mut self.nonce);
        BASE64.encode(self.nonce)
    }

    fn write_message(driver: &mut dyn HandshakeDriver, message: &HandshakeMessage) {
        match serde_json::to_vec(message) {
            Ok(frame) => driver.write(&frame),
            Err(err) => warn!(%err, "failed to encode handshake message"),
        }
    }

    fn reject(&mut self, driver: &mut dyn HandshakeDriver) {
        Self::write_message(
            driver,
            &HandshakeMessage::Status {
                ok: false,
                resume: false,
            },
        );
        self.set_state(driver, HandshakeState::Failed);
        driver.on_authenticated(AuthOutcome::Rejected);
    }

    fn protocol_error(&mut self, driver: &mut dyn HandshakeDriver) {
        self.set_state(driver, HandshakeState::Failed);
        driver.on_error();
    }

    fn handle_hello(&mut self, driver: &mut dyn HandshakeDriver, user: &str, public_key: &str) {
        let Some(key) = decode_verifying_key(public_key) else {
            warn!("hello carried an undecodable public key");
            self.reject(driver);
            return;
        };

        // An empty table means "no valid credentials", never "anyone".
        let Some(entry) = self.users.find(user, &key).cloned() else {
            info!(user, "no pairing matches the presented credentials");
            self.reject(driver);
            return;
        };

        debug!(user, "credentials recognised, issuing challenge");
        self.matched = Some(entry);
        let nonce = self.fresh_nonce();
        Self::write_message(
            driver,
            &HandshakeMessage::Challenge {
                nonce,
                extra_data: BASE64.encode(&self.extra_data),
            },
        );
        self.set_state(driver, HandshakeState::AwaitingResponse);
        driver.set_timeout(RESPONSE_TIMEOUT);
    }

    fn handle_response(
        &mut self,
        driver: &mut dyn HandshakeDriver,
        signature: &str,
        extra_data: &str,
    ) {
        let entry = self.matched.clone();
        let Some(entry) = entry else {
            self.protocol_error(driver);
            return;
        };

        let binding = response_binding(&self.nonce, &self.identity.commitment());
        if !verify(&entry.verifying_key, &binding, signature) {
            info!(user = %entry.name, "challenge response rejected");
            self.reject(driver);
            return;
        }

        info!(user = %entry.name, "phone authenticated");
        self.received_extra = extra_data.as_bytes().to_vec();
        Self::write_message(
            driver,
            &HandshakeMessage::Status {
                ok: true,
                resume: self.continuous,
            },
        );

        if self.continuous {
            self.set_state(driver, HandshakeState::Continuing);
            driver.set_timeout(REAUTH_INTERVAL);
            driver.on_authenticated(AuthOutcome::AcceptedContinue);
        } else {
            self.set_state(driver, HandshakeState::Authenticated);
            driver.on_authenticated(AuthOutcome::Accepted);
        }
    }

    fn handle_proof_response(&mut self, driver: &mut dyn HandshakeDriver, signature: &str) {
        let Some(entry) = self.matched.clone() else {
            self.protocol_error(driver);
            return;
        };

        let binding = proof_binding(&self.nonce, &self.identity.commitment());
        if verify(&entry.verifying_key, &binding, signature) {
            debug!(user = %entry.name, "proof accepted");
            self.set_state(driver, HandshakeState::Continuing);
            driver.set_timeout(REAUTH_INTERVAL);
        } else {
            warn!(user = %entry.name, "proof rejected, ending session");
            self.set_state(driver, HandshakeState::Fin);
            driver.on_session_ended();
        }
    }
}

impl HandshakeFsm for SigChallengeFsm {
    fn start(&mut self, driver: &mut dyn HandshakeDriver) {
        self.set_state(driver, HandshakeState::Listening);
        driver.on_listen();
    }

    fn connected(&mut self, driver: &mut dyn HandshakeDriver) {
        if self.state != HandshakeState::Listening {
            warn!(state = ?self.state, "unexpected connection");
            return;
        }
        self.set_state(driver, HandshakeState::AwaitingHello);
        driver.set_timeout(HELLO_TIMEOUT);
    }

    fn read(&mut self, driver: &mut dyn HandshakeDriver, frame: &[u8]) {
        let message: HandshakeMessage = match serde_json::from_slice(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "unparseable handshake frame");
                self.protocol_error(driver);
                return;
            }
        };

        match (self.state, message) {
            (HandshakeState::AwaitingHello, HandshakeMessage::Hello { user, public_key }) => {
                self.handle_hello(driver, &user, &public_key);
            }
            (
                HandshakeState::AwaitingResponse,
                HandshakeMessage::Response {
                    signature,
                    extra_data,
                },
            ) => {
                self.handle_response(driver, &signature, &extra_data);
            }
            (
                HandshakeState::Continuing | HandshakeState::AwaitingProof,
                HandshakeMessage::ProofResponse { signature },
            ) => {
                self.handle_proof_response(driver, &signature);
            }
            (state, message) => {
                warn!(?state, ?message, "handshake message out of order");
                self.protocol_error(driver);
            }
        }
    }

    fn disconnected(&mut self, driver: &mut dyn HandshakeDriver) {
        match self.state {
            HandshakeState::Continuing | HandshakeState::AwaitingProof => {
                info!("phone contact lost");
                self.set_state(driver, HandshakeState::Fin);
                driver.on_session_ended();
            }
            HandshakeState::AwaitingHello | HandshakeState::AwaitingResponse => {
                warn!("phone disconnected mid-handshake");
                self.protocol_error(driver);
            }
            HandshakeState::Authenticated => {
                self.set_state(driver, HandshakeState::Fin);
            }
            _ => {}
        }
    }

    fn timeout(&mut self, driver: &mut dyn HandshakeDriver) {
        match self.state {
            HandshakeState::AwaitingHello | HandshakeState::AwaitingResponse => {
                warn!(state = ?self.state, "handshake stalled");
                self.protocol_error(driver);
            }
            HandshakeState::Continuing => {
                let nonce = self.fresh_nonce();
                Self::write_message(driver, &HandshakeMessage::Proof { nonce });
                self.set_state(driver, HandshakeState::AwaitingProof);
                driver.set_timeout(PROOF_TIMEOUT);
            }
            HandshakeState::AwaitingProof => {
                info!("proof timed out, phone contact lost");
                self.set_state(driver, HandshakeState::Fin);
                driver.on_session_ended();
            }
            _ => {}
        }
    }

    fn stop(&mut self, driver: &mut dyn HandshakeDriver) {
        if !matches!(self.state, HandshakeState::Fin | HandshakeState::Failed) {
            self.state = HandshakeState::Fin;
            driver.on_disconnect();
        }
    }

    fn authenticated_user(&self) -> Option<&str> {
        match self.state {
            HandshakeState::Authenticated
            | HandshakeState::Continuing
            | HandshakeState::AwaitingProof
            | HandshakeState::Fin => self.matched.as_ref().map(|entry| entry.name.as_str()),
            _ => None,
        }
    }

    fn symmetric_key(&self) -> Option<&SymmetricKey> {
        self.matched.as_ref().map(|entry| &entry.symmetric_key)
    }

    fn received_extra_data(&self) -> &[u8] {
        &self.received_extra
    }
}

fn decode_verifying_key(encoded: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = BASE64.decode(encoded).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

fn verify(key: &VerifyingKey, message: &[u8], signature_b64: &str) -> bool {
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
