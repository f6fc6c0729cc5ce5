//! End-to-end session flows through the service loop, with in-memory
//! channels playing the transport and scripted phones on the far side.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use keyfob_core::beacon::InvitePayload;
use keyfob_core::config::ChannelKind;
use keyfob_core::identity::{Commitment, ServiceIdentity};
use keyfob_core::token;
use keyfob_core::users::SymmetricKey;
use keyfob_daemon::beacons::{BeaconSendError, BeaconTransport};
use keyfob_daemon::channel::mem::{MemChannel, MemPeer};
use keyfob_daemon::channel::{AnyChannel, ChannelFactory, ChannelParams};
use keyfob_daemon::handshake::{response_binding, HandshakeMessage};
use keyfob_daemon::lock::Locker;
use keyfob_daemon::session::pairing::{CompleteReply, StartReply};
use keyfob_daemon::session::registry::MAX_SESSIONS;
use keyfob_daemon::{ServiceCommand, ServiceLoop};
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;

/// Factory handing every new session an in-memory channel and parking the
/// phone side for the test to pick up.
#[derive(Clone)]
struct MemFactory {
    peers: Rc<RefCell<VecDeque<MemPeer>>>,
}

impl ChannelFactory for MemFactory {
    fn create(&self, _kind: ChannelKind, _params: &ChannelParams) -> AnyChannel {
        let (channel, peer) = MemChannel::pair();
        self.peers.borrow_mut().push_back(peer);
        AnyChannel::Mem(channel)
    }
}

#[derive(Clone, Default)]
struct NullBeacons;

impl BeaconTransport for NullBeacons {
    type Route = ();

    async fn locate(&self, _target: &str) -> Result<(), BeaconSendError> {
        Ok(())
    }

    async fn deliver(&self, (): (), _payload: &[u8]) -> Result<(), BeaconSendError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingLocker {
    locked: RefCell<Vec<String>>,
}

impl Locker for RecordingLocker {
    fn lock(&self, username: &str) {
        self.locked.borrow_mut().push(username.to_owned());
    }
}

struct Phone {
    key: SigningKey,
    symmetric: SymmetricKey,
}

impl Phone {
    fn new(symmetric_byte: u8) -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
            symmetric: SymmetricKey::from_bytes([symmetric_byte; 32]),
        }
    }

    fn record(&self, name: &str) -> String {
        format!(
            "{name}:{}:{}",
            BASE64.encode(self.key.verifying_key().as_bytes()),
            BASE64.encode(self.symmetric.as_bytes()),
        )
    }

    fn hello(&self, name: &str) -> Bytes {
        Bytes::from(
            serde_json::to_vec(&HandshakeMessage::Hello {
                user: name.to_owned(),
                public_key: BASE64.encode(self.key.verifying_key().as_bytes()),
            })
            .unwrap(),
        )
    }

    fn respond(&self, challenge: &[u8], commitment: &Commitment, plaintext_token: &str) -> Bytes {
        let HandshakeMessage::Challenge { nonce, .. } = serde_json::from_slice(challenge).unwrap()
        else {
            panic!("expected a challenge frame");
        };
        let nonce = BASE64.decode(nonce).unwrap();
        let signature = self.key.sign(&response_binding(&nonce, commitment));
        Bytes::from(
            serde_json::to_vec(&HandshakeMessage::Response {
                signature: BASE64.encode(signature.to_bytes()),
                extra_data: token::seal(&self.symmetric, plaintext_token),
            })
            .unwrap(),
        )
    }
}

struct Harness {
    commands: mpsc::UnboundedSender<ServiceCommand>,
    peers: Rc<RefCell<VecDeque<MemPeer>>>,
    locker: Rc<RecordingLocker>,
    commitment: Commitment,
    alice: Phone,
    bob: Phone,
    _dir: tempfile::TempDir,
}

impl Harness {
    /// Build a config directory with a service identity and a users file
    /// pairing alice and bob, then spawn the service loop on the current
    /// local set.
    fn spawn(config_file: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let identity = ServiceIdentity::generate();
        identity.save(dir.path()).unwrap();

        let alice = Phone::new(3);
        let bob = Phone::new(4);
        std::fs::write(
            dir.path().join("users.txt"),
            format!("{}\n{}\n", alice.record("alice"), bob.record("bob")),
        )
        .unwrap();
        if let Some(contents) = config_file {
            std::fs::write(dir.path().join("config.txt"), contents).unwrap();
        }

        let peers = Rc::new(RefCell::new(VecDeque::new()));
        let locker = Rc::new(RecordingLocker::default());
        let service = ServiceLoop::new(
            MemFactory {
                peers: Rc::clone(&peers),
            },
            NullBeacons,
            Rc::clone(&locker) as Rc<dyn Locker>,
            Some(format!("{}/", dir.path().display())),
            "test-host",
        );

        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::task::spawn_local(service.run(commands_rx));

        Self {
            commands,
            peers,
            locker,
            commitment: identity.commitment(),
            alice,
            bob,
            _dir: dir,
        }
    }

    async fn start_auth(&self, username: &str, parameters: &str, owner: &str) -> StartReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ServiceCommand::StartAuth {
                username: username.to_owned(),
                parameters: parameters.to_owned(),
                owner: Some(owner.to_owned()),
                reply: reply_tx,
            })
            .unwrap();
        reply_rx.await.unwrap()
    }

    fn complete_auth(&self, handle: i32) -> oneshot::Receiver<CompleteReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ServiceCommand::CompleteAuth {
                handle,
                owner: None,
                reply: reply_tx,
            })
            .unwrap();
        reply_rx
    }

    fn owner_lost(&self, owner: &str) {
        self.commands
            .send(ServiceCommand::OwnerLost {
                owner: owner.to_owned(),
            })
            .unwrap();
    }

    fn take_peer(&self) -> MemPeer {
        self.peers
            .borrow_mut()
            .pop_front()
            .expect("a session should have created a channel")
    }
}

/// Run the phone side of a successful handshake and return the status
/// frame the service sent back.
async fn authenticate(
    peer: &mut MemPeer,
    phone: &Phone,
    name: &str,
    commitment: &Commitment,
    plaintext_token: &str,
) -> HandshakeMessage {
    peer.connect();
    peer.send_frame(phone.hello(name));
    let challenge = peer.recv_frame().await.unwrap();
    peer.send_frame(phone.respond(&challenge, commitment, plaintext_token));
    let status = peer.recv_frame().await.unwrap();
    serde_json::from_slice(&status).unwrap()
}

#[tokio::test]
async fn happy_path_non_continuous() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let started = harness
                .start_auth("alice", r#"{"any_user":0,"beacons":0}"#, "client-0")
                .await;
            assert!(started.success);
            assert!(started.handle >= 0);

            // The code is a verifiable signed invitation.
            let invite = InvitePayload::from_json(&started.code).unwrap();
            invite.verify().unwrap();
            assert_eq!(invite.name, "test-host");

            let mut peer = harness.take_peer();
            let status = authenticate(
                &mut peer,
                &harness.alice,
                "alice",
                &harness.commitment,
                "Passuser0",
            )
            .await;
            assert!(matches!(
                status,
                HandshakeMessage::Status {
                    ok: true,
                    resume: false
                }
            ));

            let reply = harness.complete_auth(started.handle).await.unwrap();
            assert_eq!(reply, CompleteReply::success("alice", "Passuser0"));

            // The slot is harvested on the next allocation.
            let again = harness
                .start_auth("alice", r#"{"beacons":0}"#, "client-1")
                .await;
            assert_eq!(again.handle, started.handle);
        })
        .await;
}

#[tokio::test]
async fn any_user_with_unpaired_credentials_fails() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let started = harness
                .start_auth("", r#"{"any_user":1,"beacons":0}"#, "client-0")
                .await;
            assert!(started.success);

            let mallory = Phone::new(9);
            let mut peer = harness.take_peer();
            peer.connect();
            peer.send_frame(mallory.hello("mallory"));
            let status = peer.recv_frame().await.unwrap();
            let status: HandshakeMessage = serde_json::from_slice(&status).unwrap();
            assert!(matches!(status, HandshakeMessage::Status { ok: false, .. }));

            let reply = harness.complete_auth(started.handle).await.unwrap();
            assert_eq!(reply, CompleteReply::failure());
        })
        .await;
}

#[tokio::test]
async fn specific_user_with_wrong_credential_fails() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let started = harness
                .start_auth("alice", r#"{"any_user":0,"beacons":0}"#, "client-0")
                .await;
            assert!(started.success);

            // Bob's phone presents bob's key under alice's session.
            let mut peer = harness.take_peer();
            peer.connect();
            peer.send_frame(harness.bob.hello("bob"));
            let status = peer.recv_frame().await.unwrap();
            let status: HandshakeMessage = serde_json::from_slice(&status).unwrap();
            assert!(matches!(status, HandshakeMessage::Status { ok: false, .. }));

            let reply = harness.complete_auth(started.handle).await.unwrap();
            assert_eq!(reply, CompleteReply::failure());
        })
        .await;
}

#[tokio::test]
async fn unknown_user_fails_before_any_handshake() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let started = harness
                .start_auth("nosuchuser", r#"{"any_user":0,"beacons":0}"#, "client-0")
                .await;
            assert!(!started.success);
            assert!(started.code.is_empty());
            assert!(started.handle >= 0);
            // The filter bailed before a channel was ever created.
            assert!(harness.peers.borrow().is_empty());

            let reply = harness.complete_auth(started.handle).await.unwrap();
            assert_eq!(reply, CompleteReply::failure());
        })
        .await;
}

#[tokio::test]
async fn owner_lost_while_waiting_stops_the_session() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let started = harness
                .start_auth("alice", r#"{"beacons":0}"#, "client-7")
                .await;
            assert!(started.success);

            harness.owner_lost("client-7");

            let reply = harness.complete_auth(started.handle).await.unwrap();
            assert_eq!(reply, CompleteReply::failure());

            // The slot comes back on the next allocation.
            let again = harness
                .start_auth("alice", r#"{"beacons":0}"#, "client-8")
                .await;
            assert_eq!(again.handle, started.handle);
        })
        .await;
}

#[tokio::test]
async fn file_cannot_widen_any_user() {
    LocalSet::new()
        .run_until(async {
            // The file says any_user; the caller says a specific user. The
            // caller wins: bob's (paired!) phone must be rejected under
            // alice's session. continuous from the caller still applies.
            let harness = Harness::spawn(Some(r#"{"any_user":1}"#));

            let started = harness
                .start_auth("alice", r#"{"any_user":0,"continuous":1,"beacons":0}"#, "c0")
                .await;
            assert!(started.success);

            let mut peer = harness.take_peer();
            peer.connect();
            peer.send_frame(harness.bob.hello("bob"));
            let status = peer.recv_frame().await.unwrap();
            let status: HandshakeMessage = serde_json::from_slice(&status).unwrap();
            assert!(matches!(status, HandshakeMessage::Status { ok: false, .. }));

            let reply = harness.complete_auth(started.handle).await.unwrap();
            assert_eq!(reply, CompleteReply::failure());
        })
        .await;
}

#[tokio::test]
async fn capacity_exhaustion_and_recovery() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let mut handles = Vec::new();
            for i in 0..MAX_SESSIONS {
                let started = harness
                    .start_auth("alice", r#"{"beacons":0}"#, &format!("client-{i}"))
                    .await;
                assert!(started.success, "session {i} should start");
                handles.push(started.handle);
            }
            assert_eq!(handles.len(), MAX_SESSIONS);

            // One more: the pool is exhausted.
            let overflow = harness
                .start_auth("alice", r#"{"beacons":0}"#, "client-extra")
                .await;
            assert_eq!(overflow.handle, -1);
            assert!(!overflow.success);
            assert!(overflow.code.is_empty());

            // Free one slot (its owner goes away) and try again.
            harness.owner_lost("client-3");
            let reply = harness.complete_auth(handles[3]).await.unwrap();
            assert_eq!(reply, CompleteReply::failure());

            let recovered = harness
                .start_auth("alice", r#"{"beacons":0}"#, "client-new")
                .await;
            assert!(recovered.success);
            assert_eq!(recovered.handle, handles[3]);
        })
        .await;
}

#[tokio::test]
async fn continuous_session_locks_when_contact_is_lost() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let started = harness
                .start_auth("alice", r#"{"continuous":1,"beacons":0}"#, "client-0")
                .await;
            assert!(started.success);

            let mut peer = harness.take_peer();
            let status = authenticate(
                &mut peer,
                &harness.alice,
                "alice",
                &harness.commitment,
                "Passuser0",
            )
            .await;
            assert!(matches!(
                status,
                HandshakeMessage::Status {
                    ok: true,
                    resume: true
                }
            ));

            let reply = harness.complete_auth(started.handle).await.unwrap();
            assert_eq!(reply, CompleteReply::success("alice", "Passuser0"));
            assert!(harness.locker.locked.borrow().is_empty());

            // Contact lost: the desktop locks.
            peer.disconnect();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            assert_eq!(harness.locker.locked.borrow().as_slice(), ["alice"]);
        })
        .await;
}

#[tokio::test]
async fn a_new_session_supersedes_a_continuing_one() {
    LocalSet::new()
        .run_until(async {
            let harness = Harness::spawn(None);

            let first = harness
                .start_auth("alice", r#"{"continuous":1,"beacons":0}"#, "client-0")
                .await;
            let mut peer = harness.take_peer();
            authenticate(
                &mut peer,
                &harness.alice,
                "alice",
                &harness.commitment,
                "Passuser0",
            )
            .await;
            let reply = harness.complete_auth(first.handle).await.unwrap();
            assert!(reply.success);

            // The user locks their screen; the lock screen starts a new
            // session for the same user against the same service. The
            // lingering continuous session stops — and, stopping as a
            // continuous session that had authenticated, locks.
            let second = harness
                .start_auth("alice", r#"{"beacons":0}"#, "client-1")
                .await;
            assert!(second.success);
            assert_ne!(second.handle, first.handle);

            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            assert_eq!(harness.locker.locked.borrow().as_slice(), ["alice"]);

            // The superseded session is harvestable; the new one is not.
            let third = harness
                .start_auth("bob", r#"{"beacons":0}"#, "client-2")
                .await;
            assert_eq!(third.handle, first.handle);
        })
        .await;
}
