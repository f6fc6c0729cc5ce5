//! Sessions: state, registry, orchestration, reply pairing.
//!
//! One session is one attempt to authenticate one user to this host via a
//! nearby phone. The registry ([`registry::SessionRegistry`]) tracks every
//! live session by handle; the orchestrator ([`orchestrator`]) composes a
//! byte channel, a beacon campaign and the handshake engine into the
//! running session; the pairing slot ([`pairing::ReplySlot`]) guarantees
//! the IPC caller gets exactly one answer to its `CompleteAuth`.

pub mod orchestrator;
pub mod pairing;
pub mod registry;

use std::cell::RefCell;
use std::rc::Rc;

use keyfob_core::identity::Commitment;

use self::pairing::ReplySlot;

/// Lifecycle of one session.
///
/// Transitions are monotonic in this ordering, with one sanctioned
/// exception: `Completed → Continuing` after a successful handshake in
/// continuous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Slot allocated, session not yet started.
    Invalid,
    /// The session is advertising and waiting for a phone.
    Started,
    /// The handshake reached a verdict.
    Completed,
    /// Continuous mode: re-authenticating on a rolling basis.
    Continuing,
    /// Fully wound down; the slot may be reclaimed.
    Harvestable,
}

/// Control messages the registry sends into a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Stop at the earliest opportunity.
    Stop,
    /// The IPC caller that owns this session went away.
    OwnerLost,
}

/// Mutable session state shared between the service loop (via the
/// registry) and the session's orchestrator task.
///
/// Everything runs on the loop thread; `Rc<RefCell<_>>` is the whole
/// synchronisation story.
pub struct SessionShared {
    /// The session's handle (slot index).
    pub handle: i32,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Requested username, replaced by the authenticated username on
    /// success. Empty for any-user sessions until one authenticates.
    pub username: String,
    /// Decrypted user token, empty until a successful handshake (and
    /// possibly after one, if the token failed to decrypt).
    pub token: String,
    /// Whether the handshake succeeded.
    pub success: bool,
    /// Identity of the IPC caller that owns the session.
    pub owner: Option<String>,
    /// Commitment of the service this session fronts.
    pub commitment: Option<Commitment>,
    /// Whether the session runs in continuous mode.
    pub continuous: bool,
    /// The caller's `CompleteAuth` reply slot.
    pub complete_reply: ReplySlot,
}

/// Shared handle to one session's state.
pub type SharedSession = Rc<RefCell<SessionShared>>;

impl SessionShared {
    /// Fresh state for a newly allocated slot.
    #[must_use]
    pub fn new(handle: i32) -> SharedSession {
        Rc::new(RefCell::new(Self {
            handle,
            state: SessionState::Invalid,
            username: String::new(),
            token: String::new(),
            success: false,
            owner: None,
            commitment: None,
            continuous: false,
            complete_reply: ReplySlot::new(),
        }))
    }
}
