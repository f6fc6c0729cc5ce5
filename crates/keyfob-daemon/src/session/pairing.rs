//! Request/reply pairing for the asynchronous `CompleteAuth` call.
//!
//! The caller makes two calls per session. `StartAuth` is answered
//! synchronously while the session is being set up. `CompleteAuth` is the
//! awkward one: it may arrive before *or* after the handshake resolves,
//! and either way it must receive exactly one answer.
//!
//! [`ReplySlot`] holds both halves of that rendezvous — the waiting caller
//! (if it arrived first) and the session's outcome (if that happened
//! first) — and pairs them up whichever order they land in. A slot is
//! never silently dropped: a session winding down with an unresolved slot
//! resolves it to failure first.

use tokio::sync::oneshot;
use tracing::debug;

/// Answer to a `StartAuth` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReply {
    /// Session handle, `-1` when no session could be created.
    pub handle: i32,
    /// Serialized invitation payload for QR display; empty on failure.
    pub code: String,
    /// Whether the session was set up.
    pub success: bool,
}

impl StartReply {
    /// The reply for a failed setup.
    #[must_use]
    pub fn failure(handle: i32) -> Self {
        Self {
            handle,
            code: String::new(),
            success: false,
        }
    }
}

/// Answer to a `CompleteAuth` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteReply {
    /// The authenticated username; empty on failure.
    pub username: String,
    /// The decrypted user token; may be empty even on success.
    pub token: String,
    /// Whether authentication succeeded.
    pub success: bool,
}

impl CompleteReply {
    /// A successful authentication result.
    #[must_use]
    pub fn success(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
            success: true,
        }
    }

    /// The anonymous failure reply.
    #[must_use]
    pub fn failure() -> Self {
        Self {
            username: String::new(),
            token: String::new(),
            success: false,
        }
    }
}

/// The per-session `CompleteAuth` reply slot.
pub struct ReplySlot {
    waiter: Option<oneshot::Sender<CompleteReply>>,
    outcome: Option<CompleteReply>,
    delivered: bool,
}

impl Default for ReplySlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplySlot {
    /// An empty slot: no caller waiting, no outcome known.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiter: None,
            outcome: None,
            delivered: false,
        }
    }

    /// Bind a waiting caller.
    ///
    /// If the outcome is already known the caller is answered on the spot.
    /// A second caller after the slot has been observed gets a failure
    /// reply — the session's one result has already been handed out.
    pub fn bind(&mut self, reply_to: oneshot::Sender<CompleteReply>) {
        if self.delivered {
            debug!("reply slot already observed, answering failure");
            let _ = reply_to.send(CompleteReply::failure());
            return;
        }
        if let Some(outcome) = self.outcome.take() {
            self.delivered = true;
            let _ = reply_to.send(outcome);
            return;
        }
        if self.waiter.is_some() {
            debug!("replacing bound caller, answering failure to the newcomer");
            let _ = reply_to.send(CompleteReply::failure());
            return;
        }
        self.waiter = Some(reply_to);
    }

    /// Record the session's outcome.
    ///
    /// If a caller is already waiting it is answered immediately;
    /// otherwise the outcome is parked for the caller to collect. Only the
    /// first outcome counts.
    pub fn resolve(&mut self, reply: CompleteReply) {
        if self.delivered || self.outcome.is_some() {
            return;
        }
        if let Some(waiter) = self.waiter.take() {
            self.delivered = true;
            let _ = waiter.send(reply);
        } else {
            self.outcome = Some(reply);
        }
    }

    /// Resolve to failure unless the slot already holds a result.
    ///
    /// Called on every session teardown path so no caller is left hanging
    /// and no slot is dropped unresolved.
    pub fn resolve_failure_if_pending(&mut self) {
        self.resolve(CompleteReply::failure());
    }

    /// Whether the slot has been observed by a caller.
    #[must_use]
    pub const fn delivered(&self) -> bool {
        self.delivered
    }
}
