//! The session registry.
//!
//! A fixed-capacity sparse table of live sessions. The handle handed to
//! IPC callers is the slot index, so lookups are O(1); a separate live
//! list keeps iteration proportional to the number of live sessions. The
//! registry reclaims finished (`Harvestable`) sessions lazily, at the
//! start of every allocation.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{SessionControl, SessionShared, SessionState, SharedSession};

/// Maximum number of simultaneous sessions.
///
/// System-wide, not per-user — continuous sessions count for their whole
/// lifetime. The stream transport only has 31 channels anyway, so there is
/// little point going higher.
pub const MAX_SESSIONS: usize = 16;

/// One occupied registry slot.
pub struct SessionSlot {
    /// The session state shared with its orchestrator task.
    pub shared: SharedSession,
    control: mpsc::UnboundedSender<SessionControl>,
}

impl SessionSlot {
    /// Send a control message to the session's orchestrator.
    pub fn send(&self, control: SessionControl) {
        // The orchestrator may already be gone; that is equivalent to the
        // session having stopped.
        let _ = self.control.send(control);
    }
}

/// Sparse fixed-capacity table of live sessions.
pub struct SessionRegistry {
    slots: Vec<Option<SessionSlot>>,
    /// Live handles, newest first.
    live: Vec<usize>,
    /// Lowest-index free slot, or `MAX_SESSIONS` when full.
    next_available: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SESSIONS).map(|_| None).collect(),
            live: Vec::new(),
            next_available: 0,
        }
    }

    /// Allocate a slot for a new session.
    ///
    /// Harvests finished sessions first, then takes the lowest free slot.
    /// Returns the new session's shared state and the control receiver for
    /// its orchestrator task, or `None` when the pool is exhausted.
    pub fn allocate(
        &mut self,
    ) -> Option<(i32, SharedSession, mpsc::UnboundedReceiver<SessionControl>)> {
        self.harvest();

        let index = self.next_available;
        if index >= MAX_SESSIONS {
            warn!("session pool of {MAX_SESSIONS} exhausted");
            return None;
        }
        let handle = handle_of(index);
        info!(handle, "creating session");

        let shared = SessionShared::new(handle);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.slots[index] = Some(SessionSlot {
            shared: SharedSession::clone(&shared),
            control: control_tx,
        });
        self.live.insert(0, index);

        while self.next_available < MAX_SESSIONS && self.slots[self.next_available].is_some() {
            self.next_available += 1;
        }

        Some((handle, shared, control_rx))
    }

    /// Remove a session and free its slot.
    pub fn remove(&mut self, handle: i32) {
        let Some(index) = slot_index(handle) else {
            return;
        };
        self.remove_index(index);
    }

    fn remove_index(&mut self, index: usize) {
        if self.slots[index].take().is_some() {
            debug!(handle = handle_of(index), "removing session");
            self.live.retain(|&live| live != index);
            self.next_available = self.next_available.min(index);
        }
    }

    /// Look up a live session by handle.
    #[must_use]
    pub fn get(&self, handle: i32) -> Option<&SessionSlot> {
        self.slots.get(slot_index(handle)?)?.as_ref()
    }

    /// Reclaim every session that has reached `Harvestable`.
    pub fn harvest(&mut self) {
        let harvestable: Vec<usize> = self
            .live
            .iter()
            .copied()
            .filter(|&index| {
                self.slots[index]
                    .as_ref()
                    .is_some_and(|slot| slot.shared.borrow().state == SessionState::Harvestable)
            })
            .collect();

        for index in harvestable {
            self.remove_index(index);
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Iterate over the live sessions, newest first.
    pub fn iter_live(&self) -> impl Iterator<Item = &SessionSlot> {
        self.live
            .iter()
            .filter_map(|&index| self.slots[index].as_ref())
    }

    /// The IPC caller `owner` went away: stop all of its sessions that
    /// have not yet completed.
    pub fn owner_lost(&self, owner: &str) {
        for slot in self.iter_live() {
            let matches = {
                let shared = slot.shared.borrow();
                shared.owner.as_deref() == Some(owner) && shared.state < SessionState::Completed
            };
            if matches {
                debug!(owner, "owner lost, stopping session");
                slot.send(SessionControl::OwnerLost);
            }
        }
    }

    /// A new session superseding older continuous ones just started: stop
    /// every OTHER session that is `Continuing` for the same username
    /// against the same service commitment.
    ///
    /// The typical trigger is the user locking their screen: the lock
    /// screen starts a fresh session, and the lingering continuous session
    /// behind it has lost its purpose. Note that the older session stops
    /// *voluntarily* — its normal stop path runs, including the lock
    /// command it owes for a continuous session that ends. That is the
    /// long-standing observed behaviour; keep it.
    pub fn stop_similar(&self, new_handle: i32) {
        let Some(new_slot) = self.get(new_handle) else {
            return;
        };
        let (username, commitment) = {
            let shared = new_slot.shared.borrow();
            let Some(commitment) = shared.commitment else {
                return;
            };
            (shared.username.clone(), commitment)
        };

        for slot in self.iter_live() {
            let matches = {
                let shared = slot.shared.borrow();
                shared.handle != new_handle
                    && shared.state == SessionState::Continuing
                    && shared.username == username
                    && shared.commitment == Some(commitment)
            };
            if matches {
                info!(
                    handle = slot.shared.borrow().handle,
                    "already continuously authenticating against this service, stopping"
                );
                slot.send(SessionControl::Stop);
            }
        }
    }
}

fn slot_index(handle: i32) -> Option<usize> {
    let index = usize::try_from(handle).ok()?;
    (index < MAX_SESSIONS).then_some(index)
}

/// Slot indexes are small; the cast to the IPC handle type never wraps.
fn handle_of(index: usize) -> i32 {
    i32::try_from(index).expect("slot index fits the handle type")
}

#[cfg(test)]
mod tests {
    use keyfob_core::identity::ServiceIdentity;

    use super::*;

    fn mark(registry: &SessionRegistry, handle: i32, state: SessionState) {
        registry.get(handle).unwrap().shared.borrow_mut().state = state;
    }

    #[test]
    fn allocates_lowest_free_slot_first() {
        let mut registry = SessionRegistry::new();
        let (first, ..) = registry.allocate().unwrap();
        let (second, ..) = registry.allocate().unwrap();
        assert_eq!((first, second), (0, 1));

        registry.remove(0);
        let (reused, ..) = registry.allocate().unwrap();
        assert_eq!(reused, 0, "cursor drops back to the freed slot");
    }

    #[test]
    fn exhaustion_and_harvest_restore_capacity() {
        let mut registry = SessionRegistry::new();
        for _ in 0..MAX_SESSIONS {
            registry.allocate().unwrap();
        }
        assert!(registry.allocate().is_none());

        mark(&registry, 5, SessionState::Harvestable);
        let (handle, ..) = registry.allocate().expect("harvest frees the slot");
        assert_eq!(handle, 5);
    }

    #[test]
    fn harvest_only_takes_harvestable_sessions() {
        let mut registry = SessionRegistry::new();
        registry.allocate().unwrap();
        registry.allocate().unwrap();
        mark(&registry, 0, SessionState::Continuing);
        mark(&registry, 1, SessionState::Harvestable);

        registry.harvest();
        assert!(registry.get(0).is_some());
        assert!(registry.get(1).is_none());
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn get_rejects_bad_handles() {
        let registry = SessionRegistry::new();
        assert!(registry.get(-1).is_none());
        assert!(registry.get(0).is_none());
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        {
            assert!(registry.get(MAX_SESSIONS as i32).is_none());
        }
    }

    #[tokio::test]
    async fn owner_lost_stops_only_that_owners_young_sessions() {
        let mut registry = SessionRegistry::new();
        let (a, shared_a, mut rx_a) = registry.allocate().unwrap();
        let (b, shared_b, mut rx_b) = registry.allocate().unwrap();
        let (_c, shared_c, mut rx_c) = registry.allocate().unwrap();

        shared_a.borrow_mut().owner = Some("conn-1".into());
        shared_a.borrow_mut().state = SessionState::Started;
        shared_b.borrow_mut().owner = Some("conn-1".into());
        shared_b.borrow_mut().state = SessionState::Completed;
        shared_c.borrow_mut().owner = Some("conn-2".into());
        shared_c.borrow_mut().state = SessionState::Started;

        registry.owner_lost("conn-1");

        assert_eq!(rx_a.try_recv().unwrap(), SessionControl::OwnerLost);
        assert!(rx_b.try_recv().is_err(), "completed sessions are left alone");
        assert!(rx_c.try_recv().is_err(), "other owners are left alone");
        let _ = (a, b);
    }

    #[tokio::test]
    async fn stop_similar_matches_user_and_commitment() {
        let identity = ServiceIdentity::generate();
        let other_identity = ServiceIdentity::generate();
        let mut registry = SessionRegistry::new();

        let (old, shared_old, mut rx_old) = registry.allocate().unwrap();
        let (unrelated, shared_unrelated, mut rx_unrelated) = registry.allocate().unwrap();
        let (new, shared_new, mut rx_new) = registry.allocate().unwrap();

        {
            let mut s = shared_old.borrow_mut();
            s.state = SessionState::Continuing;
            s.username = "alice".into();
            s.commitment = Some(identity.commitment());
        }
        {
            let mut s = shared_unrelated.borrow_mut();
            s.state = SessionState::Continuing;
            s.username = "alice".into();
            s.commitment = Some(other_identity.commitment());
        }
        {
            let mut s = shared_new.borrow_mut();
            s.state = SessionState::Started;
            s.username = "alice".into();
            s.commitment = Some(identity.commitment());
        }

        registry.stop_similar(new);

        assert_eq!(rx_old.try_recv().unwrap(), SessionControl::Stop);
        assert!(rx_unrelated.try_recv().is_err(), "different service");
        assert!(rx_new.try_recv().is_err(), "never stops the new session");
        let _ = (old, unrelated);
    }
}
