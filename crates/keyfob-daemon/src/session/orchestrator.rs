//! The per-session orchestrator.
//!
//! Composes one byte channel, one beacon campaign and one handshake engine
//! into a running session, and reconciles their asynchronous completions:
//! channel events feed the engine, engine callbacks drive the channel and
//! the session state, and every failure path funnels through the stop
//! request.
//!
//! Stopping is cooperative. A stop request asks each part to drain — the
//! engine winds down, the beacon campaign lets in-flight sends finish,
//! pending reads are cancelled (writes are not) — and the session only
//! counts as stopped once nothing is reading, nothing is writing, no
//! connection is open and the campaign has drained. At that point the slot
//! becomes harvestable and any still-pending reply resolves to failure; no
//! caller is ever left hanging.

use std::rc::Rc;

use bytes::Bytes;
use keyfob_core::beacon::InvitePayload;
use keyfob_core::config::SessionConfig;
use keyfob_core::identity::ServiceIdentity;
use keyfob_core::token;
use keyfob_core::users::UserTable;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::beacons::{BeaconCampaign, BeaconTransport};
use crate::channel::{ByteChannel, ChannelError, ChannelEvent, TransportErrorKind};
use crate::handshake::{
    AuthOutcome, HandshakeDriver, HandshakeFsm, HandshakeState, SigChallengeFsm,
};
use crate::lock::Locker;

use super::{pairing::CompleteReply, SessionControl, SessionState, SharedSession};

/// Cadence of stop re-checks while the session is draining.
const STOP_POLL: Duration = Duration::from_millis(25);

/// Everything needed to bring one session up.
pub struct SessionSetup<C, B> {
    /// Shared session state from the registry slot.
    pub shared: SharedSession,
    /// Effective configuration for this session.
    pub config: SessionConfig,
    /// The service identity.
    pub identity: Rc<ServiceIdentity>,
    /// Acceptable credentials, already filtered for the requested user
    /// unless the session allows any user.
    pub users: UserTable,
    /// The transport channel (not yet listening).
    pub channel: C,
    /// Transport for the beacon campaign.
    pub beacon_transport: B,
    /// Targets for the beacon campaign.
    pub beacon_targets: Vec<String>,
    /// Desktop-lock collaborator.
    pub locker: Rc<dyn Locker>,
    /// Display name embedded in the invitation.
    pub service_name: String,
}

impl<C: ByteChannel, B: BeaconTransport> SessionSetup<C, B> {
    /// Bring the session up: listen on the channel, build and sign the
    /// invitation, start the beacon campaign, prepare the engine.
    ///
    /// On return the invitation code is ready for the `StartAuth` reply;
    /// the caller then spawns [`SessionOrchestrator::run`].
    ///
    /// # Errors
    ///
    /// Fails if the session was already started or the channel cannot
    /// bind.
    pub async fn start(self) -> Result<SessionOrchestrator<C>, ChannelError> {
        let Self {
            shared,
            config,
            identity,
            users,
            mut channel,
            beacon_transport,
            beacon_targets,
            locker,
            service_name,
        } = self;

        {
            let mut state = shared.borrow_mut();
            if state.state != SessionState::Invalid {
                // A session that has been asked to stop (or has already
                // run) is never restarted.
                warn!(state = ?state.state, "refusing to start a used session");
                return Err(ChannelError::NotListening);
            }
            state.state = SessionState::Started;
            state.continuous = config.continuous;
            state.commitment = Some(identity.commitment());
        }

        let address = channel.listen().await?;
        info!(%address, "session channel listening");

        let invite = InvitePayload::sign(&identity, &service_name, &address).to_json();

        let mut campaign = BeaconCampaign::new();
        if config.beacons {
            campaign.start(invite.clone().into_bytes(), beacon_targets, beacon_transport);
        }

        let fsm = SigChallengeFsm::new(
            Rc::clone(&identity),
            users,
            config.continuous,
            Vec::new(),
        );

        let session_deadline = if config.timeout_seconds > 0.0 {
            info!(seconds = config.timeout_seconds, "session timeout set");
            Some(Instant::now() + Duration::from_secs_f64(config.timeout_seconds))
        } else {
            None
        };

        Ok(SessionOrchestrator {
            shared,
            config,
            channel,
            campaign,
            fsm,
            locker,
            invite,
            stop_requested: false,
            stopping: false,
            stopped: false,
            channel_dead: false,
            lock_issued: false,
            fsm_deadline: None,
            session_deadline,
        })
    }
}

/// One running session.
pub struct SessionOrchestrator<C> {
    shared: SharedSession,
    config: SessionConfig,
    channel: C,
    campaign: BeaconCampaign,
    fsm: SigChallengeFsm,
    locker: Rc<dyn Locker>,
    invite: String,
    stop_requested: bool,
    stopping: bool,
    stopped: bool,
    channel_dead: bool,
    lock_issued: bool,
    fsm_deadline: Option<Instant>,
    session_deadline: Option<Instant>,
}

impl<C: ByteChannel> SessionOrchestrator<C> {
    /// The serialized invitation payload (QR text / beacon body).
    #[must_use]
    pub fn invite(&self) -> &str {
        &self.invite
    }

    /// Drive the session to completion.
    pub async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<SessionControl>) {
        self.dispatch(|fsm, driver| fsm.start(driver)).await;
        let mut beacons_finished = self.campaign.finished();

        while !self.stopped {
            tokio::select! {
                event = self.channel.next_event() => {
                    match event {
                        Some(event) => self.on_channel_event(event).await,
                        None => {
                            // The transport driver died under us; there is
                            // nothing left to drain on the channel side.
                            warn!("channel event stream ended");
                            self.channel_dead = true;
                            self.stop_requested = true;
                        }
                    }
                }

                control = control_rx.recv() => {
                    self.on_control(control);
                }

                () = tokio::time::sleep_until(
                    self.fsm_deadline.unwrap_or_else(Instant::now)
                ), if self.fsm_deadline.is_some() => {
                    self.fsm_deadline = None;
                    self.dispatch(|fsm, driver| fsm.timeout(driver)).await;
                }

                () = tokio::time::sleep_until(
                    self.session_deadline.unwrap_or_else(Instant::now)
                ), if self.session_deadline.is_some() => {
                    self.session_deadline = None;
                    debug!("configured time limit reached");
                    self.stop_requested = true;
                }

                _ = beacons_finished.changed(), if !self.campaign.is_done() => {
                    debug!("beacon campaign finished");
                }

                () = tokio::time::sleep(STOP_POLL), if self.stopping => {}
            }

            if self.stop_requested {
                self.perform_stop().await;
            }
            self.stop_check();
        }

        info!(handle = self.shared.borrow().handle, "session fully stopped");
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                debug!("phone connected");
                // The overall timeout guards the wait for a phone; once
                // one arrives, the engine's own timeouts take over.
                self.session_deadline = None;
                if !self.stopping {
                    self.campaign.stop();
                }
                self.dispatch(|fsm, driver| fsm.connected(driver)).await;
            }
            ChannelEvent::Incoming(frame) => {
                self.dispatch(move |fsm, driver| fsm.read(driver, &frame))
                    .await;
            }
            ChannelEvent::SendComplete => {}
            ChannelEvent::Disconnected => {
                self.dispatch(|fsm, driver| fsm.disconnected(driver)).await;
            }
            ChannelEvent::Timeout => {
                self.dispatch(|fsm, driver| fsm.timeout(driver)).await;
            }
            ChannelEvent::Error(TransportErrorKind::Transient) => {
                debug!("transient transport error, adapter is retrying");
            }
            ChannelEvent::Error(TransportErrorKind::Fatal) => {
                warn!("fatal transport error");
                self.stop_requested = true;
            }
        }
    }

    fn on_control(&mut self, control: Option<SessionControl>) {
        match control {
            Some(SessionControl::Stop) | None => self.stop_requested = true,
            Some(SessionControl::OwnerLost) => {
                let state = self.shared.borrow().state;
                if state < SessionState::Completed {
                    info!("owner lost, stopping session");
                    self.stop_requested = true;
                }
            }
        }
    }

    async fn dispatch(&mut self, f: impl FnOnce(&mut SigChallengeFsm, &mut dyn HandshakeDriver)) {
        let mut sink = ActionSink::default();
        f(&mut self.fsm, &mut sink);
        self.apply(sink.actions).await;
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Write(frame) => match self.channel.send(Bytes::from(frame)) {
                    Ok(()) => {}
                    Err(ChannelError::Busy(reason)) => {
                        // Overlapping operation: drop it, the engine's
                        // timeout will notice if it mattered.
                        warn!(reason, "write dropped, channel busy");
                    }
                    Err(err) => warn!(%err, "write failed"),
                },
                Action::SetTimeout(after) => {
                    // A new timeout always replaces the previous one.
                    self.fsm_deadline = Some(Instant::now() + after);
                }
                Action::Listen => {
                    if !self.stopping {
                        if let Err(err) = self.channel.listen().await {
                            warn!(%err, "failed to resume listening");
                            self.stop_requested = true;
                        }
                    }
                }
                Action::Disconnect => self.channel.disconnect(),
                Action::Authenticated(outcome) => self.on_authenticated(outcome),
                Action::Fail => self.on_session_over(true),
                Action::SessionEnded => self.on_session_over(false),
                Action::Status(state) => debug!(?state, "handshake state update"),
            }
        }
    }

    fn on_authenticated(&mut self, outcome: AuthOutcome) {
        if outcome.is_success() {
            let username = self
                .fsm
                .authenticated_user()
                .unwrap_or_default()
                .to_owned();
            let token = self.unseal_token();
            {
                let mut shared = self.shared.borrow_mut();
                shared.success = true;
                shared.state = SessionState::Completed;
                if !username.is_empty() {
                    shared.username = username.clone();
                }
                shared
                    .complete_reply
                    .resolve(CompleteReply::success(username, token));
            }

            if outcome == AuthOutcome::AcceptedContinue {
                info!("moving to continuous authentication");
                self.shared.borrow_mut().state = SessionState::Continuing;
            } else {
                debug!("authentication complete, requesting stop");
                self.stop_requested = true;
            }
        } else {
            {
                let mut shared = self.shared.borrow_mut();
                shared.success = false;
                shared.state = SessionState::Completed;
                shared.complete_reply.resolve(CompleteReply::failure());
            }
            debug!("authentication failed, requesting stop");
            self.stop_requested = true;
        }
    }

    /// The engine reported the session over without a (new) verdict:
    /// either an error mid-handshake or the end of a continuous session.
    fn on_session_over(&mut self, failed: bool) {
        if failed {
            debug!("handshake error");
        } else {
            debug!("handshake session ended");
        }

        let (succeeded, username) = {
            let mut shared = self.shared.borrow_mut();
            shared.complete_reply.resolve_failure_if_pending();
            (shared.success, shared.username.clone())
        };

        // A session that had authenticated and then lost its phone leaves
        // the desktop locked behind it.
        if succeeded && !self.lock_issued {
            self.lock_issued = true;
            self.locker.lock(&username);
        }

        self.stop_requested = true;
    }

    /// Ask every part of the session to drain. Idempotent; a stop while
    /// already stopping is ignored.
    async fn perform_stop(&mut self) {
        self.stop_requested = false;
        if self.stopping {
            return;
        }
        debug!("requesting session stop");
        self.stopping = true;

        self.dispatch(|fsm, driver| fsm.stop(driver)).await;
        self.campaign.stop();
        self.channel.cancel_pending_reads();
        self.fsm_deadline = None;
        self.session_deadline = None;
    }

    /// The session is fully stopped once nothing is reading, nothing is
    /// writing, no connection is open and the beacon campaign has drained.
    fn stop_check(&mut self) {
        if !self.stopping || self.stopped {
            return;
        }
        if !self.channel_dead {
            if self.channel.is_reading() || self.channel.is_writing() {
                debug!("stopping, but still transferring");
                return;
            }
            if self.channel.open_connections() != 0 {
                debug!("stopping, but connections still open");
                return;
            }
        }
        if !self.campaign.is_done() {
            debug!("stopping, but still advertising");
            return;
        }
        self.finalize();
    }

    fn finalize(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let (continuous_success, username) = {
            let shared = self.shared.borrow();
            (
                self.config.continuous && shared.success,
                shared.username.clone(),
            )
        };

        // A continuous session that ends for any reason — contact lost,
        // superseded by a newer session, owner gone — locks the desktop it
        // was keeping open.
        if continuous_success && !self.lock_issued {
            self.lock_issued = true;
            self.locker.lock(&username);
        }

        let mut shared = self.shared.borrow_mut();
        shared.complete_reply.resolve_failure_if_pending();
        shared.state = SessionState::Harvestable;
    }

    fn unseal_token(&self) -> String {
        let extra = self.fsm.received_extra_data();
        if extra.is_empty() {
            return String::new();
        }
        let Some(key) = self.fsm.symmetric_key() else {
            return String::new();
        };
        match token::unseal(key, extra) {
            Ok(token) => token,
            Err(err) => {
                // Not fatal: the authentication stands, the caller just
                // gets no token.
                warn!(%err, "failed to extract encrypted token sent by phone");
                String::new()
            }
        }
    }
}

#[derive(Default)]
struct ActionSink {
    actions: Vec<Action>,
}

enum Action {
    Write(Vec<u8>),
    SetTimeout(Duration),
    Fail,
    Listen,
    Disconnect,
    Authenticated(AuthOutcome),
    SessionEnded,
    Status(HandshakeState),
}

impl HandshakeDriver for ActionSink {
    fn write(&mut self, frame: &[u8]) {
        self.actions.push(Action::Write(frame.to_vec()));
    }

    fn set_timeout(&mut self, after: Duration) {
        self.actions.push(Action::SetTimeout(after));
    }

    fn on_error(&mut self) {
        self.actions.push(Action::Fail);
    }

    fn on_listen(&mut self) {
        self.actions.push(Action::Listen);
    }

    fn on_disconnect(&mut self) {
        self.actions.push(Action::Disconnect);
    }

    fn on_authenticated(&mut self, outcome: AuthOutcome) {
        self.actions.push(Action::Authenticated(outcome));
    }

    fn on_session_ended(&mut self) {
        self.actions.push(Action::SessionEnded);
    }

    fn on_status_updated(&mut self, state: HandshakeState) {
        self.actions.push(Action::Status(state));
    }
}
