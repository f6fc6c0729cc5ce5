//! The service loop.
//!
//! A single-threaded reactor that owns the session registry and processes
//! the daemon's external operations: `StartAuth`, `CompleteAuth`, `Exit`,
//! plus the `OwnerLost` signal from the IPC layer. Nothing here blocks
//! beyond a bounded syscall; everything long-running — handshakes, polls,
//! beacon campaigns — lives in per-session tasks spawned on the same local
//! task set.
//!
//! `StartAuth` is answered synchronously, once the channel is bound and
//! the invitation signed but before any handshake runs. `CompleteAuth` may
//! arrive before or after the handshake resolves; the session's reply slot
//! pairs call and result whichever lands first, which also guarantees that
//! a session's `StartAuth` reply is emitted before its `CompleteAuth`
//! reply.

use std::rc::Rc;

use keyfob_core::beacon::load_targets;
use keyfob_core::config::{SessionConfig, TARGETS_FILE, USERS_FILE};
use keyfob_core::identity::ServiceIdentity;
use keyfob_core::users::UserTable;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::beacons::BeaconTransport;
use crate::channel::{ChannelFactory, ChannelParams};
use crate::lock::Locker;
use crate::session::orchestrator::SessionSetup;
use crate::session::pairing::{CompleteReply, StartReply};
use crate::session::registry::SessionRegistry;
use crate::session::{SessionControl, SessionState, SharedSession};

/// How long `Exit` waits for live sessions to drain.
const DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// Operations and signals the loop accepts.
pub enum ServiceCommand {
    /// Set up a new authentication session.
    StartAuth {
        /// Requested username; empty with `any_user`.
        username: String,
        /// Caller configuration overlay, a JSON dictionary.
        parameters: String,
        /// Identity of the calling client.
        owner: Option<String>,
        /// Where the synchronous reply goes.
        reply: oneshot::Sender<StartReply>,
    },
    /// Collect the result of a session; answered when the session has one.
    CompleteAuth {
        /// Handle returned by `StartAuth`.
        handle: i32,
        /// Identity of the calling client.
        owner: Option<String>,
        /// Where the (possibly deferred) reply goes.
        reply: oneshot::Sender<CompleteReply>,
    },
    /// A client identity disappeared; cancel its unfinished sessions.
    OwnerLost {
        /// The identity that went away.
        owner: String,
    },
    /// Shut the daemon down.
    Exit,
}

/// The daemon's central reactor.
pub struct ServiceLoop<F, B> {
    registry: SessionRegistry,
    factory: F,
    beacon_transport: B,
    locker: Rc<dyn Locker>,
    config_dir: Option<String>,
    service_name: String,
}

impl<F: ChannelFactory, B: BeaconTransport> ServiceLoop<F, B> {
    /// Build the loop.
    ///
    /// `config_dir`, when set, overrides the built-in default configuration
    /// directory (callers may still override it per session).
    pub fn new(
        factory: F,
        beacon_transport: B,
        locker: Rc<dyn Locker>,
        config_dir: Option<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            factory,
            beacon_transport,
            locker,
            config_dir,
            service_name: service_name.into(),
        }
    }

    /// Process commands until `Exit` (or the command channel closes), then
    /// drain live sessions.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ServiceCommand>) {
        info!("service loop running");
        while let Some(command) = commands.recv().await {
            match command {
                ServiceCommand::StartAuth {
                    username,
                    parameters,
                    owner,
                    reply,
                } => {
                    self.start_auth(username, &parameters, owner, reply).await;
                }
                ServiceCommand::CompleteAuth {
                    handle,
                    owner,
                    reply,
                } => {
                    self.complete_auth(handle, owner, reply);
                }
                ServiceCommand::OwnerLost { owner } => {
                    self.registry.owner_lost(&owner);
                }
                ServiceCommand::Exit => {
                    info!("exit requested");
                    break;
                }
            }
        }
        self.drain().await;
    }

    async fn start_auth(
        &mut self,
        username: String,
        parameters: &str,
        owner: Option<String>,
        reply: oneshot::Sender<StartReply>,
    ) {
        info!(%username, "start auth");

        let Some((handle, shared, control_rx)) = self.registry.allocate() else {
            let _ = reply.send(StartReply::failure(-1));
            return;
        };

        // Layer the configuration: defaults, then the config file (which
        // can never set any_user), then the caller's parameters. A
        // malformed layer is logged and skipped, not fatal.
        let mut config = SessionConfig::default();
        if let Some(dir) = &self.config_dir {
            config.config_dir.clone_from(dir);
        }
        if let Err(err) = config.load_dir() {
            warn!(%err, "config file failed to load or was badly formatted");
        }
        if let Err(err) = config.overlay_caller(parameters) {
            warn!(%err, "caller parameters rejected");
        }

        {
            let mut session = shared.borrow_mut();
            session.username.clone_from(&username);
            session.owner = owner;
        }

        let identity = match ServiceIdentity::load(&config.config_dir) {
            Ok(identity) => Rc::new(identity),
            Err(err) => {
                warn!(%err, "failed to load service identity");
                Self::fail_session(&shared, handle, reply);
                return;
            }
        };

        let users = match UserTable::load(format!("{}{USERS_FILE}", config.config_dir)) {
            Ok(users) => users,
            Err(err) => {
                warn!(%err, "failed to load user file");
                UserTable::new()
            }
        };

        let users = if config.any_user {
            info!("authenticating for any user");
            users
        } else {
            info!(%username, "authenticating for a specific user");
            let filtered = users.filter_by_name(&username);
            info!(records = filtered.len(), "filtered the user file");
            if filtered.is_empty() {
                // An empty table would read as "any user"; bail before the
                // handshake can ever run.
                warn!("filtered list of users is empty");
                Self::fail_session(&shared, handle, reply);
                return;
            }
            filtered
        };

        let beacon_targets = if config.beacons {
            match load_targets(format!("{}{TARGETS_FILE}", config.config_dir)) {
                Ok(targets) => targets,
                Err(err) => {
                    warn!(%err, "failed to load beacon targets");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let params = ChannelParams::from_config(&config, identity.commitment());
        let channel = self.factory.create(config.channel_type, &params);

        let setup = SessionSetup {
            shared: SharedSession::clone(&shared),
            config,
            identity,
            users,
            channel,
            beacon_transport: self.beacon_transport.clone(),
            beacon_targets,
            locker: Rc::clone(&self.locker),
            service_name: self.service_name.clone(),
        };

        match setup.start().await {
            Ok(orchestrator) => {
                let _ = reply.send(StartReply {
                    handle,
                    code: orchestrator.invite().to_owned(),
                    success: true,
                });
                tokio::task::spawn_local(orchestrator.run(control_rx));
                info!(handle, "started authentication");

                // A fresh session supersedes any lingering continuous one
                // against the same service and user.
                self.registry.stop_similar(handle);
            }
            Err(err) => {
                warn!(%err, "failed to set up session");
                Self::fail_session(&shared, handle, reply);
            }
        }
    }

    fn complete_auth(
        &mut self,
        handle: i32,
        owner: Option<String>,
        reply: oneshot::Sender<CompleteReply>,
    ) {
        info!(handle, "complete auth");

        if handle < 0 {
            let _ = reply.send(CompleteReply::failure());
            return;
        }
        let Some(slot) = self.registry.get(handle) else {
            warn!(handle, "complete auth for an unknown handle");
            let _ = reply.send(CompleteReply::failure());
            return;
        };

        let mut session = slot.shared.borrow_mut();
        if owner.is_some() {
            session.owner = owner;
        }
        // The slot answers now if the session already has its result, or
        // parks the caller until it does.
        session.complete_reply.bind(reply);
    }

    /// Mark a session failed before its orchestrator ever ran.
    fn fail_session(shared: &SharedSession, handle: i32, reply: oneshot::Sender<StartReply>) {
        {
            let mut session = shared.borrow_mut();
            session.success = false;
            session.complete_reply.resolve_failure_if_pending();
            session.state = SessionState::Harvestable;
        }
        let _ = reply.send(StartReply::failure(handle));
    }

    /// Stop every live session and wait (bounded) for them to wind down.
    async fn drain(&mut self) {
        info!(live = self.registry.live_count(), "draining sessions");
        for slot in self.registry.iter_live() {
            slot.send(SessionControl::Stop);
        }

        let deadline = Instant::now() + DRAIN_BUDGET;
        loop {
            self.registry.harvest();
            if self.registry.live_count() == 0 {
                info!("all sessions drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    live = self.registry.live_count(),
                    "sessions did not drain in time"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
