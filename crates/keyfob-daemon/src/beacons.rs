//! Beacon fan-out engine.
//!
//! A phone can discover an open session two ways: the user scans the
//! invitation as a QR code, or the invitation reaches the phone over the
//! air. This module implements the second path: one campaign pushes the
//! session's invitation payload to every configured target on a rolling
//! cadence until a phone connects or the session stops.
//!
//! Every target gets its own fully independent chain — locate the target's
//! service, connect a stream to it, write the payload, close. No barrier
//! synchronises the chains; a dead target never slows a live one. On
//! `stop()` a chain that is mid-send finishes its write, a chain that is
//! mid-locate drops immediately. The campaign reports finished exactly once,
//! after the last chain has wound down.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::framing::frame;

/// Gap between per-target delivery attempts.
pub const BEACON_GAP: Duration = Duration::from_secs(2);

/// Errors raised by a beacon transport.
#[derive(Debug, Error)]
pub enum BeaconSendError {
    /// The target's service could not be located.
    #[error("target unreachable: {0}")]
    Unreachable(String),

    /// Delivery failed after the target was located.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Delivers one payload to one target, in two steps.
///
/// `locate` resolves the target address to a connectable route; `deliver`
/// connects and writes. The split matters for cancellation: stopping a
/// campaign abandons in-flight locates but lets in-flight deliveries
/// finish.
#[allow(async_fn_in_trait)]
pub trait BeaconTransport: Clone + 'static {
    /// A located, connectable route to the target.
    type Route;

    /// Resolve the target's service.
    async fn locate(&self, target: &str) -> Result<Self::Route, BeaconSendError>;

    /// Connect to the located route, write the payload, close.
    async fn deliver(&self, route: Self::Route, payload: &[u8]) -> Result<(), BeaconSendError>;
}

/// Production transport: targets are socket addresses; delivery writes the
/// length-prefixed payload over a fresh stream connection and closes.
#[derive(Clone, Default)]
pub struct SocketBeaconTransport;

impl BeaconTransport for SocketBeaconTransport {
    type Route = std::net::SocketAddr;

    async fn locate(&self, target: &str) -> Result<Self::Route, BeaconSendError> {
        tokio::net::lookup_host(target)
            .await
            .map_err(|err| BeaconSendError::Unreachable(err.to_string()))?
            .next()
            .ok_or_else(|| BeaconSendError::Unreachable(format!("{target}: no addresses")))
    }

    async fn deliver(&self, route: Self::Route, payload: &[u8]) -> Result<(), BeaconSendError> {
        let mut stream = tokio::net::TcpStream::connect(route).await?;
        stream.write_all(&frame(payload)).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Lifecycle of a beacon campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignState {
    /// Never started.
    Invalid,
    /// Chains are running.
    Started,
    /// Stop requested; chains are draining.
    Completed,
    /// Every chain has finished; safe to reclaim.
    Harvestable,
}

struct CampaignShared {
    state: CampaignState,
    running: usize,
    finished_tx: watch::Sender<bool>,
}

impl CampaignShared {
    fn chain_finished(&mut self) {
        self.running -= 1;
        if self.running == 0 {
            info!("all beacon chains finished");
            self.state = CampaignState::Harvestable;
            let _ = self.finished_tx.send(true);
        }
    }
}

/// One campaign: one payload, many targets, independent chains.
pub struct BeaconCampaign {
    shared: Rc<RefCell<CampaignShared>>,
    stop_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

impl Default for BeaconCampaign {
    fn default() -> Self {
        Self::new()
    }
}

impl BeaconCampaign {
    /// A campaign that has not started.
    #[must_use]
    pub fn new() -> Self {
        let (finished_tx, finished_rx) = watch::channel(false);
        let (stop_tx, _) = watch::channel(false);
        Self {
            shared: Rc::new(RefCell::new(CampaignShared {
                state: CampaignState::Invalid,
                running: 0,
                finished_tx,
            })),
            stop_tx,
            finished_rx,
        }
    }

    /// Start broadcasting `payload` to `targets`.
    ///
    /// Spawns one chain per target on the local task set and returns
    /// immediately.
    pub fn start<T: BeaconTransport>(
        &mut self,
        payload: Vec<u8>,
        targets: Vec<String>,
        transport: T,
    ) {
        {
            let mut shared = self.shared.borrow_mut();
            if shared.state != CampaignState::Invalid {
                warn!("beacon campaign already started");
                return;
            }
            shared.state = CampaignState::Started;
            shared.running = targets.len();
        }
        info!(targets = targets.len(), "sending beacons");

        let payload = Rc::new(payload);
        for target in targets {
            tokio::task::spawn_local(run_chain(
                target,
                transport.clone(),
                Rc::clone(&payload),
                self.stop_tx.subscribe(),
                Rc::clone(&self.shared),
            ));
        }
    }

    /// Ask every chain to stop. Mid-send chains finish their write first.
    pub fn stop(&mut self) {
        let finish_now = {
            let mut shared = self.shared.borrow_mut();
            if !matches!(
                shared.state,
                CampaignState::Started | CampaignState::Completed
            ) {
                return;
            }
            debug!(running = shared.running, "stopping beacon campaign");
            shared.state = CampaignState::Completed;
            shared.running == 0
        };

        let _ = self.stop_tx.send(true);

        if finish_now {
            let mut shared = self.shared.borrow_mut();
            shared.state = CampaignState::Harvestable;
            let _ = shared.finished_tx.send(true);
        }
    }

    /// Current campaign state.
    #[must_use]
    pub fn state(&self) -> CampaignState {
        self.shared.borrow().state
    }

    /// Whether the campaign holds no more resources: it either never ran or
    /// has fully drained.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(
            self.state(),
            CampaignState::Invalid | CampaignState::Harvestable
        )
    }

    /// Watch that flips to `true` exactly once, when every chain has
    /// finished.
    #[must_use]
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.finished_rx.clone()
    }
}

async fn run_chain<T: BeaconTransport>(
    target: String,
    transport: T,
    payload: Rc<Vec<u8>>,
    mut stop_rx: watch::Receiver<bool>,
    shared: Rc<RefCell<CampaignShared>>,
) {
    let mut tick = tokio::time::interval(BEACON_GAP);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let mut stop_rx_inner = stop_rx.clone();
        tokio::select! {
            _ = tick.tick() => {
                // The locate step races the stop signal: an unreachable
                // target must not delay the campaign teardown.
                let located = tokio::select! {
                    route = transport.locate(&target) => route,
                    _ = stop_rx_inner.wait_for(|stop| *stop) => break,
                };

                match located {
                    Ok(route) => {
                        // Mid-send completes even if stop arrives now.
                        match transport.deliver(route, &payload).await {
                            Ok(()) => debug!(%target, "beacon delivered"),
                            Err(err) => debug!(%target, %err, "beacon delivery failed"),
                        }
                    }
                    Err(err) => debug!(%target, %err, "beacon target not located"),
                }

                if *stop_rx_inner.borrow() {
                    break;
                }
            }
            _ = stop_rx.wait_for(|stop| *stop) => break,
        }
    }

    shared.borrow_mut().chain_finished();
}
