//! Rendezvous-point channel adapter.
//!
//! The rendezvous point is a dumb HTTP relay: both sides agree on a random
//! channel URL, writes are POSTs of a length-prefixed frame, reads are
//! long-polling GETs. The relay signals its own conditions (poll timeout,
//! channel keepalive) with a JSON body, so a GET response that begins with
//! `{` is never a frame — it just means "poll again".
//!
//! Two failure regimes apply to the poll loop:
//!
//! - transient transport errors restart the in-flight read immediately,
//! - connection failures arm exactly one retry, one second out; concurrent
//!   retries are forbidden.
//!
//! On top of that sits a *wall-clock* watchdog. Monotonic timers freeze
//! while the host is suspended, but the relay forgets channels in
//! wall-clock time — after a long suspend the local poll would happily keep
//! waiting on a connection the relay no longer remembers. The watchdog
//! samples the wall clock once a second and cancels any request older than
//! its budget; a cancelled read is restarted at once.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use rand::RngCore;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::framing::frame;

use super::{ByteChannel, ChannelError, ChannelEvent, TransportErrorKind};

/// Number of random bytes in a channel name; the URL carries their hex.
pub const CHANNEL_NAME_BYTES: usize = 16;

/// Default wall-clock budget for one in-flight request.
pub const DEFAULT_WALL_TIMEOUT_SECS: i64 = 45;

/// Delay before the single reconnect retry.
const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Transport-level timeout on individual HTTP requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct RvpShared {
    reading: bool,
    writing: bool,
    connected: bool,
    connections: usize,
}

enum RvpCmd {
    StartRead,
    Send(Bytes),
    Disconnect,
    CancelReads,
}

/// Byte channel over a rendezvous-point URL.
pub struct RvpChannel {
    url_prefix: String,
    url: Option<String>,
    wall_timeout: TimeDelta,
    shared: Rc<RefCell<RvpShared>>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    cmd_tx: Option<mpsc::UnboundedSender<RvpCmd>>,
}

impl RvpChannel {
    /// Channel against the given URL prefix (must end with `/`).
    #[must_use]
    pub fn new(url_prefix: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            url_prefix: url_prefix.into(),
            url: None,
            wall_timeout: TimeDelta::seconds(DEFAULT_WALL_TIMEOUT_SECS),
            shared: Rc::new(RefCell::new(RvpShared::default())),
            events_rx,
            events_tx,
            cmd_tx: None,
        }
    }

    /// Override the wall-clock watchdog budget.
    #[must_use]
    pub fn with_wall_timeout(mut self, timeout: TimeDelta) -> Self {
        self.wall_timeout = timeout;
        self
    }
}

impl ByteChannel for RvpChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        if let Some(url) = &self.url {
            if let Some(cmd_tx) = &self.cmd_tx {
                let _ = cmd_tx.send(RvpCmd::StartRead);
            }
            return Ok(url.clone());
        }

        let mut random = [0u8; CHANNEL_NAME_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut random);
        let url = format!("{}{}", self.url_prefix, hex::encode(random));
        debug!(%url, "rendezvous channel allocated");

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ChannelError::BindFailed(err.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            client,
            url: url.clone(),
            wall_timeout: self.wall_timeout,
            shared: Rc::clone(&self.shared),
            events_tx: self.events_tx.clone(),
        };
        tokio::task::spawn_local(driver.run(cmd_rx));

        let _ = cmd_tx.send(RvpCmd::StartRead);
        self.cmd_tx = Some(cmd_tx);
        self.url = Some(url.clone());
        Ok(url)
    }

    fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        let Some(cmd_tx) = &self.cmd_tx else {
            return Err(ChannelError::NotListening);
        };
        {
            let shared = self.shared.borrow();
            if shared.reading || shared.writing {
                return Err(ChannelError::Busy(
                    "cannot send while a read or write is ongoing",
                ));
            }
        }
        let _ = cmd_tx.send(RvpCmd::Send(payload));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(cmd_tx) = &self.cmd_tx {
            let _ = cmd_tx.send(RvpCmd::Disconnect);
        }
    }

    fn cancel_pending_reads(&mut self) {
        if let Some(cmd_tx) = &self.cmd_tx {
            let _ = cmd_tx.send(RvpCmd::CancelReads);
        }
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events_rx.recv().await
    }

    fn is_reading(&self) -> bool {
        self.shared.borrow().reading
    }

    fn is_writing(&self) -> bool {
        self.shared.borrow().writing
    }

    fn open_connections(&self) -> usize {
        self.shared.borrow().connections
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
    Read,
    Write,
}

type HttpResult = Result<(StatusCode, Bytes), reqwest::Error>;
type InFlight = (Op, LocalBoxFuture<'static, HttpResult>);

struct Driver {
    client: reqwest::Client,
    url: String,
    wall_timeout: TimeDelta,
    shared: Rc<RefCell<RvpShared>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl Driver {
    #[allow(clippy::too_many_lines)]
    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<RvpCmd>) {
        let mut inflight: Option<InFlight> = None;
        let mut wall_start: Option<DateTime<Utc>> = None;
        let mut retry: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RvpCmd::StartRead) => {
                            self.start_get(&mut inflight, &mut wall_start);
                        }
                        Some(RvpCmd::Send(payload)) => {
                            self.start_post(payload, &mut inflight, &mut wall_start);
                        }
                        Some(RvpCmd::CancelReads) => {
                            self.cancel_read(&mut inflight, &mut wall_start);
                        }
                        Some(RvpCmd::Disconnect) => {
                            self.cancel_read(&mut inflight, &mut wall_start);
                            let disconnected = {
                                let mut shared = self.shared.borrow_mut();
                                let was = shared.connected;
                                shared.connected = false;
                                was
                            };
                            if disconnected {
                                self.emit(ChannelEvent::Disconnected);
                            }
                        }
                        None => break, // channel handle dropped
                    }
                }

                result = async { inflight.as_mut().expect("guarded").1.as_mut().await },
                        if inflight.is_some() => {
                    let (op, _) = inflight.take().expect("just polled");
                    wall_start = None;
                    match op {
                        Op::Read => self.read_complete(
                            result,
                            &mut inflight,
                            &mut wall_start,
                            &mut retry,
                        ),
                        Op::Write => self.write_complete(
                            result,
                            &mut inflight,
                            &mut wall_start,
                        ),
                    }
                }

                () = async { retry.as_mut().expect("guarded").as_mut().await },
                        if retry.is_some() => {
                    retry = None;
                    if inflight.is_none() {
                        debug!("retrying rendezvous connection");
                        self.start_get(&mut inflight, &mut wall_start);
                    } else {
                        // A replacement request is already in flight; let
                        // the retry lapse.
                        debug!("dropping rendezvous retry, request already in flight");
                    }
                }

                _ = tick.tick() => {
                    let expired = wall_start
                        .is_some_and(|started| Utc::now() - started >= self.wall_timeout);
                    if expired {
                        let (op, _) = inflight.take().expect("wall clock runs with a request");
                        wall_start = None;
                        warn!("wall clock timeout, cancelling rendezvous request");
                        match op {
                            Op::Read => {
                                {
                                    let mut shared = self.shared.borrow_mut();
                                    shared.reading = false;
                                    shared.connections -= 1;
                                }
                                // The old poll is already dead on the relay
                                // side; start a fresh one at once.
                                self.start_get(&mut inflight, &mut wall_start);
                            }
                            Op::Write => {
                                {
                                    let mut shared = self.shared.borrow_mut();
                                    shared.writing = false;
                                    shared.connections -= 1;
                                }
                                self.emit(ChannelEvent::Error(TransportErrorKind::Fatal));
                            }
                        }
                    }
                }
            }
        }
    }

    fn start_get(&self, inflight: &mut Option<InFlight>, wall_start: &mut Option<DateTime<Utc>>) {
        {
            let mut shared = self.shared.borrow_mut();
            if shared.reading || shared.writing {
                warn!("cannot receive while a read or write is ongoing");
                return;
            }
            shared.reading = true;
            shared.connections += 1;
        }

        let request = self.client.get(self.url.as_str()).send();
        let future = async move {
            let response = request.await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok((status, body))
        }
        .boxed_local();

        *inflight = Some((Op::Read, future));
        *wall_start = Some(Utc::now());
    }

    fn start_post(
        &self,
        payload: Bytes,
        inflight: &mut Option<InFlight>,
        wall_start: &mut Option<DateTime<Utc>>,
    ) {
        {
            let mut shared = self.shared.borrow_mut();
            if shared.reading || shared.writing {
                warn!("cannot send while a read or write is ongoing");
                return;
            }
            shared.writing = true;
            shared.connections += 1;
        }

        debug!(len = payload.len(), "posting frame to rendezvous");
        let request = self
            .client
            .post(self.url.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(frame(&payload))
            .send();
        let future = async move {
            let response = request.await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok((status, body))
        }
        .boxed_local();

        *inflight = Some((Op::Write, future));
        *wall_start = Some(Utc::now());
    }

    fn cancel_read(
        &self,
        inflight: &mut Option<InFlight>,
        wall_start: &mut Option<DateTime<Utc>>,
    ) {
        if matches!(inflight, Some((Op::Read, _))) {
            debug!("cancelling rendezvous read");
            *inflight = None;
            *wall_start = None;
            let mut shared = self.shared.borrow_mut();
            shared.reading = false;
            shared.connections -= 1;
            shared.connected = false;
        }
    }

    fn read_complete(
        &self,
        result: HttpResult,
        inflight: &mut Option<InFlight>,
        wall_start: &mut Option<DateTime<Utc>>,
        retry: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>,
    ) {
        {
            let mut shared = self.shared.borrow_mut();
            shared.reading = false;
            shared.connections -= 1;
        }

        match result {
            Ok((status, body)) if status.is_success() => {
                if body.len() > 4 {
                    if body[0] == b'{' {
                        // Relay-level keepalive or poll timeout; never a
                        // frame.
                        debug!("rendezvous keepalive, restarting poll");
                        self.start_get(inflight, wall_start);
                    } else {
                        let newly_connected = {
                            let mut shared = self.shared.borrow_mut();
                            let newly = !shared.connected;
                            shared.connected = true;
                            newly
                        };
                        if newly_connected {
                            self.emit(ChannelEvent::Connected);
                        }
                        debug!(len = body.len(), "rendezvous frame received");
                        self.emit(ChannelEvent::Incoming(body.slice(4..)));
                    }
                } else {
                    debug!("rendezvous response too short, restarting poll");
                    self.start_get(inflight, wall_start);
                }
            }
            Ok((status, _)) => {
                warn!(%status, "rendezvous poll rejected");
                self.arm_retry(retry);
            }
            Err(err) if is_transient(&err) => {
                // This request *is* the currently-scheduled read, so
                // restart it immediately. (A cancelled read whose
                // replacement is already in flight never reaches here: its
                // future was dropped.)
                warn!(%err, "transient error on read, retrying");
                self.start_get(inflight, wall_start);
            }
            Err(err) => {
                warn!(%err, "connection failure on read");
                self.arm_retry(retry);
            }
        }
    }

    fn write_complete(
        &self,
        result: HttpResult,
        inflight: &mut Option<InFlight>,
        wall_start: &mut Option<DateTime<Utc>>,
    ) {
        {
            let mut shared = self.shared.borrow_mut();
            shared.writing = false;
            shared.connections -= 1;
        }

        match result {
            Ok((status, _)) if status.is_success() => {
                self.emit(ChannelEvent::SendComplete);
                if self.shared.borrow().connected {
                    self.start_get(inflight, wall_start);
                } else {
                    warn!("write completed while not connected");
                }
            }
            Ok((status, _)) => {
                warn!(%status, "rendezvous write rejected");
                self.emit(ChannelEvent::Error(TransportErrorKind::Fatal));
            }
            Err(err) => {
                warn!(%err, "connection failure on write");
                self.emit(ChannelEvent::Error(TransportErrorKind::Fatal));
            }
        }
    }

    fn arm_retry(&self, retry: &mut Option<std::pin::Pin<Box<tokio::time::Sleep>>>) {
        if retry.is_none() {
            debug!("connection failure, retrying in {RETRY_DELAY:?}");
            *retry = Some(Box::pin(tokio::time::sleep_until(
                Instant::now() + RETRY_DELAY,
            )));
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Errors worth an immediate restart of the same request, as opposed to
/// connection-level failures that get the single delayed retry.
fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_body() || err.is_decode()
}
