//! Attribute-based radio channel adapter.
//!
//! The radio transport advertises a service UUID derived from the service
//! commitment; a phone that recognises the commitment connects and
//! exchanges frames through two attributes — one write-only attribute for
//! inbound data and one notify attribute for outbound data.
//!
//! Attribute writes are small, so frames travel as chunks. Inbound chunks
//! carry a 1-byte chunk index; the first chunk of a frame additionally
//! carries the big-endian remaining-length in bytes 1..5, with payload from
//! byte 5. Outbound frames are simply sliced into pieces of at most
//! [`MAX_SEND`] bytes and published in turn.
//!
//! The host's radio-management daemon sits behind the [`RadioStack`] trait.
//! Some of those daemons leak advertising state over time, so the adapter
//! periodically tears the whole stack down and brings it back up (the
//! *recycle*). Recycling is only started from quiet states; anything
//! mid-transition or mid-connection defers it to the next tick.

use std::collections::VecDeque;

use bytes::Bytes;
use keyfob_core::identity::Commitment;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::framing::frame;

use super::{ByteChannel, ChannelError, ChannelEvent};

/// Largest outbound chunk published as the notify attribute's value.
pub const MAX_SEND: usize = 128;

/// Seconds between recycle attempts.
const RECYCLE_SECS: u64 = 10;

/// Lifecycle of the advertising stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrState {
    /// Nothing initialised yet.
    Dormant,
    /// Stack bring-up requested, waiting for the ack.
    Initialising,
    /// Stack up, not yet advertising.
    Initialised,
    /// Advertising the one-shot service UUID.
    Advertising,
    /// Advertising the continuous-mode service UUID.
    AdvertisingContinuous,
    /// A phone is connected.
    Connected,
    /// Advert teardown requested, waiting for the ack.
    Unadvertising,
    /// Advert gone, stack still up.
    Unadvertised,
    /// Stack teardown requested, waiting for the ack.
    Finalising,
    /// Stack fully torn down.
    Finalised,
}

/// Events the radio stack reports back to the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// Stack bring-up finished.
    Initialised,
    /// The advert is live.
    Advertised,
    /// The advert has been removed.
    Unadvertised,
    /// Stack teardown finished.
    Finalised,
    /// A phone wrote a chunk to the incoming attribute.
    WriteReceived(Vec<u8>),
    /// The connected phone went away.
    Released,
}

/// Commands the adapter issues to the host radio daemon.
///
/// Completion is reported asynchronously through [`StackEvent`]s; the
/// adapter never blocks on the radio.
pub trait RadioStack {
    /// Bring the stack up. Acked by [`StackEvent::Initialised`].
    fn initialise(&mut self);
    /// Start advertising the given service UUID. Acked by
    /// [`StackEvent::Advertised`].
    fn advertise(&mut self, uuid: &str);
    /// Remove the advert. Acked by [`StackEvent::Unadvertised`].
    fn unadvertise(&mut self);
    /// Publish one outbound chunk as the notify attribute's value.
    fn publish(&mut self, chunk: &[u8]);
    /// Tear the stack down. Acked by [`StackEvent::Finalised`].
    fn finalise(&mut self);
}

/// Opens a radio stack for one session.
pub trait RadioProvider {
    /// Create a stack plus the stream of its events.
    fn open(&self) -> (Box<dyn RadioStack>, mpsc::UnboundedReceiver<StackEvent>);
}

/// Derive the advertised service UUID from the service commitment.
///
/// Uses the trailing sixteen digest bytes, grouped 4-2-2-2-6. The last
/// byte's low bit flags continuous mode, letting a phone pick the right
/// session kind before connecting.
#[must_use]
pub fn service_uuid(commitment: &Commitment, continuous: bool) -> String {
    let digest = commitment.as_bytes();
    let mut tail: [u8; 16] = digest[16..32].try_into().expect("digest is 32 bytes");
    if continuous {
        tail[15] |= 0x01;
    } else {
        tail[15] &= 0xFE;
    }

    format!(
        "{}-{}-{}-{}-{}",
        hex::encode_upper(&tail[0..4]),
        hex::encode_upper(&tail[4..6]),
        hex::encode_upper(&tail[6..8]),
        hex::encode_upper(&tail[8..10]),
        hex::encode_upper(&tail[10..16]),
    )
}

/// Byte channel over an attribute-based radio session.
pub struct AttrChannel {
    stack: Box<dyn RadioStack>,
    stack_events: mpsc::UnboundedReceiver<StackEvent>,
    state: AttrState,
    uuid: String,
    continuous: bool,
    bound: bool,
    connected: bool,
    reads_enabled: bool,
    cycling: bool,
    teardown: bool,
    remaining: usize,
    reassembly: Vec<u8>,
    pending: VecDeque<ChannelEvent>,
    recycle: tokio::time::Interval,
}

impl AttrChannel {
    /// Adapter over the given stack, advertising for `commitment`.
    #[must_use]
    pub fn new(
        stack: Box<dyn RadioStack>,
        stack_events: mpsc::UnboundedReceiver<StackEvent>,
        commitment: Commitment,
        continuous: bool,
    ) -> Self {
        let period = Duration::from_secs(RECYCLE_SECS);
        let mut recycle = tokio::time::interval_at(Instant::now() + period, period);
        recycle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        Self {
            stack,
            stack_events,
            state: AttrState::Dormant,
            uuid: service_uuid(&commitment, continuous),
            continuous,
            bound: false,
            connected: false,
            reads_enabled: false,
            cycling: false,
            teardown: false,
            remaining: 0,
            reassembly: Vec::new(),
            pending: VecDeque::new(),
            recycle,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AttrState {
        self.state
    }

    fn advertising_state(&self) -> AttrState {
        if self.continuous {
            AttrState::AdvertisingContinuous
        } else {
            AttrState::Advertising
        }
    }

    fn handle_stack_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::Initialised => {
                self.state = AttrState::Initialised;
                if self.teardown {
                    self.stack.finalise();
                    self.state = AttrState::Finalising;
                } else {
                    self.stack.advertise(&self.uuid);
                }
            }
            StackEvent::Advertised => {
                self.state = self.advertising_state();
            }
            StackEvent::WriteReceived(data) => {
                if !self.reads_enabled {
                    debug!("dropping attribute write, reads cancelled");
                    return;
                }
                if !self.connected {
                    self.connected = true;
                    self.state = AttrState::Connected;
                    self.pending.push_back(ChannelEvent::Connected);
                }
                self.reassemble(&data);
            }
            StackEvent::Released => {
                if self.connected {
                    self.connected = false;
                    self.pending.push_back(ChannelEvent::Disconnected);
                    if !self.teardown {
                        // The radio resumes advertising on its own once
                        // the peer drops.
                        self.state = self.advertising_state();
                    }
                }
                self.remaining = 0;
                self.reassembly.clear();
            }
            StackEvent::Unadvertised => {
                self.state = AttrState::Unadvertised;
                if self.cycling || self.teardown {
                    self.stack.finalise();
                    self.state = AttrState::Finalising;
                }
            }
            StackEvent::Finalised => {
                self.state = AttrState::Finalised;
                if self.cycling {
                    self.cycling = false;
                    self.stack.initialise();
                    self.state = AttrState::Initialising;
                }
            }
        }
    }

    fn on_recycle_tick(&mut self) {
        match self.state {
            // Quiet states: recycle now.
            AttrState::Advertising => {
                debug!("recycling advertising stack");
                self.cycling = true;
                self.stack.unadvertise();
                self.state = AttrState::Unadvertising;
            }
            AttrState::Initialised | AttrState::Unadvertised => {
                debug!("recycling advertising stack");
                self.cycling = true;
                self.stack.finalise();
                self.state = AttrState::Finalising;
            }
            // Mid-transition or mid-connection: defer to the next tick.
            AttrState::Initialising
            | AttrState::Unadvertising
            | AttrState::Finalising
            | AttrState::Connected
            | AttrState::AdvertisingContinuous => {}
            // Nothing to recycle.
            AttrState::Dormant | AttrState::Finalised => {}
        }
    }

    fn reassemble(&mut self, chunk: &[u8]) {
        if self.remaining == 0 && chunk.len() > 5 {
            // Frame header chunk: index byte, 4-byte remaining length,
            // payload.
            self.reassembly.clear();
            let declared = u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]) as usize;
            let payload = &chunk[5..];
            if payload.len() > declared {
                warn!(
                    received = payload.len(),
                    declared, "received more bytes than declared"
                );
                return;
            }
            debug!(declared, "receiving frame");
            self.reassembly.extend_from_slice(payload);
            self.remaining = declared - payload.len();
        } else if self.remaining > 0 && chunk.len() > 1 {
            let payload = &chunk[1..];
            if payload.len() > self.remaining {
                warn!(
                    received = payload.len(),
                    remaining = self.remaining,
                    "received more bytes than remaining"
                );
                self.remaining = 0;
                self.reassembly.clear();
                return;
            }
            self.reassembly.extend_from_slice(payload);
            self.remaining -= payload.len();
        } else {
            warn!(len = chunk.len(), "undersized attribute write ignored");
            return;
        }

        if self.remaining == 0 && !self.reassembly.is_empty() {
            let payload = std::mem::take(&mut self.reassembly);
            self.pending
                .push_back(ChannelEvent::Incoming(Bytes::from(payload)));
        }
    }
}

impl ByteChannel for AttrChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        self.reads_enabled = true;
        if !self.bound {
            self.bound = true;
            self.state = AttrState::Initialising;
            self.stack.initialise();
        }
        Ok(format!("attr://{}", self.uuid))
    }

    fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        if !self.bound {
            return Err(ChannelError::NotListening);
        }
        let framed = frame(&payload);
        for chunk in framed.chunks(MAX_SEND) {
            self.stack.publish(chunk);
        }
        self.pending.push_back(ChannelEvent::SendComplete);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.teardown = true;
        if self.connected {
            self.connected = false;
            self.pending.push_back(ChannelEvent::Disconnected);
        }
        match self.state {
            AttrState::Advertising | AttrState::AdvertisingContinuous | AttrState::Connected => {
                self.stack.unadvertise();
                self.state = AttrState::Unadvertising;
            }
            AttrState::Initialised | AttrState::Unadvertised => {
                self.stack.finalise();
                self.state = AttrState::Finalising;
            }
            // Mid-ack states finish their transition first; the acks run
            // the teardown onwards because `teardown` is set.
            AttrState::Dormant
            | AttrState::Initialising
            | AttrState::Unadvertising
            | AttrState::Finalising
            | AttrState::Finalised => {}
        }
    }

    fn cancel_pending_reads(&mut self) {
        self.reads_enabled = false;
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            tokio::select! {
                stack_event = self.stack_events.recv() => {
                    match stack_event {
                        Some(event) => self.handle_stack_event(event),
                        None => return None,
                    }
                }
                _ = self.recycle.tick() => self.on_recycle_tick(),
            }
        }
    }

    fn is_reading(&self) -> bool {
        self.reads_enabled && !matches!(self.state, AttrState::Dormant | AttrState::Finalised)
    }

    fn is_writing(&self) -> bool {
        false
    }

    fn open_connections(&self) -> usize {
        match self.state {
            AttrState::Dormant | AttrState::Finalised => 0,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use keyfob_core::identity::ServiceIdentity;

    use super::*;

    /// Scripted stack: acks every command instantly and records the call
    /// sequence, so tests can replay stack-level flows.
    struct MockRadio {
        events: mpsc::UnboundedSender<StackEvent>,
        log: Rc<RefCell<Vec<String>>>,
        published: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    impl RadioStack for MockRadio {
        fn initialise(&mut self) {
            self.log.borrow_mut().push("initialise".into());
            let _ = self.events.send(StackEvent::Initialised);
        }

        fn advertise(&mut self, uuid: &str) {
            self.log.borrow_mut().push(format!("advertise {uuid}"));
            let _ = self.events.send(StackEvent::Advertised);
        }

        fn unadvertise(&mut self) {
            self.log.borrow_mut().push("unadvertise".into());
            let _ = self.events.send(StackEvent::Unadvertised);
        }

        fn publish(&mut self, chunk: &[u8]) {
            self.published.borrow_mut().push(chunk.to_vec());
        }

        fn finalise(&mut self) {
            self.log.borrow_mut().push("finalise".into());
            let _ = self.events.send(StackEvent::Finalised);
        }
    }

    struct Fixture {
        channel: AttrChannel,
        inject: mpsc::UnboundedSender<StackEvent>,
        log: Rc<RefCell<Vec<String>>>,
        published: Rc<RefCell<Vec<Vec<u8>>>>,
    }

    fn fixture(continuous: bool) -> Fixture {
        let identity = ServiceIdentity::generate();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let log = Rc::new(RefCell::new(Vec::new()));
        let published = Rc::new(RefCell::new(Vec::new()));
        let stack = MockRadio {
            events: events_tx.clone(),
            log: Rc::clone(&log),
            published: Rc::clone(&published),
        };
        Fixture {
            channel: AttrChannel::new(
                Box::new(stack),
                events_rx,
                identity.commitment(),
                continuous,
            ),
            inject: events_tx,
            log,
            published,
        }
    }

    async fn pump(channel: &mut AttrChannel) -> Option<ChannelEvent> {
        tokio::time::timeout(Duration::from_millis(20), channel.next_event())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn uuid_reflects_continuous_bit() {
        let identity = ServiceIdentity::generate();
        let plain = service_uuid(&identity.commitment(), false);
        let continuous = service_uuid(&identity.commitment(), true);
        assert_ne!(plain, continuous);
        assert_eq!(plain.len(), 36);
        // Only the last byte's low bit differs.
        assert_eq!(plain[..35], continuous[..35]);

        let last_plain = u8::from_str_radix(&plain[34..], 16).unwrap();
        let last_continuous = u8::from_str_radix(&continuous[34..], 16).unwrap();
        assert_eq!(last_plain & 0x01, 0);
        assert_eq!(last_continuous & 0x01, 1);
    }

    #[tokio::test]
    async fn listen_brings_the_stack_up_and_advertises() {
        let mut fx = fixture(false);
        let address = fx.channel.listen().await.unwrap();
        assert!(address.starts_with("attr://"));

        assert!(pump(&mut fx.channel).await.is_none());
        assert_eq!(fx.channel.state(), AttrState::Advertising);
        let log = fx.log.borrow();
        assert_eq!(log[0], "initialise");
        assert_eq!(log[1], format!("advertise {}", &address["attr://".len()..]));
    }

    #[tokio::test]
    async fn chunked_writes_reassemble_into_one_frame() {
        let mut fx = fixture(false);
        fx.channel.listen().await.unwrap();
        assert!(pump(&mut fx.channel).await.is_none());

        // "hello world" split across two chunks: header chunk carries the
        // 4-byte remaining length, the follow-up carries index + payload.
        let mut first = vec![0u8, 0, 0, 0, 11];
        first.extend_from_slice(b"hel");
        let mut second = vec![1u8];
        second.extend_from_slice(b"lo world");

        fx.inject.send(StackEvent::WriteReceived(first)).unwrap();
        fx.inject.send(StackEvent::WriteReceived(second)).unwrap();

        assert_eq!(pump(&mut fx.channel).await, Some(ChannelEvent::Connected));
        assert_eq!(
            pump(&mut fx.channel).await,
            Some(ChannelEvent::Incoming(Bytes::from_static(b"hello world")))
        );
        assert_eq!(fx.channel.state(), AttrState::Connected);
    }

    #[tokio::test]
    async fn oversized_continuation_resets_reassembly() {
        let mut fx = fixture(false);
        fx.channel.listen().await.unwrap();
        assert!(pump(&mut fx.channel).await.is_none());

        let mut first = vec![0u8, 0, 0, 0, 4];
        first.extend_from_slice(b"ab");
        fx.inject.send(StackEvent::WriteReceived(first)).unwrap();

        // Declares 4, already has 2, now 5 more arrive.
        let mut second = vec![1u8];
        second.extend_from_slice(b"cdefg");
        fx.inject.send(StackEvent::WriteReceived(second)).unwrap();

        assert_eq!(pump(&mut fx.channel).await, Some(ChannelEvent::Connected));
        // No Incoming: the frame was abandoned.
        assert!(pump(&mut fx.channel).await.is_none());
    }

    #[tokio::test]
    async fn outbound_frames_are_published_in_chunks() {
        let mut fx = fixture(false);
        fx.channel.listen().await.unwrap();

        let payload = Bytes::from(vec![0x55u8; 300]);
        fx.channel.send(payload.clone()).unwrap();
        assert_eq!(pump(&mut fx.channel).await, Some(ChannelEvent::SendComplete));

        let published = fx.published.borrow();
        let total: Vec<u8> = published.iter().flatten().copied().collect();
        assert_eq!(total, frame(&payload));
        assert!(published.iter().all(|chunk| chunk.len() <= MAX_SEND));
        assert_eq!(published.len(), frame(&payload).len().div_ceil(MAX_SEND));
    }

    #[tokio::test(start_paused = true)]
    async fn recycle_tears_down_and_reinitialises_from_quiet_states() {
        let mut fx = fixture(false);
        fx.channel.listen().await.unwrap();
        assert!(pump(&mut fx.channel).await.is_none());
        assert_eq!(fx.channel.state(), AttrState::Advertising);
        fx.log.borrow_mut().clear();

        tokio::time::advance(Duration::from_secs(RECYCLE_SECS)).await;
        assert!(pump(&mut fx.channel).await.is_none());

        assert_eq!(
            fx.log.borrow().iter().map(String::as_str).collect::<Vec<_>>()[..3],
            ["unadvertise", "finalise", "initialise"]
        );
        assert_eq!(fx.channel.state(), AttrState::Advertising);
    }

    #[tokio::test(start_paused = true)]
    async fn recycle_is_deferred_while_connected() {
        let mut fx = fixture(false);
        fx.channel.listen().await.unwrap();
        assert!(pump(&mut fx.channel).await.is_none());

        let mut chunk = vec![0u8, 0, 0, 0, 2];
        chunk.extend_from_slice(b"ok");
        fx.inject.send(StackEvent::WriteReceived(chunk)).unwrap();
        assert_eq!(pump(&mut fx.channel).await, Some(ChannelEvent::Connected));
        assert_eq!(
            pump(&mut fx.channel).await,
            Some(ChannelEvent::Incoming(Bytes::from_static(b"ok")))
        );
        fx.log.borrow_mut().clear();

        tokio::time::advance(Duration::from_secs(RECYCLE_SECS)).await;
        assert!(pump(&mut fx.channel).await.is_none());
        assert!(fx.log.borrow().is_empty(), "no teardown while connected");
        assert_eq!(fx.channel.state(), AttrState::Connected);
    }

    #[tokio::test]
    async fn disconnect_runs_the_full_teardown() {
        let mut fx = fixture(false);
        fx.channel.listen().await.unwrap();
        assert!(pump(&mut fx.channel).await.is_none());

        fx.channel.disconnect();
        assert!(pump(&mut fx.channel).await.is_none());
        assert_eq!(fx.channel.state(), AttrState::Finalised);
        assert_eq!(fx.channel.open_connections(), 0);
    }
}
