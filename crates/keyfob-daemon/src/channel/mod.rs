//! The byte-channel contract and its transport adapters.
//!
//! A session talks to exactly one phone over a bidirectional byte channel.
//! The orchestrator neither knows nor cares which transport backs it; every
//! adapter reduces to the same capability set — `listen`, `send`,
//! `disconnect`, `cancel_pending_reads` — plus an ordered event stream.
//!
//! Three production adapters exist, one per transport the phone may pick:
//!
//! - [`rvp::RvpChannel`] — HTTP long-polling against a rendezvous point
//! - [`stream::StreamChannel`] — a listening stream socket
//! - [`attr::AttrChannel`] — an attribute-based radio session
//!
//! [`mem::MemChannel`] is an in-memory adapter that lets tests drive a
//! whole session without a transport underneath.
//!
//! Invariants every adapter upholds:
//!
//! - `Connected` precedes any `Incoming` for a given peer connection.
//! - At most one read and at most one write are in flight at a time;
//!   overlapping operations are refused with [`ChannelError::Busy`].
//! - `Disconnected` is emitted at most once per peer connection.
//! - `send` transmits a 4-byte big-endian length prefix followed by the
//!   payload; `Incoming` carries the payload with the prefix stripped.

pub mod attr;
pub mod mem;
pub mod rvp;
pub mod stream;

use bytes::Bytes;
use keyfob_core::config::{ChannelKind, SessionConfig};
use keyfob_core::identity::Commitment;
use thiserror::Error;
use tracing::warn;

/// Classification of transport failures, mirrored in the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Worth one retry; the adapter has already scheduled it.
    Transient,
    /// Not retryable; the session should stop.
    Fatal,
}

/// Events an adapter delivers to the orchestrator, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A peer connected. Precedes any `Incoming` from that peer.
    Connected,
    /// One complete frame payload arrived (length prefix stripped).
    Incoming(Bytes),
    /// The previously enqueued `send` finished transmitting.
    SendComplete,
    /// The peer connection closed. At most once per connection.
    Disconnected,
    /// A transport-level timeout expired on the connection.
    Timeout,
    /// The transport failed.
    Error(TransportErrorKind),
}

/// Errors returned by adapter operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// No endpoint could be acquired while binding.
    #[error("no endpoint could be acquired: {0}")]
    BindFailed(String),

    /// A read or write is already in flight.
    #[error("channel busy: {0}")]
    Busy(&'static str),

    /// The adapter was used before `listen` bound an endpoint.
    #[error("channel is not listening")]
    NotListening,

    /// Underlying IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The uniform byte-channel capability set.
///
/// Adapters are driven from the single loop thread; none of this is `Send`.
#[allow(async_fn_in_trait)]
pub trait ByteChannel {
    /// Bind a fresh endpoint and return its address for inclusion in the
    /// invitation. Calling `listen` again after `cancel_pending_reads`
    /// resumes reading on the already-bound endpoint.
    async fn listen(&mut self) -> Result<String, ChannelError>;

    /// Enqueue one length-prefixed frame for transmission.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Busy`] if a read or write is still in flight and the
    /// transport cannot pipeline.
    fn send(&mut self, payload: Bytes) -> Result<(), ChannelError>;

    /// Close the current peer connection. Idempotent.
    fn disconnect(&mut self);

    /// Cancel an in-flight read without closing the endpoint.
    fn cancel_pending_reads(&mut self);

    /// Next channel event; `None` once the adapter has shut down.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Whether a read is currently in flight.
    fn is_reading(&self) -> bool;

    /// Whether a write is currently in flight.
    fn is_writing(&self) -> bool;

    /// Number of open transport connections (0 or 1 for every adapter).
    fn open_connections(&self) -> usize;
}

/// A channel of any supported transport, selected per session from
/// configuration.
pub enum AnyChannel {
    /// Rendezvous-point long-polling.
    Rvp(rvp::RvpChannel),
    /// Listening stream socket.
    Stream(stream::StreamChannel),
    /// Attribute-based radio.
    Attr(attr::AttrChannel),
    /// In-memory test channel.
    Mem(mem::MemChannel),
}

macro_rules! delegate {
    ($self:ident, $channel:ident => $body:expr) => {
        match $self {
            Self::Rvp($channel) => $body,
            Self::Stream($channel) => $body,
            Self::Attr($channel) => $body,
            Self::Mem($channel) => $body,
        }
    };
}

impl ByteChannel for AnyChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        delegate!(self, channel => channel.listen().await)
    }

    fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        delegate!(self, channel => channel.send(payload))
    }

    fn disconnect(&mut self) {
        delegate!(self, channel => channel.disconnect());
    }

    fn cancel_pending_reads(&mut self) {
        delegate!(self, channel => channel.cancel_pending_reads());
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        delegate!(self, channel => channel.next_event().await)
    }

    fn is_reading(&self) -> bool {
        delegate!(self, channel => channel.is_reading())
    }

    fn is_writing(&self) -> bool {
        delegate!(self, channel => channel.is_writing())
    }

    fn open_connections(&self) -> usize {
        delegate!(self, channel => channel.open_connections())
    }
}

/// Everything an adapter needs to know about the session it serves.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    /// Rendezvous URL prefix from the effective configuration.
    pub rvp_url_prefix: String,
    /// Whether the session runs in continuous mode (the attribute adapter
    /// advertises a different service UUID for it).
    pub continuous: bool,
    /// The service commitment, for address derivation.
    pub commitment: Commitment,
}

impl ChannelParams {
    /// Collect adapter parameters from a session's effective configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig, commitment: Commitment) -> Self {
        Self {
            rvp_url_prefix: config.rvp_url_prefix.clone(),
            continuous: config.continuous,
            commitment,
        }
    }
}

/// Creates the channel for a new session.
///
/// The service loop owns one factory; tests substitute their own to hand
/// sessions in-memory channels.
pub trait ChannelFactory {
    /// Create an unbound channel of the requested kind.
    fn create(&self, kind: ChannelKind, params: &ChannelParams) -> AnyChannel;
}

/// Production factory covering the transports this host supports.
pub struct DefaultChannelFactory {
    stream_host: String,
    radio: Option<Box<dyn attr::RadioProvider>>,
}

impl DefaultChannelFactory {
    /// Factory advertising `stream_host` in stream-channel addresses.
    #[must_use]
    pub fn new(stream_host: impl Into<String>) -> Self {
        Self {
            stream_host: stream_host.into(),
            radio: None,
        }
    }

    /// Enable the attribute-radio transport backed by the given provider.
    #[must_use]
    pub fn with_radio(mut self, radio: Box<dyn attr::RadioProvider>) -> Self {
        self.radio = Some(radio);
        self
    }
}

impl ChannelFactory for DefaultChannelFactory {
    fn create(&self, kind: ChannelKind, params: &ChannelParams) -> AnyChannel {
        match kind {
            ChannelKind::Rvp => AnyChannel::Rvp(rvp::RvpChannel::new(&params.rvp_url_prefix)),
            ChannelKind::Stream => {
                AnyChannel::Stream(stream::StreamChannel::new(&self.stream_host))
            }
            ChannelKind::Attr => match &self.radio {
                Some(provider) => {
                    let (stack, events) = provider.open();
                    AnyChannel::Attr(attr::AttrChannel::new(
                        stack,
                        events,
                        params.commitment,
                        params.continuous,
                    ))
                }
                None => {
                    // Same fallback the service has always had on hosts
                    // without a usable radio stack.
                    warn!("attribute radio not available, falling back to rendezvous channel");
                    AnyChannel::Rvp(rvp::RvpChannel::new(&params.rvp_url_prefix))
                }
            },
        }
    }
}
