//! In-memory byte channel for tests.
//!
//! [`MemChannel`] implements the full [`ByteChannel`] contract without any
//! transport underneath; the paired [`MemPeer`] plays the phone. Tests use
//! it to drive sessions deterministically, including injecting transport
//! timeouts and failures the real adapters only produce under fault
//! conditions.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ByteChannel, ChannelError, ChannelEvent, TransportErrorKind};

struct MemShared {
    reading: bool,
    writing: bool,
    connected: bool,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl MemShared {
    fn emit(&self, event: ChannelEvent) {
        // The channel half may have been dropped mid-test; losing events
        // then is fine.
        let _ = self.events_tx.send(event);
    }
}

/// The service-side half of an in-memory channel pair.
pub struct MemChannel {
    shared: Rc<RefCell<MemShared>>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    to_peer_tx: mpsc::UnboundedSender<Bytes>,
    bound: bool,
}

/// The phone-side half of an in-memory channel pair.
pub struct MemPeer {
    shared: Rc<RefCell<MemShared>>,
    from_service: mpsc::UnboundedReceiver<Bytes>,
}

impl MemChannel {
    /// Create a connected pair of channel halves.
    #[must_use]
    pub fn pair() -> (Self, MemPeer) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (to_peer_tx, from_service) = mpsc::unbounded_channel();
        let shared = Rc::new(RefCell::new(MemShared {
            reading: false,
            writing: false,
            connected: false,
            events_tx,
        }));

        (
            Self {
                shared: Rc::clone(&shared),
                events_rx,
                to_peer_tx,
                bound: false,
            },
            MemPeer {
                shared,
                from_service,
            },
        )
    }
}

impl ByteChannel for MemChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        self.bound = true;
        self.shared.borrow_mut().reading = true;
        Ok("mem://session".to_owned())
    }

    fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        if !self.bound {
            return Err(ChannelError::NotListening);
        }
        let shared = self.shared.borrow();
        if shared.writing {
            return Err(ChannelError::Busy("write in flight"));
        }
        let _ = self.to_peer_tx.send(payload);
        shared.emit(ChannelEvent::SendComplete);
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut shared = self.shared.borrow_mut();
        if shared.connected {
            shared.connected = false;
            shared.emit(ChannelEvent::Disconnected);
        }
    }

    fn cancel_pending_reads(&mut self) {
        self.shared.borrow_mut().reading = false;
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
        usize::from(self.shared.borrow().connected)
    }
}

impl MemPeer {
    /// Connect to the listening service side.
    pub fn connect(&self) {
        let mut shared = self.shared.borrow_mut();
        if !shared.connected {
            shared.connected = true;
            shared.emit(ChannelEvent::Connected);
        }
    }

    /// Deliver one frame payload to the service. Frames sent while the
    /// service has cancelled reads are lost, as on a real transport.
    pub fn send_frame(&self, payload: impl Into<Bytes>) {
        let shared = self.shared.borrow();
        if shared.reading && shared.connected {
            shared.emit(ChannelEvent::Incoming(payload.into()));
        }
    }

    /// Receive the next frame payload the service sent.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        self.from_service.recv().await
    }

    /// Drop the connection from the phone side.
    pub fn disconnect(&self) {
        let mut shared = self.shared.borrow_mut();
        if shared.connected {
            shared.connected = false;
            shared.emit(ChannelEvent::Disconnected);
        }
    }

    /// Inject a transport-level timeout.
    pub fn inject_timeout(&self) {
        self.shared.borrow().emit(ChannelEvent::Timeout);
    }

    /// Inject a transport failure of the given class.
    pub fn inject_error(&self, kind: TransportErrorKind) {
        self.shared.borrow().emit(ChannelEvent::Error(kind));
    }

    /// Whether the service side still sees an open connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.borrow().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_then_frames_then_disconnect() {
        let (mut channel, mut peer) = MemChannel::pair();
        let address = channel.listen().await.unwrap();
        assert_eq!(address, "mem://session");

        peer.connect();
        peer.send_frame(Bytes::from_static(b"hello"));
        peer.disconnect();

        assert_eq!(channel.next_event().await, Some(ChannelEvent::Connected));
        assert_eq!(
            channel.next_event().await,
            Some(ChannelEvent::Incoming(Bytes::from_static(b"hello")))
        );
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Disconnected));

        channel.send(Bytes::from_static(b"reply")).unwrap();
        assert_eq!(peer.recv_frame().await.unwrap(), "reply");
    }

    #[tokio::test]
    async fn cancelled_reads_drop_incoming_frames() {
        let (mut channel, peer) = MemChannel::pair();
        channel.listen().await.unwrap();
        peer.connect();
        channel.cancel_pending_reads();
        assert!(!channel.is_reading());

        peer.send_frame(Bytes::from_static(b"lost"));
        peer.disconnect();

        assert_eq!(channel.next_event().await, Some(ChannelEvent::Connected));
        // The frame sent after cancellation never arrives.
        assert_eq!(channel.next_event().await, Some(ChannelEvent::Disconnected));
    }

    #[tokio::test]
    async fn send_before_listen_is_refused() {
        let (mut channel, _peer) = MemChannel::pair();
        let err = channel.send(Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, ChannelError::NotListening));
    }
}
