//! Stream-socket channel adapter.
//!
//! Binds a listening stream socket on the first free channel in the
//! service's port window and speaks length-prefixed frames with a single
//! peer. The window is deliberately small — a host advertising more than a
//! couple of dozen simultaneous sessions has bigger problems — and the
//! channel index doubles as the session's slot in the address.
//!
//! Only one peer may be connected at a time; connections arriving while a
//! peer is active are dropped until that peer disconnects.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::framing::FrameCodec;

use super::{ByteChannel, ChannelError, ChannelEvent, TransportErrorKind};

/// Base the channel window is laid on top of; channel `n` listens on
/// `STREAM_PORT_BASE + n`.
pub const STREAM_PORT_BASE: u16 = 52700;

/// Exclusive upper bound of the channel window `[1, STREAM_CHANNEL_MAX)`.
pub const STREAM_CHANNEL_MAX: u16 = 32;

/// Capacity of the read buffer handed to the framed reader.
const READ_BUFFER: usize = 2048;

#[derive(Default)]
struct StreamShared {
    reads_enabled: bool,
    reading: bool,
    writing: bool,
    connected: bool,
}

enum StreamCmd {
    Send(Bytes),
    Disconnect,
    SetReads(bool),
}

/// Byte channel over a listening stream socket.
pub struct StreamChannel {
    host: String,
    address: Option<String>,
    shared: Rc<RefCell<StreamShared>>,
    events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    cmd_tx: Option<mpsc::UnboundedSender<StreamCmd>>,
}

impl StreamChannel {
    /// Channel advertising `host` in its address string.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            host: host.into(),
            address: None,
            shared: Rc::new(RefCell::new(StreamShared::default())),
            events_rx,
            events_tx,
            cmd_tx: None,
        }
    }
}

impl ByteChannel for StreamChannel {
    async fn listen(&mut self) -> Result<String, ChannelError> {
        if let Some(address) = &self.address {
            // Already bound; a repeat listen resumes reading.
            if let Some(cmd_tx) = &self.cmd_tx {
                let _ = cmd_tx.send(StreamCmd::SetReads(true));
            }
            return Ok(address.clone());
        }

        for channel in 1..STREAM_CHANNEL_MAX {
            let port = STREAM_PORT_BASE + channel;
            let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await else {
                continue;
            };
            debug!(channel, port, "stream channel bound");

            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            self.cmd_tx = Some(cmd_tx);
            self.shared.borrow_mut().reads_enabled = true;

            let shared = Rc::clone(&self.shared);
            let events_tx = self.events_tx.clone();
            tokio::task::spawn_local(drive(listener, shared, events_tx, cmd_rx));

            let address = format!("skt://{}:{port}", self.host);
            self.address = Some(address.clone());
            return Ok(address);
        }

        Err(ChannelError::BindFailed(format!(
            "no free channel in [{}, {})",
            STREAM_PORT_BASE + 1,
            STREAM_PORT_BASE + STREAM_CHANNEL_MAX
        )))
    }

    fn send(&mut self, payload: Bytes) -> Result<(), ChannelError> {
        let Some(cmd_tx) = &self.cmd_tx else {
            return Err(ChannelError::NotListening);
        };
        if self.shared.borrow().writing {
            return Err(ChannelError::Busy("write in flight"));
        }
        let _ = cmd_tx.send(StreamCmd::Send(payload));
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(cmd_tx) = &self.cmd_tx {
            let _ = cmd_tx.send(StreamCmd::Disconnect);
        }
    }

    fn cancel_pending_reads(&mut self) {
        // Flip the flag synchronously so a stop check that runs before the
        // driver wakes already sees the read as cancelled.
        {
            let mut shared = self.shared.borrow_mut();
            shared.reads_enabled = false;
            shared.reading = false;
        }
        if let Some(cmd_tx) = &self.cmd_tx {
            let _ = cmd_tx.send(StreamCmd::SetReads(false));
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
        usize::from(self.shared.borrow().connected)
    }
}

#[allow(clippy::too_many_lines)]
async fn drive(
    listener: TcpListener,
    shared: Rc<RefCell<StreamShared>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<StreamCmd>,
) {
    let mut reader: Option<FramedRead<OwnedReadHalf, FrameCodec>> = None;
    let mut writer: Option<FramedWrite<OwnedWriteHalf, FrameCodec>> = None;

    let emit = |event: ChannelEvent| {
        let _ = events_tx.send(event);
    };

    loop {
        let reads_armed = reader.is_some() && shared.borrow().reads_enabled;

        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        if reader.is_some() {
                            // One peer at a time; later connections are
                            // rejected until the current one goes away.
                            debug!(%peer_addr, "rejecting second peer");
                            drop(socket);
                        } else {
                            debug!(%peer_addr, "peer connected");
                            let (read_half, write_half) = socket.into_split();
                            reader = Some(FramedRead::with_capacity(
                                read_half,
                                FrameCodec::new(),
                                READ_BUFFER,
                            ));
                            writer = Some(FramedWrite::new(write_half, FrameCodec::new()));
                            {
                                let mut sh = shared.borrow_mut();
                                sh.connected = true;
                                sh.reading = sh.reads_enabled;
                            }
                            emit(ChannelEvent::Connected);
                        }
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }

            frame = async { reader.as_mut().expect("guarded").next().await },
                    if reads_armed => {
                match frame {
                    Some(Ok(payload)) => emit(ChannelEvent::Incoming(payload)),
                    Some(Err(err)) => {
                        warn!(%err, "read failed, dropping peer");
                        reader = None;
                        writer = None;
                        reset_connection(&shared);
                        emit(ChannelEvent::Error(TransportErrorKind::Fatal));
                        emit(ChannelEvent::Disconnected);
                    }
                    None => {
                        reader = None;
                        writer = None;
                        reset_connection(&shared);
                        emit(ChannelEvent::Disconnected);
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(StreamCmd::Send(payload)) => {
                        if let Some(sink) = writer.as_mut() {
                            shared.borrow_mut().writing = true;
                            let sent = sink.send(payload).await;
                            shared.borrow_mut().writing = false;
                            match sent {
                                Ok(()) => emit(ChannelEvent::SendComplete),
                                Err(err) => {
                                    warn!(%err, "write failed");
                                    emit(ChannelEvent::Error(TransportErrorKind::Fatal));
                                }
                            }
                        } else {
                            warn!("send requested while not connected");
                        }
                    }
                    Some(StreamCmd::Disconnect) => {
                        if reader.take().is_some() {
                            writer = None;
                            reset_connection(&shared);
                            emit(ChannelEvent::Disconnected);
                        }
                    }
                    Some(StreamCmd::SetReads(enabled)) => {
                        let mut sh = shared.borrow_mut();
                        sh.reads_enabled = enabled;
                        sh.reading = enabled && sh.connected;
                    }
                    None => break, // channel handle dropped
                }
            }
        }
    }
}

fn reset_connection(shared: &Rc<RefCell<StreamShared>>) {
    let mut sh = shared.borrow_mut();
    sh.connected = false;
    sh.reading = false;
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::framing::frame;

    use super::*;

    async fn connect(address: &str) -> TcpStream {
        let hostport = address.strip_prefix("skt://").unwrap();
        TcpStream::connect(hostport).await.unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip_with_one_peer() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut channel = StreamChannel::new("127.0.0.1");
                let address = channel.listen().await.unwrap();
                assert!(address.starts_with("skt://127.0.0.1:"));

                let mut peer = connect(&address).await;
                assert_eq!(channel.next_event().await, Some(ChannelEvent::Connected));

                peer.write_all(&frame(b"hello service")).await.unwrap();
                assert_eq!(
                    channel.next_event().await,
                    Some(ChannelEvent::Incoming(Bytes::from_static(b"hello service")))
                );

                channel.send(Bytes::from_static(b"hello phone")).unwrap();
                assert_eq!(channel.next_event().await, Some(ChannelEvent::SendComplete));

                let mut received = vec![0u8; frame(b"hello phone").len()];
                peer.read_exact(&mut received).await.unwrap();
                assert_eq!(received, frame(b"hello phone"));

                drop(peer);
                assert_eq!(channel.next_event().await, Some(ChannelEvent::Disconnected));
                assert_eq!(channel.open_connections(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn second_peer_is_rejected_until_first_leaves() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut channel = StreamChannel::new("127.0.0.1");
                let address = channel.listen().await.unwrap();

                let mut first = connect(&address).await;
                assert_eq!(channel.next_event().await, Some(ChannelEvent::Connected));

                // The second connection is accepted at the TCP level and
                // immediately dropped.
                let mut second = connect(&address).await;
                let mut buf = [0u8; 1];
                let read = second.read(&mut buf).await.unwrap();
                assert_eq!(read, 0, "second peer sees an immediate close");

                // The first peer still works.
                first.write_all(&frame(b"still here")).await.unwrap();
                assert_eq!(
                    channel.next_event().await,
                    Some(ChannelEvent::Incoming(Bytes::from_static(b"still here")))
                );
            })
            .await;
    }

    #[tokio::test]
    async fn two_channels_pick_distinct_ports() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut one = StreamChannel::new("127.0.0.1");
                let mut two = StreamChannel::new("127.0.0.1");
                let first = one.listen().await.unwrap();
                let second = two.listen().await.unwrap();
                assert_ne!(first, second);
            })
            .await;
    }
}
