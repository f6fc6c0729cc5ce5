//! Unix-socket request/reply server.
//!
//! Clients (typically the PAM helper) connect to the daemon's socket and
//! exchange length-prefixed frames, each carrying one JSON message. Three
//! requests exist: `start_auth`, `complete_auth` and `exit`. Replies
//! mirror the requests; `complete_auth` blocks at this layer — not in the
//! service loop — until the session has a result.
//!
//! Each connection carries one client identity (the *owner tag*). When a
//! connection closes, the server raises `OwnerLost` for its tag so the
//! service loop can cancel sessions whose caller died waiting.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::framing::FrameCodec;
use crate::service::ServiceCommand;
use crate::session::pairing::{CompleteReply, StartReply};

/// Errors raised while running the IPC server.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The socket could not be prepared or bound.
    #[error("failed to bind IPC socket {path}: {source}")]
    Bind {
        /// The socket path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },
}

/// Requests a client may send.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Set up a session; answered once the invitation is ready.
    StartAuth {
        /// Requested username; empty to allow any paired user.
        username: String,
        /// JSON dictionary of session parameters.
        parameters: String,
    },
    /// Collect a session's result; blocks until there is one.
    CompleteAuth {
        /// Handle from the `start_auth` reply.
        handle: i32,
    },
    /// Shut the daemon down.
    Exit,
}

/// Replies the server sends.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Reply to [`IpcRequest::StartAuth`].
    StartAuth {
        /// Session handle, `-1` on failure.
        handle: i32,
        /// Invitation payload for QR display.
        code: String,
        /// Whether the session was set up.
        success: bool,
    },
    /// Reply to [`IpcRequest::CompleteAuth`].
    CompleteAuth {
        /// Authenticated username, empty on failure.
        username: String,
        /// Decrypted user token, possibly empty.
        token: String,
        /// Whether authentication succeeded.
        success: bool,
    },
    /// Reply to [`IpcRequest::Exit`].
    Exit,
}

/// Run the IPC server until the command channel closes.
///
/// # Errors
///
/// Fails if the socket cannot be bound. Per-connection errors are logged
/// and end only that connection.
pub async fn run(
    socket_path: &Path,
    commands: mpsc::UnboundedSender<ServiceCommand>,
) -> Result<(), IpcError> {
    // A stale socket from a previous run would make bind fail.
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(|source| IpcError::Bind {
            path: socket_path.to_owned(),
            source,
        })?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| IpcError::Bind {
            path: socket_path.to_owned(),
            source,
        })?;
    }

    let listener = UnixListener::bind(socket_path).map_err(|source| IpcError::Bind {
        path: socket_path.to_owned(),
        source,
    })?;
    info!(path = %socket_path.display(), "IPC server listening");

    let next_client = Rc::new(Cell::new(0u64));
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let id = next_client.get();
                next_client.set(id + 1);
                let owner = format!("client-{id}");
                let commands = commands.clone();
                tokio::task::spawn_local(async move {
                    handle_connection(stream, owner, commands).await;
                });
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    owner: String,
    commands: mpsc::UnboundedSender<ServiceCommand>,
) {
    debug!(%owner, "client connected");
    let mut framed = Framed::new(stream, FrameCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%owner, %err, "failed to read request");
                break;
            }
        };
        let request: IpcRequest = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(err) => {
                warn!(%owner, %err, "malformed request");
                break;
            }
        };
        debug!(%owner, ?request, "request");

        let (response, exit) = dispatch(request, &owner, &commands).await;
        let encoded = match serde_json::to_vec(&response) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(%owner, %err, "failed to encode response");
                break;
            }
        };
        if let Err(err) = framed.send(Bytes::from(encoded)).await {
            warn!(%owner, %err, "failed to send response");
            break;
        }
        if exit {
            return;
        }
    }

    debug!(%owner, "client disconnected");
    // The caller is gone; let the loop cancel whatever it still owned.
    let _ = commands.send(ServiceCommand::OwnerLost { owner });
}

async fn dispatch(
    request: IpcRequest,
    owner: &str,
    commands: &mpsc::UnboundedSender<ServiceCommand>,
) -> (IpcResponse, bool) {
    match request {
        IpcRequest::StartAuth {
            username,
            parameters,
        } => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = commands.send(ServiceCommand::StartAuth {
                username,
                parameters,
                owner: Some(owner.to_owned()),
                reply: reply_tx,
            });
            let reply = match sent {
                Ok(()) => reply_rx.await.unwrap_or_else(|_| StartReply::failure(-1)),
                Err(_) => StartReply::failure(-1),
            };
            (
                IpcResponse::StartAuth {
                    handle: reply.handle,
                    code: reply.code,
                    success: reply.success,
                },
                false,
            )
        }
        IpcRequest::CompleteAuth { handle } => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = commands.send(ServiceCommand::CompleteAuth {
                handle,
                owner: Some(owner.to_owned()),
                reply: reply_tx,
            });
            let reply = match sent {
                Ok(()) => reply_rx.await.unwrap_or_else(|_| CompleteReply::failure()),
                Err(_) => CompleteReply::failure(),
            };
            (
                IpcResponse::CompleteAuth {
                    username: reply.username,
                    token: reply.token,
                    success: reply.success,
                },
                false,
            )
        }
        IpcRequest::Exit => {
            let _ = commands.send(ServiceCommand::Exit);
            (IpcResponse::Exit, true)
        }
    }
}
