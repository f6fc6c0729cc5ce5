//! Screen-lock collaborator.
//!
//! There is no canonical way to lock a desktop session, so the daemon
//! shells out to a configurable command with the username as its single
//! argument and lets the deployment decide what that means. The exit
//! status is logged and never acted upon — by the time we lock, the
//! session is already over.

use std::path::PathBuf;
use std::process::Stdio;

use tracing::{info, warn};

/// Default lock command installed with the daemon.
pub const DEFAULT_LOCK_COMMAND: &str = "/usr/share/keyfob/lock.sh";

/// Issues desktop-lock requests.
pub trait Locker {
    /// Lock the named user's desktop session.
    fn lock(&self, username: &str);
}

/// [`Locker`] that runs the configured lock command.
pub struct CommandLocker {
    command: PathBuf,
}

impl CommandLocker {
    /// Locker invoking `command <username>`.
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Locker for CommandLocker {
    fn lock(&self, username: &str) {
        info!(username, command = %self.command.display(), "locking session");

        let spawned = tokio::process::Command::new(&self.command)
            .arg(username)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(mut child) => {
                tokio::task::spawn_local(async move {
                    match child.wait().await {
                        Ok(status) => info!(%status, "lock command finished"),
                        Err(err) => warn!(%err, "lock command failed to run"),
                    }
                });
            }
            Err(err) => warn!(%err, "failed to spawn lock command"),
        }
    }
}
