//! # keyfob-core
//!
//! Core library for keyfob — a service that authenticates end-users to a
//! host machine using a nearby smartphone as the credential.
//!
//! This crate provides the protocol-independent building blocks that the
//! daemon composes into authentication sessions:
//!
//! - [`config`]: layered session configuration (defaults, config file,
//!   caller-supplied parameters) with one locked override
//! - [`identity`]: the service's long-term signing identity and the
//!   commitment derived from it
//! - [`users`]: the table of paired users and their keys
//! - [`beacon`]: the signed invitation payload and the broadcast target list
//! - [`token`]: decryption of the user token carried in the handshake
//!   extra-data
//!
//! ## Example
//!
//! ```rust,no_run
//! use keyfob_core::config::SessionConfig;
//!
//! let mut config = SessionConfig::default();
//! config.load_file("/etc/keyfob/config.txt")?;
//! config.overlay_caller("{\"continuous\":1,\"beacons\":0}")?;
//! # Ok::<(), keyfob_core::config::ConfigError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod beacon;
pub mod config;
pub mod identity;
pub mod token;
pub mod users;

pub use config::{ChannelKind, SessionConfig};
pub use identity::{Commitment, ServiceIdentity};
pub use users::UserTable;
