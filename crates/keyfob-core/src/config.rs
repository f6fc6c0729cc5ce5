//! Layered per-session configuration.
//!
//! Every authentication session runs with an effective configuration built
//! from three layers, applied in order:
//!
//! 1. built-in defaults,
//! 2. the JSON dictionary in `config.txt` under the configuration directory,
//! 3. the JSON dictionary the IPC caller supplied with `StartAuth`.
//!
//! Later layers override earlier ones, key by key; keys absent from a layer
//! keep their previous value and unrecognised keys are ignored.
//!
//! The `any_user` key is special: it may only be set by the caller. A value
//! found in the config file is discarded, whatever it says — a file that
//! could silently widen a specific-user request to "anyone paired may log
//! in" would be a standing privilege escalation.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// File inside the configuration directory holding the default overlay.
pub const CONFIG_FILE: &str = "config.txt";

/// File inside the configuration directory listing the paired users.
pub const USERS_FILE: &str = "users.txt";

/// File inside the configuration directory listing beacon targets.
pub const TARGETS_FILE: &str = "bluetooth.txt";

/// File inside the configuration directory holding the service public key
/// (DER).
pub const PUBLIC_KEY_FILE: &str = "key_pub.der";

/// File inside the configuration directory holding the service private key
/// (DER).
pub const PRIVATE_KEY_FILE: &str = "key_priv.der";

const DEFAULT_RVP_URL_PREFIX: &str = "http://rendezvous.example.com/channel/";
const DEFAULT_CONFIG_DIR: &str = "/etc/keyfob/";

/// Errors raised while reading configuration layers.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The source exists but is not a well-formed JSON object.
    #[error("configuration is not a JSON object: {0}")]
    Malformed(String),

    /// The config file could not be read (other than not existing, which is
    /// fail-open).
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport used for the authentication channel of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Rendezvous-point channel: HTTP long-polling against a shared relay.
    #[default]
    Rvp,
    /// Direct stream-socket channel on a well-known port range.
    Stream,
    /// Attribute-based radio channel (advertised service, chunked writes).
    Attr,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rvp => write!(f, "rvp"),
            Self::Stream => write!(f, "stream"),
            Self::Attr => write!(f, "attr"),
        }
    }
}

/// Effective configuration of one authentication session.
///
/// Immutable once the session has started; the orchestrator takes a copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    /// Keep re-authenticating the phone after the first success, until
    /// contact is lost.
    pub continuous: bool,
    /// Transport adapter to use for the session channel.
    pub channel_type: ChannelKind,
    /// Broadcast invitation beacons to the configured target list.
    pub beacons: bool,
    /// Allow any paired user to authenticate rather than the requested one.
    /// Locked: only the caller overlay may set this.
    pub any_user: bool,
    /// Overall session timeout in seconds; `0` means no timeout.
    pub timeout_seconds: f64,
    /// Rendezvous-point URL prefix the channel name is appended to.
    /// Always ends with `/`.
    pub rvp_url_prefix: String,
    /// Directory holding keys, the user list, the target list and
    /// `config.txt`. Always ends with `/`.
    pub config_dir: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            channel_type: ChannelKind::Rvp,
            beacons: false,
            any_user: false,
            timeout_seconds: 0.0,
            rvp_url_prefix: DEFAULT_RVP_URL_PREFIX.to_owned(),
            config_dir: DEFAULT_CONFIG_DIR.to_owned(),
        }
    }
}

impl SessionConfig {
    /// Overlay the dictionary found in `config.txt` under the configured
    /// directory.
    ///
    /// Convenience wrapper around [`SessionConfig::load_file`].
    ///
    /// # Errors
    ///
    /// See [`SessionConfig::load_file`].
    pub fn load_dir(&mut self) -> Result<(), ConfigError> {
        let path = format!("{}{CONFIG_FILE}", self.config_dir);
        self.load_file(path)
    }

    /// Overlay the JSON dictionary stored in the file at `path`.
    ///
    /// A missing file is not an error: defaults are simply retained. The
    /// `any_user` key is discarded even if present — the file cannot widen
    /// the set of acceptable users.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Malformed`] if the file exists but does not
    /// contain a JSON object. The configuration is left unchanged in that
    /// case.
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, keeping defaults");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        // The file must never influence any_user; save and restore around
        // the generic overlay rather than special-casing every key path.
        let any_user = self.any_user;
        let result = self.overlay_json(&contents);
        self.any_user = any_user;
        result
    }

    /// Overlay the JSON dictionary supplied by the IPC caller.
    ///
    /// Unlike the file layer this one may set every recognised key,
    /// including `any_user`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Malformed`] if `json` is non-empty and not a
    /// JSON object.
    pub fn overlay_caller(&mut self, json: &str) -> Result<(), ConfigError> {
        self.overlay_json(json)
    }

    /// Serialise the effective configuration as a JSON dictionary using the
    /// recognised key names.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }

    fn overlay_json(&mut self, json: &str) -> Result<(), ConfigError> {
        if json.trim().is_empty() {
            return Ok(());
        }

        let value: Value = serde_json::from_str(json)
            .map_err(|err| ConfigError::Malformed(err.to_string()))?;
        let Value::Object(dict) = value else {
            return Err(ConfigError::Malformed(format!(
                "expected an object, got {}",
                type_name(&value)
            )));
        };

        self.apply(&dict);
        Ok(())
    }

    fn apply(&mut self, dict: &Map<String, Value>) {
        if let Some(flag) = dict.get("continuous").and_then(as_flag) {
            self.continuous = flag;
        }
        if let Some(kind) = dict.get("channel_type").and_then(Value::as_str) {
            match kind {
                "rvp" => self.channel_type = ChannelKind::Rvp,
                "stream" => self.channel_type = ChannelKind::Stream,
                "attr" => self.channel_type = ChannelKind::Attr,
                other => warn!(channel_type = other, "unknown channel type ignored"),
            }
        }
        if let Some(flag) = dict.get("beacons").and_then(as_flag) {
            self.beacons = flag;
        }
        if let Some(flag) = dict.get("any_user").and_then(as_flag) {
            self.any_user = flag;
        }
        if let Some(timeout) = dict.get("timeout_seconds").and_then(Value::as_f64) {
            self.timeout_seconds = timeout;
        }
        if let Some(url) = dict.get("rvp_url_prefix").and_then(Value::as_str) {
            self.rvp_url_prefix = with_trailing_slash(url);
        }
        if let Some(dir) = dict.get("config_dir").and_then(Value::as_str) {
            self.config_dir = with_trailing_slash(dir);
        }
    }
}

/// Read a boolean configuration flag. Callers historically pass `0`/`1`
/// rather than JSON booleans, so both forms are accepted.
fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => number.as_i64().map(|n| n != 0),
        _ => None,
    }
}

fn with_trailing_slash(value: &str) -> String {
    if value.ends_with('/') || value.is_empty() {
        value.to_owned()
    } else {
        format!("{value}/")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
