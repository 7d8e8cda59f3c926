//! Runtime configuration.
//!
//! Values come from built-in defaults, then an optional JSON file, then
//! command-line flags, each layer overriding the one before.

use crate::error::{HvError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default directory holding the registration and reply endpoints.
pub const DEFAULT_SOCKET_DIR: &str = "/var/hylisphv/sockets";

/// LISP control port.
pub const DEFAULT_CONTROL_PORT: u16 = 4342;

/// Name of the registration endpoint inside the socket directory.
pub const REGISTER_SOCKET: &str = "register";

/// Prefix of control-plane endpoint files inside the socket directory.
pub const CONTROL_PLANE_SOCKET_PREFIX: &str = "cp_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Verbose logging.
    pub debug: bool,
    /// Directory for the registration endpoint.
    pub socket_dir: PathBuf,
    /// UDP port the control-packet router listens on.
    pub control_port: u16,
    /// Control planes registering on this port become the default.
    pub default_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            debug: false,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            control_port: DEFAULT_CONTROL_PORT,
            default_port: None,
        }
    }
}

/// Values set on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub debug: bool,
    pub socket_dir: Option<PathBuf>,
    pub control_port: Option<u16>,
    pub default_port: Option<u16>,
}

impl Config {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| HvError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    /// Parse a JSON config document.
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| HvError::Config(e.to_string()))
    }

    /// Apply command-line overrides.
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.debug |= overrides.debug;
        if let Some(dir) = overrides.socket_dir {
            self.socket_dir = dir;
        }
        if let Some(port) = overrides.control_port {
            self.control_port = port;
        }
        if overrides.default_port.is_some() {
            self.default_port = overrides.default_port;
        }
        self
    }

    /// Path of the registration endpoint.
    pub fn register_path(&self) -> PathBuf {
        self.socket_dir.join(REGISTER_SOCKET)
    }
}
