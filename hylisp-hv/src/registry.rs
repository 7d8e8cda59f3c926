//! Registry of live control planes.
//!
//! Entries are kept in registration order. Positions shift down when an
//! entry is removed, so nothing outside this module holds on to a position:
//! assignments and wait-set entries refer to a control plane by its
//! [`ControlPlaneId`], which is never reused.

use std::fmt;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Initial capacity of the registry.
const INITIAL_CAPACITY: usize = 16;

/// Stable identity of a registered control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlPlaneId(pub u32);

impl ControlPlaneId {
    /// Get the raw counter value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ControlPlaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cp{}", self.0)
    }
}

/// Connection details supplied when a control plane registers.
#[derive(Debug)]
pub struct Connection {
    /// Channel connected to the control plane's endpoint.
    pub channel: Arc<UnixDatagram>,
    /// UDP port the control plane listens on for control packets.
    pub port: u16,
    /// Process id reported by the control plane.
    pub pid: i32,
    /// Path the hypervisor side of the channel is bound to.
    pub reply_path: Option<PathBuf>,
}

/// A registered control plane.
#[derive(Debug, Clone)]
pub struct ControlPlane {
    /// Stable identity.
    pub id: ControlPlaneId,
    /// Bidirectional channel for mapping messages.
    pub channel: Arc<UnixDatagram>,
    /// UDP port for demultiplexed control packets.
    pub port: u16,
    /// Process id of the control plane.
    pub pid: i32,
    /// Hypervisor-side endpoint path, removed on deregistration.
    pub reply_path: Option<PathBuf>,
}

/// Table of live control planes.
///
/// Not synchronized by itself; [`crate::tables::Tables`] owns it behind a
/// reader/writer lock.
#[derive(Debug)]
pub struct ControlPlaneRegistry {
    entries: Vec<ControlPlane>,
    next_id: u32,
    default: Option<ControlPlaneId>,
    default_port: Option<u16>,
}

impl ControlPlaneRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ControlPlaneRegistry {
            entries: Vec::with_capacity(INITIAL_CAPACITY),
            next_id: 0,
            default: None,
            default_port: None,
        }
    }

    /// Create an empty registry whose default is whichever control plane
    /// registers on `port`.
    pub fn with_default_port(port: Option<u16>) -> Self {
        let mut registry = Self::new();
        registry.default_port = port;
        registry
    }

    /// Register a control plane and return its new identity.
    pub fn add(&mut self, connection: Connection) -> ControlPlaneId {
        let id = ControlPlaneId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        if self.default.is_none() && self.default_port == Some(connection.port) {
            self.default = Some(id);
            debug!(%id, port = connection.port, "Control plane is the default");
        }

        self.entries.push(ControlPlane {
            id,
            channel: connection.channel,
            port: connection.port,
            pid: connection.pid,
            reply_path: connection.reply_path,
        });

        debug!(%id, slot = self.entries.len() - 1, "Control plane added to registry");
        id
    }

    /// Remove the control plane at `slot`, shifting later entries down.
    pub fn remove(&mut self, slot: usize) -> Option<ControlPlane> {
        if slot >= self.entries.len() {
            return None;
        }
        let removed = self.entries.remove(slot);
        if self.default == Some(removed.id) {
            self.default = None;
        }
        Some(removed)
    }

    /// Get a control plane by identity.
    pub fn get(&self, id: ControlPlaneId) -> Option<&ControlPlane> {
        self.entries.iter().find(|cp| cp.id == id)
    }

    /// Current position of a control plane.
    pub fn slot_of(&self, id: ControlPlaneId) -> Option<usize> {
        self.entries.iter().position(|cp| cp.id == id)
    }

    /// Position of the control plane listening on `port`.
    pub fn slot_by_port(&self, port: u16) -> Option<usize> {
        self.entries.iter().position(|cp| cp.port == port)
    }

    /// The control plane that receives traffic no assignment matches.
    ///
    /// There is no implicit default: the first control plane to register is
    /// not promoted. Only a registration on the configured default port or
    /// [`set_default`](Self::set_default) installs one.
    pub fn default(&self) -> Option<ControlPlaneId> {
        self.default
    }

    /// Set (or clear) the default control plane.
    ///
    /// Ignored if `id` is not registered.
    pub fn set_default(&mut self, id: Option<ControlPlaneId>) {
        match id {
            Some(id) if self.get(id).is_none() => {}
            _ => self.default = id,
        }
    }

    /// Iterate over control planes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ControlPlane> {
        self.entries.iter()
    }

    /// Ports of all registered control planes.
    pub fn ports(&self) -> Vec<u16> {
        self.entries.iter().map(|cp| cp.port).collect()
    }

    /// Get the number of registered control planes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ControlPlaneRegistry {
    fn default() -> Self {
        Self::new()
    }
}
