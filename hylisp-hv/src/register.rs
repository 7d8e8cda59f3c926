//! Control-plane registration.
//!
//! Control planes announce themselves with a fixed-size datagram on the
//! registration endpoint. On REGISTER the hypervisor opens a dedicated reply
//! channel next to the control plane's own endpoint, records it, and answers
//! with an `ACK` carrying the shared control-packet sockets as
//! `SCM_RIGHTS`. DEREGISTER removes the control plane and everything it
//! owns.
//!
//! Only `cp_*` endpoints directly inside the socket directory are accepted,
//! and only sockets are ever unlinked.

use crate::config::{CONTROL_PLANE_SOCKET_PREFIX, Config};
use crate::error::{HvError, Result};
use crate::notify::Notifier;
use crate::registry::{Connection, ControlPlaneId};
use crate::tables::Tables;
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use std::ffi::OsStr;
use std::fs::{self, Permissions};
use std::io::{self, IoSlice};
use std::net::UdpSocket;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Size of a registration message.
pub const MESSAGE_SIZE: usize = 120;

/// Capacity of `sun_path`, including the terminating NUL.
pub const SUN_PATH_LEN: usize = 108;

/// Receive buffer; anything longer than a message is still caught as a
/// length mismatch.
const RECV_BUF_LEN: usize = 200;

/// Mode of every endpoint the hypervisor binds.
pub const SOCKET_MODE: u32 = 0o776;

/// Suffix appended to a control plane's endpoint path for the reply channel.
pub const REPLY_SUFFIX: &str = "_r";

/// Acknowledgement payload.
pub const ACK: &[u8] = b"ACK";

const ACTION_OFFSET: usize = 0;
const FAMILY_OFFSET: usize = 4;
const PATH_OFFSET: usize = 6;
const PORT_OFFSET: usize = 114;
const PID_OFFSET: usize = 116;

const AF_UNIX: u16 = nix::libc::AF_UNIX as u16;

/// Registration errors.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Message of wrong length ({0})")]
    WrongLength(usize),

    #[error("Unknown action ({0})")]
    UnknownAction(i32),

    #[error("Endpoint path is empty")]
    EmptyPath,

    #[error("Endpoint path too long: {0}")]
    PathTooLong(PathBuf),

    #[error("Endpoint {0} is not a control plane endpoint in the socket directory")]
    ForeignPath(PathBuf),

    #[error("Failed to connect reply channel {path}: {source}")]
    ReplyChannel { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Endpoint(#[from] HvError),

    #[error("Failed to acknowledge registration: {0}")]
    Ack(#[from] nix::errno::Errno),

    #[error("Control plane on port {0} is not registered")]
    NotRegistered(u16),
}

/// Requested operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Register,
    Deregister,
}

impl Action {
    fn code(&self) -> i32 {
        match self {
            Action::Register => 0,
            Action::Deregister => 1,
        }
    }
}

/// Decoded registration message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationMessage {
    pub action: Action,
    /// Datagram endpoint the control plane is bound to.
    pub peer_path: PathBuf,
    /// UDP port the control plane receives control packets on.
    pub port: u16,
    pub pid: i32,
}

impl RegistrationMessage {
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, RegistrationError> {
        let buf: &[u8; MESSAGE_SIZE] = buf
            .try_into()
            .map_err(|_| RegistrationError::WrongLength(buf.len()))?;

        let i32_at = |o: usize| i32::from_ne_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);

        let action = match i32_at(ACTION_OFFSET) {
            0 => Action::Register,
            1 => Action::Deregister,
            other => return Err(RegistrationError::UnknownAction(other)),
        };

        let raw_path = &buf[PATH_OFFSET..PATH_OFFSET + SUN_PATH_LEN];
        let end = raw_path.iter().position(|b| *b == 0).unwrap_or(SUN_PATH_LEN);
        let peer_path = PathBuf::from(OsStr::from_bytes(&raw_path[..end]));

        Ok(RegistrationMessage {
            action,
            peer_path,
            port: u16::from_ne_bytes([buf[PORT_OFFSET], buf[PORT_OFFSET + 1]]),
            pid: i32_at(PID_OFFSET),
        })
    }

    pub fn encode(&self) -> std::result::Result<[u8; MESSAGE_SIZE], RegistrationError> {
        let path = self.peer_path.as_os_str().as_bytes();
        if path.len() >= SUN_PATH_LEN {
            return Err(RegistrationError::PathTooLong(self.peer_path.clone()));
        }

        let mut buf = [0u8; MESSAGE_SIZE];
        buf[ACTION_OFFSET..ACTION_OFFSET + 4].copy_from_slice(&self.action.code().to_ne_bytes());
        buf[FAMILY_OFFSET..FAMILY_OFFSET + 2].copy_from_slice(&AF_UNIX.to_ne_bytes());
        buf[PATH_OFFSET..PATH_OFFSET + path.len()].copy_from_slice(path);
        buf[PORT_OFFSET..PORT_OFFSET + 2].copy_from_slice(&self.port.to_ne_bytes());
        buf[PID_OFFSET..PID_OFFSET + 4].copy_from_slice(&self.pid.to_ne_bytes());
        Ok(buf)
    }
}

/// Path of the reply channel for a control plane bound at `peer_path`.
pub fn reply_path(peer_path: &Path) -> PathBuf {
    let mut path = peer_path.as_os_str().to_owned();
    path.push(REPLY_SUFFIX);
    PathBuf::from(path)
}

/// Control-packet sockets handed to every control plane at registration.
#[derive(Debug, Clone)]
pub struct SharedSockets {
    pub ipv4: Arc<UdpSocket>,
    pub ipv6: Option<Arc<UdpSocket>>,
}

impl SharedSockets {
    /// Descriptors in transfer order: IPv4, then IPv6 when present.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        let mut fds = vec![self.ipv4.as_raw_fd()];
        if let Some(ipv6) = &self.ipv6 {
            fds.push(ipv6.as_raw_fd());
        }
        fds
    }
}

/// Unlink `path` if it is a socket. Anything else is left alone.
///
/// Returns true if a socket was removed.
pub fn remove_socket_file(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// True if `peer_path` names a control-plane endpoint directly inside
/// `socket_dir`.
pub fn is_control_plane_endpoint(peer_path: &Path, socket_dir: &Path) -> bool {
    let in_dir = peer_path.parent() == Some(socket_dir);
    let named = peer_path
        .file_name()
        .is_some_and(|name| name.as_bytes().starts_with(CONTROL_PLANE_SOCKET_PREFIX.as_bytes()));
    in_dir && named
}

/// Bind a datagram endpoint at `path` with the hypervisor's endpoint mode,
/// replacing a stale socket. Any other file at `path` makes the bind fail.
pub fn bind_endpoint(path: &Path) -> Result<UnixDatagram> {
    if remove_socket_file(path)? {
        debug!(path = %path.display(), "Removed stale endpoint");
    }

    let socket = UnixDatagram::bind(path).map_err(|source| HvError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE)).map_err(|source| {
        HvError::Permissions {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(socket)
}

/// Remove control-plane sockets left behind in `dir`. Returns how many
/// were removed.
pub fn remove_stale_endpoints(dir: &Path, prefix: &str) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().as_bytes().starts_with(prefix.as_bytes())
            && remove_socket_file(&entry.path())?
        {
            removed += 1;
        }
    }
    Ok(removed)
}

pub struct RegistrationService {
    socket: UnixDatagram,
    socket_dir: PathBuf,
    tables: Arc<Tables>,
    notifier: Arc<Notifier>,
    shared: SharedSockets,
}

impl RegistrationService {
    /// Prepare the socket directory and bind the registration endpoint.
    pub fn bind(
        config: &Config,
        tables: Arc<Tables>,
        notifier: Arc<Notifier>,
        shared: SharedSockets,
    ) -> Result<Self> {
        let socket_dir = &config.socket_dir;
        fs::create_dir_all(socket_dir)?;
        let stale = remove_stale_endpoints(socket_dir, CONTROL_PLANE_SOCKET_PREFIX)?;
        if stale > 0 {
            info!(count = stale, dir = %socket_dir.display(), "Removed stale control plane endpoints");
        }

        let endpoint = config.register_path();
        let socket = bind_endpoint(&endpoint)?;
        info!(path = %endpoint.display(), "Registration endpoint is listening");

        Ok(RegistrationService {
            socket,
            socket_dir: socket_dir.clone(),
            tables,
            notifier,
            shared,
        })
    }

    /// Serve until the endpoint fails.
    pub fn run(&self) -> Result<()> {
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            let len = self.socket.recv(&mut buf)?;
            self.handle(&buf[..len]);
        }
    }

    /// Handle one registration datagram. Failures are logged and the
    /// request dropped.
    pub fn handle(&self, datagram: &[u8]) {
        let msg = match RegistrationMessage::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Invalid registration message dropped");
                return;
            }
        };

        let result = match msg.action {
            Action::Register => self.register(&msg).map(|_| ()),
            Action::Deregister => self.deregister(&msg).map(|_| ()),
        };
        if let Err(e) = result {
            warn!(error = %e, port = msg.port, pid = msg.pid, "Registration request failed");
        }
    }

    /// Register the control plane described by `msg`.
    pub fn register(
        &self,
        msg: &RegistrationMessage,
    ) -> std::result::Result<ControlPlaneId, RegistrationError> {
        if msg.peer_path.as_os_str().is_empty() {
            return Err(RegistrationError::EmptyPath);
        }
        if !is_control_plane_endpoint(&msg.peer_path, &self.socket_dir) {
            return Err(RegistrationError::ForeignPath(msg.peer_path.clone()));
        }

        let path = reply_path(&msg.peer_path);
        if path.as_os_str().len() >= SUN_PATH_LEN {
            return Err(RegistrationError::PathTooLong(path));
        }

        let channel = open_reply_channel(&path, &msg.peer_path)?;
        let channel = Arc::new(channel);

        let id = self.tables.write().control_planes.add(Connection {
            channel: Arc::clone(&channel),
            port: msg.port,
            pid: msg.pid,
            reply_path: Some(path.clone()),
        });

        info!(%id, port = msg.port, pid = msg.pid, reply = %path.display(), "Control plane registered");

        // The multiplexer learns about the channel before the control plane
        // can use it
        self.notifier.signal();

        if let Err(e) = self.acknowledge(&channel) {
            self.remove(id);
            let _ = remove_socket_file(&path);
            self.notifier.signal();
            return Err(e);
        }
        Ok(id)
    }

    /// Deregister the control plane listening on `msg.port`.
    pub fn deregister(
        &self,
        msg: &RegistrationMessage,
    ) -> std::result::Result<ControlPlaneId, RegistrationError> {
        let removed = {
            let mut view = self.tables.write();
            match view.control_planes.slot_by_port(msg.port) {
                Some(slot) => view.control_planes.remove(slot).map(|cp| {
                    let assignments = view.assignments.remove_owner(cp.id);
                    (cp, assignments)
                }),
                None => None,
            }
        };

        self.notifier.signal();

        let Some((cp, assignments)) = removed else {
            debug!(port = msg.port, "Deregistration requested for unknown port");
            return Err(RegistrationError::NotRegistered(msg.port));
        };

        if let Some(path) = &cp.reply_path
            && let Err(e) = remove_socket_file(path)
        {
            debug!(path = %path.display(), error = %e, "Failed to remove reply endpoint");
        }

        info!(id = %cp.id, port = cp.port, assignments, "Control plane deregistered");
        Ok(cp.id)
    }

    fn acknowledge(&self, channel: &UnixDatagram) -> std::result::Result<(), RegistrationError> {
        let fds = self.shared.raw_fds();
        let iov = [IoSlice::new(ACK)];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(channel.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
        debug!(descriptors = fds.len(), "Registration acknowledged");
        Ok(())
    }

    fn remove(&self, id: ControlPlaneId) {
        let mut view = self.tables.write();
        if let Some(slot) = view.control_planes.slot_of(id) {
            view.control_planes.remove(slot);
            view.assignments.remove_owner(id);
        }
    }
}

fn open_reply_channel(path: &Path, peer: &Path) -> std::result::Result<UnixDatagram, RegistrationError> {
    let channel = bind_endpoint(path)?;
    if let Err(source) = channel.connect(peer) {
        let _ = remove_socket_file(path);
        return Err(RegistrationError::ReplyChannel {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(channel)
}
