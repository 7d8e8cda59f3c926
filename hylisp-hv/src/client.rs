//! Control-plane side of the registration handshake.
//!
//! A control plane binds its own datagram endpoint in the socket directory,
//! sends REGISTER to the hypervisor and waits for the `ACK`, which carries
//! the shared control-packet sockets. From then on its endpoint is connected
//! to the hypervisor's reply channel: mapping messages it sends go to the
//! kernel, and kernel messages for its EID space arrive on it.

use crate::config::{CONTROL_PLANE_SOCKET_PREFIX, Config};
use crate::error::{HvError, Result};
use crate::register::{
    ACK, Action, RegistrationMessage, SUN_PATH_LEN, bind_endpoint, reply_path,
};
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use std::fs;
use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait for the hypervisor's acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

static ENDPOINT_SEQ: AtomicU32 = AtomicU32::new(0);

/// Fresh endpoint path inside `dir`, unique within this host.
pub fn endpoint_path(dir: &Path) -> PathBuf {
    let seq = ENDPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(
        "{CONTROL_PLANE_SOCKET_PREFIX}{}_{seq}",
        std::process::id()
    ))
}

/// A registered control plane.
#[derive(Debug)]
pub struct ControlPlaneClient {
    channel: UnixDatagram,
    endpoint: PathBuf,
    register_path: PathBuf,
    port: u16,
    ipv4: OwnedFd,
    ipv6: Option<OwnedFd>,
}

impl ControlPlaneClient {
    /// Register with the hypervisor described by `config`, receiving control
    /// packets on `port`.
    pub fn register(config: &Config, port: u16) -> Result<Self> {
        Self::register_at(&config.register_path(), endpoint_path(&config.socket_dir), port)
    }

    /// Register through the endpoint at `register_path`, binding our own
    /// endpoint at `endpoint`.
    pub fn register_at(register_path: &Path, endpoint: PathBuf, port: u16) -> Result<Self> {
        if reply_path(&endpoint).as_os_str().len() >= SUN_PATH_LEN {
            return Err(HvError::PathTooLong(endpoint));
        }

        let channel = bind_endpoint(&endpoint)?;
        match handshake(&channel, register_path, &endpoint, port) {
            Ok((ipv4, ipv6)) => {
                info!(port, endpoint = %endpoint.display(), "Registered with hypervisor");
                Ok(ControlPlaneClient {
                    channel,
                    endpoint,
                    register_path: register_path.to_path_buf(),
                    port,
                    ipv4,
                    ipv6,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&endpoint);
                Err(e)
            }
        }
    }

    /// Channel connected to the hypervisor's reply endpoint.
    pub fn channel(&self) -> &UnixDatagram {
        &self.channel
    }

    /// Send a mapping message towards the kernel.
    pub fn send(&self, msg: &[u8]) -> io::Result<usize> {
        self.channel.send(msg)
    }

    /// Receive a mapping message routed to this control plane.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.recv(buf)
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shared IPv4 control-packet socket.
    pub fn ipv4_socket(&self) -> &OwnedFd {
        &self.ipv4
    }

    /// Shared IPv6 control-packet socket, when the hypervisor has one.
    pub fn ipv6_socket(&self) -> Option<&OwnedFd> {
        self.ipv6.as_ref()
    }

    /// Deregister and remove our endpoint.
    pub fn deregister(self) -> Result<()> {
        let msg = RegistrationMessage {
            action: Action::Deregister,
            peer_path: self.endpoint.clone(),
            port: self.port,
            pid: std::process::id() as i32,
        };
        let bytes = msg.encode().map_err(|_| HvError::PathTooLong(self.endpoint.clone()))?;
        let sent = self.channel.send_to(&bytes, &self.register_path);

        if let Err(e) = fs::remove_file(&self.endpoint) {
            debug!(path = %self.endpoint.display(), error = %e, "Failed to remove endpoint");
        }
        sent?;
        info!(port = self.port, "Deregistered from hypervisor");
        Ok(())
    }
}

fn handshake(
    channel: &UnixDatagram,
    register_path: &Path,
    endpoint: &Path,
    port: u16,
) -> Result<(OwnedFd, Option<OwnedFd>)> {
    let msg = RegistrationMessage {
        action: Action::Register,
        peer_path: endpoint.to_path_buf(),
        port,
        pid: std::process::id() as i32,
    };
    let bytes = msg
        .encode()
        .map_err(|_| HvError::PathTooLong(endpoint.to_path_buf()))?;
    channel.send_to(&bytes, register_path)?;

    channel.set_read_timeout(Some(ACK_TIMEOUT))?;
    let fds = receive_ack(channel)?;
    channel.set_read_timeout(None)?;

    channel.connect(reply_path(endpoint))?;

    let mut fds = fds.into_iter();
    let ipv4 = fds
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "ACK without descriptors"))?;
    Ok((ipv4, fds.next()))
}

fn receive_ack(channel: &UnixDatagram) -> Result<Vec<OwnedFd>> {
    let mut buf = [0u8; 5];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg = nix::cmsg_space!([RawFd; 2]);

    let (len, raw) = {
        let msg = recvmsg::<()>(
            channel.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )?;
        let mut raw = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                raw.extend(fds);
            }
        }
        (msg.bytes, raw)
    };

    // SAFETY: descriptors passed via SCM_RIGHTS are new and owned by us.
    let fds: Vec<OwnedFd> = raw
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if &buf[..len] != ACK {
        warn!(len, "Unexpected reply to registration");
        return Err(io::Error::new(io::ErrorKind::InvalidData, "registration not acknowledged").into());
    }
    debug!(descriptors = fds.len(), "Registration acknowledged");
    Ok(fds)
}
