//! Control-packet demultiplexer.
//!
//! Listens on the LISP control port, extracts the EID from each datagram
//! and re-injects the datagram towards the UDP port of the control plane
//! that owns it. The routing decision is taken under the table read locks;
//! injection happens after they are released.

use super::inject::Inject;
use super::parse::extract_eid;
use crate::eid::EidPrefix;
use crate::error::{HvError, Result};
use crate::registry::ControlPlaneId;
use crate::routing::Verdict;
use crate::tables::Tables;
use nix::sys::socket::{
    ControlMessageOwned, MsgFlags, SockaddrIn, recvmsg, setsockopt, sockopt,
};
use std::io::IoSliceMut;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Largest datagram the listener accepts.
const MAX_DATAGRAM: usize = 65535;

/// Where a control packet goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Inject to a single control plane's port.
    Unicast { port: u16, default: bool },
    /// Inject once per listed port.
    Broadcast(Vec<u16>),
    /// Nobody can take it.
    Drop,
}

/// Decide where a packet with `eid` goes. Takes and releases the read locks.
pub fn decide(tables: &Tables, eid: &EidPrefix) -> RouteDecision {
    let view = tables.read();
    let port_of = |id: ControlPlaneId| view.control_planes.get(id).map(|cp| cp.port);

    match view.route(eid) {
        Verdict::One(id) => match port_of(id) {
            Some(port) => RouteDecision::Unicast {
                port,
                default: false,
            },
            None => RouteDecision::Drop,
        },
        Verdict::Non(Some(id)) => match port_of(id) {
            Some(port) => RouteDecision::Unicast {
                port,
                default: true,
            },
            None => RouteDecision::Drop,
        },
        Verdict::All => RouteDecision::Broadcast(view.control_planes.ports()),
        Verdict::Non(None) | Verdict::Err => RouteDecision::Drop,
    }
}

/// A datagram received on the control port.
#[derive(Debug, Clone, Copy)]
pub struct Received {
    pub len: usize,
    pub source: SocketAddrV4,
    pub destination: Ipv4Addr,
}

/// IPv4 control-packet router.
pub struct ControlPacketRouter<I> {
    socket: Arc<UdpSocket>,
    tables: Arc<Tables>,
    injector: I,
}

/// Bind the IPv4 control listener with destination-address reporting on.
pub fn bind_control_socket(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    setsockopt(&socket, sockopt::Ipv4PacketInfo, &true)?;
    info!(port, "Control packet listener bound");
    Ok(socket)
}

impl<I: Inject> ControlPacketRouter<I> {
    pub fn new(socket: Arc<UdpSocket>, tables: Arc<Tables>, injector: I) -> Self {
        ControlPacketRouter {
            socket,
            tables,
            injector,
        }
    }

    /// Serve forever. Per-datagram failures are logged.
    pub fn run(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if let Err(e) = self.process_one(&mut buf) {
                warn!(error = %e, "Control packet dropped");
            }
        }
    }

    /// Receive and route one datagram.
    pub fn process_one(&self, buf: &mut [u8]) -> Result<()> {
        let received = self.receive(buf)?;
        self.route(&received, &buf[..received.len]);
        Ok(())
    }

    fn receive(&self, buf: &mut [u8]) -> Result<Received> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg_buf = nix::cmsg_space!(nix::libc::in_pktinfo);

        let msg = recvmsg::<SockaddrIn>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )?;

        let source = msg
            .address
            .map(SocketAddrV4::from)
            .ok_or_else(|| HvError::Io(std::io::Error::other("datagram without source address")))?;

        let mut destination = None;
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
                destination = Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
            }
        }
        let destination = destination.unwrap_or_else(|| {
            debug!(%source, "No destination address reported, assuming localhost");
            Ipv4Addr::LOCALHOST
        });

        Ok(Received {
            len: msg.bytes,
            source,
            destination,
        })
    }

    /// Route a received datagram.
    pub fn route(&self, received: &Received, payload: &[u8]) {
        let eid = extract_eid(payload);
        let decision = decide(&self.tables, &eid);

        debug!(
            source = %received.source,
            destination = %received.destination,
            %eid,
            ?decision,
            "Demultiplexing control packet"
        );

        match decision {
            RouteDecision::Unicast { port, .. } => self.inject(received, port, payload),
            RouteDecision::Broadcast(ports) => {
                for port in ports {
                    self.inject(received, port, payload);
                }
            }
            RouteDecision::Drop => {
                debug!(%eid, source = %received.source, "Unable to demultiplex control packet");
            }
        }
    }

    fn inject(&self, received: &Received, port: u16, payload: &[u8]) {
        let destination = SocketAddrV4::new(received.destination, port);
        if let Err(e) = self.injector.inject(received.source, destination, payload) {
            warn!(error = %e, %destination, "Failed to inject control packet");
        }
    }
}
