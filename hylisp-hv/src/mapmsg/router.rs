//! Kernel-to-control-plane demultiplexer.
//!
//! Messages from the kernel mapping socket go to the control plane owning
//! their EID. Anything that does not resolve to exactly one owner (misses
//! for unassigned space, malformed or unknown messages) is broadcast.

use super::channel::{MAX_MESSAGE, MapChannel};
use super::parse::{extract_eid, extract_type};
use crate::registry::ControlPlaneId;
use crate::routing::Verdict;
use crate::tables::Tables;
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MapEventRouter<C> {
    kernel: Arc<C>,
    tables: Arc<Tables>,
}

impl<C: MapChannel> MapEventRouter<C> {
    pub fn new(kernel: Arc<C>, tables: Arc<Tables>) -> Self {
        MapEventRouter { kernel, tables }
    }

    /// Serve forever.
    pub fn run(&self) {
        let mut buf = vec![0u8; MAX_MESSAGE];
        loop {
            self.process_one(&mut buf);
        }
    }

    /// Read and deliver one kernel message.
    pub fn process_one(&self, buf: &mut [u8]) {
        match self.kernel.recv_message(buf) {
            Ok(len) => {
                self.deliver(&buf[..len]);
            }
            Err(e) => warn!(error = %e, "Failed to read from mapping socket"),
        }
    }

    /// Deliver `msg` to its owner, or to everyone. Returns how many control
    /// planes it was written to.
    pub fn deliver(&self, msg: &[u8]) -> usize {
        let eid = extract_eid(msg);
        let kind = extract_type(msg);

        let (targets, unicast) = {
            let view = self.tables.read();
            match view.route(&eid) {
                Verdict::One(id) => (
                    view.control_planes
                        .get(id)
                        .map(|cp| vec![(cp.id, Arc::clone(&cp.channel))])
                        .unwrap_or_default(),
                    true,
                ),
                verdict => {
                    debug!(?kind, %eid, ?verdict, "Unable to demultiplex map message, broadcasting");
                    (
                        view.control_planes
                            .iter()
                            .map(|cp| (cp.id, Arc::clone(&cp.channel)))
                            .collect::<Vec<_>>(),
                        false,
                    )
                }
            }
        };

        let mut delivered = 0;
        for (id, channel) in &targets {
            if send(*id, channel, msg) {
                delivered += 1;
            }
        }

        if unicast {
            debug!(?kind, %eid, delivered, "Demultiplexed map message");
        }
        delivered
    }
}

fn send(id: ControlPlaneId, channel: &UnixDatagram, msg: &[u8]) -> bool {
    match channel.send(msg) {
        Ok(_) => true,
        Err(e) => {
            warn!(%id, error = %e, "Failed to write map message to control plane");
            false
        }
    }
}
