//! Control-plane-to-kernel multiplexer.
//!
//! One `poll(2)` loop over the notifier (slot 0) and every registered
//! control plane's channel. Database changes are mirrored into the
//! assignment table before each message is forwarded unmodified to the
//! kernel mapping socket.

use super::channel::{MAX_MESSAGE, MapChannel, is_benign_write_error};
use super::parse::{MAPM_ADD, MAPM_DELETE, MapHeader, extract_eid};
use crate::error::Result;
use crate::notify::Notifier;
use crate::registry::ControlPlaneId;
use crate::tables::Tables;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::AsFd;
use std::os::unix::net::UnixDatagram;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Initial number of control-plane slots in the wait set.
const WAIT_SET_INITIAL: usize = 16;

/// A control-plane channel being waited on.
#[derive(Debug, Clone)]
pub struct WaitEntry {
    pub id: ControlPlaneId,
    pub channel: Arc<UnixDatagram>,
    parked: bool,
}

/// Channels the multiplexer waits on, mirrored from the registry.
///
/// Storage starts at 16 entries and grows by half whenever a rebuild
/// needs more.
#[derive(Debug)]
pub struct WaitSet {
    entries: Vec<WaitEntry>,
    capacity: usize,
}

impl WaitSet {
    pub fn new() -> Self {
        WaitSet {
            entries: Vec::with_capacity(WAIT_SET_INITIAL),
            capacity: WAIT_SET_INITIAL,
        }
    }

    /// Replace the contents with `channels`, in order.
    pub fn rebuild(&mut self, channels: impl IntoIterator<Item = (ControlPlaneId, Arc<UnixDatagram>)>) {
        self.entries.clear();
        for (id, channel) in channels {
            if self.entries.len() == self.capacity {
                self.capacity = (self.capacity * 3).div_ceil(2);
                self.entries.reserve_exact(self.capacity - self.entries.len());
            }
            self.entries.push(WaitEntry {
                id,
                channel,
                parked: false,
            });
        }
    }

    /// Stop waiting on the entry for `id` until the next rebuild.
    pub fn park(&mut self, id: ControlPlaneId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.parked = true;
        }
    }

    /// Entries currently waited on.
    pub fn active(&self) -> impl Iterator<Item = &WaitEntry> {
        self.entries.iter().filter(|e| !e.parked)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Slots available before the next growth.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

/// What one `poll` round found.
#[derive(Debug, Default)]
struct Readiness {
    notified: bool,
    readable: Vec<WaitEntry>,
    hung_up: Vec<ControlPlaneId>,
}

pub struct MapEventMultiplexer<C> {
    notifier: Arc<Notifier>,
    tables: Arc<Tables>,
    kernel: Arc<C>,
    wait_set: WaitSet,
    buf: Vec<u8>,
}

impl<C: MapChannel> MapEventMultiplexer<C> {
    pub fn new(notifier: Arc<Notifier>, tables: Arc<Tables>, kernel: Arc<C>) -> Self {
        MapEventMultiplexer {
            notifier,
            tables,
            kernel,
            wait_set: WaitSet::new(),
            buf: vec![0u8; MAX_MESSAGE],
        }
    }

    /// Serve until `poll` fails.
    pub fn run(&mut self) -> Result<()> {
        self.refresh();
        info!("Map message multiplexer is listening");
        loop {
            self.poll_once(PollTimeout::NONE)?;
        }
    }

    /// Wait for readiness once and handle everything that is ready.
    /// Returns how many control-plane messages were handled.
    pub fn poll_once(&mut self, timeout: PollTimeout) -> Result<usize> {
        let readiness = match self.wait(timeout) {
            Ok(r) => r,
            Err(Errno::EINTR) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        for id in &readiness.hung_up {
            debug!(%id, "Control plane channel hung up, parked until next update");
            self.wait_set.park(*id);
        }

        if readiness.notified {
            self.refresh();
        }

        for entry in &readiness.readable {
            self.process_message(entry.id, &entry.channel);
        }
        Ok(readiness.readable.len())
    }

    /// The current wait set.
    pub fn wait_set(&self) -> &WaitSet {
        &self.wait_set
    }

    fn wait(&self, timeout: PollTimeout) -> std::result::Result<Readiness, Errno> {
        let active: Vec<&WaitEntry> = self.wait_set.active().collect();

        let mut fds = Vec::with_capacity(active.len() + 1);
        fds.push(PollFd::new(self.notifier.as_fd(), PollFlags::POLLIN));
        for entry in &active {
            fds.push(PollFd::new(entry.channel.as_fd(), PollFlags::POLLIN));
        }

        poll(&mut fds, timeout)?;

        let revents = |fd: &PollFd| fd.revents().unwrap_or(PollFlags::empty());
        let mut readiness = Readiness {
            notified: revents(&fds[0]).contains(PollFlags::POLLIN),
            ..Default::default()
        };

        // Snapshot ready channels; a refresh may replace the wait set
        for (entry, fd) in active.iter().zip(&fds[1..]) {
            let events = revents(fd);
            if events.contains(PollFlags::POLLIN) {
                readiness.readable.push((*entry).clone());
            } else if events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
                readiness.hung_up.push(entry.id);
            }
        }
        Ok(readiness)
    }

    /// Drain the notifier and mirror the registry into the wait set.
    fn refresh(&mut self) {
        self.notifier.drain();

        let previous = self.wait_set.len();
        let registry = self.tables.control_planes();
        self.wait_set
            .rebuild(registry.iter().map(|cp| (cp.id, Arc::clone(&cp.channel))));
        drop(registry);

        debug!(
            control_planes = self.wait_set.len(),
            previous, "Multiplexer wait set updated"
        );
    }

    fn process_message(&mut self, id: ControlPlaneId, channel: &UnixDatagram) {
        let len = match channel.recv(&mut self.buf) {
            Ok(len) => len,
            Err(e) => {
                warn!(%id, error = %e, "Failed to read from control plane channel");
                return;
            }
        };
        let msg = &self.buf[..len];

        let header = MapHeader::parse(msg);
        if let Some(header) = header
            && header.is_db_change()
        {
            mirror(&self.tables, id, &header, msg);
        }

        match self.kernel.send_message(msg) {
            Ok(_) => {}
            Err(e) if is_benign_write_error(&e) => {
                debug!(%id, error = %e, "Mapping socket declined message");
            }
            Err(e) => warn!(%id, error = %e, "Failed to write to mapping socket"),
        }

        debug!(%id, kind = ?header.map(|h| h.kind), len, "Multiplexed map message to data plane");
    }
}

/// Apply a database ADD/DELETE from control plane `id` to the assignment
/// table.
fn mirror(tables: &Tables, id: ControlPlaneId, header: &MapHeader, msg: &[u8]) {
    let eid = extract_eid(msg);
    let mut view = tables.write();

    if view.control_planes.get(id).is_none() {
        debug!(%id, %eid, "Control plane deregistered, assignment change ignored");
        return;
    }

    match header.kind {
        MAPM_ADD => {
            if let Err(e) = view.assignments.add(eid, id) {
                debug!(%id, error = %e, "Assignment not added");
            }
        }
        MAPM_DELETE => {
            view.assignments.remove(&eid, id);
        }
        _ => {}
    }
}
