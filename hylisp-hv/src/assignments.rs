//! EID ownership assignments.

use crate::eid::{EidPrefix, MAX_PREFIX_LEN};
use crate::registry::ControlPlaneId;
use crate::routing::{self, Assignment, Sorting};
use thiserror::Error;
use tracing::debug;

/// Initial capacity of the assignment table.
const INITIAL_CAPACITY: usize = 128;

/// Assignment errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("EID {0} is not a routable prefix")]
    NotRoutable(EidPrefix),
}

/// Table of EID prefixes and their owning control planes, in insertion order.
///
/// Not synchronized by itself; [`crate::tables::Tables`] owns it behind a
/// reader/writer lock, and every mutation needs the write guard.
#[derive(Debug)]
pub struct AssignmentTable {
    entries: Vec<Assignment>,
}

impl AssignmentTable {
    /// Create an empty table.
    pub fn new() -> Self {
        AssignmentTable {
            entries: Vec::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Assign `eid` to `owner`.
    ///
    /// An existing entry with the same prefix and length is handed over to
    /// `owner` in place. Returns the entry's position.
    pub fn add(&mut self, eid: EidPrefix, owner: ControlPlaneId) -> Result<usize, AssignmentError> {
        if !eid.is_valid() || (eid.is_zero() && eid.len() == MAX_PREFIX_LEN) {
            return Err(AssignmentError::NotRoutable(eid));
        }

        if let Some(i) = self.find_exact(&eid) {
            debug!(%eid, %owner, previous = %self.entries[i].owner, index = i, "Assignment overwritten");
            self.entries[i].owner = owner;
            return Ok(i);
        }

        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve_exact(self.entries.capacity().max(1));
        }
        self.entries.push(Assignment { eid, owner });
        let index = self.entries.len() - 1;
        debug!(%eid, %owner, index, "New assignment registered");
        Ok(index)
    }

    /// Withdraw `eid` if, and only if, it is currently owned by `owner`.
    ///
    /// Returns true if an entry was removed.
    pub fn remove(&mut self, eid: &EidPrefix, owner: ControlPlaneId) -> bool {
        let Some(i) = self.find_exact(eid) else {
            debug!(%eid, %owner, "Assignment not removed: not present");
            return false;
        };

        if self.entries[i].owner != owner {
            debug!(
                %eid,
                %owner,
                assignee = %self.entries[i].owner,
                "Assignment not removed: requested by another control plane"
            );
            return false;
        }

        self.entries.remove(i);
        debug!(%eid, %owner, index = i, "Assignment removed");
        true
    }

    /// Remove every assignment owned by `owner`. Returns how many went.
    pub fn remove_owner(&mut self, owner: ControlPlaneId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|a| a.owner != owner);
        before - self.entries.len()
    }

    /// Position of the entry with exactly this prefix and length.
    fn find_exact(&self, eid: &EidPrefix) -> Option<usize> {
        if eid.is_zero() && eid.len() == 0 {
            // The matcher answers All for ::/0 without scanning
            return self.entries.iter().position(|a| a.eid.len() == 0);
        }
        match routing::sort(&self.entries, eid, true) {
            Sorting::One(i) => Some(i),
            _ => None,
        }
    }

    /// Scan the table for `probe`.
    pub fn sort(&self, probe: &EidPrefix, exact: bool) -> Sorting {
        routing::sort(&self.entries, probe, exact)
    }

    /// Assignments in insertion order.
    pub fn entries(&self) -> &[Assignment] {
        &self.entries
    }

    /// Get the entry at `index`.
    pub fn get(&self, index: usize) -> Option<&Assignment> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current storage capacity.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

impl Default for AssignmentTable {
    fn default() -> Self {
        Self::new()
    }
}
