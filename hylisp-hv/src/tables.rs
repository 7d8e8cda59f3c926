//! Shared routing state.
//!
//! `Tables` owns the control-plane registry and the assignment table, each
//! behind its own reader/writer lock. Both locks are always taken registry
//! first; the guard pairs returned here make that the only way to hold both.
//! Callers decide under the guards, drop them, and only then do I/O.

use crate::assignments::AssignmentTable;
use crate::eid::EidPrefix;
use crate::registry::ControlPlaneRegistry;
use crate::routing::{Sorting, Verdict};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registry and assignments shared by every component.
#[derive(Debug, Default)]
pub struct Tables {
    control_planes: RwLock<ControlPlaneRegistry>,
    assignments: RwLock<AssignmentTable>,
}

/// Read guards on both tables.
pub struct TablesRead<'a> {
    pub control_planes: RwLockReadGuard<'a, ControlPlaneRegistry>,
    pub assignments: RwLockReadGuard<'a, AssignmentTable>,
}

/// Write guards on both tables.
pub struct TablesWrite<'a> {
    pub control_planes: RwLockWriteGuard<'a, ControlPlaneRegistry>,
    pub assignments: RwLockWriteGuard<'a, AssignmentTable>,
}

impl Tables {
    /// Create empty tables.
    pub fn new() -> Self {
        Self::with_registry(ControlPlaneRegistry::new())
    }

    /// Create tables around an existing registry.
    pub fn with_registry(registry: ControlPlaneRegistry) -> Self {
        Tables {
            control_planes: RwLock::new(registry),
            assignments: RwLock::new(AssignmentTable::new()),
        }
    }

    /// Acquire both read locks, registry first.
    pub fn read(&self) -> TablesRead<'_> {
        let control_planes = self
            .control_planes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let assignments = self
            .assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        TablesRead {
            control_planes,
            assignments,
        }
    }

    /// Acquire both write locks, registry first.
    pub fn write(&self) -> TablesWrite<'_> {
        let control_planes = self
            .control_planes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let assignments = self
            .assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        TablesWrite {
            control_planes,
            assignments,
        }
    }

    /// Acquire only the registry read lock.
    pub fn control_planes(&self) -> RwLockReadGuard<'_, ControlPlaneRegistry> {
        self.control_planes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the route for `eid` (takes and releases both read locks).
    pub fn route(&self, eid: &EidPrefix) -> Verdict {
        self.read().route(eid)
    }
}

impl TablesRead<'_> {
    /// Longest-prefix routing decision for `eid`.
    ///
    /// With no control plane registered nothing is routable.
    pub fn route(&self, eid: &EidPrefix) -> Verdict {
        if self.control_planes.is_empty() {
            return Verdict::Err;
        }

        match self.assignments.sort(eid, false) {
            Sorting::One(i) => match self.assignments.get(i) {
                Some(a) => Verdict::One(a.owner),
                None => Verdict::Err,
            },
            Sorting::Non => Verdict::Non(self.control_planes.default()),
            Sorting::All => Verdict::All,
            Sorting::Err => Verdict::Err,
        }
    }
}
