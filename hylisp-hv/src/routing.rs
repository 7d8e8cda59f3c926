//! LPM (Longest Prefix Match) over EID assignments.
//!
//! This module provides:
//! - `Assignment`: an EID prefix owned by a control plane
//! - `Sorting`: raw result of scanning an assignment table
//! - `sort`: the prefix matcher itself (pure, no I/O)
//! - `Verdict`: the routing outcome once the registry has been consulted

use crate::eid::{EidPrefix, MAX_PREFIX_LEN};
use crate::registry::ControlPlaneId;

/// Masks for the leftover bits of a prefix that does not end on a byte.
const PARTIAL_MASKS: [u8; 8] = [0x00, 0x80, 0xc0, 0xe0, 0xf0, 0xf8, 0xfc, 0xfe];

/// An EID prefix and the control plane that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub eid: EidPrefix,
    pub owner: ControlPlaneId,
}

/// Result of scanning an assignment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sorting {
    /// The entry at this position is the best match.
    One(usize),
    /// No entry matches.
    Non,
    /// The probe addresses every control plane.
    All,
    /// The probe can never be matched.
    Err,
}

/// Routing outcome for an EID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Route to the owner of the best matching assignment.
    One(ControlPlaneId),
    /// No assignment matched; route to the default control plane, if any.
    Non(Option<ControlPlaneId>),
    /// Route to every registered control plane.
    All,
    /// Cannot be routed.
    Err,
}

/// Returns true if `probe` falls within `candidate`.
///
/// Only the first `candidate.len()` bits are compared; a candidate longer
/// than the probe never matches.
#[inline]
pub fn covers(candidate: &EidPrefix, probe: &EidPrefix) -> bool {
    let len = candidate.len().min(MAX_PREFIX_LEN);
    if probe.len() < len {
        return false;
    }

    let whole_bytes = (len / 8) as usize;
    let left_bits = (len % 8) as usize;
    let (c, p) = (candidate.octets(), probe.octets());

    if c[..whole_bytes] != p[..whole_bytes] {
        return false;
    }
    if left_bits == 0 {
        return true;
    }

    let mask = PARTIAL_MASKS[left_bits];
    c[whole_bytes] & mask == p[whole_bytes] & mask
}

/// Find the assignment that routes `probe`.
///
/// With `exact` set, only entries with the same prefix length are
/// candidates; this mode is for table maintenance, never for live routing.
/// Among several matches of the same length the one scanned last (latest
/// insertion) wins. Callers should not rely on that order.
pub fn sort(assignments: &[Assignment], probe: &EidPrefix, exact: bool) -> Sorting {
    if probe.is_zero() {
        match probe.len() {
            0 => return Sorting::All,
            MAX_PREFIX_LEN => return Sorting::Err,
            _ => {}
        }
    }

    let mut best: Option<(usize, u8)> = None;

    for (i, entry) in assignments.iter().enumerate() {
        if exact && entry.eid.len() != probe.len() {
            continue;
        }
        if !covers(&entry.eid, probe) {
            continue;
        }
        if best.is_none_or(|(_, len)| entry.eid.len() >= len) {
            best = Some((i, entry.eid.len()));
        }
    }

    match best {
        Some((i, _)) => Sorting::One(i),
        None => Sorting::Non,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(prefix: &str, owner: u32) -> Assignment {
        Assignment {
            eid: prefix.parse().unwrap(),
            owner: ControlPlaneId(owner),
        }
    }

    fn probe(prefix: &str) -> EidPrefix {
        prefix.parse().unwrap()
    }

    #[test]
    fn test_lpm_prefers_longest() {
        let table = vec![
            assignment("::ffff:10.0.0.0/104", 1),
            assignment("::ffff:10.1.0.0/112", 2),
            assignment("::ffff:0.0.0.0/96", 3),
        ];

        assert_eq!(sort(&table, &probe("::ffff:10.1.2.3"), false), Sorting::One(1));
        assert_eq!(sort(&table, &probe("::ffff:10.2.3.4"), false), Sorting::One(0));
        assert_eq!(sort(&table, &probe("::ffff:192.168.1.1"), false), Sorting::One(2));
        assert_eq!(sort(&table, &probe("2001:db8::1"), false), Sorting::Non);
    }

    #[test]
    fn test_partial_byte_prefix() {
        // /107 ends three bits into byte 13
        let table = vec![assignment("::ffff:10.224.0.0/107", 1)];

        assert_eq!(sort(&table, &probe("::ffff:10.255.0.1"), false), Sorting::One(0));
        assert_eq!(sort(&table, &probe("::ffff:10.224.0.1"), false), Sorting::One(0));
        assert_eq!(sort(&table, &probe("::ffff:10.192.0.1"), false), Sorting::Non);
    }

    #[test]
    fn test_shorter_probe_does_not_match_longer_entry() {
        let table = vec![assignment("2001:db8:1::/48", 1)];
        assert_eq!(sort(&table, &probe("2001:db8::/32"), false), Sorting::Non);
        assert_eq!(sort(&table, &probe("2001:db8:1:2::/64"), false), Sorting::One(0));
    }

    #[test]
    fn test_host_bits_ignored() {
        // Bits past the entry's length differ but are not compared
        let table = vec![assignment("2001:db8::ffff/32", 1)];
        assert_eq!(sort(&table, &probe("2001:db8:abcd::1"), false), Sorting::One(0));
    }

    #[test]
    fn test_exact_requires_same_length() {
        let table = vec![
            assignment("2001:db8::/32", 1),
            assignment("2001:db8::/48", 2),
        ];

        assert_eq!(sort(&table, &probe("2001:db8::/32"), true), Sorting::One(0));
        assert_eq!(sort(&table, &probe("2001:db8::/48"), true), Sorting::One(1));
        assert_eq!(sort(&table, &probe("2001:db8::/40"), true), Sorting::Non);
        assert_eq!(sort(&table, &probe("2001:db9::/32"), true), Sorting::Non);
    }

    #[test]
    fn test_zero_probe() {
        let table = vec![assignment("::/0", 1), assignment("2001:db8::/32", 2)];

        assert_eq!(sort(&table, &EidPrefix::broadcast(crate::eid::Reason::Valid), false), Sorting::All);
        assert_eq!(sort(&table, &probe("::/128"), false), Sorting::Err);
        assert_eq!(sort(&[], &probe("::/128"), true), Sorting::Err);

        // Other zero-address lengths are matched normally
        assert_eq!(sort(&table, &probe("::/64"), false), Sorting::One(0));
    }

    #[test]
    fn test_tie_break_last_scanned() {
        // Same prefix twice can only happen by bypassing the table; the
        // later entry wins
        let table = vec![assignment("2001:db8::/32", 1), assignment("2001:db8::/32", 2)];
        assert_eq!(sort(&table, &probe("2001:db8::1"), false), Sorting::One(1));
    }

    #[test]
    fn test_empty_table() {
        assert_eq!(sort(&[], &probe("2001:db8::1"), false), Sorting::Non);
    }

    #[test]
    fn test_lpm_never_shorter_than_available() {
        let table: Vec<_> = (0..=16u8)
            .map(|i| Assignment {
                eid: EidPrefix::new("2001:db8:ffff:ffff::".parse().unwrap(), 32 + i * 4),
                owner: ControlPlaneId(i as u32),
            })
            .collect();

        let p = probe("2001:db8:ffff:ffff::1");
        match sort(&table, &p, false) {
            Sorting::One(i) => assert_eq!(table[i].eid.len(), 96),
            other => panic!("expected a match, got {other:?}"),
        }
    }
}
