//! Kernel mapping-socket messages.
//!
//! A message is a fixed header followed by the socket address structures
//! its `addrs` bitmap announces, in order (EID, EID mask, ...). Everything
//! is in host byte order except the addresses themselves.

use crate::eid::{EidPrefix, IPV4_MAPPED_OFFSET, MAX_PREFIX_LEN, Reason};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 28;

/// Message types.
pub const MAPM_ADD: u16 = 0x01;
pub const MAPM_DELETE: u16 = 0x02;
pub const MAPM_MISS_HEADER: u16 = 0x07;

/// Message flags.
pub const MAPF_DB: u32 = 0x001;

/// Address bits.
pub const MAPA_EID: u16 = 0x01;
pub const MAPA_EIDMASK: u16 = 0x02;

const AF_INET: u16 = nix::libc::AF_INET as u16;
const AF_INET6: u16 = nix::libc::AF_INET6 as u16;

/// Space taken by an IPv4 socket address structure.
const SA_SIZE_INET: usize = 16;
/// Space taken by any other socket address structure.
const SA_SIZE_OTHER: usize = 32;

/// Offset of the address in `sockaddr_in` and `sockaddr_in6`.
const SIN_ADDR_OFFSET: usize = 4;
const SIN6_ADDR_OFFSET: usize = 8;

/// Offset of the source address in IPv4 and IPv6 headers.
const IPV4_SRC_OFFSET: usize = 12;
const IPV6_SRC_OFFSET: usize = 8;

/// Fixed header of a mapping message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapHeader {
    pub msglen: u8,
    pub version: u8,
    pub kind: u16,
    pub flags: u32,
    pub addrs: u16,
    pub versioning: u16,
    pub rloc_count: i32,
    pub pid: i32,
    pub seq: i32,
    pub errno: i32,
}

impl MapHeader {
    /// Decode the header at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(..HEADER_SIZE)?;
        let u16_at = |o: usize| u16::from_ne_bytes([buf[o], buf[o + 1]]);
        let u32_at = |o: usize| u32::from_ne_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);

        Some(MapHeader {
            msglen: buf[0],
            version: buf[1],
            kind: u16_at(2),
            flags: u32_at(4),
            addrs: u16_at(8),
            versioning: u16_at(10),
            rloc_count: u32_at(12) as i32,
            pid: u32_at(16) as i32,
            seq: u32_at(20) as i32,
            errno: u32_at(24) as i32,
        })
    }

    /// Encode into the wire layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.msglen;
        buf[1] = self.version;
        buf[2..4].copy_from_slice(&self.kind.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_ne_bytes());
        buf[8..10].copy_from_slice(&self.addrs.to_ne_bytes());
        buf[10..12].copy_from_slice(&self.versioning.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.rloc_count.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.pid.to_ne_bytes());
        buf[20..24].copy_from_slice(&self.seq.to_ne_bytes());
        buf[24..28].copy_from_slice(&self.errno.to_ne_bytes());
        buf
    }

    /// True for database changes the assignment table mirrors.
    pub fn is_db_change(&self) -> bool {
        self.flags & MAPF_DB != 0 && matches!(self.kind, MAPM_ADD | MAPM_DELETE)
    }
}

/// Message type, if the header is complete.
pub fn extract_type(buf: &[u8]) -> Option<u16> {
    MapHeader::parse(buf).map(|h| h.kind)
}

/// Message flags, if the header is complete.
pub fn extract_flags(buf: &[u8]) -> Option<u32> {
    MapHeader::parse(buf).map(|h| h.flags)
}

/// Extract the EID a mapping message is about.
pub fn extract_eid(buf: &[u8]) -> EidPrefix {
    let Some(header) = MapHeader::parse(buf) else {
        return EidPrefix::undefined(Reason::Malformed);
    };
    if header.versioning != 0 {
        return EidPrefix::undefined(Reason::UnsupportedVersion);
    }

    match header.kind {
        MAPM_ADD | MAPM_DELETE => add_delete_eid(&header, buf),
        MAPM_MISS_HEADER => miss_eid(&header, buf),
        _ => EidPrefix::undefined(Reason::UnknownType),
    }
}

fn add_delete_eid(header: &MapHeader, buf: &[u8]) -> EidPrefix {
    if header.addrs & MAPA_EID == 0 {
        return EidPrefix::undefined(Reason::NoEid);
    }
    let has_mask = header.addrs & MAPA_EIDMASK != 0;

    let offset = HEADER_SIZE;
    let Some(family) = family_at(buf, offset) else {
        return EidPrefix::undefined(Reason::Malformed);
    };

    let (addr_offset, addr_len) = match family {
        AF_INET => (SIN_ADDR_OFFSET, 4),
        AF_INET6 => (SIN6_ADDR_OFFSET, 16),
        _ => return EidPrefix::undefined(Reason::UnknownAddressFamily),
    };

    let Some(addr) = buf.get(offset + addr_offset..offset + addr_offset + addr_len) else {
        return EidPrefix::undefined(Reason::Malformed);
    };

    let len = if has_mask {
        let mask_offset = offset + sa_size(family) + addr_offset;
        match buf.get(mask_offset..mask_offset + addr_len) {
            Some(mask) => mask_prefix_len(mask),
            None => return EidPrefix::undefined(Reason::Malformed),
        }
    } else {
        addr_len as u8 * 8
    };

    match family {
        AF_INET => {
            let octets: [u8; 4] = [addr[0], addr[1], addr[2], addr[3]];
            EidPrefix::new(Ipv4Addr::from(octets).to_ipv6_mapped(), len + IPV4_MAPPED_OFFSET)
        }
        _ => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            EidPrefix::new(Ipv6Addr::from(octets), len)
        }
    }
}

fn miss_eid(header: &MapHeader, buf: &[u8]) -> EidPrefix {
    let mut offset = HEADER_SIZE;
    for bit in [MAPA_EID, MAPA_EIDMASK] {
        if header.addrs & bit != 0 {
            let Some(family) = family_at(buf, offset) else {
                return EidPrefix::undefined(Reason::Malformed);
            };
            offset += sa_size(family);
        }
    }

    let Some(&first) = buf.get(offset) else {
        return EidPrefix::undefined(Reason::Malformed);
    };

    match first >> 4 {
        4 => {
            let start = offset + IPV4_SRC_OFFSET;
            match buf.get(start..start + 4) {
                Some(a) => EidPrefix::host(Ipv4Addr::new(a[0], a[1], a[2], a[3]).to_ipv6_mapped()),
                None => EidPrefix::undefined(Reason::Malformed),
            }
        }
        6 => {
            let start = offset + IPV6_SRC_OFFSET;
            match buf.get(start..start + 16) {
                Some(a) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(a);
                    EidPrefix::host(Ipv6Addr::from(octets))
                }
                None => EidPrefix::undefined(Reason::Malformed),
            }
        }
        _ => EidPrefix::undefined(Reason::UnknownAddressFamily),
    }
}

fn family_at(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_ne_bytes([bytes[0], bytes[1]]))
}

fn sa_size(family: u16) -> usize {
    if family == AF_INET {
        SA_SIZE_INET
    } else {
        SA_SIZE_OTHER
    }
}

/// Prefix length of a netmask: whole 0xff bytes, then the leading set bits
/// of the first other byte.
fn mask_prefix_len(mask: &[u8]) -> u8 {
    let mut len = 0u8;
    for &byte in mask {
        if byte == 0xff {
            len += 8;
            continue;
        }
        len += byte.leading_ones().min(7) as u8;
        break;
    }
    len.min(MAX_PREFIX_LEN)
}
