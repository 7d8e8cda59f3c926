//! EID extraction from LISP control packets.
//!
//! Only the fields needed to pick a control plane are read. Map-Requests
//! yield the first record's EID prefix, Encapsulated Control Messages are
//! unwrapped and parsed again, and Map-Replies and Map-Notifies map to the
//! broadcast EID so every control plane sees them.

use crate::eid::{EidPrefix, IPV4_MAPPED_OFFSET, MAX_PREFIX_LEN, Reason};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// LISP control message types (high nibble of the first byte).
pub const TYPE_MAP_REQUEST: u8 = 1;
pub const TYPE_MAP_REPLY: u8 = 2;
pub const TYPE_MAP_REGISTER: u8 = 3;
pub const TYPE_MAP_NOTIFY: u8 = 4;
pub const TYPE_ENCAPSULATED: u8 = 8;

/// Address family identifiers.
const AFI_EMPTY: u16 = 0;
const AFI_IPV4: u16 = 1;
const AFI_IPV6: u16 = 2;

/// Map-Request fields start after type, flags, IRC, record count and nonce.
const MAP_REQUEST_FIXED_LEN: usize = 12;

/// ECM header preceding the inner IP packet.
const ECM_HEADER_LEN: usize = 4;

const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// Extract the EID that decides which control plane gets `datagram`.
pub fn extract_eid(datagram: &[u8]) -> EidPrefix {
    let Some(&first) = datagram.first() else {
        return EidPrefix::undefined(Reason::Malformed);
    };

    let kind = first >> 4;
    debug!(kind, len = datagram.len(), "Processing control packet");

    match kind {
        TYPE_MAP_REQUEST => map_request_eid(datagram),
        TYPE_MAP_REPLY => EidPrefix::broadcast(Reason::MapReply),
        TYPE_MAP_NOTIFY => EidPrefix::broadcast(Reason::MapNotify),
        TYPE_ENCAPSULATED => encapsulated_eid(datagram),
        _ => EidPrefix::undefined(Reason::UnknownType),
    }
}

/// Read the EID of the first record of a Map-Request.
fn map_request_eid(datagram: &[u8]) -> EidPrefix {
    let Some(irc) = datagram.get(2).map(|b| b & 0x1f) else {
        return EidPrefix::undefined(Reason::Malformed);
    };

    let mut offset = MAP_REQUEST_FIXED_LEN;

    // Source EID, then IRC + 1 ITR-RLOCs
    for _ in 0..(irc as usize + 2) {
        match skip_afi_address(datagram, offset) {
            Some(next) if next < datagram.len() => offset = next,
            _ => return EidPrefix::undefined(Reason::Malformed),
        }
    }

    // Reserved byte
    offset += 1;
    let Some(&mask) = datagram.get(offset) else {
        return EidPrefix::undefined(Reason::Malformed);
    };
    offset += 1;

    let Some(afi) = read_u16(datagram, offset) else {
        return EidPrefix::undefined(Reason::Malformed);
    };
    let addr = &datagram[offset + 2..];

    match afi {
        AFI_EMPTY => EidPrefix::undefined(Reason::EmptyAfi),
        AFI_IPV4 => {
            if mask > MAX_PREFIX_LEN - IPV4_MAPPED_OFFSET {
                return EidPrefix::undefined(Reason::Malformed);
            }
            match addr.get(..4).and_then(|b| <[u8; 4]>::try_from(b).ok()) {
                Some(octets) => EidPrefix::from_ipv4(Ipv4Addr::from(octets), mask),
                None => EidPrefix::undefined(Reason::Malformed),
            }
        }
        AFI_IPV6 => {
            if mask > MAX_PREFIX_LEN {
                return EidPrefix::undefined(Reason::Malformed);
            }
            match addr.get(..16).and_then(|b| <[u8; 16]>::try_from(b).ok()) {
                Some(octets) => EidPrefix::new(Ipv6Addr::from(octets), mask),
                None => EidPrefix::undefined(Reason::Malformed),
            }
        }
        _ => EidPrefix::undefined(Reason::UnknownAddressFamily),
    }
}

/// Strip the outer ECM, IP and UDP headers and parse the inner message.
fn encapsulated_eid(datagram: &[u8]) -> EidPrefix {
    let Some(&first) = datagram.get(ECM_HEADER_LEN) else {
        return EidPrefix::undefined(Reason::Malformed);
    };

    let offset = match first >> 4 {
        4 => ECM_HEADER_LEN + (first & 0x0f) as usize * 4 + UDP_HEADER_LEN,
        6 => ECM_HEADER_LEN + IPV6_HEADER_LEN + UDP_HEADER_LEN,
        _ => return EidPrefix::undefined(Reason::UnknownAddressFamily),
    };

    if offset >= datagram.len() {
        return EidPrefix::undefined(Reason::Malformed);
    }

    debug!(offset, "Outer header stripped, processing inner packet");
    extract_eid(&datagram[offset..])
}

/// Offset just past the AFI/address pair at `offset`, or `None` for an
/// unknown AFI or a truncated field.
fn skip_afi_address(datagram: &[u8], offset: usize) -> Option<usize> {
    let addr_len = match read_u16(datagram, offset)? {
        AFI_EMPTY => 0,
        AFI_IPV4 => 4,
        AFI_IPV6 => 16,
        _ => return None,
    };
    Some(offset + 2 + addr_len)
}

fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
