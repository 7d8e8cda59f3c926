//! Endpoint identifier prefixes.
//!
//! Every EID is held as a 128-bit address: IPv6 EIDs as-is, IPv4 EIDs in the
//! IPv4-mapped range (`::ffff:a.b.c.d`) with the prefix length offset by 96.
//! Parsers that cannot extract a routable EID return a sentinel prefix tagged
//! with the reason instead of an error.

use ipnet::Ipv6Net;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Maximum prefix length of an EID.
pub const MAX_PREFIX_LEN: u8 = 128;

/// Offset added to IPv4 prefix lengths when mapped into IPv6.
pub const IPV4_MAPPED_OFFSET: u8 = 96;

/// Why an [`EidPrefix`] holds the value it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Extracted from the message as received.
    Valid,
    /// The record carried an empty address family (AFI 0).
    EmptyAfi,
    /// The message carried no EID.
    NoEid,
    /// Message type unknown or unsupported.
    UnknownType,
    /// Unsupported message header version.
    UnsupportedVersion,
    /// Truncated or otherwise malformed message.
    Malformed,
    /// Unknown IP version or AFI number.
    UnknownAddressFamily,
    /// The datagram was a Map-Reply.
    MapReply,
    /// The datagram was a Map-Notify.
    MapNotify,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Valid => "valid",
            Reason::EmptyAfi => "empty-afi",
            Reason::NoEid => "no-eid",
            Reason::UnknownType => "unknown-type",
            Reason::UnsupportedVersion => "unsupported-version",
            Reason::Malformed => "malformed",
            Reason::UnknownAddressFamily => "unknown-address-family",
            Reason::MapReply => "map-reply",
            Reason::MapNotify => "map-notify",
        }
    }
}

/// A 128-bit EID prefix plus the reason it was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EidPrefix {
    addr: [u8; 16],
    len: u8,
    reason: Reason,
}

impl EidPrefix {
    /// Create a valid prefix. Lengths above 128 are clamped.
    ///
    /// Host bits beyond `len` are kept as given.
    pub fn new(addr: Ipv6Addr, len: u8) -> Self {
        EidPrefix {
            addr: addr.octets(),
            len: len.min(MAX_PREFIX_LEN),
            reason: Reason::Valid,
        }
    }

    /// Create a prefix from an IPv4 address and IPv4 prefix length.
    pub fn from_ipv4(addr: Ipv4Addr, len: u8) -> Self {
        Self::new(
            addr.to_ipv6_mapped(),
            len.min(32).saturating_add(IPV4_MAPPED_OFFSET),
        )
    }

    /// A single host EID (`/128`).
    pub fn host(addr: Ipv6Addr) -> Self {
        Self::new(addr, MAX_PREFIX_LEN)
    }

    /// The undefined EID `::/128`; never routable.
    pub fn undefined(reason: Reason) -> Self {
        EidPrefix {
            addr: [0; 16],
            len: MAX_PREFIX_LEN,
            reason,
        }
    }

    /// The broadcast EID `::/0`; routes to every control plane.
    pub fn broadcast(reason: Reason) -> Self {
        EidPrefix {
            addr: [0; 16],
            len: 0,
            reason,
        }
    }

    pub fn octets(&self) -> &[u8; 16] {
        &self.addr
    }

    pub fn addr(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.addr)
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// True if this prefix was extracted as received.
    pub fn is_valid(&self) -> bool {
        self.reason == Reason::Valid
    }

    /// True if the address is all zeroes.
    pub fn is_zero(&self) -> bool {
        self.addr.iter().all(|b| *b == 0)
    }
}

impl From<Ipv6Net> for EidPrefix {
    fn from(net: Ipv6Net) -> Self {
        EidPrefix::new(net.addr(), net.prefix_len())
    }
}

impl std::str::FromStr for EidPrefix {
    type Err = ipnet::AddrParseError;

    /// Parses `addr/len`; a bare IPv6 address is taken as a `/128`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            s.parse::<Ipv6Net>().map(EidPrefix::from)
        } else {
            format!("{s}/{MAX_PREFIX_LEN}")
                .parse::<Ipv6Net>()
                .map(EidPrefix::from)
        }
    }
}

impl fmt::Display for EidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.len)?;
        if self.reason != Reason::Valid {
            write!(f, " ({})", self.reason.as_str())?;
        }
        Ok(())
    }
}
