//! Packet building utilities for tests
//!
//! LISP Map-Requests, Encapsulated Control Messages and kernel mapping
//! messages.

use hylisp_hv::mapmsg::parse::{MAPA_EID, MAPA_EIDMASK, MAPF_DB, MapHeader};
use smoltcp::wire::{
    IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, UdpPacket, UdpRepr,
};
use std::net::{Ipv4Addr, Ipv6Addr};

const AFI_EMPTY: u16 = 0;
const AFI_IPV4: u16 = 1;
const AFI_IPV6: u16 = 2;
const LISP_CONTROL_PORT: u16 = 4342;

/// Map-Request for an IPv4 EID with a single ITR-RLOC.
pub fn map_request_v4(eid: Ipv4Addr, mask: u8) -> Vec<u8> {
    map_request(mask, AFI_IPV4, &eid.octets())
}

/// Map-Request for an IPv6 EID with a single ITR-RLOC.
pub fn map_request_v6(eid: Ipv6Addr, mask: u8) -> Vec<u8> {
    map_request(mask, AFI_IPV6, &eid.octets())
}

fn map_request(mask: u8, afi: u16, eid: &[u8]) -> Vec<u8> {
    // type 1, no flags, IRC 0, one record
    let mut pkt = vec![0x10, 0x00, 0x00, 0x01];
    pkt.extend_from_slice(&[0x5a; 8]);
    pkt.extend_from_slice(&AFI_EMPTY.to_be_bytes());
    pkt.extend_from_slice(&AFI_IPV4.to_be_bytes());
    pkt.extend_from_slice(&[192, 0, 2, 10]);
    pkt.push(0);
    pkt.push(mask);
    pkt.extend_from_slice(&afi.to_be_bytes());
    pkt.extend_from_slice(eid);
    pkt
}

/// Encapsulated Control Message carrying `inner` over IPv4/UDP.
pub fn ecm_v4(inner: &[u8]) -> Vec<u8> {
    let udp_repr = UdpRepr {
        src_port: LISP_CONTROL_PORT,
        dst_port: LISP_CONTROL_PORT,
    };
    let ipv4_repr = Ipv4Repr {
        src_addr: Ipv4Addr::new(192, 0, 2, 10),
        dst_addr: Ipv4Addr::new(198, 51, 100, 1),
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + inner.len(),
        hop_limit: 64,
    };

    let mut buffer = vec![0u8; ipv4_repr.buffer_len() + udp_repr.header_len() + inner.len()];
    let mut ipv4_packet = Ipv4Packet::new_unchecked(&mut buffer);
    ipv4_repr.emit(
        &mut ipv4_packet,
        &smoltcp::phy::ChecksumCapabilities::default(),
    );
    let mut udp_packet = UdpPacket::new_unchecked(ipv4_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ipv4_repr.src_addr.into(),
        &ipv4_repr.dst_addr.into(),
        inner.len(),
        |buf| buf.copy_from_slice(inner),
        &smoltcp::phy::ChecksumCapabilities::default(),
    );

    encapsulate(&buffer)
}

/// Encapsulated Control Message carrying `inner` over IPv6/UDP.
pub fn ecm_v6(inner: &[u8]) -> Vec<u8> {
    let udp_repr = UdpRepr {
        src_port: LISP_CONTROL_PORT,
        dst_port: LISP_CONTROL_PORT,
    };
    let ipv6_repr = Ipv6Repr {
        src_addr: "2001:db8::10".parse().unwrap(),
        dst_addr: "2001:db8::1".parse().unwrap(),
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + inner.len(),
        hop_limit: 64,
    };

    let mut buffer = vec![0u8; ipv6_repr.buffer_len() + udp_repr.header_len() + inner.len()];
    let mut ipv6_packet = Ipv6Packet::new_unchecked(&mut buffer);
    ipv6_repr.emit(&mut ipv6_packet);
    let mut udp_packet = UdpPacket::new_unchecked(ipv6_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ipv6_repr.src_addr.into(),
        &ipv6_repr.dst_addr.into(),
        inner.len(),
        |buf| buf.copy_from_slice(inner),
        &smoltcp::phy::ChecksumCapabilities::default(),
    );

    encapsulate(&buffer)
}

fn encapsulate(ip_packet: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0x80, 0, 0, 0];
    pkt.extend_from_slice(ip_packet);
    pkt
}

/// Map-Reply header; only the type matters for demultiplexing.
pub fn map_reply() -> Vec<u8> {
    let mut pkt = vec![0x20, 0x00, 0x00, 0x01];
    pkt.extend_from_slice(&[0x5a; 8]);
    pkt
}

fn sockaddr_in(addr: Ipv4Addr) -> [u8; 16] {
    let mut sa = [0u8; 16];
    sa[0..2].copy_from_slice(&(nix::libc::AF_INET as u16).to_ne_bytes());
    sa[4..8].copy_from_slice(&addr.octets());
    sa
}

/// Database ADD or DELETE of an IPv4 prefix, as a control plane sends it.
pub fn db_change_v4(kind: u16, eid: Ipv4Addr, mask: Ipv4Addr) -> Vec<u8> {
    let header = MapHeader {
        version: 1,
        kind,
        flags: MAPF_DB,
        addrs: MAPA_EID | MAPA_EIDMASK,
        ..Default::default()
    };
    let mut msg = header.encode().to_vec();
    msg.extend_from_slice(&sockaddr_in(eid));
    msg.extend_from_slice(&sockaddr_in(mask));
    msg
}

/// Cache miss for an IPv4 packet from `source`, as the kernel sends it.
pub fn miss_v4(source: Ipv4Addr) -> Vec<u8> {
    let header = MapHeader {
        version: 1,
        kind: hylisp_hv::mapmsg::parse::MAPM_MISS_HEADER,
        ..Default::default()
    };
    let mut msg = header.encode().to_vec();
    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[12..16].copy_from_slice(&source.octets());
    msg.extend_from_slice(&ip);
    msg
}
