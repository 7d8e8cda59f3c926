//! Raw IPv4/UDP injection of demultiplexed control packets.
//!
//! A control packet is re-sent to the chosen control plane's port with the
//! original sender's address and port preserved, so the control plane sees
//! the datagram exactly as if it had been addressed to it directly.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddrV4};
use tracing::debug;

pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;

const IP_PROTO_UDP: u8 = 17;
const INJECT_TTL: u8 = 17;
const INJECT_IDENT: u16 = 1;

/// Delivers a control packet to a local control plane.
pub trait Inject: Send + Sync {
    /// Send `payload` as a UDP datagram from `source` to `destination`.
    fn inject(&self, source: SocketAddrV4, destination: SocketAddrV4, payload: &[u8])
    -> io::Result<()>;
}

/// Injects through a fresh `IPPROTO_RAW` socket per datagram.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawInjector;

impl RawInjector {
    pub fn new() -> Self {
        RawInjector
    }

    fn open() -> io::Result<Socket> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(nix::libc::IPPROTO_RAW)),
        )?;

        socket.set_header_included_v4(true)?;
        socket.shutdown(Shutdown::Read)?;
        Ok(socket)
    }
}

impl Inject for RawInjector {
    fn inject(
        &self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> io::Result<()> {
        let packet = build_packet(source, destination, payload)?;
        let socket = Self::open()?;
        socket.send_to(&packet, &destination.into())?;
        debug!(%source, %destination, len = packet.len(), "Injected control packet");
        Ok(())
    }
}

/// Build an IPv4 + UDP packet carrying `payload`.
pub fn build_packet(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let udp_len = UDP_HEADER_SIZE + payload.len();
    let total_len = IPV4_HEADER_SIZE + udp_len;
    let total_len_field = u16::try_from(total_len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;

    let mut packet = vec![0u8; total_len];

    // IPv4 header
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total_len_field.to_be_bytes());
    packet[4..6].copy_from_slice(&INJECT_IDENT.to_be_bytes());
    packet[8] = INJECT_TTL;
    packet[9] = IP_PROTO_UDP;
    packet[12..16].copy_from_slice(&source.ip().octets());
    packet[16..20].copy_from_slice(&destination.ip().octets());
    let ip_checksum = ipv4_header_checksum(&packet[..IPV4_HEADER_SIZE]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    // UDP header and payload
    let udp = &mut packet[IPV4_HEADER_SIZE..];
    udp[0..2].copy_from_slice(&source.port().to_be_bytes());
    udp[2..4].copy_from_slice(&destination.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_SIZE..].copy_from_slice(payload);
    let udp_checksum = compute_udp4_checksum(source, destination, udp);
    udp[6..8].copy_from_slice(&udp_checksum.to_be_bytes());

    Ok(packet)
}

/// One's-complement sum of `data` as big-endian 16-bit words, zero-padded
/// to even length, without the final inversion.
fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold to 16 bits
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

/// Checksum of an IPv4 header whose checksum field is zero.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    !(ones_complement_sum(0, header) as u16)
}

/// UDP checksum over the IPv4 pseudo-header and `udp_data` (header with a
/// zero checksum field, then payload).
pub fn compute_udp4_checksum(source: SocketAddrV4, destination: SocketAddrV4, udp_data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    // Pseudo-header
    sum = ones_complement_sum(sum, &source.ip().octets());
    sum = ones_complement_sum(sum, &destination.ip().octets());
    sum += IP_PROTO_UDP as u32;
    sum += udp_data.len() as u32;

    let result = !(ones_complement_sum(sum, udp_data) as u16);
    if result == 0 { 0xffff } else { result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::wire::{IpAddress, Ipv4Packet, UdpPacket};
    use std::net::Ipv4Addr;

    fn addr(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    #[test]
    fn test_ipv4_header_checksum_vector() {
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_header_checksum(&header), 0xb861);

        // Verifying a header that carries its checksum sums to zero
        let mut with_checksum = header;
        with_checksum[10..12].copy_from_slice(&0xb861u16.to_be_bytes());
        assert_eq!(ipv4_header_checksum(&with_checksum), 0);
    }

    #[test]
    fn test_udp_checksum_vectors() {
        let src = addr([127, 0, 0, 1], 4342);
        let dst = addr([127, 0, 0, 1], 6001);

        let packet = build_packet(src, dst, &[0u8; 8]).unwrap();
        assert_eq!(u16::from_be_bytes([packet[26], packet[27]]), 0xd964);

        // Odd payload is padded for the sum only
        let packet = build_packet(src, dst, &[0x10, 0x00, 0x00]).unwrap();
        assert_eq!(packet.len(), 31);
        assert_eq!(u16::from_be_bytes([packet[26], packet[27]]), 0xc96e);
    }

    #[test]
    fn test_build_packet_layout() {
        let src = addr([192, 0, 2, 10], 4342);
        let dst = addr([192, 0, 2, 1], 6001);
        let payload = b"map-request";

        let packet = build_packet(src, dst, payload).unwrap();
        assert_eq!(packet.len(), 20 + 8 + payload.len());

        let ip = Ipv4Packet::new_checked(&packet[..]).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.version(), 4);
        assert_eq!(ip.header_len(), 20);
        assert_eq!(ip.total_len() as usize, packet.len());
        assert_eq!(ip.ident(), 1);
        assert_eq!(ip.hop_limit(), 17);
        assert_eq!(ip.src_addr(), Ipv4Addr::new(192, 0, 2, 10));
        assert_eq!(ip.dst_addr(), Ipv4Addr::new(192, 0, 2, 1));

        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 4342);
        assert_eq!(udp.dst_port(), 6001);
        assert_eq!(udp.len() as usize, 8 + payload.len());
        assert!(udp.verify_checksum(
            &IpAddress::Ipv4(Ipv4Addr::new(192, 0, 2, 10)),
            &IpAddress::Ipv4(Ipv4Addr::new(192, 0, 2, 1)),
        ));
        assert_eq!(udp.payload(), payload);
    }

    #[test]
    fn test_payload_too_large() {
        let src = addr([127, 0, 0, 1], 4342);
        let payload = vec![0u8; 65535];
        assert!(build_packet(src, src, &payload).is_err());
    }

    #[test]
    fn test_raw_socket_carries_header() {
        // Needs CAP_NET_RAW; unprivileged runs only see the refusal
        match RawInjector::open() {
            Ok(socket) => assert!(socket.header_included_v4().unwrap()),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
        }
    }
}
