//! Layered packet decoder.
//!
//! [`decode`] turns raw captured bytes into an owned
//! [`PacketRecord`](crate::record::PacketRecord). Each layer checks that the
//! captured byte count covers its header before reading anything; on a
//! shortfall the record keeps whatever was extracted so far and is flagged
//! malformed. Decoding is total — every frame yields a record, never an
//! error.
//!
//! All bounds checks run against the captured bytes (`data.len()`), not the
//! reported wire length, so a frame truncated by the snapshot length can
//! never index past the buffer.

pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use crate::record::{PacketRecord, Protocol};
use chrono::{DateTime, Utc};
use std::fmt;

use ethernet::{EthernetHeader, ETH_HEADER_LEN};
use ipv4::Ipv4Header;
use ipv6::{Ipv6Header, IPV6_HEADER_LEN};
use tcp::TcpHeader;
use udp::{UdpHeader, UDP_HEADER_LEN};

/// Fixed portion of an ARP packet header.
pub const ARP_HEADER_LEN: usize = 8;

/// Ethertype values the decoder dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Arp,
    Unknown(u16),
}

impl From<u16> for EtherType {
    fn from(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            0x0806 => EtherType::Arp,
            other => EtherType::Unknown(other),
        }
    }
}

/// IP next-protocol numbers the decoder dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Unknown(u8),
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Unknown(other),
        }
    }
}

/// Errors from the per-layer header parsers.
///
/// These never escape [`decode`]; they exist so the parsers can report
/// exactly what went wrong and the decoder can translate that into the
/// malformed flag.
#[derive(Debug)]
pub enum ParseError {
    /// Not enough captured bytes for the header.
    TooShort { expected: usize, actual: usize },
    /// A header field held an impossible value.
    InvalidHeader(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { expected, actual } => {
                write!(f, "header needs {} bytes, got {}", expected, actual)
            }
            ParseError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// Decode one captured frame into a record.
///
/// `wire_len` is the on-the-wire length reported by the capture device; it
/// is recorded as-is and may exceed `data.len()` for truncated captures.
pub fn decode(data: &[u8], wire_len: usize, timestamp: DateTime<Utc>) -> PacketRecord {
    let mut rec = PacketRecord::new(data, wire_len, timestamp);
    decode_ethernet(data, &mut rec);
    rec
}

fn decode_ethernet(data: &[u8], rec: &mut PacketRecord) {
    let eth = match EthernetHeader::parse(data) {
        Ok(hdr) => hdr,
        Err(_) => {
            rec.is_malformed = true;
            return;
        }
    };

    match eth.ether_type() {
        EtherType::Ipv4 => {
            rec.protocol = Protocol::Ipv4;
            decode_ipv4(data, rec);
        }
        EtherType::Ipv6 => {
            rec.protocol = Protocol::Ipv6;
            decode_ipv6(data, rec);
        }
        EtherType::Arp => {
            rec.protocol = Protocol::Arp;
            decode_arp(data, rec);
        }
        // An ethertype we don't dissect is not an error, just unknown.
        EtherType::Unknown(_) => {
            rec.protocol = Protocol::Unknown;
        }
    }
}

fn decode_ipv4(data: &[u8], rec: &mut PacketRecord) {
    let ip = match Ipv4Header::parse(&data[ETH_HEADER_LEN..]) {
        Ok(hdr) => hdr,
        Err(_) => {
            rec.is_malformed = true;
            return;
        }
    };

    rec.source_address = ip.src_addr().to_string();
    rec.destination_address = ip.dst_addr().to_string();
    rec.ttl = ip.ttl();
    rec.tos = ip.tos();
    rec.is_fragmented = ip.fragment_offset() != 0;

    let transport_at = ETH_HEADER_LEN + ip.header_len();
    dispatch_transport(data, transport_at, ip.protocol(), rec);
}

fn decode_ipv6(data: &[u8], rec: &mut PacketRecord) {
    let ip = match Ipv6Header::parse(&data[ETH_HEADER_LEN..]) {
        Ok(hdr) => hdr,
        Err(_) => {
            rec.is_malformed = true;
            return;
        }
    };

    rec.source_address = ip.src_addr().to_string();
    rec.destination_address = ip.dst_addr().to_string();
    rec.ttl = ip.hop_limit();
    rec.tos = ip.traffic_class();

    let transport_at = ETH_HEADER_LEN + IPV6_HEADER_LEN;
    dispatch_transport(data, transport_at, ip.next_header(), rec);
}

fn dispatch_transport(data: &[u8], at: usize, proto: IpProtocol, rec: &mut PacketRecord) {
    match proto {
        IpProtocol::Tcp => {
            rec.protocol = Protocol::Tcp;
            decode_tcp(data, at, rec);
        }
        IpProtocol::Udp => {
            rec.protocol = Protocol::Udp;
            decode_udp(data, at, rec);
        }
        IpProtocol::Icmp | IpProtocol::Icmpv6 => {
            rec.protocol = Protocol::Icmp;
        }
        IpProtocol::Unknown(_) => {}
    }
}

fn decode_tcp(data: &[u8], at: usize, rec: &mut PacketRecord) {
    let tcp = match TcpHeader::parse(&data[at..]) {
        Ok(hdr) => hdr,
        Err(_) => {
            rec.is_malformed = true;
            return;
        }
    };

    rec.source_port = tcp.src_port();
    rec.destination_port = tcp.dst_port();
    rec.sequence_number = tcp.sequence_number();
    rec.acknowledgment_number = tcp.ack_number();
    rec.window_size = tcp.window_size();

    rec.payload_offset = at + tcp.header_len();
    rec.payload_length = data.len() - rec.payload_offset;

    refine_application(rec);
}

fn decode_udp(data: &[u8], at: usize, rec: &mut PacketRecord) {
    let udp = match UdpHeader::parse(&data[at..]) {
        Ok(hdr) => hdr,
        Err(_) => {
            rec.is_malformed = true;
            return;
        }
    };

    rec.source_port = udp.src_port();
    rec.destination_port = udp.dst_port();

    rec.payload_offset = at + UDP_HEADER_LEN;
    rec.payload_length = data.len() - rec.payload_offset;

    refine_application(rec);
}

fn decode_arp(data: &[u8], rec: &mut PacketRecord) {
    // The analyzer needs nothing from the ARP body, but the frame must at
    // least contain the fixed header to count as well-formed.
    if data.len() < ETH_HEADER_LEN + ARP_HEADER_LEN {
        rec.is_malformed = true;
    }
}

/// Port-based refinement of the transport tag toward an application
/// protocol. Either direction counts.
fn refine_application(rec: &mut PacketRecord) {
    let (src, dst) = (rec.source_port, rec.destination_port);
    if rec.protocol == Protocol::Tcp {
        if src == 80 || dst == 80 {
            rec.protocol = Protocol::Http;
        } else if src == 443 || dst == 443 {
            rec.protocol = Protocol::Https;
        }
    } else if rec.protocol == Protocol::Udp {
        if src == 53 || dst == 53 {
            rec.protocol = Protocol::Dns;
        } else if src == 67 || src == 68 || dst == 67 || dst == 68 {
            rec.protocol = Protocol::Dhcp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    /// Ethernet + IPv4 + TCP frame. `tcp_header_len` must be a multiple of 4
    /// and at least 20; `payload_len` bytes of 0xAA follow.
    fn build_tcp4(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        tcp_header_len: usize,
        payload_len: usize,
    ) -> Vec<u8> {
        let mut pkt = vec![0u8; ETH_HEADER_LEN + 20 + tcp_header_len + payload_len];
        pkt[12] = 0x08; // IPv4
        pkt[13] = 0x00;

        let ip = &mut pkt[14..34];
        ip[0] = 0x45;
        ip[1] = 0x10; // TOS
        let total: u16 = (20 + tcp_header_len + payload_len) as u16;
        ip[2..4].copy_from_slice(&total.to_be_bytes());
        ip[8] = 64;
        ip[9] = 6; // TCP
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let tcp = &mut pkt[34..];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[8..12].copy_from_slice(&7u32.to_be_bytes());
        tcp[12] = ((tcp_header_len / 4) as u8) << 4;
        tcp[13] = 0x02; // SYN
        tcp[14..16].copy_from_slice(&65535u16.to_be_bytes());

        for byte in &mut pkt[34 + tcp_header_len..] {
            *byte = 0xAA;
        }
        pkt
    }

    /// Ethernet + IPv4 + UDP frame with `payload_len` bytes of payload.
    fn build_udp4(src_port: u16, dst_port: u16, payload_len: usize) -> Vec<u8> {
        let mut pkt = vec![0u8; ETH_HEADER_LEN + 20 + 8 + payload_len];
        pkt[12] = 0x08;
        pkt[13] = 0x00;

        let ip = &mut pkt[14..34];
        ip[0] = 0x45;
        let total: u16 = (20 + 8 + payload_len) as u16;
        ip[2..4].copy_from_slice(&total.to_be_bytes());
        ip[8] = 64;
        ip[9] = 17; // UDP
        ip[12..16].copy_from_slice(&[192, 168, 1, 10]);
        ip[16..20].copy_from_slice(&[192, 168, 1, 1]);

        let udp = &mut pkt[34..42];
        udp[0..2].copy_from_slice(&src_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        udp[4..6].copy_from_slice(&((8 + payload_len) as u16).to_be_bytes());
        pkt
    }

    /// Ethernet + IPv6 + TCP frame, no payload.
    fn build_tcp6(src_port: u16, dst_port: u16, seq: u32) -> Vec<u8> {
        let mut pkt = vec![0u8; ETH_HEADER_LEN + 40 + 20];
        pkt[12] = 0x86;
        pkt[13] = 0xDD;

        let ip = &mut pkt[14..54];
        ip[0] = 0x60;
        ip[4..6].copy_from_slice(&20u16.to_be_bytes());
        ip[6] = 6; // TCP
        ip[7] = 64;
        ip[23] = 1; // src ::1
        ip[39] = 2; // dst ::2

        let tcp = &mut pkt[54..74];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[4..8].copy_from_slice(&seq.to_be_bytes());
        tcp[12] = 0x50;
        pkt
    }

    #[test]
    fn tcp_syn_refines_to_http() {
        // 14 eth + 20 ip + 40 tcp = 74-byte SYN toward port 80
        let pkt = build_tcp4(55000, 80, 1000, 40, 0);
        assert_eq!(pkt.len(), 74);
        let rec = decode(&pkt, pkt.len(), ts());

        assert_eq!(rec.protocol, Protocol::Http);
        assert!(!rec.is_malformed);
        assert_eq!(rec.source_address, "10.0.0.1");
        assert_eq!(rec.destination_address, "10.0.0.2");
        assert_eq!(rec.source_port, 55000);
        assert_eq!(rec.destination_port, 80);
        assert_eq!(rec.sequence_number, 1000);
        assert_eq!(rec.acknowledgment_number, 7);
        assert_eq!(rec.window_size, 65535);
        assert_eq!(rec.ttl, 64);
        assert_eq!(rec.tos, 0x10);
        assert_eq!(rec.payload_offset, 74);
        assert_eq!(rec.payload_length, 0);
    }

    #[test]
    fn https_and_plain_tcp_tags() {
        let rec = decode(&build_tcp4(443, 50123, 1, 20, 0), 54, ts());
        assert_eq!(rec.protocol, Protocol::Https);
        let rec = decode(&build_tcp4(50123, 8080, 1, 20, 0), 54, ts());
        assert_eq!(rec.protocol, Protocol::Tcp);
    }

    #[test]
    fn udp_refinements() {
        let rec = decode(&build_udp4(51234, 53, 28), 0, ts());
        assert_eq!(rec.protocol, Protocol::Dns);
        assert_eq!(rec.payload_length, 28);

        let rec = decode(&build_udp4(68, 67, 0), 0, ts());
        assert_eq!(rec.protocol, Protocol::Dhcp);

        let rec = decode(&build_udp4(40000, 40001, 0), 0, ts());
        assert_eq!(rec.protocol, Protocol::Udp);
    }

    #[test]
    fn truncated_ipv4_keeps_tag_and_flags_malformed() {
        let pkt = build_tcp4(55000, 80, 1, 20, 0);
        let cut = &pkt[..ETH_HEADER_LEN + 10];
        let rec = decode(cut, pkt.len(), ts());
        assert_eq!(rec.protocol, Protocol::Ipv4);
        assert!(rec.is_malformed);
        // nothing past the failure point was filled in
        assert!(rec.source_address.is_empty());
        assert_eq!(rec.source_port, 0);
        assert_eq!(rec.payload_length, 0);
    }

    #[test]
    fn truncated_tcp_keeps_tag_and_flags_malformed() {
        let pkt = build_tcp4(55000, 80, 1, 20, 0);
        let cut = &pkt[..ETH_HEADER_LEN + 20 + 12];
        let rec = decode(cut, pkt.len(), ts());
        assert_eq!(rec.protocol, Protocol::Tcp);
        assert!(rec.is_malformed);
        assert_eq!(rec.source_port, 0);
        assert_eq!(rec.sequence_number, 0);
    }

    #[test]
    fn runt_frame_is_malformed_unknown() {
        let rec = decode(&[0u8; 9], 9, ts());
        assert_eq!(rec.protocol, Protocol::Unknown);
        assert!(rec.is_malformed);
    }

    #[test]
    fn unknown_ethertype_is_not_malformed() {
        let mut pkt = vec![0u8; 60];
        pkt[12] = 0x88;
        pkt[13] = 0xCC; // LLDP
        let rec = decode(&pkt, 60, ts());
        assert_eq!(rec.protocol, Protocol::Unknown);
        assert!(!rec.is_malformed);
    }

    #[test]
    fn arp_frames() {
        let mut pkt = vec![0u8; ETH_HEADER_LEN + 28];
        pkt[12] = 0x08;
        pkt[13] = 0x06;
        let rec = decode(&pkt, pkt.len(), ts());
        assert_eq!(rec.protocol, Protocol::Arp);
        assert!(!rec.is_malformed);

        let rec = decode(&pkt[..ETH_HEADER_LEN + 4], pkt.len(), ts());
        assert_eq!(rec.protocol, Protocol::Arp);
        assert!(rec.is_malformed);
    }

    #[test]
    fn icmp_is_tagged_without_ports() {
        let mut pkt = build_udp4(0, 0, 8);
        pkt[23] = 1; // overwrite protocol to ICMP
        let rec = decode(&pkt, pkt.len(), ts());
        assert_eq!(rec.protocol, Protocol::Icmp);
        assert_eq!(rec.source_port, 0);
        assert_eq!(rec.destination_port, 0);
    }

    #[test]
    fn ipv6_transport_starts_after_fixed_header() {
        let pkt = build_tcp6(55000, 443, 424242);
        let rec = decode(&pkt, pkt.len(), ts());
        assert_eq!(rec.protocol, Protocol::Https);
        assert_eq!(rec.source_address, "::1");
        assert_eq!(rec.destination_address, "::2");
        assert_eq!(rec.source_port, 55000);
        assert_eq!(rec.sequence_number, 424242);
        assert_eq!(rec.payload_offset, 74);
        assert_eq!(rec.payload_length, 0);
    }

    #[test]
    fn ipv4_options_shift_transport_offset() {
        // IHL 6 => transport at 14 + 24
        let mut pkt = vec![0u8; ETH_HEADER_LEN + 24 + 20];
        pkt[12] = 0x08;
        pkt[13] = 0x00;
        pkt[14] = 0x46;
        pkt[23] = 6; // TCP
        pkt[26..30].copy_from_slice(&[1, 2, 3, 4]);
        pkt[30..34].copy_from_slice(&[5, 6, 7, 8]);
        let tcp_at = ETH_HEADER_LEN + 24;
        pkt[tcp_at..tcp_at + 2].copy_from_slice(&1234u16.to_be_bytes());
        pkt[tcp_at + 2..tcp_at + 4].copy_from_slice(&80u16.to_be_bytes());
        pkt[tcp_at + 12] = 0x50;

        let rec = decode(&pkt, pkt.len(), ts());
        assert_eq!(rec.protocol, Protocol::Http);
        assert_eq!(rec.source_port, 1234);
        assert_eq!(rec.payload_offset, tcp_at + 20);
    }

    #[test]
    fn fragmented_packet_is_flagged() {
        let mut pkt = build_udp4(1000, 2000, 0);
        pkt[20] = 0x00;
        pkt[21] = 0x10; // fragment offset 16
        let rec = decode(&pkt, pkt.len(), ts());
        assert!(rec.is_fragmented);
    }

    #[test]
    fn payload_bounds_stay_within_captured_bytes() {
        // wire said 1500 bytes but the snapshot kept 94
        let pkt = build_tcp4(55000, 80, 1, 20, 40);
        let rec = decode(&pkt, 1500, ts());
        assert_eq!(rec.length, 1500);
        assert!(rec.payload_offset + rec.payload_length <= rec.raw.len());
        assert_eq!(rec.payload_length, 40);
        assert_eq!(rec.payload(), &vec![0xAA; 40][..]);
    }
}
