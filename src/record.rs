//! Decoded packet records.
//!
//! A [`PacketRecord`] is the unit every pipeline consumer sees: the captured
//! bytes plus whatever header fields the decoder managed to extract before
//! running out of data. Records are built once by [`crate::protocol::decode`]
//! and never mutated afterwards; the pipeline shares them as
//! `Arc<PacketRecord>`.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Protocol tag for a decoded packet.
///
/// Successive decoder layers overwrite the tag toward the most specific
/// protocol recognized, so a TCP segment on port 80 ends up tagged `Http`,
/// not `Tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Unknown,
    Ethernet,
    Ipv4,
    Ipv6,
    Tcp,
    Udp,
    Icmp,
    Http,
    Https,
    Dns,
    Dhcp,
    Arp,
}

impl Protocol {
    /// Canonical name, also used as the `protocol` column in the store.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Unknown => "UNKNOWN",
            Protocol::Ethernet => "ETHERNET",
            Protocol::Ipv4 => "IPv4",
            Protocol::Ipv6 => "IPv6",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Dns => "DNS",
            Protocol::Dhcp => "DHCP",
            Protocol::Arp => "ARP",
        }
    }

    /// TCP and its port-refined variants.
    pub fn is_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Http | Protocol::Https)
    }

    /// UDP and its port-refined variants.
    pub fn is_udp(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Dns | Protocol::Dhcp)
    }

    /// Whether the packet carries a transport header with ports, i.e. it can
    /// belong to a tracked connection.
    pub fn is_transport(self) -> bool {
        self.is_tcp() || self.is_udp()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every serialized surface carries the same canonical names the store
/// uses, so a tag renders as "TCP" in JSON exports and SQLite rows alike.
impl Serialize for Protocol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Error for a protocol name with no matching tag, e.g. a corrupted store
/// row.
#[derive(Debug)]
pub struct ParseProtocolError(pub String);

impl fmt::Display for ParseProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol name '{}'", self.0)
    }
}

impl std::error::Error for ParseProtocolError {}

/// Inverse of [`Protocol::as_str`]. `"UNKNOWN"` is a valid stored name and
/// parses to `Unknown`; anything else is an error.
impl FromStr for Protocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNKNOWN" => Ok(Protocol::Unknown),
            "ETHERNET" => Ok(Protocol::Ethernet),
            "IPv4" => Ok(Protocol::Ipv4),
            "IPv6" => Ok(Protocol::Ipv6),
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "ICMP" => Ok(Protocol::Icmp),
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            "DNS" => Ok(Protocol::Dns),
            "DHCP" => Ok(Protocol::Dhcp),
            "ARP" => Ok(Protocol::Arp),
            other => Err(ParseProtocolError(other.into())),
        }
    }
}

/// An immutable decoded frame.
///
/// `length` is the wire length reported by the capture device; it can exceed
/// `raw.len()` when the snapshot length truncated the frame. All payload
/// bounds refer to `raw`, so `payload_offset + payload_length <= raw.len()`
/// always holds.
///
/// Fields a layer did not reach keep their zero defaults. When
/// `is_malformed` is set, everything past the first failed length check is
/// left at its default.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub raw: Vec<u8>,
    pub length: usize,
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub source_address: String,
    pub destination_address: String,
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub window_size: u16,
    pub ttl: u8,
    pub tos: u8,
    pub is_fragmented: bool,
    pub is_malformed: bool,
    pub payload_offset: usize,
    pub payload_length: usize,
}

impl PacketRecord {
    /// A record with the captured bytes and zero defaults everywhere else.
    /// The decoder fills in fields layer by layer.
    pub(crate) fn new(data: &[u8], wire_len: usize, timestamp: DateTime<Utc>) -> Self {
        PacketRecord {
            raw: data.to_vec(),
            length: wire_len,
            timestamp,
            protocol: Protocol::Unknown,
            source_address: String::new(),
            destination_address: String::new(),
            source_port: 0,
            destination_port: 0,
            sequence_number: 0,
            acknowledgment_number: 0,
            window_size: 0,
            ttl: 0,
            tos: 0,
            is_fragmented: false,
            is_malformed: false,
            payload_offset: 0,
            payload_length: 0,
        }
    }

    /// The topmost payload, empty when nothing follows the headers.
    pub fn payload(&self) -> &[u8] {
        &self.raw[self.payload_offset..self.payload_offset + self.payload_length]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_round_trip() {
        let all = [
            Protocol::Unknown,
            Protocol::Ethernet,
            Protocol::Ipv4,
            Protocol::Ipv6,
            Protocol::Tcp,
            Protocol::Udp,
            Protocol::Icmp,
            Protocol::Http,
            Protocol::Https,
            Protocol::Dns,
            Protocol::Dhcp,
            Protocol::Arp,
        ];
        for proto in all {
            assert_eq!(proto.as_str().parse::<Protocol>().unwrap(), proto);
        }
        assert!("QUIC".parse::<Protocol>().is_err());
        assert!("Tcp".parse::<Protocol>().is_err());
    }

    #[test]
    fn serializes_as_canonical_name() {
        assert_eq!(serde_json::to_string(&Protocol::Tcp).unwrap(), "\"TCP\"");
        assert_eq!(serde_json::to_string(&Protocol::Ipv4).unwrap(), "\"IPv4\"");
        assert_eq!(
            serde_json::to_string(&Protocol::Unknown).unwrap(),
            "\"UNKNOWN\""
        );
    }

    #[test]
    fn transport_predicates_cover_refined_tags() {
        assert!(Protocol::Http.is_tcp());
        assert!(Protocol::Https.is_tcp());
        assert!(!Protocol::Http.is_udp());
        assert!(Protocol::Dns.is_udp());
        assert!(Protocol::Dhcp.is_udp());
        assert!(!Protocol::Icmp.is_transport());
        assert!(Protocol::Tcp.is_transport());
    }

    #[test]
    fn fresh_record_has_empty_payload() {
        let rec = PacketRecord::new(&[0u8; 60], 60, Utc::now());
        assert!(rec.payload().is_empty());
        assert_eq!(rec.protocol, Protocol::Unknown);
        assert!(!rec.is_malformed);
    }
}
