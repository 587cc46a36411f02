//! Fixed-offset header parsing for Ethernet II, IPv4 and UDP.
//!
//! Everything here is a pure function over a borrowed packet: no copies, no
//! allocation. Only the IPv4 protocol number decides whether a packet carries
//! a UDP datagram; anything else is reported as a [`FrameSkip`].
use std::fmt;

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const UDP_HEADER_LEN: usize = 8;
/// IPv4 protocol number of UDP.
pub const IP_PROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Link,
    Network,
    Transport,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Link => "link",
            Layer::Network => "network",
            Layer::Transport => "transport",
        })
    }
}

/// Why a packet does not yield a datagram payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSkip {
    Truncated {
        layer: Layer,
        needed: usize,
        available: usize,
    },
    /// IHL below the 5-word minimum.
    BadHeaderLength(u8),
    /// Any transport other than UDP (TCP segments included).
    UnsupportedTransport(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub destination: [u8; 6],
    pub source: [u8; 6],
    pub ether_type: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes (IHL words times four).
    pub header_len: usize,
    pub total_length: u16,
    pub time_to_live: u8,
    pub protocol: u8,
}

pub fn parse_ethernet(packet: &[u8]) -> Result<EthernetHeader, FrameSkip> {
    let raw = packet.get(..ETHERNET_HEADER_LEN).ok_or(FrameSkip::Truncated {
        layer: Layer::Link,
        needed: ETHERNET_HEADER_LEN,
        available: packet.len(),
    })?;
    let mut destination = [0u8; 6];
    let mut source = [0u8; 6];
    destination.copy_from_slice(&raw[0..6]);
    source.copy_from_slice(&raw[6..12]);
    Ok(EthernetHeader {
        destination,
        source,
        ether_type: u16::from_be_bytes([raw[12], raw[13]]),
    })
}

pub fn parse_ipv4(bytes: &[u8]) -> Result<Ipv4Header, FrameSkip> {
    let raw = bytes.get(..IPV4_MIN_HEADER_LEN).ok_or(FrameSkip::Truncated {
        layer: Layer::Network,
        needed: IPV4_MIN_HEADER_LEN,
        available: bytes.len(),
    })?;
    let ihl = raw[0] & 0x0f;
    let header_len = usize::from(ihl) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(FrameSkip::BadHeaderLength(ihl));
    }
    if bytes.len() < header_len {
        return Err(FrameSkip::Truncated {
            layer: Layer::Network,
            needed: header_len,
            available: bytes.len(),
        });
    }
    Ok(Ipv4Header {
        version: raw[0] >> 4,
        header_len,
        total_length: u16::from_be_bytes([raw[2], raw[3]]),
        time_to_live: raw[8],
        protocol: raw[9],
    })
}

/// Strip link, network and transport headers and return the UDP payload.
pub fn datagram_payload(packet: &[u8]) -> Result<&[u8], FrameSkip> {
    parse_ethernet(packet)?;
    let network = &packet[ETHERNET_HEADER_LEN..];
    let ip = parse_ipv4(network)?;
    if ip.protocol != IP_PROTO_UDP {
        return Err(FrameSkip::UnsupportedTransport(ip.protocol));
    }
    let transport = &network[ip.header_len..];
    transport.get(UDP_HEADER_LEN..).ok_or(FrameSkip::Truncated {
        layer: Layer::Transport,
        needed: UDP_HEADER_LEN,
        available: transport.len(),
    })
}
