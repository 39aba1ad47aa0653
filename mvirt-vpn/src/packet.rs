//! IP packet classification using smoltcp
//!
//! Parses just enough of a raw IP packet read from the TUN device to route it:
//! the IPv4/IPv6 header and, for TCP and UDP, the transport header. The parsed
//! [`Packet`] keeps ownership of the buffer so the payload stays zero-copy.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket, UdpPacket};
use thiserror::Error;

use crate::buffer::Buffer;

/// Fixed IPv6 header size
pub const IPV6_HEADER_LEN: usize = 40;

/// TCP header without options
pub const TCP_HEADER_LEN: usize = 20;

/// UDP header size
pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Truncated {0} header")]
    Truncated(&'static str),
}

/// Transport protocol carried in the IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Other(u8),
}

impl TransportProtocol {
    pub fn from_number(number: u8) -> Self {
        match IpProtocol::from(number) {
            IpProtocol::Tcp => TransportProtocol::Tcp,
            IpProtocol::Udp => TransportProtocol::Udp,
            _ => TransportProtocol::Other(number),
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => u8::from(IpProtocol::Tcp),
            TransportProtocol::Udp => u8::from(IpProtocol::Udp),
            TransportProtocol::Other(n) => *n,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "TCP"),
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Other(n) => write!(f, "proto {n}"),
        }
    }
}

/// IPv4 or IPv6 header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpHeader {
    pub version: u8,
    /// Header length in bytes (IPv6: always 40, extension headers not followed)
    pub header_len: usize,
    /// Header plus payload in bytes
    pub total_len: usize,
    pub protocol: TransportProtocol,
    /// TTL for IPv4, hop limit for IPv6
    pub hop_limit: u8,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
}

/// TCP header fields (options are not decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence_number: u32,
    pub acknowledgement_number: u32,
    /// Header length in bytes including options
    pub header_len: usize,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

impl TcpHeader {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    fn parse(tcp: &TcpPacket<&[u8]>) -> Self {
        let mut flags = 0;
        for (set, bit) in [
            (tcp.fin(), Self::FIN),
            (tcp.syn(), Self::SYN),
            (tcp.rst(), Self::RST),
            (tcp.psh(), Self::PSH),
            (tcp.ack(), Self::ACK),
            (tcp.urg(), Self::URG),
        ] {
            if set {
                flags |= bit;
            }
        }

        TcpHeader {
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            sequence_number: tcp.seq_number().0 as u32,
            acknowledgement_number: tcp.ack_number().0 as u32,
            header_len: tcp.header_len() as usize,
            flags,
            window: tcp.window_len(),
            checksum: tcp.checksum(),
            urgent_pointer: tcp.urgent_at(),
        }
    }

    pub fn is_fin(&self) -> bool {
        self.flags & Self::FIN != 0
    }

    pub fn is_syn(&self) -> bool {
        self.flags & Self::SYN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & Self::RST != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & Self::PSH != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & Self::ACK != 0
    }

    pub fn is_urg(&self) -> bool {
        self.flags & Self::URG != 0
    }
}

/// UDP header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    /// Neither TCP nor UDP; only the IP header was parsed
    Other,
}

/// Headers of one IP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeaders {
    pub ip: IpHeader,
    pub transport: TransportHeader,
}

impl PacketHeaders {
    /// Offset of the transport payload from the start of the packet.
    pub fn payload_offset(&self) -> usize {
        self.ip.header_len
            + match &self.transport {
                TransportHeader::Tcp(tcp) => tcp.header_len,
                TransportHeader::Udp(_) => UDP_HEADER_LEN,
                TransportHeader::Other => 0,
            }
    }
}

/// Parse the IP and transport headers of a raw packet.
pub fn parse_headers(data: &[u8]) -> Result<PacketHeaders, PacketError> {
    let version = data.first().ok_or(PacketError::Truncated("IP"))? >> 4;
    let (ip, payload) = match version {
        4 => parse_ipv4(data)?,
        6 => parse_ipv6(data)?,
        v => return Err(PacketError::UnsupportedVersion(v)),
    };

    let transport = match ip.protocol {
        TransportProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(payload).map_err(|_| PacketError::Truncated("TCP"))?;
            TransportHeader::Tcp(TcpHeader::parse(&tcp))
        }
        TransportProtocol::Udp => {
            let udp = UdpPacket::new_checked(payload).map_err(|_| PacketError::Truncated("UDP"))?;
            TransportHeader::Udp(UdpHeader {
                src_port: udp.src_port(),
                dst_port: udp.dst_port(),
                length: udp.len(),
                checksum: udp.checksum(),
            })
        }
        TransportProtocol::Other(_) => TransportHeader::Other,
    };

    Ok(PacketHeaders { ip, transport })
}

fn parse_ipv4(data: &[u8]) -> Result<(IpHeader, &[u8]), PacketError> {
    let ipv4 = Ipv4Packet::new_checked(data).map_err(|_| PacketError::Truncated("IPv4"))?;
    // new_checked guarantees at least 20 bytes
    let src: [u8; 4] = [data[12], data[13], data[14], data[15]];
    let dst: [u8; 4] = [data[16], data[17], data[18], data[19]];

    let header = IpHeader {
        version: 4,
        header_len: ipv4.header_len() as usize,
        total_len: ipv4.total_len() as usize,
        protocol: TransportProtocol::from_number(u8::from(ipv4.next_header())),
        hop_limit: ipv4.hop_limit(),
        src_addr: IpAddr::V4(Ipv4Addr::from(src)),
        dst_addr: IpAddr::V4(Ipv4Addr::from(dst)),
    };
    let payload = &data[header.header_len..header.total_len];
    Ok((header, payload))
}

fn parse_ipv6(data: &[u8]) -> Result<(IpHeader, &[u8]), PacketError> {
    let ipv6 = Ipv6Packet::new_checked(data).map_err(|_| PacketError::Truncated("IPv6"))?;
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);

    let header = IpHeader {
        version: 6,
        header_len: IPV6_HEADER_LEN,
        total_len: IPV6_HEADER_LEN + ipv6.payload_len() as usize,
        protocol: TransportProtocol::from_number(u8::from(ipv6.next_header())),
        hop_limit: ipv6.hop_limit(),
        src_addr: IpAddr::V6(Ipv6Addr::from(src)),
        dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
    };
    let payload = &data[IPV6_HEADER_LEN..header.total_len];
    Ok((header, payload))
}

/// A packet that could not be classified, handed back with its buffer.
#[derive(Debug)]
pub struct Rejected {
    pub error: PacketError,
    pub buffer: Buffer,
}

/// A parsed IP packet backed by a pooled buffer.
///
/// The consumer of the packet owns the buffer and must return it to the pool
/// via [`into_buffer`](Self::into_buffer) once done.
#[derive(Debug)]
pub struct Packet {
    headers: PacketHeaders,
    buffer: Buffer,
}

impl Packet {
    /// Parse the readable bytes of `buffer` (after `flip`).
    pub fn parse(buffer: Buffer) -> Result<Self, Rejected> {
        match parse_headers(buffer.data()) {
            Ok(headers) => Ok(Packet { headers, buffer }),
            Err(error) => Err(Rejected { error, buffer }),
        }
    }

    pub fn headers(&self) -> &PacketHeaders {
        &self.headers
    }

    pub fn ip_header(&self) -> &IpHeader {
        &self.headers.ip
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.headers.ip.protocol
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.headers.transport, TransportHeader::Tcp(_))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.headers.transport, TransportHeader::Udp(_))
    }

    pub fn tcp_header(&self) -> Option<&TcpHeader> {
        match &self.headers.transport {
            TransportHeader::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn udp_header(&self) -> Option<&UdpHeader> {
        match &self.headers.transport {
            TransportHeader::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    /// The whole packet as read from the interface.
    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    /// Transport payload (bounded by the IP total length).
    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.data();
        let end = self.headers.ip.total_len.min(data.len());
        let start = self.headers.payload_offset().min(end);
        &data[start..end]
    }

    /// TCP payload size derived from the header lengths; 0 for non-TCP.
    ///
    /// With `include_ip_header` false the IP header length is not
    /// subtracted, matching callers that already stripped it.
    pub fn tcp_payload_size(&self, include_ip_header: bool) -> usize {
        let Some(tcp) = self.tcp_header() else {
            return 0;
        };
        let ip_header_len = if include_ip_header {
            self.headers.ip.header_len
        } else {
            0
        };
        self.headers
            .ip
            .total_len
            .saturating_sub(tcp.header_len + ip_header_len)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Give up the parsed view and take back the buffer.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = &self.headers.ip;
        write!(f, "{} {} -> {}", ip.protocol, ip.src_addr, ip.dst_addr)?;
        match &self.headers.transport {
            TransportHeader::Tcp(tcp) => write!(f, " ports {}->{}", tcp.src_port, tcp.dst_port)?,
            TransportHeader::Udp(udp) => write!(f, " ports {}->{}", udp.src_port, udp.dst_port)?,
            TransportHeader::Other => {}
        }
        write!(f, " len {}", ip.total_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    fn ipv4_header(protocol: u8, payload_len: usize) -> Vec<u8> {
        let total = (20 + payload_len) as u16;
        let mut h = vec![
            0x45, 0x00, 0x00, 0x00, // version/IHL, TOS, total length
            0x00, 0x01, 0x40, 0x00, // id, flags/fragment
            0x40, protocol, 0x00, 0x00, // TTL, protocol, checksum
            10, 0, 0, 2, // src
            93, 184, 216, 34, // dst
        ];
        h[2..4].copy_from_slice(&total.to_be_bytes());
        h
    }

    fn ipv6_header(next_header: u8, payload_len: usize) -> Vec<u8> {
        let mut h = vec![0u8; 40];
        h[0] = 0x60;
        h[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
        h[6] = next_header;
        h[7] = 64;
        h[8..24].copy_from_slice(&"fd00::2".parse::<Ipv6Addr>().unwrap().octets());
        h[24..40].copy_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        h
    }

    fn udp_segment(payload: &[u8]) -> Vec<u8> {
        let mut s = vec![0xc3, 0x50, 0x00, 0x35, 0, 0, 0, 0];
        s[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        s.extend_from_slice(payload);
        s
    }

    fn tcp_segment(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut s = vec![
            0xd4, 0x31, 0x01, 0xbb, // ports 54321 -> 443
            0x00, 0x00, 0x10, 0x00, // seq
            0x00, 0x00, 0x00, 0x00, // ack
            0x50, flags, 0xff, 0xff, // data offset, flags, window
            0x00, 0x00, 0x00, 0x00, // checksum, urgent
        ];
        s.extend_from_slice(payload);
        s
    }

    fn packet_from(bytes: &[u8]) -> Result<Packet, Rejected> {
        let pool = BufferPool::with_buffer_size(2048);
        let mut buf = pool.acquire();
        buf.put_slice(bytes);
        buf.flip();
        Packet::parse(buf)
    }

    #[test]
    fn test_parse_ipv4_udp() {
        let udp = udp_segment(b"query");
        let mut raw = ipv4_header(17, udp.len());
        raw.extend_from_slice(&udp);

        let packet = packet_from(&raw).unwrap();
        assert!(packet.is_udp());
        assert!(!packet.is_tcp());
        assert_eq!(packet.ip_header().version, 4);
        assert_eq!(packet.ip_header().src_addr, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(packet.ip_header().dst_addr, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(packet.ip_header().hop_limit, 64);

        let header = packet.udp_header().unwrap();
        assert_eq!(header.src_port, 50000);
        assert_eq!(header.dst_port, 53);
        assert_eq!(header.length, 13);
        assert_eq!(packet.payload(), b"query");
        assert_eq!(packet.tcp_payload_size(true), 0);
    }

    #[test]
    fn test_parse_ipv4_tcp() {
        let tcp = tcp_segment(TcpHeader::SYN | TcpHeader::ACK, b"hi");
        let mut raw = ipv4_header(6, tcp.len());
        raw.extend_from_slice(&tcp);

        let packet = packet_from(&raw).unwrap();
        assert!(packet.is_tcp());
        let header = packet.tcp_header().unwrap();
        assert_eq!(header.src_port, 54321);
        assert_eq!(header.dst_port, 443);
        assert_eq!(header.sequence_number, 0x1000);
        assert_eq!(header.header_len, 20);
        assert_eq!(header.window, 0xffff);
        assert!(header.is_syn());
        assert!(header.is_ack());
        assert!(!header.is_fin());
        assert!(!header.is_rst());
        assert_eq!(packet.payload(), b"hi");
        assert_eq!(packet.tcp_payload_size(true), 2);
        assert_eq!(packet.tcp_payload_size(false), 22);
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let udp = udp_segment(b"v6");
        let mut raw = ipv6_header(17, udp.len());
        raw.extend_from_slice(&udp);

        let packet = packet_from(&raw).unwrap();
        assert!(packet.is_udp());
        let ip = packet.ip_header();
        assert_eq!(ip.version, 6);
        assert_eq!(ip.header_len, 40);
        assert_eq!(ip.total_len, 40 + 10);
        assert_eq!(ip.src_addr, "fd00::2".parse::<IpAddr>().unwrap());
        assert_eq!(packet.payload(), b"v6");
    }

    #[test]
    fn test_parse_other_protocol() {
        // ICMP echo request
        let icmp = [8u8, 0, 0, 0, 0, 1, 0, 1];
        let mut raw = ipv4_header(1, icmp.len());
        raw.extend_from_slice(&icmp);

        let packet = packet_from(&raw).unwrap();
        assert!(!packet.is_tcp());
        assert!(!packet.is_udp());
        assert_eq!(packet.protocol(), TransportProtocol::Other(1));
        assert_eq!(packet.payload(), &icmp);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut raw = ipv4_header(17, 0);
        raw[0] = 0x55;
        let rejected = packet_from(&raw).unwrap_err();
        assert_eq!(rejected.error, PacketError::UnsupportedVersion(5));
        assert_eq!(rejected.buffer.data(), &raw[..]);
    }

    #[test]
    fn test_rejects_truncated() {
        assert_eq!(parse_headers(&[]), Err(PacketError::Truncated("IP")));
        assert_eq!(parse_headers(&[0x45, 0, 0]), Err(PacketError::Truncated("IPv4")));

        // IPv4 header claims a UDP payload that is too short
        let mut raw = ipv4_header(17, 4);
        raw.extend_from_slice(&[0, 53, 0, 53]);
        assert_eq!(parse_headers(&raw), Err(PacketError::Truncated("UDP")));

        let mut raw = ipv6_header(6, 8);
        raw.extend_from_slice(&[0u8; 8]);
        assert_eq!(parse_headers(&raw), Err(PacketError::Truncated("TCP")));
    }

    #[test]
    fn test_transport_protocol_numbers() {
        assert_eq!(TransportProtocol::from_number(6), TransportProtocol::Tcp);
        assert_eq!(TransportProtocol::from_number(17), TransportProtocol::Udp);
        assert_eq!(TransportProtocol::from_number(1), TransportProtocol::Other(1));
        assert_eq!(TransportProtocol::Tcp.number(), 6);
        assert_eq!(TransportProtocol::Udp.number(), 17);
        assert_eq!(TransportProtocol::Other(58).number(), 58);
    }

    #[test]
    fn test_into_buffer_keeps_identity() {
        let udp = udp_segment(b"x");
        let mut raw = ipv4_header(17, udp.len());
        raw.extend_from_slice(&udp);

        let pool = BufferPool::with_buffer_size(256);
        let mut buf = pool.acquire();
        let id = buf.id();
        buf.put_slice(&raw);
        buf.flip();

        let packet = Packet::parse(buf).unwrap();
        assert_eq!(packet.to_string(), "UDP 10.0.0.2 -> 93.184.216.34 ports 50000->53 len 29");
        assert_eq!(packet.into_buffer().id(), id);
    }
}
