//! Raw IP packet builders for tests
//!
//! Packets are laid out exactly as a TUN device with IFF_NO_PI delivers
//! them: bare IPv4/IPv6 header followed by the transport segment.

use std::net::{Ipv4Addr, Ipv6Addr};

/// IPv4 header size (without options)
pub const IPV4_HDR_SIZE: usize = 20;

/// IPv6 header size
pub const IPV6_HDR_SIZE: usize = 40;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// TCP header size (without options)
pub const TCP_HDR_SIZE: usize = 20;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Device-side address used by the builders
pub const DEVICE_IPV4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Remote address used by the builders
pub const REMOTE_IPV4: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Internet checksum over `data`
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an IPv4 packet around `payload`
pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = (IPV4_HDR_SIZE + payload.len()) as u16;
    let mut packet = Vec::with_capacity(total_len as usize);
    packet.extend_from_slice(&[0x45, 0x00]);
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01, 0x40, 0x00]); // id, DF
    packet.extend_from_slice(&[64, protocol, 0, 0]); // TTL, proto, checksum
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());

    let csum = checksum(&packet[..IPV4_HDR_SIZE]);
    packet[10..12].copy_from_slice(&csum.to_be_bytes());

    packet.extend_from_slice(payload);
    packet
}

/// Build an IPv6 packet around `payload`
pub fn ipv6_packet(src: Ipv6Addr, dst: Ipv6Addr, next_header: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(IPV6_HDR_SIZE + payload.len());
    packet.extend_from_slice(&[0x60, 0, 0, 0]);
    packet.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    packet.extend_from_slice(&[next_header, 64]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    packet.extend_from_slice(payload);
    packet
}

/// Build a UDP segment (checksum left at zero)
pub fn udp_segment(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut segment = Vec::with_capacity(UDP_HDR_SIZE + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&((UDP_HDR_SIZE + payload.len()) as u16).to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);
    segment
}

/// Build a TCP segment without options (checksum left at zero)
pub fn tcp_segment(src_port: u16, dst_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut segment = Vec::with_capacity(TCP_HDR_SIZE + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&0u32.to_be_bytes());
    segment.extend_from_slice(&[0x50, flags]);
    segment.extend_from_slice(&0xffffu16.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]);
    segment.extend_from_slice(payload);
    segment
}

/// IPv4 UDP datagram from the device to the remote host
pub fn ipv4_udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    ipv4_packet(
        DEVICE_IPV4,
        REMOTE_IPV4,
        PROTO_UDP,
        &udp_segment(src_port, dst_port, payload),
    )
}

/// IPv4 TCP segment from the device to the remote host
pub fn ipv4_tcp(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> Vec<u8> {
    ipv4_packet(
        DEVICE_IPV4,
        REMOTE_IPV4,
        PROTO_TCP,
        &tcp_segment(src_port, dst_port, 1, flags, payload),
    )
}

/// IPv4 ICMP echo request (neither TCP nor UDP)
pub fn ipv4_icmp_echo(id: u16, seq: u16) -> Vec<u8> {
    let mut icmp = vec![8, 0, 0, 0];
    icmp.extend_from_slice(&id.to_be_bytes());
    icmp.extend_from_slice(&seq.to_be_bytes());
    let csum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());
    ipv4_packet(DEVICE_IPV4, REMOTE_IPV4, PROTO_ICMP, &icmp)
}
