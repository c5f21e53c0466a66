//! Wire formats for the header stack the probe modules emit and parse.
//!
//! Every header is handled through explicit byte offsets with bounds-checked
//! unpack on the receive side; no buffer is ever reinterpreted as a struct.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::crypto::Validation;
use crate::net::MacAddress;

pub const MAX_PACKET_SIZE: usize = 4096;

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const TCP_HDR_LEN: usize = 20;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const IPPROTO_TCP: u8 = 6;
pub const MAXTTL: u8 = 255;

pub const TH_FIN: u8 = 0x01;
pub const TH_SYN: u8 = 0x02;
pub const TH_RST: u8 = 0x04;
pub const TH_PSH: u8 = 0x08;
pub const TH_ACK: u8 = 0x10;

// Ethernet field offsets
const ETH_OFF_DST: usize = 0;
const ETH_OFF_SRC: usize = 6;
const ETH_OFF_ETHERTYPE: usize = 12;

// IPv4 field offsets, relative to the start of the IP header
const IP4_OFF_VERSION_IHL: usize = 0;
const IP4_OFF_TOT_LEN: usize = 2;
const IP4_OFF_ID: usize = 4;
const IP4_OFF_TTL: usize = 8;
const IP4_OFF_PROTOCOL: usize = 9;
const IP4_OFF_CHECKSUM: usize = 10;
const IP4_OFF_SADDR: usize = 12;
const IP4_OFF_DADDR: usize = 16;

// IPv6 field offsets, relative to the start of the IP header
const IP6_OFF_VTCFL: usize = 0;
const IP6_OFF_PAYLOAD_LEN: usize = 4;
const IP6_OFF_NEXT_HDR: usize = 6;
const IP6_OFF_HOP_LIMIT: usize = 7;
const IP6_OFF_SADDR: usize = 8;
const IP6_OFF_DADDR: usize = 24;

// TCP field offsets, relative to the start of the TCP header
const TCP_OFF_SPORT: usize = 0;
const TCP_OFF_DPORT: usize = 2;
const TCP_OFF_SEQ: usize = 4;
const TCP_OFF_ACK: usize = 8;
const TCP_OFF_DOFF: usize = 12;
const TCP_OFF_FLAGS: usize = 13;
const TCP_OFF_WINDOW: usize = 14;
const TCP_OFF_CHECKSUM: usize = 16;

#[inline]
fn put_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_be_bytes());
}

#[inline]
fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

#[inline]
fn read_u16(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_be_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_be_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

pub fn make_eth_header(buf: &mut [u8], src: &MacAddress, gw: &MacAddress, ethertype: u16) {
    buf[ETH_OFF_DST..ETH_OFF_DST + 6].copy_from_slice(gw.as_bytes());
    buf[ETH_OFF_SRC..ETH_OFF_SRC + 6].copy_from_slice(src.as_bytes());
    put_u16(buf, ETH_OFF_ETHERTYPE, ethertype);
}

/// Static IPv4 fields; addresses, TTL and checksum are patched per send.
pub fn make_ipv4_header(ip: &mut [u8], protocol: u8, tot_len: u16) {
    ip[IP4_OFF_VERSION_IHL] = 0x45; // version 4, 5-word header
    put_u16(ip, IP4_OFF_TOT_LEN, tot_len);
    put_u16(ip, IP4_OFF_ID, 54321);
    ip[IP4_OFF_TTL] = MAXTTL;
    ip[IP4_OFF_PROTOCOL] = protocol;
}

pub fn set_ipv4_addrs(ip: &mut [u8], src: &Ipv4Addr, dst: &Ipv4Addr) {
    ip[IP4_OFF_SADDR..IP4_OFF_SADDR + 4].copy_from_slice(&src.octets());
    ip[IP4_OFF_DADDR..IP4_OFF_DADDR + 4].copy_from_slice(&dst.octets());
}

pub fn set_ipv4_ttl(ip: &mut [u8], ttl: u8) {
    ip[IP4_OFF_TTL] = ttl;
}

pub fn set_ipv4_checksum(ip: &mut [u8], checksum: u16) {
    put_u16(ip, IP4_OFF_CHECKSUM, checksum);
}

/// Static IPv6 fields; addresses and hop limit are patched per send.
pub fn make_ipv6_header(ip: &mut [u8], next_header: u8, payload_len: u16) {
    put_u32(ip, IP6_OFF_VTCFL, 6 << 28); // version 6, no traffic class or flow label
    put_u16(ip, IP6_OFF_PAYLOAD_LEN, payload_len);
    ip[IP6_OFF_NEXT_HDR] = next_header;
    ip[IP6_OFF_HOP_LIMIT] = MAXTTL;
}

pub fn set_ipv6_addrs(ip: &mut [u8], src: &Ipv6Addr, dst: &Ipv6Addr) {
    ip[IP6_OFF_SADDR..IP6_OFF_SADDR + 16].copy_from_slice(&src.octets());
    ip[IP6_OFF_DADDR..IP6_OFF_DADDR + 16].copy_from_slice(&dst.octets());
}

pub fn set_ipv6_hop_limit(ip: &mut [u8], hop_limit: u8) {
    ip[IP6_OFF_HOP_LIMIT] = hop_limit;
}

/// Static TCP fields: destination port, data offset, flags, window.
pub fn make_tcp_header(tcp: &mut [u8], dst_port: u16, flags: u8) {
    put_u16(tcp, TCP_OFF_DPORT, dst_port);
    tcp[TCP_OFF_DOFF] = (TCP_HDR_LEN as u8 / 4) << 4;
    tcp[TCP_OFF_FLAGS] = flags;
    put_u16(tcp, TCP_OFF_WINDOW, 65535);
}

pub fn set_tcp_sport(tcp: &mut [u8], port: u16) {
    put_u16(tcp, TCP_OFF_SPORT, port);
}

pub fn set_tcp_seq(tcp: &mut [u8], seq: u32) {
    put_u32(tcp, TCP_OFF_SEQ, seq);
}

pub fn set_tcp_ack(tcp: &mut [u8], ack: u32) {
    put_u32(tcp, TCP_OFF_ACK, ack);
}

/// Data offset in 32-bit words (5 for a bare header, more with options).
pub fn set_tcp_data_offset(tcp: &mut [u8], words: u8) {
    tcp[TCP_OFF_DOFF] = words << 4;
}

pub fn set_tcp_checksum(tcp: &mut [u8], checksum: u16) {
    put_u16(tcp, TCP_OFF_CHECKSUM, checksum);
}

/// Unpacked view of a received IPv4 header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Fields {
    pub header_len: usize,
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Fields {
    pub fn unpack(ip: &[u8]) -> Option<Self> {
        if ip.len() < IPV4_HDR_LEN || ip[IP4_OFF_VERSION_IHL] >> 4 != 4 {
            return None;
        }
        let header_len = ((ip[IP4_OFF_VERSION_IHL] & 0x0f) as usize) * 4;
        if header_len < IPV4_HDR_LEN || ip.len() < header_len {
            return None;
        }
        Some(Self {
            header_len,
            total_len: read_u16(ip, IP4_OFF_TOT_LEN)?,
            ttl: ip[IP4_OFF_TTL],
            protocol: ip[IP4_OFF_PROTOCOL],
            src: Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]),
            dst: Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]),
        })
    }
}

/// Unpacked view of a received IPv6 header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Fields {
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Fields {
    pub fn unpack(ip: &[u8]) -> Option<Self> {
        if ip.len() < IPV6_HDR_LEN || ip[0] >> 4 != 6 {
            return None;
        }
        let src: [u8; 16] = ip[IP6_OFF_SADDR..IP6_OFF_SADDR + 16].try_into().ok()?;
        let dst: [u8; 16] = ip[IP6_OFF_DADDR..IP6_OFF_DADDR + 16].try_into().ok()?;
        Some(Self {
            payload_len: read_u16(ip, IP6_OFF_PAYLOAD_LEN)?,
            next_header: ip[IP6_OFF_NEXT_HDR],
            hop_limit: ip[IP6_OFF_HOP_LIMIT],
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
        })
    }
}

/// Unpacked view of a received TCP header.
#[derive(Debug, Clone, Copy)]
pub struct TcpFields {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
}

impl TcpFields {
    pub fn unpack(tcp: &[u8]) -> Option<Self> {
        if tcp.len() < TCP_HDR_LEN {
            return None;
        }
        Some(Self {
            sport: read_u16(tcp, TCP_OFF_SPORT)?,
            dport: read_u16(tcp, TCP_OFF_DPORT)?,
            seq: read_u32(tcp, TCP_OFF_SEQ)?,
            ack: read_u32(tcp, TCP_OFF_ACK)?,
            data_offset: tcp[TCP_OFF_DOFF] >> 4,
            flags: tcp[TCP_OFF_FLAGS],
            window: read_u16(tcp, TCP_OFF_WINDOW)?,
            checksum: read_u16(tcp, TCP_OFF_CHECKSUM)?,
        })
    }
}

fn ones_complement_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// RFC 1071 checksum over an arbitrary byte run.
pub fn internet_checksum(data: &[u8]) -> u16 {
    fold(ones_complement_add(0, data))
}

/// IPv4 header checksum; the caller must have zeroed the checksum field.
pub fn ip_checksum(ip_header: &[u8]) -> u16 {
    internet_checksum(ip_header)
}

/// TCP checksum over the IPv4 pseudo-header and the full segment
/// (header plus options); the segment's checksum field must be zero.
pub fn tcp4_checksum(src: &Ipv4Addr, dst: &Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IPPROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    fold(ones_complement_add(ones_complement_add(0, &pseudo), segment))
}

/// TCP checksum over the IPv6 pseudo-header (RFC 8200 §8.1) and the full
/// segment; the segment's checksum field must be zero.
pub fn tcp6_checksum(src: &Ipv6Addr, dst: &Ipv6Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 40];
    pseudo[0..16].copy_from_slice(&src.octets());
    pseudo[16..32].copy_from_slice(&dst.octets());
    pseudo[32..36].copy_from_slice(&(segment.len() as u32).to_be_bytes());
    pseudo[39] = IPPROTO_TCP;
    fold(ones_complement_add(ones_complement_add(0, &pseudo), segment))
}

/// Encode a probe attempt onto the configured source-port range. Entropy
/// from the cookie spreads retransmits of the same attempt number across
/// ports while staying invertible given the cookie.
pub fn get_src_port(first: u16, last: u16, probe_num: u32, validation: &Validation) -> u16 {
    let num_ports = (last - first) as u32 + 1;
    first + (validation[1].wrapping_add(probe_num) % num_ports) as u16
}

/// Pre-filter a reply's destination port: inside the configured range and
/// within the window of attempt numbers this run can have sent. The port
/// alone never accepts a packet; the ack check is the final authority.
pub fn check_dst_port(
    port: u16,
    first: u16,
    last: u16,
    packet_streams: u32,
    validation: &Validation,
) -> bool {
    decode_dst_port(port, first, last, validation)
        .map(|probe_num| probe_num < packet_streams)
        .unwrap_or(false)
}

/// Invert `get_src_port`: recover the candidate probe attempt number from
/// an observed destination port, or `None` if the port is out of range.
pub fn decode_dst_port(port: u16, first: u16, last: u16, validation: &Validation) -> Option<u32> {
    if port < first || port > last {
        return None;
    }
    let num_ports = (last - first) as u32 + 1;
    let to_validate = (port - first) as u32;
    let offset = validation[1] % num_ports;
    Some((to_validate + num_ports - offset) % num_ports)
}
