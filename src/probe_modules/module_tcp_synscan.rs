//! Classic IPv4 TCP SYN scan probe module.

use std::net::IpAddr;

use crate::crypto::Validation;
use crate::error::ProbeError;
use crate::fieldset::{FieldDef, FieldSet, FieldValue};
use crate::net::MacAddress;

use super::packet::*;
use super::probe_modules::{ProbeConf, ProbeModule};

pub const PACKET_LENGTH: usize = ETH_HDR_LEN + IPV4_HDR_LEN + TCP_HDR_LEN;

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "classification", ftype: "string", desc: "packet classification" },
    FieldDef { name: "success", ftype: "bool", desc: "is response considered success" },
    FieldDef { name: "sport", ftype: "int", desc: "TCP source port" },
    FieldDef { name: "dport", ftype: "int", desc: "TCP destination port" },
    FieldDef { name: "seqnum", ftype: "int", desc: "TCP sequence number" },
    FieldDef { name: "acknum", ftype: "int", desc: "TCP acknowledgement number" },
    FieldDef { name: "window", ftype: "int", desc: "TCP window" },
];

pub struct ModuleTcpSynScan {
    source_port_first: u16,
    source_port_last: u16,
    target_port: u16,
    packet_streams: u32,
}

impl ModuleTcpSynScan {
    pub fn new() -> Self {
        Self {
            source_port_first: 0,
            source_port_last: 0,
            target_port: 0,
            packet_streams: 1,
        }
    }
}

impl Default for ModuleTcpSynScan {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeModule for ModuleTcpSynScan {
    fn name(&self) -> &'static str {
        "tcp_synscan"
    }

    fn packet_length(&self) -> usize {
        PACKET_LENGTH
    }

    fn pcap_filter(&self) -> &'static str {
        "tcp && tcp[13] & 4 != 0 || tcp[13] == 18"
    }

    fn pcap_snaplen(&self) -> usize {
        96
    }

    fn global_initialize(&mut self, conf: &ProbeConf) -> Result<(), ProbeError> {
        if let Some(args) = conf.probe_args.as_deref().filter(|a| !a.is_empty()) {
            return Err(ProbeError::BadArgs(format!(
                "tcp_synscan takes no probe-args, got {:?}",
                args
            )));
        }
        self.source_port_first = conf.source_port_first;
        self.source_port_last = conf.source_port_last;
        self.target_port = conf.target_port;
        self.packet_streams = conf.packet_streams;
        Ok(())
    }

    fn thread_initialize(
        &self,
        buf: &mut [u8],
        src_mac: &MacAddress,
        gw_mac: &MacAddress,
        dst_port: u16,
    ) -> Result<(), ProbeError> {
        if buf.len() < PACKET_LENGTH {
            return Err(ProbeError::BufferTooSmall {
                need: PACKET_LENGTH,
                have: buf.len(),
            });
        }
        buf.fill(0);
        make_eth_header(buf, src_mac, gw_mac, ETHERTYPE_IPV4);
        let ip = &mut buf[ETH_HDR_LEN..];
        make_ipv4_header(ip, IPPROTO_TCP, (IPV4_HDR_LEN + TCP_HDR_LEN) as u16);
        make_tcp_header(&mut ip[IPV4_HDR_LEN..], dst_port, TH_SYN);
        Ok(())
    }

    fn make_packet(
        &self,
        buf: &mut [u8],
        src: &IpAddr,
        dst: &IpAddr,
        ttl: u8,
        validation: &Validation,
        probe_num: u32,
    ) -> Result<(), ProbeError> {
        let (IpAddr::V4(src), IpAddr::V4(dst)) = (src, dst) else {
            return Err(ProbeError::AddressFamily);
        };
        if buf.len() < PACKET_LENGTH {
            return Err(ProbeError::BufferTooSmall {
                need: PACKET_LENGTH,
                have: buf.len(),
            });
        }

        let (ip, tcp) = buf[ETH_HDR_LEN..PACKET_LENGTH].split_at_mut(IPV4_HDR_LEN);
        set_ipv4_addrs(ip, src, dst);
        set_ipv4_ttl(ip, ttl);

        let sport = get_src_port(
            self.source_port_first,
            self.source_port_last,
            probe_num,
            validation,
        );
        set_tcp_sport(tcp, sport);
        set_tcp_seq(tcp, validation[0]);

        set_tcp_checksum(tcp, 0);
        let tcp_csum = tcp4_checksum(src, dst, tcp);
        set_tcp_checksum(tcp, tcp_csum);

        set_ipv4_checksum(ip, 0);
        let ip_csum = ip_checksum(ip);
        set_ipv4_checksum(ip, ip_csum);
        Ok(())
    }

    fn print_packet(&self, buf: &[u8]) {
        let Some(ip) = buf.get(ETH_HDR_LEN..).and_then(Ipv4Fields::unpack) else {
            return;
        };
        let Some(tcp) = buf
            .get(ETH_HDR_LEN + IPV4_HDR_LEN..)
            .and_then(TcpFields::unpack)
        else {
            return;
        };
        println!(
            "tcp {{ source: {} | dest: {} | seq: {} | checksum: {:#06x} }}",
            tcp.sport, tcp.dport, tcp.seq, tcp.checksum
        );
        println!(
            "ip {{ saddr: {} | daddr: {} | ttl: {} }}",
            ip.src, ip.dst, ip.ttl
        );
        println!("------------------------------------------------------");
    }

    fn validate_packet(&self, net: &[u8], validation: &Validation) -> bool {
        let Some(ip) = Ipv4Fields::unpack(net) else {
            return false;
        };
        if ip.protocol != IPPROTO_TCP {
            return false;
        }
        if ip.total_len as usize > net.len() {
            return false;
        }
        let Some(tcp) = net.get(ip.header_len..).and_then(TcpFields::unpack) else {
            return false;
        };
        if tcp.sport != self.target_port {
            return false;
        }
        if !check_dst_port(
            tcp.dport,
            self.source_port_first,
            self.source_port_last,
            self.packet_streams,
            validation,
        ) {
            return false;
        }
        tcp.ack == validation[0].wrapping_add(1)
    }

    fn process_packet(&self, frame: &[u8]) -> FieldSet {
        let mut fs = FieldSet::new();
        let Some(ip) = frame.get(ETH_HDR_LEN..).and_then(Ipv4Fields::unpack) else {
            return fs;
        };
        let Some(tcp) = frame
            .get(ETH_HDR_LEN + ip.header_len..)
            .and_then(TcpFields::unpack)
        else {
            return fs;
        };

        let classification = if tcp.flags & TH_RST != 0 { "rst" } else { "synack" };
        fs.add("classification", FieldValue::Str(classification));
        fs.add_bool("success", classification == "synack");
        fs.add_uint("sport", tcp.sport as u64);
        fs.add_uint("dport", tcp.dport as u64);
        fs.add_uint("seqnum", tcp.seq as u64);
        fs.add_uint("acknum", tcp.ack as u64);
        fs.add_uint("window", tcp.window as u64);
        fs
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn helptext(&self) -> &'static str {
        "Probe module that sends a TCP SYN packet to a specific port. \
         Possible classifications are: synack and rst. A SYN-ACK packet is \
         considered a success and a reset packet is considered a failed \
         response."
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const V: Validation = [0xcafef00d, 0x12345678, 0x55555555, 0xaaaaaaaa];

    fn initialized() -> ModuleTcpSynScan {
        let mut module = ModuleTcpSynScan::new();
        module
            .global_initialize(&ProbeConf {
                source_port_first: 32768,
                source_port_last: 61000,
                target_port: 443,
                packet_streams: 1,
                probe_args: None,
            })
            .unwrap();
        module
    }

    fn build_reply(sport: u16, dport: u16, ack: u32, flags: u8) -> Vec<u8> {
        let src = Ipv4Addr::new(192, 0, 2, 7);
        let dst = Ipv4Addr::new(192, 0, 2, 1);
        let mut frame = vec![0u8; PACKET_LENGTH];
        make_eth_header(
            &mut frame,
            &MacAddress::new([2; 6]),
            &MacAddress::new([4; 6]),
            ETHERTYPE_IPV4,
        );
        let (ip, tcp) = frame[ETH_HDR_LEN..].split_at_mut(IPV4_HDR_LEN);
        make_ipv4_header(ip, IPPROTO_TCP, (IPV4_HDR_LEN + TCP_HDR_LEN) as u16);
        set_ipv4_addrs(ip, &src, &dst);
        make_tcp_header(tcp, dport, flags);
        set_tcp_sport(tcp, sport);
        set_tcp_ack(tcp, ack);
        frame
    }

    #[test]
    fn test_build_and_validate_round_trip() {
        let module = initialized();
        let mut buf = vec![0u8; module.packet_length()];
        module
            .thread_initialize(
                &mut buf,
                &MacAddress::new([1; 6]),
                &MacAddress::new([2; 6]),
                443,
            )
            .unwrap();
        let src: IpAddr = "192.0.2.1".parse().unwrap();
        let dst: IpAddr = "192.0.2.7".parse().unwrap();
        module.make_packet(&mut buf, &src, &dst, 64, &V, 0).unwrap();

        let ip = Ipv4Fields::unpack(&buf[ETH_HDR_LEN..]).unwrap();
        assert_eq!(ip.protocol, IPPROTO_TCP);
        assert_eq!(ip.src, "192.0.2.1".parse::<Ipv4Addr>().unwrap());

        // IPv4 header checksum verifies to zero with the field in place.
        assert_eq!(
            internet_checksum(&buf[ETH_HDR_LEN..ETH_HDR_LEN + IPV4_HDR_LEN]),
            0
        );

        let tcp = TcpFields::unpack(&buf[ETH_HDR_LEN + IPV4_HDR_LEN..]).unwrap();
        assert_eq!(tcp.flags, TH_SYN);
        assert_eq!(tcp.seq, V[0]);
        assert_ne!(tcp.checksum, 0);

        let reply = build_reply(443, tcp.sport, V[0].wrapping_add(1), TH_SYN | TH_ACK);
        assert!(module.validate_packet(&reply[ETH_HDR_LEN..], &V));
        let fs = module.process_packet(&reply);
        assert_eq!(fs.get("classification"), Some(&FieldValue::Str("synack")));

        let bad = build_reply(443, tcp.sport, V[0].wrapping_add(2), TH_SYN | TH_ACK);
        assert!(!module.validate_packet(&bad[ETH_HDR_LEN..], &V));
    }

    #[test]
    fn test_rejects_v6_addresses() {
        let module = initialized();
        let mut buf = vec![0u8; PACKET_LENGTH];
        let src: IpAddr = "2001:db8::1".parse().unwrap();
        let dst: IpAddr = "2001:db8::2".parse().unwrap();
        assert!(matches!(
            module.make_packet(&mut buf, &src, &dst, 64, &V, 0).unwrap_err(),
            ProbeError::AddressFamily
        ));
    }

    #[test]
    fn test_rejects_probe_args() {
        let mut module = ModuleTcpSynScan::new();
        let err = module
            .global_initialize(&ProbeConf {
                source_port_first: 32768,
                source_port_last: 61000,
                target_port: 443,
                packet_streams: 1,
                probe_args: Some("hex:01010101".into()),
            })
            .unwrap_err();
        assert!(matches!(err, ProbeError::BadArgs(_)));
    }

    #[test]
    fn test_validate_truncation_safety() {
        let module = initialized();
        let sport = get_src_port(32768, 61000, 0, &V);
        let reply = build_reply(443, sport, V[0].wrapping_add(1), TH_SYN | TH_ACK);
        let net = &reply[ETH_HDR_LEN..];
        assert!(module.validate_packet(net, &V));
        for len in 0..net.len() {
            assert!(!module.validate_packet(&net[..len], &V));
        }
    }
}
