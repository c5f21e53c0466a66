//! Probe module for TCP SYN scans over IPv6 with a configurable TCP
//! options payload, e.g. `--probe-args hex:020405a01030301010101080a...`.
//! Replies are classified as synack (open port) or rst (closed port).

use std::net::IpAddr;

use log::info;

use crate::crypto::Validation;
use crate::error::ProbeError;
use crate::fieldset::{FieldDef, FieldSet, FieldValue};
use crate::net::MacAddress;

use super::packet::*;
use super::probe_modules::{ProbeConf, ProbeModule};

const MAX_OPT_LEN: usize = 40;

const FIELDS: &[FieldDef] = &[
    FieldDef { name: "classification", ftype: "string", desc: "packet classification" },
    FieldDef { name: "success", ftype: "bool", desc: "is response considered success" },
    FieldDef { name: "sport", ftype: "int", desc: "TCP source port" },
    FieldDef { name: "dport", ftype: "int", desc: "TCP destination port" },
    FieldDef { name: "seqnum", ftype: "int", desc: "TCP sequence number" },
    FieldDef { name: "acknum", ftype: "int", desc: "TCP acknowledgement number" },
    FieldDef { name: "window", ftype: "int", desc: "TCP window" },
    FieldDef { name: "optionslen", ftype: "int", desc: "length of TCP options in bytes" },
    FieldDef { name: "options", ftype: "string", desc: "TCP options, hex-encoded" },
    FieldDef { name: "mss", ftype: "int", desc: "TCP maximum segment size, if present" },
    FieldDef { name: "wscale", ftype: "int", desc: "TCP window scale shift, if present" },
    FieldDef { name: "sackok", ftype: "bool", desc: "SACK-permitted option present" },
    FieldDef { name: "tsval", ftype: "int", desc: "TCP timestamp value, if present" },
    FieldDef { name: "tsecr", ftype: "int", desc: "TCP timestamp echo reply, if present" },
];

pub struct ModuleIpv6TcpSynOpt {
    opts: Vec<u8>,
    packet_length: usize,
    source_port_first: u16,
    source_port_last: u16,
    target_port: u16,
    packet_streams: u32,
}

impl ModuleIpv6TcpSynOpt {
    pub fn new() -> Self {
        Self {
            opts: Vec::new(),
            packet_length: ETH_HDR_LEN + IPV6_HDR_LEN + TCP_HDR_LEN,
            source_port_first: 0,
            source_port_last: 0,
            target_port: 0,
            packet_streams: 1,
        }
    }

    fn parse_probe_args(args: &str) -> Result<Vec<u8>, ProbeError> {
        let (kind, value) = args
            .split_once(':')
            .ok_or_else(|| ProbeError::BadArgs(args.to_string()))?;
        if kind != "hex" {
            return Err(ProbeError::BadArgs(args.to_string()));
        }
        // hex::decode rejects odd-length strings, so the multiple-of-4
        // check below sees the true decoded byte count.
        let opts = hex::decode(value)?;
        if opts.len() % 4 != 0 {
            return Err(ProbeError::UnalignedOptions(opts.len()));
        }
        if opts.len() > MAX_OPT_LEN {
            return Err(ProbeError::OversizedOptions(opts.len(), MAX_OPT_LEN));
        }
        Ok(opts)
    }
}

impl Default for ModuleIpv6TcpSynOpt {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeModule for ModuleIpv6TcpSynOpt {
    fn name(&self) -> &'static str {
        "ipv6_tcp_synopt"
    }

    fn packet_length(&self) -> usize {
        self.packet_length
    }

    fn pcap_filter(&self) -> &'static str {
        "ip6 proto 6 && (ip6[53] & 4 != 0 || ip6[53] == 18)"
    }

    fn pcap_snaplen(&self) -> usize {
        116 + MAX_OPT_LEN
    }

    fn global_initialize(&mut self, conf: &ProbeConf) -> Result<(), ProbeError> {
        self.source_port_first = conf.source_port_first;
        self.source_port_last = conf.source_port_last;
        self.target_port = conf.target_port;
        self.packet_streams = conf.packet_streams;

        match conf.probe_args.as_deref().filter(|a| !a.is_empty()) {
            Some(args) => self.opts = Self::parse_probe_args(args)?,
            None => info!("no probe-args given, sending SYNs without tcp options"),
        }
        self.packet_length = ETH_HDR_LEN + IPV6_HDR_LEN + TCP_HDR_LEN + self.opts.len();
        Ok(())
    }

    fn thread_initialize(
        &self,
        buf: &mut [u8],
        src_mac: &MacAddress,
        gw_mac: &MacAddress,
        dst_port: u16,
    ) -> Result<(), ProbeError> {
        if buf.len() < self.packet_length {
            return Err(ProbeError::BufferTooSmall {
                need: self.packet_length,
                have: buf.len(),
            });
        }
        buf.fill(0);
        make_eth_header(buf, src_mac, gw_mac, ETHERTYPE_IPV6);

        let ip = &mut buf[ETH_HDR_LEN..];
        make_ipv6_header(ip, IPPROTO_TCP, (TCP_HDR_LEN + self.opts.len()) as u16);

        let tcp = &mut ip[IPV6_HDR_LEN..];
        make_tcp_header(tcp, dst_port, TH_SYN);
        set_tcp_data_offset(tcp, (TCP_HDR_LEN / 4 + self.opts.len() / 4) as u8);
        tcp[TCP_HDR_LEN..TCP_HDR_LEN + self.opts.len()].copy_from_slice(&self.opts);
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
        let (IpAddr::V6(src), IpAddr::V6(dst)) = (src, dst) else {
            return Err(ProbeError::AddressFamily);
        };
        if buf.len() < self.packet_length {
            return Err(ProbeError::BufferTooSmall {
                need: self.packet_length,
                have: buf.len(),
            });
        }

        let (ip, tcp) = buf[ETH_HDR_LEN..self.packet_length].split_at_mut(IPV6_HDR_LEN);
        set_ipv6_addrs(ip, src, dst);
        set_ipv6_hop_limit(ip, ttl);

        let sport = get_src_port(
            self.source_port_first,
            self.source_port_last,
            probe_num,
            validation,
        );
        set_tcp_sport(tcp, sport);
        set_tcp_seq(tcp, validation[0]);

        // Checksum last, over the final segment bytes.
        set_tcp_checksum(tcp, 0);
        let csum = tcp6_checksum(src, dst, tcp);
        set_tcp_checksum(tcp, csum);
        Ok(())
    }

    fn print_packet(&self, buf: &[u8]) {
        let Some(ip6) = buf.get(ETH_HDR_LEN..).and_then(Ipv6Fields::unpack) else {
            return;
        };
        let Some(tcp) = buf
            .get(ETH_HDR_LEN + IPV6_HDR_LEN..)
            .and_then(TcpFields::unpack)
        else {
            return;
        };
        println!(
            "tcp {{ source: {} | dest: {} | seq: {} | checksum: {:#06x} }}",
            tcp.sport, tcp.dport, tcp.seq, tcp.checksum
        );
        println!(
            "ip6 {{ saddr: {} | daddr: {} | plen: {} | hlim: {} }}",
            ip6.src, ip6.dst, ip6.payload_len, ip6.hop_limit
        );
        println!("------------------------------------------------------");
    }

    fn validate_packet(&self, net: &[u8], validation: &Validation) -> bool {
        let Some(ip6) = Ipv6Fields::unpack(net) else {
            return false;
        };
        if ip6.next_header != IPPROTO_TCP {
            return false;
        }
        // Declared payload must fit in what was actually captured.
        if ip6.payload_len as usize > net.len() - IPV6_HDR_LEN {
            return false;
        }
        let Some(tcp) = TcpFields::unpack(&net[IPV6_HDR_LEN..]) else {
            return false;
        };
        // Reply comes from the scanned service port.
        if tcp.sport != self.target_port {
            return false;
        }
        // Reply's destination port must decode to a plausible attempt.
        if !check_dst_port(
            tcp.dport,
            self.source_port_first,
            self.source_port_last,
            self.packet_streams,
            validation,
        ) {
            return false;
        }
        // The peer must have echoed our secret sequence number plus one.
        tcp.ack == validation[0].wrapping_add(1)
    }

    fn process_packet(&self, frame: &[u8]) -> FieldSet {
        let mut fs = FieldSet::new();
        let tcp_bytes = frame.get(ETH_HDR_LEN + IPV6_HDR_LEN..).unwrap_or(&[]);
        let Some(tcp) = TcpFields::unpack(tcp_bytes) else {
            return fs;
        };

        let classification = classify(tcp.flags);
        fs.add("classification", FieldValue::Str(classification));
        fs.add_bool("success", classification == "synack");
        fs.add_uint("sport", tcp.sport as u64);
        fs.add_uint("dport", tcp.dport as u64);
        fs.add_uint("seqnum", tcp.seq as u64);
        fs.add_uint("acknum", tcp.ack as u64);
        fs.add_uint("window", tcp.window as u64);

        // Option bytes: bounded by both the header's declared data offset
        // and what the capture actually delivered.
        let declared = (tcp.data_offset as usize).saturating_sub(TCP_HDR_LEN / 4) * 4;
        let available = tcp_bytes.len().saturating_sub(TCP_HDR_LEN);
        let optlen = declared.min(available);
        let opts = &tcp_bytes[TCP_HDR_LEN..TCP_HDR_LEN + optlen];

        fs.add_uint("optionslen", optlen as u64);
        fs.add("options", FieldValue::String(hex::encode(opts)));
        parse_tcp_options(opts, &mut fs);
        fs
    }

    fn fields(&self) -> &'static [FieldDef] {
        FIELDS
    }

    fn helptext(&self) -> &'static str {
        "Probe module that sends an IPv6+TCP SYN packet, optionally carrying \
         a fixed TCP options payload (--probe-args hex:...), to a specific \
         port. Possible classifications are: synack and rst. A SYN-ACK is \
         considered a success and a reset packet a failed response."
    }
}

fn classify(flags: u8) -> &'static str {
    if flags & TH_RST != 0 {
        "rst"
    } else if flags & TH_SYN != 0 && flags & TH_ACK != 0 {
        "synack"
    } else {
        "other"
    }
}

/// Walk the TCP options the peer sent back and surface the ones the scan
/// measures. Malformed option lists terminate the walk; whatever parsed up
/// to that point is kept.
fn parse_tcp_options(opts: &[u8], fs: &mut FieldSet) {
    const TCPOPT_EOL: u8 = 0;
    const TCPOPT_NOP: u8 = 1;
    const TCPOPT_MSS: u8 = 2;
    const TCPOPT_WSCALE: u8 = 3;
    const TCPOPT_SACK_PERMITTED: u8 = 4;
    const TCPOPT_TIMESTAMP: u8 = 8;

    let mut mss = FieldValue::None;
    let mut wscale = FieldValue::None;
    let mut sackok = false;
    let mut tsval = FieldValue::None;
    let mut tsecr = FieldValue::None;

    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            TCPOPT_EOL => break,
            TCPOPT_NOP => i += 1,
            kind => {
                let Some(&len) = opts.get(i + 1) else { break };
                let len = len as usize;
                if len < 2 || i + len > opts.len() {
                    break;
                }
                let data = &opts[i + 2..i + len];
                match (kind, data.len()) {
                    (TCPOPT_MSS, 2) => {
                        mss = FieldValue::Uint(u16::from_be_bytes([data[0], data[1]]) as u64);
                    }
                    (TCPOPT_WSCALE, 1) => wscale = FieldValue::Uint(data[0] as u64),
                    (TCPOPT_SACK_PERMITTED, 0) => sackok = true,
                    (TCPOPT_TIMESTAMP, 8) => {
                        tsval = FieldValue::Uint(u32::from_be_bytes(
                            data[0..4].try_into().unwrap(),
                        ) as u64);
                        tsecr = FieldValue::Uint(u32::from_be_bytes(
                            data[4..8].try_into().unwrap(),
                        ) as u64);
                    }
                    _ => {}
                }
                i += len;
            }
        }
    }

    fs.add("mss", mss);
    fs.add("wscale", wscale);
    fs.add_bool("sackok", sackok);
    fs.add("tsval", tsval);
    fs.add("tsecr", tsecr);
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    const V: Validation = [0x11223344, 0x55667788, 0x99aabbcc, 0xddeeff00];

    fn conf(probe_args: Option<&str>) -> ProbeConf {
        ProbeConf {
            source_port_first: 40000,
            source_port_last: 40002,
            target_port: 443,
            packet_streams: 1,
            probe_args: probe_args.map(String::from),
        }
    }

    fn initialized(probe_args: Option<&str>) -> ModuleIpv6TcpSynOpt {
        let mut module = ModuleIpv6TcpSynOpt::new();
        module.global_initialize(&conf(probe_args)).unwrap();
        module
    }

    fn build_probe(module: &ModuleIpv6TcpSynOpt, src: &IpAddr, dst: &IpAddr) -> Vec<u8> {
        let mut buf = vec![0u8; module.packet_length()];
        let src_mac = MacAddress::new([0xaa, 0x41, 0x72, 0x51, 0x54, 0x42]);
        let gw_mac = MacAddress::new([0xe2, 0xf9, 0xf6, 0xdb, 0x38, 0x4a]);
        module
            .thread_initialize(&mut buf, &src_mac, &gw_mac, 443)
            .unwrap();
        module.make_packet(&mut buf, src, dst, 64, &V, 0).unwrap();
        buf
    }

    /// Synthetic reply frame as the probed host would send it.
    fn build_reply(sport: u16, dport: u16, ack: u32, flags: u8, opts: &[u8]) -> Vec<u8> {
        let src: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let tcp_len = TCP_HDR_LEN + opts.len();
        let mut frame = vec![0u8; ETH_HDR_LEN + IPV6_HDR_LEN + tcp_len];
        make_eth_header(
            &mut frame,
            &MacAddress::new([2; 6]),
            &MacAddress::new([4; 6]),
            ETHERTYPE_IPV6,
        );
        let (ip, tcp) = frame[ETH_HDR_LEN..].split_at_mut(IPV6_HDR_LEN);
        make_ipv6_header(ip, IPPROTO_TCP, tcp_len as u16);
        set_ipv6_addrs(ip, &src, &dst);
        make_tcp_header(tcp, dport, flags);
        set_tcp_sport(tcp, sport);
        set_tcp_data_offset(tcp, (tcp_len / 4) as u8);
        set_tcp_seq(tcp, 0x42424242);
        set_tcp_ack(tcp, ack);
        tcp[TCP_HDR_LEN..].copy_from_slice(opts);
        frame
    }

    #[test]
    fn test_global_initialize_rejects_unaligned_options() {
        let mut module = ModuleIpv6TcpSynOpt::new();
        let err = module
            .global_initialize(&conf(Some("hex:010101")))
            .unwrap_err();
        assert!(matches!(err, ProbeError::UnalignedOptions(3)));
    }

    #[test]
    fn test_global_initialize_rejects_odd_hex() {
        let mut module = ModuleIpv6TcpSynOpt::new();
        let err = module
            .global_initialize(&conf(Some("hex:01010")))
            .unwrap_err();
        assert!(matches!(err, ProbeError::BadHex(_)));
    }

    #[test]
    fn test_global_initialize_rejects_bad_syntax() {
        let mut module = ModuleIpv6TcpSynOpt::new();
        assert!(matches!(
            module.global_initialize(&conf(Some("01010101"))).unwrap_err(),
            ProbeError::BadArgs(_)
        ));
        assert!(matches!(
            module
                .global_initialize(&conf(Some("base64:AAAA")))
                .unwrap_err(),
            ProbeError::BadArgs(_)
        ));
    }

    #[test]
    fn test_global_initialize_rejects_oversized_options() {
        let mut module = ModuleIpv6TcpSynOpt::new();
        let args = format!("hex:{}", "01".repeat(44));
        let err = module.global_initialize(&conf(Some(&args))).unwrap_err();
        assert!(matches!(err, ProbeError::OversizedOptions(44, 40)));
    }

    #[test]
    fn test_packet_length_includes_options() {
        let module = initialized(Some("hex:0101010101010101"));
        assert_eq!(
            module.packet_length(),
            ETH_HDR_LEN + IPV6_HDR_LEN + TCP_HDR_LEN + 8
        );
    }

    #[test]
    fn test_make_packet_rejects_v4_addresses() {
        let module = initialized(None);
        let mut buf = vec![0u8; module.packet_length()];
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let dst: IpAddr = "10.0.0.2".parse().unwrap();
        let err = module.make_packet(&mut buf, &src, &dst, 64, &V, 0).unwrap_err();
        assert!(matches!(err, ProbeError::AddressFamily));
    }

    #[test]
    fn test_end_to_end_scenario() {
        let module = initialized(None);
        let src: IpAddr = "2001:db8::1".parse().unwrap();
        let dst: IpAddr = "2001:db8::2".parse().unwrap();
        let probe = build_probe(&module, &src, &dst);

        let tcp = TcpFields::unpack(&probe[ETH_HDR_LEN + IPV6_HDR_LEN..]).unwrap();
        assert_eq!(tcp.flags, TH_SYN);
        assert_eq!(tcp.seq, V[0]);
        assert_eq!(tcp.dport, 443);
        assert!((40000..=40002).contains(&tcp.sport));
        assert_ne!(tcp.checksum, 0);

        // The reply mirrors our source port and acknowledges seq + 1.
        let reply = build_reply(443, tcp.sport, V[0].wrapping_add(1), TH_SYN | TH_ACK, &[]);
        assert!(module.validate_packet(&reply[ETH_HDR_LEN..], &V));

        let fs = module.process_packet(&reply);
        assert_eq!(fs.get("classification"), Some(&FieldValue::Str("synack")));
        assert_eq!(fs.get("success"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_validate_rejects_ack_bit_flips() {
        let module = initialized(None);
        let src: IpAddr = "2001:db8::1".parse().unwrap();
        let dst: IpAddr = "2001:db8::2".parse().unwrap();
        let probe = build_probe(&module, &src, &dst);
        let sport = TcpFields::unpack(&probe[ETH_HDR_LEN + IPV6_HDR_LEN..])
            .unwrap()
            .sport;

        let good_ack = V[0].wrapping_add(1);
        for bit in 0..32 {
            let reply = build_reply(443, sport, good_ack ^ (1 << bit), TH_SYN | TH_ACK, &[]);
            assert!(!module.validate_packet(&reply[ETH_HDR_LEN..], &V));
        }
    }

    #[test]
    fn test_validate_check_order_rejections() {
        let module = initialized(None);
        let sport = get_src_port(40000, 40002, 0, &V);
        let good = build_reply(443, sport, V[0].wrapping_add(1), TH_SYN | TH_ACK, &[]);
        assert!(module.validate_packet(&good[ETH_HDR_LEN..], &V));

        // Wrong upper-layer protocol.
        let mut wrong_proto = good.clone();
        wrong_proto[ETH_HDR_LEN + 6] = 17;
        assert!(!module.validate_packet(&wrong_proto[ETH_HDR_LEN..], &V));

        // Source port is not the scanned service.
        let bad_sport = build_reply(80, sport, V[0].wrapping_add(1), TH_SYN | TH_ACK, &[]);
        assert!(!module.validate_packet(&bad_sport[ETH_HDR_LEN..], &V));

        // Destination port outside the configured source-port range.
        let bad_dport = build_reply(443, 50000, V[0].wrapping_add(1), TH_SYN | TH_ACK, &[]);
        assert!(!module.validate_packet(&bad_dport[ETH_HDR_LEN..], &V));
    }

    #[test]
    fn test_validate_truncation_safety() {
        let module = initialized(None);
        let sport = get_src_port(40000, 40002, 0, &V);
        let reply = build_reply(443, sport, V[0].wrapping_add(1), TH_SYN | TH_ACK, &[]);
        let net = &reply[ETH_HDR_LEN..];
        for len in 0..net.len() {
            // Declared IPv6 payload exceeds the captured bytes, or headers
            // are truncated outright; must reject, never read past the end.
            assert!(!module.validate_packet(&net[..len], &V));
        }
    }

    #[test]
    fn test_classify_rst() {
        let module = initialized(None);
        let sport = get_src_port(40000, 40002, 0, &V);
        let reply = build_reply(443, sport, V[0].wrapping_add(1), TH_RST, &[]);
        assert!(module.validate_packet(&reply[ETH_HDR_LEN..], &V));
        let fs = module.process_packet(&reply);
        assert_eq!(fs.get("classification"), Some(&FieldValue::Str("rst")));
        assert_eq!(fs.get("success"), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn test_process_extracts_options() {
        let module = initialized(None);
        // MSS 1440, wscale 7, SACK-permitted, timestamps, NOP padding to a
        // 4-byte boundary so the data offset covers them exactly.
        let opts: &[u8] = &[
            2, 4, 0x05, 0xa0, //
            3, 3, 7, 1, //
            4, 2, 1, 1, //
            8, 10, 0, 0, 0, 9, 0, 0, 0, 4, //
            1, 1,
        ];
        let reply = build_reply(443, 40001, V[0].wrapping_add(1), TH_SYN | TH_ACK, opts);
        let fs = module.process_packet(&reply);
        assert_eq!(fs.get("optionslen"), Some(&FieldValue::Uint(opts.len() as u64)));
        assert_eq!(fs.get("mss"), Some(&FieldValue::Uint(1440)));
        assert_eq!(fs.get("wscale"), Some(&FieldValue::Uint(7)));
        assert_eq!(fs.get("sackok"), Some(&FieldValue::Bool(true)));
        assert_eq!(fs.get("tsval"), Some(&FieldValue::Uint(9)));
        assert_eq!(fs.get("tsecr"), Some(&FieldValue::Uint(4)));
        assert_eq!(fs.get("options"), Some(&FieldValue::String(hex::encode(opts))));
    }

    #[test]
    fn test_process_truncated_frame_is_empty() {
        let module = initialized(None);
        let fs = module.process_packet(&[0u8; ETH_HDR_LEN + IPV6_HDR_LEN + 4]);
        assert!(fs.is_empty());
    }

    #[test]
    fn test_options_copied_into_template() {
        let module = initialized(Some("hex:020405a001010402"));
        let src: IpAddr = "2001:db8::1".parse().unwrap();
        let dst: IpAddr = "2001:db8::2".parse().unwrap();
        let probe = build_probe(&module, &src, &dst);
        let tcp = &probe[ETH_HDR_LEN + IPV6_HDR_LEN..];
        assert_eq!(tcp[TCP_HDR_LEN..], [0x02, 0x04, 0x05, 0xa0, 0x01, 0x01, 0x04, 0x02]);
        assert_eq!(TcpFields::unpack(tcp).unwrap().data_offset, 7);

        // Declared IPv6 payload length covers header plus options.
        let ip6 = Ipv6Fields::unpack(&probe[ETH_HDR_LEN..]).unwrap();
        assert_eq!(ip6.payload_len as usize, TCP_HDR_LEN + 8);
    }
}
