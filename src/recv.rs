use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use etherparse::{NetSlice, SlicedPacket};
use log::{debug, warn};

use crate::config::Context;
use crate::crypto::validate;
use crate::error::ScanError;
use crate::net::pcap::PacketCapture;
use crate::probe_modules::packet::ETH_HDR_LEN;
use crate::probe_modules::ProbeModule;

pub struct Receiver {
    ctx: Context,
    module: Arc<dyn ProbeModule>,
    pcap: PacketCapture,
    seen_ips: HashSet<IpAddr>,
    output: BufWriter<File>,
}

impl Receiver {
    pub fn new(ctx: Context, module: Arc<dyn ProbeModule>) -> Result<Self, ScanError> {
        let pcap = PacketCapture::open(&ctx.config.interface, module.pcap_snaplen())?
            .with_filter(module.pcap_filter())?;

        let mut output = BufWriter::new(File::create(&ctx.config.output_file)?);
        let header: Vec<&str> = module.fields().iter().map(|f| f.name).collect();
        writeln!(output, "ts,saddr,{}", header.join(","))?;

        Ok(Self {
            ctx,
            module,
            pcap,
            seen_ips: HashSet::new(),
            output,
        })
    }

    pub fn run(&mut self) -> Result<(), ScanError> {
        debug!("Receiver thread started");

        // Signal to main thread that receiver thread is ready to go
        let mut zrecv = self.ctx.receiver_stats.lock().unwrap();
        zrecv.ready = true;
        zrecv.start = Instant::now();
        drop(zrecv);

        let Self {
            ctx,
            module,
            pcap,
            seen_ips,
            output,
        } = self;

        loop {
            if let Some(packet) = pcap.next_packet() {
                process_packet(ctx, module.as_ref(), seen_ips, output, packet.data);
            }

            let stats = pcap.stats();
            let mut zrecv = ctx.receiver_stats.lock().unwrap();
            zrecv.pcap_recv = stats.ps_recv;
            zrecv.pcap_drop = stats.ps_drop;
            zrecv.pcap_ifdrop = stats.ps_ifdrop;

            if ctx.config.max_results != u32::MAX && zrecv.success_unique >= ctx.config.max_results
            {
                drop(zrecv);
                let mut zsend = ctx.sender_stats.lock().unwrap();
                if !zsend.complete {
                    zsend.complete = true;
                    zsend.finish = Instant::now();
                }
                break;
            }
            drop(zrecv);

            let zsend = ctx.sender_stats.lock().unwrap();
            if zsend.complete && Instant::now() - zsend.finish > ctx.config.cooldown_secs {
                break;
            }
            drop(zsend);
        }

        if let Err(e) = output.flush() {
            warn!("Receiver failed to flush output: {}", e);
        }

        let mut zrecv = ctx.receiver_stats.lock().unwrap();
        zrecv.finish = Instant::now();
        zrecv.complete = true;
        drop(zrecv);

        debug!("Receiver finished");
        Ok(())
    }
}

/// Handle one captured frame. Anything that fails to parse or validate is
/// background traffic: counted at most, never an error.
fn process_packet(
    ctx: &Context,
    module: &dyn ProbeModule,
    seen_ips: &mut HashSet<IpAddr>,
    output: &mut impl Write,
    data: &[u8],
) {
    let Ok(sliced) = SlicedPacket::from_ethernet(data) else {
        return;
    };
    let (src_ip, dst_ip): (IpAddr, IpAddr) = match &sliced.net {
        Some(NetSlice::Ipv4(slice)) => (
            slice.header().source_addr().into(),
            slice.header().destination_addr().into(),
        ),
        Some(NetSlice::Ipv6(slice)) => (
            slice.header().source_addr().into(),
            slice.header().destination_addr().into(),
        ),
        _ => return,
    };

    // The original probe ran from the reply's destination to its source;
    // recomputing the cookie needs the addresses in that order.
    let validation = validate::gen(&ctx.validate_ctx, &dst_ip, &src_ip);

    let Some(net) = data.get(ETH_HDR_LEN..) else {
        return;
    };
    if !module.validate_packet(net, &validation) {
        ctx.receiver_stats.lock().unwrap().validation_failed += 1;
        return;
    }

    let fs = module.process_packet(data);
    let success = matches!(
        fs.get("success"),
        Some(crate::fieldset::FieldValue::Bool(true))
    );

    let mut zrecv = ctx.receiver_stats.lock().unwrap();
    if success {
        zrecv.success_total += 1;

        let is_repeat = seen_ips.contains(&src_ip);
        if !is_repeat {
            zrecv.success_unique += 1;
            seen_ips.insert(src_ip);

            let line = format!("{},{},{}", Utc::now().to_rfc3339(), src_ip, fs.to_csv());
            if let Err(e) = writeln!(output, "{}", line) {
                warn!("Receiver failed to write result: {}", e);
            }
        }

        if ctx.sender_stats.lock().unwrap().complete {
            zrecv.cooldown_total += 1;
            if !is_repeat {
                zrecv.cooldown_unique += 1;
            }
        }
    } else {
        zrecv.failure_total += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use clap::Parser;

    use super::*;
    use crate::config::Config;
    use crate::net::MacAddress;
    use crate::probe_modules::get_probe_module;
    use crate::probe_modules::packet::*;

    fn scan_ctx() -> (Context, Arc<dyn ProbeModule>) {
        let config = Config::parse_from(["zmap6-rs"]);
        let ctx = Context::new(config);
        let mut module = get_probe_module("ipv6_tcp_synopt").unwrap();
        module.global_initialize(&ctx.config.probe_conf()).unwrap();
        (ctx, Arc::from(module))
    }

    /// Reply frame from the scanned host, valid under this run's secret.
    fn build_reply(ctx: &Context, flags: u8, ack_offset: u32) -> Vec<u8> {
        let host: Ipv6Addr = "2001:db8::9".parse().unwrap();
        let scanner: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let v = validate::gen(
            &ctx.validate_ctx,
            &IpAddr::V6(scanner),
            &IpAddr::V6(host),
        );
        let dport = get_src_port(
            ctx.config.source_port_first,
            ctx.config.source_port_last,
            0,
            &v,
        );

        let mut frame = vec![0u8; ETH_HDR_LEN + IPV6_HDR_LEN + TCP_HDR_LEN];
        make_eth_header(
            &mut frame,
            &MacAddress::new([2; 6]),
            &MacAddress::new([4; 6]),
            ETHERTYPE_IPV6,
        );
        let (ip, tcp) = frame[ETH_HDR_LEN..].split_at_mut(IPV6_HDR_LEN);
        make_ipv6_header(ip, IPPROTO_TCP, TCP_HDR_LEN as u16);
        set_ipv6_addrs(ip, &host, &scanner);
        make_tcp_header(tcp, dport, flags);
        set_tcp_sport(tcp, ctx.config.target_port);
        set_tcp_ack(tcp, v[0].wrapping_add(1).wrapping_add(ack_offset));
        frame
    }

    #[test]
    fn test_counters_split_closed_ports_from_validation_failures() {
        let (ctx, module) = scan_ctx();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        // Open port: counted as a success and written out.
        let synack = build_reply(&ctx, TH_SYN | TH_ACK, 0);
        process_packet(&ctx, module.as_ref(), &mut seen, &mut out, &synack);

        // Closed port: a legitimate response to our probe, not a reject.
        let rst = build_reply(&ctx, TH_RST, 0);
        process_packet(&ctx, module.as_ref(), &mut seen, &mut out, &rst);

        // Background traffic: wrong ack, fails cookie validation.
        let stray = build_reply(&ctx, TH_SYN | TH_ACK, 7);
        process_packet(&ctx, module.as_ref(), &mut seen, &mut out, &stray);

        let zrecv = ctx.receiver_stats.lock().unwrap();
        assert_eq!(zrecv.success_total, 1);
        assert_eq!(zrecv.success_unique, 1);
        assert_eq!(zrecv.failure_total, 1);
        assert_eq!(zrecv.validation_failed, 1);

        // Only the synack produced an output line.
        let written = String::from_utf8(out).unwrap();
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("2001:db8::9"));
    }

    #[test]
    fn test_duplicate_success_counted_once() {
        let (ctx, module) = scan_ctx();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        let synack = build_reply(&ctx, TH_SYN | TH_ACK, 0);
        process_packet(&ctx, module.as_ref(), &mut seen, &mut out, &synack);
        process_packet(&ctx, module.as_ref(), &mut seen, &mut out, &synack);

        let zrecv = ctx.receiver_stats.lock().unwrap();
        assert_eq!(zrecv.success_total, 2);
        assert_eq!(zrecv.success_unique, 1);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }
}
