use std::{
    net::IpAddr,
    num::ParseIntError,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use log::{debug, warn};

use crate::{
    crypto::{validate, AesCtx},
    error::ScanError,
    net::{get_default_gw_mac, get_default_interface, MacAddress},
    probe_modules::{probe_module_names, ProbeConf},
    state::{ReceiverStats, SenderStats},
};

fn parse_duration(arg: &str) -> Result<Duration, ParseIntError> {
    Ok(Duration::from_secs(arg.parse()?))
}

fn parse_bandwidth(arg: &str) -> Result<u64, ParseIntError> {
    let arg_split = arg.split_at(arg.len().saturating_sub(1));
    let mut bandwidth: u64 = arg_split.0.parse()?;

    if arg_split.1 == "G" || arg_split.1 == "g" {
        bandwidth *= 1_000_000_000;
    } else if arg_split.1 == "M" || arg_split.1 == "m" {
        bandwidth *= 1_000_000;
    } else if arg_split.1 == "K" || arg_split.1 == "k" {
        bandwidth *= 1_000;
    } else {
        bandwidth = 0;
        warn!("Unknown bandwidth suffix (supported suffixes are G, M and K)");
    }

    Ok(bandwidth)
}

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Probe module to use
    #[arg(short = 'M', long, default_value = "ipv6_tcp_synopt")]
    pub probe_module: String,

    /// Module-specific arguments (e.g. "hex:<tcp option bytes>")
    #[arg(long)]
    pub probe_args: Option<String>,

    /// File of targets, one "dst[,src]" address per line; "-" reads stdin
    #[arg(short = 'f', long, default_value = "-")]
    pub target_file: String,

    /// TCP port number to scan (for SYN scans)
    #[arg(short = 'p', long, default_value_t = 443)]
    pub target_port: u16,

    /// Output file
    #[arg(short, long, default_value_t = String::from("recv.log"))]
    pub output_file: String,

    /// Cap number of targets to probe
    #[arg(short = 'n', long, default_value_t = u32::MAX)]
    pub max_targets: u32,

    /// Cap number of results to return
    #[arg(short = 'R', long, default_value_t = u32::MAX)]
    pub max_results: u32,

    /// Cap length of time for sending packets, in seconds
    #[arg(short = 't', long, default_value_t = 0)]
    pub max_runtime: u32,

    /// Set send rate in packets/sec
    #[arg(short, long, default_value_t = 0)]
    pub rate: i32,

    /// Set send rate in bits/second (supports suffixes G, M and K)
    #[arg(short = 'B', long, value_parser = parse_bandwidth, default_value = "0K")]
    pub bandwidth: u64,

    /// How long to continue receiving after sending last probe
    #[arg(short, long, value_parser = parse_duration, default_value = "8")]
    pub cooldown_secs: Duration,

    /// Seed for the validation secret; non-zero makes cookies reproducible
    #[arg(short = 'e', long, default_value_t = 0)]
    pub seed: u32,

    /// Threads used to send packets
    #[arg(short = 'T', long, default_value_t = 1)]
    pub sender_threads: u32,

    /// Number of probes to send to each target
    #[arg(short = 'P', long, default_value_t = 1)]
    pub probes: u32,

    /// Don't actually send packets
    #[arg(short, long)]
    pub dryrun: bool,

    /// In dryrun mode, suppress printing packets on send
    #[arg(short, long)]
    pub quiet: bool,

    /// First source port for scan packets
    #[arg(long, default_value_t = 32768)]
    pub source_port_first: u16,

    /// Last source port for scan packets
    #[arg(long, default_value_t = 61000)]
    pub source_port_last: u16,

    /// Source address for probes when the target file gives no override
    #[arg(short = 's', long, default_value = "::")]
    pub source_ip: IpAddr,

    /// Hop limit / TTL for outgoing probes
    #[arg(long, default_value_t = 255)]
    pub probe_ttl: u8,

    /// Specify network interface to use
    #[arg(short, long, default_value = "")]
    pub interface: String,

    /// Specify gateway MAC address
    #[arg(short = 'G', long, default_value = "00:00:00:00:00:00")]
    pub gw_mac: MacAddress,

    /// List available probe modules and exit
    #[arg(long)]
    pub list_probe_modules: bool,
}

impl Config {
    pub fn probe_conf(&self) -> ProbeConf {
        ProbeConf {
            source_port_first: self.source_port_first,
            source_port_last: self.source_port_last,
            target_port: self.target_port,
            packet_streams: self.probes,
            probe_args: self.probe_args.clone(),
        }
    }

    /// Convert a configured bandwidth into a packet rate once the selected
    /// module's on-wire packet length is known.
    pub fn adjust_rate(&mut self, packet_length: usize) {
        if self.bandwidth == 0 {
            return;
        }

        let mut packet_len = packet_length as u64;
        packet_len *= 8;
        packet_len += 8 * 24; // 7 byte MAC preamble, 1 byte Start frame,
                              // 4 byte CRC, 12 byte inter-frame gap
        if packet_len < 84 * 8 {
            packet_len = 84 * 8;
        }

        if self.bandwidth / packet_len > 0xFFFFFFFF {
            self.rate = 0;
        } else {
            self.rate = (self.bandwidth / packet_len) as i32;
            if self.rate == 0 {
                warn!(
                    "Sender bandwidth {} bit/s is slower than 1 pkt/s, setting rate to 1 pkt/s",
                    self.bandwidth
                );
                self.rate = 1;
            }
        }
        debug!(
            "Sender using bandwidth {} bit/s, rate set to {} pkt/s",
            self.bandwidth, self.rate
        );
    }
}

#[derive(Clone, Debug)]
pub struct Context {
    pub config: Config,
    pub validate_ctx: AesCtx,
    pub sender_stats: Arc<Mutex<SenderStats>>,
    pub receiver_stats: Arc<Mutex<ReceiverStats>>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let validate_ctx = validate::new_context(config.seed);
        Self {
            config,
            validate_ctx,
            sender_stats: Arc::new(Mutex::new(SenderStats::default())),
            receiver_stats: Arc::new(Mutex::new(ReceiverStats::default())),
        }
    }
}

/// Parse the command line and fill in discoverable defaults. Everything
/// that can fail here is a fatal configuration error.
pub fn create_config() -> Result<Config, ScanError> {
    let mut config = Config::parse();

    if config.source_port_first > config.source_port_last {
        return Err(ScanError::Config(format!(
            "source port range is empty: [{}, {}]",
            config.source_port_first, config.source_port_last
        )));
    }

    if config.probes == 0 {
        return Err(ScanError::Config("--probes must be at least 1".into()));
    }

    if config.sender_threads == 0 {
        return Err(ScanError::Config("--sender-threads must be at least 1".into()));
    }

    if !probe_module_names().contains(&config.probe_module.as_str()) {
        return Err(ScanError::Config(format!(
            "unknown probe module {:?} (available: {})",
            config.probe_module,
            probe_module_names().join(", ")
        )));
    }

    // Listing needs no interface or gateway discovery.
    if config.list_probe_modules {
        return Ok(config);
    }

    if config.interface.is_empty() {
        config.interface = get_default_interface()?;
        debug!("Using default interface {}", config.interface);
    }

    if !config.dryrun && config.gw_mac.is_zero() {
        config.gw_mac = get_default_gw_mac()?;
        debug!("Using discovered gateway MAC {}", config.gw_mac);
    }

    Ok(config)
}
