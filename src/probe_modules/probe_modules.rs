use std::net::IpAddr;

use crate::crypto::Validation;
use crate::error::ProbeError;
use crate::fieldset::{FieldDef, FieldSet};
use crate::net::MacAddress;

use super::module_ipv6_tcp_synopt::ModuleIpv6TcpSynOpt;
use super::module_tcp_synscan::ModuleTcpSynScan;

/// The slice of scanner configuration a probe module is allowed to see.
/// Fixed at startup, read-only afterwards; modules copy what they need
/// into their own state during `global_initialize`.
#[derive(Debug, Clone)]
pub struct ProbeConf {
    pub source_port_first: u16,
    pub source_port_last: u16,
    pub target_port: u16,
    /// Number of probes sent per target (attempt numbers `0..packet_streams`).
    pub packet_streams: u32,
    pub probe_args: Option<String>,
}

/// The uniform contract every probe type implements. The orchestrator
/// dispatches through this trait only; it never inspects which variant it
/// holds. One instance exists per process, shared read-only across worker
/// threads after `global_initialize` completes.
pub trait ProbeModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// On-wire length of one probe, valid once `global_initialize` ran
    /// (option payloads extend it).
    fn packet_length(&self) -> usize;

    /// pcap filter handed to the capture layer. The filter is advisory;
    /// `validate_packet` re-checks everything from scratch.
    fn pcap_filter(&self) -> &'static str;

    fn pcap_snaplen(&self) -> usize;

    /// Number of port arguments the scan requires (1 for TCP scans).
    fn port_args(&self) -> usize {
        1
    }

    /// Runs once per process. Parses probe-specific arguments; any failure
    /// here is fatal for the run and must surface before scanning starts.
    fn global_initialize(&mut self, conf: &ProbeConf) -> Result<(), ProbeError>;

    /// Runs once per worker thread: writes every static field of the probe
    /// template into `buf`, which the worker owns exclusively thereafter.
    fn thread_initialize(
        &self,
        buf: &mut [u8],
        src_mac: &MacAddress,
        gw_mac: &MacAddress,
        dst_port: u16,
    ) -> Result<(), ProbeError>;

    /// Patches the dynamic fields of one outgoing probe into the template
    /// and recomputes checksums. No allocation; called at line rate.
    fn make_packet(
        &self,
        buf: &mut [u8],
        src: &IpAddr,
        dst: &IpAddr,
        ttl: u8,
        validation: &Validation,
        probe_num: u32,
    ) -> Result<(), ProbeError>;

    /// Diagnostic dump of one packet; dryrun only, not on the hot path.
    fn print_packet(&self, buf: &[u8]);

    /// Decide whether a captured frame is a response to a probe this run
    /// sent. `net` starts at the network header and ends at the captured
    /// length. Rejection is a normal outcome, not an error.
    fn validate_packet(&self, net: &[u8], validation: &Validation) -> bool;

    /// Turn a validated frame (from the link header) into the declared
    /// field set. Only called after `validate_packet` accepted it.
    fn process_packet(&self, frame: &[u8]) -> FieldSet;

    fn fields(&self) -> &'static [FieldDef];

    fn helptext(&self) -> &'static str;
}

/// Closed set of probe types; chosen once at startup, never mutated after.
pub fn get_probe_module(name: &str) -> Option<Box<dyn ProbeModule>> {
    match name {
        "ipv6_tcp_synopt" => Some(Box::new(ModuleIpv6TcpSynOpt::new())),
        "tcp_synscan" => Some(Box::new(ModuleTcpSynScan::new())),
        _ => None,
    }
}

pub fn probe_module_names() -> &'static [&'static str] {
    &["ipv6_tcp_synopt", "tcp_synscan"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        for name in probe_module_names() {
            let module = get_probe_module(name).unwrap();
            assert_eq!(module.name(), *name);
            assert!(!module.fields().is_empty());
        }
        assert!(get_probe_module("udp_dns").is_none());
    }
}
