pub mod module_ipv6_tcp_synopt;
pub mod module_tcp_synscan;
pub mod packet;
pub mod probe_modules;

pub use probe_modules::{get_probe_module, probe_module_names, ProbeConf, ProbeModule};
