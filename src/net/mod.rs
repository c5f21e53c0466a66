pub mod mac;
pub mod pcap;
pub mod socket;

use std::io;
use std::net::Ipv4Addr;
use std::{fs, str::FromStr};

pub use mac::MacAddress;

fn other_err(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg)
}

pub fn get_interface_index(name: &str) -> io::Result<i32> {
    let path = format!("/sys/class/net/{}/ifindex", name);
    fs::read_to_string(&path)?
        .trim()
        .parse()
        .map_err(|e| other_err(format!("bad ifindex in {}: {}", path, e)))
}

pub fn get_interface_mac(name: &str) -> io::Result<MacAddress> {
    let path = format!("/sys/class/net/{}/address", name);
    MacAddress::from_str(fs::read_to_string(&path)?.trim())
        .map_err(|e| other_err(format!("bad mac in {}: {}", path, e)))
}

/// Interface carrying the default route, from /proc/net/route.
pub fn get_default_interface() -> io::Result<String> {
    let routes = fs::read_to_string("/proc/net/route")?;
    for line in routes.lines().skip(1) {
        let mut cols = line.split_whitespace();
        let iface = cols.next();
        let dest = cols.next();
        if let (Some(iface), Some("00000000")) = (iface, dest) {
            return Ok(iface.to_string());
        }
    }
    Err(other_err("no default route found".to_string()))
}

/// Default gateway address, from /proc/net/route (hex, little-endian).
pub fn get_default_gw() -> io::Result<Ipv4Addr> {
    let routes = fs::read_to_string("/proc/net/route")?;
    for line in routes.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() >= 3 && cols[1] == "00000000" {
            let raw = u32::from_str_radix(cols[2], 16)
                .map_err(|e| other_err(format!("bad gateway in /proc/net/route: {}", e)))?;
            return Ok(Ipv4Addr::from(raw.swap_bytes()));
        }
    }
    Err(other_err("no default route found".to_string()))
}

/// MAC of the default gateway, looked up in the kernel neighbor cache.
pub fn get_default_gw_mac() -> io::Result<MacAddress> {
    let gw = get_default_gw()?;
    let gw_str = gw.to_string();
    let arp = fs::read_to_string("/proc/net/arp")?;
    for line in arp.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() >= 4 && cols[0] == gw_str {
            return MacAddress::from_str(cols[3])
                .map_err(|e| other_err(format!("bad mac in /proc/net/arp: {}", e)));
        }
    }
    Err(other_err(format!(
        "gateway {} not in neighbor cache, pass --gw-mac",
        gw
    )))
}
