use std::net::{IpAddr, Ipv6Addr};

use rand::prelude::*;
use rand::rngs::StdRng;

use super::AesCtx;

/// The per-probe validation cookie: four 32-bit words derived from the
/// address pair under the run secret. `validation[0]` rides in the TCP
/// sequence number; `validation[1]` feeds the source-port encoder.
pub type Validation = [u32; 4];

/// Create the run-scoped validation context. A non-zero seed makes the
/// secret (and therefore every cookie) reproducible across runs.
pub fn new_context(seed: u32) -> AesCtx {
    let key: [u8; 16] = if seed != 0 {
        StdRng::seed_from_u64(seed as u64).gen()
    } else {
        rand::thread_rng().gen()
    };
    AesCtx::new(&key)
}

/// Derive the validation cookie for one (source, destination) pair.
///
/// Pure function of the addresses and the run secret, so the receive path
/// can recompute it from a reply's headers alone. IPv4 addresses are mapped
/// into IPv6 space so both families share one code path; the two address
/// blocks are chained CBC-MAC style through the cipher.
pub fn gen(ctx: &AesCtx, src: &IpAddr, dst: &IpAddr) -> Validation {
    let src = to_v6(src).octets();
    let dst = to_v6(dst).octets();

    let mut block = ctx.encrypt(&src);
    for (b, d) in block.iter_mut().zip(dst.iter()) {
        *b ^= d;
    }
    let out = ctx.encrypt(&block);

    [
        u32::from_be_bytes(out[0..4].try_into().unwrap()),
        u32::from_be_bytes(out[4..8].try_into().unwrap()),
        u32::from_be_bytes(out[8..12].try_into().unwrap()),
        u32::from_be_bytes(out[12..16].try_into().unwrap()),
    ]
}

fn to_v6(addr: &IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped(),
        IpAddr::V6(a) => *a,
    }
}
