//! Minimal safe wrapper over libpcap for the receive path.
//!
//! References:
//! https://www.tcpdump.org/manpages/pcap_compile.3pcap.html
//! https://www.tcpdump.org/manpages/pcap_setfilter.3pcap.html
//! https://www.tcpdump.org/manpages/pcap_next_ex.3pcap.html

use std::io;

use libc::{c_char, c_int, c_uchar, c_uint, c_ushort, timeval};

// Opaque pcap handle
// Reference: https://doc.rust-lang.org/nomicon/ffi.html
#[repr(C)]
struct pcap_t {
    _data: [u8; 0],
    _marker: core::marker::PhantomData<(*mut u8, core::marker::PhantomPinned)>,
}

#[repr(C)]
struct pcap_pkthdr {
    ts: timeval,
    caplen: c_uint,
    len: c_uint,
}

#[repr(C)]
struct bpf_program {
    bf_len: c_uint,
    bf_insns: *mut bpf_insn,
}

#[repr(C)]
struct bpf_insn {
    code: c_ushort,
    jt: c_uchar,
    jf: c_uchar,
    k: c_uint,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PcapStats {
    pub ps_recv: c_uint,
    pub ps_drop: c_uint,
    pub ps_ifdrop: c_uint,
}

#[link(name = "pcap")]
extern "C" {
    fn pcap_open_live(
        device: *const c_char,
        snaplen: c_int,
        promisc: c_int,
        to_ms: c_int,
        errbuf: *mut c_char,
    ) -> *mut pcap_t;

    fn pcap_compile(
        p: *mut pcap_t,
        fp: *mut bpf_program,
        string: *const c_char,
        optimize: c_int,
        netmask: c_uint,
    ) -> c_int;

    fn pcap_setfilter(p: *mut pcap_t, fp: *mut bpf_program) -> c_int;

    fn pcap_freecode(fp: *mut bpf_program);

    fn pcap_next_ex(
        p: *mut pcap_t,
        pkt_header: *mut *mut pcap_pkthdr,
        pkt_data: *mut *const c_uchar,
    ) -> c_int;

    fn pcap_stats(p: *mut pcap_t, ps: *mut PcapStats) -> c_int;

    fn pcap_geterr(p: *mut pcap_t) -> *mut c_char;

    fn pcap_close(p: *mut pcap_t);
}

/// One captured frame; `data` is only valid until the next call into the
/// capture handle.
pub struct Packet<'a> {
    pub data: &'a [u8],
}

pub struct PacketCapture {
    handle: *mut pcap_t,
}

// The raw handle is only ever used from the receiver thread that owns it.
unsafe impl Send for PacketCapture {}

impl PacketCapture {
    const PCAP_ERRBUF_SIZE: usize = 256;
    const PCAP_PROMISC: c_int = 1;
    // Bounded read timeout so the receive loop can observe completion.
    const PCAP_TIMEOUT_MS: c_int = 100;
    const PCAP_OPTIMIZE: c_int = 1;

    pub fn open(interface: &str, snaplen: usize) -> io::Result<Self> {
        let iface_cstr = std::ffi::CString::new(interface)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;
        let mut errbuf = [0 as c_char; Self::PCAP_ERRBUF_SIZE];
        let p = unsafe {
            pcap_open_live(
                iface_cstr.as_ptr(),
                snaplen as c_int,
                Self::PCAP_PROMISC,
                Self::PCAP_TIMEOUT_MS,
                errbuf.as_mut_ptr(),
            )
        };
        if p.is_null() {
            let err = unsafe { std::ffi::CStr::from_ptr(errbuf.as_ptr()) };
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("pcap_open_live failed: {}", err.to_string_lossy()),
            ));
        }
        Ok(Self { handle: p })
    }

    pub fn with_filter(self, filter: &str) -> io::Result<Self> {
        let mut bpf = bpf_program {
            bf_len: 0,
            bf_insns: std::ptr::null_mut(),
        };
        let filter_cstr = std::ffi::CString::new(filter)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "filter string"))?;
        let res = unsafe {
            pcap_compile(
                self.handle,
                &mut bpf,
                filter_cstr.as_ptr(),
                Self::PCAP_OPTIMIZE,
                0,
            )
        };
        if res < 0 {
            return Err(self.last_error("pcap_compile"));
        }

        let res = unsafe { pcap_setfilter(self.handle, &mut bpf) };
        unsafe { pcap_freecode(&mut bpf) };
        if res < 0 {
            return Err(self.last_error("pcap_setfilter"));
        }
        Ok(self)
    }

    /// Next captured frame, or `None` on read timeout.
    pub fn next_packet(&mut self) -> Option<Packet<'_>> {
        let mut header: *mut pcap_pkthdr = std::ptr::null_mut();
        let mut data: *const c_uchar = std::ptr::null();
        let res = unsafe { pcap_next_ex(self.handle, &mut header, &mut data) };
        if res != 1 || header.is_null() || data.is_null() {
            return None;
        }
        let caplen = unsafe { (*header).caplen } as usize;
        let data = unsafe { std::slice::from_raw_parts(data, caplen) };
        Some(Packet { data })
    }

    pub fn stats(&self) -> PcapStats {
        let mut stats = PcapStats::default();
        unsafe { pcap_stats(self.handle, &mut stats) };
        stats
    }

    fn last_error(&self, what: &str) -> io::Error {
        let err = unsafe { std::ffi::CStr::from_ptr(pcap_geterr(self.handle)) };
        io::Error::new(
            io::ErrorKind::Other,
            format!("{} failed: {}", what, err.to_string_lossy()),
        )
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        unsafe { pcap_close(self.handle) };
    }
}
