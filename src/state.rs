use std::time::Instant;

#[derive(Debug)]
pub struct SenderStats {
    pub complete: bool,
    pub start: Instant,
    pub finish: Instant,
    pub sent: u32,
    pub targets: u32,
    pub sendto_failures: u32,
}

impl Default for SenderStats {
    fn default() -> Self {
        Self {
            complete: false,
            start: Instant::now(),
            finish: Instant::now(),
            sent: 0,
            targets: 0,
            sendto_failures: 0,
        }
    }
}

#[derive(Debug)]
pub struct ReceiverStats {
    pub ready: bool,
    pub complete: bool,
    pub success_unique: u32,
    pub success_total: u32,
    pub cooldown_unique: u32,
    pub cooldown_total: u32,
    /// Responses that validated as ours but classified unsuccessful (rst).
    pub failure_total: u32,
    /// Frames matching the pcap filter that failed cookie validation.
    pub validation_failed: u32,
    pub start: Instant,
    pub finish: Instant,
    pub pcap_recv: u32,
    pub pcap_drop: u32,
    pub pcap_ifdrop: u32,
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self {
            ready: false,
            complete: false,
            success_unique: 0,
            success_total: 0,
            cooldown_unique: 0,
            cooldown_total: 0,
            failure_total: 0,
            validation_failed: 0,
            start: Instant::now(),
            finish: Instant::now(),
            pcap_recv: 0,
            pcap_drop: 0,
            pcap_ifdrop: 0,
        }
    }
}
