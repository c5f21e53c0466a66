use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::{Config, Context};

/// Periodic progress reporting; runs on the main thread until both the
/// sender pool and the receiver have finished.
pub struct Monitor {
    ctx: Context,
    last_now: Instant,
    last_sent: u32,
    last_rcvd: u32,
    last_drop: u32,
    last_failures: u32,
}

impl Monitor {
    const UPDATE_INTERVAL: u64 = 1;

    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            last_now: Instant::now(),
            last_sent: 0,
            last_rcvd: 0,
            last_drop: 0,
            last_failures: 0,
        }
    }

    pub fn run(&mut self) {
        loop {
            let zsend_complete = self.ctx.sender_stats.lock().unwrap().complete;
            let zrecv_complete = self.ctx.receiver_stats.lock().unwrap().complete;
            if zsend_complete && zrecv_complete {
                break;
            }

            self.update();
            std::thread::sleep(Duration::from_secs(Monitor::UPDATE_INTERVAL));
        }
    }

    fn update(&mut self) {
        let zsend = self.ctx.sender_stats.lock().unwrap();
        let zsend_complete = zsend.complete;
        let zsend_start = zsend.start;
        let zsend_finish = zsend.finish;
        let zsend_sent = zsend.sent;
        let zsend_targets = zsend.targets;
        let zsend_sendto_failures = zsend.sendto_failures;
        drop(zsend);

        let zrecv = self.ctx.receiver_stats.lock().unwrap();
        let zrecv_success_unique = zrecv.success_unique;
        let zrecv_pcap_drop = zrecv.pcap_drop;
        let zrecv_pcap_ifdrop = zrecv.pcap_ifdrop;
        drop(zrecv);

        let age = Instant::now() - zsend_start;
        let age_f64 = age.as_secs_f64();
        let delta_f64 = (Instant::now() - self.last_now).as_secs_f64();

        let remaining = Self::compute_remaining_time(
            &self.ctx.config,
            zsend_complete,
            zsend_finish,
            zsend_targets,
            zrecv_success_unique,
            age,
        );
        let progress = match remaining {
            Some(left) => {
                let pct = 100.0 * age_f64 / (age_f64 + left.as_secs_f64()).max(f64::EPSILON);
                format!("{:.0?} {:.2}% ({:.0?} left)", age, pct, left)
            }
            None => format!("{:.0?}", age),
        };

        let recv_rate = (zrecv_success_unique - self.last_rcvd) as f64 / delta_f64;
        let recv_avg = (zrecv_success_unique as f64) / age_f64;
        let pcap_drop_rate =
            (zrecv_pcap_drop + zrecv_pcap_ifdrop - self.last_drop) as f64 / delta_f64;
        let pcap_drop_rate_avg = (zrecv_pcap_drop + zrecv_pcap_ifdrop) as f64 / age_f64;

        if pcap_drop_rate > recv_rate / 20.0 {
            warn!(
                "Dropped {:.0} in the last second, {} total dropped (pcap: {} + iface: {})",
                pcap_drop_rate,
                zrecv_pcap_drop + zrecv_pcap_ifdrop,
                zrecv_pcap_drop,
                zrecv_pcap_ifdrop
            );
        }

        let fail_rate = (zsend_sendto_failures - self.last_failures) as f64 / delta_f64;
        if fail_rate > (zsend_sent as f64 / age_f64) / 100.0 {
            warn!(
                "Failed to send {:.0} packets/sec ({} total failures)",
                fail_rate, zsend_sendto_failures
            );
        }

        let hit_rate = if zsend_sent > 0 {
            (zrecv_success_unique as f64) * 100.0 / (zsend_sent as f64)
        } else {
            0.0
        };

        if !zsend_complete {
            let send_rate = (zsend_sent - self.last_sent) as f64 / delta_f64;
            let send_avg = (zsend_sent as f64) / age_f64;
            info!(
                "{}; send: {} {:.0} p/s ({:.0} p/s avg); recv {} {:.0} p/s ({:.0} p/s avg); drops {:.0} p/s ({:.0} p/s avg); hits: {:.2}%",
                progress,
                zsend_sent,
                send_rate,
                send_avg,
                zrecv_success_unique,
                recv_rate,
                recv_avg,
                pcap_drop_rate,
                pcap_drop_rate_avg,
                hit_rate,
            );
        } else {
            let send_elapsed = (zsend_finish - zsend_start).as_secs_f64().max(f64::EPSILON);
            let send_avg = zsend_sent as f64 / send_elapsed;
            info!(
                "{}; send: {} done ({:.0} p/s avg); recv {} {:.0} p/s ({:.0} p/s avg); drops {:.0} p/s ({:.0} p/s avg); hits: {:.2}%",
                progress,
                zsend_sent,
                send_avg,
                zrecv_success_unique,
                recv_rate,
                recv_avg,
                pcap_drop_rate,
                pcap_drop_rate_avg,
                hit_rate,
            );
        }

        self.last_now = Instant::now();
        self.last_sent = zsend_sent;
        self.last_rcvd = zrecv_success_unique;
        self.last_drop = zrecv_pcap_drop + zrecv_pcap_ifdrop;
        self.last_failures = zsend_sendto_failures;
    }

    /// Estimate the time left before the run ends, extrapolating from
    /// whichever configured cap (targets, runtime, results) binds first.
    /// `None` when nothing bounds the run; the target total is not known
    /// up front when targets stream in from a file.
    fn compute_remaining_time(
        config: &Config,
        zsend_complete: bool,
        zsend_finish: Instant,
        zsend_targets: u32,
        zrecv_success_unique: u32,
        age: Duration,
    ) -> Option<Duration> {
        if zsend_complete {
            return Some(
                config
                    .cooldown_secs
                    .saturating_sub(Instant::now() - zsend_finish),
            );
        }

        let age_f64 = age.as_secs_f64();
        let cooldown = config.cooldown_secs.as_secs_f64();
        let mut remaining = f64::INFINITY;

        if config.max_targets != u32::MAX && zsend_targets > 0 {
            let done = zsend_targets as f64 / config.max_targets as f64;
            remaining = remaining.min((1.0 - done) * (age_f64 / done) + cooldown);
        }

        if config.max_runtime > 0 {
            remaining = remaining.min((config.max_runtime as f64 - age_f64).max(0.0) + cooldown);
        }

        if config.max_results != u32::MAX && zrecv_success_unique > 0 {
            let done = zrecv_success_unique as f64 / config.max_results as f64;
            remaining = remaining.min((1.0 - done) * (age_f64 / done));
        }

        if remaining == f64::INFINITY {
            None
        } else {
            Some(Duration::from_secs_f64(remaining.max(0.0)))
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn config(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("zmap6-rs").chain(args.iter().copied()))
    }

    #[test]
    fn test_no_estimate_for_unbounded_run() {
        let c = config(&[]);
        let left = Monitor::compute_remaining_time(
            &c,
            false,
            Instant::now(),
            50,
            3,
            Duration::from_secs(10),
        );
        assert_eq!(left, None);
    }

    #[test]
    fn test_estimate_from_runtime_cap() {
        let c = config(&["--max-runtime", "10"]);
        let left = Monitor::compute_remaining_time(
            &c,
            false,
            Instant::now(),
            0,
            0,
            Duration::from_secs(4),
        )
        .unwrap();
        // 6 s of sending left plus the 8 s default cooldown.
        assert_eq!(left, Duration::from_secs(14));
    }

    #[test]
    fn test_estimate_from_target_cap() {
        let c = config(&["--max-targets", "10"]);
        let left = Monitor::compute_remaining_time(
            &c,
            false,
            Instant::now(),
            5,
            0,
            Duration::from_secs(10),
        )
        .unwrap();
        // Half done after 10 s: 10 s more, plus cooldown.
        assert_eq!(left, Duration::from_secs(18));
    }

    #[test]
    fn test_estimate_takes_tightest_cap() {
        let c = config(&["--max-runtime", "100", "--max-results", "100"]);
        let left = Monitor::compute_remaining_time(
            &c,
            false,
            Instant::now(),
            0,
            50,
            Duration::from_secs(10),
        )
        .unwrap();
        // Results cap binds: half the results in 10 s, 10 s to go.
        assert_eq!(left, Duration::from_secs(10));
    }

    #[test]
    fn test_estimate_is_cooldown_left_once_sending_done() {
        let c = config(&[]);
        let left = Monitor::compute_remaining_time(
            &c,
            true,
            Instant::now(),
            50,
            3,
            Duration::from_secs(60),
        )
        .unwrap();
        assert!(left <= Duration::from_secs(8));
        assert!(left > Duration::from_secs(7));
    }
}
