use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};

use crate::config::Context;
use crate::crypto::validate;
use crate::error::ScanError;
use crate::net::socket::RawEthSocket;
use crate::net::{get_interface_index, get_interface_mac};
use crate::probe_modules::ProbeModule;
use crate::target_file::TargetFile;

pub struct Sender {
    ctx: Context,
    targets: Arc<Mutex<TargetFile>>,
    module: Arc<dyn ProbeModule>,
}

impl Sender {
    pub fn new(ctx: Context, targets: Arc<Mutex<TargetFile>>, module: Arc<dyn ProbeModule>) -> Self {
        Self {
            ctx,
            targets,
            module,
        }
    }

    pub fn run(&mut self) -> Result<(), ScanError> {
        debug!("Sender thread started and running");
        let config = &self.ctx.config;

        let socket = if config.dryrun {
            info!("Sender in dryrun mode -- won't actually send packets");
            None
        } else {
            Some(RawEthSocket::new()?)
        };
        let interface_index = get_interface_index(&config.interface)?;
        let source_mac = get_interface_mac(&config.interface)?;
        let gateway_mac = config.gw_mac;

        // The per-thread probe template: allocated once, patched per send.
        let mut buf = vec![0u8; self.module.packet_length()];
        self.module
            .thread_initialize(&mut buf, &source_mac, &gateway_mac, config.target_port)?;

        let mut count: u32 = 0;
        let mut last_count = count;
        let mut last_time = Instant::now();
        let mut delay: f64 = 0.0;
        let mut interval: u32 = 0;

        let thread_rate = (config.rate / config.sender_threads as i32).max(1);
        if config.rate > 0 {
            // Estimate initial rate
            delay = 10000.0;
            for _ in 0..delay as u32 {
                std::hint::spin_loop();
            }

            let duration = (Instant::now() - last_time).as_secs_f64();
            delay *= 1.0 / duration / thread_rate as f64;

            interval = (thread_rate / 20) as u32;
            last_time = Instant::now();
        }

        loop {
            let mut zsend = self.ctx.sender_stats.lock().unwrap();
            if zsend.complete {
                break;
            }

            if zsend.targets >= config.max_targets {
                zsend.complete = true;
                zsend.finish = Instant::now();
                break;
            }

            if config.max_runtime > 0
                && config.max_runtime <= (Instant::now() - zsend.start).as_secs() as u32
            {
                zsend.complete = true;
                zsend.finish = Instant::now();
                break;
            }
            drop(zsend);

            // A garbage line aborts the run: targets come from a trusted
            // enumerator, so failure to parse means corrupt input.
            let target = self.targets.lock().unwrap().next_target()?;
            let Some(target) = target else {
                let mut zsend = self.ctx.sender_stats.lock().unwrap();
                if !zsend.complete {
                    zsend.complete = true;
                    zsend.finish = Instant::now();
                }
                break;
            };

            self.ctx.sender_stats.lock().unwrap().targets += 1;

            let source_ip = target.src.unwrap_or(config.source_ip);
            let validation = validate::gen(&self.ctx.validate_ctx, &source_ip, &target.dst);

            // One paced unit is one transmitted packet, so the configured
            // rate holds regardless of how many probes each target gets.
            for probe_num in 0..config.probes {
                if delay > 0.0 {
                    count += 1;
                    for _ in 0..delay as u32 {
                        std::hint::spin_loop();
                    }

                    if interval == 0 || (count % interval == 0) {
                        let t = Instant::now();
                        let duration = (t - last_time).as_secs_f64();
                        delay *= (count - last_count) as f64 / duration / thread_rate as f64;

                        if delay < 1.0 {
                            delay = 1.0;
                        }

                        last_count = count;
                        last_time = t;
                    }
                }

                self.module.make_packet(
                    &mut buf,
                    &source_ip,
                    &target.dst,
                    config.probe_ttl,
                    &validation,
                    probe_num,
                )?;

                match &socket {
                    None => {
                        if !config.quiet {
                            self.module.print_packet(&buf);
                        }
                    }
                    Some(socket) => {
                        if let Err(e) = socket.sendto(&buf, interface_index, &gateway_mac) {
                            warn!("Sender sendto failed for {}. Reason: {}", target.dst, e);
                            self.ctx.sender_stats.lock().unwrap().sendto_failures += 1;
                        }
                    }
                }
                self.ctx.sender_stats.lock().unwrap().sent += 1;
            }
        }

        debug!("Sender finished");
        Ok(())
    }
}
