use std::sync::{Arc, Mutex};

use log::{debug, error, info};

mod config;
mod crypto;
mod error;
mod fieldset;
mod monitor;
mod net;
mod probe_modules;
mod recv;
mod send;
mod state;
mod target_file;

use config::Context;
use error::ScanError;
use monitor::Monitor;
use probe_modules::{get_probe_module, ProbeModule};
use recv::Receiver;
use send::Sender;
use target_file::TargetFile;

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), ScanError> {
    let mut config = config::create_config()?;

    if config.list_probe_modules {
        for name in probe_modules::probe_module_names() {
            if let Some(module) = get_probe_module(name) {
                println!("{}\n  {}\n", name, module.helptext());
            }
        }
        return Ok(());
    }

    // A bad probe module name is caught by create_config, so this lookup
    // cannot fail; keep the error path anyway.
    let mut module = get_probe_module(&config.probe_module)
        .ok_or_else(|| ScanError::Config(format!("unknown probe module {:?}", config.probe_module)))?;
    module.global_initialize(&config.probe_conf())?;
    if module.packet_length() > probe_modules::packet::MAX_PACKET_SIZE {
        return Err(ScanError::Config(format!(
            "probe template is {} bytes, maximum is {}",
            module.packet_length(),
            probe_modules::packet::MAX_PACKET_SIZE
        )));
    }
    config.adjust_rate(module.packet_length());

    info!(
        "Scanning port {} with module {} ({} byte probes)",
        config.target_port,
        module.name(),
        module.packet_length()
    );

    let module: Arc<dyn ProbeModule> = Arc::from(module);
    let targets = Arc::new(Mutex::new(TargetFile::open(&config.target_file)?));
    let ctx = Context::new(config);

    let mut receiver = Receiver::new(ctx.clone(), module.clone())?;
    let recv_handle = std::thread::Builder::new()
        .name("recv".into())
        .spawn(move || receiver.run())?;

    // Don't start sending until the capture is live.
    while !ctx.receiver_stats.lock().unwrap().ready {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    ctx.sender_stats.lock().unwrap().start = std::time::Instant::now();

    let cores = affinity::get_core_num().max(1);
    let mut send_handles = Vec::new();
    for t in 0..ctx.config.sender_threads {
        let mut sender = Sender::new(ctx.clone(), targets.clone(), module.clone());
        let sender_ctx = ctx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("send{}", t))
            .spawn(move || {
                if let Err(e) = affinity::set_thread_affinity(&[t as usize % cores]) {
                    debug!("Could not pin sender thread: {}", e);
                }
                let res = sender.run();
                if res.is_err() {
                    // Mark the run complete so the receiver drains its
                    // cooldown and the monitor exits.
                    let mut zsend = sender_ctx.sender_stats.lock().unwrap();
                    if !zsend.complete {
                        zsend.complete = true;
                        zsend.finish = std::time::Instant::now();
                    }
                }
                res
            })?;
        send_handles.push(handle);
    }

    // Progress reporting on the main thread until send and recv are done.
    Monitor::new(ctx.clone()).run();

    let mut result = Ok(());
    for handle in send_handles {
        if let Err(e) = handle.join().expect("sender thread panicked") {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    recv_handle.join().expect("receiver thread panicked")?;

    let zsend = ctx.sender_stats.lock().unwrap();
    let zrecv = ctx.receiver_stats.lock().unwrap();
    info!(
        "Scan complete: {} probes sent to {} targets, {} unique responses ({} total, {} unsuccessful, {} frames failed validation)",
        zsend.sent,
        zsend.targets,
        zrecv.success_unique,
        zrecv.success_total,
        zrecv.failure_total,
        zrecv.validation_failed
    );
    drop(zsend);
    drop(zrecv);

    result
}
