use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{warn, LevelFilter};
use serde::Serialize;

use biox_daq::logging;
use biox_daq::{
    calibrate_device, discover, enumerate_candidate_ports, probe, AcquisitionScheduler,
    CancelToken, Calibrator, JsonLinesSink, Registry, SampleSink, SerialOpener,
};

#[derive(Parser, Debug)]
#[command(name = "biox", about = "Calibrate and sample BIOX armbands over USB serial")]
struct Args {
    /// Device registry (JSON)
    #[arg(long, global = true, default_value = "biox.json")]
    registry: PathBuf,
    /// Log wire traffic
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List serial ports and probe each one for an armband
    Ports,
    /// Calibrate one configured device
    Calibrate {
        /// Device name from the registry
        device: String,
    },
    /// Sample every configured device at a fixed rate
    Acquire {
        /// Session length, overrides the registry
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Tick period, overrides the registry
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Run with whichever configured devices were found
        #[arg(long)]
        allow_partial: bool,
    },
}

#[derive(Serialize)]
struct PortRecord<'a> {
    port: &'a str,
    serial_number: Option<&'a str>,
    responding: bool,
    device: Option<&'a str>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_rust_logging_with(args.verbose.then_some(LevelFilter::Debug));

    match args.command {
        Cmd::Ports => list_ports(&args.registry),
        Cmd::Calibrate { device } => calibrate(&load_registry(&args.registry)?, &device),
        Cmd::Acquire {
            duration_ms,
            interval_ms,
            allow_partial,
        } => {
            let mut registry = load_registry(&args.registry)?;
            if let Some(ms) = duration_ms {
                registry.acquisition.duration_ms = ms;
            }
            if let Some(ms) = interval_ms {
                if ms == 0 {
                    bail!("--interval-ms must be positive");
                }
                registry.acquisition.tick_interval_ms = ms;
            }
            acquire(&registry, allow_partial)
        }
    }
}

fn load_registry(path: &Path) -> Result<Registry> {
    Registry::load(path).with_context(|| format!("loading registry {}", path.display()))
}

fn list_ports(registry_path: &Path) -> Result<()> {
    // Labels are optional here; listing works without a registry.
    let registry = if registry_path.exists() {
        load_registry(registry_path)?
    } else {
        Registry::default()
    };

    let ports = enumerate_candidate_ports().context("enumerating serial ports")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for port in &ports {
        let record = PortRecord {
            port: &port.port_name,
            serial_number: port.serial_number.as_deref(),
            responding: probe(&SerialOpener, port, &registry.serial),
            device: port
                .serial_number
                .as_deref()
                .and_then(|sn| registry.by_serial(sn))
                .map(|d| d.name.as_str()),
        };
        serde_json::to_writer(&mut out, &record)?;
        writeln!(out)?;
    }
    Ok(())
}

fn calibrate(registry: &Registry, device: &str) -> Result<()> {
    let opener = SerialOpener;
    let (config, port) = discover(&opener, registry)?
        .select(device)
        .with_context(|| format!("locating {device}"))?;

    let calibrator = Calibrator::from(registry.calibration);
    let result = calibrate_device(&opener, &config, &port, &registry.serial, &calibrator)
        .with_context(|| format!("calibrating {device} on {}", port.port_name))?;

    JsonLinesSink::new(io::stdout().lock()).accept_calibration(device, result)?;
    Ok(())
}

fn acquire(registry: &Registry, allow_partial: bool) -> Result<()> {
    let report = discover(&SerialOpener, registry)?;
    let devices = if allow_partial {
        if !report.is_complete() {
            warn!(
                "acquiring without missing device(s): {}",
                report.missing_names().join(", ")
            );
        }
        report.matched
    } else {
        report.require_all()?
    };

    let scheduler = AcquisitionScheduler::new(
        Arc::new(SerialOpener),
        registry.serial,
        registry.acquisition,
    );
    cancel_on_ctrl_c(scheduler.cancel_token());

    let mut sink = JsonLinesSink::new(io::stdout().lock());
    let summary = scheduler
        .run(&devices, &mut sink)
        .context("acquisition aborted")?;
    eprintln!(
        "{} sample(s), {} overrun(s){}",
        summary.ticks,
        summary.overruns,
        if summary.cancelled { ", cancelled" } else { "" }
    );
    Ok(())
}

fn cancel_on_ctrl_c(cancel: CancelToken) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("ctrl-c handler unavailable: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    });
}
