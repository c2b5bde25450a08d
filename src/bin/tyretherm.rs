use arrayvec::ArrayString;
use clap::{App, Arg};
use colored::*;
use core::fmt::Write as _;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn, Level};
use tyretherm::handler::{TimingSample, TimingSink};
use tyretherm::protocol::Corner;
use tyretherm::sensors::{BrakeTemperature, CornerReport, SensorKind, TyrePressure, TyreThermal};
use tyretherm::sim::{
    FaultProfile, SimCornerNode, SimPressureTransceiver, SimThermalCamera, SimThermocouple, TyreScene,
};
use tyretherm::store::{CornerDevices, CornerView, CycleView};
use tyretherm::{Config, SnapshotStore};

const DEFAULT_CYCLE_MS: &str = "100";
const DEFAULT_CYCLES: &str = "0";
const STALE_AFTER_MS: u64 = 500;
const BASE_PRESSURE_KPA: f32 = 180.0;
const BASE_BRAKE_C: f32 = 120.0;

#[derive(Debug, Default)]
struct WorstCaseSink {
    samples: AtomicU64,
    worst_processing_us: AtomicU64,
}

impl TimingSink for WorstCaseSink {
    fn record(&self, sample: TimingSample) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        let us = sample.processing.as_micros() as u64;
        self.worst_processing_us.fetch_max(us, Ordering::Relaxed);
    }
}

#[derive(Debug, Serialize)]
struct CornerRow<'a> {
    corner: &'a str,
    tyre: Option<TyreThermal>,
    tyre_valid: bool,
    pressure: Option<TyrePressure>,
    brake: Option<BrakeTemperature>,
    node: Option<CornerReport>,
    stale: Vec<&'static str>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("tyretherm")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("Tyre, brake and pressure acquisition against simulated hardware")
        .arg(
            Arg::with_name("cycles")
                .short("n")
                .long("cycles")
                .value_name("N")
                .help("Render cycles to run (0 runs until Ctrl+C)")
                .takes_value(true)
                .default_value(DEFAULT_CYCLES)
                .validator(|v| v.parse::<u64>().map(|_| ()).map_err(|_| "must be a number".into())),
        )
        .arg(
            Arg::with_name("cycle-ms")
                .long("cycle-ms")
                .value_name("MS")
                .help("Render cycle period in milliseconds")
                .takes_value(true)
                .default_value(DEFAULT_CYCLE_MS)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("must be a positive number".into()),
                }),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("fault-rate")
                .long("fault-rate")
                .value_name("PERCENT")
                .help("Fault injection rate for every simulated device")
                .takes_value(true)
                .validator(|v| match v.parse::<f32>() {
                    Ok(rate) if (0.0..=100.0).contains(&rate) => Ok(()),
                    _ => Err("must be between 0 and 100".into()),
                }),
        )
        .arg(
            Arg::with_name("bus-nodes")
                .long("bus-nodes")
                .help("Also simulate a corner node on the bus at every corner"),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json", "compact"])
                .default_value("table"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output"),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let mut config = match matches.value_of("config") {
        Some(path) => Config::from_json_str(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    let bus_nodes = matches.is_present("bus-nodes");
    if bus_nodes {
        for corner in &mut config.corners {
            corner.bus_node_enabled = true;
            corner.frame_request_interval_ms.get_or_insert(2000);
        }
    }

    let faults = match matches.value_of("fault-rate") {
        Some(rate) => FaultProfile::with_rate(rate.parse()?),
        None => FaultProfile::default(),
    };
    let cycles: u64 = matches.value_of("cycles").unwrap_or(DEFAULT_CYCLES).parse()?;
    let cycle_ms: u64 = matches.value_of("cycle-ms").unwrap_or(DEFAULT_CYCLE_MS).parse()?;
    let format = matches.value_of("format").unwrap_or("table");

    let mut store = SnapshotStore::from_config(&config, simulated_devices(&config, faults))?;
    let timing = Arc::new(WorstCaseSink::default());
    store.set_timing_sink(timing.clone());

    println!("{}", "tyretherm - corner sensor acquisition".bright_blue().bold());
    for (channel, reason) in store.unavailable() {
        if verbose {
            println!("  {} {} ({})", "-".dimmed(), channel, reason.dimmed());
        }
    }
    if let Err(e) = store.start_all() {
        warn!("not every channel started: {}", e);
    }

    let max_age = Duration::from_millis(STALE_AFTER_MS);
    let mut interval = time::interval(Duration::from_millis(cycle_ms));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut cycle = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => {
                info!("interrupted, stopping acquisition");
                break;
            }
        }

        let view = store.read_cycle();
        match format {
            "json" => println!("{}", serde_json::to_string(&rows(&view, max_age))?),
            "compact" => print_compact(&view, max_age),
            _ => print_table(&view, cycle, max_age),
        }

        cycle += 1;
        if cycles != 0 && cycle >= cycles {
            break;
        }
    }

    if let Err(e) = store.stop_all() {
        warn!("shutdown incomplete: {}", e);
    }

    if verbose {
        println!("\n{}", "Channel statistics".bright_white().bold());
        for channel in store.channels() {
            let stats = channel.stats();
            println!(
                "  {:<12} {:<12} published {:>6}  transient {:>4}  malformed {:>4}  over budget {:>4}",
                channel.channel().to_string(),
                channel.state().to_string(),
                stats.published,
                stats.transient_failures,
                stats.malformed_frames,
                stats.deadline_misses,
            );
        }
        println!(
            "  {} samples, worst processing {}us",
            timing.samples.load(Ordering::Relaxed),
            timing.worst_processing_us.load(Ordering::Relaxed),
        );
    }

    Ok(())
}

fn simulated_devices(config: &Config, faults: FaultProfile) -> [CornerDevices; 4] {
    Corner::ALL.map(|corner| {
        let seed = 0x5EED_0000 + corner.index() as u64 * 0x101;
        CornerDevices {
            thermal: Some(Box::new(SimThermalCamera::new(TyreScene::default(), faults, seed))),
            pressure: Some(Box::new(SimPressureTransceiver::new(BASE_PRESSURE_KPA, faults, seed + 1))),
            brake: Some(Box::new(SimThermocouple::new(BASE_BRAKE_C, faults, seed + 2))),
            node: Some(Box::new(SimCornerNode::new(
                corner,
                TyreScene::default(),
                config.zone,
                faults,
                seed + 3,
            ))),
        }
    })
}

fn rows(view: &CycleView, max_age: Duration) -> Vec<CornerRow<'static>> {
    view.corners
        .iter()
        .map(|c| CornerRow {
            corner: c.corner.label(),
            tyre: c.thermal.map(|s| s.payload),
            tyre_valid: c.thermal.is_some_and(|s| s.valid),
            pressure: c.pressure.map(|s| s.payload),
            brake: c.brake.map(|s| s.payload),
            node: c.node.map(|s| s.payload),
            stale: c
                .stale_kinds(view.taken_at, max_age)
                .iter()
                .map(|k| k.label())
                .collect(),
        })
        .collect()
}

fn temperature_cell(celsius: f32) -> ColoredString {
    let mut cell = ArrayString::<16>::new();
    let _ = write!(cell, "{celsius:>6.1}");
    match celsius {
        t if t < 60.0 => cell.as_str().bright_blue(),
        t if t < 90.0 => cell.as_str().bright_green(),
        t if t < 110.0 => cell.as_str().bright_yellow(),
        _ => cell.as_str().bright_red(),
    }
}

fn missing_cell() -> ColoredString {
    format!("{:>6}", "--").dimmed()
}

fn print_table(view: &CycleView, cycle: u64, max_age: Duration) {
    println!(
        "\n{} {}",
        "cycle".bright_white(),
        cycle.to_string().bright_cyan()
    );
    println!(
        "  {:<4} {:>6} {:>6} {:>6} {:>6} {:>5}  {:>6}  {:>6}  {}",
        "", "left", "centre", "right", "grad", "conf", "kPa", "brake", "stale"
    );
    for corner in &view.corners {
        print_corner_row(corner, view, max_age);
    }
}

fn print_corner_row(corner: &CornerView, view: &CycleView, max_age: Duration) {
    let tyre = corner.fresh_thermal(view.taken_at, max_age);
    let (left, centre, right, gradient, confidence) = match tyre {
        Some(s) => (
            temperature_cell(s.payload.left_median),
            temperature_cell(s.payload.centre_median),
            temperature_cell(s.payload.right_median),
            format!("{:>+6.1}", s.payload.lateral_gradient).normal(),
            format!("{:>4.0}%", s.payload.confidence * 100.0).normal(),
        ),
        None => (missing_cell(), missing_cell(), missing_cell(), missing_cell(), format!("{:>5}", "--").dimmed()),
    };
    let pressure = corner
        .pressure
        .map_or_else(missing_cell, |s| format!("{:>6.1}", s.payload.pressure_kpa).normal());
    let brake = corner
        .brake
        .map_or_else(missing_cell, |s| temperature_cell(s.payload.temperature_c));

    let stale = corner.stale_kinds(view.taken_at, max_age);
    let stale = if stale.is_empty() {
        "".normal()
    } else {
        stale.iter().map(|k| k.label()).collect::<Vec<_>>().join(",").yellow()
    };

    println!(
        "  {:<4} {} {} {} {} {}  {}  {}  {}",
        corner.corner.label().bright_white().bold(),
        left,
        centre,
        right,
        gradient,
        confidence,
        pressure,
        brake,
        stale
    );
}

fn print_compact(view: &CycleView, max_age: Duration) {
    let mut line = String::new();
    for corner in &view.corners {
        let _ = write!(line, "{}:", corner.corner.label());
        match corner.fresh_thermal(view.taken_at, max_age) {
            Some(s) => {
                let _ = write!(
                    line,
                    "{:.0}/{:.0}/{:.0} ",
                    s.payload.left_median, s.payload.centre_median, s.payload.right_median
                );
            }
            None => line.push_str("--/--/-- "),
        }
        if corner
            .stale_kinds(view.taken_at, max_age)
            .contains(&SensorKind::CornerNode)
            && corner.node.is_some()
        {
            line.push_str("(node stale) ");
        }
    }
    println!("{}", line.trim_end());
}
