//! Simulator entry point: CLI wiring, batch and real-time driving loops.

use std::path::Path;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bess_hil_sim::command::{CommandSender, SetpointCommand, SharedTime, command_channel};
use bess_hil_sim::config::ScenarioConfig;
use bess_hil_sim::io::export::{CsvSink, export_csv};
use bess_hil_sim::plant::StepInput;
use bess_hil_sim::runner::{build_plant, run_scenario};

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: Option<String>,
    preset: Option<String>,
    curves_path: Option<String>,
    duration_override: Option<f64>,
    csv_out: Option<String>,
    realtime: bool,
    #[cfg(feature = "modbus")]
    modbus_port: Option<u16>,
}

fn print_help() {
    eprintln!("bess-hil-sim: HIL simulator for a grid-connected battery storage plant");
    eprintln!();
    eprintln!("Usage: bess-hil-sim [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>   Load scenario from TOML config file");
    eprintln!("  --preset <name>     Use a built-in preset (baseline, weak_grid)");
    eprintln!("  --curves <path>     Load capability curves from a JSON file");
    eprintln!("  --duration <s>      Override simulated duration in seconds");
    eprintln!("  --csv-out <path>    Export per-tick telemetry to CSV");
    eprintln!("  --realtime          Pace ticks in wall time and read commands from stdin");
    #[cfg(feature = "modbus")]
    eprintln!("  --modbus-port <u16> Serve a Modbus TCP register map (realtime mode)");
    eprintln!("  --help              Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the baseline preset is used.");
    eprintln!("In realtime mode, type \"P Q\" (e.g. \"0.15 0.05\") or \"exit\".");
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        scenario_path: None,
        preset: None,
        curves_path: None,
        duration_override: None,
        csv_out: None,
        realtime: false,
        #[cfg(feature = "modbus")]
        modbus_port: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --scenario requires a path argument");
                    process::exit(1);
                }
                cli.scenario_path = Some(args[i].clone());
            }
            "--preset" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --preset requires a name argument");
                    process::exit(1);
                }
                cli.preset = Some(args[i].clone());
            }
            "--curves" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --curves requires a path argument");
                    process::exit(1);
                }
                cli.curves_path = Some(args[i].clone());
            }
            "--duration" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --duration requires a seconds argument");
                    process::exit(1);
                }
                match args[i].parse::<f64>() {
                    Ok(s) if s > 0.0 => cli.duration_override = Some(s),
                    _ => {
                        eprintln!(
                            "error: --duration value \"{}\" is not a positive number",
                            args[i]
                        );
                        process::exit(1);
                    }
                }
            }
            "--csv-out" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --csv-out requires a path argument");
                    process::exit(1);
                }
                cli.csv_out = Some(args[i].clone());
            }
            "--realtime" => {
                cli.realtime = true;
            }
            #[cfg(feature = "modbus")]
            "--modbus-port" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --modbus-port requires a u16 argument");
                    process::exit(1);
                }
                if let Ok(p) = args[i].parse::<u16>() {
                    cli.modbus_port = Some(p);
                } else {
                    eprintln!(
                        "error: --modbus-port value \"{}\" is not a valid u16",
                        args[i]
                    );
                    process::exit(1);
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

/// Background stdin reader for realtime mode: parses `P Q` lines into
/// commands stamped with the loop's current simulation time.
fn spawn_console_reader(sender: CommandSender, time: SharedTime, running: Arc<AtomicBool>) {
    thread::Builder::new()
        .name("console-reader".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            while running.load(Ordering::Relaxed) {
                line.clear();
                match std::io::BufRead::read_line(&mut stdin.lock(), &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("exit") {
                    running.store(false, Ordering::Relaxed);
                    break;
                }
                let parts: Vec<&str> = input.split_whitespace().collect();
                let parsed = match parts.as_slice() {
                    [p, q] => p.parse::<f64>().ok().zip(q.parse::<f64>().ok()),
                    _ => None,
                };
                match parsed {
                    Some((p_mw, q_mvar)) => {
                        let cmd = SetpointCommand {
                            p_mw,
                            q_mvar,
                            time_s: time.now_s(),
                        };
                        match sender.send(cmd) {
                            Ok(()) => {
                                eprintln!(">>> Command queued: P={p_mw:.2} MW, Q={q_mvar:.2} MVAr");
                            }
                            Err(e) => eprintln!(">>> Command rejected: {e}"),
                        }
                    }
                    None => {
                        eprintln!(">>> Invalid format. Use: P[MW] Q[MVAr] (e.g. \"0.15 0.05\")");
                    }
                }
            }
        })
        .expect("failed to spawn console reader thread");
}

/// Interactive loop: wall-clock paced ticks, console (and Modbus)
/// command ingestion, console row output, streaming CSV.
fn run_realtime(cfg: &ScenarioConfig, cli: &CliArgs) {
    let mut plant = match build_plant(cfg) {
        Ok(plant) => plant,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    // Capacity covers the whole script on top of the interactive
    // headroom; accepted commands are never dropped.
    let (sender, mut queue) = command_channel(64.max(cfg.commands.len()));
    let time = SharedTime::new();
    let running = Arc::new(AtomicBool::new(true));

    // Preload the scripted commands so presets behave the same as in
    // batch mode.
    for entry in &cfg.commands {
        if let Err(e) = sender.send(SetpointCommand {
            p_mw: entry.p_mw,
            q_mvar: entry.q_mvar,
            time_s: entry.time_s,
        }) {
            eprintln!("error: cannot queue scripted command: {e}");
            process::exit(1);
        }
    }

    spawn_console_reader(sender.clone(), time.clone(), Arc::clone(&running));

    #[cfg(feature = "modbus")]
    let adapter = cli.modbus_port.map(|port| {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        bess_hil_sim::modbus::ModbusAdapter::spawn(addr, sender.clone(), time.clone())
    });

    let mut sink = match cli.csv_out.as_deref() {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => match CsvSink::new(std::io::BufWriter::new(file)) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    eprintln!("error: failed to write CSV header: {e}");
                    process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("error: cannot create \"{path}\": {e}");
                process::exit(1);
            }
        },
        None => None,
    };

    let tick_s = cfg.plant.tick_s;
    let steps = (cfg.simulation.duration_s / tick_s).round() as usize;
    let mut set_p_mw = 0.0;
    let mut set_q_mvar = 0.0;

    eprintln!("Realtime mode: type \"P Q\" to command setpoints, \"exit\" to stop.");

    for k in 0..steps {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let time_s = k as f64 * tick_s;
        time.set_s(time_s);

        // One due command per tick, applied before the step.
        if let Some(cmd) = queue.next_due(time_s) {
            set_p_mw = cmd.p_mw;
            set_q_mvar = cmd.q_mvar;
            eprintln!(">>> Command applied: P={set_p_mw:.2} MW, Q={set_q_mvar:.2} MVAr");
        }

        let (grid_v_pu, grid_f_hz) = cfg.grid.at(time_s);
        let out = plant.step(&StepInput {
            set_p_mw,
            set_q_mvar,
            grid_v_pu,
            grid_f_hz,
            time_s,
        });

        println!("{out}");

        #[cfg(feature = "modbus")]
        if let Some(ref adapter) = adapter {
            adapter.publish(&out);
        }

        if let Some(ref mut sink) = sink
            && let Err(e) = sink.append(&out).and_then(|()| sink.flush())
        {
            eprintln!("error: failed to write CSV row: {e}");
            process::exit(1);
        }

        thread::sleep(Duration::from_secs_f64(tick_s));
    }

    running.store(false, Ordering::Relaxed);
    eprintln!("Simulation stopped.");
}

fn main() {
    let cli = parse_args();

    // Load config: --scenario takes priority, then --preset, then the
    // baseline default.
    let mut scenario = if let Some(ref path) = cli.scenario_path {
        match ScenarioConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else if let Some(ref name) = cli.preset {
        match ScenarioConfig::from_preset(name) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        ScenarioConfig::baseline()
    };

    // A JSON curve file replaces the embedded capability table; the
    // usual validation still runs against what it contains.
    if let Some(ref path) = cli.curves_path {
        let loaded = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()));
        match loaded {
            Ok(curve_cfg) => scenario.capability = curve_cfg,
            Err(e) => {
                eprintln!("error: cannot load curve file \"{path}\": {e}");
                process::exit(1);
            }
        }
    }

    if let Some(duration_s) = cli.duration_override {
        scenario.simulation.duration_s = duration_s;
    }

    // Validate
    let errors = scenario.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    if cli.realtime {
        run_realtime(&scenario, &cli);
        return;
    }

    // Batch mode: run to completion, print rows, export CSV.
    let result = match run_scenario(&scenario) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    for r in &result.records {
        println!("{r}");
    }

    if let Some(ref path) = cli.csv_out {
        if let Err(e) = export_csv(&result.records, Path::new(path)) {
            eprintln!("error: failed to write CSV: {e}");
            process::exit(1);
        }
        eprintln!("Telemetry written to {path}");
    }
}
