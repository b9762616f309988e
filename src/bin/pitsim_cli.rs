//! CLI client for the `pitsimd` daemon.
//!
//! Examples:
//!   pitsim-cli status
//!   pitsim-cli pit
//!   pitsim-cli stop
//!   pitsim-cli trial
//!   pitsim-cli save snapshot
//!
//! By default it talks to 127.0.0.1:9877; override with `--addr host:port`.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::process;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Request {
    GetState,
    Init,
    Train,
    TrainPit,
    StepTrial,
    StepEpoch,
    StepRun,
    TestAll,
    Stop,
    NewSeed,
    SaveWeights { name: String },
    ResetRunLog,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Response {
    State(StateSnapshot),
    Success { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateSnapshot {
    running: bool,
    network: String,
    phase: String,
    run: i64,
    epoch: i64,
    #[serde(default)]
    trial_name: String,
    max_runs: usize,
    max_epochs: usize,
    epoch_sse: f64,
    pct_cor: f64,
    cos_diff: f64,
    nzero: i64,
    first_zero: i64,
    has_protocol: bool,
    #[serde(default)]
    last_outcome: Option<String>,
    runs_logged: usize,
    converged: usize,
}

fn usage() -> ! {
    eprintln!("pitsim-cli (talks to pitsimd @ 127.0.0.1:9877 by default)");
    eprintln!("Usage: pitsim-cli [--addr host:port] <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  status                      Show daemon state");
    eprintln!("  init                        Restart at the first run");
    eprintln!("  train                       Train every remaining run");
    eprintln!("  pit                         Run the phase protocol for every run");
    eprintln!("  trial | epoch | run         Step one trial, epoch or run");
    eprintln!("  test                        One pass over the test table");
    eprintln!("  stop                        Stop after the current trial");
    eprintln!("  seed                        Draw a new random seed");
    eprintln!("  save <name>                 Save weights as a named checkpoint");
    eprintln!("  reset-log                   Clear the run log");
    eprintln!("  shutdown                    Stop and exit daemon");
    eprintln!("  paths                       Show data and checkpoint directories");
    process::exit(1);
}

fn parse_args() -> (String, Vec<String>) {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }

    let mut addr = "127.0.0.1:9877".to_string();
    if args.len() >= 2 && args[0] == "--addr" {
        addr = args[1].clone();
        args.drain(0..2);
    }

    if args.is_empty() {
        usage();
    }

    (addr, args)
}

fn send_request(addr: &str, req: &Request) -> Result<Response, String> {
    let mut stream = TcpStream::connect(addr).map_err(|e| format!("connect: {e}"))?;
    // A single trial step can take a while on large layouts.
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| format!("set_read_timeout: {e}"))?;
    let mut reader = BufReader::new(stream.try_clone().map_err(|e| format!("clone: {e}"))?);

    let line = serde_json::to_string(req).map_err(|e| format!("serialize: {e}"))?;
    stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.write_all(b"\n"))
        .map_err(|e| format!("send: {e}"))?;

    let mut resp_line = String::new();
    reader
        .read_line(&mut resp_line)
        .map_err(|e| format!("recv: {e}"))?;
    serde_json::from_str(&resp_line).map_err(|e| format!("parse response: {e}"))
}

fn print_state(s: StateSnapshot) {
    println!(
        "net={} running={} phase={} run={} / {} epoch={} / {} trial={}",
        s.network,
        s.running,
        if s.phase.is_empty() { "-" } else { &s.phase },
        s.run,
        s.max_runs,
        s.epoch,
        s.max_epochs,
        if s.trial_name.is_empty() { "-" } else { &s.trial_name },
    );
    println!(
        "epoch: sse={:.4} pct_cor={:.1}% cos_diff={:.3} nzero={} first_zero={}",
        s.epoch_sse,
        s.pct_cor * 100.0,
        s.cos_diff,
        s.nzero,
        s.first_zero,
    );
    println!(
        "runs: logged={} converged={} protocol={}",
        s.runs_logged, s.converged, s.has_protocol,
    );
    if let Some(outcome) = s.last_outcome {
        println!("last task: {outcome}");
    }
}

fn main() {
    let (addr, args) = parse_args();
    let cmd = &args[0];

    let req = match cmd.as_str() {
        "status" => Request::GetState,
        "init" => Request::Init,
        "train" => Request::Train,
        "pit" => Request::TrainPit,
        "trial" => Request::StepTrial,
        "epoch" => Request::StepEpoch,
        "run" => Request::StepRun,
        "test" => Request::TestAll,
        "stop" => Request::Stop,
        "seed" => Request::NewSeed,
        "save" => {
            if args.len() < 2 {
                usage();
            }
            Request::SaveWeights {
                name: args[1].clone(),
            }
        }
        "reset-log" => Request::ResetRunLog,
        "shutdown" => Request::Shutdown,
        "paths" => {
            // Special command: doesn't need daemon, just print paths
            #[cfg(unix)]
            {
                if let Ok(home) = std::env::var("HOME") {
                    let data_dir = format!("{}/.local/share/pitsim", home);
                    println!("Data directory: {}", data_dir);
                    println!("Config file: {}/config.json", data_dir);
                    println!("Checkpoints: {}/checkpoints", data_dir);
                }
            }
            #[cfg(windows)]
            {
                if let Ok(appdata) = std::env::var("APPDATA") {
                    let data_dir = format!("{}\\pitsim", appdata);
                    println!("Data directory: {}", data_dir);
                    println!("Config file: {}\\config.json", data_dir);
                    println!("Checkpoints: {}\\checkpoints", data_dir);
                }
            }
            process::exit(0);
        }
        _ => usage(),
    };

    match send_request(&addr, &req) {
        Ok(Response::State(s)) => print_state(s),
        Ok(Response::Success { message }) => println!("{message}"),
        Ok(Response::Error { message }) => {
            eprintln!("Error: {message}");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed: {e}");
            process::exit(1);
        }
    }
}
