//! pitsim - batch runner
//!
//! Runs a simulation described by a JSON configuration file (or the built-in
//! depression PIT demo) to completion, logging through `tracing` and printing
//! a summary of the run table at the end.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pitsim::experiments::depress;
use pitsim::prelude::*;
use pitsim::stats::Stats;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_help() {
    println!("pitsim - trial-based network simulation runner");
    println!();
    println!("USAGE:");
    println!("  pitsim run --config <file.json> [options]");
    println!("  pitsim demo [--instr N] [--pvlv N] [options]");
    println!("  pitsim dump-config [file.json] [--instr N] [--pvlv N]");
    println!("  pitsim help");
    println!();
    println!("OPTIONS:");
    println!("  --run N          first run index");
    println!("  --runs N         number of runs");
    println!("  --epochs N       epoch budget for plain training");
    println!("  --tag NAME       extra tag for file names");
    println!("  --params NAME    parameter set name, recorded in file names");
    println!("  --wts            save weights at the end of each run");
    println!("  --checkpoints D  keep checkpoints as files under D");
    println!("  --epclog FILE    write the train epoch table as TSV");
    println!("  --runlog FILE    write the train run table as TSV");
    println!();
    println!("Set RUST_LOG=debug to see per-epoch rows.");
}

#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    out: Option<PathBuf>,
    start_run: Option<usize>,
    runs: Option<usize>,
    epochs: Option<usize>,
    instr: Option<usize>,
    pvlv: Option<usize>,
    tag: Option<String>,
    params: Option<String>,
    wts: bool,
    checkpoints: Option<PathBuf>,
    epclog: Option<PathBuf>,
    runlog: Option<PathBuf>,
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} needs a value"))
        };
        let number = |v: String| {
            v.parse::<usize>()
                .map_err(|_| format!("{flag}: `{v}` is not a number"))
        };
        match flag {
            "--config" => opts.config = Some(PathBuf::from(value()?)),
            "--run" => opts.start_run = Some(number(value()?)?),
            "--runs" => opts.runs = Some(number(value()?)?),
            "--epochs" => opts.epochs = Some(number(value()?)?),
            "--instr" => opts.instr = Some(number(value()?)?),
            "--pvlv" => opts.pvlv = Some(number(value()?)?),
            "--tag" => opts.tag = Some(value()?),
            "--params" => opts.params = Some(value()?),
            "--wts" => opts.wts = true,
            "--checkpoints" => opts.checkpoints = Some(PathBuf::from(value()?)),
            "--epclog" => opts.epclog = Some(PathBuf::from(value()?)),
            "--runlog" => opts.runlog = Some(PathBuf::from(value()?)),
            other if !other.starts_with("--") && opts.out.is_none() => {
                opts.out = Some(PathBuf::from(other))
            }
            other => return Err(format!("unknown option `{other}`")),
        }
        i += 1;
    }
    Ok(opts)
}

fn demo_config(opts: &Options) -> SimConfig {
    depress::sim_config(opts.instr.unwrap_or(100), opts.pvlv.unwrap_or(100))
}

fn apply_overrides(cfg: &mut SimConfig, opts: &Options) {
    if let Some(run) = opts.start_run {
        cfg.run.start_run = run;
    }
    if let Some(runs) = opts.runs {
        cfg.run.max_runs = runs;
    }
    if let Some(epochs) = opts.epochs {
        cfg.run.max_epochs = epochs;
    }
    if let Some(tag) = &opts.tag {
        cfg.run.tag = tag.clone();
    }
    if let Some(params) = &opts.params {
        cfg.run.params = params.clone();
    }
    if opts.wts {
        cfg.run.save_weights = true;
    }
    if let Some(dir) = &opts.checkpoints {
        cfg.checkpoint_dir = Some(dir.clone());
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1) else {
        print_help();
        std::process::exit(2);
    };
    let opts = match parse_options(&args[2..]) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let result = match cmd.as_str() {
        "help" | "--help" | "-h" => {
            print_help();
            return;
        }
        "dump-config" => dump_config(&opts),
        "demo" => {
            let mut cfg = demo_config(&opts);
            apply_overrides(&mut cfg, &opts);
            run(cfg, &opts)
        }
        "run" => match &opts.config {
            Some(path) => SimConfig::load(path).and_then(|mut cfg| {
                apply_overrides(&mut cfg, &opts);
                run(cfg, &opts)
            }),
            None => Err(SimError::Configuration("run needs --config <file>".into())),
        },
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        error!(%e, "simulation failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn dump_config(opts: &Options) -> SimResult<()> {
    let cfg = demo_config(opts);
    match &opts.out {
        Some(path) => {
            cfg.save(path)?;
            println!("Wrote {}", path.display());
        }
        None => {
            let json = serde_json::to_string_pretty(&cfg)?;
            println!("{json}");
        }
    }
    Ok(())
}

fn run(cfg: SimConfig, opts: &Options) -> SimResult<()> {
    cfg.run.validate()?;
    let memory = MemoryLog::new().skipping(Timescale::Cycle).shared();
    let mut session = cfg.build()?;
    session.controller.logs_mut().attach(TracingLog);
    session.controller.logs_mut().attach(Arc::clone(&memory));

    info!(
        network = %cfg.network.name,
        runs = cfg.run.max_runs,
        phases = cfg.phases.len(),
        "starting"
    );
    session.controller.init()?;
    let job = if session.protocol.is_some() {
        Job::ProtocolAll
    } else {
        Job::Train
    };
    let outcome = session.run(job)?;

    let memory = memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(path) = &opts.epclog {
        write_tsv(path, memory.table(Mode::Train, Timescale::Epoch))?;
    }
    if let Some(path) = &opts.runlog {
        write_tsv(path, memory.table(Mode::Train, Timescale::Run))?;
    }
    print_summary(&outcome, &memory);
    Ok(())
}

fn print_summary(outcome: &JobOutcome, memory: &MemoryLog) {
    println!();
    match outcome {
        JobOutcome::Protocols(reports) => {
            for report in reports {
                let status = if report.cancelled { " (cancelled)" } else { "" };
                println!("Run {}{status}", report.run);
                for phase in &report.phases {
                    let reason = format!("{:?}", phase.stop_reason);
                    println!(
                        "  {:<14} epochs {:>5}  first zero {:>5}  stop {reason}",
                        phase.name, phase.epochs, phase.first_zero
                    );
                }
            }
        }
        JobOutcome::Trained(reason) => println!("Training ended: {reason:?}"),
        JobOutcome::Tested(done) => println!("Test pass complete: {done}"),
        JobOutcome::Protocol(report) => println!("Protocol run {}: {} phases", report.run, report.phases.len()),
    }

    let summary = memory.run_summary();
    println!();
    println!("Runs:       {} ({} reached the zero-error streak)", summary.runs, summary.converged);
    if summary.first_zero.count > 0 {
        println!(
            "FirstZero:  mean {:.1}  min {:.0}  max {:.0}",
            summary.first_zero.mean, summary.first_zero.min, summary.first_zero.max
        );
    }
    println!(
        "PctCor:     mean {:.3}  min {:.3}  max {:.3}",
        summary.pct_cor.mean, summary.pct_cor.min, summary.pct_cor.max
    );
}

/// Tab-separated dump of a log table; columns are the union of keys, sorted.
fn write_tsv(path: &Path, rows: &[Stats]) -> SimResult<()> {
    let cells: Vec<BTreeMap<&str, String>> = rows
        .iter()
        .map(|s| {
            s.ints()
                .map(|(k, v)| (k, v.to_string()))
                .chain(s.floats().map(|(k, v)| (k, format!("{v:.6}"))))
                .chain(s.strings().map(|(k, v)| (k, v.to_string())))
                .collect()
        })
        .collect();
    let mut columns: Vec<&str> = cells.iter().flat_map(|row| row.keys().copied()).collect();
    columns.sort_unstable();
    columns.dedup();

    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "{}", columns.join("\t"))?;
    for row in &cells {
        let line: Vec<&str> = columns
            .iter()
            .map(|c| row.get(c).map(String::as_str).unwrap_or(""))
            .collect();
        writeln!(w, "{}", line.join("\t"))?;
    }
    w.flush()?;
    info!(path = %path.display(), rows = rows.len(), "wrote log table");
    Ok(())
}
