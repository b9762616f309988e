//! pitsim daemon - background simulation service
//!
//! Owns one simulation session and exposes it to control surfaces over a
//! line-delimited JSON protocol on 127.0.0.1:9877. Long jobs (training,
//! protocols, test passes) run on a worker thread; the daemon keeps
//! answering requests while they run and reaps them when they finish.
//!
//! Storage locations:
//! - Linux: ~/.local/share/pitsim/
//! - Windows: %APPDATA%\pitsim\
//! - MacOS: ~/Library/Application Support/pitsim/

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use pitsim::experiments::depress;
use pitsim::prelude::*;
use pitsim::task::{Finished, StartError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod paths;

use paths::AppPaths;

const ADDR: &str = "127.0.0.1:9877";

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Messages
// ═══════════════════════════════════════════════════════════════════════════

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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
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

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Response::Success {
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Daemon State
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Sim(#[from] SimError),

    #[error("a task is running; send Stop first")]
    Busy,

    #[error("no session available: {0}")]
    NoSession(String),
}

struct DaemonState {
    paths: AppPaths,
    config: SimConfig,
    session: Option<Session<RateNet>>,
    task: Option<TrainingTask<RateNet>>,
    memory: Arc<StdMutex<MemoryLog>>,
    last_outcome: Option<String>,
}

impl DaemonState {
    fn new(paths: AppPaths) -> Result<Self, DaemonError> {
        let config_file = paths.config_file();
        let mut config = if config_file.exists() {
            info!("Loading config: {:?}", config_file);
            SimConfig::load(&config_file)?
        } else {
            info!("No config file; using the depression PIT demo");
            depress::sim_config(100, 100)
        };
        if config.checkpoint_dir.is_none() {
            config.checkpoint_dir = Some(paths.checkpoint_dir());
        }

        let memory = MemoryLog::new()
            .skipping(Timescale::Cycle)
            .skipping(Timescale::Trial)
            .shared();
        let mut state = Self {
            paths,
            config,
            session: None,
            task: None,
            memory,
            last_outcome: None,
        };
        state.rebuild()?;
        Ok(state)
    }

    /// Fresh session from the config, initialized at the first run.
    fn rebuild(&mut self) -> Result<(), DaemonError> {
        let mut session = self.config.build()?;
        session.controller.logs_mut().attach(TracingLog);
        session.controller.logs_mut().attach(Arc::clone(&self.memory));
        session.controller.init()?;
        self.session = Some(session);
        Ok(())
    }

    /// Take back the session from a finished task.
    fn reap(&mut self) {
        if !self.task.as_ref().is_some_and(|t| t.is_finished()) {
            return;
        }
        let Some(task) = self.task.take() else {
            return;
        };
        match task.join() {
            Ok(Finished { session, outcome }) => {
                self.session = Some(session);
                self.last_outcome = Some(match outcome {
                    Ok(out) => describe(&out),
                    Err(e) => format!("failed: {e}"),
                });
            }
            Err(e) => {
                warn!("Task lost its session ({}); rebuilding", e);
                self.last_outcome = Some(format!("failed: {e}"));
                if let Err(e) = self.rebuild() {
                    error!("Rebuild failed: {}", e);
                }
            }
        }
    }

    fn idle_session(&mut self) -> Result<&mut Session<RateNet>, DaemonError> {
        self.reap();
        if self.task.is_some() {
            return Err(DaemonError::Busy);
        }
        self.session
            .as_mut()
            .ok_or_else(|| DaemonError::NoSession("rebuild after a failed task did not succeed".into()))
    }

    fn start(&mut self, job: Job) -> Result<String, DaemonError> {
        self.reap();
        if self.task.is_some() {
            return Err(SimError::AlreadyRunning.into());
        }
        let session = self
            .session
            .take()
            .ok_or_else(|| DaemonError::NoSession("nothing to start".into()))?;
        match session.start(job) {
            Ok(task) => {
                self.task = Some(task);
                self.last_outcome = None;
                Ok(format!("Started {job:?}"))
            }
            Err(StartError { session, error }) => {
                self.session = Some(session);
                Err(error.into())
            }
        }
    }

    fn stop(&mut self) -> String {
        self.reap();
        match &self.task {
            Some(task) => {
                task.stop();
                "Stop requested".to_string()
            }
            None => "Nothing running".to_string(),
        }
    }

    fn reset_run_log(&mut self) {
        match self.idle_session() {
            Ok(session) => session.controller.logs_mut().reset(Mode::Train, Timescale::Run),
            // The controller is on the worker; clear the daemon's copy only.
            Err(_) => self
                .memory
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .reset_log(Mode::Train, Timescale::Run),
        }
    }

    fn get_snapshot(&mut self) -> StateSnapshot {
        self.reap();
        let memory = self.memory.lock().unwrap_or_else(|p| p.into_inner());
        let summary = memory.run_summary();
        let last_epoch = memory.table(Mode::Train, Timescale::Epoch).last().cloned();
        drop(memory);

        let mut snap = StateSnapshot {
            running: self.task.is_some(),
            network: self.config.network.name.clone(),
            max_runs: self.config.run.max_runs,
            max_epochs: self.config.run.max_epochs,
            has_protocol: !self.config.phases.is_empty(),
            last_outcome: self.last_outcome.clone(),
            runs_logged: summary.runs,
            converged: summary.converged,
            ..Default::default()
        };

        // Live values come from the controller when it is home, otherwise
        // from the newest epoch row the worker has logged.
        let stats = match &self.session {
            Some(session) => {
                snap.trial_name = session.controller.train_env().trial_name().to_string();
                Some(session.controller.stats().clone())
            }
            None => last_epoch,
        };
        if let Some(stats) = stats {
            snap.phase = stats.string("Phase").to_string();
            snap.run = stats.int("Run");
            snap.epoch = stats.int("Epoch");
            snap.epoch_sse = stats.float("EpcSSE");
            snap.pct_cor = stats.float("EpcPctCor");
            snap.cos_diff = stats.float("EpcCosDiff");
            snap.nzero = stats.int("NZero");
            snap.first_zero = stats.int("FirstZero");
        }
        snap
    }

    fn handle(&mut self, request: Request) -> Response {
        let result = match request {
            Request::GetState => return Response::State(self.get_snapshot()),
            Request::Init => self
                .idle_session()
                .and_then(|s| Ok(s.controller.init()?))
                .map(|_| "Initialized".to_string()),
            Request::Train => self.start(Job::Train),
            Request::TrainPit => self.start(Job::ProtocolAll),
            Request::StepEpoch => self.start(Job::TrainEpoch),
            Request::StepRun => self.start(Job::TrainRun),
            Request::TestAll => self.start(Job::TestAll),
            Request::StepTrial => self
                .idle_session()
                .and_then(|s| Ok(s.controller.train_trial()?))
                .map(|step| format!("{step:?}")),
            Request::Stop => Ok(self.stop()),
            Request::NewSeed => self.idle_session().map(|s| {
                s.controller.new_rnd_seed();
                "New random seed".to_string()
            }),
            Request::SaveWeights { name } => self
                .idle_session()
                .and_then(|s| {
                    s.controller
                        .state_mut()
                        .net
                        .save_checkpoint(&name)
                        .map_err(|e| DaemonError::Sim(e.into()))
                })
                .map(|_| format!("Saved checkpoint `{name}`")),
            Request::ResetRunLog => {
                self.reset_run_log();
                Ok("Run log cleared".to_string())
            }
            Request::Shutdown => Ok(self.stop()),
        };
        match result {
            Ok(message) => Response::ok(message),
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }
}

fn describe(outcome: &JobOutcome) -> String {
    match outcome {
        JobOutcome::Trained(Some(reason)) => format!("trained: {reason:?}"),
        JobOutcome::Trained(None) => "trained: stopped".to_string(),
        JobOutcome::Tested(true) => "tested".to_string(),
        JobOutcome::Tested(false) => "tested: stopped".to_string(),
        JobOutcome::Protocol(report) => protocol_line(report),
        JobOutcome::Protocols(reports) => reports
            .iter()
            .map(protocol_line)
            .collect::<Vec<_>>()
            .join("; "),
    }
}

fn protocol_line(report: &ProtocolReport) -> String {
    let phases: Vec<String> = report
        .phases
        .iter()
        .map(|p| format!("{} {} epochs", p.name, p.epochs))
        .collect();
    let cancelled = if report.cancelled { " (cancelled)" } else { "" };
    format!("run {}: {}{cancelled}", report.run, phases.join(", "))
}

// ═══════════════════════════════════════════════════════════════════════════
// Client Handler
// ═══════════════════════════════════════════════════════════════════════════

async fn handle_client(
    stream: TcpStream,
    state: Arc<Mutex<DaemonState>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("Invalid request: {}", e),
                };
                writer
                    .write_all(serde_json::to_string(&resp)?.as_bytes())
                    .await?;
                writer.write_all(b"\n").await?;
                continue;
            }
        };

        let shutdown = matches!(request, Request::Shutdown);
        let response = {
            let mut s = state.lock().await;
            s.handle(request)
        };
        if shutdown {
            info!("Shutdown requested");
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::process::exit(0);
            });
        }

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Main
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let paths = AppPaths::new()?;
    info!("Data directory: {:?}", paths.data_dir());
    info!("Checkpoints: {:?}", paths.checkpoint_dir());

    let state = Arc::new(Mutex::new(DaemonState::new(paths)?));

    // Ask a running task to stop before exiting on Ctrl-C.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let mut s = state.lock().await;
                info!("Ctrl-C: {}", s.stop());
                std::process::exit(0);
            }
        });
    }

    let listener = TcpListener::bind(ADDR).await?;
    info!("pitsim daemon listening on {}", ADDR);

    // Reaper: collect finished tasks even when no client is polling.
    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let mut s = state_clone.lock().await;
            let was_running = s.task.is_some();
            s.reap();
            if was_running && s.task.is_none() {
                info!("Task done: {}", s.last_outcome.as_deref().unwrap_or("-"));
            }
        }
    });

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Client connected: {}", addr);
        let state_clone = Arc::clone(&state);

        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, state_clone).await {
                error!("Client handler error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    fn temp_state(tag: &str, tweak: impl FnOnce(&mut SimConfig)) -> DaemonState {
        let dir: PathBuf =
            std::env::temp_dir().join(format!("pitsimd-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let paths = AppPaths::at(dir).unwrap();
        let mut cfg = depress::sim_config(2, 2);
        cfg.run.max_runs = 1;
        cfg.run.max_epochs = 2;
        tweak(&mut cfg);
        cfg.save(&paths.config_file()).unwrap();
        DaemonState::new(paths).unwrap()
    }

    fn wait_idle(state: &mut DaemonState) {
        let deadline = Instant::now() + Duration::from_secs(60);
        while state.task.is_some() {
            assert!(Instant::now() < deadline, "task did not finish");
            std::thread::sleep(Duration::from_millis(10));
            state.reap();
        }
    }

    #[test]
    fn protocol_runs_in_background_and_is_reaped() {
        let mut state = temp_state("pit", |_| {});
        assert!(matches!(state.handle(Request::TrainPit), Response::Success { .. }));
        wait_idle(&mut state);

        let snap = state.get_snapshot();
        assert!(!snap.running);
        assert!(snap.has_protocol);
        let outcome = snap.last_outcome.unwrap();
        assert!(outcome.contains("INSTRUMENTAL"), "{outcome}");
        assert!(state.paths.checkpoint_dir().join("trained.wts").exists());
    }

    #[test]
    fn idle_only_requests_rejected_while_busy() {
        let mut state = temp_state("busy", |cfg| {
            cfg.phases.clear();
            cfg.run.max_epochs = 1_000_000;
        });

        assert!(matches!(state.handle(Request::Train), Response::Success { .. }));
        match state.handle(Request::NewSeed) {
            Response::Error { message } => assert!(message.contains("Stop first"), "{message}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            state.start(Job::TestAll),
            Err(DaemonError::Sim(SimError::AlreadyRunning))
        ));
        assert!(matches!(state.handle(Request::TrainPit), Response::Error { .. }));
        assert!(state.get_snapshot().running);

        assert!(matches!(state.handle(Request::Stop), Response::Success { .. }));
        wait_idle(&mut state);
        assert_eq!(state.last_outcome.as_deref(), Some("trained: stopped"));
        assert!(matches!(state.handle(Request::StepTrial), Response::Success { .. }));
    }

    #[test]
    fn save_weights_writes_checkpoint_file() {
        let mut state = temp_state("wts", |_| {});
        match state.handle(Request::SaveWeights { name: "snap".into() }) {
            Response::Success { message } => assert!(message.contains("snap")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(state.paths.checkpoint_dir().join("snap.wts").exists());
    }

    #[test]
    fn save_weights_stays_inside_checkpoint_dir() {
        let mut state = temp_state("escape", |_| {});
        let outside = state.paths.checkpoint_dir().join("../escaped");
        match state.handle(Request::SaveWeights {
            name: "../escaped".into(),
        }) {
            Response::Error { message } => {
                assert!(message.contains("invalid checkpoint name"), "{message}")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!outside.with_extension("wts").exists());
    }

    #[test]
    fn reset_run_log_clears_memory_table() {
        let mut state = temp_state("runlog", |cfg| cfg.phases.clear());
        state.handle(Request::Train);
        wait_idle(&mut state);
        assert_eq!(state.get_snapshot().runs_logged, 1);
        state.handle(Request::ResetRunLog);
        assert_eq!(state.get_snapshot().runs_logged, 0);
    }
}
