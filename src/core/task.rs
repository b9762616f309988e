//! Background training tasks.
//!
//! A [`Session`] bundles a controller with an optional protocol. Starting a
//! [`Job`] claims the controller's [`RunControl`] on the calling thread, so a
//! second start is rejected before anything is spawned, and then moves the
//! session onto a worker thread. [`TrainingTask::join`] hands it back.

use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::controller::{RunControl, RunController, RunGuard, Scope, StopReason};
use crate::error::{SimError, SimResult};
use crate::network::Network;
use crate::protocol::{Protocol, ProtocolReport};

/// Long-running operations a control surface can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Every remaining run.
    Train,
    /// The rest of the current run.
    TrainRun,
    /// The rest of the current epoch.
    TrainEpoch,
    /// One pass over the test table.
    TestAll,
    /// The session protocol once, at the current run.
    Protocol,
    /// The session protocol once per configured run.
    ProtocolAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Trained(Option<StopReason>),
    /// False when a stop request cut the pass short.
    Tested(bool),
    Protocol(ProtocolReport),
    Protocols(Vec<ProtocolReport>),
}

pub struct Session<N: Network> {
    pub controller: RunController<N>,
    pub protocol: Option<Protocol>,
}

impl<N: Network> Session<N> {
    pub fn new(controller: RunController<N>) -> Self {
        Self {
            controller,
            protocol: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn control(&self) -> RunControl {
        self.controller.control()
    }

    /// Run `job` on the calling thread.
    pub fn run(&mut self, job: Job) -> SimResult<JobOutcome> {
        self.check(job)?;
        let _guard = self.control().try_begin()?;
        self.run_unguarded(job)
    }

    fn check(&self, job: Job) -> SimResult<()> {
        if matches!(job, Job::Protocol | Job::ProtocolAll) && self.protocol.is_none() {
            return Err(SimError::Configuration("no protocol configured".into()));
        }
        Ok(())
    }

    fn run_unguarded(&mut self, job: Job) -> SimResult<JobOutcome> {
        let ctl = &mut self.controller;
        match job {
            Job::Train => ctl.train_loop(Scope::All).map(JobOutcome::Trained),
            Job::TrainRun => ctl.train_loop(Scope::Run).map(JobOutcome::Trained),
            Job::TrainEpoch => ctl.train_loop(Scope::Epoch).map(JobOutcome::Trained),
            Job::TestAll => ctl.test_all().map(JobOutcome::Tested),
            Job::Protocol | Job::ProtocolAll => {
                let Some(protocol) = &self.protocol else {
                    return Err(SimError::Configuration("no protocol configured".into()));
                };
                if job == Job::Protocol {
                    protocol.run_unguarded(ctl).map(JobOutcome::Protocol)
                } else {
                    protocol.run_all_unguarded(ctl).map(JobOutcome::Protocols)
                }
            }
        }
    }
}

/// A rejected start; the session is handed back untouched.
pub struct StartError<N: Network> {
    pub session: Session<N>,
    pub error: SimError,
}

impl<N: Network> std::fmt::Debug for StartError<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<N: Network + Send + 'static> Session<N> {
    /// Claim the run control and run `job` on a worker thread.
    pub fn start(self, job: Job) -> Result<TrainingTask<N>, StartError<N>> {
        if let Err(error) = self.check(job) {
            return Err(StartError {
                session: self,
                error,
            });
        }
        let control = self.control();
        let guard = match control.try_begin() {
            Ok(guard) => guard,
            Err(error) => {
                return Err(StartError {
                    session: self,
                    error,
                })
            }
        };

        info!(?job, "starting task");
        let handle = thread::spawn(move || worker(self, job, guard));
        Ok(TrainingTask { handle, control })
    }
}

fn worker<N: Network>(mut session: Session<N>, job: Job, guard: RunGuard) -> Finished<N> {
    let outcome = session.run_unguarded(job);
    drop(guard);
    match &outcome {
        Ok(out) => info!(?job, ?out, "task finished"),
        Err(e) => error!(?job, %e, "task failed"),
    }
    Finished { session, outcome }
}

pub struct Finished<N: Network> {
    pub session: Session<N>,
    pub outcome: SimResult<JobOutcome>,
}

/// Handle to a job running on a worker thread.
pub struct TrainingTask<N: Network> {
    handle: JoinHandle<Finished<N>>,
    control: RunControl,
}

impl<N: Network> TrainingTask<N> {
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request a stop after the in-flight trial.
    pub fn stop(&self) {
        self.control.stop();
    }

    /// Wait for the worker. A panic on the worker loses the session.
    pub fn join(self) -> SimResult<Finished<N>> {
        self.handle.join().map_err(|_| {
            error!("training task panicked");
            SimError::TaskPanicked
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::RunConfig;
    use crate::controller::SimulationState;
    use crate::env::{TrialRecord, TrialTable};
    use crate::mock::{Call, RecordingNet};
    use crate::network::LayerRole;
    use crate::protocol::Phase;

    fn session(net: RecordingNet, max_epochs: usize) -> Session<RecordingNet> {
        let table = Arc::new(TrialTable::new(
            "t",
            vec![
                TrialRecord::new("a")
                    .with_field("In", vec![1.0])
                    .with_field("Out", vec![0.0]),
                TrialRecord::new("b")
                    .with_field("In", vec![0.0])
                    .with_field("Out", vec![1.0]),
            ],
        ));
        let driven = [
            ("In".to_string(), LayerRole::Input),
            ("Out".to_string(), LayerRole::Target),
        ];
        let state = SimulationState::new(net, &driven, 1).unwrap();
        let config = RunConfig {
            max_epochs,
            cycles_per_quarter: 1,
            diagnostic_interval: -1,
            ..Default::default()
        };
        Session::new(RunController::new(state, config, Arc::clone(&table), table).unwrap())
    }

    fn net() -> RecordingNet {
        RecordingNet::new(&[("In", 1), ("Out", 1)])
    }

    #[test]
    fn task_runs_to_completion() {
        let task = session(net(), 3).start(Job::Train).unwrap();
        let done = task.join().unwrap();
        assert_eq!(
            done.outcome.unwrap(),
            JobOutcome::Trained(Some(StopReason::MaxEpochs))
        );
        let net = &done.session.controller.state().net;
        assert_eq!(net.count(|c| *c == Call::ApplyDelta), 6);
        assert!(!done.session.control().is_running());
    }

    #[test]
    fn stop_ends_task_between_trials() {
        let task = session(net(), 1_000_000).start(Job::Train).unwrap();
        assert!(task.control().is_running());
        task.stop();
        let done = task.join().unwrap();
        assert_eq!(done.outcome.unwrap(), JobOutcome::Trained(None));
        let net = &done.session.controller.state().net;
        // Every begun trial finished its weight update.
        assert_eq!(
            net.count(|c| matches!(c, Call::BeginTrial(true))),
            net.count(|c| *c == Call::ApplyDelta)
        );
        assert!(!done.session.control().is_running());
    }

    #[test]
    fn start_rejected_while_running() {
        let session = session(net(), 1);
        let control = session.control();
        let _guard = control.try_begin().unwrap();
        let Err(rejected) = session.start(Job::TrainEpoch) else {
            panic!("start should be rejected while running");
        };
        assert!(matches!(rejected.error, SimError::AlreadyRunning));
        let calls = &rejected.session.controller.state().net.calls;
        assert!(calls.iter().all(|c| matches!(c, Call::SetRole(..))));
    }

    #[test]
    fn protocol_job_needs_a_protocol() {
        let mut s = session(net(), 1);
        assert!(s.run(Job::Protocol).unwrap_err().is_configuration());
        assert!(!s.control().is_running());

        let table = s.controller.train_env().table().clone();
        let protocol =
            Protocol::build(s.controller.state(), vec![Phase::new("A", table, 2)]).unwrap();
        let mut s = s.with_protocol(protocol);
        match s.run(Job::Protocol).unwrap() {
            JobOutcome::Protocol(report) => assert_eq!(report.phases[0].epochs, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn worker_panic_maps_to_task_panicked() {
        let net = net().with_sse(|_| panic!("engine fault"));
        let s = session(net, 5);
        let control = s.control();
        let task = s.start(Job::Train).unwrap();
        assert!(matches!(task.join(), Err(SimError::TaskPanicked)));
        assert!(!control.is_running());
    }
}
