//! Execution arbiter: the only owner of the address bus.
//!
//! Executions are queued FIFO and a single worker runs them one after the
//! other, holding the bus for the whole run. Two programs therefore never
//! address circuits at the same time, whoever submits them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::circuit::{AddressBus, Sweeper, WateringFlag};
use crate::error::{RigError, RigResult};
use crate::program::{Outcome, Program, ScheduledProgram, StopFlag};
use crate::telemetry::Telemetry;

pub enum Execution {
    /// Manual run of a single circuit or an ad-hoc program.
    Program(Program),
    Scheduled(Arc<ScheduledProgram>),
}

impl Execution {
    async fn run(&self, bus: &mut AddressBus, stop: &StopFlag, telemetry: &Telemetry) -> Outcome {
        match self {
            Self::Program(p) => p.execute(bus, stop, telemetry).await,
            Self::Scheduled(p) => p.scheduled_execute(bus, stop, telemetry).await,
        }
    }

    fn is_activated(&self) -> bool {
        match self {
            Self::Program(p) => p.is_activated(),
            Self::Scheduled(p) => p.program().is_activated(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Program(p) => format!("manual run of {} circuit(s)", p.circuits().len()),
            Self::Scheduled(p) => format!("program {} ({} {})", p.program_id(), p.weekday(), p.time()),
        }
    }
}

struct Job {
    execution: Execution,
    done: oneshot::Sender<Outcome>,
}

#[derive(Clone)]
pub struct Arbiter {
    tx: mpsc::UnboundedSender<Job>,
    bus: Arc<Mutex<AddressBus>>,
    sweeper: Sweeper,
    watering: WateringFlag,
    stop: StopFlag,
    closing: Arc<AtomicBool>,
    current: Current,
}

/// The execution the worker is running, if any.
type Current = Arc<StdMutex<Option<Arc<Execution>>>>;

impl Arbiter {
    /// Take ownership of the bus and start the worker task.
    pub fn spawn(bus: AddressBus, stop: StopFlag, telemetry: Telemetry) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sweeper = bus.sweeper();
        let watering = bus.watering_flag();
        let bus = Arc::new(Mutex::new(bus));
        let closing = Arc::new(AtomicBool::new(false));
        let current = Current::default();

        let handle = tokio::spawn(worker(
            rx,
            bus.clone(),
            stop.clone(),
            closing.clone(),
            current.clone(),
            telemetry,
        ));

        let arbiter = Self {
            tx,
            bus,
            sweeper,
            watering,
            stop,
            closing,
            current,
        };
        (arbiter, handle)
    }

    /// Queue an execution. The receiver resolves when it has run, or with
    /// `Outcome::Stopped` if the arbiter shut down first.
    pub fn submit(&self, execution: Execution) -> RigResult<oneshot::Receiver<Outcome>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(RigError::ArbiterClosed);
        }
        let (done, rx) = oneshot::channel();
        info!(execution = %execution.describe(), "execution queued");
        self.tx
            .send(Job { execution, done })
            .map_err(|_| RigError::ArbiterClosed)?;
        Ok(rx)
    }

    /// Drive every address line LOW. Waits for a running execution to
    /// release the bus.
    pub async fn sweep(&self) {
        self.bus.lock().await.sweep();
    }

    /// Request a stop, refuse further work, and sweep. The sweep happens
    /// even if the running execution does not release the bus within
    /// `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        info!("arbiter shutting down");
        self.closing.store(true, Ordering::SeqCst);
        self.stop.request_stop();
        match tokio::time::timeout(grace, self.bus.lock()).await {
            Ok(mut bus) => bus.sweep(),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "bus not released in time");
                self.sweeper.sweep();
            }
        }
    }

    /// Description of the program currently watering.
    pub fn running(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .filter(|execution| execution.is_activated())
            .map(|execution| execution.describe())
    }

    pub fn watering_flag(&self) -> WateringFlag {
        self.watering.clone()
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    bus: Arc<Mutex<AddressBus>>,
    stop: StopFlag,
    closing: Arc<AtomicBool>,
    current: Current,
    telemetry: Telemetry,
) {
    info!("arbiter worker started");
    while let Some(Job { execution, done }) = rx.recv().await {
        let mut bus = bus.lock().await;
        // A stop only aborts what is running at the time it is requested.
        // Clear it before reading `closing`: shutdown sets `closing` first,
        // so a stop it requests is either seen here or survives the clear.
        stop.resume();
        if closing.load(Ordering::SeqCst) {
            drop(bus);
            let _ = done.send(Outcome::Stopped);
            continue;
        }

        let execution = Arc::new(execution);
        set_current(&current, Some(execution.clone()));
        info!(execution = %execution.describe(), "execution started");
        let outcome = execution.run(&mut bus, &stop, &telemetry).await;
        set_current(&current, None);
        drop(bus);

        info!(execution = %execution.describe(), ?outcome, "execution finished");
        let _ = done.send(outcome);
    }
    info!("arbiter worker exiting");
}

fn set_current(current: &Current, execution: Option<Arc<Execution>>) {
    *current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = execution;
}

// ===========================================================================
// Tests
// ===========================================================================
