//! Command surface used by the HTTP adapter: manual runs, config save/load,
//! stop, valve override and flow history.

use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{error, info, warn};

use crate::arbiter::{Arbiter, Execution};
use crate::circuit::CircuitId;
use crate::clock::Clock;
use crate::db::{Db, FlowSample};
use crate::error::{RigError, RigResult};
use crate::governor::{MainValve, ValveState};
use crate::program::{Outcome, Program, ScheduledProgram};
use crate::scheduler::{build_schedule, Schedule};
use crate::settings::WateringSettings;
use crate::state::{SharedState, StatusResponse};
use crate::telemetry::{Telemetry, WateringEvent};
use crate::watering::{ConfigStore, TimeOfDay, WateringConfig, Weekday};

/// Everything the controller drives, assembled in `main`.
pub struct Wiring {
    pub limits: WateringSettings,
    pub store: Arc<dyn ConfigStore>,
    pub arbiter: Arbiter,
    pub telemetry: Telemetry,
    pub valve: MainValve,
    pub db: Db,
    pub shared: SharedState,
    pub clock: Arc<dyn Clock>,
}

pub struct Controller {
    limits: WateringSettings,
    store: Arc<dyn ConfigStore>,
    config: RwLock<WateringConfig>,
    schedule: Schedule,
    arbiter: Arbiter,
    telemetry: Telemetry,
    valve: MainValve,
    db: Db,
    shared: SharedState,
    clock: Arc<dyn Clock>,
}

pub type Completion = oneshot::Receiver<Outcome>;

impl Controller {
    /// Load the stored config and derive the initial schedule. An unreadable
    /// config leaves the rig with an empty schedule rather than failing.
    pub fn start(w: Wiring) -> Self {
        let config = match w.store.load() {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "stored watering config rejected, starting empty");
                WateringConfig::default()
            }
        };

        let schedule = Schedule::default();
        match build_schedule(&config, &w.limits) {
            Ok(entries) => {
                info!(entries = entries.len(), "schedule loaded");
                schedule.replace(entries);
            }
            Err(e) => error!(error = %e, "failed to build schedule, starting empty"),
        }

        Self {
            limits: w.limits,
            store: w.store,
            config: RwLock::new(config),
            schedule,
            arbiter: w.arbiter,
            telemetry: w.telemetry,
            valve: w.valve,
            db: w.db,
            shared: w.shared,
            clock: w.clock,
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule.clone()
    }

    // ----------------------------
    // Manual runs
    // ----------------------------

    /// Run a configured program now, as if scheduled for today at 00:00.
    pub async fn init_program(&self, program_id: i64) -> RigResult<Completion> {
        let today = Weekday::from(self.clock.now().weekday());
        let program = {
            let config = self.config.read().await;
            ScheduledProgram::from_config(program_id, today, TimeOfDay::MIDNIGHT, &config, &self.limits)
        };
        let program = program.inspect_err(|e| warn!(error = %e, "init_program rejected"))?;

        info!(program = program_id, "manual program run requested");
        self.arbiter.submit(Execution::Scheduled(Arc::new(program)))
    }

    /// Water a single circuit for `minutes`.
    pub fn init_circuit(&self, circuit_id: i64, minutes: i64) -> RigResult<Completion> {
        let checked = CircuitId::new(circuit_id, self.limits.circuits).and_then(|id| {
            u32::try_from(minutes)
                .map(|m| (id, m))
                .map_err(|_| RigError::InvalidDuration { minutes })
        });
        let (id, minutes) = checked.inspect_err(|e| warn!(error = %e, "init_circuit rejected"))?;

        info!(circuit = id.get(), minutes, "manual circuit run requested");
        self.arbiter.submit(Execution::Program(Program::single(id, minutes)))
    }

    /// Abort whatever is running. Queued executions still run.
    pub fn stop_all(&self) {
        info!("stop requested");
        self.arbiter.stop_flag().request_stop();
        self.telemetry.emit(WateringEvent::StopWatering);
    }

    // ----------------------------
    // Config
    // ----------------------------

    pub async fn get_config(&self) -> WateringConfig {
        self.config.read().await.clone()
    }

    /// Validate, persist, then swap in the new schedule. Nothing changes if
    /// any step fails. The config lock is held from the write to the swap,
    /// so concurrent saves land on disk in the order they reach memory.
    pub async fn save_config(&self, config: WateringConfig) -> RigResult<()> {
        config
            .validate(&self.limits)
            .inspect_err(|e| warn!(error = %e, "config rejected"))?;
        let entries = build_schedule(&config, &self.limits)?;

        let mut current = self.config.write().await;
        let store = self.store.clone();
        let to_save = config.clone();
        tokio::task::spawn_blocking(move || store.save(&to_save))
            .await
            .map_err(|e| RigError::Persistence(e.to_string()))?
            .inspect_err(|e| error!(error = %e, "config not saved"))?;

        *current = config;
        info!(entries = entries.len(), "config saved, schedule replaced");
        self.schedule.replace(entries);
        Ok(())
    }

    // ----------------------------
    // Supply valve and flow
    // ----------------------------

    /// Force the main valve open or closed, or with `None` just report it.
    /// The governor re-applies its own decision on the next tick.
    pub fn valve_override(&self, status: Option<bool>) -> ValveState {
        if let Some(open) = status {
            info!(open, "manual main valve override");
            self.valve.set(ValveState::from(open));
        }
        self.valve.state()
    }

    /// The newest `points` flow samples, oldest first.
    pub async fn flow_samples(&self, points: i64) -> RigResult<Vec<FlowSample>> {
        if points <= 0 {
            return Ok(Vec::new());
        }
        self.db
            .recent_samples(points)
            .await
            .map_err(|e| RigError::Persistence(format!("{e:#}")))
    }

    pub async fn status(&self) -> StatusResponse {
        let watering = self.arbiter.watering_flag().is_active();
        let stopped = self.arbiter.stop_flag().is_stopped();
        let running = self.arbiter.running();
        self.shared.read().await.to_status(watering, stopped, running)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
