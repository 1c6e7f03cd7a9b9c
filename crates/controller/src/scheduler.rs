//! Scheduler daemon: matches local time against the scheduled programs and
//! hands whatever is due to the arbiter.
//!
//! The daemon never runs a program itself. Submissions are fire-and-forget,
//! so a long program never delays the next poll.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{error, info};

use crate::arbiter::{Arbiter, Execution};
use crate::clock::Clock;
use crate::error::RigResult;
use crate::program::ScheduledProgram;
use crate::settings::WateringSettings;
use crate::watering::WateringConfig;

/// Poll interval while nothing is due.
const IDLE_POLL: Duration = Duration::from_secs(15);

/// Pause after a firing, so the same minute cannot match twice.
const AFTER_FIRE: Duration = Duration::from_secs(60);

pub type Entries = Arc<Vec<Arc<ScheduledProgram>>>;

// ---------------------------------------------------------------------------
// Shared schedule
// ---------------------------------------------------------------------------

/// The current list of scheduled programs, replaced wholesale on save.
#[derive(Clone, Default)]
pub struct Schedule(Arc<RwLock<Entries>>);

impl Schedule {
    pub fn replace(&self, entries: Vec<Arc<ScheduledProgram>>) {
        let mut slot = self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::new(entries);
    }

    pub fn current(&self) -> Entries {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// One entry per (activated day, activated start) of every selected program.
pub fn build_schedule(
    config: &WateringConfig,
    limits: &WateringSettings,
) -> RigResult<Vec<Arc<ScheduledProgram>>> {
    let mut entries = Vec::new();
    for (&program_id, program) in config.programs.iter().filter(|(_, p)| p.selected) {
        for (day, time) in program.triggers() {
            entries.push(Arc::new(ScheduledProgram::from_config(
                i64::from(program_id),
                day,
                time,
                config,
                limits,
            )?));
        }
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(schedule: Schedule, arbiter: Arbiter, clock: Arc<dyn Clock>) {
    info!(
        entries = schedule.current().len(),
        idle_poll_sec = IDLE_POLL.as_secs(),
        "scheduler started"
    );

    loop {
        let now = clock.now();
        let due: Vec<Arc<ScheduledProgram>> = schedule
            .current()
            .iter()
            .filter(|entry| entry.check_schedule(now))
            .cloned()
            .collect();

        if due.is_empty() {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }

        for entry in due {
            info!(
                program = entry.program_id(),
                day = %entry.weekday(),
                time = %entry.time(),
                "scheduled program due"
            );
            if let Err(e) = arbiter.submit(Execution::Scheduled(entry)) {
                error!(error = %e, "failed to submit scheduled program");
            }
        }
        tokio::time::sleep(AFTER_FIRE).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
