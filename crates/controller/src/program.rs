//! Programs: ordered circuit runs, and their weekly-scheduled variant.
//!
//! A program walks its circuits strictly in sequence. Each circuit counts
//! down in one-second ticks, polling the stop flag every tick, so a stop
//! request takes effect within a second and skips whatever is left.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::PrimitiveDateTime;
use tracing::{info, warn};

use crate::circuit::{AddressBus, Circuit, CircuitId};
use crate::error::{RigError, RigResult};
use crate::settings::WateringSettings;
use crate::telemetry::{Telemetry, WateringEvent};
use crate::watering::{TimeOfDay, WateringConfig, Weekday};

const TICK: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Stop flag
// ---------------------------------------------------------------------------

/// Process-wide "stop requested" token.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Stopped,
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Program {
    /// (circuit, minutes) in run order.
    circuits: Vec<(CircuitId, u32)>,
    activated: AtomicBool,
}

impl Program {
    pub fn new(circuits: Vec<(CircuitId, u32)>) -> Self {
        Self {
            circuits,
            activated: AtomicBool::new(false),
        }
    }

    pub fn single(circuit: CircuitId, minutes: u32) -> Self {
        Self::new(vec![(circuit, minutes)])
    }

    pub fn circuits(&self) -> &[(CircuitId, u32)] {
        &self.circuits
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    /// Run every circuit in order. The caller must hold the bus for the
    /// whole run.
    pub async fn execute(
        &self,
        bus: &mut AddressBus,
        stop: &StopFlag,
        telemetry: &Telemetry,
    ) -> Outcome {
        self.activated.store(true, Ordering::SeqCst);
        let mut outcome = Outcome::Completed;

        for &(id, minutes) in &self.circuits {
            if stop.is_stopped() {
                outcome = Outcome::Stopped;
                break;
            }
            if run_circuit(id, minutes, bus, stop, telemetry).await == Outcome::Stopped {
                outcome = Outcome::Stopped;
                break;
            }
        }

        if outcome == Outcome::Stopped {
            warn!("watering stopped, remaining circuits skipped");
        }
        self.activated.store(false, Ordering::SeqCst);
        outcome
    }
}

async fn run_circuit(
    id: CircuitId,
    minutes: u32,
    bus: &mut AddressBus,
    stop: &StopFlag,
    telemetry: &Telemetry,
) -> Outcome {
    let mut circuit = Circuit::from_id(id);
    circuit.activate(bus);
    info!(circuit = id.get(), minutes, "watering circuit");

    let total_secs = u64::from(minutes) * 60;
    let mut outcome = Outcome::Completed;
    for elapsed in 0..total_secs {
        if stop.is_stopped() {
            outcome = Outcome::Stopped;
            break;
        }
        if elapsed % 60 == 0 {
            telemetry.emit(WateringEvent::ActivatedCircuits {
                circuit: id.get(),
                activated: true,
                minutes: ((total_secs - elapsed) / 60) as u32,
            });
        }
        tokio::time::sleep(TICK).await;
    }

    circuit.deactivate(bus);
    telemetry.emit(WateringEvent::ActivatedCircuits {
        circuit: id.get(),
        activated: false,
        minutes: 0,
    });

    if stop.is_stopped() {
        Outcome::Stopped
    } else {
        outcome
    }
}

// ---------------------------------------------------------------------------
// Scheduled program
// ---------------------------------------------------------------------------

/// A program bound to one weekday and one start time.
#[derive(Debug)]
pub struct ScheduledProgram {
    program_id: u8,
    weekday: Weekday,
    time: TimeOfDay,
    program: Program,
}

impl ScheduledProgram {
    /// Build from the config, keeping only activated circuits. A program
    /// absent from the config yields an empty run.
    pub fn from_config(
        program_id: i64,
        weekday: Weekday,
        time: TimeOfDay,
        config: &WateringConfig,
        limits: &WateringSettings,
    ) -> RigResult<Self> {
        if !(1..=i64::from(limits.programs)).contains(&program_id) {
            return Err(RigError::InvalidProgramId {
                id: program_id,
                max: limits.programs,
            });
        }
        let program_id = program_id as u8;

        let circuits = match config.program(program_id) {
            Some(p) => p
                .active_circuits()
                .map(|(id, minutes)| {
                    CircuitId::new(i64::from(id), limits.circuits).map(|c| (c, minutes))
                })
                .collect::<RigResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            program_id,
            weekday,
            time,
            program: Program::new(circuits),
        })
    }

    pub fn program_id(&self) -> u8 {
        self.program_id
    }

    pub fn weekday(&self) -> Weekday {
        self.weekday
    }

    pub fn time(&self) -> TimeOfDay {
        self.time
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// True iff `now` falls on the trigger's weekday and minute. Seconds are
    /// ignored.
    pub fn check_schedule(&self, now: PrimitiveDateTime) -> bool {
        Weekday::from(now.weekday()) == self.weekday
            && now.hour() == self.time.hour()
            && now.minute() == self.time.minute()
    }

    pub async fn scheduled_execute(
        &self,
        bus: &mut AddressBus,
        stop: &StopFlag,
        telemetry: &Telemetry,
    ) -> Outcome {
        info!(
            program = self.program_id,
            day = %self.weekday,
            time = %self.time,
            circuits = self.program.circuits().len(),
            "program started"
        );
        telemetry.emit(WateringEvent::ActivatedPrograms {
            program: self.program_id,
            activated: true,
        });

        let outcome = self.program.execute(bus, stop, telemetry).await;

        telemetry.emit(WateringEvent::ActivatedPrograms {
            program: self.program_id,
            activated: false,
        });
        info!(program = self.program_id, ?outcome, "program finished");
        outcome
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::tests::TestBus;
    use time::macros::datetime;
    use tokio::sync::broadcast::Receiver;
    use tokio::time::Instant;

    fn cid(id: u8) -> CircuitId {
        CircuitId::new(i64::from(id), 12).unwrap()
    }

    fn drain(rx: &mut Receiver<WateringEvent>) -> Vec<WateringEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn on(circuit: u8, minutes: u32) -> WateringEvent {
        WateringEvent::ActivatedCircuits {
            circuit,
            activated: true,
            minutes,
        }
    }

    fn off(circuit: u8) -> WateringEvent {
        WateringEvent::ActivatedCircuits {
            circuit,
            activated: false,
            minutes: 0,
        }
    }

    // -- Execution ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn runs_circuits_in_configured_order() {
        let (lines, mut bus) = TestBus::new();
        let telemetry = Telemetry::new();
        let mut rx = telemetry.subscribe();
        let program = Program::new(vec![(cid(7), 2), (cid(3), 1)]);

        let start = Instant::now();
        let outcome = program.execute(&mut bus, &StopFlag::default(), &telemetry).await;

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(start.elapsed(), Duration::from_secs(180));
        assert_eq!(
            drain(&mut rx),
            vec![on(7, 2), on(7, 1), off(7), on(3, 1), off(3)]
        );
        assert_eq!(lines.levels(), [false; 5]);
        assert!(!program.is_activated());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_minutes_activates_then_deactivates() {
        let (lines, mut bus) = TestBus::new();
        let telemetry = Telemetry::new();
        let mut rx = telemetry.subscribe();

        let start = Instant::now();
        Program::single(cid(2), 0)
            .execute(&mut bus, &StopFlag::default(), &telemetry)
            .await;

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(*lines.any.writes.lock().unwrap(), vec![true, false]);
        assert_eq!(drain(&mut rx), vec![off(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_within_a_tick_and_skips_the_rest() {
        let (lines, mut bus) = TestBus::new();
        let telemetry = Telemetry::new();
        let mut rx = telemetry.subscribe();
        let stop = StopFlag::default();
        let program = Program::new(vec![(cid(1), 5), (cid(2), 5)]);

        let start = Instant::now();
        let stopper = {
            let stop = stop.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(90_500)).await;
                stop.request_stop();
            }
        };
        let (outcome, ()) = tokio::join!(program.execute(&mut bus, &stop, &telemetry), stopper);

        assert_eq!(outcome, Outcome::Stopped);
        assert!(start.elapsed() <= Duration::from_secs(92));
        assert_eq!(drain(&mut rx), vec![on(1, 5), on(1, 4), off(1)]);
        assert_eq!(lines.levels(), [false; 5]);
        // Circuit 2 was never addressed.
        assert_eq!(*lines.any.writes.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn preset_stop_skips_everything() {
        let (lines, mut bus) = TestBus::new();
        let stop = StopFlag::default();
        stop.request_stop();

        let outcome = Program::single(cid(4), 3)
            .execute(&mut bus, &stop, &Telemetry::new())
            .await;

        assert_eq!(outcome, Outcome::Stopped);
        assert!(lines.any.writes.lock().unwrap().is_empty());
    }

    // -- Schedule matching ----------------------------------------------------

    fn scheduled(day: Weekday, time: &str) -> ScheduledProgram {
        ScheduledProgram::from_config(
            1,
            day,
            time.parse().unwrap(),
            &WateringConfig::default(),
            &WateringSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn check_schedule_exact_minute() {
        // 2024-01-01 is a Monday.
        let p = scheduled(Weekday::Monday, "06:00");
        assert!(p.check_schedule(datetime!(2024-01-01 06:00)));
        assert!(p.check_schedule(datetime!(2024-01-01 06:00:59)));
        assert!(!p.check_schedule(datetime!(2024-01-01 06:01)));
        assert!(!p.check_schedule(datetime!(2024-01-01 05:59)));
        assert!(!p.check_schedule(datetime!(2024-01-02 06:00)));
    }

    #[test]
    fn check_schedule_midnight_rollover() {
        let late = scheduled(Weekday::Monday, "23:59");
        let early = scheduled(Weekday::Tuesday, "00:00");

        assert!(late.check_schedule(datetime!(2024-01-01 23:59)));
        assert!(!late.check_schedule(datetime!(2024-01-02 00:00)));
        assert!(early.check_schedule(datetime!(2024-01-02 00:00)));
        assert!(!early.check_schedule(datetime!(2024-01-01 23:59)));
        assert!(!early.check_schedule(datetime!(2024-01-01 00:00)));
    }

    #[test]
    fn sunday_code_is_d() {
        let p = scheduled(Weekday::Sunday, "12:30");
        assert!(p.check_schedule(datetime!(2024-01-07 12:30)));
    }

    // -- Construction ---------------------------------------------------------

    #[test]
    fn from_config_keeps_only_activated_circuits() {
        let json = r#"{"1": {"selected": true,
            "circuits": {"3": {"activated": true, "time": 5}, "4": {"activated": false, "time": 9}},
            "days": {"L": true},
            "starts": {"1": {"activated": true, "hour": "06:00"}}}}"#;
        let limits = WateringSettings::default();
        let config = WateringConfig::from_json(json, &limits).unwrap();

        let p = ScheduledProgram::from_config(
            1,
            Weekday::Monday,
            "06:00".parse().unwrap(),
            &config,
            &limits,
        )
        .unwrap();

        assert_eq!(p.program_id(), 1);
        assert_eq!(p.program().circuits(), &[(cid(3), 5)]);
    }

    #[test]
    fn from_config_rejects_program_id() {
        let limits = WateringSettings::default();
        for id in [0, 4, -1] {
            let err = ScheduledProgram::from_config(
                id,
                Weekday::Monday,
                TimeOfDay::MIDNIGHT,
                &WateringConfig::default(),
                &limits,
            )
            .unwrap_err();
            assert_eq!(err, RigError::InvalidProgramId { id, max: 3 });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_execute_wraps_with_program_events() {
        let (_lines, mut bus) = TestBus::new();
        let telemetry = Telemetry::new();
        let mut rx = telemetry.subscribe();

        scheduled(Weekday::Monday, "06:00")
            .scheduled_execute(&mut bus, &StopFlag::default(), &telemetry)
            .await;

        assert_eq!(
            drain(&mut rx),
            vec![
                WateringEvent::ActivatedPrograms {
                    program: 1,
                    activated: true
                },
                WateringEvent::ActivatedPrograms {
                    program: 1,
                    activated: false
                },
            ]
        );
    }
}
