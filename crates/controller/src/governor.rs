//! Supply valve governor.
//!
//! Every sampling period the governor turns the flow sensor pulse count into
//! a flow rate, tracks how long water has been flowing without a break, and
//! decides the main valve from three inputs:
//!
//! ```text
//! watering                                   -> OPEN
//! electricity && continuous < max_continuous -> OPEN
//! otherwise                                  -> CLOSED
//! ```
//!
//! The valve line is written only when the decision differs from its
//! current level, so a manual override holds until the next tick.

use serde::Serialize;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::circuit::WateringFlag;
use crate::db::{Db, FlowSample};
use crate::line::{PulseCounter, SharedLine};
use crate::settings::FlowSettings;
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Valve
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveState {
    Open,
    Closed,
}

impl ValveState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl From<bool> for ValveState {
    fn from(open: bool) -> Self {
        if open {
            Self::Open
        } else {
            Self::Closed
        }
    }
}

/// The main supply valve line. Cloned between the governor and the manual
/// override command.
#[derive(Clone)]
pub struct MainValve {
    line: SharedLine,
}

impl MainValve {
    pub fn new(line: SharedLine) -> Self {
        Self { line }
    }

    pub fn state(&self) -> ValveState {
        ValveState::from(self.line.read())
    }

    pub fn set(&self, state: ValveState) {
        self.line.set(state.is_open());
        info!(valve = ?state, "main valve set");
    }
}

// ---------------------------------------------------------------------------
// Pure rules
// ---------------------------------------------------------------------------

pub fn decide_valve(
    watering: bool,
    electricity: bool,
    continuous_minutes: f64,
    max_continuous_minutes: f64,
) -> ValveState {
    if watering {
        ValveState::Open
    } else if electricity && continuous_minutes < max_continuous_minutes {
        ValveState::Open
    } else {
        ValveState::Closed
    }
}

/// Litres per minute from the pulses counted over one sampling period.
pub fn flow_rate(pulses: u32, flow: &FlowSettings) -> f64 {
    (f64::from(pulses) * flow.sampling_frequency_hz + flow.offset) / flow.divisor
}

/// Minutes of uninterrupted flow.
#[derive(Debug, Default)]
pub struct ContinuousFlow {
    minutes: f64,
}

impl ContinuousFlow {
    pub fn update(&mut self, flow: f64, period: Duration) -> f64 {
        if flow > 0.0 {
            self.minutes += period.as_secs_f64() / 60.0;
        } else {
            self.minutes = 0.0;
        }
        self.minutes
    }
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

/// Result of one tick, for the log and the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub flow: f64,
    pub continuous_minutes: f64,
    pub watering: bool,
    pub electricity: bool,
    pub valve: ValveState,
}

pub struct Governor {
    valve: MainValve,
    electricity: SharedLine,
    pulses: PulseCounter,
    watering: WateringFlag,
    settings: FlowSettings,
    continuous: ContinuousFlow,
}

impl Governor {
    pub fn new(
        valve: MainValve,
        electricity: SharedLine,
        pulses: PulseCounter,
        watering: WateringFlag,
        settings: FlowSettings,
    ) -> Self {
        Self {
            valve,
            electricity,
            pulses,
            watering,
            settings,
            continuous: ContinuousFlow::default(),
        }
    }

    pub fn period(&self) -> Duration {
        self.settings.period()
    }

    pub fn tick(&mut self) -> Reading {
        let flow = flow_rate(self.pulses.take(), &self.settings);
        let continuous_minutes = self.continuous.update(flow, self.period());
        let watering = self.watering.is_active();
        let electricity = self.electricity.read();

        let decision = decide_valve(
            watering,
            electricity,
            continuous_minutes,
            self.settings.max_continuous_minutes,
        );
        if decision != self.valve.state() {
            info!(
                ?decision,
                watering,
                electricity,
                continuous_minutes,
                "main valve decision changed"
            );
            self.valve.set(decision);
        }

        debug!(flow, continuous_minutes, "flow sampled");
        Reading {
            flow,
            continuous_minutes,
            watering,
            electricity,
            valve: decision,
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// A late tick is delayed, never followed by a catch-up burst. A burst tick
/// would read an empty pulse counter and reset the continuous-flow count.
fn sampling_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Run the governor loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(mut governor: Governor, db: Db, shared: SharedState) {
    let period = governor.period();
    let retention_secs = i64::from(governor.settings.retention_hours) * 3600;
    let mut ticker = sampling_ticker(period);
    // The first tick completes immediately; skip it so every sample spans a
    // full period of pulses.
    ticker.tick().await;

    info!(period_sec = period.as_secs_f64(), "governor started");

    loop {
        ticker.tick().await;
        let reading = governor.tick();
        shared.write().await.record_flow(reading);

        let sample = FlowSample {
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            flow: reading.flow,
        };
        if let Err(e) = db.insert_sample(sample, retention_secs).await {
            error!(error = %e, "failed to log flow sample");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::tests::{RecordingLine, TestBus};
    use crate::circuit::Circuit;
    use crate::line::{Line, MockLine};
    use std::sync::Arc;

    const HALF_MINUTE: Duration = Duration::from_secs(30);

    // -- decide_valve -------------------------------------------------------

    #[test]
    fn decision_table() {
        use ValveState::*;
        let cap = 60.0;
        // (watering, electricity, continuous) -> expected
        let cases = [
            (true, true, 0.0, Open),
            (true, false, 0.0, Open),
            (true, true, 120.0, Open),
            (true, false, 120.0, Open),
            (false, true, 0.0, Open),
            (false, true, 59.9, Open),
            (false, true, 60.0, Closed),
            (false, false, 0.0, Closed),
            (false, false, 120.0, Closed),
        ];
        for (watering, electricity, continuous, expected) in cases {
            assert_eq!(
                decide_valve(watering, electricity, continuous, cap),
                expected,
                "watering={watering} electricity={electricity} continuous={continuous}"
            );
        }
    }

    // -- Flow and accumulator -----------------------------------------------

    #[test]
    fn flow_rate_with_defaults() {
        let f = FlowSettings::default();
        assert_eq!(flow_rate(0, &f), 0.0);
        // 225 pulses in 30 s = 7.5 Hz = 1 L/min
        assert!((flow_rate(225, &f) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn flow_rate_with_offset() {
        let f = FlowSettings {
            offset: 3.0,
            divisor: 2.0,
            sampling_frequency_hz: 1.0,
            ..FlowSettings::default()
        };
        assert!((flow_rate(5, &f) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn zero_flow_resets_accumulator() {
        let mut c = ContinuousFlow::default();
        assert_eq!(c.update(1.0, HALF_MINUTE), 0.5);
        assert_eq!(c.update(2.0, HALF_MINUTE), 1.0);
        for _ in 0..3 {
            assert_eq!(c.update(0.0, HALF_MINUTE), 0.0);
        }
        assert_eq!(c.update(1.0, HALF_MINUTE), 0.5);
    }

    #[tokio::test]
    async fn late_ticks_are_delayed_not_burst() {
        let ticker = sampling_ticker(HALF_MINUTE);
        assert_eq!(ticker.missed_tick_behavior(), MissedTickBehavior::Delay);
    }

    // -- Governor tick --------------------------------------------------------

    struct Rig {
        valve: Arc<RecordingLine>,
        electricity: Arc<MockLine>,
        pulses: PulseCounter,
        governor: Governor,
    }

    fn rig(max_continuous_minutes: f64, watering: WateringFlag) -> Rig {
        let valve = Arc::new(RecordingLine::default());
        let electricity = Arc::new(MockLine::new("electricity", true));
        let pulses = PulseCounter::default();
        let settings = FlowSettings {
            max_continuous_minutes,
            ..FlowSettings::default()
        };
        let governor = Governor::new(
            MainValve::new(valve.clone()),
            electricity.clone(),
            pulses.clone(),
            watering,
            settings,
        );
        Rig {
            valve,
            electricity,
            pulses,
            governor,
        }
    }

    #[test]
    fn cap_closes_valve_after_continuous_flow() {
        let mut r = rig(1.0, WateringFlag::default());

        r.pulses.add(100);
        assert_eq!(r.governor.tick().valve, ValveState::Open);
        r.pulses.add(100);
        let reading = r.governor.tick();
        assert_eq!(reading.continuous_minutes, 1.0);
        assert_eq!(reading.valve, ValveState::Closed);

        // Flow stops, accumulator resets, valve reopens.
        assert_eq!(r.governor.tick().valve, ValveState::Open);
        assert_eq!(*r.valve.writes.lock().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn valve_written_only_on_change() {
        let mut r = rig(60.0, WateringFlag::default());
        for _ in 0..5 {
            r.governor.tick();
        }
        assert_eq!(*r.valve.writes.lock().unwrap(), vec![true]);

        r.electricity.set(false);
        r.governor.tick();
        r.governor.tick();
        assert_eq!(*r.valve.writes.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn watering_overrides_missing_power_and_cap() {
        let (_lines, mut bus) = TestBus::new();
        let mut r = rig(0.5, bus.watering_flag());
        r.electricity.set(false);
        Circuit::new(1, 12).unwrap().activate(&mut bus);

        for _ in 0..4 {
            r.pulses.add(50);
            assert_eq!(r.governor.tick().valve, ValveState::Open);
        }
        bus.sweep();
        assert_eq!(r.governor.tick().valve, ValveState::Closed);
    }

    #[test]
    fn manual_override_holds_until_next_tick() {
        let mut r = rig(60.0, WateringFlag::default());
        r.electricity.set(false);
        r.governor.tick();
        let valve = MainValve::new(r.valve.clone());

        valve.set(ValveState::Open);
        assert_eq!(valve.state(), ValveState::Open);
        r.governor.tick();
        assert_eq!(valve.state(), ValveState::Closed);
    }

    // -- Run loop -------------------------------------------------------------

    #[tokio::test]
    async fn run_logs_every_sample() {
        use crate::state::SystemState;
        use tokio::sync::RwLock;

        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let shared = Arc::new(RwLock::new(SystemState::new(12)));

        let mut r = rig(60.0, WateringFlag::default());
        r.governor.settings.sampling_frequency_hz = 1.0;
        let task = tokio::spawn(run(r.governor, db.clone(), shared.clone()));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        task.abort();

        let samples = db.recent_samples(10).await.unwrap();
        assert!(samples.len() >= 2, "got {samples:?}");
        assert_eq!(shared.read().await.last_reading.map(|r| r.flow), Some(0.0));
    }
}
