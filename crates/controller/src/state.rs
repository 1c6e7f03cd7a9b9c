use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;

use crate::governor::{Reading, ValveState};
use crate::telemetry::{Telemetry, WateringEvent};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub circuits: BTreeMap<u8, CircuitState>,
    pub programs: BTreeMap<u8, bool>,
    pub last_reading: Option<Reading>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Default, Serialize)]
pub struct CircuitState {
    pub on: bool,
    pub minutes_left: u32,
    /// Unix seconds.
    pub last_changed: Option<i64>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: i64,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Watering,
    Valve,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub watering: bool,
    pub stop_requested: bool,
    /// The program or manual run currently watering.
    pub running: Option<String>,
    pub valve: Option<ValveState>,
    pub flow: Option<f64>,
    pub continuous_minutes: Option<f64>,
    pub circuits: BTreeMap<u8, CircuitState>,
    pub programs: BTreeMap<u8, bool>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl SystemState {
    pub fn new(n_circuits: u8) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            circuits: (1..=n_circuits)
                .map(|id| (id, CircuitState::default()))
                .collect(),
            programs: BTreeMap::new(),
            last_reading: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Fold a telemetry event into the snapshot.
    pub fn record_event(&mut self, event: &WateringEvent) {
        match *event {
            WateringEvent::ActivatedCircuits {
                circuit,
                activated,
                minutes,
            } => {
                let entry = self.circuits.entry(circuit).or_default();
                let changed = entry.on != activated;
                entry.on = activated;
                entry.minutes_left = minutes;
                if changed {
                    entry.last_changed = Some(now_ts());
                    let verb = if activated { "on" } else { "off" };
                    self.push_event(EventKind::Watering, format!("circuit {circuit} {verb}"));
                }
            }
            WateringEvent::ActivatedPrograms { program, activated } => {
                self.programs.insert(program, activated);
                let verb = if activated { "started" } else { "finished" };
                self.push_event(EventKind::Watering, format!("program {program} {verb}"));
            }
            WateringEvent::StopWatering => {
                self.push_event(EventKind::Watering, "stop requested".to_string());
            }
        }
    }

    /// Record a governor reading. Only valve changes reach the event log.
    pub fn record_flow(&mut self, reading: Reading) {
        let previous = self.last_reading.map(|r| r.valve);
        self.last_reading = Some(reading);
        if previous != Some(reading.valve) {
            self.push_event(
                EventKind::Valve,
                format!("main valve {:?} (flow {:.2} L/min)", reading.valve, reading.flow),
            );
        }
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot. The live flags come from
    /// the arbiter.
    pub fn to_status(
        &self,
        watering: bool,
        stop_requested: bool,
        running: Option<String>,
    ) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            watering,
            stop_requested,
            running,
            valve: self.last_reading.map(|r| r.valve),
            flow: self.last_reading.map(|r| r.flow),
            continuous_minutes: self.last_reading.map(|r| r.continuous_minutes),
            circuits: self.circuits.clone(),
            programs: self.programs.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: now_ts(),
            kind,
            detail,
        });
    }
}

// ---------------------------------------------------------------------------
// Telemetry recorder
// ---------------------------------------------------------------------------

/// Mirror telemetry into the shared state until the channel closes.
pub async fn record(shared: SharedState, telemetry: Telemetry) {
    let mut rx = telemetry.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => shared.write().await.record_event(&event),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "status recorder lagged behind telemetry");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(valve: ValveState, flow: f64) -> Reading {
        Reading {
            flow,
            continuous_minutes: 0.0,
            watering: false,
            electricity: true,
            valve,
        }
    }

    #[test]
    fn new_state_lists_every_circuit_off() {
        let s = SystemState::new(12);
        assert_eq!(s.circuits.len(), 12);
        assert!(s.circuits.values().all(|c| !c.on));
    }

    #[test]
    fn circuit_events_update_state_and_log_transitions() {
        let mut s = SystemState::new(12);
        for minutes in [3, 2, 1] {
            s.record_event(&WateringEvent::ActivatedCircuits {
                circuit: 4,
                activated: true,
                minutes,
            });
        }
        assert!(s.circuits[&4].on);
        assert_eq!(s.circuits[&4].minutes_left, 1);
        assert_eq!(s.events.len(), 1);

        s.record_event(&WateringEvent::ActivatedCircuits {
            circuit: 4,
            activated: false,
            minutes: 0,
        });
        assert!(!s.circuits[&4].on);
        assert_eq!(s.events.back().unwrap().detail, "circuit 4 off");
    }

    #[test]
    fn flow_readings_log_only_valve_changes() {
        let mut s = SystemState::new(1);
        s.record_flow(reading(ValveState::Open, 1.0));
        s.record_flow(reading(ValveState::Open, 2.0));
        s.record_flow(reading(ValveState::Closed, 0.0));
        assert_eq!(s.events.len(), 2);
        assert_eq!(s.last_reading.unwrap().valve, ValveState::Closed);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let mut s = SystemState::new(1);
        for i in 0..(MAX_EVENTS + 25) {
            s.record_system(format!("event {i}"));
        }
        assert_eq!(s.events.len(), MAX_EVENTS);
        assert_eq!(s.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut s = SystemState::new(1);
        s.record_system("first".into());
        s.record_error("second".into());
        let status = s.to_status(true, false, Some("program 1".into()));
        assert!(status.watering);
        assert_eq!(status.running.as_deref(), Some("program 1"));
        assert_eq!(status.events[0].detail, "second");
        assert_eq!(status.events[0].kind, EventKind::Error);
        assert!(status.valve.is_none());
    }

    #[tokio::test]
    async fn recorder_mirrors_telemetry() {
        let shared: SharedState = Arc::new(RwLock::new(SystemState::new(12)));
        let telemetry = Telemetry::new();
        let task = tokio::spawn(record(shared.clone(), telemetry.clone()));
        tokio::task::yield_now().await;

        telemetry.emit(WateringEvent::ActivatedPrograms {
            program: 2,
            activated: true,
        });
        for _ in 0..10 {
            if shared.read().await.programs.get(&2) == Some(&true) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(shared.read().await.programs.get(&2), Some(&true));
        task.abort();
    }
}
