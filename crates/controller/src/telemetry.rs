//! Fire-and-forget watering events for the presentation layer.

use serde::Serialize;
use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WateringEvent {
    /// `minutes` is the time remaining while active, 0 once deactivated.
    ActivatedCircuits {
        circuit: u8,
        activated: bool,
        minutes: u32,
    },
    ActivatedPrograms {
        program: u8,
        activated: bool,
    },
    StopWatering,
}

impl WateringEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ActivatedCircuits { .. } => "activated-circuits",
            Self::ActivatedPrograms { .. } => "activated-programs",
            Self::StopWatering => "stop-watering",
        }
    }
}

#[derive(Clone)]
pub struct Telemetry {
    tx: broadcast::Sender<WateringEvent>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit without waiting for or requiring any listener.
    pub fn emit(&self, event: WateringEvent) {
        tracing::debug!(event = event.name(), ?event, "telemetry");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WateringEvent> {
        self.tx.subscribe()
    }
}
