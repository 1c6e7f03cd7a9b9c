//! Optional MQTT bridge: republishes every telemetry event, fire-and-forget,
//! so dashboards outside the rig can follow watering activity.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::state::SharedState;
use crate::telemetry::{Telemetry, WateringEvent};

const CLIENT_ID: &str = "irrigation-rig";
const TOPIC_PREFIX: &str = "irrigation";

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "irrigation/<event-name>"
pub(crate) fn event_topic(event: &WateringEvent) -> String {
    format!("{TOPIC_PREFIX}/{}", event.name())
}

pub(crate) fn event_payload(event: &WateringEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Run the bridge until the process exits. Connection errors are retried.
pub async fn run(host: String, port: u16, telemetry: Telemetry, shared: SharedState) {
    let mut options = MqttOptions::new(CLIENT_ID, host.clone(), port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 20);

    info!(%host, port, "mqtt bridge starting");
    tokio::spawn(publish(client, telemetry));

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn publish(client: AsyncClient, telemetry: Telemetry) {
    let mut rx = telemetry.subscribe();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "mqtt bridge lagged behind telemetry");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let topic = event_topic(&event);
        let payload = match event_payload(&event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, topic = %topic, "failed to encode telemetry");
                continue;
            }
        };
        match client.try_publish(topic.as_str(), QoS::AtMostOnce, false, payload) {
            Ok(()) => debug!(topic = %topic, "telemetry published"),
            Err(e) => warn!(error = %e, topic = %topic, "telemetry dropped"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn topics_follow_event_names() {
        assert_eq!(event_topic(&WateringEvent::StopWatering), "irrigation/stop-watering");
        assert_eq!(
            event_topic(&WateringEvent::ActivatedCircuits {
                circuit: 1,
                activated: false,
                minutes: 0
            }),
            "irrigation/activated-circuits"
        );
        assert_eq!(
            event_topic(&WateringEvent::ActivatedPrograms {
                program: 2,
                activated: true
            }),
            "irrigation/activated-programs"
        );
    }

    #[test]
    fn payload_is_tagged_json() {
        let bytes = event_payload(&WateringEvent::ActivatedPrograms {
            program: 2,
            activated: true,
        })
        .unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["event"], "activated-programs");
        assert_eq!(v["program"], 2);
        assert_eq!(v["activated"], true);
    }

    #[test]
    fn stop_payload_has_only_the_tag() {
        let v: Value =
            serde_json::from_slice(&event_payload(&WateringEvent::StopWatering).unwrap()).unwrap();
        assert_eq!(v, serde_json::json!({ "event": "stop-watering" }));
    }

    #[tokio::test]
    async fn publisher_survives_without_broker() {
        // Never polled: publishes queue up, then are dropped once full.
        let opts = MqttOptions::new("test-bridge", "127.0.0.1", 1883);
        let (client, _eventloop) = AsyncClient::new(opts, 2);
        let telemetry = Telemetry::new();
        let task = tokio::spawn(publish(client, telemetry.clone()));
        tokio::task::yield_now().await;

        for _ in 0..5 {
            telemetry.emit(WateringEvent::StopWatering);
        }
        tokio::task::yield_now().await;
        assert!(!task.is_finished());
        task.abort();
    }
}
