use anyhow::Result;
use chrono::{DateTime, FixedOffset};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::engine::EngineState;

/// Requests arriving on the control topics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    SetActive(bool),
    Refresh,
}

/// Everything display consumers need, published once per tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub status: String,
    pub mode: String,
    pub is_active: bool,
    pub session_kwh: f64,
    pub current_price: f64,
    pub peak_price: f64,
    pub peak_time: Option<DateTime<FixedOffset>>,
    pub next_charge_time: Option<DateTime<FixedOffset>>,
    /// Start of every planned charging slot
    pub charge_slots: Vec<DateTime<FixedOffset>>,
    pub slots_info: String,
    pub track_cost: f64,
    pub track_saved: f64,
    pub track_discharge: f64,
    pub track_pv: f64,
    pub track_kwh: f64,
}

impl StateSnapshot {
    pub fn capture(state: &EngineState, status: &str) -> Self {
        Self {
            status: status.to_string(),
            mode: state.recommendation_mode.to_string(),
            is_active: state.is_active,
            session_kwh: state.charging_session_net_charged_kwh,
            current_price: state.current_price,
            peak_price: state.peak_price,
            peak_time: state.peak_time.map(|t| t.fixed_offset()),
            next_charge_time: state.next_charge_time.map(|t| t.fixed_offset()),
            charge_slots: state
                .slot_plan
                .as_ref()
                .map(|plan| plan.slots.iter().map(|s| s.start.fixed_offset()).collect())
                .unwrap_or_default(),
            slots_info: state.slots_info.clone(),
            track_cost: state.trackers.cost_total,
            track_saved: state.trackers.savings_total,
            track_discharge: state.trackers.discharge_savings,
            track_pv: state.trackers.pv_savings,
            track_kwh: state.trackers.charged_kwh,
        }
    }
}

fn active_topic(base: &str) -> String {
    format!("{}/active/set", base)
}

fn refresh_topic(base: &str) -> String {
    format!("{}/refresh", base)
}

/// Map a control message to a command, `None` for unrelated topics or garbage
pub fn parse_control_message(base_topic: &str, topic: &str, payload: &str) -> Option<ControlCommand> {
    if topic == refresh_topic(base_topic) {
        return Some(ControlCommand::Refresh);
    }
    if topic != active_topic(base_topic) {
        return None;
    }

    let payload = payload.trim();
    match payload.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => return Some(ControlCommand::SetActive(true)),
        "off" | "false" | "0" => return Some(ControlCommand::SetActive(false)),
        _ => {}
    }

    // Some systems send {"value": true}
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|json| json.get("value").and_then(|v| v.as_bool()))
        .map(ControlCommand::SetActive)
}

pub struct MqttClient {
    client: AsyncClient,
    config: MqttConfig,
}

impl MqttClient {
    pub async fn new(config: MqttConfig, control_tx: mpsc::Sender<ControlCommand>) -> Result<Self> {
        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);

        mqtt_options.set_keep_alive(Duration::from_secs(30));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        let base_topic = config.base_topic.clone();

        // Spawn event loop handler
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(payload) = std::str::from_utf8(&publish.payload) else {
                            warn!("Ignoring non UTF-8 payload on {}", publish.topic);
                            continue;
                        };
                        match parse_control_message(&base_topic, &publish.topic, payload) {
                            Some(command) => {
                                debug!("Control command on {}: {:?}", publish.topic, command);
                                if control_tx.send(command).await.is_err() {
                                    // Receiver gone: the main loop has shut down
                                    break;
                                }
                            }
                            None => warn!(
                                "Ignoring unrecognized payload '{}' on {}",
                                payload, publish.topic
                            ),
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        debug!("Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        for topic in [active_topic(&config.base_topic), refresh_topic(&config.base_topic)] {
            client.subscribe(&topic, QoS::AtLeastOnce).await?;
            info!("Subscribed to control topic: {}", topic);
        }

        Ok(Self { client, config })
    }

    pub async fn publish_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        let topic = format!("{}/state", self.config.base_topic);
        let payload = serde_json::to_string(snapshot)?;

        self.client
            .publish(
                &topic,
                QoS::AtLeastOnce,
                true, // Retain so new subscribers get the last state
                payload,
            )
            .await?;

        debug!("Published state: {} ({})", snapshot.status, snapshot.mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InverterMode;

    const BASE: &str = "smart_price_charge";

    #[test]
    fn test_parse_active_payloads() {
        let topic = "smart_price_charge/active/set";
        for on in ["ON", "on", "true", "1", " On \n"] {
            assert_eq!(
                parse_control_message(BASE, topic, on),
                Some(ControlCommand::SetActive(true))
            );
        }
        for off in ["OFF", "false", "0"] {
            assert_eq!(
                parse_control_message(BASE, topic, off),
                Some(ControlCommand::SetActive(false))
            );
        }
        assert_eq!(
            parse_control_message(BASE, topic, r#"{"value": false}"#),
            Some(ControlCommand::SetActive(false))
        );
        assert_eq!(parse_control_message(BASE, topic, "maybe"), None);
        assert_eq!(parse_control_message(BASE, topic, r#"{"value": "yes"}"#), None);
    }

    #[test]
    fn test_parse_refresh_and_foreign_topics() {
        assert_eq!(
            parse_control_message(BASE, "smart_price_charge/refresh", ""),
            Some(ControlCommand::Refresh)
        );
        assert_eq!(parse_control_message(BASE, "other/active/set", "ON"), None);
    }

    #[test]
    fn test_snapshot_from_state() {
        let mut state = EngineState::default();
        state.recommendation_mode = InverterMode::EcoCharge;
        state.charging_session_net_charged_kwh = 1.5;
        state.trackers.charged_kwh = 12.0;
        state.trackers.cost_total = 1.2;

        let snapshot = StateSnapshot::capture(&state, "Laden bis 100% (0.100€)");
        assert_eq!(snapshot.mode, "eco_charge");
        assert_eq!(snapshot.session_kwh, 1.5);
        assert_eq!(snapshot.track_kwh, 12.0);
        assert_eq!(snapshot.slots_info, "Keine Slots");
        assert!(snapshot.charge_slots.is_empty());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "Laden bis 100% (0.100€)");
        assert_eq!(json["track_cost"], 1.2);
        assert!(json["peak_time"].is_null());
    }
}
