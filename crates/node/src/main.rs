mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::{env, time::Duration};
use tokio::{signal, time::sleep};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{FieldSim, Sample, Scenario};

const SENSOR_TOPIC: &str = "irigasi/sensor";
const PUMP_TOPIC: &str = "irigasi/pompa";
const SCHEDULE_TOPIC: &str = "irigasi/jadwal";

/// Sensor message as the field controller sends it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SensorPayload {
    moisture_percent: f64,
    soil_temperature: f64,
    #[serde(rename = "suhuUdara")]
    air_temperature: f64,
    #[serde(rename = "kelembapanUdara")]
    air_humidity: f64,
    pump_state: &'static str,
}

impl SensorPayload {
    fn new(s: Sample, pump_on: bool) -> Self {
        Self {
            moisture_percent: s.moisture_percent,
            soil_temperature: s.soil_temperature,
            air_temperature: s.air_temperature,
            air_humidity: s.air_humidity,
            pump_state: if pump_on { "MENYALA 💦" } else { "MATI" },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NodeConfig {
    host: String,
    port: u16,
    node_id: String,
    sample_every: Duration,
    scenario: Scenario,
}

impl NodeConfig {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let sample_every_s = lookup("SAMPLE_EVERY_S")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&s| s > 0)
            .unwrap_or(10);
        Self {
            host: lookup("MQTT_HOST").unwrap_or_else(|| "broker.hivemq.com".to_string()),
            port: lookup("MQTT_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883),
            node_id: lookup("NODE_ID").unwrap_or_else(|| "node-a".to_string()),
            sample_every: Duration::from_secs(sample_every_s),
            scenario: Scenario::from_str_lossy(&lookup("SIM_SCENARIO").unwrap_or_default()),
        }
    }
}

/// What an incoming message asks the node to do.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Pump(bool),
    Schedule(String),
    Ignored,
}

fn parse_command(topic: &str, payload: &[u8]) -> Command {
    let text = String::from_utf8_lossy(payload).trim().to_string();
    match topic {
        PUMP_TOPIC => match text.to_ascii_uppercase().as_str() {
            "ON" => Command::Pump(true),
            "OFF" => Command::Pump(false),
            _ => Command::Ignored,
        },
        SCHEDULE_TOPIC => Command::Schedule(text),
        _ => Command::Ignored,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = NodeConfig::from_lookup(|k| env::var(k).ok());
    info!(
        host = %cfg.host,
        port = cfg.port,
        node_id = %cfg.node_id,
        scenario = %cfg.scenario,
        every_s = cfg.sample_every.as_secs(),
        "field node starting"
    );

    let mut field = FieldSim::new(cfg.scenario);

    let mut mqttoptions = MqttOptions::new(
        format!("irrigation-node-{}", cfg.node_id),
        cfg.host.clone(),
        cfg.port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let mut ticker = tokio::time::interval(cfg.sample_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("stop signal received");
                break;
            }
            _ = ticker.tick() => {
                let payload = SensorPayload::new(field.step(), field.pump_on());
                let bytes = serde_json::to_vec(&payload)?;
                match client.try_publish(SENSOR_TOPIC, QoS::AtMostOnce, false, bytes) {
                    Ok(()) => debug!(moisture = payload.moisture_percent, "reading published"),
                    Err(e) => warn!(error = %e, "reading dropped"),
                }
            }
            ev = eventloop.poll() => match ev {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to mqtt broker");
                    for topic in [PUMP_TOPIC, SCHEDULE_TOPIC] {
                        if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                            error!(topic, error = %e, "subscribe failed");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    match parse_command(&p.topic, &p.payload) {
                        Command::Pump(on) => {
                            info!(on, "pump command");
                            field.set_pump(on);
                        }
                        Command::Schedule(jam) => info!(jam = %jam, "schedule announced"),
                        Command::Ignored => debug!(topic = %p.topic, "message ignored"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, retrying");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "mqtt disconnect failed");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample() -> Sample {
        Sample {
            moisture_percent: 42.5,
            soil_temperature: 26.1,
            air_temperature: 30.4,
            air_humidity: 71.0,
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn payload_uses_field_controller_keys() {
        let json = serde_json::to_value(SensorPayload::new(sample(), false)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "moisturePercent": 42.5,
                "soilTemperature": 26.1,
                "suhuUdara": 30.4,
                "kelembapanUdara": 71.0,
                "pumpState": "MATI",
            })
        );
    }

    #[test]
    fn payload_reports_running_pump() {
        let json = serde_json::to_value(SensorPayload::new(sample(), true)).unwrap();
        assert!(json["pumpState"].as_str().unwrap().starts_with("MENYALA"));
    }

    #[test]
    fn config_defaults() {
        let cfg = NodeConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.host, "broker.hivemq.com");
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.node_id, "node-a");
        assert_eq!(cfg.sample_every, Duration::from_secs(10));
        assert_eq!(cfg.scenario, Scenario::Drying);
    }

    #[test]
    fn config_from_env() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("MQTT_HOST", "10.0.0.2"),
            ("MQTT_PORT", "1884"),
            ("NODE_ID", "kebun-1"),
            ("SAMPLE_EVERY_S", "3"),
            ("SIM_SCENARIO", "wet"),
        ]));
        assert_eq!(cfg.host, "10.0.0.2");
        assert_eq!(cfg.port, 1884);
        assert_eq!(cfg.node_id, "kebun-1");
        assert_eq!(cfg.sample_every, Duration::from_secs(3));
        assert_eq!(cfg.scenario, Scenario::Wet);
    }

    #[test]
    fn config_ignores_bad_numbers() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("MQTT_PORT", "lots"),
            ("SAMPLE_EVERY_S", "0"),
        ]));
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.sample_every, Duration::from_secs(10));
    }

    #[test]
    fn pump_commands() {
        assert_eq!(parse_command(PUMP_TOPIC, b"ON"), Command::Pump(true));
        assert_eq!(parse_command(PUMP_TOPIC, b" off\n"), Command::Pump(false));
        assert_eq!(parse_command(PUMP_TOPIC, b"toggle"), Command::Ignored);
    }

    #[test]
    fn schedule_and_other_topics() {
        assert_eq!(
            parse_command(SCHEDULE_TOPIC, b"07:30"),
            Command::Schedule("07:30".to_string())
        );
        assert_eq!(parse_command(SENSOR_TOPIC, b"{}"), Command::Ignored);
    }
}
