use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::warn;

use crate::clock::Timestamp;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Textual form of an unset trigger time.
pub const TRIGGER_UNSET: &str = "--:--";

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// One lock over the whole record. Writers hold it only for the
/// read-modify-write itself; readers clone a snapshot out.
pub type SharedState = Arc<RwLock<SystemState>>;

pub fn shared(state: SystemState) -> SharedState {
    Arc::new(RwLock::new(state))
}

// ---------------------------------------------------------------------------
// Pump state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PumpState {
    #[default]
    Off,
    On,
}

impl PumpState {
    /// Payload published on the pump command topic.
    pub fn command(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    /// Label used in JSON and in the log table. Dashboards compare against
    /// these strings exactly.
    pub fn label(self) -> &'static str {
        match self {
            Self::On => "MENYALA 💦",
            Self::Off => "MATI",
        }
    }

    /// Lenient action parsing for manual control: "on" in any case turns the
    /// pump on, everything else turns it off.
    pub fn from_action(action: &str) -> Self {
        if action.trim().eq_ignore_ascii_case("on") {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown pump state '{0}'")]
pub struct PumpStateError(String);

impl FromStr for PumpState {
    type Err = PumpStateError;

    /// Parsing for device payloads. The field node reports with an emoji
    /// suffix ("MENYALA 💦", sometimes without the space), so only the
    /// leading alphanumeric part of the first word is significant.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = s
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_ascii_uppercase();
        match word.as_str() {
            "ON" | "MENYALA" | "1" | "TRUE" => Ok(Self::On),
            "OFF" | "MATI" | "0" | "FALSE" => Ok(Self::Off),
            _ => Err(PumpStateError(s.to_string())),
        }
    }
}

impl Serialize for PumpState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for PumpState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Sensor reading
// ---------------------------------------------------------------------------

/// The live projection of the most recent sensor payload plus pump state.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SensorReading {
    #[serde(rename = "moisturePercent")]
    pub moisture_percent: f64,
    #[serde(rename = "soilTemperature")]
    pub soil_temperature: f64,
    #[serde(rename = "suhuUdara")]
    pub air_temperature: f64,
    #[serde(rename = "kelembapanUdara")]
    pub air_humidity: f64,
    #[serde(rename = "pumpState")]
    pub pump_state: PumpState,
    #[serde(flatten)]
    pub stamp: Timestamp,
}

/// A partial reading: only the fields that are present get merged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReadingUpdate {
    #[serde(rename = "moisturePercent")]
    pub moisture_percent: Option<f64>,
    #[serde(rename = "soilTemperature")]
    pub soil_temperature: Option<f64>,
    #[serde(rename = "suhuUdara")]
    pub air_temperature: Option<f64>,
    #[serde(rename = "kelembapanUdara")]
    pub air_humidity: Option<f64>,
    #[serde(rename = "pumpState", default, deserialize_with = "lenient_pump_state")]
    pub pump_state: Option<PumpState>,
}

/// An unrecognised pump state is treated as absent so the rest of the
/// reading still gets applied and logged. Booleans and 0/1 are accepted.
fn lenient_pump_state<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PumpState>, D::Error> {
    let value = Value::deserialize(d)?;
    let pump = match &value {
        Value::Null => return Ok(None),
        Value::String(s) => s.parse().ok(),
        Value::Bool(true) => Some(PumpState::On),
        Value::Bool(false) => Some(PumpState::Off),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(PumpState::On),
            Some(0) => Some(PumpState::Off),
            _ => None,
        },
        _ => None,
    };
    if pump.is_none() {
        warn!(pump_state = %value, "unrecognised pump state ignored");
    }
    Ok(pump)
}

impl SensorReading {
    pub fn merge(&mut self, update: &ReadingUpdate) {
        if let Some(v) = update.moisture_percent {
            self.moisture_percent = v;
        }
        if let Some(v) = update.soil_temperature {
            self.soil_temperature = v;
        }
        if let Some(v) = update.air_temperature {
            self.air_temperature = v;
        }
        if let Some(v) = update.air_humidity {
            self.air_humidity = v;
        }
        if let Some(v) = update.pump_state {
            self.pump_state = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// A 24-hour wall-clock minute, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerTime {
    hour: u8,
    minute: u8,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerTimeError {
    #[error("trigger time is empty")]
    Empty,
    #[error("'{0}' is not a valid HH:MM time")]
    Invalid(String),
}

impl TriggerTime {
    /// True when `now` falls inside this minute.
    pub fn matches(self, now: OffsetDateTime) -> bool {
        now.hour() == self.hour && now.minute() == self.minute
    }
}

impl FromStr for TriggerTime {
    type Err = TriggerTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TriggerTimeError::Empty);
        }
        let t = time::Time::parse(s, format_description!("[hour]:[minute]"))
            .map_err(|_| TriggerTimeError::Invalid(s.to_string()))?;
        Ok(Self {
            hour: t.hour(),
            minute: t.minute(),
        })
    }
}

impl fmt::Display for TriggerTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Daily watering schedule. `trigger == None` means no schedule is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub trigger: Option<TriggerTime>,
    pub duration_secs: u64,
}

impl ScheduleConfig {
    pub fn new(duration_secs: u64) -> Self {
        Self {
            trigger: None,
            duration_secs,
        }
    }
}

#[derive(Serialize)]
struct ScheduleJson<'a> {
    jam: &'a str,
    durasi: u64,
}

impl Serialize for ScheduleConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let jam = self
            .trigger
            .map(|t| t.to_string())
            .unwrap_or_else(|| TRIGGER_UNSET.to_string());
        ScheduleJson {
            jam: &jam,
            durasi: self.duration_secs,
        }
        .serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Pump,
    Schedule,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Core state
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub reading: SensorReading,
    pub schedule: ScheduleConfig,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub reading: SensorReading,
    pub schedule: ScheduleConfig,
    pub events: Vec<SystemEvent>,
}

impl SystemState {
    pub fn new(schedule: ScheduleConfig) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            reading: SensorReading::default(),
            schedule,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Merge a sensor payload into the live reading and return the result.
    pub fn update_reading(&mut self, update: &ReadingUpdate, stamp: Timestamp) -> SensorReading {
        self.reading.merge(update);
        self.reading.stamp = stamp;

        let r = &self.reading;
        let detail = format!(
            "moisture={} soil={} air={} hum={} pump={}",
            r.moisture_percent, r.soil_temperature, r.air_temperature, r.air_humidity, r.pump_state
        );
        self.push_event(EventKind::Reading, detail);

        self.reading.clone()
    }

    pub fn set_pump_state(&mut self, pump: PumpState, stamp: Timestamp) -> SensorReading {
        self.reading.pump_state = pump;
        self.reading.stamp = stamp;
        self.push_event(EventKind::Pump, format!("pump set {}", pump.command()));
        self.reading.clone()
    }

    /// Replace the trigger time. The duration is left as configured.
    pub fn set_trigger(&mut self, trigger: TriggerTime) {
        self.schedule.trigger = Some(trigger);
        self.push_event(EventKind::Schedule, format!("schedule set to {trigger}"));
    }

    pub fn set_mqtt_connected(&mut self, connected: bool) {
        if self.mqtt_connected == connected {
            return;
        }
        self.mqtt_connected = connected;
        let detail = if connected {
            "mqtt connected"
        } else {
            "mqtt disconnected"
        };
        self.push_event(EventKind::System, detail.to_string());
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            reading: self.reading.clone(),
            schedule: self.schedule.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
