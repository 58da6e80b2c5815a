//! Hub configuration: an optional TOML file, environment overrides on top,
//! then validation that reports every problem at once.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use time::UtcOffset;

use crate::clock::parse_utc_offset;
use crate::scheduler::DEFAULT_POLL_INTERVAL;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub topics: Topics,
    pub web: WebConfig,
    pub db_url: String,
    pub scheduler: SchedulerConfig,
    /// Fixed offset such as "+07:00". When absent the host's local offset
    /// is used.
    pub utc_offset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topics {
    /// Inbound sensor payloads (subscribed).
    pub sensor: String,
    /// Outbound "ON"/"OFF" pump commands.
    pub pump: String,
    /// Outbound "HH:MM" schedule announcements.
    pub schedule: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_sec: u64,
    /// How long the pump stays on for a scheduled watering.
    pub duration_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            topics: Topics::default(),
            web: WebConfig::default(),
            db_url: "sqlite:data.db?mode=rwc".to_string(),
            scheduler: SchedulerConfig::default(),
            utc_offset: None,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: 1883,
            client_id: "irrigation-hub".to_string(),
            keep_alive_sec: 60,
        }
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            sensor: "irigasi/sensor".to_string(),
            pump: "irigasi/pompa".to_string(),
            schedule: "irigasi/jadwal".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: DEFAULT_POLL_INTERVAL.as_secs(),
            duration_sec: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply environment overrides. `lookup` is `std::env::var` in
    /// production; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_env("MQTT_PORT", &v)?;
        }
        if let Some(v) = lookup("MQTT_CLIENT_ID") {
            self.mqtt.client_id = v;
        }
        // PORT is what most hosting platforms set; WEB_PORT wins if both are.
        if let Some(v) = lookup("PORT") {
            self.web.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = lookup("WEB_PORT") {
            self.web.port = parse_env("WEB_PORT", &v)?;
        }
        if let Some(v) = lookup("DB_URL") {
            self.db_url = v;
        }
        if let Some(v) = lookup("UTC_OFFSET") {
            self.utc_offset = Some(v);
        }
        if let Some(v) = lookup("POLL_INTERVAL_SEC") {
            self.scheduler.poll_interval_sec = parse_env("POLL_INTERVAL_SEC", &v)?;
        }
        if let Some(v) = lookup("WATERING_DURATION_SEC") {
            self.scheduler.duration_sec = parse_env("WATERING_DURATION_SEC", &v)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_sec)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_sec)
    }

    /// The configured fixed offset, if any. Only meaningful after
    /// `validate` has passed.
    pub fn fixed_offset(&self) -> Option<UtcOffset> {
        self.utc_offset
            .as_deref()
            .and_then(|s| parse_utc_offset(s).ok())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{name}='{value}' is invalid: {e}"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_runtime(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if self.mqtt.keep_alive_sec < 5 {
            errors.push(format!(
                "mqtt.keep_alive_sec must be at least 5, got {}",
                self.mqtt.keep_alive_sec
            ));
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let named = [
            ("sensor", &self.topics.sensor),
            ("pump", &self.topics.pump),
            ("schedule", &self.topics.schedule),
        ];

        let mut seen: HashSet<&str> = HashSet::new();
        for (name, topic) in named {
            if topic.trim().is_empty() {
                errors.push(format!("topics.{name} is empty"));
                continue;
            }
            if topic.contains(|c: char| c == '+' || c == '#') {
                errors.push(format!(
                    "topics.{name} '{topic}' must not contain MQTT wildcards"
                ));
            }
            if !seen.insert(topic.as_str()) {
                errors.push(format!(
                    "topics.{name} '{topic}' is already used by another topic"
                ));
            }
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }
        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }

        let poll = self.scheduler.poll_interval_sec;
        if !(1..60).contains(&poll) {
            errors.push(format!(
                "scheduler.poll_interval_sec {poll} out of range [1, 59] \
                 (must be under a minute or trigger minutes can be missed)"
            ));
        }

        if let Some(offset) = &self.utc_offset {
            if parse_utc_offset(offset).is_err() {
                errors.push(format!(
                    "utc_offset '{offset}' is not a valid offset (expected e.g. +07:00)"
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate a TOML config string with environment overrides.
pub fn from_toml_str<F>(contents: &str, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.apply_env(lookup)?;
    config.validate()?;
    Ok(config)
}

/// Read the TOML file at `path` if it exists (defaults otherwise), apply
/// process environment overrides, and validate.
pub fn load(path: &str) -> Result<Config> {
    let contents = if Path::new(path).exists() {
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        String::new()
    };

    let config = from_toml_str(&contents, |k| std::env::var(k).ok())
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        broker = %config.mqtt.host,
        port = config.mqtt.port,
        web_port = config.web.port,
        poll_sec = config.scheduler.poll_interval_sec,
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
