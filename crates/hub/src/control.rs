//! Caller-facing operations: read the live reading, history and schedule;
//! switch the pump; set the daily trigger time. The HTTP layer in `web` is a
//! thin adapter over this.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::config::Topics;
use crate::db::{Db, LogEntry, HISTORY_LIMIT};
use crate::mqtt::{publish_pump, Publisher};
use crate::state::{
    PumpState, ScheduleConfig, SensorReading, SharedState, StatusResponse, TriggerTime,
};

/// Body of a schedule change: `{"jam": "HH:MM"}`.
#[derive(Debug, Default, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub jam: Option<String>,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScheduleResponse {
    Success { jadwal: String },
    Error,
}

#[derive(Clone)]
pub struct Controller {
    shared: SharedState,
    db: Db,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    topics: Topics,
}

impl Controller {
    pub fn new(
        shared: SharedState,
        db: Db,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        topics: Topics,
    ) -> Self {
        Self {
            shared,
            db,
            publisher,
            clock,
            topics,
        }
    }

    pub async fn current(&self) -> SensorReading {
        self.shared.read().await.reading.clone()
    }

    pub async fn history(&self) -> Vec<LogEntry> {
        self.db.recent(HISTORY_LIMIT).await
    }

    pub async fn schedule(&self) -> ScheduleConfig {
        self.shared.read().await.schedule.clone()
    }

    pub async fn status(&self) -> StatusResponse {
        self.shared.read().await.to_status()
    }

    /// Manual pump control. "on" (any case) switches on; anything else off.
    /// The command is always published, even if the pump is already in
    /// that state.
    pub async fn set_pump(&self, action: &str) -> SensorReading {
        let pump = PumpState::from_action(action);
        info!(action, command = pump.command(), "manual pump command");

        publish_pump(self.publisher.as_ref(), &self.topics.pump, pump);
        let stamp = Timestamp::from_datetime(self.clock.now());
        self.shared.write().await.set_pump_state(pump, stamp)
    }

    /// Set the daily trigger time. A missing, empty or malformed time is
    /// rejected without touching state or publishing anything.
    pub async fn set_schedule(&self, req: ScheduleRequest) -> ScheduleResponse {
        let raw = req.jam.unwrap_or_default();
        let trigger: TriggerTime = match raw.parse() {
            Ok(t) => t,
            Err(e) => {
                warn!(jam = %raw, error = %e, "schedule rejected");
                return ScheduleResponse::Error;
            }
        };

        self.shared.write().await.set_trigger(trigger);

        let jadwal = trigger.to_string();
        if let Err(e) = self.publisher.publish(&self.topics.schedule, jadwal.as_bytes()) {
            error!(error = %e, "schedule announcement dropped");
        }
        info!(jadwal = %jadwal, "schedule updated");

        ScheduleResponse::Success { jadwal }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
