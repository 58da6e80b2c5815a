//! Broker plumbing: the publish seam used by the scheduler and API, and the
//! receive loop that turns sensor payloads into state updates and log rows.

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Timestamp};
use crate::db::{Db, NewLogEntry};
use crate::shutdown::Shutdown;
use crate::state::{PumpState, ReadingUpdate, SharedState};

/// Pause after a transport error before polling (and so reconnecting) again.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish to '{topic}' failed: {source}")]
    Client {
        topic: String,
        #[source]
        source: ClientError,
    },
}

/// Fire-and-forget publishing. Implementations must not block the caller;
/// a returned error means the message was dropped.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

impl Publisher for AsyncClient {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|source| PublishError::Client {
                topic: topic.to_string(),
                source,
            })
    }
}

/// Publish a pump command, logging rather than returning failure.
pub fn publish_pump(publisher: &dyn Publisher, topic: &str, pump: PumpState) {
    match publisher.publish(topic, pump.command().as_bytes()) {
        Ok(()) => debug!(topic, command = pump.command(), "pump command published"),
        Err(e) => error!(error = %e, "pump command dropped"),
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Parse a sensor payload. Every field is optional; unknown keys are ignored.
pub(crate) fn parse_reading(payload: &[u8]) -> Result<ReadingUpdate, serde_json::Error> {
    serde_json::from_slice(payload)
}

// ---------------------------------------------------------------------------
// Receive side
// ---------------------------------------------------------------------------

/// Applies inbound sensor payloads to shared state and the log store.
#[derive(Clone)]
pub struct Bridge {
    shared: SharedState,
    db: Db,
    clock: Arc<dyn Clock>,
    sensor_topic: String,
}

impl Bridge {
    pub fn new(shared: SharedState, db: Db, clock: Arc<dyn Clock>, sensor_topic: String) -> Self {
        Self {
            shared,
            db,
            clock,
            sensor_topic,
        }
    }

    /// Drive the MQTT event loop until shutdown is requested or the client
    /// disconnects. The event loop reconnects by itself on the next poll
    /// after an error; all this does on each (re)connect is reinstall the
    /// sensor subscription.
    pub async fn run(
        self,
        client: AsyncClient,
        mut eventloop: EventLoop,
        mut shutdown: Shutdown,
    ) {
        info!(topic = %self.sensor_topic, "mqtt bridge started");

        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    self.shared.write().await.set_mqtt_connected(true);
                    self.subscribe(&client).await;
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.handle_publish(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected by broker");
                    self.shared.write().await.set_mqtt_connected(false);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("mqtt session closed");
                    self.shared.write().await.set_mqtt_connected(false);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt error, reconnecting");
                    {
                        let mut st = self.shared.write().await;
                        st.set_mqtt_connected(false);
                        st.record_error(format!("mqtt error: {e}"));
                    }
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        info!("mqtt bridge stopped");
    }

    async fn subscribe(&self, client: &AsyncClient) {
        // Non-blocking: this task is the one draining the request queue.
        match client.try_subscribe(&self.sensor_topic, QoS::AtMostOnce) {
            Ok(()) => info!(topic = %self.sensor_topic, "subscribed"),
            Err(e) => {
                error!(topic = %self.sensor_topic, error = %e, "subscribe failed");
                self.shared
                    .write()
                    .await
                    .record_error(format!("subscribe failed: {e}"));
            }
        }
    }

    /// Route one inbound message. Only the sensor topic is handled.
    pub async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        if topic != self.sensor_topic {
            debug!(topic, "ignoring message on unexpected topic");
            return;
        }

        let update = match parse_reading(payload) {
            Ok(u) => u,
            Err(e) => {
                warn!(topic, error = %e, "bad sensor json, dropped");
                self.shared
                    .write()
                    .await
                    .record_error(format!("bad sensor json: {e}"));
                return;
            }
        };

        let stamp = Timestamp::from_datetime(self.clock.now());
        let merged = self.shared.write().await.update_reading(&update, stamp);
        debug!(
            moisture = merged.moisture_percent,
            pump = %merged.pump_state,
            "reading merged"
        );

        // Best-effort: a failed append never stops ingestion.
        if let Err(e) = self.db.append(&NewLogEntry::from_reading(&merged)).await {
            error!(error = %e, "failed to log reading");
            self.shared.write().await.record_error(e.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Test publisher
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
