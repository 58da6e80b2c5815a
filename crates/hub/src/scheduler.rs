//! Daily watering scheduler: polls the wall-clock and, when the configured
//! trigger minute comes round, runs one timed pump-on / pump-off episode by
//! publishing pump commands.
//!
//! ```text
//! Idle ──[trigger minute reached, not yet fired]──▶ Watering
//!  ▲                                                   │
//!  └──────────[duration elapsed / shutdown]────────────┘
//! ```
//!
//! Only one episode can be in flight: the loop does not poll while watering.

use std::sync::Arc;
use std::time::Duration;

use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::clock::{Clock, Timestamp};
use crate::mqtt::{publish_pump, Publisher};
use crate::shutdown::Shutdown;
use crate::state::{PumpState, SharedState};

/// Default poll period. Trigger matching is per minute, so this must stay
/// under 60 s or a trigger minute can be skipped entirely.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// A calendar minute; the "already fired" guard compares these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MinuteKey {
    date: Date,
    hour: u8,
    minute: u8,
}

impl MinuteKey {
    fn of(now: OffsetDateTime) -> Self {
        Self {
            date: now.date(),
            hour: now.hour(),
            minute: now.minute(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to do this poll.
    Idle,
    /// A full episode ran (pump on, waited, pump off).
    Watered,
    /// An episode started but the wait was cut short by shutdown. The pump
    /// was still switched off.
    Interrupted,
}

pub struct Scheduler {
    shared: SharedState,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    pump_topic: String,
    poll_interval: Duration,
    last_fired: Option<MinuteKey>,
}

impl Scheduler {
    pub fn new(
        shared: SharedState,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        pump_topic: String,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shared,
            publisher,
            clock,
            pump_topic,
            poll_interval,
            last_fired: None,
        }
    }

    /// Run the scheduler loop until shutdown. Intended to be `tokio::spawn`-ed
    /// from main.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(poll_sec = self.poll_interval.as_secs(), "scheduler started");
        self.shared
            .write()
            .await
            .record_system("scheduler started".to_string());

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            if self.tick(&mut shutdown).await == TickOutcome::Interrupted {
                break;
            }
        }

        info!("scheduler stopped");
    }

    /// One poll: fire an episode if the trigger minute has come and this
    /// minute has not fired yet.
    pub async fn tick(&mut self, shutdown: &mut Shutdown) -> TickOutcome {
        let now = self.clock.now();
        let key = MinuteKey::of(now);

        // Copy out and release the lock before any publish or wait.
        let schedule = self.shared.read().await.schedule.clone();

        let Some(trigger) = schedule.trigger else {
            return TickOutcome::Idle;
        };
        if !trigger.matches(now) || self.last_fired == Some(key) {
            return TickOutcome::Idle;
        }

        info!(
            trigger = %trigger,
            duration_sec = schedule.duration_secs,
            "scheduled watering started"
        );
        let outcome = self
            .water(Duration::from_secs(schedule.duration_secs), shutdown)
            .await;
        self.last_fired = Some(key);
        outcome
    }

    async fn water(&self, duration: Duration, shutdown: &mut Shutdown) -> TickOutcome {
        self.switch(PumpState::On).await;

        let interrupted = if duration.is_zero() {
            false
        } else {
            tokio::select! {
                _ = shutdown.recv() => true,
                _ = tokio::time::sleep(duration) => false,
            }
        };

        if interrupted {
            warn!("shutdown during scheduled watering, switching pump off early");
        }
        self.switch(PumpState::Off).await;

        if interrupted {
            TickOutcome::Interrupted
        } else {
            info!("scheduled watering finished");
            TickOutcome::Watered
        }
    }

    async fn switch(&self, pump: PumpState) {
        publish_pump(self.publisher.as_ref(), &self.pump_topic, pump);
        let stamp = Timestamp::from_datetime(self.clock.now());
        self.shared.write().await.set_pump_state(pump, stamp);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::mqtt::testing::RecordingPublisher;
    use crate::shutdown;
    use crate::state::{shared, ScheduleConfig, SystemState};
    use time::macros::datetime;

    const PUMP: &str = "irigasi/pompa";

    struct Harness {
        scheduler: Scheduler,
        shared: SharedState,
        publisher: Arc<RecordingPublisher>,
        clock: Arc<ManualClock>,
    }

    fn harness(trigger: Option<&str>, duration_secs: u64) -> Harness {
        let mut schedule = ScheduleConfig::new(duration_secs);
        schedule.trigger = trigger.map(|t| t.parse().unwrap());
        let shared = shared(SystemState::new(schedule));
        let publisher = Arc::new(RecordingPublisher::default());
        let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 06:59:40 UTC)));
        let scheduler = Scheduler::new(
            Arc::clone(&shared),
            publisher.clone(),
            clock.clone(),
            PUMP.to_string(),
            DEFAULT_POLL_INTERVAL,
        );
        Harness {
            scheduler,
            shared,
            publisher,
            clock,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unset_schedule_never_fires() {
        let mut h = harness(None, 5);
        let (_trigger, mut sd) = shutdown::channel();
        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Idle);
        assert!(h.publisher.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn before_trigger_minute_stays_idle() {
        let mut h = harness(Some("07:00"), 5);
        let (_trigger, mut sd) = shutdown::channel();
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Idle);
        assert!(h.publisher.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_minute_fires_exactly_once() {
        let mut h = harness(Some("07:00"), 5);
        let (_trigger, mut sd) = shutdown::channel();

        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));
        let started = tokio::time::Instant::now();
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Watered);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(h.publisher.payloads(PUMP), vec!["ON", "OFF"]);
        assert_eq!(h.shared.read().await.reading.pump_state, PumpState::Off);

        // A later poll inside the same minute must not retrigger.
        h.clock.set(datetime!(2024-06-01 07:00:25 UTC));
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Idle);
        assert_eq!(h.publisher.payloads(PUMP).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_is_on_during_episode() {
        let h = harness(Some("07:00"), 30);
        let mut scheduler = h.scheduler;
        let (_trigger, mut sd) = shutdown::channel();
        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));

        let task = tokio::spawn(async move { scheduler.tick(&mut sd).await });
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.shared.read().await.reading.pump_state, PumpState::On);
        assert_eq!(h.publisher.payloads(PUMP), vec!["ON"]);

        assert_eq!(task.await.unwrap(), TickOutcome::Watered);
        assert_eq!(h.shared.read().await.reading.pump_state, PumpState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn state_lock_is_free_while_watering() {
        let h = harness(Some("07:00"), 30);
        let mut scheduler = h.scheduler;
        let (_trigger, mut sd) = shutdown::channel();
        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));

        let task = tokio::spawn(async move { scheduler.tick(&mut sd).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.shared.try_write().is_ok());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_switches_off_immediately() {
        let mut h = harness(Some("07:00"), 0);
        let (_trigger, mut sd) = shutdown::channel();
        h.clock.set(datetime!(2024-06-01 07:00:10 UTC));

        let started = tokio::time::Instant::now();
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Watered);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(h.publisher.payloads(PUMP), vec!["ON", "OFF"]);
        assert_eq!(h.shared.read().await.reading.pump_state, PumpState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_again_next_day() {
        let mut h = harness(Some("07:00"), 1);
        let (_trigger, mut sd) = shutdown::channel();

        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Watered);

        h.clock.set(datetime!(2024-06-02 07:00:05 UTC));
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Watered);
        assert_eq!(h.publisher.payloads(PUMP), vec!["ON", "OFF", "ON", "OFF"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_while_idle_fires_at_new_minute() {
        let mut h = harness(Some("07:00"), 1);
        let (_trigger, mut sd) = shutdown::channel();

        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Watered);

        h.shared.write().await.set_trigger("07:02".parse().unwrap());

        h.clock.set(datetime!(2024-06-01 07:01:00 UTC));
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Idle);

        h.clock.set(datetime!(2024-06-01 07:02:00 UTC));
        assert_eq!(h.scheduler.tick(&mut sd).await, TickOutcome::Watered);
        assert_eq!(h.publisher.payloads(PUMP).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_still_tracks_state() {
        let mut schedule = ScheduleConfig::new(2);
        schedule.trigger = Some("07:00".parse().unwrap());
        let shared = shared(SystemState::new(schedule));
        let clock = Arc::new(ManualClock::new(datetime!(2024-06-01 07:00:00 UTC)));
        let mut scheduler = Scheduler::new(
            Arc::clone(&shared),
            Arc::new(RecordingPublisher::failing()),
            clock,
            PUMP.to_string(),
            DEFAULT_POLL_INTERVAL,
        );
        let (_trigger, mut sd) = shutdown::channel();

        assert_eq!(scheduler.tick(&mut sd).await, TickOutcome::Watered);
        assert_eq!(shared.read().await.reading.pump_state, PumpState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_episode_switches_pump_off() {
        let h = harness(Some("07:00"), 600);
        let mut scheduler = h.scheduler;
        let (trigger, mut sd) = shutdown::channel();
        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));

        let task = tokio::spawn(async move { scheduler.tick(&mut sd).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.trigger();

        assert_eq!(task.await.unwrap(), TickOutcome::Interrupted);
        assert_eq!(h.publisher.payloads(PUMP), vec!["ON", "OFF"]);
        assert_eq!(h.shared.read().await.reading.pump_state, PumpState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_until_shutdown() {
        let h = harness(Some("07:00"), 5);
        let (trigger, sd) = shutdown::channel();
        h.clock.set(datetime!(2024-06-01 07:00:00 UTC));

        let task = tokio::spawn(h.scheduler.run(sd));

        // First tick is immediate; the episode takes 5 s; later polls in the
        // same minute are no-ops.
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(h.publisher.payloads(PUMP), vec!["ON", "OFF"]);

        trigger.trigger();
        task.await.unwrap();
    }
}
