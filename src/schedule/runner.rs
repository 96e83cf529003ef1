//! The three periodic loops: sensor tick, schedule check, housekeeping.
//!
//! Each loop is a supervised task driven by a `tokio` interval with
//! missed-tick skipping: an overrunning tick is dropped with a warning,
//! never queued. The schedule check is stateless: every tick recomputes
//! `should_be_on` from scratch and corrects drift through the command bus,
//! which tolerates missed ticks and config reloads transparently.

use crate::bus::{ControlHandle, RelayOp};
use crate::config::ConfigManager;
use crate::relay::RelayState;
use crate::schedule::Schedule;
use crate::sensor::SensorPoller;
use crate::store::{Point, SinkHandle};
use crate::system::UsageSampler;
use chrono::{Datelike, Local, Timelike};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Scheduler {
    config: Arc<ConfigManager>,
    poller: Arc<SensorPoller>,
    bus: ControlHandle,
    relay_states: Arc<DashMap<String, RelayState>>,
    sink: SinkHandle,
    usage: Arc<UsageSampler>,
}

/// Running scheduler; dropping it does not stop the loops, call
/// [`SchedulerHandle::shutdown`].
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every loop and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

impl Scheduler {
    pub fn new(
        config: Arc<ConfigManager>,
        poller: Arc<SensorPoller>,
        bus: ControlHandle,
        relay_states: Arc<DashMap<String, RelayState>>,
        sink: SinkHandle,
        usage: Arc<UsageSampler>,
    ) -> Self {
        Self {
            config,
            poller,
            bus,
            relay_states,
            sink,
            usage,
        }
    }

    /// Spawn the three loops with the periods configured in `general`.
    pub fn spawn(self) -> SchedulerHandle {
        let general = self.config.effective().general.clone();
        let (stop, _) = watch::channel(false);
        let this = Arc::new(self);

        let tasks = vec![
            spawn_loop(
                "sensor-tick",
                Duration::from_secs(general.sensor_poll_secs.max(1)),
                stop.subscribe(),
                {
                    let this = this.clone();
                    move || {
                        let this = this.clone();
                        async move {
                            let tick = Duration::from_secs(
                                this.config.effective().general.sensor_poll_secs.max(1),
                            );
                            this.poller.poll_all(tick).await;
                        }
                    }
                },
            ),
            spawn_loop(
                "schedule-check",
                Duration::from_secs(general.schedule_check_secs.max(1)),
                stop.subscribe(),
                {
                    let this = this.clone();
                    move || {
                        let this = this.clone();
                        async move { this.check_schedules().await }
                    }
                },
            ),
            spawn_loop(
                "housekeeping",
                Duration::from_secs(general.housekeeping_secs.max(1)),
                stop.subscribe(),
                {
                    let first = Arc::new(std::sync::atomic::AtomicBool::new(true));
                    move || {
                        let this = this.clone();
                        let first = first.clone();
                        async move {
                            this.housekeeping(
                                first.swap(false, std::sync::atomic::Ordering::SeqCst),
                            )
                            .await;
                        }
                    }
                },
            ),
        ];

        SchedulerHandle { stop, tasks }
    }

    /// One schedule pass. Relays whose schedule disagrees with `Q` are
    /// corrected through the bus; disabled relays and disabled schedules
    /// are never touched, and this path never pulses.
    async fn check_schedules(&self) {
        let now = Local::now();
        self.check_schedules_at(now.time(), now.weekday()).await;
    }

    /// Drift correction against an explicit clock; split out so tests can
    /// pin the wall time.
    pub(crate) async fn check_schedules_at(&self, time: chrono::NaiveTime, weekday: chrono::Weekday) {
        let doc = self.config.effective();
        debug!(
            "schedule check at {:02}:{:02} {weekday}",
            time.hour(),
            time.minute()
        );
        for relay in doc.relays.iter().filter(|r| r.enabled) {
            let Some(schedule) = relay.schedule.as_ref().filter(|s| s.enabled) else {
                continue;
            };
            let desired = desired_state(schedule, time, weekday);
            let current = self.relay_states.get(&relay.id).map(|s| *s);
            if current == Some(desired) {
                continue;
            }
            info!(relay = %relay.id, %desired, "correcting schedule drift");
            let op = match desired {
                RelayState::On => RelayOp::On,
                RelayState::Off => RelayOp::Off,
            };
            if let Err(e) = self.bus.relay_command(op, &relay.id, None).await {
                warn!(relay = %relay.id, error = %e, "schedule correction failed");
            }
        }
    }

    /// Housekeeping: system usage sampling plus, on the first tick only,
    /// driving unscheduled relays to their configured boot state.
    async fn housekeeping(&self, first_run: bool) {
        if first_run {
            self.apply_boot_states().await;
        }

        let sampler = self.usage.clone();
        let snapshot =
            match tokio::task::spawn_blocking(move || sampler.sample()).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "usage sampling failed");
                    return;
                }
            };
        let mut point = Point::new("system_usage")
            .field("cpu_percent", snapshot.cpu_percent)
            .field("memory_percent", snapshot.memory_percent)
            .field("disk_percent", snapshot.disk_percent);
        point.time = snapshot.timestamp;
        self.sink.push(point);
    }

    async fn apply_boot_states(&self) {
        let doc = self.config.effective();
        for relay in doc.relays.iter().filter(|r| r.enabled) {
            if relay.schedule.as_ref().is_some_and(|s| s.enabled) {
                continue; // the schedule loop owns these
            }
            let Some(boot_state) = relay.boot_state else {
                continue;
            };
            if self.relay_states.get(&relay.id).map(|s| *s) == Some(boot_state) {
                continue;
            }
            info!(relay = %relay.id, state = %boot_state, "applying boot state");
            let op = match boot_state {
                RelayState::On => RelayOp::On,
                RelayState::Off => RelayOp::Off,
            };
            if let Err(e) = self.bus.relay_command(op, &relay.id, None).await {
                warn!(relay = %relay.id, error = %e, "boot state apply failed");
            }
        }
    }
}

/// What the schedule wants the relay to be right now.
pub fn desired_state(
    schedule: &Schedule,
    time: chrono::NaiveTime,
    weekday: chrono::Weekday,
) -> RelayState {
    if schedule.should_be_on(time, weekday) {
        RelayState::On
    } else {
        RelayState::Off
    }
}

fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut stop: watch::Receiver<bool>,
    mut body: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = tokio::time::Instant::now();
                    body().await;
                    let elapsed = started.elapsed();
                    if elapsed > period {
                        warn!(loop_name = name, ?elapsed, "tick overran its period, skipping missed ticks");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        debug!(loop_name = name, "loop stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Dispatcher;
    use crate::hardware::{MockHardware, Watchdog};
    use crate::relay::RelayAuthority;
    use crate::rules::LatchStore;
    use crate::schedule::{FRIDAY, MONDAY, THURSDAY, TUESDAY, WEDNESDAY};
    use crate::sensor::SensorCatalog;
    use crate::store::{KvCache, MemoryCache, SinkHandle};
    use chrono::Weekday;
    use serde_json::json;

    fn workday_schedule() -> Schedule {
        Schedule {
            enabled: true,
            on_time: "08:00".into(),
            off_time: "17:00".into(),
            days_mask: MONDAY | TUESDAY | WEDNESDAY | THURSDAY | FRIDAY,
        }
    }

    #[test]
    fn test_desired_state_tracks_window() {
        let s = workday_schedule();
        let t = |text: &str| Schedule::parse_time(text).unwrap();
        assert_eq!(desired_state(&s, t("09:00"), Weekday::Tue), RelayState::On);
        assert_eq!(desired_state(&s, t("17:05"), Weekday::Tue), RelayState::Off);
        assert_eq!(desired_state(&s, t("09:00"), Weekday::Sun), RelayState::Off);
    }

    async fn drift_harness(dir: &tempfile::TempDir) -> (Scheduler, Arc<RelayAuthority>) {
        let default_path = dir.path().join("config.json");
        std::fs::write(
            &default_path,
            json!({
                "relays": [
                    {"id": "relay_4", "gpio_line": 4, "polarity": "normally_open",
                     "enabled": true, "pulse_time": 5,
                     "schedule": {"enabled": true, "on_time": "08:00",
                                  "off_time": "17:00", "days_mask": 124}},
                    {"id": "relay_5", "gpio_line": 24, "polarity": "normally_open",
                     "enabled": false, "pulse_time": 5,
                     "schedule": {"enabled": true, "on_time": "08:00",
                                  "off_time": "17:00", "days_mask": 124}}
                ]
            })
            .to_string(),
        )
        .unwrap();
        let config = Arc::new(
            crate::config::ConfigManager::load(
                default_path,
                dir.path().join("custom.json"),
                SensorCatalog::default(),
            )
            .await
            .unwrap(),
        );
        let hardware = Arc::new(MockHardware::new());
        let authority = Arc::new(RelayAuthority::new(hardware));
        authority.apply_config(&config.effective().relays).await;

        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new());
        let latches = Arc::new(LatchStore::new(cache.clone()));
        let dispatcher = Dispatcher::new(
            authority.clone(),
            config.clone(),
            latches,
            cache.clone(),
            Watchdog::new(dir.path().join("watchdog")),
        );
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(dispatcher.run(rx));

        let engine = crate::rules::RuleEngine::new(
            config.clone(),
            Arc::new(LatchStore::new(cache.clone())),
            ControlHandle::new(tx.clone()),
            cache,
            Watchdog::new(dir.path().join("watchdog")),
        );
        let poller = SensorPoller::new(
            Arc::new(MockHardware::new()),
            Vec::new(),
            SinkHandle::disconnected(),
            engine,
        );
        let scheduler = Scheduler::new(
            config,
            poller,
            ControlHandle::new(tx),
            authority.state_cache(),
            SinkHandle::disconnected(),
            Arc::new(crate::system::UsageSampler::new()),
        );
        (scheduler, authority)
    }

    #[tokio::test]
    async fn test_drift_correction_follows_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, authority) = drift_harness(&dir).await;
        let t = |text: &str| Schedule::parse_time(text).unwrap();

        // Tuesday 09:00: inside the window, relay_4 must be driven ON.
        scheduler.check_schedules_at(t("09:00"), Weekday::Tue).await;
        assert_eq!(authority.get("relay_4").await.unwrap(), RelayState::On);

        // Tuesday 17:05: outside, driven OFF.
        scheduler.check_schedules_at(t("17:05"), Weekday::Tue).await;
        assert_eq!(authority.get("relay_4").await.unwrap(), RelayState::Off);

        // Disabled relays are never touched.
        assert_eq!(authority.get("relay_5").await.unwrap(), RelayState::Off);
    }

    #[tokio::test]
    async fn test_in_sync_relay_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, authority) = drift_harness(&dir).await;
        let t = |text: &str| Schedule::parse_time(text).unwrap();

        scheduler.check_schedules_at(t("09:00"), Weekday::Tue).await;
        assert_eq!(authority.get("relay_4").await.unwrap(), RelayState::On);

        // Second tick with no drift: state unchanged, no churn.
        scheduler.check_schedules_at(t("10:00"), Weekday::Tue).await;
        assert_eq!(authority.get("relay_4").await.unwrap(), RelayState::On);
    }
}
