use crate::supervisor::{LiveState, Supervisor};
use chrono::{Local, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK_INTERVAL: Duration = Duration::from_secs(30);
const RELOAD_INTERVAL: Duration = Duration::from_secs(300);
const RESTART_SETTLE: Duration = Duration::from_secs(60);

/// Background watcher: detects crashed servers and fires the daily
/// scheduled stop/update/restart.
///
/// `run` drives real wall-clock ticks; `tick` takes the current time as
/// an argument so schedule behavior is testable with synthetic clocks.
pub struct Monitor {
    supervisor: Arc<Supervisor>,
    /// Date each server's stop_time last fired; keyed by calendar day
    /// so "00:00" fires exactly once per day
    handled: HashMap<String, NaiveDate>,
    last_reload: Instant,
    tick_interval: Duration,
    reload_interval: Duration,
    settle: Duration,
}

impl Monitor {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            handled: HashMap::new(),
            last_reload: Instant::now(),
            tick_interval: TICK_INTERVAL,
            reload_interval: RELOAD_INTERVAL,
            settle: RESTART_SETTLE,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick(Local::now().naive_local()).await;
        }
    }

    /// One pass: config reload (rate limited), crash watch, schedules,
    /// marker pruning.
    pub async fn tick(&mut self, now: NaiveDateTime) {
        if self.last_reload.elapsed() >= self.reload_interval {
            self.supervisor.config().reload();
            self.last_reload = Instant::now();
        }

        self.watch_crashes().await;
        self.run_schedules(now).await;
        self.prune_handled(now.date());
    }

    /// Each tracked server whose process died gets reaped and, when its
    /// settings allow, restarted. One server's failure never blocks the
    /// others.
    async fn watch_crashes(&self) {
        for name in self.supervisor.tracked_names().await {
            let LiveState::Dead(pid) = self.supervisor.check_live(&name).await else {
                continue;
            };
            tracing::warn!("{} (PID {}) is gone, handling crash", name, pid);
            self.supervisor.reap_crashed(&name).await;

            if self.supervisor.config().settings(&name).auto_restart {
                if let Err(e) = self.supervisor.start(&name).await {
                    tracing::error!("Crash restart of {} failed: {}", name, e);
                }
            }
        }
    }

    async fn run_schedules(&mut self, now: NaiveDateTime) {
        let today = now.date();
        let current = now.format("%H:%M").to_string();

        for name in self.supervisor.config().server_names() {
            let settings = self.supervisor.config().settings(&name);
            if settings.stop_time.is_empty() || settings.stop_time != current {
                continue;
            }
            if self.handled.get(&name) == Some(&today) {
                continue;
            }
            self.handled.insert(name.clone(), today);
            tracing::info!("Scheduled stop window for {} at {}", name, current);

            let mut stopped_cleanly = true;
            if matches!(
                self.supervisor.check_live(&name).await,
                LiveState::Running(_)
            ) {
                if let Err(e) = self.supervisor.stop(&name).await {
                    tracing::error!("Scheduled stop of {} failed: {}", name, e);
                    stopped_cleanly = false;
                }
            }

            if settings.auto_update {
                let report = self
                    .supervisor
                    .update_engine()
                    .run_update_as(&name, self.supervisor.config(), "auto_update")
                    .await;
                if !report.ok {
                    tracing::error!("Scheduled update of {} failed: {}", name, report.message);
                }
            }

            if settings.restart_after_stop && stopped_cleanly {
                tokio::time::sleep(self.settle).await;
                if let Err(e) = self.supervisor.start(&name).await {
                    tracing::error!("Scheduled restart of {} failed: {}", name, e);
                }
            }
        }
    }

    /// Markers from previous days or for undeclared servers fall away,
    /// re-arming each schedule for the new day.
    fn prune_handled(&mut self, today: NaiveDate) {
        let declared = self.supervisor.config().server_names();
        self.handled
            .retain(|name, date| *date == today && declared.contains(name));
    }
}
