//! Cooperative task scheduler.
//!
//! One loop iteration per scheduling granularity (default 60 s). Each
//! registered job carries a trigger (every N minutes, daily at HH:MM,
//! weekly at day HH:MM) and a per-task mutex: if an invocation is still
//! running when its next trigger fires, the new invocation is skipped and
//! logged; never queued, never run concurrently. This is also the
//! system's backpressure: slow tasks drop triggers instead of piling up.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use futures::future::BoxFuture;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::util::{SharedClock, ShutdownFlag};

/// Default loop granularity in seconds.
pub const DEFAULT_GRANULARITY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    EveryMinutes(i64),
    DailyAt { hour: u32, minute: u32 },
    WeeklyAt { weekday: Weekday, hour: u32, minute: u32 },
}

impl Trigger {
    /// Most recent scheduled instant at or before `now`, if any exists
    /// inside the relevant window.
    fn previous_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Trigger::EveryMinutes(_) => Some(now),
            Trigger::DailyAt { hour, minute } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                let today = now.date_naive().and_time(time).and_utc();
                if today <= now {
                    Some(today)
                } else {
                    Some(today - Duration::days(1))
                }
            }
            Trigger::WeeklyAt {
                weekday,
                hour,
                minute,
            } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
                let days_back = (now.weekday().num_days_from_monday() + 7
                    - weekday.num_days_from_monday())
                    % 7;
                let candidate = (now.date_naive() - Duration::days(days_back as i64))
                    .and_time(time)
                    .and_utc();
                if candidate <= now {
                    Some(candidate)
                } else {
                    Some(candidate - Duration::days(7))
                }
            }
        }
    }

    fn is_due(&self, now: DateTime<Utc>, last_run: DateTime<Utc>) -> bool {
        match *self {
            Trigger::EveryMinutes(minutes) => now - last_run >= Duration::minutes(minutes),
            _ => self
                .previous_fire(now)
                .is_some_and(|fire| last_run < fire),
        }
    }
}

type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledTask {
    name: String,
    trigger: Trigger,
    job: TaskFn,
    /// Per-task mutual exclusion guard.
    lock: Arc<Mutex<()>>,
    /// Set at fire time; `None` means the task has never fired.
    last_run: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
    clock: SharedClock,
    shutdown: ShutdownFlag,
    granularity: std::time::Duration,
    started_at: Option<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(clock: SharedClock, shutdown: ShutdownFlag) -> Self {
        Self {
            tasks: Vec::new(),
            clock,
            shutdown,
            granularity: std::time::Duration::from_secs(DEFAULT_GRANULARITY_SECS),
            started_at: None,
        }
    }

    pub fn with_granularity(mut self, granularity: std::time::Duration) -> Self {
        self.granularity = granularity;
        self
    }

    /// Register a periodic job. Interval jobs fire on the first loop
    /// iteration; calendar jobs wait for their next scheduled time.
    pub fn register<F, Fut>(&mut self, name: &str, trigger: Trigger, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Scheduler: registered {name} ({trigger:?})");
        self.tasks.push(ScheduledTask {
            name: name.to_string(),
            trigger,
            job: Arc::new(move || Box::pin(job())),
            lock: Arc::new(Mutex::new(())),
            last_run: None,
        });
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    /// Fire every due task. A task whose previous invocation still holds
    /// its lock is skipped with a warning.
    pub fn run_pending(&mut self) {
        let now = self.clock.now_utc();
        let baseline = self.started_at.unwrap_or(now);

        for task in &mut self.tasks {
            let due = match task.last_run {
                Some(last_run) => task.trigger.is_due(now, last_run),
                // Never fired: interval jobs start immediately, calendar
                // jobs measure from scheduler start.
                None => match task.trigger {
                    Trigger::EveryMinutes(_) => true,
                    _ => task.trigger.is_due(now, baseline),
                },
            };
            if !due {
                continue;
            }

            let Ok(guard) = task.lock.clone().try_lock_owned() else {
                warn!("Task {} already running, skipping", task.name);
                continue;
            };

            task.last_run = Some(now);
            let name = task.name.clone();
            let job = task.job.clone();
            tokio::spawn(async move {
                let _guard = guard;
                log::debug!("Task {name} starting");
                job().await;
                log::debug!("Task {name} finished");
            });
        }
    }

    /// Main loop: one `run_pending` per granularity until shutdown.
    pub async fn run(&mut self) {
        self.started_at = Some(self.clock.now_utc());
        info!(
            "Scheduler: starting with {} tasks ({}s granularity)",
            self.tasks.len(),
            self.granularity.as_secs()
        );

        while !self.shutdown.is_triggered() {
            self.run_pending();
            tokio::time::sleep(self.granularity).await;
        }

        info!("Scheduler: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{Clock, ManualClock};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn clock_at(hour: u32, minute: u32) -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, hour, minute, 0).unwrap(), // a Monday
        ))
    }

    #[tokio::test]
    async fn interval_task_fires_and_respects_interval() {
        let clock = clock_at(12, 0);
        let mut scheduler = Scheduler::new(clock.clone(), ShutdownFlag::new());
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        scheduler.register("tick", Trigger::EveryMinutes(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 3 minutes later: not due
        clock.advance(Duration::minutes(3));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 5+ minutes after the first run: due again
        clock.advance(Duration::minutes(3));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn daily_task_fires_once_at_its_time() {
        let clock = clock_at(19, 58);
        let mut scheduler = Scheduler::new(clock.clone(), ShutdownFlag::new());
        scheduler.started_at = Some(clock.now_utc());
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        scheduler.register(
            "daily_summary",
            Trigger::DailyAt { hour: 20, minute: 0 },
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        // Before 20:00 - nothing
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Past 20:00 - fires once, then stays quiet for the day
        clock.advance(Duration::minutes(3));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        clock.advance(Duration::minutes(1));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Next day - fires again
        clock.advance(Duration::days(1));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn weekly_task_waits_for_its_day() {
        let clock = clock_at(12, 0); // Monday noon
        let mut scheduler = Scheduler::new(clock.clone(), ShutdownFlag::new());
        scheduler.started_at = Some(clock.now_utc());
        let count = Arc::new(AtomicU32::new(0));

        let counter = count.clone();
        scheduler.register(
            "weekly_export",
            Trigger::WeeklyAt {
                weekday: Weekday::Sun,
                hour: 18,
                minute: 0,
            },
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Sunday 18:05
        clock.advance(Duration::days(6) + Duration::hours(6) + Duration::minutes(5));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_skipped_not_queued() {
        let clock = clock_at(12, 0);
        let mut scheduler = Scheduler::new(clock.clone(), ShutdownFlag::new());
        let started = Arc::new(AtomicU32::new(0));

        let release = Arc::new(tokio::sync::Notify::new());
        let started_counter = started.clone();
        let release_handle = release.clone();
        scheduler.register("slow", Trigger::EveryMinutes(1), move || {
            let started_counter = started_counter.clone();
            let release = release_handle.clone();
            async move {
                started_counter.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
            }
        });

        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // Second trigger while the first is still running: skipped.
        clock.advance(Duration::minutes(2));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // Let the first run finish; the next trigger fires again.
        release.notify_waiters();
        tokio::task::yield_now().await;
        clock.advance(Duration::minutes(2));
        scheduler.run_pending();
        tokio::task::yield_now().await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }
}
