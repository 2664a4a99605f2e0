//! Recurring sync jobs.
//!
//! One scheduler instance is owned by the process entry point. While running
//! it drives an incremental job and a full job, each on its own tokio task; a
//! job's run finishes before the same job can fire again, and late ticks are
//! delayed rather than queued. A tick later than the job's misfire grace is
//! skipped.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::connectors::query::{InvalidWindow, QueryWindow};
use crate::sync::{total_new, SyncError, SyncReport, SyncService, WindowPolicy};

pub const INCREMENTAL_JOB_ID: &str = "gmail_periodic_sync";
pub const FULL_JOB_ID: &str = "gmail_daily_full_sync";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub next_run: Option<DateTime<Utc>>,
    pub trigger: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub status: SchedulerState,
    pub jobs: Vec<JobStatus>,
}

#[derive(Debug, Clone)]
struct JobSpec {
    id: &'static str,
    name: &'static str,
    period: StdDuration,
    misfire_grace: StdDuration,
    trigger: String,
    policy: WindowPolicy,
}

impl JobSpec {
    fn next_run_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::from_std(self.period)
            .ok()
            .and_then(|period| at.checked_add_signed(period))
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    jobs: Arc<Mutex<Vec<JobStatus>>>,
}

pub struct SyncScheduler {
    service: Arc<SyncService>,
    running: Mutex<Option<Running>>,
    manual: tokio::sync::Mutex<()>,
}

impl SyncScheduler {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            running: Mutex::new(None),
            manual: tokio::sync::Mutex::new(()),
        }
    }

    fn job_specs(&self) -> Result<Vec<JobSpec>, InvalidWindow> {
        let settings = self.service.scheduler_settings();
        let incremental_minutes = settings.incremental_interval_minutes;
        let full_hours = settings.full_interval_hours;
        Ok(vec![
            JobSpec {
                id: INCREMENTAL_JOB_ID,
                name: "Gmail Periodic Sync",
                period: StdDuration::from_secs(incremental_minutes.saturating_mul(60)),
                misfire_grace: StdDuration::from_secs(settings.incremental_misfire_grace_secs),
                trigger: format!("interval: every {incremental_minutes} minutes"),
                policy: WindowPolicy::Incremental,
            },
            JobSpec {
                id: FULL_JOB_ID,
                name: "Gmail Daily Full Sync",
                period: StdDuration::from_secs(full_hours.saturating_mul(3_600)),
                misfire_grace: StdDuration::from_secs(settings.full_misfire_grace_secs),
                trigger: format!("interval: every {full_hours} hours"),
                policy: WindowPolicy::Fixed(QueryWindow::days(settings.full_lookback_days)?),
            },
        ])
    }

    /// Start both jobs. Returns `Ok(false)` when already running. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<bool, SyncError> {
        let mut running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if running.is_some() {
            warn!("sync scheduler already running; start ignored");
            return Ok(false);
        }

        let specs = self.job_specs()?;
        let now = Utc::now();
        let jobs = Arc::new(Mutex::new(
            specs
                .iter()
                .map(|spec| JobStatus {
                    id: spec.id.to_string(),
                    name: spec.name.to_string(),
                    next_run: spec.next_run_after(now),
                    trigger: spec.trigger.clone(),
                })
                .collect::<Vec<_>>(),
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = specs
            .into_iter()
            .enumerate()
            .map(|(slot, spec)| {
                tokio::spawn(run_job(
                    spec,
                    slot,
                    Arc::clone(&self.service),
                    Arc::clone(&jobs),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        *running = Some(Running {
            shutdown,
            handles,
            jobs,
        });
        info!("sync scheduler started");
        Ok(true)
    }

    /// Stop both jobs, waiting for any in-flight run. Returns `false` when already stopped.
    pub async fn stop(&self) -> bool {
        let taken = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(running) = taken else {
            warn!("sync scheduler not running; stop ignored");
            return false;
        };

        let _ = running.shutdown.send(true);
        for handle in running.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "sync job task ended abnormally");
            }
        }
        info!("sync scheduler stopped");
        true
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match running.as_ref() {
            None => SchedulerStatus {
                status: SchedulerState::Stopped,
                jobs: Vec::new(),
            },
            Some(running) => SchedulerStatus {
                status: SchedulerState::Running,
                jobs: match running.jobs.lock() {
                    Ok(jobs) => jobs.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                },
            },
        }
    }

    /// Immediate run over all active connections with the given lookback.
    /// Concurrent manual triggers run one after another.
    pub async fn trigger_now(&self, window: QueryWindow) -> Result<SyncReport, SyncError> {
        let _guard = self.manual.lock().await;
        info!(?window, "manual sync triggered");
        let report = self.service.sync_all_active(WindowPolicy::Fixed(window)).await?;
        info!(
            connections = report.len(),
            new = total_new(&report),
            "manual sync finished"
        );
        Ok(report)
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        let running = match self.running.get_mut() {
            Ok(running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
        }
    }
}

fn set_next_run(jobs: &Mutex<Vec<JobStatus>>, slot: usize, next_run: Option<DateTime<Utc>>) {
    let mut jobs = match jobs.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(job) = jobs.get_mut(slot) {
        job.next_run = next_run;
    }
}

async fn run_job(
    spec: JobSpec,
    slot: usize,
    service: Arc<SyncService>,
    jobs: Arc<Mutex<Vec<JobStatus>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = spec.period.max(StdDuration::from_secs(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let scheduled = tokio::select! {
            scheduled = ticker.tick() => scheduled,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        if *shutdown.borrow() {
            break;
        }

        let fired_at = Utc::now();
        set_next_run(&jobs, slot, spec.next_run_after(fired_at));

        let lateness = Instant::now().saturating_duration_since(scheduled);
        if lateness > spec.misfire_grace {
            warn!(
                job = spec.id,
                late_secs = lateness.as_secs(),
                grace_secs = spec.misfire_grace.as_secs(),
                "scheduled sync skipped; fired past its grace period"
            );
            continue;
        }

        match service.sync_all_active(spec.policy).await {
            Ok(report) => {
                let failed = report.values().filter(|result| result.is_err()).count();
                info!(
                    job = spec.id,
                    connections = report.len(),
                    failed_connections = failed,
                    new = total_new(&report),
                    "scheduled sync finished"
                );
            }
            Err(err) => error!(job = spec.id, error = %err, "scheduled sync could not list connections"),
        }
    }

    info!(job = spec.id, "sync job stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use tokio::sync::{mpsc, Notify};
    use tokio::time::Instant;

    use super::{SchedulerState, SyncScheduler, FULL_JOB_ID, INCREMENTAL_JOB_ID};
    use crate::config::Settings;
    use crate::connectors::query::QueryWindow;
    use crate::connectors::{Email, MailboxApi, OAuthProvider, TokenGrant};
    use crate::crypto::{TokenCipher, TEST_KEY_HEX};
    use crate::db::{Database, SyncStore};
    use crate::sync::SyncService;

    struct GrantingOAuth;

    #[async_trait]
    impl OAuthProvider for GrantingOAuth {
        fn authorization_url(&self, _: Option<&str>) -> Result<String> {
            Err(anyhow!("unused"))
        }
        async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
            Ok(TokenGrant {
                access_token: format!("access-{code}"),
                refresh_token: Some(format!("refresh-{code}")),
                expires_at: Some(Utc::now() + Duration::days(30)),
            })
        }
        async fn refresh(&self, _: &str) -> Result<TokenGrant> {
            Err(anyhow!("unused"))
        }
    }

    /// Reports each listing and, when gated, holds it until released.
    #[derive(Default)]
    struct GatedMailbox {
        gated: bool,
        started: Option<mpsc::UnboundedSender<()>>,
        release: Notify,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MailboxApi for GatedMailbox {
        async fn list_message_ids(&self, _: &str, _: &str, _: usize) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if let Some(started) = &self.started {
                let _ = started.send(());
            }
            if self.gated {
                self.release.notified().await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
        async fn get_message(&self, _: &str, id: &str) -> Result<Email> {
            Err(anyhow!("no message {id}"))
        }
        async fn profile_email(&self, _: &str) -> Result<String> {
            Ok("owner@gmail.com".to_string())
        }
    }

    struct Fixture {
        scheduler: Arc<SyncScheduler>,
        service: Arc<SyncService>,
        db: Arc<Database>,
        mailbox: Arc<GatedMailbox>,
    }

    fn fixture(mailbox: GatedMailbox) -> Fixture {
        let settings = Settings::from_lookup(|_| None).expect("settings");
        let db = Arc::new(Database::open_in_memory().expect("db"));
        let mailbox = Arc::new(mailbox);
        let service = Arc::new(SyncService::new(
            db.clone(),
            Arc::new(GrantingOAuth),
            mailbox.clone(),
            TokenCipher::from_hex(TEST_KEY_HEX).expect("cipher"),
            &settings,
        ));
        Fixture {
            scheduler: Arc::new(SyncScheduler::new(service.clone())),
            service,
            db,
            mailbox,
        }
    }

    fn gated() -> (GatedMailbox, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mailbox = GatedMailbox {
            gated: true,
            started: Some(tx),
            ..GatedMailbox::default()
        };
        (mailbox, rx)
    }

    #[tokio::test]
    async fn starting_twice_keeps_one_job_set() {
        let f = fixture(GatedMailbox::default());
        assert!(f.scheduler.start().expect("start"));
        assert!(!f.scheduler.start().expect("second start"));

        let status = f.scheduler.status();
        assert_eq!(status.status, SchedulerState::Running);
        let ids: Vec<_> = status.jobs.iter().map(|job| job.id.as_str()).collect();
        assert_eq!(ids, vec![INCREMENTAL_JOB_ID, FULL_JOB_ID]);
        assert!(status.jobs.iter().all(|job| job.next_run.is_some()));
        assert_eq!(status.jobs[0].name, "Gmail Periodic Sync");
        assert_eq!(status.jobs[0].trigger, "interval: every 30 minutes");

        assert!(f.scheduler.stop().await);
    }

    #[tokio::test]
    async fn stop_then_status_reports_stopped() {
        let f = fixture(GatedMailbox::default());
        f.scheduler.start().expect("start");
        assert!(f.scheduler.stop().await);

        let status = f.scheduler.status();
        assert_eq!(status.status, SchedulerState::Stopped);
        assert!(status.jobs.is_empty());
        assert_eq!(
            serde_json::to_value(&status).expect("serialize"),
            serde_json::json!({ "status": "stopped", "jobs": [] })
        );

        assert!(!f.scheduler.stop().await);
    }

    #[tokio::test]
    async fn scheduler_can_restart_after_stop() {
        let f = fixture(GatedMailbox::default());
        assert!(f.scheduler.start().expect("start"));
        assert!(f.scheduler.stop().await);
        assert!(f.scheduler.start().expect("restart"));
        assert_eq!(f.scheduler.status().status, SchedulerState::Running);
        assert!(f.scheduler.stop().await);
    }

    #[tokio::test]
    async fn manual_trigger_without_connections_is_empty() {
        let f = fixture(GatedMailbox::default());
        let report = f
            .scheduler
            .trigger_now(QueryWindow::days(3).expect("window"))
            .await
            .expect("manual run");
        assert!(report.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_job_fires_after_one_period() {
        let (tx, mut started) = mpsc::unbounded_channel();
        let f = fixture(GatedMailbox {
            started: Some(tx),
            ..GatedMailbox::default()
        });
        let connection = f.service.connect("user-1", "first").await.expect("connect");
        let begin = Instant::now();

        f.scheduler.start().expect("start");
        started.recv().await.expect("job fired");

        assert!(begin.elapsed() >= StdDuration::from_secs(30 * 60));
        assert!(begin.elapsed() < StdDuration::from_secs(31 * 60));
        assert_eq!(f.mailbox.calls.load(Ordering::SeqCst), 1);
        assert!(f.scheduler.stop().await);

        let reloaded = f.db.get_connection(&connection.id).expect("get").expect("exists");
        assert!(reloaded.last_sync_at >= connection.last_sync_at);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_the_in_flight_run() {
        let (mailbox, mut started) = gated();
        let f = fixture(mailbox);
        f.service.connect("user-1", "first").await.expect("connect");

        f.scheduler.start().expect("start");
        started.recv().await.expect("job fired");

        let scheduler = f.scheduler.clone();
        let stopping = tokio::spawn(async move { scheduler.stop().await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!stopping.is_finished());
        assert_eq!(f.mailbox.active.load(Ordering::SeqCst), 1);

        f.mailbox.release.notify_one();
        assert!(stopping.await.expect("stop task"));
        assert_eq!(f.mailbox.active.load(Ordering::SeqCst), 0);
        assert_eq!(f.scheduler.status().status, SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn a_slow_run_never_overlaps_and_stale_ticks_are_skipped() {
        let (mailbox, mut started) = gated();
        let f = fixture(mailbox);
        f.service.connect("user-1", "first").await.expect("connect");

        f.scheduler.start().expect("start");
        started.recv().await.expect("first run");

        tokio::time::sleep(StdDuration::from_secs(3 * 3_600)).await;
        assert_eq!(f.mailbox.calls.load(Ordering::SeqCst), 1);

        let released_at = Instant::now();
        f.mailbox.release.notify_one();
        started.recv().await.expect("next on-time run");

        // The tick missed while blocked was past its 300s grace, so the next
        // run waits a full period.
        assert!(released_at.elapsed() >= StdDuration::from_secs(29 * 60));
        assert_eq!(f.mailbox.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.mailbox.max_active.load(Ordering::SeqCst), 1);

        f.mailbox.release.notify_one();
        assert!(f.scheduler.stop().await);
    }
}
