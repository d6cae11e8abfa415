//! The scheduler run loop and mutation API.
//!
//! A single ticker wakes on the earliest `nextRunAtMs` across enabled
//! jobs. Firing marks the job running and publishes `CronTriggered`; the
//! gateway executes the payload and publishes `CronCompleted`, which
//! folds the result back into job state and recomputes the next run.
//! A job never overlaps itself; fires missed while running coalesce into
//! at most one pending fire.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use clawdbot_bus::BusPublisher;
use clawdbot_schema::{BusMessage, JobChange, RunStatus, WakeMode};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::compute::compute_next_run_at_ms;
use crate::job::{normalize_job, normalize_payload, normalize_schedule, CronJob, JobInput, JobPatch};
use crate::store::{HistoryStore, JobStore, RunRecord};

const MAX_SLEEP_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceRunOutcome {
    Triggered,
    Skipped { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub jobs: usize,
    pub enabled: usize,
    pub running: usize,
    pub next_run_at_ms: Option<i64>,
}

pub struct CronScheduler {
    jobs: Mutex<HashMap<Uuid, CronJob>>,
    store: JobStore,
    history: HistoryStore,
    bus: BusPublisher,
    notify: Notify,
    cancel: CancellationToken,
    max_concurrent: usize,
}

impl CronScheduler {
    pub fn new(
        cron_dir: &Path,
        bus: BusPublisher,
        cancel: CancellationToken,
        max_concurrent: usize,
    ) -> Self {
        let store = JobStore::new(cron_dir);
        let now = Utc::now().timestamp_millis();
        let mut jobs = HashMap::new();
        for mut job in store.load() {
            // A running marker from a previous process is stale.
            job.state.running_at_ms = None;
            job.state.next_run_at_ms = if job.enabled {
                compute_next_run_at_ms(&job.schedule, now)
                    .ok()
                    .flatten()
            } else {
                None
            };
            jobs.insert(job.id, job);
        }

        Self {
            jobs: Mutex::new(jobs),
            store,
            history: HistoryStore::new(cron_dir),
            bus,
            notify: Notify::new(),
            cancel,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn add(&self, input: &JobInput) -> Result<CronJob> {
        let mut job = normalize_job(input)?;
        if job.enabled {
            job.state.next_run_at_ms =
                compute_next_run_at_ms(&job.schedule, Utc::now().timestamp_millis())?;
        }
        let snapshot = {
            let mut jobs = self.jobs.lock().expect("cron jobs");
            jobs.insert(job.id, job.clone());
            self.persist_locked(&jobs);
            job.clone()
        };
        self.notify.notify_one();
        let _ = self
            .bus
            .publish(BusMessage::CronJobsChanged {
                change: JobChange::Added,
                job_id: snapshot.id,
            })
            .await;
        Ok(snapshot)
    }

    pub async fn update(&self, id: Uuid, patch: &JobPatch) -> Result<CronJob> {
        let snapshot = {
            let mut jobs = self.jobs.lock().expect("cron jobs");
            let job = jobs.get_mut(&id).ok_or_else(|| anyhow!("no such job: {id}"))?;

            let mut reschedule = false;
            if let Some(name) = &patch.name {
                job.name = name.clone();
            }
            if let Some(description) = &patch.description {
                job.description = Some(description.clone());
            }
            if let Some(schedule) = &patch.schedule {
                job.schedule = normalize_schedule(schedule)?;
                reschedule = true;
            }
            if let Some(payload) = &patch.payload {
                job.payload = normalize_payload(payload)?;
            }
            if let Some(target) = patch.session_target {
                job.session_target = target;
            }
            if let Some(mode) = patch.wake_mode {
                job.wake_mode = mode;
            }
            if let Some(isolation) = &patch.isolation {
                job.isolation = Some(isolation.clone());
            }
            if let Some(enabled) = patch.enabled {
                if job.enabled != enabled {
                    job.enabled = enabled;
                    reschedule = true;
                }
            }

            if reschedule {
                job.state.next_run_at_ms = if job.enabled {
                    compute_next_run_at_ms(&job.schedule, Utc::now().timestamp_millis())?
                } else {
                    None
                };
            }
            job.updated_at_ms = Utc::now().timestamp_millis();
            let snapshot = job.clone();
            self.persist_locked(&jobs);
            snapshot
        };
        self.notify.notify_one();
        let _ = self
            .bus
            .publish(BusMessage::CronJobsChanged {
                change: JobChange::Updated,
                job_id: id,
            })
            .await;
        Ok(snapshot)
    }

    pub async fn remove(&self, id: Uuid) -> Result<bool> {
        let removed = {
            let mut jobs = self.jobs.lock().expect("cron jobs");
            let removed = jobs.remove(&id).is_some();
            if removed {
                self.persist_locked(&jobs);
            }
            removed
        };
        if removed {
            self.notify.notify_one();
            let _ = self
                .bus
                .publish(BusMessage::CronJobsChanged {
                    change: JobChange::Removed,
                    job_id: id,
                })
                .await;
        }
        Ok(removed)
    }

    pub fn list(&self, include_disabled: bool) -> Vec<CronJob> {
        let jobs = self.jobs.lock().expect("cron jobs");
        let mut out: Vec<_> = jobs
            .values()
            .filter(|job| include_disabled || job.enabled)
            .cloned()
            .collect();
        out.sort_by_key(|job| job.created_at_ms);
        out
    }

    pub fn get(&self, id: Uuid) -> Option<CronJob> {
        self.jobs.lock().expect("cron jobs").get(&id).cloned()
    }

    pub fn status(&self) -> SchedulerStatus {
        let jobs = self.jobs.lock().expect("cron jobs");
        SchedulerStatus {
            jobs: jobs.len(),
            enabled: jobs.values().filter(|j| j.enabled).count(),
            running: jobs
                .values()
                .filter(|j| j.state.running_at_ms.is_some())
                .count(),
            next_run_at_ms: jobs
                .values()
                .filter(|j| j.enabled)
                .filter_map(|j| j.state.next_run_at_ms)
                .min(),
        }
    }

    /// Out-of-band fire that still honors single-flight: a job already
    /// running is skipped with a reason instead of overlapping.
    pub async fn run_now(&self, id: Uuid) -> Result<ForceRunOutcome> {
        let now = Utc::now().timestamp_millis();
        let trigger = {
            let mut jobs = self.jobs.lock().expect("cron jobs");
            let job = jobs.get_mut(&id).ok_or_else(|| anyhow!("no such job: {id}"))?;
            if job.state.running_at_ms.is_some() {
                return Ok(ForceRunOutcome::Skipped {
                    reason: "already-running".into(),
                });
            }
            job.state.running_at_ms = Some(now);
            let trigger = trigger_message(job, now);
            self.persist_locked(&jobs);
            trigger
        };
        let _ = self.bus.publish(trigger).await;
        Ok(ForceRunOutcome::Triggered)
    }

    /// Forward a wake request straight to the heartbeat driver.
    pub async fn wake(&self, mode: WakeMode, text: Option<String>, reason: Option<String>) {
        let _ = self
            .bus
            .publish(BusMessage::WakeRequested { mode, text, reason })
            .await;
    }

    /// Fold one completed run back into job state.
    pub fn handle_completion(
        &self,
        job_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        started_at_ms: i64,
        ended_at_ms: i64,
    ) {
        let record = {
            let mut jobs = self.jobs.lock().expect("cron jobs");
            let Some(job) = jobs.get_mut(&job_id) else {
                tracing::debug!(%job_id, "completion for unknown job; dropped");
                return;
            };
            job.state.last_run_at_ms = Some(started_at_ms);
            job.state.last_status = Some(status);
            job.state.last_error = error.clone();
            job.state.last_duration_ms = Some(ended_at_ms.saturating_sub(started_at_ms) as u64);
            job.state.running_at_ms = None;
            job.state.next_run_at_ms = if job.enabled {
                compute_next_run_at_ms(&job.schedule, ended_at_ms)
                    .ok()
                    .flatten()
            } else {
                None
            };
            self.persist_locked(&jobs);
            RunRecord {
                job_id,
                started_at: chrono::DateTime::from_timestamp_millis(started_at_ms)
                    .unwrap_or_else(Utc::now),
                ended_at: chrono::DateTime::from_timestamp_millis(ended_at_ms)
                    .unwrap_or_else(Utc::now),
                status,
                error,
                duration_ms: ended_at_ms.saturating_sub(started_at_ms) as u64,
            }
        };
        if let Err(err) = self.history.append(&record) {
            tracing::warn!("cron history append failed: {err:#}");
        }
        self.notify.notify_one();
    }

    pub fn recent_runs(&self, job_id: Uuid, limit: usize) -> Result<Vec<RunRecord>> {
        self.history.recent(job_id, limit)
    }

    /// The cooperative run loop; returns when the token is cancelled.
    pub async fn run(self: Arc<Self>) {
        loop {
            let sleep_ms = self.sleep_ms();
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }
            self.fire_due().await;
        }
    }

    /// Fire every due job, bounded by `max_concurrent` running jobs.
    pub async fn fire_due(&self) {
        let now = Utc::now().timestamp_millis();
        let triggers = {
            let mut jobs = self.jobs.lock().expect("cron jobs");
            let running = jobs
                .values()
                .filter(|j| j.state.running_at_ms.is_some())
                .count();
            let mut slots = self.max_concurrent.saturating_sub(running);

            let mut due_ids: Vec<Uuid> = jobs
                .values()
                .filter(|job| {
                    job.enabled
                        && job.state.running_at_ms.is_none()
                        && job.state.next_run_at_ms.is_some_and(|next| next <= now)
                })
                .map(|job| job.id)
                .collect();
            due_ids.sort_by_key(|id| jobs[id].state.next_run_at_ms);

            let mut triggers = Vec::new();
            for id in due_ids {
                if slots == 0 {
                    break;
                }
                let job = jobs.get_mut(&id).expect("due job");
                job.state.running_at_ms = Some(now);
                triggers.push(trigger_message(job, now));
                slots -= 1;
            }
            if !triggers.is_empty() {
                self.persist_locked(&jobs);
            }
            triggers
        };

        for trigger in triggers {
            let _ = self.bus.publish(trigger).await;
        }
    }

    fn sleep_ms(&self) -> u64 {
        let jobs = self.jobs.lock().expect("cron jobs");
        let now = Utc::now().timestamp_millis();
        jobs.values()
            .filter(|j| j.enabled && j.state.running_at_ms.is_none())
            .filter_map(|j| j.state.next_run_at_ms)
            .min()
            .map(|next| ((next - now).max(0) as u64).min(MAX_SLEEP_MS))
            .unwrap_or(MAX_SLEEP_MS)
    }

    fn persist_locked(&self, jobs: &HashMap<Uuid, CronJob>) {
        let mut snapshot: Vec<_> = jobs.values().cloned().collect();
        snapshot.sort_by_key(|job| job.created_at_ms);
        if let Err(err) = self.store.save(snapshot) {
            tracing::warn!("cron store persist failed: {err:#}");
        }
    }
}

fn trigger_message(job: &CronJob, now: i64) -> BusMessage {
    BusMessage::CronTriggered {
        job_id: job.id,
        job_name: job.name.clone(),
        session_target: job.session_target,
        wake_mode: job.wake_mode,
        payload: job.payload.clone(),
        isolation_prefix: job
            .isolation
            .as_ref()
            .and_then(|i| i.post_to_main_prefix.clone()),
        triggered_at_ms: now,
    }
}

/// Wire the scheduler to `CronCompleted` events from the bus.
pub fn spawn_completion_listener(
    scheduler: Arc<CronScheduler>,
    mut rx: tokio::sync::mpsc::Receiver<BusMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let BusMessage::CronCompleted {
                job_id,
                status,
                error,
                started_at_ms,
                ended_at_ms,
                response: _,
            } = msg
            {
                scheduler.handle_completion(job_id, status, error, started_at_ms, ended_at_ms);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use clawdbot_bus::EventBus;
    use clawdbot_schema::Topic;

    use crate::job::{RawPayload, RawSchedule};

    use super::*;

    fn scheduler_with_bus() -> (Arc<CronScheduler>, EventBus, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let scheduler = Arc::new(CronScheduler::new(
            tmp.path(),
            bus.publisher(),
            CancellationToken::new(),
            4,
        ));
        (scheduler, bus, tmp)
    }

    fn every_input(ms: i64) -> JobInput {
        JobInput {
            name: "tick".into(),
            schedule: RawSchedule {
                every_ms: Some(ms),
                ..Default::default()
            },
            payload: RawPayload {
                text: Some("wake".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn at_input(at_ms: i64) -> JobInput {
        JobInput {
            name: "once".into(),
            schedule: RawSchedule {
                at_ms: Some(at_ms),
                ..Default::default()
            },
            payload: RawPayload {
                message: Some("do it".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_computes_next_and_emits_event() {
        let (scheduler, bus, _tmp) = scheduler_with_bus();
        let mut rx = bus.subscribe(Topic::CronJobsChanged).await;

        let job = scheduler.add(&every_input(60_000)).await.unwrap();
        assert!(job.state.next_run_at_ms.is_some());

        let msg = rx.recv().await.unwrap();
        assert!(matches!(
            msg,
            BusMessage::CronJobsChanged {
                change: JobChange::Added,
                job_id
            } if job_id == job.id
        ));
    }

    #[tokio::test]
    async fn jobs_persist_across_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let id = {
            let scheduler = CronScheduler::new(
                tmp.path(),
                bus.publisher(),
                CancellationToken::new(),
                4,
            );
            scheduler.add(&every_input(60_000)).await.unwrap().id
        };

        let scheduler = CronScheduler::new(
            tmp.path(),
            bus.publisher(),
            CancellationToken::new(),
            4,
        );
        let job = scheduler.get(id).unwrap();
        assert_eq!(job.name, "tick");
        // Stale running markers are cleared on load.
        assert!(job.state.running_at_ms.is_none());
    }

    #[tokio::test]
    async fn due_job_fires_and_marks_running() {
        let (scheduler, bus, _tmp) = scheduler_with_bus();
        let mut rx = bus.subscribe(Topic::CronTriggered).await;
        let now = Utc::now().timestamp_millis();
        let job = scheduler.add(&at_input(now + 10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.fire_due().await;

        let msg = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            BusMessage::CronTriggered { job_id, .. } => assert_eq!(job_id, job.id),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(scheduler.get(job.id).unwrap().state.running_at_ms.is_some());
    }

    #[tokio::test]
    async fn running_job_does_not_fire_again() {
        let (scheduler, bus, _tmp) = scheduler_with_bus();
        let mut rx = bus.subscribe(Topic::CronTriggered).await;
        let now = Utc::now().timestamp_millis();
        let _job = scheduler.add(&at_input(now + 1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.fire_due().await;
        scheduler.fire_due().await;

        assert!(rx.recv().await.is_some());
        let second = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
        assert!(second.is_err(), "missed fires must coalesce");
    }

    #[tokio::test]
    async fn completion_updates_state_and_reschedules() {
        let (scheduler, _bus, _tmp) = scheduler_with_bus();
        let job = scheduler.add(&every_input(60_000)).await.unwrap();
        let first_next = job.state.next_run_at_ms.unwrap();

        scheduler.fire_due().await; // not due yet; harmless
        let started = Utc::now().timestamp_millis();
        scheduler.handle_completion(job.id, RunStatus::Ok, None, started, started + 250);

        let job = scheduler.get(job.id).unwrap();
        assert_eq!(job.state.last_status, Some(RunStatus::Ok));
        assert_eq!(job.state.last_duration_ms, Some(250));
        assert!(job.state.running_at_ms.is_none());
        assert!(job.state.next_run_at_ms.unwrap() >= first_next);

        let history = scheduler.recent_runs(job.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Ok);
    }

    #[tokio::test]
    async fn completed_at_job_has_no_next_run() {
        let (scheduler, _bus, _tmp) = scheduler_with_bus();
        let now = Utc::now().timestamp_millis();
        let job = scheduler.add(&at_input(now + 5)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.fire_due().await;
        scheduler.handle_completion(job.id, RunStatus::Ok, None, now, now + 20);
        assert_eq!(scheduler.get(job.id).unwrap().state.next_run_at_ms, None);
    }

    #[tokio::test]
    async fn force_run_while_running_is_skipped() {
        let (scheduler, _bus, _tmp) = scheduler_with_bus();
        let job = scheduler.add(&every_input(60_000)).await.unwrap();

        assert_eq!(
            scheduler.run_now(job.id).await.unwrap(),
            ForceRunOutcome::Triggered
        );
        assert_eq!(
            scheduler.run_now(job.id).await.unwrap(),
            ForceRunOutcome::Skipped {
                reason: "already-running".into()
            }
        );
    }

    #[tokio::test]
    async fn completion_error_recorded_and_proceeds() {
        let (scheduler, _bus, _tmp) = scheduler_with_bus();
        let job = scheduler.add(&every_input(1_000)).await.unwrap();
        let started = Utc::now().timestamp_millis();
        scheduler.handle_completion(
            job.id,
            RunStatus::Error,
            Some("backend down".into()),
            started,
            started + 10,
        );

        let job = scheduler.get(job.id).unwrap();
        assert_eq!(job.state.last_status, Some(RunStatus::Error));
        assert_eq!(job.state.last_error.as_deref(), Some("backend down"));
        // The next schedule still advances.
        assert!(job.state.next_run_at_ms.is_some());
    }

    #[tokio::test]
    async fn disable_clears_next_run() {
        let (scheduler, _bus, _tmp) = scheduler_with_bus();
        let job = scheduler.add(&every_input(60_000)).await.unwrap();

        let patch = JobPatch {
            enabled: Some(false),
            ..Default::default()
        };
        let updated = scheduler.update(job.id, &patch).await.unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.state.next_run_at_ms, None);
        // Disabled jobs stay persisted and listable.
        assert_eq!(scheduler.list(true).len(), 1);
        assert!(scheduler.list(false).is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_and_emits() {
        let (scheduler, bus, _tmp) = scheduler_with_bus();
        let job = scheduler.add(&every_input(60_000)).await.unwrap();
        let mut rx = bus.subscribe(Topic::CronJobsChanged).await;

        assert!(scheduler.remove(job.id).await.unwrap());
        assert!(!scheduler.remove(job.id).await.unwrap());
        assert!(scheduler.get(job.id).is_none());

        let msg = rx.recv().await.unwrap();
        assert!(matches!(
            msg,
            BusMessage::CronJobsChanged {
                change: JobChange::Removed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn run_loop_fires_due_jobs() {
        let (scheduler, bus, _tmp) = scheduler_with_bus();
        let mut rx = bus.subscribe(Topic::CronTriggered).await;
        let now = Utc::now().timestamp_millis();
        scheduler.add(&at_input(now + 40)).await.unwrap();

        let loop_handle = tokio::spawn(scheduler.clone().run());
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("run loop should fire the due job")
            .unwrap();
        assert!(matches!(msg, BusMessage::CronTriggered { .. }));

        scheduler.cancel.cancel();
        let _ = loop_handle.await;
    }

    #[tokio::test]
    async fn wake_forwards_to_bus() {
        let (scheduler, bus, _tmp) = scheduler_with_bus();
        let mut rx = bus.subscribe(Topic::WakeRequested).await;
        scheduler
            .wake(WakeMode::Now, Some("rise".into()), Some("test".into()))
            .await;
        let msg = rx.recv().await.unwrap();
        assert!(matches!(
            msg,
            BusMessage::WakeRequested {
                mode: WakeMode::Now,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn completion_listener_wires_bus_to_state() {
        let (scheduler, bus, _tmp) = scheduler_with_bus();
        let job = scheduler.add(&every_input(60_000)).await.unwrap();
        let rx = bus.subscribe(Topic::CronCompleted).await;
        let _listener = spawn_completion_listener(scheduler.clone(), rx);

        let started = Utc::now().timestamp_millis();
        bus.publish(BusMessage::CronCompleted {
            job_id: job.id,
            status: RunStatus::Ok,
            error: None,
            started_at_ms: started,
            ended_at_ms: started + 5,
            response: Some("done".into()),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            scheduler.get(job.id).unwrap().state.last_status,
            Some(RunStatus::Ok)
        );
    }

    #[tokio::test]
    async fn max_concurrent_bounds_parallel_fires() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let scheduler = Arc::new(CronScheduler::new(
            tmp.path(),
            bus.publisher(),
            CancellationToken::new(),
            1,
        ));
        let now = Utc::now().timestamp_millis();
        scheduler.add(&at_input(now + 1)).await.unwrap();
        scheduler.add(&at_input(now + 1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.fire_due().await;
        assert_eq!(scheduler.status().running, 1);
    }
}
