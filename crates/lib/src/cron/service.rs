//! Cron service: evaluates due jobs on a timer and publishes their synthetic turns to the bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};

use super::store::CronStore;
use super::types::CronJob;
use super::CronError;
use crate::bus::MessageBus;

/// Virtual channel that receives replies for jobs without a delivery target.
pub const CRON_CHANNEL_ID: &str = "cron";

pub struct CronService {
    bus: Arc<MessageBus>,
    store: Option<CronStore>,
    sink_channel: String,
    /// Jobs by id. Holding this lock is also what serializes ticks.
    jobs: Mutex<BTreeMap<String, CronJob>>,
}

impl CronService {
    /// `store` of `None` keeps jobs in memory only.
    pub fn new(bus: Arc<MessageBus>, store: Option<CronStore>) -> Self {
        Self {
            bus,
            store,
            sink_channel: CRON_CHANNEL_ID.to_string(),
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn sink_channel(&self) -> &str {
        &self.sink_channel
    }

    /// Load the store and merge `configured` jobs into it by id. A configured job replaces the
    /// stored definition; its schedule state survives unless the schedule itself changed.
    pub async fn load(&self, configured: &[CronJob]) -> Result<usize, CronError> {
        for job in configured {
            job.schedule.validate()?;
        }
        let mut jobs = self.jobs.lock().await;
        let count = self.apply(&mut jobs, |stored| {
            for job in configured {
                if job.id.trim().is_empty() {
                    log::warn!("cron: configured job '{}' has no id; skipped", job.name);
                    continue;
                }
                let mut merged = job.clone();
                match stored.iter_mut().find(|j| j.id == job.id) {
                    Some(existing) => {
                        if existing.schedule == job.schedule {
                            merged.next_fire_at = existing.next_fire_at;
                        }
                        merged.last_fired_at = existing.last_fired_at;
                        merged.created_at = existing.created_at;
                        *existing = merged;
                    }
                    None => stored.push(merged),
                }
            }
            let now = Utc::now();
            for job in stored.iter_mut() {
                schedule_missing(job, now);
            }
            Ok(stored.len())
        })?;
        log::info!("cron: {} jobs loaded", count);
        Ok(count)
    }

    pub async fn add_job(&self, mut job: CronJob) -> Result<CronJob, CronError> {
        job.schedule.validate()?;
        if job.id.trim().is_empty() {
            job.id = new_job_id();
        }
        job.next_fire_at = None;
        schedule_missing(&mut job, Utc::now());
        let mut jobs = self.jobs.lock().await;
        self.apply(&mut jobs, |stored| {
            if stored.iter().any(|j| j.id == job.id) {
                return Err(CronError::Duplicate(job.id.clone()));
            }
            stored.push(job.clone());
            Ok(())
        })?;
        log::info!(
            "cron: added job {} ({}), next fire {:?}",
            job.id,
            job.schedule.describe(),
            job.next_fire_at
        );
        Ok(job)
    }

    /// Returns false when no job had that id.
    pub async fn remove_job(&self, id: &str) -> Result<bool, CronError> {
        let mut jobs = self.jobs.lock().await;
        let removed = self.apply(&mut jobs, |stored| {
            let before = stored.len();
            stored.retain(|j| j.id != id);
            Ok(stored.len() != before)
        })?;
        if removed {
            log::info!("cron: removed job {}", id);
        }
        Ok(removed)
    }

    /// Re-enabling schedules the next slot from now; missed slots while disabled are not fired.
    pub async fn enable_job(&self, id: &str, enabled: bool) -> Result<CronJob, CronError> {
        let mut jobs = self.jobs.lock().await;
        self.apply(&mut jobs, |stored| {
            let job = stored
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| CronError::NotFound(id.to_string()))?;
            if job.enabled != enabled {
                job.enabled = enabled;
                job.next_fire_at = None;
                schedule_missing(job, Utc::now());
            }
            Ok(job.clone())
        })
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().await.values().cloned().collect()
    }

    /// Publish a job's turn immediately without touching its schedule. Returns the message id.
    pub async fn run_job_now(&self, id: &str) -> Result<String, CronError> {
        let mut jobs = self.jobs.lock().await;
        self.reload(&mut jobs, Utc::now());
        let job = jobs
            .get(id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        let msg = job.to_inbound(&self.sink_channel);
        let msg_id = msg.id.clone();
        self.bus.publish_inbound(msg).await?;
        let fired_at = Utc::now();
        self.apply(&mut jobs, |stored| {
            if let Some(job) = stored.iter_mut().find(|j| j.id == id) {
                job.last_fired_at = Some(fired_at);
            }
            Ok(())
        })?;
        log::info!("cron: job {} run manually", id);
        Ok(msg_id)
    }

    pub async fn tick(&self) -> Result<usize, CronError> {
        self.tick_at(Utc::now()).await
    }

    /// Fire every enabled job whose slot is at or before `now`, once, then move it to its next
    /// slot after `now`. A failed publish leaves the slot due so the next tick retries it.
    /// Returns how many jobs fired.
    ///
    /// Publishing happens without the store lock; afterwards only the fired jobs are updated
    /// in the store, so jobs added or removed meanwhile by another process are kept as they are.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize, CronError> {
        let mut jobs = self.jobs.lock().await;
        self.reload(&mut jobs, now);

        let due: Vec<CronJob> = jobs
            .values()
            .filter(|j| j.enabled && j.next_fire_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        let mut fired = Vec::new();
        for job in due {
            let msg = job.to_inbound(&self.sink_channel);
            let msg_id = msg.id.clone();
            if let Err(e) = self.bus.publish_inbound(msg).await {
                log::warn!("cron: job {} not published, retrying next tick: {}", job.id, e);
                continue;
            }
            log::info!(
                "cron: fired job {} for slot {:?} as {}",
                job.id,
                job.next_fire_at,
                msg_id
            );
            fired.push(job.id);
        }
        if fired.is_empty() {
            return Ok(0);
        }

        self.apply(&mut jobs, |stored| {
            let mut finished = Vec::new();
            for id in &fired {
                // Removed by another process while publishing: nothing to advance.
                let Some(job) = stored.iter_mut().find(|j| &j.id == id) else {
                    continue;
                };
                advance_after_fire(job, now);
                if job.schedule.is_one_shot() && job.delete_after_run {
                    finished.push(job.id.clone());
                }
            }
            stored.retain(|j| !finished.contains(&j.id));
            Ok(())
        })?;
        Ok(fired.len())
    }

    /// Tick on a fixed interval until shutdown is signalled.
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        log::info!("cron: service started (tick every {:?})", every);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        log::warn!("cron: tick failed: {}", e);
                    }
                }
            }
        }
        log::info!("cron: service stopped");
    }

    /// Pick up jobs edited in the store by another process (the CLI).
    fn reload(&self, jobs: &mut BTreeMap<String, CronJob>, now: DateTime<Utc>) {
        let Some(store) = &self.store else {
            return;
        };
        match store.load() {
            Ok(stored) => {
                jobs.clear();
                for mut job in stored {
                    schedule_missing(&mut job, now);
                    jobs.insert(job.id.clone(), job);
                }
            }
            Err(e) => log::warn!("cron: could not reload store, keeping jobs in memory: {}", e),
        }
    }

    /// Apply `f` to the current job list: read, modify and write the store under its lock,
    /// or the in-memory jobs when there is no store. `jobs` is refreshed from the result.
    /// An error from `f` leaves both untouched.
    fn apply<T>(
        &self,
        jobs: &mut BTreeMap<String, CronJob>,
        f: impl FnOnce(&mut Vec<CronJob>) -> Result<T, CronError>,
    ) -> Result<T, CronError> {
        let (out, current) = match &self.store {
            Some(store) => store.update(|stored| {
                let out = f(stored)?;
                Ok((out, stored.clone()))
            })?,
            None => {
                let mut current: Vec<CronJob> = jobs.values().cloned().collect();
                let out = f(&mut current)?;
                (out, current)
            }
        };
        jobs.clear();
        jobs.extend(current.into_iter().map(|j| (j.id.clone(), j)));
        Ok(out)
    }
}

/// Record a firing at `now` and move the job to its next slot. One-shot jobs are disabled.
fn advance_after_fire(job: &mut CronJob, now: DateTime<Utc>) {
    job.last_fired_at = Some(now);
    if job.schedule.is_one_shot() {
        job.next_fire_at = None;
        job.enabled = false;
        return;
    }
    match job.schedule.next_after(now) {
        Ok(next) => job.next_fire_at = next,
        Err(e) => {
            log::warn!("cron: job {} disabled: {}", job.id, e);
            job.enabled = false;
            job.next_fire_at = None;
        }
    }
}

/// Enabled jobs without a slot get their first one; invalid schedules disable the job.
fn schedule_missing(job: &mut CronJob, now: DateTime<Utc>) {
    if !job.enabled || job.next_fire_at.is_some() {
        return;
    }
    match job.schedule.first_fire(now) {
        Ok(next) => job.next_fire_at = next,
        Err(e) => {
            log::warn!("cron: job {} disabled: {}", job.id, e);
            job.enabled = false;
        }
    }
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InboundMessage;
    use crate::cron::CronSchedule;
    use chrono::TimeZone;

    fn bus() -> Arc<MessageBus> {
        Arc::new(MessageBus::new(16, 16, Some(Duration::from_millis(50)), 8))
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn add_assigns_id_and_first_slot() {
        let svc = CronService::new(bus(), None);
        let job = svc
            .add_job(CronJob::new("n", CronSchedule::Every { every_secs: 60 }, "ping"))
            .await
            .unwrap();
        assert_eq!(job.id.len(), 8);
        assert!(job.next_fire_at.is_some());
        assert!(matches!(
            svc.add_job(job.clone()).await,
            Err(CronError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn one_shot_disables_after_firing() {
        let bus = bus();
        let svc = CronService::new(bus.clone(), None);
        svc.add_job(
            CronJob::new("once", CronSchedule::At { at: at(9, 0) }, "remind").with_id("o1"),
        )
        .await
        .unwrap();
        assert_eq!(svc.tick_at(at(9, 5)).await.unwrap(), 1);
        assert_eq!(svc.tick_at(at(9, 6)).await.unwrap(), 0);
        let job = &svc.list_jobs().await[0];
        assert!(!job.enabled);
        assert!(job.next_fire_at.is_none());

        let msg = bus.subscribe_inbound().recv().await.unwrap();
        assert_eq!(msg.text, "remind");
        assert_eq!(msg.channel_id, CRON_CHANNEL_ID);
    }

    #[tokio::test]
    async fn one_shot_delete_after_run_is_removed() {
        let svc = CronService::new(bus(), None);
        let mut job = CronJob::new("once", CronSchedule::At { at: at(9, 0) }, "x").with_id("o2");
        job.delete_after_run = true;
        svc.add_job(job).await.unwrap();
        svc.tick_at(at(10, 0)).await.unwrap();
        assert!(svc.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn disabled_jobs_do_not_fire_and_reenable_schedules_forward() {
        let svc = CronService::new(bus(), None);
        svc.add_job(
            CronJob::new("n", CronSchedule::Every { every_secs: 60 }, "p").with_id("e1"),
        )
        .await
        .unwrap();
        svc.enable_job("e1", false).await.unwrap();
        let far = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(svc.tick_at(far).await.unwrap(), 0);
        let job = svc.enable_job("e1", true).await.unwrap();
        assert!(job.next_fire_at.unwrap() > Utc::now());
        assert!(matches!(
            svc.enable_job("missing", true).await,
            Err(CronError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn run_now_publishes_without_moving_slot() {
        let bus = bus();
        let svc = CronService::new(bus.clone(), None);
        let job = svc
            .add_job(CronJob::new("n", CronSchedule::Every { every_secs: 3600 }, "p").with_id("r1"))
            .await
            .unwrap();
        svc.run_job_now("r1").await.unwrap();
        let after = &svc.list_jobs().await[0];
        assert_eq!(after.next_fire_at, job.next_fire_at);
        assert!(after.last_fired_at.is_some());
        assert!(bus.subscribe_inbound().recv().await.unwrap().is_cron());
    }

    #[tokio::test]
    async fn failed_publish_keeps_slot_due() {
        let bus = Arc::new(MessageBus::new(1, 1, Some(Duration::from_millis(20)), 4));
        let svc = CronService::new(bus.clone(), None);
        let mut a = CronJob::new("a", CronSchedule::At { at: at(9, 0) }, "a").with_id("a");
        a.delete_after_run = true;
        let mut b = CronJob::new("b", CronSchedule::At { at: at(9, 0) }, "b").with_id("b");
        b.delete_after_run = true;
        svc.add_job(a).await.unwrap();
        svc.add_job(b).await.unwrap();

        // Capacity 1: the first publish fits, the second times out.
        assert_eq!(svc.tick_at(at(9, 1)).await.unwrap(), 1);
        assert_eq!(svc.list_jobs().await.len(), 1);

        let inbound = bus.subscribe_inbound();
        inbound.recv().await.unwrap();
        assert_eq!(svc.tick_at(at(9, 2)).await.unwrap(), 1);
        assert!(svc.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn store_edits_during_a_blocked_tick_are_kept() {
        let dir = std::env::temp_dir().join(format!("banobot-cron-race-{}", uuid::Uuid::new_v4()));
        let path = dir.join("jobs.json");
        let gateway_bus = Arc::new(MessageBus::new(1, 1, Some(Duration::from_secs(5)), 4));
        let gateway = Arc::new(CronService::new(gateway_bus.clone(), Some(CronStore::new(path.clone()))));
        gateway
            .add_job(CronJob::new("due", CronSchedule::At { at: at(9, 0) }, "p").with_id("due"))
            .await
            .unwrap();
        gateway
            .add_job(CronJob::new("gone", CronSchedule::Every { every_secs: 3600 }, "g").with_id("gone"))
            .await
            .unwrap();

        // Fill the inbound queue so the tick waits in publish.
        gateway_bus
            .publish_inbound(InboundMessage::new("test", "c1", "u1", "filler"))
            .await
            .unwrap();
        let ticking = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.tick_at(at(9, 1)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ticking.is_finished());

        let cli = CronService::new(bus(), Some(CronStore::new(path.clone())));
        cli.load(&[]).await.unwrap();
        cli.add_job(CronJob::new("cli", CronSchedule::Every { every_secs: 60 }, "q").with_id("cli-job"))
            .await
            .unwrap();
        assert!(cli.remove_job("gone").await.unwrap());

        let inbound = gateway_bus.subscribe_inbound();
        assert_eq!(inbound.recv().await.unwrap().text, "filler");
        assert_eq!(ticking.await.unwrap().unwrap(), 1);
        assert_eq!(inbound.recv().await.unwrap().text, "p");

        let stored = CronStore::new(path).load().unwrap();
        let ids: Vec<&str> = stored.iter().map(|j| j.id.as_str()).collect();
        assert!(ids.contains(&"cli-job"), "{:?}", ids);
        assert!(!ids.contains(&"gone"), "{:?}", ids);
        let due = stored.iter().find(|j| j.id == "due").unwrap();
        assert!(!due.enabled);
        assert_eq!(due.last_fired_at, Some(at(9, 1)));
        let listed: Vec<String> = gateway.list_jobs().await.into_iter().map(|j| j.id).collect();
        assert!(listed.contains(&"cli-job".to_string()));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn load_merges_configured_jobs_into_store() {
        let dir = std::env::temp_dir().join(format!("banobot-cron-svc-{}", uuid::Uuid::new_v4()));
        let store = CronStore::new(dir.join("jobs.json"));
        let stored = CronJob::new("old", CronSchedule::Every { every_secs: 60 }, "old prompt")
            .with_id("daily");
        store
            .update(|jobs| {
                jobs.push(stored);
                Ok(())
            })
            .unwrap();

        let svc = CronService::new(bus(), Some(store.clone()));
        let configured = vec![
            CronJob::new("daily", CronSchedule::Every { every_secs: 60 }, "new prompt")
                .with_id("daily"),
            CronJob::new("extra", CronSchedule::Every { every_secs: 120 }, "x").with_id("extra"),
        ];
        assert_eq!(svc.load(&configured).await.unwrap(), 2);
        let jobs = store.load().unwrap();
        assert_eq!(jobs.len(), 2);
        let daily = jobs.iter().find(|j| j.id == "daily").unwrap();
        assert_eq!(daily.prompt, "new prompt");
        assert!(daily.next_fire_at.is_some());
        let _ = std::fs::remove_dir_all(dir);
    }
}
