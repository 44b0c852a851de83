use chrono::{DateTime, Utc};
use jobs_core::cfg::{Config, SchedulerConfig};
use jobs_core::job::{ExecType, JobDefinition, MasterControl};
use jobs_core::schedule::JobSchedule;
use jobs_core::store::{Db, Filter};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::election::MasterJob;
use crate::events::{EventBus, SchedulerEvent};
use crate::ms;
use crate::recovery::Recovery;

/// One leadership term: the supervisor loop plus the timers it installed.
struct Term {
    id: u64,
    supervisor: JoinHandle<()>,
    timers: HashMap<String, JoinHandle<()>>,
}

struct Shared {
    db: Db,
    dispatcher: Dispatcher,
    recovery: Recovery,
    cfg: SchedulerConfig,
    lock_name: String,
    events: EventBus,
    term: Mutex<Option<Term>>,
    terms: AtomicU64,
    enabled: AtomicBool,
    first_schedule: AtomicBool,
}

/// The leader's duty: installs timers for enabled definitions, keeps the
/// runner pool fresh and runs the recovery sweeps.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(db: Db, dispatcher: Dispatcher, cfg: &Config, events: EventBus) -> Self {
        let recovery = Recovery::new(db.clone(), dispatcher.clone(), cfg.scheduler.clone(), events.clone());
        Self {
            shared: Arc::new(Shared {
                db,
                dispatcher,
                recovery,
                cfg: cfg.scheduler.clone(),
                lock_name: cfg.election.lock_name.clone(),
                events,
                term: Mutex::new(None),
                terms: AtomicU64::new(0),
                enabled: AtomicBool::new(false),
                first_schedule: AtomicBool::new(true),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.term.lock().is_some()
    }

    /// False while the kill-switch is set (or before the first check).
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Jobs with a live timer.
    pub fn scheduled_jobs(&self) -> Vec<String> {
        let term = self.shared.term.lock();
        let mut ids: Vec<String> = term
            .as_ref()
            .map(|t| t.timers.iter().filter(|(_, h)| !h.is_finished()).map(|(k, _)| k.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

impl MasterJob for Scheduler {
    fn start(&self) {
        let mut term = self.shared.term.lock();
        if term.is_some() {
            return;
        }
        let id = self.shared.terms.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.enabled.store(false, Ordering::SeqCst);
        self.shared.first_schedule.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let supervisor = tokio::spawn(async move { shared.run(id).await });
        *term = Some(Term { id, supervisor, timers: HashMap::new() });
        info!(term = id, "scheduler started");
        self.shared.events.emit(SchedulerEvent::SchedulerStarted);
    }

    fn stop(&self) {
        let Some(term) = self.shared.term.lock().take() else {
            return;
        };
        term.supervisor.abort();
        let n = term.timers.len();
        for (_, t) in term.timers {
            t.abort();
        }
        self.shared.enabled.store(false, Ordering::SeqCst);
        info!(term = term.id, timers = n, "scheduler stopped");
        self.shared.events.emit(SchedulerEvent::SchedulerStopped);
    }
}

impl Shared {
    async fn run(self: Arc<Self>, term: u64) {
        self.check_master_control(term).await;
        self.refresh_runners().await;
        self.schedule_jobs(term).await;
        self.recover().await;

        let every = |v: u64| {
            let p = ms(v);
            let mut i = interval_at(Instant::now() + p, p);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        };
        let mut runners = every(self.cfg.runner_update_interval_ms);
        let mut new_jobs = every(self.cfg.schedule_new_jobs_interval_ms);
        let mut defunct = every(self.cfg.defunct_jobs_retry_interval_ms);
        loop {
            tokio::select! {
                _ = runners.tick() => {
                    self.check_master_control(term).await;
                    self.refresh_runners().await;
                }
                _ = new_jobs.tick() => self.schedule_jobs(term).await,
                _ = defunct.tick() => self.recover().await,
            }
        }
    }

    async fn check_master_control(&self, term: u64) {
        match self.db.find_one::<MasterControl>(&Filter::eq("lockName", self.lock_name.as_str())).await {
            Ok(Some(c)) => {
                if self.enabled.swap(false, Ordering::SeqCst) {
                    warn!(lock = %self.lock_name, reason = %c.reason, "scheduling disabled; cancelling timers");
                }
                self.cancel_timers(term);
            }
            Ok(None) => {
                if !self.enabled.swap(true, Ordering::SeqCst) {
                    info!(lock = %self.lock_name, "scheduling enabled");
                    self.first_schedule.store(true, Ordering::SeqCst);
                }
            }
            Err(e) => error!(error = %e, "could not read master control"),
        }
    }

    async fn refresh_runners(&self) {
        if let Err(e) = self.dispatcher.refresh_runners().await {
            error!(error = %e, "could not refresh runner pool");
        }
    }

    async fn recover(&self) {
        if self.enabled.load(Ordering::SeqCst) {
            self.recovery.sweep().await;
        }
    }

    /// First sweep of a term (re)installs every enabled job; later sweeps only
    /// pick up jobs not yet latched as scheduled.
    async fn schedule_jobs(self: &Arc<Self>, term: u64) {
        if !self.enabled.load(Ordering::SeqCst) {
            debug!("scheduling disabled; skipping sweep");
            return;
        }
        let first = self.first_schedule.swap(false, Ordering::SeqCst);
        let mut filter = Filter::eq("enabled", true);
        if !first {
            filter = filter.and(Filter::eq("scheduled", false));
        }
        let defs = match self.db.find::<JobDefinition>(&filter).await {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "could not load job definitions");
                if first {
                    self.first_schedule.store(true, Ordering::SeqCst);
                }
                return;
            }
        };
        for def in defs {
            self.schedule_job(term, def).await;
        }
    }

    async fn schedule_job(self: &Arc<Self>, term: u64, def: JobDefinition) {
        let schedule = match JobSchedule::from_definition(&def) {
            Ok(s) => s,
            Err(e) => {
                warn!(job = %def.job_id, error = %e, "cannot schedule job");
                return;
            }
        };
        let latch = self
            .db
            .update::<JobDefinition>(&Filter::eq("jobID", def.job_id.as_str()), json!({ "scheduled": true }))
            .await;
        match latch {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                error!(job = %def.job_id, error = %e, "could not mark job scheduled");
                return;
            }
        }
        let job_id = def.job_id.clone();
        let handle = match schedule {
            JobSchedule::Chain => {
                debug!(job = %job_id, "chain job; runs only as a successor");
                return;
            }
            JobSchedule::Cron(_) => tokio::spawn(cron_timer(self.clone(), job_id.clone(), schedule)),
            JobSchedule::Interval(p) => tokio::spawn(interval_timer(self.clone(), job_id.clone(), p)),
        };
        let mut guard = self.term.lock();
        match guard.as_mut() {
            Some(t) if t.id == term => {
                if let Some(old) = t.timers.insert(job_id.clone(), handle) {
                    old.abort();
                }
            }
            _ => {
                handle.abort();
                return;
            }
        }
        drop(guard);
        info!(job = %job_id, "job scheduled");
        self.events.emit(SchedulerEvent::JobScheduled { job_id });
    }

    fn cancel_timers(&self, term: u64) {
        let mut guard = self.term.lock();
        if let Some(t) = guard.as_mut().filter(|t| t.id == term) {
            for (_, h) in t.timers.drain() {
                h.abort();
            }
        }
    }

    /// Fire one execution from a timer. Returns false when the timer should retire.
    async fn fire(&self, job_id: &str, fire_time: DateTime<Utc>, schedule: Option<&JobSchedule>) -> bool {
        let by_id = Filter::eq("jobID", job_id);
        let def = match self.db.find_one::<JobDefinition>(&by_id).await {
            Ok(Some(d)) if d.enabled => d,
            Ok(Some(_)) => {
                info!(job = %job_id, "job disabled; retiring timer");
                if let Err(e) = self.db.update::<JobDefinition>(&by_id, json!({ "scheduled": false })).await {
                    warn!(job = %job_id, error = %e, "could not clear scheduled flag");
                }
                return false;
            }
            Ok(None) => {
                info!(job = %job_id, "job removed; retiring timer");
                return false;
            }
            Err(e) => {
                error!(job = %job_id, error = %e, "could not load job; skipping this fire");
                return true;
            }
        };
        let d = self.dispatcher.clone();
        let schedule = schedule.cloned();
        tokio::spawn(async move {
            if let Err(e) = d.execute_job(&def, fire_time, ExecType::Normal, schedule.as_ref()).await {
                error!(job = %def.job_id, error = %e, "execution failed");
            }
        });
        true
    }
}

async fn cron_timer(shared: Arc<Shared>, job_id: String, schedule: JobSchedule) {
    let mut last = Utc::now();
    loop {
        let now = Utc::now().max(last);
        let Some(next) = schedule.next_after(now) else {
            info!(job = %job_id, "schedule has no further fire times");
            return;
        };
        sleep((next - Utc::now()).to_std().unwrap_or_default()).await;
        last = next;
        if !shared.fire(&job_id, next, Some(&schedule)).await {
            return;
        }
    }
}

async fn interval_timer(shared: Arc<Shared>, job_id: String, period: std::time::Duration) {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        if !shared.fire(&job_id, Utc::now(), None).await {
            return;
        }
    }
}
