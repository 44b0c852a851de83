use chrono::Utc;
use jobs_core::cfg::ElectionConfig;
use jobs_core::job::{ts, MasterControl, MasterLock};
use jobs_core::store::{Db, Filter};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventBus, SchedulerEvent};
use crate::module::{Module, ModuleCtx};
use crate::ms;
use crate::node::Node;

/// Shared "this instance currently leads" flag, read by the status endpoint.
pub type LeaderFlag = Arc<AtomicBool>;

/// Duty run only while this instance holds the lease. Both calls must return promptly.
pub trait MasterJob: Send + Sync + 'static {
    fn start(&self);
    fn stop(&self);
}

/// Lease-based leader election over one `MasterLock` record.
pub struct Elector {
    node: Node,
    cfg: ElectionConfig,
    job: Arc<dyn MasterJob>,
    db: Db,
    events: EventBus,
    leader: LeaderFlag,
    heartbeat: Option<JoinHandle<()>>,
}

impl Elector {
    pub fn new(node: Node, cfg: ElectionConfig, job: Arc<dyn MasterJob>, db: Db, events: EventBus) -> Self {
        Self { node, cfg, job, db, events, leader: LeaderFlag::default(), heartbeat: None }
    }

    /// Share leadership state with a caller-owned flag.
    pub fn with_flag(mut self, leader: LeaderFlag) -> Self {
        self.leader = leader;
        self
    }

    pub fn is_leading(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// True while the lease heartbeat task is alive.
    pub fn is_renewing(&self) -> bool {
        self.heartbeat.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn lock_filter(&self) -> Filter {
        Filter::eq("lockName", self.cfg.lock_name.as_str())
    }

    /// One election round.
    pub async fn check(&mut self) {
        let control = match self.db.find_one::<MasterControl>(&self.lock_filter()).await {
            Ok(c) => c,
            Err(e) => {
                error!(lock = %self.cfg.lock_name, error = %e, "could not read master control");
                return;
            }
        };
        if let Some(c) = control {
            debug!(lock = %self.cfg.lock_name, reason = %c.reason, "master role disabled");
            if self.is_leading() {
                warn!(lock = %self.cfg.lock_name, "disabled while master; stepping down");
                self.step_down(true).await;
            }
            return;
        }

        let lock = match self.db.find_one::<MasterLock>(&self.lock_filter()).await {
            Ok(l) => l,
            Err(e) => {
                error!(lock = %self.cfg.lock_name, error = %e, "could not read master lock");
                return;
            }
        };
        match lock {
            None => {
                debug!(lock = %self.cfg.lock_name, "no master; contending");
                self.try_acquire().await;
            }
            Some(l) if self.is_stale(&l) => {
                info!(lock = %self.cfg.lock_name, holder = %l.ip_port, "master lock is stale; replacing");
                let filter = self.lock_filter().and(Filter::eq("version", l.version.as_str()));
                if let Err(e) = self.db.delete::<MasterLock>(&filter).await {
                    error!(lock = %self.cfg.lock_name, error = %e, "could not delete stale lock");
                    return;
                }
                self.step_down(false).await;
                self.try_acquire().await;
            }
            Some(l) if l.instance_id == self.node.instance_id => {
                debug!(lock = %self.cfg.lock_name, "I am master");
            }
            Some(l) => {
                if self.is_leading() {
                    warn!(lock = %self.cfg.lock_name, holder = %l.ip_port, "lock held by another instance; stepping down");
                    self.step_down(false).await;
                } else {
                    debug!(lock = %self.cfg.lock_name, holder = %l.ip_port, "master is alive");
                }
            }
        }
    }

    fn is_stale(&self, l: &MasterLock) -> bool {
        (Utc::now() - l.heartbeat_time)
            .to_std()
            .map(|age| age > self.cfg.tolerance())
            .unwrap_or(false)
    }

    async fn try_acquire(&mut self) {
        let lock = MasterLock {
            lock_name: self.cfg.lock_name.clone(),
            instance_id: self.node.instance_id.clone(),
            ip_port: self.node.address(),
            version: Uuid::new_v4().to_string(),
            heartbeat_time: Utc::now(),
        };
        match self.db.create(&lock).await {
            Ok(_) => {
                info!(lock = %self.cfg.lock_name, instance = %self.node.instance_id, "I am master");
                self.leader.store(true, Ordering::SeqCst);
                self.events.emit(SchedulerEvent::BecameMaster {
                    lock_name: self.cfg.lock_name.clone(),
                    instance_id: self.node.instance_id.clone(),
                });
                self.job.start();
                self.start_heartbeat(lock.version);
            }
            Err(e) if e.is_conflict() => debug!(lock = %self.cfg.lock_name, "lost the race for the lock"),
            Err(e) => error!(lock = %self.cfg.lock_name, error = %e, "could not create master lock"),
        }
    }

    fn start_heartbeat(&mut self, version: String) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
        let db = self.db.clone();
        let period = ms(self.cfg.heartbeat_interval_ms);
        let max = self.cfg.max_heartbeat_retry_count;
        let filter = self
            .lock_filter()
            .and(Filter::eq("instanceID", self.node.instance_id.as_str()))
            .and(Filter::eq("version", version.as_str()));
        let lock_name = self.cfg.lock_name.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failures = 0u32;
            loop {
                tick.tick().await;
                match db.update::<MasterLock>(&filter, json!({ "heartbeatTime": ts(Utc::now()) })).await {
                    Ok(n) if n > 0 => failures = 0,
                    Ok(_) => {
                        failures += 1;
                        warn!(lock = %lock_name, failures, "master lock not found for heartbeat");
                    }
                    Err(e) => {
                        failures += 1;
                        error!(lock = %lock_name, failures, error = %e, "master heartbeat failed");
                    }
                }
                if failures > max {
                    warn!(lock = %lock_name, "abandoning master heartbeat");
                    return;
                }
            }
        }));
    }

    /// Stop the duty and the lease heartbeat; `release` also deletes our lock.
    async fn step_down(&mut self, release: bool) {
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
        if self.leader.swap(false, Ordering::SeqCst) {
            self.job.stop();
            info!(lock = %self.cfg.lock_name, "no longer master");
            self.events.emit(SchedulerEvent::LostMaster {
                lock_name: self.cfg.lock_name.clone(),
                instance_id: self.node.instance_id.clone(),
            });
        }
        if release {
            let own = self.lock_filter().and(Filter::eq("instanceID", self.node.instance_id.as_str()));
            if let Err(e) = self.db.delete::<MasterLock>(&own).await {
                warn!(lock = %self.cfg.lock_name, error = %e, "could not release master lock");
            }
        }
    }

    /// Leave the election, releasing the lock if we hold it.
    pub async fn resign(&mut self) {
        self.step_down(true).await;
    }
}

/// Runs an [`Elector`] on a fixed check interval.
pub struct MasterElection {
    node: Node,
    cfg: ElectionConfig,
    job: Arc<dyn MasterJob>,
    leader: LeaderFlag,
}

impl MasterElection {
    pub fn new(node: Node, cfg: ElectionConfig, job: Arc<dyn MasterJob>, leader: LeaderFlag) -> Self {
        Self { node, cfg, job, leader }
    }
}

impl Module for MasterElection {
    fn name(&self) -> &'static str {
        "election"
    }

    fn spawn(self: Box<Self>, mut ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let this = *self;
            let init = ms(this.cfg.init_delay_ms);
            let period = ms(this.cfg.check_master_interval_ms);
            let mut elector = Elector::new(this.node, this.cfg, this.job, ctx.db.clone(), ctx.events.clone())
                .with_flag(this.leader);
            tokio::select! {
                _ = sleep(init) => {}
                _ = ctx.stopped() => return Ok(()),
            }
            let mut tick = interval_at(Instant::now(), period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => elector.check().await,
                    _ = ctx.stopped() => break,
                }
            }
            elector.resign().await;
            info!("election stopping");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs_core::store::MemStore;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl MasterJob for Counter {
        fn start(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn elector(db: &Db, job: Arc<Counter>) -> Elector {
        let cfg = ElectionConfig { heartbeat_interval_ms: 20, ..ElectionConfig::default() };
        Elector::new(Node::new("localhost", 3000), cfg, job, db.clone(), EventBus::default())
    }

    #[tokio::test]
    async fn store_outage_abandons_the_round() {
        let store = MemStore::new();
        let db = Db::new(store.clone());
        let job = Arc::new(Counter::default());
        let mut e = elector(&db, job.clone());
        store.set_available(false);
        e.check().await;
        assert!(!e.is_leading());
        store.set_available(true);
        e.check().await;
        assert!(e.is_leading());
        assert_eq!(job.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_keeps_lock_fresh() {
        let db = Db::new(MemStore::new());
        let mut e = elector(&db, Arc::new(Counter::default()));
        e.check().await;
        let before = db.find_one::<MasterLock>(&Filter::All).await.unwrap().unwrap().heartbeat_time;
        sleep(std::time::Duration::from_millis(70)).await;
        let after = db.find_one::<MasterLock>(&Filter::All).await.unwrap().unwrap().heartbeat_time;
        assert!(after > before);
        e.resign().await;
        assert!(db.find::<MasterLock>(&Filter::All).await.unwrap().is_empty());
    }
}
