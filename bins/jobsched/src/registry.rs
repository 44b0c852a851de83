use chrono::Utc;
use jobs_core::cfg::RunnerConfig;
use jobs_core::job::{ts, JobRunner};
use jobs_core::store::{Db, Filter, StoreError};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::events::SchedulerEvent;
use crate::module::{Module, ModuleCtx};
use crate::ms;
use crate::node::Node;

#[derive(Default)]
struct PoolState {
    runners: Vec<JobRunner>,
    cursor: usize,
    refreshed_at: Option<Instant>,
}

/// Live runners known to this instance, handed out round-robin.
#[derive(Clone, Default)]
pub struct RunnerPool {
    state: Arc<Mutex<PoolState>>,
}

impl RunnerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pool. Order is by instance id so the rotation is stable across refreshes.
    pub fn set(&self, mut runners: Vec<JobRunner>) {
        runners.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        let mut st = self.state.lock();
        st.runners = runners;
        st.refreshed_at = Some(Instant::now());
    }

    /// Next runner in rotation; `None` when the pool is empty.
    pub fn next(&self) -> Option<JobRunner> {
        let mut st = self.state.lock();
        if st.runners.is_empty() {
            return None;
        }
        let i = st.cursor % st.runners.len();
        st.cursor = i + 1;
        Some(st.runners[i].clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<JobRunner> {
        self.state.lock().runners.clone()
    }

    /// True if refreshed within `max_age`.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.state
            .lock()
            .refreshed_at
            .map(|t| t.elapsed() <= max_age)
            .unwrap_or(false)
    }

    /// Reload from the store, deleting runners whose heartbeat is older than `tolerance`.
    pub async fn refresh(&self, db: &Db, tolerance: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(tolerance).unwrap_or(chrono::Duration::zero());
        let all = db.find::<JobRunner>(&Filter::All).await?;
        let (live, stale): (Vec<_>, Vec<_>) = all.into_iter().partition(|r| r.heartbeat_time >= cutoff);
        for r in &stale {
            // a renewal racing this delete keeps the record
            let filter = Filter::eq("instanceID", r.instance_id.as_str())
                .and(Filter::lt("heartbeatTime", ts(cutoff)));
            if db.delete::<JobRunner>(&filter).await? > 0 {
                info!(runner = %r.address(), instance = %r.instance_id, "removed stale runner");
            }
        }
        let n = live.len();
        self.set(live);
        debug!(runners = n, "runner pool refreshed");
        Ok(n)
    }
}

/// Keeps this instance's `JobRunner` lease alive.
pub struct RunnerAgent {
    node: Node,
    cfg: RunnerConfig,
}

impl RunnerAgent {
    pub fn new(node: Node, cfg: RunnerConfig) -> Self {
        Self { node, cfg }
    }

    fn own(&self) -> Filter {
        Filter::eq("instanceID", self.node.instance_id.as_str())
    }

    async fn register(&self, ctx: &ModuleCtx) -> Result<(), StoreError> {
        ctx.db.delete::<JobRunner>(&self.own()).await?;
        let rec = JobRunner {
            instance_id: self.node.instance_id.clone(),
            hostname: self.node.hostname.clone(),
            port: self.node.port,
            heartbeat_time: Utc::now(),
        };
        ctx.db.create(&rec).await?;
        info!(runner = %self.node.address(), instance = %self.node.instance_id, "registered as job runner");
        ctx.events.emit(SchedulerEvent::BecameRunner { instance_id: self.node.instance_id.clone() });
        Ok(())
    }

    /// `Ok(false)` when the record is gone (deleted as stale by someone else).
    async fn renew(&self, db: &Db) -> Result<bool, StoreError> {
        let n = db
            .update::<JobRunner>(&self.own(), json!({ "heartbeatTime": ts(Utc::now()) }))
            .await?;
        Ok(n > 0)
    }

    async fn run(self, mut ctx: ModuleCtx) -> anyhow::Result<()> {
        let interval = ms(self.cfg.heartbeat_interval_ms);
        'outer: loop {
            if let Err(e) = self.register(&ctx).await {
                warn!(error = %e, retry_in_ms = self.cfg.register_retry_interval_ms, "runner registration failed");
                tokio::select! {
                    _ = sleep(ms(self.cfg.register_retry_interval_ms)) => continue 'outer,
                    _ = ctx.stopped() => break 'outer,
                }
            }
            let mut failures = 0u32;
            let mut wait = interval;
            loop {
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = ctx.stopped() => break 'outer,
                }
                match self.renew(&ctx.db).await {
                    Ok(true) => {
                        failures = 0;
                        wait = interval;
                        continue;
                    }
                    Ok(false) => warn!(instance = %self.node.instance_id, "runner record missing"),
                    Err(e) => warn!(error = %e, "runner heartbeat failed"),
                }
                failures += 1;
                if failures > self.cfg.max_heartbeat_retry_count {
                    warn!(failures, "giving up on runner lease; re-registering");
                    if let Err(e) = ctx.db.delete::<JobRunner>(&self.own()).await {
                        debug!(error = %e, "could not delete own runner record");
                    }
                    tokio::select! {
                        _ = sleep(Duration::from_millis(200)) => continue 'outer,
                        _ = ctx.stopped() => break 'outer,
                    }
                }
                wait = ms(self.cfg.heartbeat_retry_delay_ms);
            }
        }
        if let Err(e) = ctx.db.delete::<JobRunner>(&self.own()).await {
            warn!(error = %e, "could not remove runner record on shutdown");
        }
        info!(instance = %self.node.instance_id, "runner stopping");
        Ok(())
    }
}

impl Module for RunnerAgent {
    fn name(&self) -> &'static str {
        "runner"
    }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use jobs_core::store::MemStore;

    fn runner(id: &str, age: chrono::Duration) -> JobRunner {
        JobRunner {
            instance_id: id.into(),
            hostname: format!("host-{id}"),
            port: 3000,
            heartbeat_time: Utc::now() - age,
        }
    }

    #[test]
    fn round_robin_rotates() {
        let pool = RunnerPool::new();
        assert!(pool.next().is_none());
        pool.set(vec![
            runner("c", chrono::Duration::zero()),
            runner("a", chrono::Duration::zero()),
            runner("b", chrono::Duration::zero()),
        ]);
        let picks: Vec<_> = (0..4).map(|_| pool.next().unwrap().instance_id).collect();
        assert_eq!(picks, ["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn refresh_drops_stale_runners() {
        let db = Db::new(MemStore::new());
        db.create(&runner("live", chrono::Duration::seconds(1))).await.unwrap();
        db.create(&runner("dead", chrono::Duration::seconds(600))).await.unwrap();
        let pool = RunnerPool::new();
        assert_eq!(pool.refresh(&db, Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(pool.snapshot()[0].instance_id, "live");
        assert!(pool.is_fresh(Duration::from_secs(5)));
        let left = db.find::<JobRunner>(&Filter::All).await.unwrap();
        assert_eq!(left.len(), 1);
    }

    #[tokio::test]
    async fn agent_registers_renews_and_cleans_up() {
        let db = Db::new(MemStore::new());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let ctx = ModuleCtx { db: db.clone(), events: EventBus::default(), shutdown: rx };
        let node = Node::new("localhost", 4000);
        let cfg = RunnerConfig { heartbeat_interval_ms: 20, ..RunnerConfig::default() };
        let handle = Box::new(RunnerAgent::new(node.clone(), cfg)).spawn(ctx);

        let mut first = None;
        for _ in 0..100 {
            if let Some(r) = db.find_one::<JobRunner>(&Filter::All).await.unwrap() {
                match first {
                    None => first = Some(r.heartbeat_time),
                    Some(t) if r.heartbeat_time > t => break,
                    _ => {}
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        let rec = db.find_one::<JobRunner>(&Filter::All).await.unwrap().unwrap();
        assert_eq!(rec.instance_id, node.instance_id);
        assert!(rec.heartbeat_time > first.unwrap());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(db.find::<JobRunner>(&Filter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn agent_reregisters_after_losing_its_record() {
        let db = Db::new(MemStore::new());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let ctx = ModuleCtx { db: db.clone(), events: EventBus::default(), shutdown: rx };
        let node = Node::new("localhost", 4001);
        let cfg = RunnerConfig {
            heartbeat_interval_ms: 10,
            heartbeat_retry_delay_ms: 5,
            max_heartbeat_retry_count: 1,
            ..RunnerConfig::default()
        };
        let handle = Box::new(RunnerAgent::new(node.clone(), cfg)).spawn(ctx);
        sleep(Duration::from_millis(50)).await;
        db.delete::<JobRunner>(&Filter::All).await.unwrap();

        let mut back = false;
        for _ in 0..100 {
            sleep(Duration::from_millis(10)).await;
            if db.find_one::<JobRunner>(&Filter::All).await.unwrap().is_some() {
                back = true;
                break;
            }
        }
        assert!(back);
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
