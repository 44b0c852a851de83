#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::Utc;
use jobs_core::cfg::Config;
use jobs_core::job::{JobDefinition, JobRunner};
use jobs_core::store::{Db, MemStore};
use jobsched::dispatcher::Dispatcher;
use jobsched::election::LeaderFlag;
use jobsched::events::EventBus;
use jobsched::handlers::HandlerRegistry;
use jobsched::node::Node;
use jobsched::web::{router, AppState};
use serde_json::Value;

/// Timings shrunk to tens of milliseconds.
pub fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.scheduler.runner_update_interval_ms = 50;
    cfg.scheduler.schedule_new_jobs_interval_ms = 50;
    cfg.scheduler.defunct_jobs_retry_interval_ms = 100;
    cfg.scheduler.defunct_tolerance_factor = 2;
    cfg.scheduler.job_trigger_fail_retry_delay_ms = 20;
    cfg.scheduler.missed_trigger_grace_ms = 50;
    cfg.election.init_delay_ms = 0;
    cfg.election.check_master_interval_ms = 50;
    cfg.election.heartbeat_interval_ms = 20;
    cfg.http.trigger_timeout_ms = 2_000;
    cfg
}

pub struct Cluster {
    pub cfg: Config,
    pub db: Db,
    pub store: MemStore,
    pub events: EventBus,
    pub dispatcher: Dispatcher,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(cfg: Config) -> Self {
        let store = MemStore::new();
        let db = Db::new(store.clone());
        let events = EventBus::default();
        let dispatcher = Dispatcher::new(db.clone(), events.clone(), &cfg).unwrap();
        Self { cfg, db, store, events, dispatcher }
    }

    pub async fn define(&self, v: Value) -> JobDefinition {
        let def: JobDefinition = serde_json::from_value(v).unwrap();
        self.db.create(&def).await.unwrap()
    }

    pub fn state(&self, handlers: HandlerRegistry, node: Node) -> AppState {
        AppState {
            db: self.db.clone(),
            dispatcher: self.dispatcher.clone(),
            handlers,
            node,
            lock_name: self.cfg.election.lock_name.clone(),
            leader: LeaderFlag::default(),
            is_runner: true,
            started: std::time::Instant::now(),
        }
    }

    /// Serve the HTTP API on an ephemeral port without registering a runner lease.
    pub async fn serve(&self, handlers: HandlerRegistry) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(self.state(handlers, Node::new("127.0.0.1", addr.port())));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Serve the runner endpoint and register its lease.
    pub async fn spawn_runner(&self, handlers: HandlerRegistry) -> JobRunner {
        let addr = self.serve(handlers).await;
        let rec = JobRunner {
            instance_id: uuid::Uuid::new_v4().to_string(),
            hostname: "127.0.0.1".into(),
            port: addr.port(),
            heartbeat_time: Utc::now(),
        };
        self.db.create(&rec).await.unwrap();
        self.dispatcher.refresh_runners().await.unwrap();
        rec
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the executions in the store satisfy `pred`; panics with the
/// last snapshot on timeout.
pub async fn wait_for_executions<P>(db: &Db, timeout: Duration, pred: P) -> Vec<jobs_core::job::JobExecution>
where
    P: Fn(&[jobs_core::job::JobExecution]) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let mut execs = db
            .find::<jobs_core::job::JobExecution>(&jobs_core::store::Filter::All)
            .await
            .unwrap();
        execs.sort_by_key(|e| e.created_time);
        if pred(&execs) {
            return execs;
        }
        if Instant::now() > deadline {
            panic!("condition not met; executions: {execs:#?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
