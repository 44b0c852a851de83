use chrono::{DateTime, Utc};
use jobs_core::cfg::Config;
use jobs_core::job::{ExecState, ExecType, JobDefinition, JobExecution};
use jobs_core::schedule::JobSchedule;
use jobs_core::store::{Db, Filter, StoreError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, SchedulerEvent};
use crate::executions::{Executions, Outcome, Transition};
use crate::ms;
use crate::registry::RunnerPool;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no job runner available")]
    NoRunner,
    #[error("invalid runner url: {0}")]
    BadUrl(String),
    #[error("trigger request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("runner answered {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("no job definition with jobID {0}")]
    UnknownJob(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Inner {
    db: Db,
    executions: Executions,
    pool: RunnerPool,
    http: reqwest::Client,
    scheme: String,
    retry_delay: Duration,
    runner_tolerance: Duration,
    pool_max_age: Duration,
    events: EventBus,
}

/// Creates executions and pushes them to runners, retrying failed triggers
/// with a fixed delay up to the execution's retry budget.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(db: Db, events: EventBus, cfg: &Config) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(ms(cfg.http.trigger_timeout_ms))
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                executions: Executions::new(db.clone(), events.clone(), cfg.scheduler.default_max_retry_count),
                db,
                pool: RunnerPool::new(),
                http,
                scheme: cfg.http.runner_scheme.clone(),
                retry_delay: ms(cfg.scheduler.job_trigger_fail_retry_delay_ms),
                runner_tolerance: cfg.runner.tolerance(),
                pool_max_age: ms(cfg.scheduler.runner_update_interval_ms),
                events,
            }),
        })
    }

    pub fn executions(&self) -> &Executions {
        &self.inner.executions
    }

    pub fn pool(&self) -> &RunnerPool {
        &self.inner.pool
    }

    /// Reload the runner pool, pruning stale runners.
    pub async fn refresh_runners(&self) -> Result<usize, StoreError> {
        self.inner.pool.refresh(&self.inner.db, self.inner.runner_tolerance).await
    }

    /// Timer-driven (or missed-trigger) firing of `def` for `fire_time`.
    pub async fn execute_job(
        &self,
        def: &JobDefinition,
        fire_time: DateTime<Utc>,
        exec_type: ExecType,
        schedule: Option<&JobSchedule>,
    ) -> Result<ExecState, DispatchError> {
        let ex = &self.inner.executions;
        ex.clear_next_trigger(&def.job_id).await?;
        let next = schedule.and_then(|s| s.next_after(fire_time.max(Utc::now())));
        let exec = ex.build(def, fire_time, exec_type, def.parameter.clone(), next);
        ex.create(&exec).await?;
        info!(job = %exec.job_id, exec = %exec.exec_id, exec_type = ?exec_type, "executing job");
        self.dispatch(exec, false, None).await
    }

    /// Ad-hoc firing; `parameter` overrides the definition's own.
    pub async fn execute_now(&self, job_id: &str, parameter: Option<Value>) -> Result<ExecState, DispatchError> {
        let def = self
            .inner
            .db
            .find_one::<JobDefinition>(&Filter::eq("jobID", job_id))
            .await?
            .ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))?;
        if !self.inner.pool.is_fresh(self.inner.pool_max_age) {
            if let Err(e) = self.refresh_runners().await {
                warn!(error = %e, "runner pool refresh failed; using cached pool");
            }
        }
        let ex = &self.inner.executions;
        let exec = ex.build(&def, Utc::now(), ExecType::Manual, parameter.or_else(|| def.parameter.clone()), None);
        ex.create(&exec).await?;
        info!(job = %exec.job_id, exec = %exec.exec_id, "executing job manually");
        self.dispatch(exec, true, None).await
    }

    /// Re-dispatch an execution whose runner stopped reporting.
    pub async fn retry_defunct(&self, exec: JobExecution) -> Result<ExecState, DispatchError> {
        let manual = exec.exec_type == ExecType::Manual;
        self.dispatch(exec, manual, Some("missed heartbeat".to_string())).await
    }

    async fn dispatch(
        &self,
        mut exec: JobExecution,
        manual: bool,
        mut failure: Option<String>,
    ) -> Result<ExecState, DispatchError> {
        let ex = &self.inner.executions;
        loop {
            let reason = match failure.take() {
                Some(r) => r,
                None => match self.trigger(&exec).await {
                    Ok(runner) => {
                        let state = if exec.retry_count > 0 {
                            ExecState::ReTriggered
                        } else if manual {
                            ExecState::TriggeredManually
                        } else {
                            ExecState::Triggered
                        };
                        if !ex.mark_triggered(&exec, state, &runner).await? {
                            debug!(job = %exec.job_id, exec = %exec.exec_id, "runner already moved the execution on");
                        }
                        info!(job = %exec.job_id, exec = %exec.exec_id, %runner, state = %state, "job triggered");
                        return Ok(state);
                    }
                    Err(e) => {
                        warn!(job = %exec.job_id, exec = %exec.exec_id, error = %e, "trigger failed");
                        e.to_string()
                    }
                },
            };
            if exec.retry_count >= exec.max_retry_count {
                ex.mark_exhausted(&exec, &reason).await?;
                return Ok(ExecState::Failed);
            }
            if !ex.mark_retrying(&exec, &reason).await? {
                debug!(job = %exec.job_id, exec = %exec.exec_id, "execution finished elsewhere; dropping retry");
                return Ok(exec.state);
            }
            self.inner.events.emit(SchedulerEvent::RetryScheduled {
                job_id: exec.job_id.clone(),
                execution_id: exec.execution_id.clone(),
                retry_count: exec.retry_count,
            });
            sleep(self.inner.retry_delay).await;
            exec.state = ExecState::Retrying;
            exec.retry_count += 1;
            exec.retry_reason = Some(reason);
        }
    }

    /// One trigger attempt; returns the runner's `host:port` on a 2xx.
    async fn trigger(&self, exec: &JobExecution) -> Result<String, DispatchError> {
        let runner = self.inner.pool.next().ok_or(DispatchError::NoRunner)?;
        let base = format!("{}://{}:{}/", self.inner.scheme, runner.hostname, runner.port);
        let mut url = reqwest::Url::parse(&base).map_err(|e| DispatchError::BadUrl(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| DispatchError::BadUrl(base.clone()))?
            .pop_if_empty()
            .extend(["runJob", exec.job_id.as_str(), exec.execution_id.as_str()]);
        debug!(%url, "triggering runner");
        let resp = self.inner.http.get(url).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(runner.address());
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(DispatchError::Rejected { status: status.as_u16(), message })
    }

    pub async fn heartbeat(&self, execution_id: &str, status: Option<Value>) -> Result<Transition, StoreError> {
        self.inner.executions.heartbeat(execution_id, status).await
    }

    /// Mark COMPLETED and fire successors, once.
    pub async fn done(&self, execution_id: &str, status: Option<Value>) -> Result<Transition, StoreError> {
        let t = self.inner.executions.finish(execution_id, Outcome::Completed(status)).await?;
        if let Transition::Applied(exec) = &t {
            info!(job = %exec.job_id, exec = %exec.exec_id, "job completed");
            self.fire_successors(exec);
        }
        Ok(t)
    }

    pub async fn fail(&self, execution_id: &str, reason: &str, status: Option<Value>) -> Result<Transition, StoreError> {
        let t = self
            .inner
            .executions
            .finish(execution_id, Outcome::Failed { reason: reason.to_string(), status })
            .await?;
        if let Transition::Applied(exec) = &t {
            warn!(job = %exec.job_id, exec = %exec.exec_id, %reason, "job failed");
        }
        Ok(t)
    }

    pub async fn skip(&self, execution_id: &str, status: Option<Value>) -> Result<Transition, StoreError> {
        self.inner.executions.finish(execution_id, Outcome::Skipped(status)).await
    }

    fn fire_successors(&self, exec: &JobExecution) {
        for s in &exec.successors {
            let d = self.clone();
            let (job_id, parameter) = (s.job_id.clone(), s.parameter.clone());
            let parent = exec.job_id.clone();
            tokio::spawn(async move {
                debug!(%parent, successor = %job_id, "firing successor");
                if let Err(e) = d.execute_now(&job_id, parameter).await {
                    error!(%parent, successor = %job_id, error = %e, "successor could not be executed");
                }
            });
        }
    }
}
