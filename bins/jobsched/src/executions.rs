use chrono::{DateTime, Utc};
use jobs_core::job::{ts, ExecState, ExecType, JobDefinition, JobExecution};
use jobs_core::store::{Db, Filter, StoreError};
use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::events::{EventBus, SchedulerEvent};

/// Every state an execution can still leave.
pub const NON_TERMINAL: [ExecState; 6] = [
    ExecState::Created,
    ExecState::Triggered,
    ExecState::ReTriggered,
    ExecState::TriggeredManually,
    ExecState::Retrying,
    ExecState::Running,
];

/// States a runner heartbeat may move to RUNNING.
pub const DISPATCHED: [ExecState; 4] = [
    ExecState::Triggered,
    ExecState::ReTriggered,
    ExecState::TriggeredManually,
    ExecState::Running,
];

pub const DEFUNCT_REASON: &str = "no heartbeat (and retry is disabled)";

/// Terminal status reported by a runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Option<Value>),
    Failed { reason: String, status: Option<Value> },
    Skipped(Option<Value>),
}

impl Outcome {
    fn state(&self) -> ExecState {
        match self {
            Outcome::Completed(_) => ExecState::Completed,
            Outcome::Failed { .. } => ExecState::Failed,
            Outcome::Skipped(_) => ExecState::Skipped,
        }
    }
}

/// Result of a runner-side state write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Box<JobExecution>),
    AlreadyTerminal(ExecState),
    /// Not terminal, but not in a state the write may leave.
    Rejected(ExecState),
    Unknown,
}

/// State-transition writes for `JobExecution` records. Every write is guarded
/// by the states it may leave, so terminal records are never rewritten.
#[derive(Clone, Debug)]
pub struct Executions {
    db: Db,
    events: EventBus,
    default_max_retry: u32,
}

impl Executions {
    pub fn new(db: Db, events: EventBus, default_max_retry: u32) -> Self {
        Self { db, events, default_max_retry }
    }

    /// A fresh CREATED record carrying everything needed to run without the definition.
    pub fn build(
        &self,
        def: &JobDefinition,
        fire_time: DateTime<Utc>,
        exec_type: ExecType,
        parameter: Option<Value>,
        next_trigger_time: Option<DateTime<Utc>>,
    ) -> JobExecution {
        let execution_id = Uuid::new_v4().to_string();
        let exec_id = execution_id[execution_id.len() - 6..].to_string();
        let now = Utc::now();
        JobExecution {
            execution_id,
            exec_id,
            job_id: def.job_id.clone(),
            schedule: def.schedule.clone(),
            module: def.module.clone(),
            function: def.function.clone(),
            parameter,
            successors: def.successors.clone(),
            // an explicit 0 disables retries; only an absent value takes the default
            max_retry_count: def.max_retry_count.unwrap_or(self.default_max_retry),
            retry_count: 0,
            retry_enabled: def.retry_enabled,
            state: ExecState::Created,
            exec_type,
            schedule_time: fire_time,
            created_time: now,
            trigger_time: None,
            completion_time: None,
            fail_time: None,
            fail_reason: None,
            retry_reason: None,
            last_update_time: now,
            runner: None,
            next_trigger_time,
            completion_status: None,
        }
    }

    pub async fn create(&self, exec: &JobExecution) -> Result<(), StoreError> {
        self.db.create(exec).await?;
        debug!(job = %exec.job_id, exec = %exec.exec_id, exec_type = ?exec.exec_type, "execution created");
        self.events.emit(SchedulerEvent::ExecutionCreated {
            job_id: exec.job_id.clone(),
            execution_id: exec.execution_id.clone(),
            exec_type: exec.exec_type,
        });
        Ok(())
    }

    /// Forget outstanding next-trigger baselines of a job; a fire is happening now.
    pub async fn clear_next_trigger(&self, job_id: &str) -> Result<u64, StoreError> {
        self.db
            .update::<JobExecution>(
                &Filter::eq("jobID", job_id).and(Filter::neq("nextTriggerTime", Value::Null)),
                json!({ "nextTriggerTime": null }),
            )
            .await
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<JobExecution>, StoreError> {
        self.db.find_one(&Filter::eq("executionID", execution_id)).await
    }

    pub async fn list(&self, filter: &Filter) -> Result<Vec<JobExecution>, StoreError> {
        let mut out = self.db.find::<JobExecution>(filter).await?;
        out.sort_by_key(|e| e.created_time);
        Ok(out)
    }

    async fn transition(
        &self,
        exec: &JobExecution,
        from: &[ExecState],
        to: ExecState,
        mut patch: Map<String, Value>,
    ) -> Result<bool, StoreError> {
        patch.insert("state".into(), to.into());
        patch.insert("lastUpdateTime".into(), ts(Utc::now()));
        let filter = Filter::eq("executionID", exec.execution_id.as_str())
            .and(Filter::any_of("state", from.iter().copied()));
        let retry_count = patch
            .get("retryCount")
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(exec.retry_count);
        let n = self.db.update::<JobExecution>(&filter, Value::Object(patch)).await?;
        if n == 0 {
            return Ok(false);
        }
        debug!(job = %exec.job_id, exec = %exec.exec_id, state = %to, "state updated");
        self.events.emit(SchedulerEvent::StateChanged {
            job_id: exec.job_id.clone(),
            execution_id: exec.execution_id.clone(),
            state: to,
            retry_count,
        });
        Ok(true)
    }

    /// CREATED/RETRYING -> TRIGGERED | RE-TRIGGERED | TRIGGERED_MANUALLY.
    pub async fn mark_triggered(&self, exec: &JobExecution, state: ExecState, runner: &str) -> Result<bool, StoreError> {
        let mut patch = Map::new();
        patch.insert("triggerTime".into(), ts(Utc::now()));
        patch.insert("runner".into(), runner.into());
        patch.insert("retryCount".into(), exec.retry_count.into());
        if let Some(reason) = &exec.retry_reason {
            patch.insert("retryReason".into(), reason.as_str().into());
        }
        if self.transition(exec, &[ExecState::Created, ExecState::Retrying], state, patch.clone()).await? {
            return Ok(true);
        }
        // the runner reported first; still record where it went
        patch.retain(|k, _| k == "triggerTime" || k == "runner");
        self.db
            .update::<JobExecution>(&Filter::eq("executionID", exec.execution_id.as_str()), Value::Object(patch))
            .await?;
        Ok(false)
    }

    /// Any non-terminal -> RETRYING. Callers guarantee `retry_count < max_retry_count`.
    pub async fn mark_retrying(&self, exec: &JobExecution, reason: &str) -> Result<bool, StoreError> {
        let mut patch = Map::new();
        patch.insert("retryCount".into(), exec.retry_count.into());
        patch.insert("retryReason".into(), reason.into());
        self.transition(exec, &NON_TERMINAL, ExecState::Retrying, patch).await
    }

    /// Retry budget exhausted -> FAILED.
    pub async fn mark_exhausted(&self, exec: &JobExecution, reason: &str) -> Result<bool, StoreError> {
        error!(
            job = %exec.job_id, exec = %exec.exec_id, max = exec.max_retry_count, %reason,
            "reached maxRetryCount; will not retry"
        );
        self.mark_failed(exec, &format!("reached maxRetryCount ({})", exec.max_retry_count), Some(reason))
            .await
    }

    /// Defunct with retry disabled -> FAILED.
    pub async fn mark_defunct_failed(&self, exec: &JobExecution) -> Result<bool, StoreError> {
        warn!(job = %exec.job_id, exec = %exec.exec_id, "marking defunct execution FAILED");
        self.mark_failed(exec, DEFUNCT_REASON, None).await
    }

    async fn mark_failed(&self, exec: &JobExecution, fail_reason: &str, retry_reason: Option<&str>) -> Result<bool, StoreError> {
        let mut patch = Map::new();
        patch.insert("failTime".into(), ts(Utc::now()));
        patch.insert("failReason".into(), fail_reason.into());
        patch.insert("retryCount".into(), exec.retry_count.into());
        if let Some(r) = retry_reason {
            patch.insert("retryReason".into(), r.into());
        }
        self.transition(exec, &NON_TERMINAL, ExecState::Failed, patch).await
    }

    /// Runner heartbeat: TRIGGERED | RE-TRIGGERED | TRIGGERED_MANUALLY | RUNNING -> RUNNING.
    /// A heartbeat racing ahead of the dispatcher's trigger write is rejected.
    pub async fn heartbeat(&self, execution_id: &str, status: Option<Value>) -> Result<Transition, StoreError> {
        let mut patch = Map::new();
        if let Some(s) = status {
            patch.insert("completionStatus".into(), s);
        }
        self.runner_write(execution_id, &DISPATCHED, ExecState::Running, patch).await
    }

    /// Runner-reported terminal status: any non-terminal -> COMPLETED | FAILED | SKIPPED.
    /// Handlers that never heartbeat finish straight from a triggered state, and a
    /// fast handler may finish before the trigger write lands.
    pub async fn finish(&self, execution_id: &str, outcome: Outcome) -> Result<Transition, StoreError> {
        let state = outcome.state();
        let now = ts(Utc::now());
        let mut patch = Map::new();
        match outcome {
            Outcome::Completed(status) | Outcome::Skipped(status) => {
                if state == ExecState::Completed {
                    patch.insert("completionTime".into(), now);
                }
                if let Some(s) = status {
                    patch.insert("completionStatus".into(), s);
                }
            }
            Outcome::Failed { reason, status } => {
                patch.insert("failTime".into(), now);
                patch.insert("failReason".into(), reason.into());
                if let Some(s) = status {
                    patch.insert("completionStatus".into(), s);
                }
            }
        }
        self.runner_write(execution_id, &NON_TERMINAL, state, patch).await
    }

    async fn runner_write(
        &self,
        execution_id: &str,
        from: &[ExecState],
        to: ExecState,
        patch: Map<String, Value>,
    ) -> Result<Transition, StoreError> {
        let Some(exec) = self.get(execution_id).await? else {
            return Ok(Transition::Unknown);
        };
        if exec.state.is_terminal() {
            return Ok(Transition::AlreadyTerminal(exec.state));
        }
        if !from.contains(&exec.state) {
            return Ok(Transition::Rejected(exec.state));
        }
        if !self.transition(&exec, from, to, patch).await? {
            // lost a race with another write
            let state = self.get(execution_id).await?.map(|e| e.state).unwrap_or(to);
            return Ok(if state.is_terminal() {
                Transition::AlreadyTerminal(state)
            } else {
                Transition::Rejected(state)
            });
        }
        let updated = self.get(execution_id).await?.unwrap_or(exec);
        Ok(Transition::Applied(Box::new(updated)))
    }
}
