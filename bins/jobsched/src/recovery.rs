use chrono::Utc;
use jobs_core::cfg::SchedulerConfig;
use jobs_core::job::{ts, ExecState, ExecType, JobDefinition, JobExecution};
use jobs_core::schedule::JobSchedule;
use jobs_core::store::{Db, Filter, StoreError};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::events::{EventBus, SchedulerEvent};

/// Leader-side sweeps for executions whose runner went quiet and for cron
/// fires that never happened.
#[derive(Clone)]
pub struct Recovery {
    db: Db,
    dispatcher: Dispatcher,
    cfg: SchedulerConfig,
    events: EventBus,
}

impl Recovery {
    pub fn new(db: Db, dispatcher: Dispatcher, cfg: SchedulerConfig, events: EventBus) -> Self {
        Self { db, dispatcher, cfg, events }
    }

    pub async fn sweep(&self) {
        if let Err(e) = self.retry_defunct().await {
            error!(error = %e, "defunct execution sweep failed");
        }
        if let Err(e) = self.execute_missed().await {
            error!(error = %e, "missed trigger sweep failed");
        }
    }

    /// Non-terminal executions not updated within the tolerance are re-dispatched
    /// (retry enabled) or failed. Returns how many were handled.
    pub async fn retry_defunct(&self) -> Result<usize, StoreError> {
        let tolerance = chrono::Duration::from_std(self.cfg.defunct_tolerance()).unwrap_or_else(|_| chrono::Duration::days(3650));
        let cutoff = Utc::now() - tolerance;
        let filter = ExecState::TERMINAL
            .iter()
            .fold(Filter::All, |f, s| f.and(Filter::neq("state", *s)))
            .and(Filter::lt("lastUpdateTime", ts(cutoff)));
        let defunct = self.db.find::<JobExecution>(&filter).await?;
        let n = defunct.len();
        for exec in defunct {
            if exec.retry_enabled {
                warn!(job = %exec.job_id, exec = %exec.exec_id, state = %exec.state, "retrying defunct execution");
                self.events.emit(SchedulerEvent::DefunctRetried {
                    job_id: exec.job_id.clone(),
                    execution_id: exec.execution_id.clone(),
                });
                let d = self.dispatcher.clone();
                tokio::spawn(async move {
                    let (job, id) = (exec.job_id.clone(), exec.exec_id.clone());
                    if let Err(e) = d.retry_defunct(exec).await {
                        error!(%job, exec = %id, error = %e, "defunct retry failed");
                    }
                });
            } else if let Err(e) = self.dispatcher.executions().mark_defunct_failed(&exec).await {
                error!(job = %exec.job_id, exec = %exec.exec_id, error = %e, "could not fail defunct execution");
            }
        }
        if n > 0 {
            info!(count = n, "handled defunct executions");
        }
        Ok(n)
    }

    /// Executions whose recorded next fire time passed by more than the grace
    /// window trigger one MISSED execution each. Returns how many were fired.
    pub async fn execute_missed(&self) -> Result<usize, StoreError> {
        let grace = chrono::Duration::milliseconds(self.cfg.missed_trigger_grace_ms as i64);
        let cutoff = Utc::now() - grace;
        let filter = Filter::neq("nextTriggerTime", Value::Null).and(Filter::lt("nextTriggerTime", ts(cutoff)));
        let overdue = self.db.find::<JobExecution>(&filter).await?;
        let mut fired = 0;
        for exec in overdue {
            // claiming the baseline makes each miss fire at most once
            let claim = Filter::eq("executionID", exec.execution_id.as_str())
                .and(Filter::neq("nextTriggerTime", Value::Null));
            if self.db.update::<JobExecution>(&claim, json!({ "nextTriggerTime": null })).await? == 0 {
                continue;
            }
            let def = match self.db.find_one::<JobDefinition>(&Filter::eq("jobID", exec.job_id.as_str())).await? {
                Some(d) if d.enabled => d,
                Some(_) => {
                    debug!(job = %exec.job_id, "missed trigger of a disabled job ignored");
                    continue;
                }
                None => {
                    warn!(job = %exec.job_id, "missed trigger of a removed job ignored");
                    continue;
                }
            };
            warn!(job = %def.job_id, expected = ?exec.next_trigger_time, "executing missed trigger");
            let schedule = JobSchedule::from_definition(&def).ok();
            let d = self.dispatcher.clone();
            self.events.emit(SchedulerEvent::MissedExecuted { job_id: def.job_id.clone() });
            tokio::spawn(async move {
                if let Err(e) = d.execute_job(&def, Utc::now(), ExecType::Missed, schedule.as_ref()).await {
                    error!(job = %def.job_id, error = %e, "missed execution failed");
                }
            });
            fired += 1;
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs_core::cfg::Config;
    use jobs_core::store::MemStore;

    fn recovery(db: &Db) -> Recovery {
        let mut cfg = Config::default();
        cfg.scheduler.defunct_jobs_retry_interval_ms = 100;
        cfg.scheduler.defunct_tolerance_factor = 1;
        cfg.scheduler.job_trigger_fail_retry_delay_ms = 5;
        let events = EventBus::default();
        let d = Dispatcher::new(db.clone(), events.clone(), &cfg).unwrap();
        Recovery::new(db.clone(), d, cfg.scheduler, events)
    }

    fn def(retry_enabled: bool) -> JobDefinition {
        serde_json::from_value(json!({
            "jobID": "J1", "interval": 1000, "module": "m", "function": "f",
            "retryEnabled": retry_enabled, "maxRetryCount": 0
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn stale_execution_without_retry_fails() {
        let db = Db::new(MemStore::new());
        let r = recovery(&db);
        let mut e = r.dispatcher.executions().build(&def(false), Utc::now(), ExecType::Normal, None, None);
        e.state = ExecState::Triggered;
        e.last_update_time = Utc::now() - chrono::Duration::seconds(10);
        db.create(&e).await.unwrap();
        let mut done = r.dispatcher.executions().build(&def(false), Utc::now(), ExecType::Normal, None, None);
        done.state = ExecState::Completed;
        done.last_update_time = e.last_update_time;
        db.create(&done).await.unwrap();

        assert_eq!(r.retry_defunct().await.unwrap(), 1);
        let got = r.dispatcher.executions().get(&e.execution_id).await.unwrap().unwrap();
        assert_eq!(got.state, ExecState::Failed);
        assert_eq!(got.fail_reason.as_deref(), Some(crate::executions::DEFUNCT_REASON));
    }

    #[tokio::test]
    async fn fresh_executions_are_left_alone() {
        let db = Db::new(MemStore::new());
        let r = recovery(&db);
        let mut e = r.dispatcher.executions().build(&def(true), Utc::now(), ExecType::Normal, None, None);
        e.state = ExecState::Running;
        db.create(&e).await.unwrap();
        assert_eq!(r.retry_defunct().await.unwrap(), 0);
        assert_eq!(r.execute_missed().await.unwrap(), 0);
    }
}
