use jobs_core::job::{ExecState, ExecType};
use tokio::sync::broadcast;

/// Observable scheduler happenings, for logs and test harnesses.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    BecameMaster { lock_name: String, instance_id: String },
    LostMaster { lock_name: String, instance_id: String },
    SchedulerStarted,
    SchedulerStopped,
    BecameRunner { instance_id: String },
    JobScheduled { job_id: String },
    ExecutionCreated { job_id: String, execution_id: String, exec_type: ExecType },
    StateChanged { job_id: String, execution_id: String, state: ExecState, retry_count: u32 },
    RetryScheduled { job_id: String, execution_id: String, retry_count: u32 },
    DefunctRetried { job_id: String, execution_id: String },
    MissedExecuted { job_id: String },
}

/// Broadcast bus; emitting with no subscribers is not an error.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: SchedulerEvent) {
        tracing::trace!(?event, "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}
