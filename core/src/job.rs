use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::store::{Kind, Record};

/// Successor fired when an execution completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Successor {
    /// Job to fire.
    #[serde(rename = "jobID")]
    pub job_id: String,
    /// Parameter overriding the successor's own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<Value>,
}

/// An operator-defined job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    /// Unique job id.
    #[serde(rename = "jobID")]
    pub job_id: String,
    /// Cron string, JSON recurrence object, or `"chain"`.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Fixed period (ms), used when no cron schedule applies.
    #[serde(default)]
    pub interval: Option<u64>,
    /// Handler module.
    pub module: String,
    /// Handler function within the module.
    pub function: String,
    /// Opaque payload handed to the handler.
    #[serde(default)]
    pub parameter: Option<Value>,
    /// Jobs fired when an execution of this job completes.
    #[serde(default)]
    pub successors: Vec<Successor>,
    /// Disabled definitions are never scheduled.
    #[serde(default = "yes")]
    pub enabled: bool,
    /// Latch preventing duplicate timer installation.
    #[serde(default)]
    pub scheduled: bool,
    /// Dispatch retry budget; the configured default applies when absent.
    #[serde(default)]
    pub max_retry_count: Option<u32>,
    /// Whether defunct executions are re-dispatched instead of failed.
    #[serde(default)]
    pub retry_enabled: bool,
}

fn yes() -> bool { true }

impl Record for JobDefinition {
    const KIND: Kind = Kind::JobDefinition;
}

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecState {
    /// Record created, not yet dispatched.
    #[serde(rename = "CREATED")]
    Created,
    /// Dispatched on the first attempt.
    #[serde(rename = "TRIGGERED")]
    Triggered,
    /// Dispatched after at least one retry.
    #[serde(rename = "RE-TRIGGERED")]
    ReTriggered,
    /// Dispatched through the manual path.
    #[serde(rename = "TRIGGERED_MANUALLY")]
    TriggeredManually,
    /// Dispatch failed; waiting for the next attempt.
    #[serde(rename = "RETRYING")]
    Retrying,
    /// Runner reported a heartbeat.
    #[serde(rename = "RUNNING")]
    Running,
    /// Finished successfully.
    #[serde(rename = "COMPLETED")]
    Completed,
    /// Finished unsuccessfully.
    #[serde(rename = "FAILED")]
    Failed,
    /// Runner chose not to run.
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl ExecState {
    /// States an execution never leaves.
    pub const TERMINAL: [ExecState; 3] = [ExecState::Completed, ExecState::Failed, ExecState::Skipped];

    /// Wire name, as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecState::Created => "CREATED",
            ExecState::Triggered => "TRIGGERED",
            ExecState::ReTriggered => "RE-TRIGGERED",
            ExecState::TriggeredManually => "TRIGGERED_MANUALLY",
            ExecState::Retrying => "RETRYING",
            ExecState::Running => "RUNNING",
            ExecState::Completed => "COMPLETED",
            ExecState::Failed => "FAILED",
            ExecState::Skipped => "SKIPPED",
        }
    }

    /// True for COMPLETED, FAILED, SKIPPED.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Parse a wire name.
    pub fn parse(s: &str) -> Option<ExecState> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExecState> for Value {
    fn from(s: ExecState) -> Self {
        Value::String(s.as_str().to_string())
    }
}

/// Why an execution exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    /// Fired by a schedule timer.
    Normal,
    /// Re-fired after a missed trigger was detected.
    Missed,
    /// Fired ad hoc (operator request or successor chaining).
    Manual,
}

/// One firing of a job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    /// Globally unique execution id.
    #[serde(rename = "executionID")]
    pub execution_id: String,
    /// Short suffix of the execution id, for logs.
    #[serde(rename = "execID")]
    pub exec_id: String,
    /// Owning definition.
    #[serde(rename = "jobID")]
    pub job_id: String,
    /// Copy of the definition's schedule.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Handler module.
    pub module: String,
    /// Handler function.
    pub function: String,
    /// Payload for this run.
    #[serde(default)]
    pub parameter: Option<Value>,
    /// Successors copied from the definition.
    #[serde(default)]
    pub successors: Vec<Successor>,
    /// Dispatch retry budget (resolved).
    pub max_retry_count: u32,
    /// Attempts beyond the first.
    #[serde(default)]
    pub retry_count: u32,
    /// Re-dispatch defunct runs instead of failing them.
    #[serde(default)]
    pub retry_enabled: bool,
    /// Current state.
    pub state: ExecState,
    /// Origin of the run.
    #[serde(rename = "type")]
    pub exec_type: ExecType,
    /// Fire time the run was created for.
    #[serde(with = "ts_milliseconds")]
    pub schedule_time: DateTime<Utc>,
    /// Record creation time.
    #[serde(with = "ts_milliseconds")]
    pub created_time: DateTime<Utc>,
    /// Last successful dispatch.
    #[serde(default, with = "ts_milliseconds_option")]
    pub trigger_time: Option<DateTime<Utc>>,
    /// When COMPLETED was recorded.
    #[serde(default, with = "ts_milliseconds_option")]
    pub completion_time: Option<DateTime<Utc>>,
    /// When FAILED was recorded.
    #[serde(default, with = "ts_milliseconds_option")]
    pub fail_time: Option<DateTime<Utc>>,
    /// Why the run failed.
    #[serde(default)]
    pub fail_reason: Option<String>,
    /// Why the last retry happened.
    #[serde(default)]
    pub retry_reason: Option<String>,
    /// Last state write; drives defunct detection.
    #[serde(with = "ts_milliseconds")]
    pub last_update_time: DateTime<Utc>,
    /// `host:port` of the dispatch target.
    #[serde(default)]
    pub runner: Option<String>,
    /// Next cron fire time while a timer is outstanding; drives missed-trigger detection.
    #[serde(default, with = "ts_milliseconds_option")]
    pub next_trigger_time: Option<DateTime<Utc>>,
    /// Opaque status reported by the handler.
    #[serde(default)]
    pub completion_status: Option<Value>,
}

impl Record for JobExecution {
    const KIND: Kind = Kind::JobExecution;
}

/// Worker instance lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunner {
    /// Process-unique id.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    /// Reachable hostname.
    pub hostname: String,
    /// Reachable port.
    pub port: u16,
    /// Last renewal.
    #[serde(with = "ts_milliseconds")]
    pub heartbeat_time: DateTime<Utc>,
}

impl JobRunner {
    /// `host:port` identity recorded on dispatched executions.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl Record for JobRunner {
    const KIND: Kind = Kind::JobRunner;
}

/// Leader election lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterLock {
    /// Name of the elected duty.
    pub lock_name: String,
    /// Holder's instance id.
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    /// Holder's `host:port`.
    pub ip_port: String,
    /// Fresh per acquisition; distinguishes successive holders.
    pub version: String,
    /// Last renewal.
    #[serde(with = "ts_milliseconds")]
    pub heartbeat_time: DateTime<Utc>,
}

impl Record for MasterLock {
    const KIND: Kind = Kind::MasterLock;
}

/// Leadership kill-switch: presence disables the named duty cluster-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterControl {
    /// Disabled duty.
    pub lock_name: String,
    /// Operator-supplied reason.
    #[serde(default)]
    pub reason: String,
    /// When the switch was set.
    #[serde(with = "ts_milliseconds")]
    pub last_updated_time: DateTime<Utc>,
}

impl Record for MasterControl {
    const KIND: Kind = Kind::MasterControl;
}

/// Encode a timestamp the way records store it, for filters and patches.
pub fn ts(t: DateTime<Utc>) -> Value {
    Value::from(t.timestamp_millis())
}
