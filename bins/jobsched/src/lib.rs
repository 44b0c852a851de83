//! jobsched: lease-elected distributed job scheduler.
//!
//! One instance per lock name wins the `MasterLock` lease and runs the
//! scheduling engine; every instance may register as a runner and execute
//! dispatched jobs. Leadership is advisory under clock skew: brief dual
//! leadership during failover is possible, so job effects should be idempotent.

pub mod definitions;
pub mod dispatcher;
pub mod election;
pub mod engine;
pub mod events;
pub mod executions;
pub mod handlers;
pub mod module;
pub mod node;
pub mod recovery;
pub mod registry;
pub mod web;

use std::time::Duration;

pub(crate) fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}
