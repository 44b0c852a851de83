#![deny(missing_docs)]
//! jobs_core: shared building blocks (config, lease store, logging, job records, schedules).

/// Configuration helpers (AppId, dirs, load_or_init, env overrides).
pub mod cfg;
/// Lease store contract, filters, and the in-memory / filesystem engines.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Persistent record model shared by the daemon and tools.
pub mod job;
/// Cron, recurrence-object, and interval schedule parsing.
pub mod schedule;
