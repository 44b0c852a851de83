mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{wait_for_executions, Cluster};
use jobs_core::job::{ExecState, ExecType};
use jobsched::events::SchedulerEvent;
use jobsched::executions::Transition;
use jobsched::handlers::HandlerRegistry;
use parking_lot::Mutex;
use serde_json::{json, Value};

#[tokio::test]
async fn trigger_without_runners_retries_then_fails() {
    let c = Cluster::new();
    let def = c
        .define(json!({"jobID": "J1", "interval": 1000, "module": "builtin", "function": "noop", "maxRetryCount": 2}))
        .await;
    let mut rx = c.events.subscribe();

    let state = c.dispatcher.execute_job(&def, Utc::now(), ExecType::Normal, None).await.unwrap();
    assert_eq!(state, ExecState::Failed);

    let mut transitions = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let SchedulerEvent::StateChanged { state, retry_count, .. } = ev {
            transitions.push((state, retry_count));
        }
    }
    assert_eq!(
        transitions,
        [(ExecState::Retrying, 0), (ExecState::Retrying, 1), (ExecState::Failed, 2)]
    );
    let execs = c.dispatcher.executions().list(&jobs_core::store::Filter::All).await.unwrap();
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].retry_count, 2);
    assert!(execs[0].retry_count <= execs[0].max_retry_count);
}

#[tokio::test]
async fn live_runner_completes_and_fires_successors_once() {
    let c = Cluster::new();
    c.define(json!({
        "jobID": "A", "interval": 60000, "module": "test", "function": "ok",
        "successors": [{"jobID": "B", "parameter": {"x": 1}}, {"jobID": "C"}]
    }))
    .await;
    c.define(json!({"jobID": "B", "schedule": "chain", "module": "test", "function": "record", "parameter": {"x": 0}}))
        .await;
    c.define(json!({"jobID": "C", "schedule": "chain", "module": "test", "function": "record", "parameter": "own"}))
        .await;

    let seen: Arc<Mutex<Vec<(String, Option<Value>)>>> = Arc::default();
    let handlers = HandlerRegistry::new();
    handlers.register_fn("test", "ok", |ctx, _p| async move {
        ctx.heartbeat(Some(json!("halfway"))).await?;
        Ok(())
    });
    let sink = seen.clone();
    handlers.register_fn("test", "record", move |ctx, p| {
        let sink = sink.clone();
        async move {
            sink.lock().push((ctx.job_id().to_string(), p));
            Ok(())
        }
    });
    c.spawn_runner(handlers).await;

    let def = c.db.find_one(&jobs_core::store::Filter::eq("jobID", "A")).await.unwrap().unwrap();
    let state = c.dispatcher.execute_job(&def, Utc::now(), ExecType::Normal, None).await.unwrap();
    assert_eq!(state, ExecState::Triggered);

    let execs = wait_for_executions(&c.db, Duration::from_secs(5), |e| {
        e.len() == 3 && e.iter().all(|x| x.state == ExecState::Completed)
    })
    .await;
    let a = execs.iter().find(|e| e.job_id == "A").unwrap();
    assert_eq!(a.exec_type, ExecType::Normal);
    assert!(a.runner.as_deref().unwrap().starts_with("127.0.0.1:"));
    assert!(execs.iter().filter(|e| e.job_id != "A").all(|e| e.exec_type == ExecType::Manual));

    let mut got = seen.lock().clone();
    got.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(got, [("B".to_string(), Some(json!({"x": 1}))), ("C".to_string(), Some(json!("own")))]);

    // a late duplicate completion report must not chain again
    let again = c.dispatcher.done(&a.execution_id, None).await.unwrap();
    assert_eq!(again, Transition::AlreadyTerminal(ExecState::Completed));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(c.dispatcher.executions().list(&jobs_core::store::Filter::All).await.unwrap().len(), 3);
}

#[tokio::test]
async fn unresolvable_handler_is_retried_then_failed() {
    let c = Cluster::new();
    let def = c
        .define(json!({"jobID": "J", "interval": 1000, "module": "nope", "function": "f", "maxRetryCount": 1}))
        .await;
    c.spawn_runner(HandlerRegistry::with_builtins()).await;

    let state = c.dispatcher.execute_job(&def, Utc::now(), ExecType::Normal, None).await.unwrap();
    assert_eq!(state, ExecState::Failed);
    let e = c.dispatcher.executions().list(&jobs_core::store::Filter::All).await.unwrap().remove(0);
    assert_eq!(e.retry_count, 1);
    let reason = e.retry_reason.unwrap();
    assert!(reason.contains("function f not found in module nope for jobID J"), "{reason}");
}

#[tokio::test]
async fn handler_error_marks_execution_failed() {
    let c = Cluster::new();
    c.define(json!({"jobID": "E", "interval": 1000, "module": "test", "function": "boom"})).await;
    let handlers = HandlerRegistry::new();
    handlers.register_fn("test", "boom", |_ctx, _p| async { Err(anyhow::anyhow!("disk full")) });
    c.spawn_runner(handlers).await;

    assert_eq!(c.dispatcher.execute_now("E", None).await.unwrap(), ExecState::TriggeredManually);
    let execs = wait_for_executions(&c.db, Duration::from_secs(5), |e| {
        e.first().map(|x| x.state == ExecState::Failed).unwrap_or(false)
    })
    .await;
    assert_eq!(execs[0].fail_reason.as_deref(), Some("disk full"));
}

#[tokio::test]
async fn manual_runs_rotate_across_runners() {
    let c = Cluster::new();
    c.define(json!({"jobID": "N", "interval": 1000, "module": "builtin", "function": "noop"})).await;
    let r1 = c.spawn_runner(HandlerRegistry::with_builtins()).await;
    let r2 = c.spawn_runner(HandlerRegistry::with_builtins()).await;

    for _ in 0..4 {
        assert_eq!(c.dispatcher.execute_now("N", None).await.unwrap(), ExecState::TriggeredManually);
    }
    let execs = c.dispatcher.executions().list(&jobs_core::store::Filter::All).await.unwrap();
    let on = |addr: String| execs.iter().filter(|e| e.runner.as_deref() == Some(addr.as_str())).count();
    assert_eq!(on(r1.address()), 2);
    assert_eq!(on(r2.address()), 2);
}
