mod common;

use common::Cluster;
use jobsched::handlers::HandlerRegistry;
use reqwest::StatusCode;
use serde_json::{json, Value};

async fn api() -> (Cluster, String, reqwest::Client) {
    let c = Cluster::new();
    let addr = c.serve(HandlerRegistry::with_builtins()).await;
    (c, format!("http://{addr}"), reqwest::Client::new())
}

#[tokio::test]
async fn job_definitions_crud() {
    let (_c, base, http) = api().await;
    let def = json!({"jobID": "J1", "interval": 1000, "module": "builtin", "function": "noop"});

    let r = http.post(format!("{base}/jobs")).json(&def).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::CREATED);
    let r = http.post(format!("{base}/jobs")).json(&def).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::CONFLICT);

    let bad = json!({"jobID": "J2", "module": "builtin", "function": "noop"});
    let r = http.post(format!("{base}/jobs")).json(&bad).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = r.json().await.unwrap();
    assert!(body["error"]["message"].as_str().unwrap().contains("schedule or interval"));

    let list: Vec<Value> = http.get(format!("{base}/jobs")).send().await.unwrap().json().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["scheduled"], false);

    let r = http.delete(format!("{base}/jobs/J1")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::OK);
    let r = http.delete(format!("{base}/jobs/J1")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn kill_switch_endpoints() {
    let (_c, base, http) = api().await;
    let body = json!({"lockName": "JOB-SCHEDULER", "reason": "maintenance"});

    let r: Value = http.post(format!("{base}/disable")).json(&body).send().await.unwrap().json().await.unwrap();
    assert_eq!(r["status"], "Flagged JOB-SCHEDULER as disabled");
    let r: Value = http.post(format!("{base}/disable")).json(&body).send().await.unwrap().json().await.unwrap();
    assert_eq!(r["status"], "JOB-SCHEDULER is already flagged as disabled");

    let s: Value = http.get(format!("{base}/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(s["disabled"], "maintenance");
    assert_eq!(s["master"], false);

    let r: Value = http
        .post(format!("{base}/enable"))
        .json(&json!({"lockName": "JOB-SCHEDULER"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(r["status"], "JOB-SCHEDULER is flagged for (re)enablement");
    let s: Value = http.get(format!("{base}/status")).send().await.unwrap().json().await.unwrap();
    assert_eq!(s["disabled"], Value::Null);
}

#[tokio::test]
async fn run_now_acknowledges_known_jobs() {
    let (c, base, http) = api().await;
    c.define(json!({"jobID": "J", "interval": 1000, "module": "builtin", "function": "noop", "maxRetryCount": 0}))
        .await;

    let r = http.post(format!("{base}/runJobNow/J")).json(&json!({"k": "v"})).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::OK);
    let body: Value = r.json().await.unwrap();
    assert_eq!(body["status"], "Job J triggered");

    let execs = common::wait_for_executions(&c.db, std::time::Duration::from_secs(5), |e| !e.is_empty()).await;
    assert_eq!(execs[0].parameter, Some(json!({"k": "v"})));

    let r = http.post(format!("{base}/runJobNow/missing")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn runner_endpoints_report_errors_as_json() {
    let (_c, base, http) = api().await;

    let r = http.get(format!("{base}/runJob/J/nope")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);
    let body: Value = r.json().await.unwrap();
    assert!(body["error"]["message"].is_string());

    let r = http.post(format!("{base}/executions/nope/done")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);
    let r = http.post(format!("{base}/executions/nope/explode")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::NOT_FOUND);

    let r = http.get(format!("{base}/executions?state=BOGUS")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::BAD_REQUEST);
    let r = http.get(format!("{base}/executions?state=FAILED&jobID=J")).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::OK);
}

#[tokio::test]
async fn heartbeat_before_trigger_conflicts() {
    let (c, base, http) = api().await;
    let def = c.define(json!({"jobID": "H", "interval": 1000, "module": "builtin", "function": "noop"})).await;
    let ex = c.dispatcher.executions();
    let e = ex.build(&def, chrono::Utc::now(), jobs_core::job::ExecType::Normal, None, None);
    ex.create(&e).await.unwrap();

    let url = format!("{base}/executions/{}/heartbeat", e.execution_id);
    let r = http.post(&url).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::CONFLICT);

    ex.mark_triggered(&e, jobs_core::job::ExecState::Triggered, "127.0.0.1:1").await.unwrap();
    let r = http.post(&url).json(&json!({"status": "halfway"})).send().await.unwrap();
    assert_eq!(r.status(), StatusCode::OK);
    let body: Value = r.json().await.unwrap();
    assert_eq!(body["state"], "RUNNING");
}
