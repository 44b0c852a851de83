use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use jobs_core::job::{ExecState, JobDefinition, JobRunner, MasterControl};
use jobs_core::store::{Db, Filter};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::definitions::{self, DefinitionError};
use crate::dispatcher::Dispatcher;
use crate::election::LeaderFlag;
use crate::executions::Transition;
use crate::handlers::HandlerRegistry;
use crate::module::{Module, ModuleCtx};
use crate::node::Node;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub dispatcher: Dispatcher,
    pub handlers: HandlerRegistry,
    pub node: Node,
    pub lock_name: String,
    pub leader: LeaderFlag,
    pub is_runner: bool,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/runJob/:job_id/:execution_id", get(run_job))
        .route("/runJobNow/:job_id", post(run_job_now))
        .route("/disable", post(disable))
        .route("/enable", post(enable))
        .route("/jobs", get(jobs_list).post(jobs_define))
        .route("/jobs/:job_id", delete(jobs_delete))
        .route("/executions", get(executions_list))
        .route("/executions/:execution_id/:action", post(execution_report))
        .with_state(state)
}

pub struct WebServer {
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
    pub tls_cert_pem: Option<String>,
    pub tls_key_pem: Option<String>,
    state: AppState,
}

impl WebServer {
    pub fn new(state: AppState, http: Option<SocketAddr>, https: Option<SocketAddr>, cert: Option<String>, key: Option<String>) -> Self {
        Self { http_addr: http, https_addr: https, tls_cert_pem: cert, tls_key_pem: key, state }
    }
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            let app = router(self.state.clone());
            let mut servers = Vec::<JoinHandle<anyhow::Result<()>>>::new();

            if let Some(addr) = self.http_addr {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!("web http listening on http://{}", addr);
                let app_clone = app.clone();
                let mut sd = ctx.clone();
                servers.push(tokio::spawn(async move {
                    axum::serve(listener, app_clone)
                        .with_graceful_shutdown(async move { sd.stopped().await })
                        .await?;
                    Ok(())
                }));
            }

            if let (Some(addr), Some(cert), Some(key)) = (self.https_addr, self.tls_cert_pem.clone(), self.tls_key_pem.clone()) {
                info!("web https listening on https://{}", addr);
                let app_clone = app.clone();
                let mut sd = ctx.clone();
                servers.push(tokio::spawn(async move {
                    let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
                    let serve_fut = axum_server::bind_rustls(addr, config).serve(app_clone.into_make_service());
                    tokio::select! {
                        r = serve_fut => { r?; }
                        _ = sd.stopped() => {}
                    }
                    Ok(())
                }));
            }

            for s in servers {
                s.await??;
            }
            info!("web stopping");
            Ok(())
        })
    }
}

fn error_body(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(json!({ "error": { "message": message.into() } }))).into_response()
}

/// Empty bodies, `null` and `{}` all mean "no payload".
fn optional_json(body: &Bytes) -> Result<Option<Value>, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Null) => Ok(None),
        Ok(Value::Object(m)) if m.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(e) => Err(error_body(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}"))),
    }
}

async fn status(State(state): State<AppState>) -> Response {
    let lock = Filter::eq("lockName", state.lock_name.as_str());
    let control = match state.db.find_one::<MasterControl>(&lock).await {
        Ok(c) => c,
        Err(e) => return error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };
    let master = state.leader.load(Ordering::SeqCst);
    // the leader reports its dispatch pool; others report registered leases
    let runners = if master {
        state.dispatcher.pool().len()
    } else {
        state.db.find::<JobRunner>(&Filter::All).await.map(|r| r.len()).unwrap_or(0)
    };
    Json(json!({
        "instanceID": state.node.instance_id,
        "address": state.node.address(),
        "lockName": state.lock_name,
        "master": master,
        "runner": state.is_runner,
        "disabled": control.as_ref().map(|c| c.reason.clone()),
        "runners": runners,
        "uptimeMs": state.started.elapsed().as_millis() as u64,
    }))
    .into_response()
}

async fn run_job(Path((job_id, execution_id)): Path<(String, String)>, State(state): State<AppState>) -> Response {
    let exec = match state.dispatcher.executions().get(&execution_id).await {
        Ok(Some(e)) if e.job_id == job_id => e,
        Ok(_) => return error_body(StatusCode::NOT_FOUND, format!("no execution {execution_id} for jobID {job_id}")),
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    match state.handlers.launch(&state.dispatcher, &exec) {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(msg) => {
            warn!(job = %job_id, exec = %exec.exec_id, "{msg}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, msg)
        }
    }
}

async fn run_job_now(Path(job_id): Path<String>, State(state): State<AppState>, body: Bytes) -> Response {
    let parameter = match optional_json(&body) {
        Ok(p) => p,
        Err(r) => return r,
    };
    match state.db.find_one::<JobDefinition>(&Filter::eq("jobID", job_id.as_str())).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_body(StatusCode::NOT_FOUND, format!("no job definition with jobID {job_id}")),
        Err(e) => return error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
    let d = state.dispatcher.clone();
    let id = job_id.clone();
    tokio::spawn(async move {
        if let Err(e) = d.execute_now(&id, parameter).await {
            error!(job = %id, error = %e, "manual execution failed");
        }
    });
    Json(json!({ "status": format!("Job {job_id} triggered") })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ControlBody {
    lock_name: String,
    #[serde(default)]
    reason: Option<String>,
}

async fn disable(State(state): State<AppState>, Json(body): Json<ControlBody>) -> Response {
    let control = MasterControl {
        lock_name: body.lock_name.clone(),
        reason: body.reason.unwrap_or_default(),
        last_updated_time: Utc::now(),
    };
    match state.db.create(&control).await {
        Ok(_) => {
            warn!(lock = %body.lock_name, reason = %control.reason, "master role disabled");
            Json(json!({ "status": format!("Flagged {} as disabled", body.lock_name) })).into_response()
        }
        Err(e) if e.is_conflict() => {
            Json(json!({ "status": format!("{} is already flagged as disabled", body.lock_name) })).into_response()
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn enable(State(state): State<AppState>, Json(body): Json<ControlBody>) -> Response {
    match state.db.delete::<MasterControl>(&Filter::eq("lockName", body.lock_name.as_str())).await {
        Ok(_) => {
            info!(lock = %body.lock_name, "master role re-enabled");
            Json(json!({ "status": format!("{} is flagged for (re)enablement", body.lock_name) })).into_response()
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn jobs_list(State(state): State<AppState>) -> Response {
    match definitions::list(&state.db).await {
        Ok(defs) => Json(defs).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn jobs_define(State(state): State<AppState>, body: Bytes) -> Response {
    let def: JobDefinition = match serde_json::from_slice(&body) {
        Ok(d) => d,
        Err(e) => return error_body(StatusCode::UNPROCESSABLE_ENTITY, format!("invalid job definition: {e}")),
    };
    match definitions::define(&state.db, &state.handlers, def).await {
        Ok(d) => (StatusCode::CREATED, Json(d)).into_response(),
        Err(e @ DefinitionError::Exists(_)) => error_body(StatusCode::CONFLICT, e.to_string()),
        Err(e) if e.is_invalid() => error_body(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn jobs_delete(Path(job_id): Path<String>, State(state): State<AppState>) -> Response {
    match definitions::remove(&state.db, &job_id).await {
        Ok(()) => Json(json!({ "deleted": job_id })).into_response(),
        Err(e @ DefinitionError::NotFound(_)) => error_body(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
struct ExecQuery {
    #[serde(rename = "jobID")]
    job_id: Option<String>,
    state: Option<String>,
}

async fn executions_list(State(state): State<AppState>, Query(q): Query<ExecQuery>) -> Response {
    let mut filter = Filter::All;
    if let Some(job) = q.job_id {
        filter = filter.and(Filter::eq("jobID", job));
    }
    if let Some(s) = q.state {
        match ExecState::parse(&s) {
            Some(st) => filter = filter.and(Filter::eq("state", st)),
            None => return error_body(StatusCode::BAD_REQUEST, format!("unknown state {s}")),
        }
    }
    match state.dispatcher.executions().list(&filter).await {
        Ok(execs) => Json(execs).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn execution_report(
    Path((execution_id, action)): Path<(String, String)>,
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let body = match optional_json(&body) {
        Ok(b) => b.unwrap_or(Value::Null),
        Err(r) => return r,
    };
    let status = body.get("status").cloned();
    let d = &state.dispatcher;
    let result = match action.as_str() {
        "heartbeat" => d.heartbeat(&execution_id, status).await,
        "done" => d.done(&execution_id, status).await,
        "skip" => d.skip(&execution_id, status).await,
        "fail" => {
            let reason = body.get("reason").and_then(Value::as_str).unwrap_or("failed by runner");
            d.fail(&execution_id, reason, status).await
        }
        other => return error_body(StatusCode::NOT_FOUND, format!("unknown action {other}")),
    };
    match result {
        Ok(Transition::Applied(e)) => Json(json!({ "executionID": e.execution_id, "state": e.state })).into_response(),
        Ok(Transition::AlreadyTerminal(s)) => {
            error_body(StatusCode::CONFLICT, format!("execution {execution_id} is already {s}"))
        }
        Ok(Transition::Rejected(s)) => {
            error_body(StatusCode::CONFLICT, format!("execution {execution_id} is {s}, not yet triggered"))
        }
        Ok(Transition::Unknown) => error_body(StatusCode::NOT_FOUND, format!("no execution {execution_id}")),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
