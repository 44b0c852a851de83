use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jobs_core::job::JobExecution;
use jobs_core::store::StoreError;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::executions::Transition;

/// Module name of the handlers shipped with the daemon.
pub const BUILTIN: &str = "builtin";

/// Work run on a runner for one execution. Returning `Ok` reports COMPLETED and
/// `Err` reports FAILED, unless the handler already reported through its context.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext, parameter: Option<Value>) -> Result<()>;
}

/// Adapter for plain async closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext, parameter: Option<Value>) -> Result<()> {
        (self.0)(ctx, parameter).await
    }
}

/// `(module, function)` -> handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<(String, String), Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `builtin.noop`, `builtin.exec` and `builtin.http`.
    pub fn with_builtins() -> Self {
        let reg = Self::new();
        reg.register_fn(BUILTIN, "noop", |_ctx, _p| async { Ok(()) });
        reg.register_fn(BUILTIN, "exec", |_ctx, p| exec(p));
        reg.register_fn(BUILTIN, "http", |_ctx, p| http(p));
        reg
    }

    pub fn register(&self, module: &str, function: &str, handler: impl JobHandler) {
        self.handlers
            .write()
            .insert((module.to_string(), function.to_string()), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&self, module: &str, function: &str, f: F)
    where
        F: Fn(JobContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(module, function, FnHandler(f));
    }

    pub fn resolve(&self, module: &str, function: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .get(&(module.to_string(), function.to_string()))
            .cloned()
    }

    pub fn contains(&self, module: &str, function: &str) -> bool {
        self.resolve(module, function).is_some()
    }

    /// Start the handler for a triggered execution in the background.
    /// Fails only when the handler cannot be resolved.
    pub fn launch(&self, dispatcher: &Dispatcher, exec: &JobExecution) -> Result<(), String> {
        let handler = self.resolve(&exec.module, &exec.function).ok_or_else(|| {
            format!(
                "function {} not found in module {} for jobID {}",
                exec.function, exec.module, exec.job_id
            )
        })?;
        let ctx = JobContext {
            job_id: exec.job_id.clone(),
            execution_id: exec.execution_id.clone(),
            dispatcher: dispatcher.clone(),
            finished: Arc::new(AtomicBool::new(false)),
        };
        let parameter = exec.parameter.clone();
        tokio::spawn(async move {
            debug!(job = %ctx.job_id, execution = %ctx.execution_id, "handler starting");
            let result = handler.run(ctx.clone(), parameter).await;
            if ctx.is_finished() {
                return;
            }
            let reported = match result {
                Ok(()) => ctx.done(None).await,
                Err(e) => ctx.fail(&format!("{e:#}")).await,
            };
            if let Err(e) = reported {
                warn!(job = %ctx.job_id, execution = %ctx.execution_id, error = %e, "could not record handler outcome");
            }
        });
        Ok(())
    }
}

/// Handle given to a running handler for reporting progress and outcome.
#[derive(Clone)]
pub struct JobContext {
    job_id: String,
    execution_id: String,
    dispatcher: Dispatcher,
    finished: Arc<AtomicBool>,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// True once the handler has reported a terminal status.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub async fn heartbeat(&self, status: Option<Value>) -> Result<Transition, StoreError> {
        self.dispatcher.heartbeat(&self.execution_id, status).await
    }

    pub async fn done(&self, status: Option<Value>) -> Result<Transition, StoreError> {
        self.finished.store(true, Ordering::SeqCst);
        self.dispatcher.done(&self.execution_id, status).await
    }

    pub async fn fail(&self, reason: &str) -> Result<Transition, StoreError> {
        self.finished.store(true, Ordering::SeqCst);
        self.dispatcher.fail(&self.execution_id, reason, None).await
    }

    pub async fn skip(&self, status: Option<Value>) -> Result<Transition, StoreError> {
        self.finished.store(true, Ordering::SeqCst);
        self.dispatcher.skip(&self.execution_id, status).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecParams {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn params<T: for<'de> Deserialize<'de>>(p: Option<Value>, what: &str) -> Result<T> {
    let p = p.with_context(|| format!("{what} requires a parameter"))?;
    serde_json::from_value(p).with_context(|| format!("invalid {what} parameter"))
}

/// `builtin.exec`: run a local command, failing on a non-zero exit.
async fn exec(p: Option<Value>) -> Result<()> {
    let ExecParams { cmd, args, timeout_ms } = params(p, "exec")?;
    let mut c = Command::new(&cmd);
    c.args(&args).kill_on_drop(true);
    let fut = c.status();
    let status = match timeout_ms {
        Some(ms) => timeout(Duration::from_millis(ms), fut).await.context("exec timeout")??,
        None => fut.await?,
    };
    if !status.success() {
        bail!("{cmd} exit status {:?}", status.code());
    }
    info!(%cmd, "exec finished");
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpParams {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// `builtin.http`: call a URL, failing on a non-2xx answer.
async fn http(p: Option<Value>) -> Result<()> {
    let HttpParams { url, method, body, timeout_ms } = params(p, "http")?;
    let method = method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = reqwest::Method::from_bytes(method.as_bytes()).with_context(|| format!("bad method {method}"))?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms.unwrap_or(30_000)))
        .build()?;
    let mut req = client.request(method, &url);
    if let Some(b) = body {
        req = req.json(&b);
    }
    let resp = req.send().await.with_context(|| format!("request to {url} failed"))?;
    let status = resp.status();
    if !status.is_success() {
        bail!("{url} answered {status}");
    }
    info!(%url, %status, "http call finished");
    Ok(())
}
