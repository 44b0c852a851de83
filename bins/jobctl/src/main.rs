use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobs_core::job::{ExecState, JobDefinition};
use jobs_core::logx;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"), version, about = "Operator CLI for jobsched")]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Base URL of any jobsched instance
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    url: String,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the instance's view of the cluster
    Status,
    /// Create a job from a JSON definition file
    Define { file: PathBuf },
    /// List job definitions
    Jobs,
    /// Delete a job definition
    Remove { job_id: String },
    /// Fire a job now, optionally with a JSON parameter
    RunNow {
        job_id: String,
        #[arg(long)]
        params: Option<String>,
    },
    /// List executions
    Executions {
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        state: Option<String>,
    },
    /// Set the kill-switch for a lock name
    Disable {
        lock_name: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Clear the kill-switch for a lock name
    Enable { lock_name: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose { 0 => "warn", 1 => "debug", _ => "trace" };
    logx::init(level);

    let api = Api { base: cli.url.trim_end_matches('/').to_string(), http: reqwest::Client::new() };
    let out = match cli.cmd {
        Command::Status => api.get("/status", &[]).await?,
        Command::Define { file } => {
            let txt = std::fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
            let def: JobDefinition =
                serde_json::from_str(&txt).with_context(|| format!("parse {}", file.display()))?;
            api.post("/jobs", Some(serde_json::to_value(&def)?)).await?
        }
        Command::Jobs => api.get("/jobs", &[]).await?,
        Command::Remove { job_id } => api.delete(&format!("/jobs/{job_id}")).await?,
        Command::RunNow { job_id, params } => {
            let body = match params {
                Some(p) => Some(serde_json::from_str::<Value>(&p).context("--params must be JSON")?),
                None => None,
            };
            api.post(&format!("/runJobNow/{job_id}"), body).await?
        }
        Command::Executions { job, state } => {
            if let Some(s) = &state {
                if ExecState::parse(s).is_none() {
                    bail!("unknown state {s}");
                }
            }
            let mut q = Vec::new();
            if let Some(j) = job {
                q.push(("jobID", j));
            }
            if let Some(s) = state {
                q.push(("state", s));
            }
            api.get("/executions", &q).await?
        }
        Command::Disable { lock_name, reason } => {
            api.post("/disable", Some(json!({ "lockName": lock_name, "reason": reason }))).await?
        }
        Command::Enable { lock_name } => api.post("/enable", Some(json!({ "lockName": lock_name }))).await?,
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

struct Api {
    base: String,
    http: reqwest::Client,
}

impl Api {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = reqwest::Url::parse_with_params(&format!("{}{path}", self.base), query)
            .with_context(|| format!("bad url {}", self.base))?;
        self.send(self.http.get(url)).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        let mut req = self.http.post(format!("{}{path}", self.base));
        if let Some(b) = body {
            req = req.json(&b);
        }
        self.send(req).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.http.delete(format!("{}{path}", self.base))).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req.send().await.with_context(|| format!("cannot reach {}", self.base))?;
        let status = resp.status();
        debug!(%status, url = %resp.url(), "response");
        let text = resp.text().await?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        if !status.is_success() {
            let msg = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            bail!("{status}: {msg}");
        }
        Ok(body)
    }
}
