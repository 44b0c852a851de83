use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"jobsched"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root directory of the filesystem lease store. Empty means the per-app data dir.
    #[serde(default)]
    pub store_dir: String,
    /// HTTP control plane and runner endpoint.
    #[serde(default)]
    pub http: HttpConfig,
    /// Scheduling engine, dispatch, and recovery timings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Runner self-registration lease.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Leader election lease.
    #[serde(default)]
    pub election: ElectionConfig,
}

/// HTTP listener and outbound trigger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind the plain HTTP listener on.
    pub bind: String,
    /// Port of the plain HTTP listener; also recorded in the JobRunner lease.
    pub port: u16,
    /// Hostname other instances use to reach this one. Defaults to the OS hostname.
    pub advertise_host: Option<String>,
    /// Optional HTTPS port (requires cert and key).
    pub https_port: Option<u16>,
    /// PEM certificate path for HTTPS.
    pub tls_cert_pem: Option<String>,
    /// PEM private key path for HTTPS.
    pub tls_key_pem: Option<String>,
    /// Scheme used when triggering runners (`"http"` or `"https"`).
    pub runner_scheme: String,
    /// Timeout for one trigger request (ms).
    pub trigger_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3000,
            advertise_host: None,
            https_port: None,
            tls_cert_pem: None,
            tls_key_pem: None,
            runner_scheme: "http".to_string(),
            trigger_timeout_ms: 10_000,
        }
    }
}

/// Timings of the leader-side scheduling engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether this instance registers as a runner and contends for leadership.
    pub is_runner: bool,
    /// Leader refresh of the live runner list and kill-switch check (ms).
    pub runner_update_interval_ms: u64,
    /// Sweep for newly created job definitions (ms).
    pub schedule_new_jobs_interval_ms: u64,
    /// Recovery sweep interval (ms).
    pub defunct_jobs_retry_interval_ms: u64,
    /// An execution is defunct after `factor * defunct_jobs_retry_interval_ms` without update.
    pub defunct_tolerance_factor: u32,
    /// Delay between failed dispatch and the next attempt (ms).
    pub job_trigger_fail_retry_delay_ms: u64,
    /// How far a stored next trigger time may lag before it counts as missed (ms).
    pub missed_trigger_grace_ms: u64,
    /// Retry budget for definitions that do not set one.
    pub default_max_retry_count: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            is_runner: true,
            runner_update_interval_ms: 15_000,
            schedule_new_jobs_interval_ms: 30_000,
            defunct_jobs_retry_interval_ms: 30_000,
            defunct_tolerance_factor: 3,
            job_trigger_fail_retry_delay_ms: 5_000,
            missed_trigger_grace_ms: 5_000,
            default_max_retry_count: 3,
        }
    }
}

impl SchedulerConfig {
    /// Age after which a non-terminal execution is considered defunct.
    pub fn defunct_tolerance(&self) -> Duration {
        Duration::from_millis(self.defunct_jobs_retry_interval_ms) * self.defunct_tolerance_factor
    }
}

/// Runner lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Runner heartbeat renewal interval (ms).
    pub heartbeat_interval_ms: u64,
    /// A runner is stale after `factor * heartbeat_interval_ms` without renewal.
    pub tolerance_factor: u32,
    /// Consecutive renewal failures tolerated before re-registering.
    pub max_heartbeat_retry_count: u32,
    /// Delay before retrying a failed renewal (ms).
    pub heartbeat_retry_delay_ms: u64,
    /// Delay before retrying a failed registration (ms).
    pub register_retry_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 20_000,
            tolerance_factor: 3,
            max_heartbeat_retry_count: 3,
            heartbeat_retry_delay_ms: 2_000,
            register_retry_interval_ms: 60_000,
        }
    }
}

impl RunnerConfig {
    /// Age after which a runner lease is stale.
    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms) * self.tolerance_factor
    }
}

/// Leader election lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Name of the elected duty.
    pub lock_name: String,
    /// Delay before the first election check (ms).
    pub init_delay_ms: u64,
    /// Interval between election checks (ms).
    pub check_master_interval_ms: u64,
    /// Lock heartbeat renewal interval (ms).
    pub heartbeat_interval_ms: u64,
    /// Consecutive renewal failures tolerated before abandoning the claim.
    pub max_heartbeat_retry_count: u32,
    /// Age after which a lock is stale (ms). Defaults to 3x the heartbeat interval.
    pub tolerance_ms: Option<u64>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lock_name: "JOB-SCHEDULER".to_string(),
            init_delay_ms: 1_000,
            check_master_interval_ms: 30_000,
            heartbeat_interval_ms: 8_000,
            max_heartbeat_retry_count: 3,
            tolerance_ms: None,
        }
    }
}

impl ElectionConfig {
    /// Effective staleness tolerance of the lock.
    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms.unwrap_or(self.heartbeat_interval_ms * 3))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store_dir: String::new(),
            http: HttpConfig::default(),
            scheduler: SchedulerConfig::default(),
            runner: RunnerConfig::default(),
            election: ElectionConfig::default(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }

impl Config {
    /// Apply process environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|k| std::env::var(k).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |name: &str| -> Result<Option<u64>> {
            match get(name) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .with_context(|| format!("env {name}={v} is not a number")),
                None => Ok(None),
            }
        };

        if let Some(v) = num("JOB_RUNNER_UPDATE_INTERVAL")? { self.scheduler.runner_update_interval_ms = v; }
        if let Some(v) = num("SCHEDULE_NEW_JOBS_INTERVAL")? { self.scheduler.schedule_new_jobs_interval_ms = v; }
        if let Some(v) = num("DEFUNCT_JOBS_RETRY_INTERVAL")? { self.scheduler.defunct_jobs_retry_interval_ms = v; }
        if let Some(v) = num("JOB_TRIGGER_FAIL_RETRY_DELAY")? { self.scheduler.job_trigger_fail_retry_delay_ms = v; }
        if let Some(v) = num("JOB_RUNNER_HEARTBEAT_INTERVAL")? { self.runner.heartbeat_interval_ms = v; }
        if let Some(v) = num("JOB_RUNNER_MAX_HEARTBEAT_RETRY_COUNT")? { self.runner.max_heartbeat_retry_count = v as u32; }
        if let Some(v) = num("JOB_RUNNER_HEARTBEAT_RETRY_DELAY")? { self.runner.heartbeat_retry_delay_ms = v; }
        if let Some(v) = num("JOB_RUNNER_RETRY_INTERVAL")? { self.runner.register_retry_interval_ms = v; }
        if let Some(v) = num("MASTER_JOB_EXEC_INIT_DELAY")? { self.election.init_delay_ms = v; }
        if let Some(v) = num("CHECK_MASTER_INTERVAL")? { self.election.check_master_interval_ms = v; }
        if let Some(v) = num("MASTER_JOB_HEARTBEAT_INTERVAL")? { self.election.heartbeat_interval_ms = v; }
        if let Some(v) = num("MASTER_JOB_MAX_HEARTBEAT_RETRY_COUNT")? { self.election.max_heartbeat_retry_count = v as u32; }
        if let Some(v) = num("MASTER_JOB_TOLERANCE")? { self.election.tolerance_ms = Some(v); }
        if let Some(v) = num("PORT")? {
            self.http.port = u16::try_from(v).context("PORT out of range")?;
        }
        if let Some(v) = get("IS_JOB_RUNNER") {
            self.scheduler.is_runner = v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    /// Reject timing combinations that make the leases unsafe.
    pub fn validate(&self) -> Result<()> {
        let hb = Duration::from_millis(self.election.heartbeat_interval_ms);
        if self.election.tolerance() <= hb {
            bail!(
                "election tolerance {:?} must exceed heartbeat interval {:?}",
                self.election.tolerance(),
                hb
            );
        }
        if self.runner.tolerance_factor < 2 {
            bail!("runner tolerance factor must be at least 2");
        }
        if self.election.lock_name.trim().is_empty() {
            bail!("election lock name is empty");
        }
        Ok(())
    }

    /// Resolve the store directory, falling back to the per-app data dir.
    pub fn resolve_store_dir(&self, app: &AppId) -> Result<PathBuf> {
        if !self.store_dir.is_empty() {
            return Ok(PathBuf::from(&self.store_dir));
        }
        let pd = project_dirs(app)?;
        Ok(pd.data_dir().join("store"))
    }
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let dir = project_dirs(app)?.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let dir = config_dir(app)?;
    let path = dir.join("config.toml");
    if path.exists() {
        load_from(&path)
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

/// Load a config file from an explicit path.
pub fn load_from(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = toml::from_str(&txt)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
