use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// The record kinds held by the lease store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// Operator-defined job.
    JobDefinition,
    /// One firing of a job.
    JobExecution,
    /// Worker instance lease.
    JobRunner,
    /// Leader election lease.
    MasterLock,
    /// Leadership kill-switch.
    MasterControl,
}

impl Kind {
    /// Collection name, also the directory name in [`FsStore`].
    pub fn name(&self) -> &'static str {
        match self {
            Kind::JobDefinition => "JobDefinition",
            Kind::JobExecution => "JobExecution",
            Kind::JobRunner => "JobRunner",
            Kind::MasterLock => "MasterLock",
            Kind::MasterControl => "MasterControl",
        }
    }

    /// Field holding the unique key of this kind.
    pub fn key_field(&self) -> &'static str {
        match self {
            Kind::JobDefinition => "jobID",
            Kind::JobExecution => "executionID",
            Kind::JobRunner => "instanceID",
            Kind::MasterLock | Kind::MasterControl => "lockName",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced by store engines.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with the same unique key already exists.
    #[error("{kind} with {field}={key} already exists")]
    Conflict {
        /// Record kind.
        kind: Kind,
        /// Key field name.
        field: &'static str,
        /// Key value.
        key: String,
    },
    /// The document lacks its string key field.
    #[error("{kind} record is missing string field {field}")]
    MissingKey {
        /// Record kind.
        kind: Kind,
        /// Key field name.
        field: &'static str,
    },
    /// The backing store cannot be reached.
    #[error("store unavailable")]
    Unavailable,
    /// Filesystem failure.
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    /// Document (de)serialization failure.
    #[error("store serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// A blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// True for a lost create-if-absent race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Record filter: equality, `neq`, `lt`, and `and`/`or` combinations.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every record.
    All,
    /// Field equals value (a missing field equals `null`).
    Eq(String, Value),
    /// Field differs from value.
    Neq(String, Value),
    /// Field is less than value; numbers compare numerically, strings lexically.
    Lt(String, Value),
    /// All sub-filters match.
    And(Vec<Filter>),
    /// At least one sub-filter matches.
    Or(Vec<Filter>),
}

static NULL: Value = Value::Null;

impl Filter {
    /// `field == value`
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    /// `field != value`
    pub fn neq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Neq(field.to_string(), value.into())
    }

    /// `field < value`
    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    /// `field` equals any of `values`.
    pub fn any_of<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::Or(values.into_iter().map(|v| Filter::eq(field, v)).collect())
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Filter) -> Self {
        let mut parts = match self {
            Filter::All => return other,
            Filter::And(v) => v,
            f => vec![f],
        };
        match other {
            Filter::All => {}
            Filter::And(v) => parts.extend(v),
            f => parts.push(f),
        }
        Filter::And(parts)
    }

    /// Evaluate against a JSON document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(f, v) => field(doc, f) == v,
            Filter::Neq(f, v) => field(doc, f) != v,
            Filter::Lt(f, v) => less_than(field(doc, f), v),
            Filter::And(fs) => fs.iter().all(|f| f.matches(doc)),
            Filter::Or(fs) => fs.iter().any(|f| f.matches(doc)),
        }
    }
}

fn field<'a>(doc: &'a Value, name: &str) -> &'a Value {
    doc.get(name).unwrap_or(&NULL)
}

fn less_than(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x < y,
            _ => false,
        },
        (Value::String(x), Value::String(y)) => x < y,
        _ => false,
    }
}

fn key_of(kind: Kind, doc: &Value) -> Result<String, StoreError> {
    doc.get(kind.key_field())
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(StoreError::MissingKey { kind, field: kind.key_field() })
}

/// Shallow-merge `patch` into `doc`. The key field is never rewritten.
fn merge(kind: Kind, doc: &mut Value, patch: &Value) {
    if let (Some(d), Some(p)) = (doc.as_object_mut(), patch.as_object()) {
        for (k, v) in p {
            if k != kind.key_field() {
                d.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Minimal document store. No locking: `create` being atomic on the unique key
/// is the only coordination primitive.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert `doc`; fails with [`StoreError::Conflict`] if its key exists.
    async fn create(&self, kind: Kind, doc: Value) -> Result<Value, StoreError>;
    /// All records of `kind` matching `filter`.
    async fn find(&self, kind: Kind, filter: &Filter) -> Result<Vec<Value>, StoreError>;
    /// Merge `patch` into every matching record; returns the number updated.
    async fn update_matching(&self, kind: Kind, filter: &Filter, patch: &Value) -> Result<u64, StoreError>;
    /// Delete every matching record; returns the number deleted.
    async fn delete_matching(&self, kind: Kind, filter: &Filter) -> Result<u64, StoreError>;
}

/// A Rust type persisted as one record kind.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The kind this type is stored as.
    const KIND: Kind;
}

/// Typed helpers layered on top of any [`Store`].
#[derive(Clone)]
pub struct Db {
    inner: Arc<dyn Store>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    /// Wrap a store engine.
    pub fn new<S: Store>(store: S) -> Self {
        Self { inner: Arc::new(store) }
    }

    /// Insert a record (create-if-absent on its key).
    pub async fn create<T: Record>(&self, rec: &T) -> Result<T, StoreError> {
        let doc = serde_json::to_value(rec)?;
        let out = self.inner.create(T::KIND, doc).await?;
        Ok(serde_json::from_value(out)?)
    }

    /// Find records; documents that fail to decode are skipped with a warning.
    pub async fn find<T: Record>(&self, filter: &Filter) -> Result<Vec<T>, StoreError> {
        let docs = self.inner.find(T::KIND, filter).await?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match serde_json::from_value::<T>(doc) {
                Ok(r) => out.push(r),
                Err(e) => warn!(kind = %T::KIND, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }

    /// First matching record, if any.
    pub async fn find_one<T: Record>(&self, filter: &Filter) -> Result<Option<T>, StoreError> {
        Ok(self.find::<T>(filter).await?.into_iter().next())
    }

    /// Patch every matching record.
    pub async fn update<T: Record>(&self, filter: &Filter, patch: Value) -> Result<u64, StoreError> {
        self.inner.update_matching(T::KIND, filter, &patch).await
    }

    /// Delete every matching record.
    pub async fn delete<T: Record>(&self, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.delete_matching(T::KIND, filter).await
    }
}

/* --------------------- MemStore --------------------- */

/// Process-local store. Clones share the same tables.
#[derive(Clone)]
pub struct MemStore {
    tables: Arc<Mutex<BTreeMap<Kind, BTreeMap<String, Value>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`] while false.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create(&self, kind: Kind, doc: Value) -> Result<Value, StoreError> {
        self.check()?;
        let key = key_of(kind, &doc)?;
        let mut tables = self.tables.lock();
        let table = tables.entry(kind).or_default();
        if table.contains_key(&key) {
            return Err(StoreError::Conflict { kind, field: kind.key_field(), key });
        }
        table.insert(key, doc.clone());
        Ok(doc)
    }

    async fn find(&self, kind: Kind, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        self.check()?;
        let tables = self.tables.lock();
        Ok(tables
            .get(&kind)
            .map(|t| t.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default())
    }

    async fn update_matching(&self, kind: Kind, filter: &Filter, patch: &Value) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let mut n = 0;
        if let Some(t) = tables.get_mut(&kind) {
            for doc in t.values_mut().filter(|d| filter.matches(d)) {
                merge(kind, doc, patch);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn delete_matching(&self, kind: Kind, filter: &Filter) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let Some(t) = tables.get_mut(&kind) else { return Ok(0) };
        let before = t.len();
        t.retain(|_, d| !filter.matches(d));
        Ok((before - t.len()) as u64)
    }
}

/* --------------------- FsStore --------------------- */

/// Filesystem-backed store: `<root>/<Kind>/<hex(key)>.json`.
///
/// `create` uses exclusive file creation, so create-if-absent stays atomic
/// across processes sharing the directory. Conditional updates and deletes
/// hold a write lock from scan to write, so two writers in one process never
/// both match the same record.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
    writes: Arc<Mutex<()>>,
}

/// Open an FS-backed store rooted at `dir` (created if missing).
pub fn open_fs<P: AsRef<Path>>(dir: P) -> Result<FsStore, StoreError> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)?;
    Ok(FsStore { root, writes: Arc::new(Mutex::new(())) })
}

impl FsStore {
    fn dir_for(root: &Path, kind: Kind) -> PathBuf {
        root.join(kind.name())
    }

    fn path_for(root: &Path, kind: Kind, key: &str) -> PathBuf {
        // Windows-safe: map arbitrary bytes to a hex file name.
        let mut name = String::with_capacity(key.len() * 2 + 5);
        for &b in key.as_bytes() {
            name.push(hex_digit((b >> 4) & 0xF));
            name.push(hex_digit(b & 0xF));
        }
        name.push_str(".json");
        Self::dir_for(root, kind).join(name)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(&root)).await?
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

/// Every decodable `(path, doc)` of a kind. Half-written files are skipped.
fn scan(root: &Path, kind: Kind) -> Result<Vec<(PathBuf, Value)>, StoreError> {
    let dir = FsStore::dir_for(root, kind);
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let mut buf = Vec::new();
        match fs::File::open(&path) {
            Ok(mut f) => f.read_to_end(&mut buf)?,
            // deleted between listing and open
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Value>(&buf) {
            Ok(doc) => out.push((path, doc)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable record"),
        }
    }
    Ok(out)
}

/// Replace `path` through a uniquely named temp file in the same directory.
fn write_replace(path: &Path, doc: &Value) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::Builder::new().suffix(".tmp").tempfile_in(dir)?;
    tmp.write_all(&serde_json::to_vec_pretty(doc)?)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl Store for FsStore {
    async fn create(&self, kind: Kind, doc: Value) -> Result<Value, StoreError> {
        self.blocking(move |root| {
            let key = key_of(kind, &doc)?;
            let path = FsStore::path_for(root, kind, &key);
            fs::create_dir_all(FsStore::dir_for(root, kind))?;
            let bytes = serde_json::to_vec_pretty(&doc)?;
            let mut f = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    return Err(StoreError::Conflict { kind, field: kind.key_field(), key });
                }
                Err(e) => return Err(e.into()),
            };
            f.write_all(&bytes)?;
            f.sync_all()?;
            Ok(doc)
        })
        .await
    }

    async fn find(&self, kind: Kind, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let filter = filter.clone();
        self.blocking(move |root| {
            Ok(scan(root, kind)?
                .into_iter()
                .filter(|(_, d)| filter.matches(d))
                .map(|(_, d)| d)
                .collect())
        })
        .await
    }

    async fn update_matching(&self, kind: Kind, filter: &Filter, patch: &Value) -> Result<u64, StoreError> {
        let filter = filter.clone();
        let patch = patch.clone();
        let writes = self.writes.clone();
        self.blocking(move |root| {
            let _guard = writes.lock();
            let mut n = 0;
            for (path, mut doc) in scan(root, kind)? {
                if filter.matches(&doc) {
                    merge(kind, &mut doc, &patch);
                    write_replace(&path, &doc)?;
                    n += 1;
                }
            }
            Ok(n)
        })
        .await
    }

    async fn delete_matching(&self, kind: Kind, filter: &Filter) -> Result<u64, StoreError> {
        let filter = filter.clone();
        let writes = self.writes.clone();
        self.blocking(move |root| {
            let _guard = writes.lock();
            let mut n = 0;
            for (path, doc) in scan(root, kind)? {
                if filter.matches(&doc) {
                    match fs::remove_file(&path) {
                        Ok(()) => n += 1,
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(n)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_semantics() {
        let doc = json!({"state": "RUNNING", "t": 10, "next": null, "name": "b"});
        assert!(Filter::eq("state", "RUNNING").matches(&doc));
        assert!(Filter::neq("state", "FAILED").matches(&doc));
        assert!(Filter::eq("missing", Value::Null).matches(&doc));
        assert!(Filter::lt("t", 11).matches(&doc));
        assert!(!Filter::lt("t", 10).matches(&doc));
        assert!(!Filter::lt("next", 100).matches(&doc));
        assert!(Filter::lt("name", "c").matches(&doc));
        assert!(Filter::any_of("state", ["CREATED", "RUNNING"]).matches(&doc));
        let f = Filter::neq("state", "COMPLETED").and(Filter::lt("t", 5));
        assert!(!f.matches(&doc));
        assert_eq!(Filter::All.and(Filter::eq("t", 10)), Filter::eq("t", 10));
    }

    #[test]
    fn and_flattens() {
        let f = Filter::eq("a", 1).and(Filter::eq("b", 2)).and(Filter::eq("c", 3));
        match f {
            Filter::And(parts) => assert_eq!(parts.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn exercise(store: impl Store) {
        let kind = Kind::MasterLock;
        store.create(kind, json!({"lockName": "L", "heartbeatTime": 1})).await.unwrap();
        let err = store.create(kind, json!({"lockName": "L", "heartbeatTime": 2})).await.unwrap_err();
        assert!(err.is_conflict());

        let n = store
            .update_matching(kind, &Filter::eq("lockName", "L"), &json!({"heartbeatTime": 5, "lockName": "X"}))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let found = store.find(kind, &Filter::All).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["heartbeatTime"], 5);
        assert_eq!(found[0]["lockName"], "L");

        assert_eq!(store.delete_matching(kind, &Filter::lt("heartbeatTime", 3)).await.unwrap(), 0);
        assert_eq!(store.delete_matching(kind, &Filter::eq("lockName", "L")).await.unwrap(), 1);
        assert!(store.find(kind, &Filter::All).await.unwrap().is_empty());

        let err = store.create(kind, json!({"heartbeatTime": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn mem_store_contract() {
        exercise(MemStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(open_fs(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn fs_store_instances_share_create_race() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_fs(dir.path()).unwrap();
        let b = open_fs(dir.path()).unwrap();
        let doc = json!({"lockName": "JOB-SCHEDULER"});
        let (ra, rb) = tokio::join!(
            a.create(Kind::MasterLock, doc.clone()),
            b.create(Kind::MasterLock, doc.clone())
        );
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fs_store_conditional_updates_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_fs(dir.path()).unwrap();
        let b = a.clone();
        let kind = Kind::JobExecution;
        for round in 0..100 {
            let id = format!("E{round}");
            a.create(kind, json!({"executionID": id, "state": "RUNNING"})).await.unwrap();
            let running = Filter::eq("executionID", id.as_str()).and(Filter::any_of("state", ["RUNNING"]));
            let completed = json!({"state": "COMPLETED"});
            let failed = json!({"state": "FAILED"});
            let (x, y) = tokio::join!(
                a.update_matching(kind, &running, &completed),
                b.update_matching(kind, &running, &failed)
            );
            assert_eq!(x.unwrap() + y.unwrap(), 1, "round {round}");
        }
        let stray = fs::read_dir(dir.path().join("JobExecution"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) != Some("json"))
            .count();
        assert_eq!(stray, 0);
    }

    #[tokio::test]
    async fn mem_store_outage() {
        let store = MemStore::new();
        store.set_available(false);
        let err = store.find(Kind::JobRunner, &Filter::All).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable));
        store.set_available(true);
        assert!(store.find(Kind::JobRunner, &Filter::All).await.unwrap().is_empty());
    }
}
