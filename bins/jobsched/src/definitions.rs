use jobs_core::job::JobDefinition;
use jobs_core::schedule::{JobSchedule, ScheduleError};
use jobs_core::store::{Db, Filter, StoreError};
use thiserror::Error;
use tracing::info;

use crate::handlers::HandlerRegistry;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("jobID must not be empty")]
    EmptyId,
    #[error("job {job_id}: {source}")]
    Schedule { job_id: String, source: ScheduleError },
    #[error("function {function} not found in module {module} for jobID {job_id}")]
    Unresolved { job_id: String, module: String, function: String },
    #[error("job {0} already exists")]
    Exists(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DefinitionError {
    /// True for errors caused by the definition itself.
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            DefinitionError::EmptyId | DefinitionError::Schedule { .. } | DefinitionError::Unresolved { .. }
        )
    }
}

/// Reject definitions that could never be scheduled or run.
pub fn validate(def: &JobDefinition, handlers: &HandlerRegistry) -> Result<(), DefinitionError> {
    if def.job_id.trim().is_empty() {
        return Err(DefinitionError::EmptyId);
    }
    JobSchedule::from_definition(def)
        .map_err(|source| DefinitionError::Schedule { job_id: def.job_id.clone(), source })?;
    if !handlers.contains(&def.module, &def.function) {
        return Err(DefinitionError::Unresolved {
            job_id: def.job_id.clone(),
            module: def.module.clone(),
            function: def.function.clone(),
        });
    }
    Ok(())
}

/// Store a new definition. It is picked up by the next scheduling sweep.
pub async fn define(db: &Db, handlers: &HandlerRegistry, mut def: JobDefinition) -> Result<JobDefinition, DefinitionError> {
    validate(&def, handlers)?;
    def.scheduled = false;
    match db.create(&def).await {
        Ok(d) => {
            info!(job = %d.job_id, "job defined");
            Ok(d)
        }
        Err(e) if e.is_conflict() => Err(DefinitionError::Exists(def.job_id)),
        Err(e) => Err(e.into()),
    }
}

pub async fn list(db: &Db) -> Result<Vec<JobDefinition>, StoreError> {
    let mut defs = db.find::<JobDefinition>(&Filter::All).await?;
    defs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
    Ok(defs)
}

/// Delete a definition; its timer retires at the next fire.
pub async fn remove(db: &Db, job_id: &str) -> Result<(), DefinitionError> {
    match db.delete::<JobDefinition>(&Filter::eq("jobID", job_id)).await? {
        0 => Err(DefinitionError::NotFound(job_id.to_string())),
        _ => {
            info!(job = %job_id, "job removed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobs_core::store::MemStore;
    use serde_json::json;

    fn def(v: serde_json::Value) -> JobDefinition {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn define_list_remove() {
        let db = Db::new(MemStore::new());
        let reg = HandlerRegistry::with_builtins();
        let d = def(json!({"jobID": "J1", "interval": 1000, "module": "builtin", "function": "noop", "scheduled": true}));
        let stored = define(&db, &reg, d.clone()).await.unwrap();
        assert!(!stored.scheduled);
        assert!(matches!(define(&db, &reg, d).await, Err(DefinitionError::Exists(_))));
        assert_eq!(list(&db).await.unwrap().len(), 1);
        remove(&db, "J1").await.unwrap();
        assert!(matches!(remove(&db, "J1").await, Err(DefinitionError::NotFound(_))));
    }

    #[test]
    fn validation_errors() {
        let reg = HandlerRegistry::with_builtins();
        let bad_sched = def(json!({"jobID": "J", "module": "builtin", "function": "noop"}));
        assert!(matches!(validate(&bad_sched, &reg), Err(DefinitionError::Schedule { .. })));
        let bad_fn = def(json!({"jobID": "J", "interval": 5, "module": "x", "function": "y"}));
        let err = validate(&bad_fn, &reg).unwrap_err();
        assert!(err.is_invalid());
        assert_eq!(err.to_string(), "function y not found in module x for jobID J");
        let empty = def(json!({"jobID": " ", "schedule": "chain", "module": "builtin", "function": "noop"}));
        assert!(matches!(validate(&empty, &reg), Err(DefinitionError::EmptyId)));
        let chain = def(json!({"jobID": "C", "schedule": "chain", "module": "builtin", "function": "noop"}));
        validate(&chain, &reg).unwrap();
    }
}
