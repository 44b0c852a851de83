use chrono::{DateTime, Utc};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::job::JobDefinition;

/// Schedule value marking a job that only runs as a successor.
pub const CHAIN: &str = "chain";

/// Failures turning a definition into a timer.
#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    /// Neither `schedule` nor `interval` is set.
    #[error("at least one of schedule or interval must be specified")]
    Missing,
    /// `interval` is zero.
    #[error("interval must be greater than zero")]
    ZeroInterval,
    /// The cron string did not parse.
    #[error("invalid cron expression {expr:?}: {msg}")]
    Cron {
        /// Normalized expression.
        expr: String,
        /// Parser message.
        msg: String,
    },
    /// The recurrence object is malformed.
    #[error("invalid recurrence object: {0}")]
    Recurrence(String),
}

/// How a definition fires.
#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Calendar schedule.
    Cron(cron::Schedule),
    /// Fixed period.
    Interval(Duration),
    /// Fires only as a successor.
    Chain,
}

impl JobSchedule {
    /// Resolve a definition. A cron schedule wins over `interval`; `"chain"` defers to `interval`.
    pub fn from_definition(def: &JobDefinition) -> Result<JobSchedule, ScheduleError> {
        let sched = def.schedule.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if let Some(s) = sched {
            if s != CHAIN {
                return Ok(JobSchedule::Cron(parse_schedule(s)?));
            }
        }
        match def.interval {
            Some(0) => Err(ScheduleError::ZeroInterval),
            Some(ms) => Ok(JobSchedule::Interval(Duration::from_millis(ms))),
            None if sched == Some(CHAIN) => Ok(JobSchedule::Chain),
            None => Err(ScheduleError::Missing),
        }
    }

    /// Next cron fire strictly after `t`. Interval and chain schedules have no calendar.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Cron(s) => s.after(&t).next(),
            _ => None,
        }
    }
}

/// Parse a cron string or JSON recurrence object.
pub fn parse_schedule(s: &str) -> Result<cron::Schedule, ScheduleError> {
    let expr = cron_expression(s)?;
    cron::Schedule::from_str(&expr).map_err(|e| ScheduleError::Cron { expr, msg: e.to_string() })
}

/// Normalize to the 6/7-field form `sec min hour dom month dow [year]`.
pub fn cron_expression(s: &str) -> Result<String, ScheduleError> {
    let s = s.trim();
    if s.starts_with('{') {
        let v: Value = serde_json::from_str(s).map_err(|e| ScheduleError::Recurrence(e.to_string()))?;
        return recurrence_to_cron(&v);
    }
    let mut fields: Vec<String> = s.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => {
            return Err(ScheduleError::Cron {
                expr: s.to_string(),
                msg: format!("expected 5 to 7 fields, got {n}"),
            })
        }
    }
    fields[5] = weekday_names(&fields[5]);
    Ok(fields.join(" "))
}

const DAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Rewrite numeric weekdays (0/7 = Sunday) into names, leaving steps alone.
fn weekday_names(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (item, None),
            };
            let named: Vec<String> = range
                .split('-')
                .map(|tok| match tok.parse::<usize>() {
                    Ok(n) if n < DAYS.len() => DAYS[n].to_string(),
                    _ => tok.to_string(),
                })
                .collect();
            let mut out = named.join("-");
            if let Some(step) = step {
                out.push('/');
                out.push_str(step);
            }
            out
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Convert a recurrence object (`second`, `minute`, `hour`, `date`, `month`
/// 0-based, `dayOfWeek` 0 = Sunday) into a cron expression. `{"rule": "..."}`
/// wraps a cron string.
fn recurrence_to_cron(v: &Value) -> Result<String, ScheduleError> {
    let obj = v
        .as_object()
        .ok_or_else(|| ScheduleError::Recurrence("expected an object".into()))?;
    if let Some(rule) = obj.get("rule").and_then(Value::as_str) {
        return cron_expression(rule);
    }
    let part = |key: &str, offset: u64, default: &str| -> Result<String, ScheduleError> {
        let nums = match obj.get(key) {
            None | Some(Value::Null) => return Ok(default.to_string()),
            Some(Value::Number(n)) => vec![n.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|i| match i {
                    Value::Number(n) => Ok(n.clone()),
                    other => Err(ScheduleError::Recurrence(format!("{key}: {other} is not a number"))),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => return Err(ScheduleError::Recurrence(format!("{key}: unsupported value {other}"))),
        };
        let mut out = Vec::with_capacity(nums.len());
        for n in nums {
            let n = n
                .as_u64()
                .ok_or_else(|| ScheduleError::Recurrence(format!("{key}: {n} is not a non-negative integer")))?;
            out.push((n + offset).to_string());
        }
        if out.is_empty() {
            return Ok(default.to_string());
        }
        Ok(out.join(","))
    };
    let fields = [
        part("second", 0, "0")?,
        part("minute", 0, "*")?,
        part("hour", 0, "*")?,
        part("date", 0, "*")?,
        part("month", 1, "*")?,
        weekday_names(&part("dayOfWeek", 0, "*")?),
    ];
    Ok(fields.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn def(schedule: Option<&str>, interval: Option<u64>) -> JobDefinition {
        JobDefinition {
            job_id: "J".into(),
            schedule: schedule.map(str::to_string),
            interval,
            module: "m".into(),
            function: "f".into(),
            parameter: None,
            successors: vec![],
            enabled: true,
            scheduled: false,
            max_retry_count: None,
            retry_enabled: false,
        }
    }

    #[test]
    fn five_field_cron_gets_seconds() {
        assert_eq!(cron_expression("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(cron_expression("0 9 * * 1-5").unwrap(), "0 0 9 * * MON-FRI");
        assert_eq!(cron_expression("30 0 9 * * 0,7").unwrap(), "30 0 9 * * SUN,SUN");
        assert!(cron_expression("* *").is_err());
    }

    #[test]
    fn recurrence_object_converts() {
        assert_eq!(
            cron_expression(r#"{"hour": 3, "minute": [0, 30], "month": 0, "dayOfWeek": [1, 3]}"#).unwrap(),
            "0 0,30 3 * 1 MON,WED"
        );
        assert_eq!(cron_expression(r#"{"rule": "*/10 * * * *"}"#).unwrap(), "0 */10 * * * *");
        assert!(matches!(cron_expression(r#"{"hour": "x"}"#), Err(ScheduleError::Recurrence(_))));
    }

    #[test]
    fn next_fire_follows_calendar() {
        let s = JobSchedule::from_definition(&def(Some("0 * * * *"), None)).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 15, 0).unwrap();
        let next = s.next_after(t).unwrap();
        assert_eq!((next.hour(), next.minute()), (11, 0));
    }

    #[test]
    fn resolution_rules() {
        assert!(matches!(JobSchedule::from_definition(&def(None, Some(1000))), Ok(JobSchedule::Interval(d)) if d == Duration::from_secs(1)));
        assert!(matches!(JobSchedule::from_definition(&def(Some("chain"), None)), Ok(JobSchedule::Chain)));
        assert!(matches!(JobSchedule::from_definition(&def(Some("chain"), Some(500))), Ok(JobSchedule::Interval(_))));
        assert!(matches!(JobSchedule::from_definition(&def(Some("*/2 * * * * *"), Some(500))), Ok(JobSchedule::Cron(_))));
        assert_eq!(JobSchedule::from_definition(&def(None, None)).unwrap_err(), ScheduleError::Missing);
        assert_eq!(JobSchedule::from_definition(&def(None, Some(0))).unwrap_err(), ScheduleError::ZeroInterval);
        assert!(JobSchedule::from_definition(&def(Some("61 * * * *"), None)).is_err());
        assert!(JobSchedule::Interval(Duration::from_secs(1)).next_after(Utc::now()).is_none());
    }
}
