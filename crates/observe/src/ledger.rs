//! Persistent ledger of failures.
//!
//! Every surfaced error gets a record keyed by a code of the form
//! `<TYPE>_<YYYYMMDDHHMMSS>`, stamped in UTC. Recording the same unresolved `(type, message)` again bumps
//! the existing record instead of creating a new one. Resolution is one way.

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::instrument;
use wold_metadata::MetadataStore;
use wold_storage::BackendHandle;

/// Kind under which error records are stored.
pub const KIND: &str = "error";

#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[display("CRITICAL")]
    Critical,
    #[default]
    #[display("ERROR")]
    Error,
    #[display("WARNING")]
    Warning,
    #[display("INFO")]
    Info,
}

impl FromStr for Severity {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Self::Critical),
            "ERROR" => Ok(Self::Error),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "INFO" => Ok(Self::Info),
            _ => exn::bail!(ErrorKind::InvalidArgument(format!("unknown severity: {s}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub stack_trace: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub occurrence_count: u64,
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_occurred_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One error as reported by a caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    pub error_type: String,
    pub message: String,
    pub severity: Severity,
    pub context: Map<String, Value>,
    pub stack_trace: Option<String>,
}

impl ErrorReport {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self { error_type: error_type.into(), message: message.into(), ..Default::default() }
    }

    pub fn severity(self, severity: Severity) -> Self {
        Self { severity, ..self }
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn stack_trace(self, stack_trace: impl Into<String>) -> Self {
        Self { stack_trace: Some(stack_trace.into()), ..self }
    }
}

/// Filter for [`ErrorManager::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorQuery {
    pub error_type: Option<String>,
    pub severity: Option<Severity>,
    pub include_resolved: bool,
}

impl ErrorQuery {
    fn matches(&self, record: &ErrorRecord) -> bool {
        self.error_type.as_ref().is_none_or(|t| t.eq_ignore_ascii_case(&record.error_type))
            && self.severity.is_none_or(|s| s == record.severity)
            && (self.include_resolved || !record.is_resolved)
    }
}

/// Completeness of one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCheck {
    pub has_message: bool,
    pub has_stack_trace: bool,
    pub has_context: bool,
    pub is_resolved: bool,
    /// Unresolved records count as having one.
    pub has_resolution: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum OccurrenceBucket {
    #[serde(rename = "1")]
    Once,
    #[serde(rename = "2-5")]
    Few,
    #[serde(rename = "6-10")]
    Several,
    #[serde(rename = "10+")]
    Many,
}
impl OccurrenceBucket {
    pub fn of(count: u64) -> Self {
        match count {
            0 | 1 => Self::Once,
            2..=5 => Self::Few,
            6..=10 => Self::Several,
            _ => Self::Many,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorStats {
    pub total: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_occurrence: BTreeMap<OccurrenceBucket, usize>,
}

/// Codes and timestamps are UTC: the local offset can't be read once the
/// runtime has started its worker threads.
fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// `<TYPE>_<YYYYMMDDHHMMSS>`, with `_2`, `_3`, ... appended while `taken`
/// says the code is in use.
pub fn error_code(error_type: &str, at: OffsetDateTime, taken: impl Fn(&str) -> bool) -> String {
    let stamp = at
        .format(format_description!("[year][month][day][hour][minute][second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    let base = format!("{}_{stamp}", error_type.to_ascii_uppercase());
    if !taken(&base) {
        return base;
    }
    (2..).map(|n| format!("{base}_{n}")).find(|code| !taken(code)).unwrap_or(base)
}

#[derive(Debug)]
pub struct ErrorManager {
    records: MetadataStore<ErrorRecord>,
}

impl ErrorManager {
    #[instrument(skip_all)]
    pub async fn open(backend: BackendHandle) -> Result<Self> {
        let records = MetadataStore::open(backend, KIND).await.or_raise(|| ErrorKind::Store)?;
        Ok(Self { records })
    }

    /// Record an occurrence of `report`. Returns the new or bumped record.
    #[instrument(skip_all, fields(error_type = %report.error_type, code = tracing::field::Empty))]
    pub async fn record(&self, report: ErrorReport) -> Result<ErrorRecord> {
        if report.error_type.trim().is_empty() {
            exn::bail!(ErrorKind::InvalidArgument("error type is empty".to_string()));
        }
        let at = now();
        // Lookup and bump happen under the store's write lock so concurrent
        // reports of one error all count.
        let record = self
            .records
            .modify(|records| {
                let recurring = records.values_mut().find(|r| {
                    !r.is_resolved && r.error_type.eq_ignore_ascii_case(&report.error_type) && r.message == report.message
                });
                let record = match recurring {
                    Some(record) => {
                        record.occurrence_count += 1;
                        record.last_occurred_at = at;
                        record.severity = report.severity;
                        record.context.extend(report.context);
                        if let Some(trace) = report.stack_trace {
                            record.stack_trace = trace;
                        }
                        record.clone()
                    },
                    None => {
                        let record = ErrorRecord {
                            code: error_code(&report.error_type, at, |code| records.contains_key(code)),
                            error_type: report.error_type.to_ascii_uppercase(),
                            message: report.message,
                            severity: report.severity,
                            stack_trace: report.stack_trace.unwrap_or_default(),
                            context: report.context,
                            occurrence_count: 1,
                            is_resolved: false,
                            resolution: None,
                            first_occurred_at: at,
                            last_occurred_at: at,
                            resolved_at: None,
                            extra: Map::new(),
                        };
                        records.insert(record.code.clone(), record.clone());
                        record
                    },
                };
                Some(record)
            })
            .await
            .or_raise(|| ErrorKind::Store)?
            .ok_or_raise(|| ErrorKind::Store)?;
        tracing::Span::current().record("code", record.code.as_str());
        tracing::error!(
            code = %record.code,
            severity = %record.severity,
            occurrences = record.occurrence_count,
            message = %record.message,
            "error recorded"
        );
        Ok(record)
    }

    /// Mark `code` as resolved.
    ///
    /// # Errors
    /// [`InvalidArgument`](ErrorKind::InvalidArgument) for an empty resolution
    /// or an already resolved record, [`NotFound`](ErrorKind::NotFound) for an
    /// unknown code.
    #[instrument(skip_all, fields(code = %code))]
    pub async fn resolve(&self, code: &str, resolution: &str) -> Result<ErrorRecord> {
        let resolution = resolution.trim();
        if resolution.is_empty() {
            exn::bail!(ErrorKind::InvalidArgument("resolution is empty".to_string()));
        }
        let Some(mut record) = self.records.get(code).await else {
            exn::bail!(ErrorKind::NotFound(format!("error {code}")));
        };
        if record.is_resolved {
            exn::bail!(ErrorKind::InvalidArgument(format!("{code} is already resolved")));
        }
        record.is_resolved = true;
        record.resolution = Some(resolution.to_string());
        record.resolved_at = Some(now());
        self.records.put(code, record.clone()).await.or_raise(|| ErrorKind::Store)?;
        tracing::info!(code = %code, "error resolved");
        Ok(record)
    }

    pub async fn get(&self, code: &str) -> Option<ErrorRecord> {
        self.records.get(code).await
    }

    /// Matching records, oldest first.
    pub async fn query(&self, query: &ErrorQuery) -> Vec<ErrorRecord> {
        let mut records: Vec<ErrorRecord> =
            self.records.snapshot().await.into_values().filter(|r| query.matches(r)).collect();
        records.sort_by(|a, b| a.first_occurred_at.cmp(&b.first_occurred_at).then_with(|| a.code.cmp(&b.code)));
        records
    }

    pub async fn unresolved(&self) -> Vec<ErrorRecord> {
        self.query(&ErrorQuery::default()).await
    }

    pub async fn check(&self, code: &str) -> Option<ErrorCheck> {
        let record = self.records.get(code).await?;
        Some(ErrorCheck {
            has_message: !record.message.is_empty(),
            has_stack_trace: !record.stack_trace.is_empty(),
            has_context: !record.context.is_empty(),
            is_resolved: record.is_resolved,
            has_resolution: !record.is_resolved || record.resolution.as_deref().is_some_and(|r| !r.is_empty()),
        })
    }

    pub async fn stats(&self) -> ErrorStats {
        let mut stats = ErrorStats::default();
        for record in self.records.snapshot().await.values() {
            stats.total += 1;
            match record.is_resolved {
                true => stats.resolved += 1,
                false => stats.unresolved += 1,
            }
            *stats.by_type.entry(record.error_type.clone()).or_default() += 1;
            *stats.by_severity.entry(record.severity).or_default() += 1;
            *stats.by_occurrence.entry(OccurrenceBucket::of(record.occurrence_count)).or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use tempfile::TempDir;
    use time::macros::datetime;
    use wold_storage::LocalBackend;

    async fn ledger() -> (TempDir, ErrorManager) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new("test", dir.path()).unwrap());
        let ledger = ErrorManager::open(backend).await.unwrap();
        (dir, ledger)
    }

    #[test]
    fn test_error_code_format() {
        let at = datetime!(2026-03-07 09:05:01 +01:00);
        assert_eq!(error_code("decode", at, |_| false), "DECODE_20260307090501");
        let taken = ["IO_20260307090501", "IO_20260307090501_2"];
        assert_eq!(error_code("io", at, |c| taken.contains(&c)), "IO_20260307090501_3");
    }

    #[rstest]
    #[case(1, OccurrenceBucket::Once)]
    #[case(2, OccurrenceBucket::Few)]
    #[case(5, OccurrenceBucket::Few)]
    #[case(6, OccurrenceBucket::Several)]
    #[case(11, OccurrenceBucket::Many)]
    fn test_occurrence_bucket(#[case] count: u64, #[case] expected: OccurrenceBucket) {
        assert_eq!(OccurrenceBucket::of(count), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_all_count() {
        let (_dir, ledger) = ledger().await;
        let ledger = Arc::new(ledger);
        let tasks = (0..8).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.record(ErrorReport::new("DECODE", "bad glb")).await })
        });
        for outcome in futures::future::join_all(tasks).await {
            outcome.unwrap().unwrap();
        }

        let records = ledger.unresolved().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].occurrence_count, 8);
    }

    #[tokio::test]
    async fn test_recurring_error_is_bumped() {
        let (_dir, ledger) = ledger().await;
        let first = ledger.record(ErrorReport::new("DECODE", "bad glb")).await.unwrap();
        assert!(first.code.starts_with("DECODE_"));
        assert_eq!(first.code.len(), "DECODE_".len() + 14);
        assert_eq!(first.occurrence_count, 1);

        let second = ledger.record(ErrorReport::new("DECODE", "bad glb")).await.unwrap();
        assert_eq!(second.code, first.code);
        assert_eq!(second.occurrence_count, 2);
        assert!(second.last_occurred_at >= first.last_occurred_at);
        assert_eq!(second.first_occurred_at, first.first_occurred_at);
        assert_eq!(ledger.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_resolution_is_one_way() {
        let (_dir, ledger) = ledger().await;
        let record = ledger.record(ErrorReport::new("io", "disk full").severity(Severity::Critical)).await.unwrap();
        assert_eq!(record.error_type, "IO");

        let err = ledger.resolve(&record.code, "  ").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidArgument(_)));
        let resolved = ledger.resolve(&record.code, "freed space").await.unwrap();
        assert!(resolved.is_resolved);
        assert!(resolved.resolved_at.is_some());
        assert!(ledger.resolve(&record.code, "again").await.is_err());
        assert!(ledger.resolve("IO_0", "x").await.unwrap_err().is_not_found());

        // A resolved error doesn't absorb new occurrences.
        let again = ledger.record(ErrorReport::new("io", "disk full")).await.unwrap();
        assert_ne!(again.code, record.code);
        assert_eq!(again.occurrence_count, 1);
    }

    #[tokio::test]
    async fn test_queries_and_stats() {
        let (_dir, ledger) = ledger().await;
        ledger.record(ErrorReport::new("decode", "bad png").context("path", "sky.png")).await.unwrap();
        ledger.record(ErrorReport::new("store", "corrupt").severity(Severity::Critical)).await.unwrap();
        let warn = ledger.record(ErrorReport::new("decode", "odd size").severity(Severity::Warning)).await.unwrap();
        ledger.resolve(&warn.code, "ignored").await.unwrap();

        let decode = ErrorQuery { error_type: Some("DECODE".into()), ..Default::default() };
        assert_eq!(ledger.query(&decode).await.len(), 1);
        let all_decode = ErrorQuery { include_resolved: true, ..decode };
        assert_eq!(ledger.query(&all_decode).await.len(), 2);
        let critical = ErrorQuery { severity: Some(Severity::Critical), ..Default::default() };
        assert_eq!(ledger.query(&critical).await[0].message, "corrupt");
        assert_eq!(ledger.unresolved().await.len(), 2);

        let stats = ledger.stats().await;
        assert_eq!((stats.total, stats.resolved, stats.unresolved), (3, 1, 2));
        assert_eq!(stats.by_type["DECODE"], 2);
        assert_eq!(stats.by_severity[&Severity::Critical], 1);

        let check = ledger.check(&warn.code).await.unwrap();
        assert!(check.has_resolution && !check.has_context);
    }
}
