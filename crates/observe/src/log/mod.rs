//! Named loggers writing to rotating files under `logs/`.
//!
//! A [`Logger`] can be written to directly or handed to
//! `tracing_subscriber::fmt().with_writer(...)`, in which case every
//! formatted event becomes one record in the file. Per-logger bookkeeping
//! (options, size, line counters per level) lives in a metadata store of kind
//! `log`; counters are recomputed from the file on [`LogManager::refresh`].

mod rotate;

pub use self::rotate::{RotationPolicy, backup_path};

use self::rotate::RotatingFile;
use crate::error::{Error, ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::instrument;
use tracing_subscriber::fmt::MakeWriter;
use wold_metadata::MetadataStore;
use wold_storage::{BackendHandle, layout};

/// Kind under which logger records are stored.
pub const KIND: &str = "log";

/// Severity of a log line, most severe first.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    #[display("ERROR")]
    Error,
    #[display("WARNING")]
    Warning,
    #[display("INFO")]
    Info,
    #[display("DEBUG")]
    Debug,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Error, Level::Warning, Level::Info, Level::Debug];

    /// The level a formatted line was written at, judged by the first level
    /// marker it contains. Both this crate's records and `tracing`'s default
    /// format are recognised.
    pub fn of_line(line: &str) -> Option<Self> {
        const MARKERS: [(&str, Level); 5] = [
            ("ERROR", Level::Error),
            ("WARN", Level::Warning),
            ("INFO", Level::Info),
            ("DEBUG", Level::Debug),
            ("TRACE", Level::Debug),
        ];
        MARKERS.iter().find(|(marker, _)| line.contains(marker)).map(|&(_, level)| level)
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => Self::Error,
            tracing::Level::WARN => Self::Warning,
            tracing::Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }
}

impl FromStr for Level {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" | "critical" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "debug" | "trace" => Ok(Self::Debug),
            _ => exn::bail!(ErrorKind::InvalidArgument(format!("unknown log level: {s}"))),
        }
    }
}

/// Options for [`LogManager::create_logger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerOptions {
    pub log_type: String,
    /// Records below this level are dropped.
    pub level: Level,
    pub max_size: u64,
    pub backup_count: u32,
    pub compress_backups: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            log_type: "general".to_string(),
            level: Level::Info,
            max_size: 1024 * 1024,
            backup_count: 5,
            compress_backups: true,
        }
    }
}

impl LoggerOptions {
    fn policy(&self) -> RotationPolicy {
        RotationPolicy { max_size: self.max_size, backup_count: self.backup_count, compress: self.compress_backups }
    }
}

/// Persisted bookkeeping for one logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub log_type: String,
    pub level: Level,
    pub max_size: u64,
    pub backup_count: u32,
    #[serde(default)]
    pub compress_backups: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified_at: OffsetDateTime,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub line_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub warning_count: u64,
    #[serde(default)]
    pub info_count: u64,
    #[serde(default)]
    pub debug_count: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogRecord {
    fn options(&self) -> LoggerOptions {
        LoggerOptions {
            log_type: self.log_type.clone(),
            level: self.level,
            max_size: self.max_size,
            backup_count: self.backup_count,
            compress_backups: self.compress_backups,
        }
    }

    fn count_lines(&mut self, content: &str) {
        self.line_count = 0;
        self.error_count = 0;
        self.warning_count = 0;
        self.info_count = 0;
        self.debug_count = 0;
        for line in content.lines() {
            self.line_count += 1;
            match Level::of_line(line) {
                Some(Level::Error) => self.error_count += 1,
                Some(Level::Warning) => self.warning_count += 1,
                Some(Level::Info) => self.info_count += 1,
                Some(Level::Debug) => self.debug_count += 1,
                None => {},
            }
        }
    }

    pub fn count(&self, level: Level) -> u64 {
        match level {
            Level::Error => self.error_count,
            Level::Warning => self.warning_count,
            Level::Info => self.info_count,
            Level::Debug => self.debug_count,
        }
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    level: Level,
    file: Mutex<RotatingFile>,
}

/// Handle to one rotating log file. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Logger {
    shared: Arc<Shared>,
}

impl Logger {
    fn open(name: &str, path: PathBuf, options: &LoggerOptions) -> Result<Self> {
        let file = RotatingFile::open(path.clone(), options.policy()).or_raise(|| ErrorKind::Io(path))?;
        let shared = Shared { name: name.to_string(), level: options.level, file: Mutex::new(file) };
        Ok(Self { shared: Arc::new(shared) })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn level(&self) -> Level {
        self.shared.level
    }

    pub fn path(&self) -> PathBuf {
        self.shared.file.lock().path().to_path_buf()
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.shared.level
    }

    /// Append one `<timestamp> - <name> - <LEVEL> - <message>` line.
    pub fn log(&self, level: Level, message: impl AsRef<str>) -> Result<()> {
        if !self.enabled(level) {
            return Ok(());
        }
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let line = format!("{timestamp} - {} - {level} - {}\n", self.shared.name, message.as_ref());
        let mut file = self.shared.file.lock();
        let path = file.path().to_path_buf();
        file.write_record(line.as_bytes()).or_raise(|| ErrorKind::Io(path))
    }

    pub fn rotate(&self) -> Result<()> {
        let mut file = self.shared.file.lock();
        let path = file.path().to_path_buf();
        file.rotate().or_raise(|| ErrorKind::Io(path))
    }

    fn truncate(&self) -> Result<()> {
        let mut file = self.shared.file.lock();
        let path = file.path().to_path_buf();
        file.truncate().or_raise(|| ErrorKind::Io(path))
    }
}

/// `io::Write` end of a [`Logger`], one per formatted `tracing` event.
#[derive(Debug)]
pub struct LogWriter {
    shared: Option<Arc<Shared>>,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(shared) = &self.shared {
            shared.file.lock().write_record(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Logger {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter { shared: Some(self.shared.clone()) }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        let shared = self.enabled(Level::from(meta.level())).then(|| self.shared.clone());
        LogWriter { shared }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub total_logs: usize,
    pub total_size: u64,
    pub total_lines: u64,
    /// Lines written at each level, across every logger.
    pub lines_by_level: BTreeMap<Level, u64>,
    /// Loggers per type.
    pub by_type: BTreeMap<String, usize>,
}

/// Owner of every named logger under the asset root's `logs/` directory.
#[derive(Debug)]
pub struct LogManager {
    backend: BackendHandle,
    records: MetadataStore<LogRecord>,
    live: Mutex<HashMap<String, Logger>>,
}

impl LogManager {
    #[instrument(skip_all)]
    pub async fn open(backend: BackendHandle) -> Result<Self> {
        let records = MetadataStore::open(backend.clone(), KIND).await.or_raise(|| ErrorKind::Store)?;
        Ok(Self { backend, records, live: Mutex::new(HashMap::new()) })
    }

    fn file_path(&self, log_type: &str, name: &str) -> Result<PathBuf> {
        let relative = layout::log_file(log_type, name);
        self.backend.resolve(&relative).or_raise(|| ErrorKind::Io(relative))
    }

    /// Create (or reattach to) the logger `name`, writing to
    /// `logs/<type>_<name>.log`. A logger that is already live is returned
    /// as is.
    #[instrument(skip_all, fields(name = %name, log_type = %options.log_type))]
    pub async fn create_logger(&self, name: &str, options: LoggerOptions) -> Result<Logger> {
        if name.is_empty() || name.contains(['/', '\\']) || options.log_type.contains(['/', '\\']) {
            exn::bail!(ErrorKind::InvalidArgument(format!("invalid logger name: {name:?}")));
        }
        if let Some(logger) = self.live.lock().get(name) {
            return Ok(logger.clone());
        }
        let logger = Logger::open(name, self.file_path(&options.log_type, name)?, &options)?;

        let now = OffsetDateTime::now_utc();
        let created_at = self.records.get(name).await.map_or(now, |r| r.created_at);
        let record = LogRecord {
            name: name.to_string(),
            log_type: options.log_type.clone(),
            level: options.level,
            max_size: options.max_size,
            backup_count: options.backup_count,
            compress_backups: options.compress_backups,
            created_at,
            last_modified_at: now,
            size_bytes: 0,
            line_count: 0,
            error_count: 0,
            warning_count: 0,
            info_count: 0,
            debug_count: 0,
            extra: Map::new(),
        };
        self.records.put(name, record).await.or_raise(|| ErrorKind::Store)?;
        let logger = self.live.lock().entry(name.to_string()).or_insert(logger).clone();
        Ok(logger)
    }

    /// The live logger `name`, reopened from its record if this process
    /// hasn't used it yet.
    pub async fn get(&self, name: &str) -> Result<Logger> {
        if let Some(logger) = self.live.lock().get(name) {
            return Ok(logger.clone());
        }
        let Some(record) = self.records.get(name).await else {
            exn::bail!(ErrorKind::NotFound(format!("logger {name}")));
        };
        self.create_logger(name, record.options()).await
    }

    pub async fn record(&self, name: &str) -> Option<LogRecord> {
        self.records.get(name).await
    }

    pub async fn records(&self) -> Vec<LogRecord> {
        self.records.snapshot().await.into_values().collect()
    }

    async fn read_current(&self, record: &LogRecord) -> Result<String> {
        let path = self.file_path(&record.log_type, &record.name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err).or_raise(|| ErrorKind::Io(path)),
        }
    }

    /// Recompute size and line counters of `name` from its live file.
    #[instrument(skip_all, fields(name = %name))]
    pub async fn refresh(&self, name: &str) -> Result<LogRecord> {
        let Some(mut record) = self.records.get(name).await else {
            exn::bail!(ErrorKind::NotFound(format!("logger {name}")));
        };
        let content = self.read_current(&record).await?;
        record.size_bytes = content.len() as u64;
        record.count_lines(&content);
        record.last_modified_at = OffsetDateTime::now_utc();
        self.records.put(name, record.clone()).await.or_raise(|| ErrorKind::Store)?;
        Ok(record)
    }

    /// Force a rotation of `name` regardless of its size.
    pub async fn rotate(&self, name: &str) -> Result<LogRecord> {
        self.get(name).await?.rotate()?;
        self.refresh(name).await
    }

    /// Empty the live file of `name`. Backups stay.
    pub async fn clear(&self, name: &str) -> Result<LogRecord> {
        self.get(name).await?.truncate()?;
        self.refresh(name).await
    }

    /// The last `n` lines of `name`'s live file, optionally only those
    /// written at `level`.
    pub async fn tail(&self, name: &str, n: usize, level: Option<Level>) -> Result<Vec<String>> {
        let Some(record) = self.records.get(name).await else {
            exn::bail!(ErrorKind::NotFound(format!("logger {name}")));
        };
        let content = self.read_current(&record).await?;
        let lines: Vec<&str> = content.lines().filter(|line| level.is_none_or(|l| Level::of_line(line) == Some(l))).collect();
        let skip = lines.len().saturating_sub(n);
        Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
    }

    /// Aggregate counters over every logger, refreshed from disk.
    pub async fn stats(&self) -> Result<LogStats> {
        let mut stats = LogStats::default();
        for name in self.records.names().await {
            let record = self.refresh(&name).await?;
            stats.total_logs += 1;
            stats.total_size += record.size_bytes;
            stats.total_lines += record.line_count;
            for level in Level::ALL {
                *stats.lines_by_level.entry(level).or_default() += record.count(level);
            }
            *stats.by_type.entry(record.log_type.clone()).or_default() += 1;
        }
        Ok(stats)
    }

    /// Location of `name`'s live file relative to the asset root.
    pub async fn relative_path(&self, name: &str) -> Option<PathBuf> {
        self.records.get(name).await.map(|r| layout::log_file(&r.log_type, &r.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::TempDir;
    use wold_storage::LocalBackend;

    async fn manager() -> (TempDir, LogManager) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new("test", dir.path()).unwrap());
        let manager = LogManager::open(backend).await.unwrap();
        (dir, manager)
    }

    #[rstest]
    #[case("2026-01-01T00:00:00Z - app - ERROR - boom", Some(Level::Error))]
    #[case("2026-01-01T00:00:00Z  WARN wold: slow", Some(Level::Warning))]
    #[case("x - app - WARNING - careful", Some(Level::Warning))]
    #[case(" INFO started", Some(Level::Info))]
    #[case("TRACE span", Some(Level::Debug))]
    #[case("no marker", None)]
    fn test_level_of_line(#[case] line: &str, #[case] expected: Option<Level>) {
        assert_eq!(Level::of_line(line), expected);
    }

    #[rstest]
    #[case("warn", Level::Warning)]
    #[case("WARNING", Level::Warning)]
    #[case("Critical", Level::Error)]
    #[case("trace", Level::Debug)]
    fn test_parse_level(#[case] input: &str, #[case] expected: Level) {
        assert_eq!(input.parse::<Level>().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_logger_writes_and_counts() {
        let (dir, manager) = manager().await;
        let logger = manager.create_logger("loader", LoggerOptions::default()).await.unwrap();
        logger.log(Level::Info, "started").unwrap();
        logger.log(Level::Error, "bad glb").unwrap();
        logger.log(Level::Debug, "filtered out").unwrap();

        let path = dir.path().join("logs/general_loader.log");
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        let record = manager.refresh("loader").await.unwrap();
        assert_eq!(record.line_count, 2);
        assert_eq!(record.error_count, 1);
        assert_eq!(record.info_count, 1);

        let errors = manager.tail("loader", 10, Some(Level::Error)).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("bad glb"));
    }

    #[tokio::test]
    async fn test_tail_returns_last_lines() {
        let (_dir, manager) = manager().await;
        let logger = manager.create_logger("pipeline", LoggerOptions::default()).await.unwrap();
        for i in 0..5 {
            logger.log(Level::Info, format!("step {i}")).unwrap();
        }
        let lines = manager.tail("pipeline", 2, None).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("step 3"));
        assert!(lines[1].ends_with("step 4"));
        assert!(manager.tail("missing", 2, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tracing_events_land_in_file() {
        let (_dir, manager) = manager().await;
        let options = LoggerOptions { log_type: "app".into(), level: Level::Warning, ..Default::default() };
        let logger = manager.create_logger("wold", options).await.unwrap();

        let subscriber = tracing_subscriber::fmt().with_writer(logger.clone()).with_ansi(false).finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("disk almost full");
            tracing::info!("below the logger's level");
        });
        logger.make_writer().write_all(b"raw line\n").unwrap();

        let lines = manager.tail("wold", 10, None).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("WARN") && lines[0].ends_with("disk almost full"));
        assert_eq!(lines[1], "raw line");
    }

    #[tokio::test]
    async fn test_stats_and_reopen() {
        let dir = TempDir::new().unwrap();
        let backend: BackendHandle = Arc::new(LocalBackend::new("test", dir.path()).unwrap());
        {
            let manager = LogManager::open(backend.clone()).await.unwrap();
            let audio = LoggerOptions { log_type: "audio".into(), ..Default::default() };
            manager.create_logger("decoder", audio).await.unwrap().log(Level::Warning, "clipped").unwrap();
            manager.create_logger("app", LoggerOptions::default()).await.unwrap().log(Level::Info, "up").unwrap();
        }
        let manager = LogManager::open(backend).await.unwrap();
        manager.get("app").await.unwrap().log(Level::Error, "down").unwrap();

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.total_logs, 2);
        assert_eq!(stats.total_lines, 3);
        assert_eq!(stats.lines_by_level[&Level::Warning], 1);
        assert_eq!(stats.lines_by_level[&Level::Error], 1);
        assert_eq!(stats.by_type["audio"], 1);
    }

    #[tokio::test]
    async fn test_rotate_and_clear() {
        let (dir, manager) = manager().await;
        let options = LoggerOptions { compress_backups: false, ..Default::default() };
        let logger = manager.create_logger("jobs", options).await.unwrap();
        logger.log(Level::Info, "before").unwrap();
        let record = manager.rotate("jobs").await.unwrap();
        assert_eq!(record.line_count, 0);
        assert!(dir.path().join("logs/general_jobs.log.1").exists());

        logger.log(Level::Info, "after").unwrap();
        assert_eq!(manager.clear("jobs").await.unwrap().size_bytes, 0);
    }
}
