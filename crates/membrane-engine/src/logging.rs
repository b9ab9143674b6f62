//! Leveled logging collaborator.
//!
//! The membrane reports diagnostics through any object satisfying
//! [`MembraneLogger`].  It never assumes a logger exists: the membrane
//! holds a non-retaining weak handle, upgrades it per call, and silently
//! drops output once the owner releases the logger.  A one-time-warning
//! set deduplicates repeated warnings per membrane instance.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Error => write!(f, "error"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
            Self::Debug => write!(f, "debug"),
            Self::Trace => write!(f, "trace"),
        }
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// One diagnostic record.  `location` names the operation that produced
/// the record; `error` carries a rendered failure when one is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub location: Option<String>,
    pub error: Option<String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            location: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// MembraneLogger — the collaborator contract
// ---------------------------------------------------------------------------

/// Logger collaborator.  Implementations take `&self`; a recording logger
/// uses interior mutability.
pub trait MembraneLogger: fmt::Debug {
    fn log(&self, record: LogRecord);

    fn fatal(&self, message: &str) {
        self.log(LogRecord::new(LogLevel::Fatal, message));
    }

    fn error(&self, message: &str) {
        self.log(LogRecord::new(LogLevel::Error, message));
    }

    fn warn(&self, message: &str) {
        self.log(LogRecord::new(LogLevel::Warn, message));
    }

    fn info(&self, message: &str) {
        self.log(LogRecord::new(LogLevel::Info, message));
    }

    fn debug(&self, message: &str) {
        self.log(LogRecord::new(LogLevel::Debug, message));
    }

    fn trace(&self, message: &str) {
        self.log(LogRecord::new(LogLevel::Trace, message));
    }
}

// ---------------------------------------------------------------------------
// LoggerHandle — non-retaining reference held by the membrane
// ---------------------------------------------------------------------------

/// Weak handle to a logger.  Upgrading fails once the owner drops the
/// logger; the membrane treats that the same as having no logger.
#[derive(Debug, Clone, Default)]
pub struct LoggerHandle {
    inner: Option<Weak<dyn MembraneLogger>>,
}

impl LoggerHandle {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(logger: &Rc<dyn MembraneLogger>) -> Self {
        Self {
            inner: Some(Rc::downgrade(logger)),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    pub fn log(&self, record: LogRecord) {
        if let Some(weak) = &self.inner
            && let Some(logger) = weak.upgrade()
        {
            logger.log(record);
        }
    }

    pub fn emit(&self, level: LogLevel, location: &str, message: &str) {
        self.log(LogRecord {
            level,
            message: message.to_string(),
            location: Some(location.to_string()),
            error: None,
        });
    }

    /// Log a failure at `level` right before it is raised.
    pub fn report_error(&self, level: LogLevel, location: &str, error: &dyn fmt::Display) {
        self.log(LogRecord {
            level,
            message: error.to_string(),
            location: Some(location.to_string()),
            error: Some(error.to_string()),
        });
    }
}

// ---------------------------------------------------------------------------
// NullLogger
// ---------------------------------------------------------------------------

/// Logger that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl MembraneLogger for NullLogger {
    fn log(&self, _record: LogRecord) {}
}

// ---------------------------------------------------------------------------
// MemoryLogger — recording logger for tests
// ---------------------------------------------------------------------------

/// Logger that records every entry in order.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: RefCell<Vec<LogRecord>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared trait-object form ready to hand to `MembraneOptions`.
    pub fn shared() -> Rc<dyn MembraneLogger> {
        Rc::new(Self::new())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    pub fn at_level(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .borrow()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }
}

impl MembraneLogger for MemoryLogger {
    fn log(&self, record: LogRecord) {
        self.records.borrow_mut().push(record);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leveled_helpers_record_levels() {
        let logger = MemoryLogger::new();
        logger.fatal("f");
        logger.error("e");
        logger.warn("w");
        logger.info("i");
        logger.debug("d");
        logger.trace("t");
        let levels: Vec<LogLevel> = logger.records().iter().map(|r| r.level).collect();
        assert_eq!(
            levels,
            vec![
                LogLevel::Fatal,
                LogLevel::Error,
                LogLevel::Warn,
                LogLevel::Info,
                LogLevel::Debug,
                LogLevel::Trace,
            ]
        );
    }

    #[test]
    fn handle_is_non_retaining() {
        let logger: Rc<dyn MembraneLogger> = Rc::new(MemoryLogger::new());
        let handle = LoggerHandle::new(&logger);
        assert!(handle.is_attached());

        drop(logger);
        assert!(!handle.is_attached());
        // Logging after the owner released the logger is a silent no-op.
        handle.emit(LogLevel::Warn, "test", "dropped");
    }

    #[test]
    fn absent_logger_is_silent() {
        let handle = LoggerHandle::none();
        assert!(!handle.is_attached());
        handle.emit(LogLevel::Error, "loc", "msg");
    }

    #[test]
    fn report_error_attaches_rendered_failure() {
        let logger = Rc::new(MemoryLogger::new());
        let as_dyn: Rc<dyn MembraneLogger> = logger.clone();
        let handle = LoggerHandle::new(&as_dyn);
        handle.report_error(LogLevel::Error, "convert", &"boom");
        let records = logger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].location.as_deref(), Some("convert"));
        assert_eq!(records[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn level_serde_names() {
        assert_eq!(
            serde_json::to_string(&LogLevel::Warn).expect("serialize"),
            "\"warn\""
        );
    }
}
