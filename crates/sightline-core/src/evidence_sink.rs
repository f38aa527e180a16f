#![forbid(unsafe_code)]

//! JSONL evidence log of visibility transitions.
//!
//! When enabled, the registry appends one JSON object per line for every
//! transition it dispatches and every callback it had to isolate. Lines are
//! written in dispatch order behind a mutex, so one sink can be shared by
//! several registries and still produce a readable log.
//!
//! ```text
//! {"event":"visibility_transition","batch":3,"target":"ElementId(1)","visible":true,"ratio":0.5,"once":false}
//! {"event":"callback_failure","batch":3,"target":"ElementId(2)","visible":false,"message":"boom"}
//! ```

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;

/// Destination for evidence lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvidenceSinkDestination {
    Stdout,
    /// Append to a file, creating it if needed.
    File(PathBuf),
}

impl EvidenceSinkDestination {
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }
}

/// Evidence logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceSinkConfig {
    pub enabled: bool,
    pub destination: EvidenceSinkDestination,
    /// Flush after every line.
    pub flush_on_write: bool,
}

impl Default for EvidenceSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: EvidenceSinkDestination::Stdout,
            flush_on_write: true,
        }
    }
}

impl EvidenceSinkConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enabled_stdout() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn enabled_file(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            destination: EvidenceSinkDestination::file(path),
            flush_on_write: true,
        }
    }

    #[must_use]
    pub fn with_flush_on_write(mut self, enabled: bool) -> Self {
        self.flush_on_write = enabled;
        self
    }
}

struct EvidenceSinkInner {
    writer: BufWriter<Box<dyn Write + Send>>,
    flush_on_write: bool,
}

/// Shared JSONL writer for visibility evidence.
#[derive(Clone)]
pub struct EvidenceSink {
    inner: Arc<Mutex<EvidenceSinkInner>>,
}

impl std::fmt::Debug for EvidenceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceSink").finish_non_exhaustive()
    }
}

impl EvidenceSink {
    /// Build a sink from config. Returns `Ok(None)` when disabled.
    pub fn from_config(config: &EvidenceSinkConfig) -> io::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let writer: Box<dyn Write + Send> = match &config.destination {
            EvidenceSinkDestination::Stdout => Box::new(io::stdout()),
            EvidenceSinkDestination::File(path) => {
                Box::new(OpenOptions::new().create(true).append(true).open(path)?)
            }
        };

        Ok(Some(Self::from_writer(writer, config.flush_on_write)))
    }

    /// Wrap an arbitrary writer.
    #[must_use]
    pub fn from_writer(writer: Box<dyn Write + Send>, flush_on_write: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EvidenceSinkInner {
                writer: BufWriter::new(writer),
                flush_on_write,
            })),
        }
    }

    /// Record a dispatched transition.
    pub fn write_transition(
        &self,
        batch: u64,
        target: &str,
        visible: bool,
        ratio: f64,
        once: bool,
    ) -> io::Result<()> {
        let line = json!({
            "event": "visibility_transition",
            "batch": batch,
            "target": target,
            "visible": visible,
            "ratio": ratio,
            "once": once,
        });
        self.write_jsonl(&line.to_string())
    }

    /// Record a callback that panicked during dispatch.
    pub fn write_failure(
        &self,
        batch: u64,
        target: &str,
        visible: bool,
        message: &str,
    ) -> io::Result<()> {
        let line = json!({
            "event": "callback_failure",
            "batch": batch,
            "target": target,
            "visible": visible,
            "message": message,
        });
        self.write_jsonl(&line.to_string())
    }

    /// Write one line plus newline, flushing if configured.
    pub fn write_jsonl(&self, line: &str) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.write_all(b"\n")?;
        if inner.flush_on_write {
            inner.writer.flush()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.writer.flush()
    }
}
