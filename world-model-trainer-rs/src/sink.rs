//! Destinations for scalar and text log events.
//!
//! The runner and trainer emit events through [`MetricsSink`] and never know
//! where they end up. Three sinks ship with the crate:
//!
//! - [`NullSink`] drops everything (debug runs)
//! - [`JsonlSink`] appends one JSON object per event to
//!   `<base>/version_<n>/metrics.jsonl`
//! - [`MemorySink`] keeps events in memory for inspection

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Receiver of log events.
pub trait MetricsSink {
    /// Records a scalar value at a step.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be persisted.
    fn record_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<()>;

    /// Records a block of text at a step.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be persisted.
    fn record_text(&mut self, name: &str, text: &str, step: u64) -> Result<()>;

    /// Flushes buffered events.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying writer fails.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Directory holding this sink's run artifacts, if any.
    fn log_dir(&self) -> Option<&Path> {
        None
    }
}

/// One logged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEvent {
    /// A scalar value.
    Scalar {
        /// Metric name.
        name: String,
        /// Metric value.
        value: f64,
        /// Step the value belongs to.
        step: u64,
    },
    /// A text entry.
    Text {
        /// Entry name.
        name: String,
        /// Entry body.
        text: String,
        /// Step the entry belongs to.
        step: u64,
    },
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_scalar(&mut self, _name: &str, _value: f64, _step: u64) -> Result<()> {
        Ok(())
    }

    fn record_text(&mut self, _name: &str, _text: &str, _step: u64) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Vec<LogEvent>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in emission order.
    #[must_use]
    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    /// `(step, value)` pairs recorded under `name`.
    #[must_use]
    pub fn scalars(&self, name: &str) -> Vec<(u64, f64)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                LogEvent::Scalar {
                    name: n,
                    value,
                    step,
                } if n == name => Some((*step, *value)),
                _ => None,
            })
            .collect()
    }

    /// Text bodies recorded under `name`.
    #[must_use]
    pub fn texts(&self, name: &str) -> Vec<(u64, String)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                LogEvent::Text {
                    name: n,
                    text,
                    step,
                } if n == name => Some((*step, text.clone())),
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn record_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<()> {
        self.events.push(LogEvent::Scalar {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn record_text(&mut self, name: &str, text: &str, step: u64) -> Result<()> {
        self.events.push(LogEvent::Text {
            name: name.to_string(),
            text: text.to_string(),
            step,
        });
        Ok(())
    }
}

/// File name of the event log inside a run directory.
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Sink writing JSON lines into a fresh versioned run directory.
#[derive(Debug)]
pub struct JsonlSink {
    log_dir: PathBuf,
    version: u32,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Creates `<base_dir>/version_<n>` with the next free `n` and opens its
    /// event log.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub fn create<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        fs::create_dir_all(base_dir)?;

        let version = next_version(base_dir)?;
        let log_dir = base_dir.join(format!("version_{version}"));
        fs::create_dir_all(&log_dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(METRICS_FILE))?;

        tracing::info!(log_dir = %log_dir.display(), "opened metrics sink");

        Ok(Self {
            log_dir,
            version,
            writer: BufWriter::new(file),
        })
    }

    /// Version number of this run directory.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    fn write_event(&mut self, event: &LogEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl MetricsSink for JsonlSink {
    fn record_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<()> {
        self.write_event(&LogEvent::Scalar {
            name: name.to_string(),
            value,
            step,
        })
    }

    fn record_text(&mut self, name: &str, text: &str, step: u64) -> Result<()> {
        self.write_event(&LogEvent::Text {
            name: name.to_string(),
            text: text.to_string(),
            step,
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn log_dir(&self) -> Option<&Path> {
        Some(&self.log_dir)
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("failed to flush metrics log: {e}");
        }
    }
}

/// Smallest `n` greater than every existing `version_<n>` under `base_dir`.
fn next_version(base_dir: &Path) -> Result<u32> {
    let mut next = 0;
    for entry in fs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let parsed = name
            .to_str()
            .and_then(|n| n.strip_prefix("version_"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(v) = parsed {
            next = next.max(v + 1);
        }
    }
    Ok(next)
}
