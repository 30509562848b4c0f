//! Structured Logging with Tracing

use crate::{Result, TelemetryError};
use dmstack_config::{LogConfig, LogFormat, LogLevel, LogOutput};
use parking_lot::Mutex;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Filter for the configured level
///
/// `RUST_LOG` wins when it is set and parses.
pub fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber
///
/// # Errors
///
/// Fails if a subscriber is already installed, if `output` is `file`
/// without a path, or if the log file cannot be opened.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = build_filter(config.level);

    match config.output {
        LogOutput::Stdout => apply_fmt(config.format, std::io::stdout, filter),
        LogOutput::Stderr => apply_fmt(config.format, std::io::stderr, filter),
        LogOutput::File => {
            let path = config.file_path.as_deref().ok_or_else(|| {
                TelemetryError::Logging("log output is 'file' but file_path is not set".to_string())
            })?;
            apply_fmt(config.format, SharedFile::open(path)?, filter)
        }
    }
}

/// Append-only log file shared by every writer the subscriber hands out
#[derive(Clone)]
pub struct SharedFile {
    file: Arc<Mutex<File>>,
}

impl SharedFile {
    /// Open `path` for appending, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.lock().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedFile {
    type Writer = Self;
    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn apply_fmt<W>(format: LogFormat, writer: W, filter: EnvFilter) -> Result<()>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let init_result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_writer(writer)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_writer(writer)
            .with_env_filter(filter)
            .try_init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_target(false)
            .with_writer(writer)
            .with_env_filter(filter)
            .try_init(),
    };
    init_result.map_err(|e| TelemetryError::Init(format!("Failed to init subscriber: {e}")))
}

/// A named phase that logs its duration when dropped
pub struct PhaseGuard {
    _span: tracing::span::EnteredSpan,
    start: Instant,
    name: String,
}

impl PhaseGuard {
    /// Time since the phase was entered
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        let duration_ms = self.start.elapsed().as_millis() as u64;
        tracing::info!(phase = self.name.as_str(), duration_ms, "phase completed");
    }
}

/// Builder for [`PhaseGuard`]
///
/// Fields are rendered into the span's `detail` as `key=value` pairs.
pub struct PhaseBuilder {
    name: String,
    fields: Vec<(String, String)>,
}

impl PhaseBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    fn detail(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Enter the phase span
    pub fn enter(self) -> PhaseGuard {
        let detail = self.detail();
        let span = tracing::info_span!("phase", name = %self.name, detail = %detail);
        tracing::debug!(parent: &span, "phase started");
        PhaseGuard {
            _span: span.entered(),
            start: Instant::now(),
            name: self.name,
        }
    }
}

#[cfg(test)]
mod tests;
