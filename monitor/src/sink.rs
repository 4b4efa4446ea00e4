//! Row batch consumers

use crate::error::{MonitorError, Result};
use crate::export::{self, ExportFormat};
use crate::session::Row;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{info, warn};

/// Receives rows as the flush policy releases them. Batches arrive in order,
/// never overlap, and are append-only.
pub trait Sink: Send {
    fn announce_target(&mut self, label: &str);

    /// `is_final` marks the last batch of a session (possibly empty).
    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn announce_target(&mut self, label: &str) {
        (**self).announce_target(label)
    }

    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()> {
        (**self).deliver(rows, is_final)
    }
}

/// Prints the metric log as a fixed-width table.
pub struct ConsoleSink<W = io::Stdout> {
    out: W,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn format_row(row: &Row) -> String {
    format!(
        "{:<10} {:<10.2} {:<12.2} {}",
        row.time_label(),
        row.cpu_percent,
        row.ram_mb,
        row.source
    )
}

impl<W: Write + Send> Sink for ConsoleSink<W> {
    fn announce_target(&mut self, label: &str) {
        let printed = writeln!(self.out, "\nDetected training from: {}", label)
            .and_then(|_| writeln!(self.out, "{:<10} {:<10} {:<12} Source", "Time", "CPU (%)", "RAM (MB)"));
        if let Err(e) = printed {
            warn!("Failed to print target announcement: {}", e);
        }
    }

    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()> {
        for row in rows {
            writeln!(self.out, "{}", format_row(row))?;
        }
        if is_final {
            writeln!(self.out, "\nTraining stopped.")?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Collects a session's rows and writes them to one export file when the
/// session ends. Each session gets its own file, even within the same second.
pub struct FileSink {
    format: ExportFormat,
    directory: PathBuf,
    label: String,
    rows: Vec<Row>,
    written: Vec<PathBuf>,
}

impl FileSink {
    pub fn new(format: ExportFormat, directory: impl Into<PathBuf>) -> Self {
        Self {
            format,
            directory: directory.into(),
            label: String::new(),
            rows: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn csv(directory: impl Into<PathBuf>) -> Self {
        Self::new(ExportFormat::Csv, directory)
    }

    pub fn xlsx(directory: impl Into<PathBuf>) -> Self {
        Self::new(ExportFormat::Xlsx, directory)
    }

    /// Files written so far, one per finished session.
    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }
}

impl Sink for FileSink {
    fn announce_target(&mut self, label: &str) {
        self.label = label.to_string();
        self.rows.clear();
    }

    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()> {
        self.rows.extend_from_slice(rows);
        if !is_final {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.rows);
        if rows.is_empty() {
            return Ok(());
        }
        let path = export::export(&self.directory, self.format, &rows, &self.label)
            .map_err(|e| MonitorError::Export(format!("{}: {}", self.directory.display(), e)))?;
        info!("Saved {} to {:?}", self.format.extension().to_uppercase(), path);
        self.written.push(path);
        Ok(())
    }
}

/// Delivers to several sinks. Every sink sees every batch; the first failure
/// is reported after all have been tried.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn Sink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Sink for Fanout {
    fn announce_target(&mut self, label: &str) {
        for sink in &mut self.sinks {
            sink.announce_target(label);
        }
    }

    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.deliver(rows, is_final) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
