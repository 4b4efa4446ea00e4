//! CSV and Excel export of a finished session

use crate::error::Result;
use crate::session::Row;
use chrono::{DateTime, Local};
use rust_xlsxwriter::{Format, Workbook};
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const HEADER: [&str; 4] = ["Time", "CPU(%)", "RAM(MB)", "Source"];
pub const SOURCE_PREFIX: &str = "Command/Source:";
pub const SHEET_NAME: &str = "Monitoring_Log";

/// Suffixed names tried before giving up on a crowded directory.
const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Xlsx => "xlsx",
        }
    }
}

/// `monitor_YYYYmmdd_HHMMSS.<ext>`
pub fn default_file_name(at: DateTime<Local>, format: ExportFormat) -> String {
    format!("monitor_{}.{}", at.format("%Y%m%d_%H%M%S"), format.extension())
}

fn csv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer)
}

pub fn write_csv<W: Write>(mut writer: W, rows: &[Row], source: &str) -> Result<()> {
    let mut table = csv_writer(&mut writer);
    table.write_record(HEADER)?;
    for row in rows {
        table.write_record([
            row.time_label(),
            format!("{:.2}", row.cpu_percent),
            format!("{:.2}", row.ram_mb),
            row.source.clone(),
        ])?;
    }
    table.flush()?;
    drop(table);

    // Blank separator line; an empty csv record would be written as `""`
    writer.write_all(b"\n")?;
    let mut footer = csv_writer(&mut writer);
    footer.write_record([SOURCE_PREFIX, source])?;
    footer.flush()?;
    Ok(())
}

/// Same layout as the CSV on a single `Monitoring_Log` sheet. Values are
/// numeric cells shown with two decimals.
pub fn write_xlsx<W: Write>(mut writer: W, rows: &[Row], source: &str) -> Result<()> {
    let mut workbook = Workbook::new();
    let two_places = Format::new().set_num_format("0.00");
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, title) in (0u16..).zip(HEADER) {
        sheet.write_string(0, col, title)?;
    }
    let mut line = 1u32;
    for row in rows {
        sheet.write_string(line, 0, row.time_label())?;
        sheet.write_number_with_format(line, 1, round2(row.cpu_percent), &two_places)?;
        sheet.write_number_with_format(line, 2, round2(row.ram_mb), &two_places)?;
        sheet.write_string(line, 3, &row.source)?;
        line += 1;
    }
    // Row `line` stays empty
    sheet.write_string(line + 1, 0, SOURCE_PREFIX)?;
    sheet.write_string(line + 1, 1, source)?;

    let buffer = workbook.save_to_buffer()?;
    writer.write_all(&buffer)?;
    writer.flush()?;
    Ok(())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn write(writer: impl Write, format: ExportFormat, rows: &[Row], source: &str) -> Result<()> {
    match format {
        ExportFormat::Csv => write_csv(writer, rows, source),
        ExportFormat::Xlsx => write_xlsx(writer, rows, source),
    }
}

/// Creates `file_name` under `dir` without replacing anything already there.
/// Taken names get a `_1`, `_2`, ... suffix before the extension.
pub fn create_unique(dir: &Path, file_name: &str) -> io::Result<(PathBuf, File)> {
    let name = Path::new(file_name);
    let stem = name.file_stem().and_then(OsStr::to_str).unwrap_or(file_name);
    let extension = name.extension().and_then(OsStr::to_str);

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (attempt, extension) {
            (0, _) => file_name.to_string(),
            (n, Some(ext)) => format!("{}_{}.{}", stem, n, ext),
            (n, None) => format!("{}_{}", stem, n),
        };
        let path = dir.join(candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", file_name, dir.display()),
    ))
}

/// Writes `rows` to a new timestamped file under `dir` and returns its path.
/// Never overwrites an earlier export.
pub fn export(dir: &Path, format: ExportFormat, rows: &[Row], source: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let (path, file) = create_unique(dir, &default_file_name(Local::now(), format))?;
    write(file, format, rows, source)?;
    Ok(path)
}

/// Writes to an explicit path, replacing it if present.
pub fn write_file(path: &Path, format: ExportFormat, rows: &[Row], source: &str) -> Result<()> {
    let file = File::create(path)?;
    write(file, format, rows, source)
}
