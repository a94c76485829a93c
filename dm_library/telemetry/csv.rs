//! Telemetry CSV logging
//!
//! Rows are appended and flushed one at a time; the header is written only
//! when the file is new or empty.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use dm_core::error::DmResult;

use super::{TelemetrySample, TelemetrySink};
use crate::protocol::FeedbackEngineering;

pub const CSV_HEADERS: [&str; 9] = [
    "timestamp",
    "esc_id",
    "mst_id",
    "status",
    "position_rad",
    "velocity_rad_s",
    "torque_nm",
    "temp_mos_c",
    "temp_rotor_c",
];

/// One CSV row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryRow {
    pub timestamp: f64,
    pub esc_id: u8,
    pub mst_id: u16,
    pub status: u8,
    pub position_rad: f64,
    pub velocity_rad_s: f64,
    pub torque_nm: f64,
    pub temp_mos_c: f64,
    pub temp_rotor_c: f64,
}

impl TelemetryRow {
    pub fn from_engineering(engineering: &FeedbackEngineering, mst_id: u16, timestamp: f64) -> Self {
        Self {
            timestamp,
            esc_id: engineering.esc_id,
            mst_id,
            status: engineering.status,
            position_rad: engineering.position_rad,
            velocity_rad_s: engineering.velocity_rad_s,
            torque_nm: engineering.torque_nm,
            temp_mos_c: engineering.temp_mos_c,
            temp_rotor_c: engineering.temp_rotor_c,
        }
    }
}

impl From<&TelemetrySample> for TelemetryRow {
    fn from(sample: &TelemetrySample) -> Self {
        Self::from_engineering(&sample.engineering, sample.mst_id, sample.unix_time)
    }
}

/// Appends telemetry rows to a CSV file
pub struct TelemetryCsvWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TelemetryCsvWriter {
    /// Open `path` for appending, creating parent directories and the header as needed
    pub fn open(path: impl AsRef<Path>) -> DmResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let need_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
        };
        if need_header {
            writer.write_header()?;
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_header(&mut self) -> DmResult<()> {
        writeln!(self.writer, "{}", CSV_HEADERS.join(","))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_row(&mut self, row: &TelemetryRow) -> DmResult<()> {
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{},{},{}",
            row.timestamp,
            row.esc_id,
            row.mst_id,
            row.status,
            row.position_rad,
            row.velocity_rad_s,
            row.torque_nm,
            row.temp_mos_c,
            row.temp_rotor_c
        )?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn write_rows<'a, I>(&mut self, rows: I) -> DmResult<()>
    where
        I: IntoIterator<Item = &'a TelemetryRow>,
    {
        for row in rows {
            self.write_row(row)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> DmResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// [`TelemetrySink`] that logs every sample to CSV
pub struct CsvTelemetrySink {
    writer: Mutex<TelemetryCsvWriter>,
}

impl CsvTelemetrySink {
    pub fn open(path: impl AsRef<Path>) -> DmResult<Self> {
        Ok(Self {
            writer: Mutex::new(TelemetryCsvWriter::open(path)?),
        })
    }
}

impl TelemetrySink for CsvTelemetrySink {
    fn record(&self, sample: &TelemetrySample) -> DmResult<()> {
        self.writer.lock().write_row(&TelemetryRow::from(sample))
    }
}
