//! Companion telemetry CSV writer

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use camera_capture::{TelemetrySample, TELEMETRY_CSV_HEADER};
use tracing::debug;

/// Writes one segment's `sensors*.csv`
///
/// Rows are kept in timestamp order across segments: a writer seeded with
/// the previous segment's last timestamp drops any earlier sample.
pub struct TelemetryWriter {
    path: PathBuf,
    out: BufWriter<File>,
    last_timestamp: Option<u64>,
    rows: u64,
    dropped: u64,
}

impl TelemetryWriter {
    /// Create the file and write the header row
    pub fn create(path: impl AsRef<Path>, floor: Option<u64>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut out = BufWriter::new(File::create(&path)?);
        writeln!(out, "{}", TELEMETRY_CSV_HEADER)?;
        out.flush()?;
        Ok(Self {
            path,
            out,
            last_timestamp: floor,
            rows: 0,
            dropped: 0,
        })
    }

    /// Append a sample; returns false if it was dropped as out of order
    pub fn append(&mut self, sample: &TelemetrySample) -> io::Result<bool> {
        if let Some(last) = self.last_timestamp {
            if sample.timestamp_ms < last {
                self.dropped += 1;
                debug!(
                    timestamp = sample.timestamp_ms,
                    floor = last,
                    "Dropping out-of-order telemetry sample"
                );
                return Ok(false);
            }
        }
        writeln!(self.out, "{}", sample.to_csv_row())?;
        self.last_timestamp = Some(sample.timestamp_ms);
        self.rows += 1;
        Ok(true)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    /// Flush and fsync
    pub fn finish(mut self) -> io::Result<u64> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.rows)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.last_timestamp
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
