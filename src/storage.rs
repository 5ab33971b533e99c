//! CSV recording of readings.
//!
//! One row per [`Reading`], under the header
//! `voltage,current,timestamp,voltage_changed`. Optional metadata (typically the
//! [`ScanConfig`](crate::config::ScanConfig) the scan ran with) is written above the
//! header as pretty JSON, one `# `-prefixed line per JSON line. Readers of such a
//! file must skip comments, e.g. `csv::ReaderBuilder::new().comment(Some(b'#'))`.

use crate::acquisition::Reading;
use crate::error::AppResult;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Streams readings into CSV.
pub struct CsvRecorder<W: Write> {
    writer: csv::Writer<W>,
    rows: u64,
}

impl CsvRecorder<BufWriter<File>> {
    /// Create (or truncate) `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let file = File::create(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Recording readings to CSV");
        Self::from_writer(BufWriter::new(file))
    }

    /// Create (or truncate) `path` and write `metadata` above the header.
    ///
    /// The metadata lines start with `#`; a default `csv::Reader` treats them as
    /// records, so read the file with `.comment(Some(b'#'))`.
    pub fn create_with_metadata<P: AsRef<Path>, M: Serialize>(
        path: P,
        metadata: &M,
    ) -> AppResult<Self> {
        let file = File::create(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Recording readings to CSV");
        Self::from_writer_with_metadata(BufWriter::new(file), metadata)
    }
}

impl<W: Write> CsvRecorder<W> {
    /// Record into an arbitrary writer. The header is written immediately.
    pub fn from_writer(inner: W) -> AppResult<Self> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);
        writer.write_record(["voltage", "current", "timestamp", "voltage_changed"])?;
        Ok(Self { writer, rows: 0 })
    }

    /// Write `metadata` as commented JSON, then the header.
    pub fn from_writer_with_metadata<M: Serialize>(mut inner: W, metadata: &M) -> AppResult<Self> {
        let json = serde_json::to_string_pretty(metadata).map_err(std::io::Error::from)?;
        for line in json.lines() {
            writeln!(inner, "# {}", line)?;
        }
        Self::from_writer(inner)
    }

    /// Append one reading.
    pub fn record(&mut self, reading: &Reading) -> AppResult<()> {
        self.writer.serialize(reading)?;
        self.rows += 1;
        Ok(())
    }

    /// Rows recorded so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush everything and return the number of rows written.
    pub fn finish(mut self) -> AppResult<u64> {
        self.writer.flush()?;
        info!(rows = self.rows, "CSV recording finished");
        Ok(self.rows)
    }
}
