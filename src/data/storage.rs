//! Dataset persistence.
//!
//! A finished (or partial) acquisition buffer is handed to a [`DatasetSink`]
//! exactly once. The CSV sink writes a commented JSON header block followed by
//! one row per sample:
//!
//! ```text
//! # {
//! #   "run_id": "6f0c...",
//! #   "mode": "CA",
//! #   ...
//! # }
//! time_s,potential_V,current_A
//! 0,0.5,0.00025
//! ...
//! ```
//!
//! Files are written to a temporary file in the target folder and renamed into
//! place, so a reader never sees a half-written dataset.

use crate::data::acquisition::{ReductionPolicy, Sample};
use crate::error::{AppResult, DaqError};
use crate::experiment::schema::{MeasurementParams, ModeName};
use crate::hardware::TiaGain;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use uuid::Uuid;

/// Column row of the CSV body.
pub const CSV_COLUMNS: [&str; 3] = ["time_s", "potential_V", "current_A"];

/// Final status recorded in a dataset header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still acquiring; never persisted.
    Running,
    /// Every segment was driven to the end.
    Completed,
    /// Ended early; the dataset is partial.
    Aborted,
}

/// Everything needed to reconstruct the run that produced a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetHeader {
    /// Unique id of the run
    pub run_id: Uuid,
    /// Measurement mode
    pub mode: ModeName,
    /// Normalized parameters the waveform was built from
    pub params: MeasurementParams,
    /// [`TiaGain`] index
    pub tia_gain: u8,
    /// Seconds between samples
    pub sampling_interval_s: f64,
    /// Reduction applied before storage, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduction: Option<ReductionPolicy>,
    /// Wall-clock start of acquisition
    pub started_at: DateTime<Utc>,
    /// Outcome of the run
    pub status: RunStatus,
    /// Reason of an aborted run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of stored samples
    #[serde(default)]
    pub sample_count: usize,
}

impl DatasetHeader {
    /// Header of a run starting now, with a fresh run id.
    pub fn new(
        params: MeasurementParams,
        tia_gain: TiaGain,
        sampling_interval_s: f64,
        reduction: Option<ReductionPolicy>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode: params.mode(),
            params,
            tia_gain: tia_gain.index(),
            sampling_interval_s,
            reduction,
            started_at: Utc::now(),
            status: RunStatus::Running,
            error: None,
            sample_count: 0,
        }
    }
}

/// A persisted dataset.
///
/// The samples are moved in from the acquisition buffer after they have been
/// written, so headless callers can use them without re-reading the file.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetHandle {
    /// Header as persisted, with final status and sample count
    pub header: DatasetHeader,
    /// `None` for in-memory datasets
    pub path: Option<PathBuf>,
    /// Stored samples, after reduction
    pub samples: Vec<Sample>,
}

impl DatasetHandle {
    /// True unless the run completed.
    pub fn is_partial(&self) -> bool {
        self.header.status != RunStatus::Completed
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no sample was stored.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Destination of a finished acquisition buffer.
///
/// `persist` runs on a blocking thread.
pub trait DatasetSink: Send {
    /// Store `samples` under `header` and return the resulting handle.
    fn persist(&mut self, header: DatasetHeader, samples: Vec<Sample>) -> AppResult<DatasetHandle>;

    /// Short description for logs, e.g. the target path.
    fn describe(&self) -> String;
}

/// Caller-owned description of where a run's data goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkDescriptor {
    /// CSV file in `folder`; the name defaults to [`default_file_name`].
    Csv {
        /// Target directory, created if missing
        folder: PathBuf,
        /// Explicit file name
        #[serde(default)]
        file_name: Option<String>,
    },
    /// Keep the dataset in memory only.
    Memory,
}

impl SinkDescriptor {
    /// CSV sink in `folder` with the default file name.
    pub fn csv(folder: impl Into<PathBuf>) -> Self {
        SinkDescriptor::Csv {
            folder: folder.into(),
            file_name: None,
        }
    }

    /// Build the sink for a run described by `header`.
    pub fn open(&self, header: &DatasetHeader) -> Box<dyn DatasetSink> {
        match self {
            SinkDescriptor::Csv { folder, file_name } => {
                let name = file_name
                    .clone()
                    .unwrap_or_else(|| default_file_name(header.started_at, header.mode, header.tia_gain));
                Box::new(CsvSink::new(folder.join(name)))
            }
            SinkDescriptor::Memory => Box::new(MemorySink),
        }
    }
}

/// `{YYYYmmdd_HHhMMmSSs}_{MODE}_tia{gain}.csv`
pub fn default_file_name(started_at: DateTime<Utc>, mode: ModeName, tia_gain: u8) -> String {
    format!(
        "{}_{}_tia{}.csv",
        started_at.format("%Y%m%d_%Hh%Mm%Ss"),
        mode,
        tia_gain
    )
}

/// Atomic CSV writer.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    /// Sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Final file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_to(file: &mut NamedTempFile, header: &DatasetHeader, samples: &[Sample]) -> AppResult<()> {
        let mut out = BufWriter::new(file.as_file_mut());
        let json = serde_json::to_string_pretty(header)?;
        for line in json.lines() {
            writeln!(out, "# {line}")?;
        }

        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(CSV_COLUMNS)?;
        for sample in samples {
            writer.write_record(&[
                sample.time_s.to_string(),
                sample.potential.to_string(),
                sample.current.to_string(),
            ])?;
        }
        writer.flush()?;
        let out = writer
            .into_inner()
            .map_err(|e| DaqError::Storage(format!("failed to finish CSV body: {e}")))?;
        out.into_inner()
            .map_err(|e| DaqError::Storage(format!("failed to flush CSV file: {e}")))?
            .sync_all()?;
        Ok(())
    }
}

impl DatasetSink for CsvSink {
    fn persist(&mut self, mut header: DatasetHeader, samples: Vec<Sample>) -> AppResult<DatasetHandle> {
        header.sample_count = samples.len();
        let folder = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !folder.exists() {
            fs::create_dir_all(&folder)
                .map_err(|e| DaqError::Storage(format!("cannot create {}: {e}", folder.display())))?;
        }

        let mut file = NamedTempFile::new_in(&folder)?;
        Self::write_to(&mut file, &header, &samples)?;
        file.persist(&self.path)
            .map_err(|e| DaqError::Storage(format!("cannot move dataset into place: {}", e.error)))?;

        info!(
            path = %self.path.display(),
            samples = samples.len(),
            status = ?header.status,
            "Dataset written"
        );
        Ok(DatasetHandle {
            header,
            path: Some(self.path.clone()),
            samples,
        })
    }

    fn describe(&self) -> String {
        format!("csv {}", self.path.display())
    }
}

/// Keeps the dataset in the returned handle only.
pub struct MemorySink;

impl DatasetSink for MemorySink {
    fn persist(&mut self, mut header: DatasetHeader, samples: Vec<Sample>) -> AppResult<DatasetHandle> {
        header.sample_count = samples.len();
        debug!(samples = samples.len(), "Dataset kept in memory");
        Ok(DatasetHandle {
            header,
            path: None,
            samples,
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Read a dataset written by [`CsvSink`].
pub fn read_dataset(path: impl AsRef<Path>) -> AppResult<(DatasetHeader, Vec<Sample>)> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;

    let json: String = text
        .lines()
        .take_while(|line| line.starts_with('#'))
        .map(|line| line.trim_start_matches('#').strip_prefix(' ').unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n");
    if json.is_empty() {
        return Err(DaqError::Storage(format!(
            "{} has no dataset header",
            path.display()
        )));
    }
    let header: DatasetHeader = serde_json::from_str(&json)?;

    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .has_headers(true)
        .from_reader(text.as_bytes());
    let columns = reader.headers()?.clone();
    if columns.iter().ne(CSV_COLUMNS) {
        return Err(DaqError::Storage(format!(
            "{}: unexpected columns {:?}",
            path.display(),
            columns
        )));
    }

    let mut samples = Vec::with_capacity(header.sample_count);
    for row in reader.deserialize::<(f64, f64, f64)>() {
        let (time_s, potential, current) = row?;
        samples.push(Sample {
            time_s,
            potential,
            current,
        });
    }
    Ok((header, samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::schema::CaParams;
    use chrono::TimeZone;

    fn header() -> DatasetHeader {
        DatasetHeader::new(
            MeasurementParams::Ca(CaParams {
                potential: 0.5,
                duration: 1.0,
            }),
            TiaGain::R100k,
            0.01,
            Some(ReductionPolicy::Decimate { window: 2 }),
        )
    }

    fn samples() -> Vec<Sample> {
        (0..50)
            .map(|i| Sample {
                time_s: f64::from(i) * 0.01 + 1e-7,
                potential: 0.5 - f64::from(i) * 1.3e-6,
                current: 2.5e-4 + f64::from(i) * 3.7e-11,
            })
            .collect()
    }

    #[test]
    fn csv_round_trip_preserves_samples_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut header = header();
        header.status = RunStatus::Completed;

        let handle = CsvSink::new(&path).persist(header.clone(), samples()).unwrap();
        assert_eq!(handle.path.as_deref(), Some(path.as_path()));
        assert_eq!(handle.header.sample_count, 50);

        let (read_header, read_samples) = read_dataset(&path).unwrap();
        assert_eq!(read_header.run_id, header.run_id);
        assert_eq!(read_header.params, header.params);
        assert_eq!(read_header.reduction, header.reduction);
        assert_eq!(read_header.status, RunStatus::Completed);
        assert_eq!(read_samples.len(), 50);
        for (a, b) in read_samples.iter().zip(samples()) {
            assert!((a.time_s - b.time_s).abs() < 1e-12);
            assert!((a.potential - b.potential).abs() < 1e-12);
            assert!((a.current - b.current).abs() < 1e-18);
        }
    }

    #[test]
    fn header_block_is_commented_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        CsvSink::new(&path).persist(header(), Vec::new()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("# {"));
        assert!(text.contains("#   \"mode\": \"CA\""));
        assert!(text.contains("#   \"tia_gain\": 2"));
        assert!(text.lines().any(|l| l == "time_s,potential_V,current_A"));
    }

    #[test]
    fn creates_missing_folders_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("nested").join("runs");
        let path = folder.join("run.csv");
        CsvSink::new(&path).persist(header(), samples()).unwrap();

        let entries: Vec<_> = fs::read_dir(&folder).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(path.exists());
    }

    #[test]
    fn default_file_name_matches_convention() {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            default_file_name(started, ModeName::Cv, 3),
            "20240309_14h05m07s_CV_tia3.csv"
        );
    }

    #[test]
    fn descriptor_resolves_default_name() {
        let dir = tempfile::tempdir().unwrap();
        let header = header();
        let sink = SinkDescriptor::csv(dir.path()).open(&header);
        let expected = default_file_name(header.started_at, ModeName::Ca, 2);
        assert!(sink.describe().ends_with(&expected));
        assert_eq!(SinkDescriptor::Memory.open(&header).describe(), "memory");
    }

    #[test]
    fn memory_sink_moves_samples_into_handle() {
        let handle = MemorySink.persist(header(), samples()).unwrap();
        assert!(handle.path.is_none());
        assert_eq!(handle.len(), 50);
        assert!(handle.is_partial());
    }

    #[test]
    fn reading_a_file_without_header_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.csv");
        fs::write(&path, "time_s,potential_V,current_A\n0,0,0\n").unwrap();
        assert!(matches!(read_dataset(&path), Err(DaqError::Storage(_))));
    }
}
