/// Durable append-only log of every measurement set
use log::info;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::models::{MeasurementSet, CHANNELS};
use crate::utils::{format_reading, format_timestamp};

/// Row-oriented append-only sink
pub trait DurableStore: Send {
    fn exists(&self) -> bool;
    fn append_row(&mut self, fields: &[String]) -> Result<(), StorageError>;
}

/// CSV file store, reopened in append mode for every row
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableStore for CsvStore {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn append_row(&mut self, fields: &[String]) -> Result<(), StorageError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(file);
        writer.write_record(fields)?;
        writer.flush()?;
        Ok(())
    }
}

/// Header row: `Timestamp` followed by each channel's label with units
pub fn header_row() -> Vec<String> {
    std::iter::once("Timestamp")
        .chain(CHANNELS.iter().map(|c| c.log_label))
        .map(str::to_string)
        .collect()
}

/// Data row; an invalid set keeps its timestamp and leaves every value empty
pub fn data_row(set: &MeasurementSet) -> Vec<String> {
    let mut row = Vec::with_capacity(CHANNELS.len() + 1);
    row.push(format_timestamp(&set.captured_at));
    row.extend(
        (0..CHANNELS.len()).map(|i| set.reading(i).map(format_reading).unwrap_or_default()),
    );
    row
}

/// Appends measurement sets to a [`DurableStore`], writing the header once
///
/// Whether the header exists is decided when the recorder is created. A store
/// removed or truncated while running does not get a new header.
pub struct Recorder<S> {
    store: S,
    header_written: bool,
}

impl<S: DurableStore> Recorder<S> {
    pub fn new(store: S) -> Self {
        let header_written = store.exists();
        Self {
            store,
            header_written,
        }
    }

    pub fn record(&mut self, set: &MeasurementSet) -> Result<(), StorageError> {
        if !self.header_written {
            self.store.append_row(&header_row())?;
            self.header_written = true;
            info!("Wrote log header");
        }
        self.store.append_row(&data_row(set))
    }
}
