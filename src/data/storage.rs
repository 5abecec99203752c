//! Storage writers.
//!
//! The engine hands every channel's buffered samples to a [`Storage`] once per
//! write period:
//!
//! ```text
//! storage.open()
//! for channel:  storage.writer(name, meta, shape, period, estimate)?.add(sample)*
//! storage.close_all()
//! ```
//!
//! `add` returns `Ok(false)` for a sample older than the last one stored for the
//! channel; the caller logs that and keeps going.
//!
//! - [`CsvStorage`]: one CSV file per channel, rolled over by size (`storage_csv` feature)
//! - [`MemoryStorage`]: keeps everything in memory; used by tests

use crate::error::{AppResult, ArchiveError};
use crate::sample::{Metadata, Sample, ValueShape};
use crate::time::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Sink for one channel during one write cycle.
pub trait ChannelWriter {
    /// Store `sample`; `Ok(false)` if it is older than what is already stored.
    fn add(&mut self, sample: &Sample) -> AppResult<bool>;
}

/// Durable, time-ordered sample store.
pub trait Storage: Send {
    /// Prepare for a write cycle.
    fn open(&mut self) -> AppResult<()>;

    /// Writer for `channel`.
    ///
    /// `period` is the channel's nominal scan period and `estimate` the number
    /// of samples about to be added.
    fn writer<'a>(
        &'a mut self,
        channel: &str,
        metadata: &Metadata,
        shape: ValueShape,
        period: f64,
        estimate: usize,
    ) -> AppResult<Box<dyn ChannelWriter + 'a>>;

    /// Flush and close everything opened in this cycle.
    fn close_all(&mut self) -> AppResult<()>;
}

/// Accepts `time` unless it precedes `last`; updates `last` on success.
fn accept_in_order(last: &mut Option<Timestamp>, time: Timestamp) -> bool {
    match last {
        Some(prev) if time < *prev => false,
        _ => {
            *last = Some(time);
            true
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_storage::CsvStorage;

#[cfg(feature = "storage_csv")]
mod csv_storage {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::path::{Path, PathBuf};

    const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

    #[derive(Debug, Default)]
    struct ChannelFile {
        writer: Option<csv::Writer<File>>,
        part: u32,
        bytes: u64,
        last_time: Option<Timestamp>,
    }

    /// One CSV file per channel below a directory.
    ///
    /// Each file starts with `#` comment lines carrying the channel's metadata
    /// followed by a `time,status,severity,value` header. Once a file grows past
    /// `file_size` MB the next write cycle continues in `<channel>-<n>.csv`.
    /// File names percent-encode the channel name (`BL:current` is stored in
    /// `BL%3Acurrent.csv`).
    #[derive(Debug)]
    pub struct CsvStorage {
        dir: PathBuf,
        file_size_bytes: u64,
        files: HashMap<String, ChannelFile>,
    }

    impl CsvStorage {
        /// Storage below `dir`, rolling files over at `file_size_mb`.
        pub fn new(dir: impl Into<PathBuf>, file_size_mb: f64) -> Self {
            Self {
                dir: dir.into(),
                file_size_bytes: (file_size_mb.max(0.0) * BYTES_PER_MB) as u64,
                files: HashMap::new(),
            }
        }

        /// Directory holding the channel files.
        pub fn dir(&self) -> &Path {
            &self.dir
        }

        /// Path of the file currently used for `channel`.
        pub fn path_for(&self, channel: &str) -> PathBuf {
            let part = self.files.get(channel).map_or(0, |f| f.part);
            file_path(&self.dir, channel, part)
        }
    }

    fn file_path(dir: &Path, channel: &str, part: u32) -> PathBuf {
        let stem = encode_stem(channel);
        if part == 0 {
            dir.join(format!("{stem}.csv"))
        } else {
            dir.join(format!("{stem}-{part}.csv"))
        }
    }

    /// Percent-encode every byte except ASCII letters and digits.
    ///
    /// Distinct channel names give distinct stems, and an encoded stem never
    /// contains the `-` that separates the rollover part number.
    fn encode_stem(channel: &str) -> String {
        let mut stem = String::with_capacity(channel.len());
        for byte in channel.bytes() {
            if byte.is_ascii_alphanumeric() {
                stem.push(char::from(byte));
            } else {
                stem.push_str(&format!("%{byte:02X}"));
            }
        }
        stem
    }

    fn open_file(
        path: &Path,
        channel: &str,
        metadata: &Metadata,
        shape: ValueShape,
        period: f64,
    ) -> AppResult<(csv::Writer<File>, u64)> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut bytes = file.metadata()?.len();
        if bytes == 0 {
            let header = format!(
                "# channel: {channel}\n# period: {period}\n# type: {:?} x {}\n# units: {}\n# precision: {}\n# display: {} .. {}\n",
                shape.value_type,
                shape.count,
                metadata.units,
                metadata.precision,
                metadata.display_low,
                metadata.display_high,
            );
            file.write_all(header.as_bytes())?;
            bytes += header.len() as u64;
            let mut writer = csv::Writer::from_writer(file);
            writer.write_record(["time", "status", "severity", "value"])?;
            return Ok((writer, bytes));
        }
        let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        Ok((writer, bytes))
    }

    struct CsvChannelWriter<'a> {
        channel: String,
        file: &'a mut ChannelFile,
    }

    impl ChannelWriter for CsvChannelWriter<'_> {
        fn add(&mut self, sample: &Sample) -> AppResult<bool> {
            if !accept_in_order(&mut self.file.last_time, sample.time) {
                return Ok(false);
            }
            let writer = self.file.writer.as_mut().ok_or_else(|| {
                ArchiveError::Storage(format!("'{}' has no open file", self.channel))
            })?;
            let time = sample.time.to_rfc3339();
            let status = sample.status.to_string();
            let value = if sample.is_info() {
                String::new()
            } else {
                sample.value.to_string()
            };
            let severity = sample.severity.as_str();
            writer.write_record([time.as_str(), status.as_str(), severity, value.as_str()])?;
            self.file.bytes += (time.len() + status.len() + severity.len() + value.len() + 4) as u64;
            Ok(true)
        }
    }

    impl Storage for CsvStorage {
        fn open(&mut self) -> AppResult<()> {
            std::fs::create_dir_all(&self.dir)?;
            Ok(())
        }

        fn writer<'a>(
            &'a mut self,
            channel: &str,
            metadata: &Metadata,
            shape: ValueShape,
            period: f64,
            estimate: usize,
        ) -> AppResult<Box<dyn ChannelWriter + 'a>> {
            let limit = self.file_size_bytes;
            let file = self.files.entry(channel.to_string()).or_default();
            if limit > 0 && file.bytes >= limit {
                if let Some(mut old) = file.writer.take() {
                    old.flush()?;
                }
                file.part += 1;
                file.bytes = 0;
                tracing::info!(channel, part = file.part, "starting new data file");
            }
            if file.writer.is_none() {
                let path = file_path(&self.dir, channel, file.part);
                let (writer, bytes) = open_file(&path, channel, metadata, shape, period)?;
                tracing::debug!(channel, path = %path.display(), estimate, "opened data file");
                file.writer = Some(writer);
                file.bytes = bytes;
            }
            Ok(Box::new(CsvChannelWriter {
                channel: channel.to_string(),
                file,
            }))
        }

        fn close_all(&mut self) -> AppResult<()> {
            for file in self.files.values_mut() {
                if let Some(mut writer) = file.writer.take() {
                    writer.flush()?;
                }
            }
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    samples: HashMap<String, Vec<Sample>>,
    last_time: HashMap<String, Timestamp>,
    failing: Option<String>,
    adds_left: Option<usize>,
    opened: usize,
    closed: usize,
}

/// In-memory storage; clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything stored for `channel`, oldest first.
    pub fn samples(&self, channel: &str) -> Vec<Sample> {
        self.inner
            .lock()
            .samples
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of all channels that stored at least one sample.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.lock().samples.keys().cloned().collect();
        names.sort();
        names
    }

    /// Make every `writer()` call for `channel` fail.
    pub fn fail_channel(&self, channel: Option<&str>) {
        self.inner.lock().failing = channel.map(str::to_string);
    }

    /// Let only `adds` more `add()` calls succeed; `None` lifts the limit.
    pub fn fail_adds_after(&self, adds: Option<usize>) {
        self.inner.lock().adds_left = adds;
    }

    /// Number of completed write cycles.
    pub fn cycles(&self) -> usize {
        self.inner.lock().closed
    }

    /// Whether an `open()` is not yet matched by `close_all()`.
    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock();
        inner.opened > inner.closed
    }
}

struct MemoryChannelWriter<'a> {
    channel: String,
    inner: &'a Mutex<MemoryInner>,
}

impl ChannelWriter for MemoryChannelWriter<'_> {
    fn add(&mut self, sample: &Sample) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        match inner.adds_left.as_mut() {
            Some(0) => {
                return Err(ArchiveError::Storage(format!(
                    "cannot add to '{}'",
                    self.channel
                )))
            }
            Some(left) => *left -= 1,
            None => {}
        }
        let mut last = inner.last_time.get(&self.channel).copied();
        if !accept_in_order(&mut last, sample.time) {
            return Ok(false);
        }
        if let Some(time) = last {
            inner.last_time.insert(self.channel.clone(), time);
        }
        inner
            .samples
            .entry(self.channel.clone())
            .or_default()
            .push(sample.clone());
        Ok(true)
    }
}

impl Storage for MemoryStorage {
    fn open(&mut self) -> AppResult<()> {
        self.inner.lock().opened += 1;
        Ok(())
    }

    fn writer<'a>(
        &'a mut self,
        channel: &str,
        _metadata: &Metadata,
        _shape: ValueShape,
        _period: f64,
        _estimate: usize,
    ) -> AppResult<Box<dyn ChannelWriter + 'a>> {
        if self.inner.lock().failing.as_deref() == Some(channel) {
            return Err(ArchiveError::Storage(format!("cannot write '{channel}'")));
        }
        Ok(Box::new(MemoryChannelWriter {
            channel: channel.to_string(),
            inner: &self.inner,
        }))
    }

    fn close_all(&mut self) -> AppResult<()> {
        self.inner.lock().closed += 1;
        Ok(())
    }
}
