//! Scalar summary sinks.
//!
//! Metric callbacks write named scalars tagged with an epoch. Every write to
//! a [`SummaryWriter`] is flushed before returning, so an interrupted run
//! keeps all epochs completed so far.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use xray_core::{Error, Result, ScalarRecord};

/// File name of the scalar log inside a log directory
pub const SCALARS_FILE: &str = "scalars.jsonl";

/// Destination of per-epoch scalars
pub trait ScalarSink: Send {
    fn write_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Appends scalars as JSON lines to `<log_dir>/scalars.jsonl`
pub struct SummaryWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SummaryWriter {
    pub fn create(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)?;

        let path = log_dir.join(SCALARS_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!("Writing scalar summaries to {}", path.display());

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for SummaryWriter {
    fn write_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord::new(name, value, step);
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads back a scalar log written by [`SummaryWriter`]
pub fn read_scalars(path: impl AsRef<Path>) -> Result<Vec<ScalarRecord>> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            records.push(serde_json::from_str(&line)?);
        }
    }
    Ok(records)
}

/// In-memory sink; clones share the same record list
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ScalarRecord>>>,
    flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records tagged with `step`
    pub fn step(&self, step: usize) -> Vec<ScalarRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.step == step)
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().map(|f| *f).unwrap_or(0)
    }
}

impl ScalarSink for MemorySink {
    fn write_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| Error::Serialization("scalar buffer poisoned".into()))?
            .push(ScalarRecord::new(name, value, step));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        *self
            .flushes
            .lock()
            .map_err(|_| Error::Serialization("scalar buffer poisoned".into()))? += 1;
        Ok(())
    }
}

/// Forwards every scalar to several sinks, stopping at the first failure
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ScalarSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn ScalarSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn ScalarSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ScalarSink for FanoutSink {
    fn write_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        for sink in &mut self.sinks {
            sink.write_scalar(name, value, step)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}
