//! WAL writer implementation

use super::{list_segments, segment_path, SyncPolicy, WalConfig, WalRecord};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Instant;
use tracing::debug;

/// WAL writer for appending records to disk
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Open the WAL directory and start a fresh segment after any existing
    /// ones, so a torn tail in the last segment is never appended to.
    pub fn new(config: WalConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let segment_id = list_segments(&config.dir)?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(0);
        let file = Self::open_segment(&config, segment_id)?;

        Ok(Self {
            config,
            inner: Mutex::new(WalWriterInner {
                file: BufWriter::new(file),
                segment_id,
                bytes_written: 0,
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
        })
    }

    /// Append a record. The record is handed to the OS before returning;
    /// fsync follows the configured policy.
    pub fn log(&self, record: &WalRecord) -> Result<()> {
        let encoded = record.encode()?;
        let mut inner = self.inner.lock();

        if inner.bytes_written > 0 && inner.bytes_written + encoded.len() > self.config.segment_size {
            self.rotate_locked(&mut inner)?;
        }

        inner.file.write_all(&encoded)?;
        inner.file.flush()?;
        inner.bytes_written += encoded.len();
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_locked(&mut inner)
    }

    /// Close the current segment and start the next one; returns its id
    pub fn rotate(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.rotate_locked(&mut inner)?;
        Ok(inner.segment_id)
    }

    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Delete segments with an id lower than `segment_id`
    pub fn truncate_before(&self, segment_id: u64) -> Result<usize> {
        let mut truncated = 0;
        for (id, path) in list_segments(&self.config.dir)? {
            if id < segment_id {
                fs::remove_file(&path)?;
                truncated += 1;
            }
        }
        if truncated > 0 {
            debug!("Truncated {} WAL segments before {}", truncated, segment_id);
        }
        Ok(truncated)
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => inner.last_sync.elapsed().as_millis() >= millis as u128,
            SyncPolicy::None => false,
        }
    }

    fn sync_locked(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_data()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut WalWriterInner) -> Result<()> {
        Self::sync_locked(inner)?;
        inner.segment_id += 1;
        let file = Self::open_segment(&self.config, inner.segment_id)?;
        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;
        Ok(())
    }

    fn open_segment(config: &WalConfig, segment_id: u64) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&config.dir, segment_id))?;
        // make the new directory entry durable
        File::open(&config.dir)?.sync_all()?;
        Ok(file)
    }
}
