//! # Queue Drain
//!
//! One pass over a snapshot of the durable store.
//!
//! The store is never modified while a drain is in flight. Batches that
//! fail are written to a side file; [`Drain::finish`] then replaces the
//! store with a single rename, or removes it when nothing is left.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Take, Write};
use std::sync::atomic::Ordering;
use tracing::debug;

use super::OfflineQueue;
use crate::error::{Result, UplinkError};

/// Group of consecutive store entries delivered as one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<Vec<u8>>,
}

impl Batch {
    /// Number of entries in the batch
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw entries without line terminators, in store order
    #[must_use]
    pub fn entries(&self) -> &[Vec<u8>] {
        &self.entries
    }

    /// Newline-terminated concatenation of every entry
    ///
    /// # Errors
    ///
    /// Returns [`UplinkError::Compression`] if the buffer cannot be allocated.
    pub fn body(&self) -> Result<Vec<u8>> {
        let size: usize = self.entries.iter().map(|e| e.len() + 1).sum();
        let mut body = Vec::new();
        body.try_reserve_exact(size).map_err(|e| {
            UplinkError::Compression(format!("Cannot allocate {} byte batch: {}", size, e))
        })?;

        for entry in &self.entries {
            body.extend_from_slice(entry);
            body.push(b'\n');
        }
        Ok(body)
    }

    /// Gzip-compressed [`Batch::body`]
    ///
    /// # Errors
    ///
    /// Returns [`UplinkError::Compression`] on allocation or encoder failure.
    pub fn compress(&self) -> Result<Bytes> {
        let body = self.body()?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&body)
            .map_err(|e| UplinkError::Compression(format!("Gzip write failed: {}", e)))?;
        let compressed = encoder
            .finish()
            .map_err(|e| UplinkError::Compression(format!("Gzip finish failed: {}", e)))?;

        Ok(Bytes::from(compressed))
    }
}

/// In-flight drain pass over the durable store
///
/// Obtained from [`OfflineQueue::drain`]. Dropping a drain without calling
/// [`Drain::finish`] leaves the store exactly as it was.
pub struct Drain<'a> {
    queue: &'a OfflineQueue,
    reader: BufReader<Take<File>>,
    snapshot_len: u64,
    side: Option<BufWriter<File>>,
    retained: usize,
}

impl std::fmt::Debug for Drain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drain")
            .field("snapshot_len", &self.snapshot_len)
            .field("retained", &self.retained)
            .finish_non_exhaustive()
    }
}

impl<'a> Drain<'a> {
    pub(super) fn new(queue: &'a OfflineQueue, file: File, snapshot_len: u64) -> Self {
        Self {
            queue,
            reader: BufReader::new(file.take(snapshot_len)),
            snapshot_len,
            side: None,
            retained: 0,
        }
    }

    /// Size of the store prefix this drain covers
    #[must_use]
    pub fn snapshot_len(&self) -> u64 {
        self.snapshot_len
    }

    /// Number of entries rolled back so far
    #[must_use]
    pub fn retained(&self) -> usize {
        self.retained
    }

    /// Read the next batch of at most `max_batch` entries
    ///
    /// Blank lines are skipped. Returns `Ok(None)` once the snapshot is
    /// exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut entries = Vec::new();
        let mut line = Vec::new();

        while entries.len() < self.queue.max_batch() {
            line.clear();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                entries.push(line.clone());
            }
        }

        if entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Batch { entries }))
        }
    }

    /// Accept a delivered batch; its entries will not be kept
    pub fn commit(&mut self, batch: Batch) {
        debug!("Batch of {} entries delivered", batch.len());
    }

    /// Keep an undelivered batch for the next pass, in its original order
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the side file cannot be created or written.
    pub fn rollback(&mut self, batch: &Batch) -> Result<()> {
        let side = self.side_writer()?;
        for entry in batch.entries() {
            side.write_all(entry)?;
            side.write_all(b"\n")?;
        }
        self.retained += batch.len();
        Ok(())
    }

    /// Replace the store with whatever must be kept
    ///
    /// Entries appended to the store while this drain ran are carried over
    /// after the rolled-back ones. When nothing remains the store is
    /// removed; otherwise the side file is renamed over it in one step.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the swap fails. The original store is left in
    /// place in that case, so no entry is lost.
    pub fn finish(mut self) -> Result<()> {
        let queue = self.queue;
        let _store = queue.lock_store();

        let mut appended = Vec::new();
        if let Ok(mut store) = File::open(queue.store_path()) {
            store.seek(SeekFrom::Start(self.snapshot_len))?;
            store.read_to_end(&mut appended)?;
        }

        if self.retained == 0 && appended.is_empty() {
            drop(self.side.take());
            match fs::remove_file(queue.store_path()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if queue.side_path().exists() {
                fs::remove_file(queue.side_path())?;
            }
            return Ok(());
        }

        let mut side = match self.side.take() {
            Some(side) => side,
            None => BufWriter::new(File::create(queue.side_path())?),
        };
        side.write_all(&appended)?;
        let file = side.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(queue.side_path(), queue.store_path())?;
        Ok(())
    }

    fn side_writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.side.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.queue.side_path())?;
            self.side = Some(BufWriter::new(file));
        }
        // Just populated above
        self.side
            .as_mut()
            .ok_or_else(|| UplinkError::Io(std::io::Error::other("side file unavailable")))
    }
}

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        self.queue.draining.store(false, Ordering::Release);
    }
}
