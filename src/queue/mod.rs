//! # Offline Queue
//!
//! Durable append-only log of records the collector has not yet accepted,
//! plus the batched, compressed retry pass that drains it.
//!
//! Store layout inside the queue directory:
//! - `offline_log.txt`: one record per line, oldest first
//! - `offline_log.tmp`: side file built during a drain from batches that
//!   failed, renamed over the store when the pass completes
//!
//! An entry leaves the store only after the batch containing it was
//! delivered. A crash at any point of a drain leaves either the old store
//! or the fully written replacement.

pub mod drain;
pub mod retry;

pub use drain::{Batch, Drain};

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use crate::config::MAX_BATCH_LIMIT;
use crate::error::{Result, UplinkError};
use crate::publisher::Transport;

/// Maximum entries per compressed batch
pub const MAX_BATCH: usize = MAX_BATCH_LIMIT;

/// File name of the durable store
pub const STORE_FILE: &str = "offline_log.txt";

/// File name of the side file written during a drain
pub const SIDE_FILE: &str = "offline_log.tmp";

/// Outcome of one [`OfflineQueue::process`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub batches_sent: usize,
    pub batches_retained: usize,
    pub entries_sent: usize,
    pub entries_retained: usize,
}

impl DrainReport {
    /// True when the pass found nothing to send
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.batches_sent == 0 && self.batches_retained == 0
    }
}

/// Durable queue of undelivered records
///
/// `add` and the store swap at the end of a drain are serialized by one
/// lock. The lock is never held while a batch is on the network, so the
/// sampling loop can keep appending during a long catch-up pass.
#[derive(Debug)]
pub struct OfflineQueue {
    store_path: PathBuf,
    side_path: PathBuf,
    max_batch: usize,
    store_lock: Mutex<()>,
    draining: AtomicBool,
}

impl OfflineQueue {
    /// Open (or prepare) the queue in `dir`, creating the directory if needed
    ///
    /// Existing entries from a previous run are kept and retried.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_uplink::queue::OfflineQueue;
    ///
    /// let queue = OfflineQueue::open("logs")?;
    /// queue.add("measurements tensao=12.000000 1700000000")?;
    /// # Ok::<(), telemetry_uplink::error::UplinkError>(())
    /// ```
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let queue = Self {
            store_path: dir.join(STORE_FILE),
            side_path: dir.join(SIDE_FILE),
            max_batch: MAX_BATCH,
            store_lock: Mutex::new(()),
            draining: AtomicBool::new(false),
        };

        let pending = queue.pending()?;
        if pending > 0 {
            info!("Offline queue holds {} entries from a previous run", pending);
        }
        Ok(queue)
    }

    /// Override the batch size, clamped to `1..=MAX_BATCH`
    #[must_use]
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.clamp(1, MAX_BATCH);
        self
    }

    #[must_use]
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    #[must_use]
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    #[must_use]
    pub fn side_path(&self) -> &Path {
        &self.side_path
    }

    /// Durably append one record
    ///
    /// The entry is flushed to stable storage before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`UplinkError::Io`] if the store cannot be written, or with
    /// `InvalidInput` if the record spans more than one line.
    pub fn add(&self, record: &str) -> Result<()> {
        if record.contains(['\n', '\r']) {
            return Err(UplinkError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "queue entries must be a single line",
            )));
        }

        let _store = self.lock_store();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.store_path)?;

        let mut entry = Vec::with_capacity(record.len() + 2);
        if ends_with_torn_line(&mut file)? {
            warn!("Offline store ends with an incomplete entry, starting a new line");
            entry.push(b'\n');
        }
        entry.extend_from_slice(record.as_bytes());
        entry.push(b'\n');
        file.write_all(&entry)?;
        file.sync_data()?;

        debug!("Queued record for retry ({} bytes)", record.len());
        Ok(())
    }

    /// Alias of [`OfflineQueue::add`] for log-style callers
    pub fn append(&self, entry: &str) -> Result<()> {
        self.add(entry)
    }

    /// Number of entries currently in the store
    pub fn pending(&self) -> Result<usize> {
        let _store = self.lock_store();
        let file = match File::open(&self.store_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        for line in BufReader::new(file).split(b'\n') {
            if !line?.is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Start a drain pass over the entries stored right now
    ///
    /// Returns `Ok(None)` when the store is empty or absent, or when another
    /// drain is already in progress.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the store exists but cannot be opened.
    pub fn drain(&self) -> Result<Option<Drain<'_>>> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("Drain already in progress");
            return Ok(None);
        }

        match self.open_snapshot() {
            Ok(Some((file, len))) => Ok(Some(Drain::new(self, file, len))),
            Ok(None) => {
                self.draining.store(false, Ordering::Release);
                Ok(None)
            }
            Err(e) => {
                self.draining.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Run one full drain pass against `transport`
    ///
    /// Every batch is compressed and sent in store order. Delivered batches
    /// are discarded; failed ones are kept, in order, for the next pass.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the store cannot be read or swapped. Send and
    /// compression failures are not errors; they show up in the report.
    pub async fn process<T: Transport + ?Sized>(&self, transport: &T) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let Some(mut drain) = self.drain()? else {
            return Ok(report);
        };

        while let Some(batch) = drain.next_batch()? {
            let outcome = match batch.compress() {
                Ok(body) => transport.send_batch(body).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    report.batches_sent += 1;
                    report.entries_sent += batch.len();
                    drain.commit(batch);
                }
                Err(e) => {
                    warn!("Batch of {} entries not delivered: {}", batch.len(), e);
                    if let Err(e) = drain.rollback(&batch) {
                        error!(
                            "Cannot write side file {}, abandoning drain with store intact: {}",
                            self.side_path.display(),
                            e
                        );
                        return Err(e);
                    }
                    report.batches_retained += 1;
                    report.entries_retained += batch.len();
                }
            }
        }

        drain.finish()?;

        if !report.is_idle() {
            info!(
                "Offline queue drained: {} entries sent in {} batches, {} entries kept",
                report.entries_sent, report.batches_sent, report.entries_retained
            );
        }
        Ok(report)
    }

    fn open_snapshot(&self) -> Result<Option<(File, u64)>> {
        let _store = self.lock_store();
        let file = match File::open(&self.store_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(None);
        }
        Ok(Some((file, len)))
    }

    fn lock_store(&self) -> MutexGuard<'_, ()> {
        self.store_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// True when the store is non-empty and its last byte is not a newline,
/// as left by a write interrupted by a crash
fn ends_with_torn_line(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::MockTransport;
    use flate2::read::GzDecoder;
    use mockall::Sequence;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn offline() -> UplinkError {
        UplinkError::Transport("collector unreachable".to_string())
    }

    fn decode(body: &[u8]) -> String {
        let mut text = String::new();
        GzDecoder::new(body).read_to_string(&mut text).unwrap();
        text
    }

    fn stored(queue: &OfflineQueue) -> Vec<String> {
        fs::read_to_string(queue.store_path())
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_add_is_durable_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = OfflineQueue::open(dir.path()).unwrap();
            queue.add("m x=1.000000 1").unwrap();
            queue.append("m x=2.000000 2").unwrap();
        }

        let reopened = OfflineQueue::open(dir.path()).unwrap();
        assert_eq!(reopened.pending().unwrap(), 2);
        assert_eq!(stored(&reopened), vec!["m x=1.000000 1", "m x=2.000000 2"]);
    }

    #[test]
    fn test_add_rejects_multiline_record() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();

        assert!(queue.add("m x=1 1\nm x=2 2").is_err());
        assert_eq!(queue.pending().unwrap(), 0);
    }

    #[test]
    fn test_with_max_batch_clamps() {
        let dir = TempDir::new().unwrap();
        assert_eq!(OfflineQueue::open(dir.path()).unwrap().with_max_batch(0).max_batch(), 1);
        assert_eq!(
            OfflineQueue::open(dir.path()).unwrap().with_max_batch(1_000_000).max_batch(),
            MAX_BATCH
        );
    }

    #[test]
    fn test_second_drain_while_first_active_is_refused() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.add("m x=1.000000 1").unwrap();

        let first = queue.drain().unwrap();
        assert!(first.is_some());
        assert!(queue.drain().unwrap().is_none());
        drop(first);
        assert!(queue.drain().unwrap().is_some());
    }

    #[test]
    fn test_process_empty_store_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        let mut transport = MockTransport::new();
        transport.expect_send_batch().never();

        let report = tokio_test::block_on(queue.process(&transport)).unwrap();
        assert!(report.is_idle());
    }

    #[tokio::test]
    async fn test_drain_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.add("m x=1.000000 1").unwrap();

        let mut transport = MockTransport::new();
        transport
            .expect_send_batch()
            .times(1)
            .withf(|body| decode(body) == "m x=1.000000 1\n")
            .returning(|_| Ok(()));

        let first = queue.process(&transport).await.unwrap();
        assert_eq!(first.entries_sent, 1);
        assert!(!queue.store_path().exists());

        let second = queue.process(&transport).await.unwrap();
        assert!(second.is_idle());
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_order() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap().with_max_batch(1);
        queue.add("m x=1.000000 1").unwrap();
        queue.add("m y=2.000000 2").unwrap();

        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();
        transport
            .expect_send_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(offline()));
        transport
            .expect_send_batch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let report = queue.process(&transport).await.unwrap();
        assert_eq!(report.batches_retained, 1);
        assert_eq!(report.batches_sent, 1);
        assert_eq!(stored(&queue), vec!["m x=1.000000 1"]);
        assert!(!queue.side_path().exists());
    }

    #[tokio::test]
    async fn test_retained_groups_keep_relative_order() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap().with_max_batch(2);
        for i in 1..=6 {
            queue.add(&format!("m x={}.000000 {}", i, i)).unwrap();
        }

        // Fail batches one and three, deliver batch two
        let mut calls = 0;
        let mut transport = MockTransport::new();
        transport.expect_send_batch().times(3).returning(move |_| {
            calls += 1;
            if calls == 2 { Ok(()) } else { Err(offline()) }
        });

        queue.process(&transport).await.unwrap();
        assert_eq!(
            stored(&queue),
            vec!["m x=1.000000 1", "m x=2.000000 2", "m x=5.000000 5", "m x=6.000000 6"]
        );
    }

    #[tokio::test]
    async fn test_store_larger_than_batch_sends_several_batches() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap().with_max_batch(3);
        for i in 0..7 {
            queue.add(&format!("m x={} {}", i, i)).unwrap();
        }

        let mut transport = MockTransport::new();
        transport.expect_send_batch().times(3).returning(|_| Ok(()));

        let report = queue.process(&transport).await.unwrap();
        assert_eq!(report.batches_sent, 3);
        assert_eq!(report.entries_sent, 7);
        assert_eq!(queue.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_pass_then_recovery() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        queue.add("m x=1.000000 1").unwrap();

        queue.add("m x=2.000000 2").unwrap();
        let before = fs::read(queue.store_path()).unwrap();

        let mut down = MockTransport::new();
        down.expect_send_batch().times(1).returning(|_| Err(offline()));
        queue.process(&down).await.unwrap();
        assert_eq!(fs::read(queue.store_path()).unwrap(), before);

        let mut still_down = MockTransport::new();
        still_down.expect_send_batch().returning(|_| Err(offline()));
        queue.process(&still_down).await.unwrap();
        assert_eq!(fs::read(queue.store_path()).unwrap(), before);

        let mut up = MockTransport::new();
        up.expect_send_batch().times(1).returning(|_| Ok(()));
        queue.process(&up).await.unwrap();
        assert_eq!(queue.pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_during_process_is_kept() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(OfflineQueue::open(dir.path()).unwrap());
        queue.add("m x=1.000000 1").unwrap();

        // The transport appends a new entry mid-send, as the sampling loop would
        let writer = Arc::clone(&queue);
        let mut transport = MockTransport::new();
        transport.expect_send_batch().times(1).returning(move |_| {
            writer.add("m x=2.000000 2").unwrap();
            Ok(())
        });

        queue.process(&transport).await.unwrap();
        assert_eq!(stored(&queue), vec!["m x=2.000000 2"]);
    }

    #[test]
    fn test_add_after_torn_tail_starts_a_new_line() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        fs::write(queue.store_path(), "m x=1.000000 1\nm x=2.0000").unwrap();

        queue.add("m x=3.000000 3").unwrap();

        assert_eq!(
            fs::read_to_string(queue.store_path()).unwrap(),
            "m x=1.000000 1\nm x=2.0000\nm x=3.000000 3\n"
        );
        assert_eq!(stored(&queue).last().map(String::as_str), Some("m x=3.000000 3"));
        assert_eq!(queue.pending().unwrap(), 3);
    }

    #[test]
    fn test_pending_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let queue = OfflineQueue::open(dir.path()).unwrap();
        fs::write(queue.store_path(), "a 1\n\nb 2\n").unwrap();
        assert_eq!(queue.pending().unwrap(), 2);
    }
}
