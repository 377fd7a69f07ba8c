use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::message::{MessageError, StackMessage};

const STACK_MESSAGES: TableDefinition<'_, &str, &[u8]> = TableDefinition::new("stack_messages");

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),

    #[error("queue order names {0} but no record is stored")]
    MissingRecord(String),

    #[error("queue closed")]
    Closed,
}

impl QueueError {
    /// Errors that mean the store content itself is unusable. Locks, permissions
    /// and other I/O failures are not.
    pub fn is_corruption(&self) -> bool {
        fn corrupted(e: &redb::StorageError) -> bool {
            matches!(e, redb::StorageError::Corrupted(_))
        }
        match self {
            QueueError::Message(_) => true,
            QueueError::RedbCreate(redb::DatabaseError::RepairAborted) => true,
            QueueError::RedbCreate(redb::DatabaseError::Storage(e)) => corrupted(e),
            QueueError::Transaction(redb::TransactionError::Storage(e)) => corrupted(e),
            QueueError::Table(redb::TableError::Storage(e)) => corrupted(e),
            QueueError::Commit(redb::CommitError::Storage(e)) => corrupted(e),
            QueueError::Storage(e) => corrupted(e),
            _ => false,
        }
    }
}

/// Result of one attempt to pop the oldest entry.
enum Taken {
    Message(StackMessage),
    /// Permit left over from entries dropped by a reset.
    Stale,
    /// The record is gone; the entry is dropped.
    Lost(QueueError),
    /// Storage failed before removal; the entry is back at the front.
    Retry(QueueError),
    /// Too many faults in a row; the store was recreated empty.
    Reset(QueueError),
}

struct QueueInner {
    path: PathBuf,
    db: Database,
    order: VecDeque<String>,
    next_seq: u64,
    faults: u32,
    #[cfg(test)]
    failing_takes: u32,
}

impl QueueInner {
    /// Store `message`; true when its url hash was not queued yet.
    fn put(&mut self, mut message: StackMessage) -> Result<bool, QueueError> {
        let write_txn = self.db.begin_write()?;
        let is_new = {
            let mut table = write_txn.open_table(STACK_MESSAGES)?;
            let existing_seq = match table.get(message.url_hash.as_str())? {
                Some(bytes) => Some(
                    StackMessage::from_record(&message.url_hash, bytes.value())
                        .map(|prev| prev.handle)
                        .unwrap_or(self.next_seq),
                ),
                None => None,
            };
            message.handle = existing_seq.unwrap_or(self.next_seq);
            let record = message.to_record()?;
            table.insert(message.url_hash.as_str(), record.as_ref())?;
            existing_seq.is_none()
        };
        write_txn.commit()?;

        if is_new {
            self.next_seq += 1;
            self.order.push_back(message.url_hash);
        }
        Ok(is_new)
    }

    /// Put a taken message back at the head under its original sequence.
    ///
    /// True when the entry was queued again, false when the same url hash
    /// was added in the meantime and only its payload was replaced.
    fn restore(&mut self, message: StackMessage) -> Result<bool, QueueError> {
        let write_txn = self.db.begin_write()?;
        let requeued = {
            let mut table = write_txn.open_table(STACK_MESSAGES)?;
            let requeued = table.get(message.url_hash.as_str())?.is_none();
            let record = message.to_record()?;
            table.insert(message.url_hash.as_str(), record.as_ref())?;
            requeued
        };
        write_txn.commit()?;

        if requeued {
            self.order.push_front(message.url_hash);
        }
        Ok(requeued)
    }

    /// Remove the record for `url_hash` and decode it.
    ///
    /// The record is deleted even when it no longer decodes.
    fn take(&mut self, url_hash: &str) -> Result<StackMessage, QueueError> {
        #[cfg(test)]
        if self.failing_takes > 0 {
            self.failing_takes -= 1;
            return Err(QueueError::Storage(redb::StorageError::Io(std::io::Error::other(
                "injected disk fault",
            ))));
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(STACK_MESSAGES)?;
            let bytes = table.remove(url_hash)?.map(|guard| guard.value().to_vec());
            bytes
        };
        write_txn.commit()?;

        let bytes = removed.ok_or_else(|| QueueError::MissingRecord(url_hash.to_string()))?;
        Ok(StackMessage::from_record(url_hash, &bytes)?)
    }

    fn take_oldest(&mut self) -> Taken {
        let Some(url_hash) = self.order.pop_front() else {
            return Taken::Stale;
        };
        match self.take(&url_hash) {
            Ok(msg) => {
                self.faults = 0;
                Taken::Message(msg)
            }
            Err(e @ QueueError::MissingRecord(_)) | Err(e @ QueueError::Message(_)) => {
                Taken::Lost(e)
            }
            Err(e) => {
                self.faults += 1;
                if self.faults < Config::QUEUE_FAULT_LIMIT {
                    self.order.push_front(url_hash);
                    return Taken::Retry(e);
                }
                warn!(
                    "Stack queue failed {} times in a row ({}), resetting to empty",
                    self.faults, e
                );
                if let Err(reset_error) = self.reset() {
                    warn!("Stack queue reset failed: {}", reset_error);
                }
                Taken::Reset(e)
            }
        }
    }

    /// Drop every pending entry and recreate the store file.
    fn reset(&mut self) -> Result<(), QueueError> {
        self.order.clear();
        self.faults = 0;
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let (db, _) = StackQueue::load(&self.path)?;
        self.db = db;
        Ok(())
    }
}

/// Durable FIFO of crawl candidates.
///
/// Records live in a redb table keyed by url hash; the in-memory `order`
/// holds exactly the same keys. Availability is a semaphore with one permit
/// per queued key, kept apart from the writer lock so readers park without
/// holding it. Async callers run the redb transactions on the blocking pool.
pub struct StackQueue {
    path: PathBuf,
    inner: Arc<Mutex<QueueInner>>,
    available: Arc<Semaphore>,
    was_reset: Arc<AtomicBool>,
}

/// A take running on the blocking pool.
///
/// Dropped before its outcome was read, it puts a taken message back at the
/// head of the queue so a cancelled waiter loses nothing.
struct PendingTake {
    handle: Option<JoinHandle<Taken>>,
    inner: Arc<Mutex<QueueInner>>,
    available: Arc<Semaphore>,
    was_reset: Arc<AtomicBool>,
}

impl PendingTake {
    async fn outcome(mut self) -> Result<Taken, tokio::task::JoinError> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(Taken::Stale);
        };
        let taken = handle.await;
        self.handle = None;
        taken
    }
}

impl Drop for PendingTake {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let available = Arc::clone(&self.available);
        let was_reset = Arc::clone(&self.was_reset);
        runtime.spawn(async move {
            match handle.await {
                Ok(Taken::Message(msg)) => {
                    let url = msg.url.clone();
                    match tokio::task::spawn_blocking(move || inner.lock().restore(msg)).await {
                        Ok(Ok(true)) => available.add_permits(1),
                        Ok(Ok(false)) => {}
                        Ok(Err(e)) => warn!("Could not requeue abandoned {}: {}", url, e),
                        Err(e) => warn!("Could not requeue abandoned {}: {}", url, e),
                    }
                }
                Ok(Taken::Retry(_)) => available.add_permits(1),
                Ok(Taken::Reset(_)) => was_reset.store(true, Ordering::Release),
                Ok(Taken::Stale) | Ok(Taken::Lost(_)) => {}
                Err(e) => warn!("Abandoned take failed: {}", e),
            }
        });
    }
}

impl StackQueue {
    /// Open (or create) `stack_queue.redb` under `data_dir` and replay its records.
    ///
    /// A corrupt store is deleted and recreated empty. A store held open by
    /// another queue, or failing with plain I/O errors, is left alone and the
    /// error is returned.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, QueueError> {
        let data_path = data_dir.as_ref();
        std::fs::create_dir_all(data_path)?;
        let path = data_path.join(Config::QUEUE_FILE_NAME);

        let (db, entries, was_reset) = match Self::load(&path) {
            Ok((db, entries)) => (db, entries, false),
            Err(e) if e.is_corruption() => {
                warn!(
                    "Stack queue at {} is corrupt ({}), resetting to empty",
                    path.display(),
                    e
                );
                std::fs::remove_file(&path)?;
                let (db, entries) = Self::load(&path)?;
                (db, entries, true)
            }
            Err(e) => return Err(e),
        };

        let next_seq = entries.last().map(|(seq, _)| seq + 1).unwrap_or(0);
        let order: VecDeque<String> = entries.into_iter().map(|(_, hash)| hash).collect();
        info!("Stack queue opened with {} pending entries", order.len());

        Ok(Self {
            available: Arc::new(Semaphore::new(order.len())),
            inner: Arc::new(Mutex::new(QueueInner {
                path: path.clone(),
                db,
                order,
                next_seq,
                faults: 0,
                #[cfg(test)]
                failing_takes: 0,
            })),
            path,
            was_reset: Arc::new(AtomicBool::new(was_reset)),
        })
    }

    /// Open the database and collect `(sequence, url_hash)` for every resident record.
    fn load(path: &Path) -> Result<(Database, Vec<(u64, String)>), QueueError> {
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _messages = write_txn.open_table(STACK_MESSAGES)?;
        }
        write_txn.commit()?;

        let mut entries = Vec::new();
        {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(STACK_MESSAGES)?;
            for row in table.iter()? {
                let (key, value) = row?;
                let msg = StackMessage::from_record(key.value(), value.value())?;
                entries.push((msg.handle, msg.url_hash));
            }
        }
        entries.sort_unstable();

        Ok((db, entries))
    }

    /// Persist `message`; a url hash already queued is overwritten in place
    /// and keeps its position. Blocks on the disk commit.
    pub fn add(&self, message: StackMessage) -> Result<(), QueueError> {
        if self.inner.lock().put(message)? {
            self.available.add_permits(1);
        }
        Ok(())
    }

    /// [`add`](Self::add) with the commit moved off the async worker threads.
    pub async fn add_async(&self, message: StackMessage) -> Result<(), QueueError> {
        let inner = Arc::clone(&self.inner);
        let is_new = tokio::task::spawn_blocking(move || inner.lock().put(message)).await??;
        if is_new {
            self.available.add_permits(1);
        }
        Ok(())
    }

    /// Wait for the oldest candidate and remove it from the queue.
    ///
    /// Fails with [`QueueError::Closed`] once [`close`](Self::close) was called.
    /// After `QUEUE_FAULT_LIMIT` storage faults in a row the store is reset to
    /// empty and [`was_reset`](Self::was_reset) turns true.
    pub async fn wait_for_message(&self) -> Result<StackMessage, QueueError> {
        loop {
            let permit = self
                .available
                .acquire()
                .await
                .map_err(|_| QueueError::Closed)?;
            permit.forget();

            match self.start_take().outcome().await? {
                Taken::Message(msg) => return Ok(msg),
                Taken::Stale => continue,
                Taken::Lost(e) => return Err(e),
                Taken::Retry(e) => {
                    self.available.add_permits(1);
                    return Err(e);
                }
                Taken::Reset(e) => {
                    self.was_reset.store(true, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }

    fn start_take(&self) -> PendingTake {
        let inner = Arc::clone(&self.inner);
        PendingTake {
            handle: Some(tokio::task::spawn_blocking(move || inner.lock().take_oldest())),
            inner: Arc::clone(&self.inner),
            available: Arc::clone(&self.available),
            was_reset: Arc::clone(&self.was_reset),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Number of records in the backing table.
    pub fn persisted_len(&self) -> Result<usize, QueueError> {
        let inner = self.inner.lock();
        let read_txn = inner.db.begin_read()?;
        let table = read_txn.open_table(STACK_MESSAGES)?;
        let mut count = 0;
        for row in table.iter()? {
            row?;
            count += 1;
        }
        Ok(count)
    }

    /// Wake every waiter with [`QueueError::Closed`]. Records stay on disk.
    pub fn close(&self) {
        self.available.close();
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }

    /// True when a corrupt or repeatedly failing store was discarded.
    pub fn was_reset(&self) -> bool {
        self.was_reset.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the next `count` record removals fail with a storage error.
    #[cfg(test)]
    pub(crate) fn fail_next_takes(&self, count: u32) {
        self.inner.lock().failing_takes = count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn msg(url: &str) -> StackMessage {
        StackMessage::new(None, url, None, None, None, "profile", 1, 0, 0).unwrap()
    }

    fn assert_conserved(queue: &StackQueue) {
        assert_eq!(queue.size(), queue.persisted_len().unwrap());
    }

    #[test]
    fn test_duplicate_add_keeps_one_entry() {
        let dir = TempDir::new().unwrap();
        let queue = StackQueue::open(dir.path()).unwrap();

        queue.add(msg("http://example.com/a")).unwrap();
        let mut again = msg("http://example.com/a");
        again.depth = 5;
        queue.add(again).unwrap();

        assert_eq!(queue.size(), 1);
        assert_conserved(&queue);
    }

    #[tokio::test]
    async fn test_overwrite_is_delivered_once_with_new_fields() {
        let dir = TempDir::new().unwrap();
        let queue = StackQueue::open(dir.path()).unwrap();

        queue.add(msg("http://example.com/a")).unwrap();
        queue.add(msg("http://example.com/b")).unwrap();
        let mut again = msg("http://example.com/a");
        again.depth = 5;
        queue.add(again).unwrap();

        let first = queue.wait_for_message().await.unwrap();
        assert_eq!(first.url, "http://example.com/a");
        assert_eq!(first.depth, 5);
        let second = queue.wait_for_message().await.unwrap();
        assert_eq!(second.url, "http://example.com/b");

        let third = tokio::time::timeout(Duration::from_millis(50), queue.wait_for_message()).await;
        assert!(third.is_err(), "no third message should be available");
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let dir = TempDir::new().unwrap();
        let queue = StackQueue::open(dir.path()).unwrap();

        let urls: Vec<String> = (0..10).map(|i| format!("http://example.com/{}", i)).collect();
        for url in &urls {
            queue.add(msg(url)).unwrap();
            assert_conserved(&queue);
        }

        for url in &urls {
            let got = queue.wait_for_message().await.unwrap();
            assert_eq!(&got.url, url);
            assert_conserved(&queue);
        }
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_order_survives_restart() {
        let dir = TempDir::new().unwrap();
        let urls: Vec<String> = (0..20).map(|i| format!("http://site{}.example.com/", i)).collect();
        {
            let queue = StackQueue::open(dir.path()).unwrap();
            for url in &urls {
                queue.add(msg(url)).unwrap();
            }
            let first = queue.wait_for_message().await.unwrap();
            assert_eq!(first.url, urls[0]);
        }

        let queue = StackQueue::open(dir.path()).unwrap();
        assert!(!queue.was_reset());
        assert_eq!(queue.size(), urls.len() - 1);
        assert_conserved(&queue);
        for url in &urls[1..] {
            assert_eq!(&queue.wait_for_message().await.unwrap().url, url);
        }

        // Sequence numbering continues after the replayed entries.
        queue.add(msg("http://late.example.com/")).unwrap();
        assert_eq!(queue.wait_for_message().await.unwrap().url, "http://late.example.com/");
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_add() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(StackQueue::open(dir.path()).unwrap());

        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_for_message().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(msg("http://example.com/late")).unwrap();

        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.url, "http://example.com/late");
    }

    #[tokio::test]
    async fn test_concurrent_readers_never_share_a_message() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(StackQueue::open(dir.path()).unwrap());
        for i in 0..40 {
            queue.add(msg(&format!("http://example.com/{}", i))).unwrap();
        }

        let mut readers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..10 {
                    seen.push(queue.wait_for_message().await.unwrap().url_hash);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for reader in readers {
            all.extend(reader.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 40);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(StackQueue::open(dir.path()).unwrap());

        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_for_message().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert!(matches!(reader.await.unwrap(), Err(QueueError::Closed)));
        assert!(queue.is_closed());
    }

    #[test]
    fn test_locked_store_is_not_reset() {
        let dir = TempDir::new().unwrap();
        let first = StackQueue::open(dir.path()).unwrap();
        for i in 0..3 {
            first.add(msg(&format!("http://example.com/{}", i))).unwrap();
        }

        let second = StackQueue::open(dir.path());
        assert!(matches!(
            second,
            Err(QueueError::RedbCreate(redb::DatabaseError::DatabaseAlreadyOpen))
        ));
        assert_eq!(first.size(), 3);
        assert_conserved(&first);
        drop(first);

        let reopened = StackQueue::open(dir.path()).unwrap();
        assert!(!reopened.was_reset());
        assert_eq!(reopened.size(), 3);
    }

    #[test]
    fn test_only_corruption_triggers_reset() {
        let corrupt = QueueError::Storage(redb::StorageError::Corrupted("bad page".into()));
        assert!(corrupt.is_corruption());
        assert!(QueueError::RedbCreate(redb::DatabaseError::RepairAborted).is_corruption());
        assert!(QueueError::Message(MessageError::UrlNull).is_corruption());

        assert!(!QueueError::RedbCreate(redb::DatabaseError::DatabaseAlreadyOpen).is_corruption());
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!QueueError::Io(denied).is_corruption());
        let io = redb::StorageError::Io(std::io::Error::other("disk"));
        assert!(!QueueError::Storage(io).is_corruption());
    }

    #[tokio::test]
    async fn test_transient_take_fault_keeps_entry_first() {
        let dir = TempDir::new().unwrap();
        let queue = StackQueue::open(dir.path()).unwrap();
        queue.add_async(msg("http://example.com/a")).await.unwrap();
        queue.add_async(msg("http://example.com/b")).await.unwrap();

        queue.fail_next_takes(1);
        assert!(matches!(
            queue.wait_for_message().await,
            Err(QueueError::Storage(_))
        ));
        assert_eq!(queue.size(), 2);
        assert_conserved(&queue);
        assert!(!queue.was_reset());

        assert_eq!(queue.wait_for_message().await.unwrap().url, "http://example.com/a");
        assert_eq!(queue.wait_for_message().await.unwrap().url, "http://example.com/b");
    }

    #[tokio::test]
    async fn test_repeated_take_faults_reset_store() {
        let dir = TempDir::new().unwrap();
        let queue = StackQueue::open(dir.path()).unwrap();
        queue.add(msg("http://example.com/a")).unwrap();
        queue.add(msg("http://example.com/b")).unwrap();

        queue.fail_next_takes(Config::QUEUE_FAULT_LIMIT);
        for _ in 0..Config::QUEUE_FAULT_LIMIT {
            assert!(queue.wait_for_message().await.is_err());
        }
        assert!(queue.was_reset());
        assert_eq!(queue.size(), 0);
        assert_conserved(&queue);

        // Permits of the dropped entries are skipped, not delivered.
        queue.add(msg("http://example.com/c")).unwrap();
        assert_eq!(queue.wait_for_message().await.unwrap().url, "http://example.com/c");
        let next = tokio::time::timeout(Duration::from_millis(50), queue.wait_for_message()).await;
        assert!(next.is_err(), "no entry should remain after the reset");
    }

    #[tokio::test]
    async fn test_abandoned_take_requeues_message_first() {
        let dir = TempDir::new().unwrap();
        let queue = StackQueue::open(dir.path()).unwrap();
        queue.add(msg("http://example.com/a")).unwrap();
        queue.add(msg("http://example.com/b")).unwrap();

        // A waiter cancelled while its take is still on the blocking pool.
        queue.available.acquire().await.unwrap().forget();
        drop(queue.start_take());

        for _ in 0..200 {
            if queue.size() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.size(), 2);
        assert_conserved(&queue);
        assert_eq!(queue.wait_for_message().await.unwrap().url, "http://example.com/a");
        assert_eq!(queue.wait_for_message().await.unwrap().url, "http://example.com/b");
    }

    #[tokio::test]
    async fn test_cancelled_waiter_loses_nothing() {
        let dir = TempDir::new().unwrap();
        let queue = StackQueue::open(dir.path()).unwrap();
        for i in 0..20 {
            queue.add(msg(&format!("http://example.com/{}", i))).unwrap();
        }

        // Cancel waiters at arbitrary points of their take.
        let mut delivered = 0;
        for _ in 0..20 {
            let waited =
                tokio::time::timeout(Duration::from_micros(50), queue.wait_for_message()).await;
            if let Ok(next) = waited {
                next.unwrap();
                delivered += 1;
            }
        }

        while let Ok(next) =
            tokio::time::timeout(Duration::from_millis(200), queue.wait_for_message()).await
        {
            next.unwrap();
            delivered += 1;
        }
        assert_eq!(delivered, 20);
        assert_eq!(queue.size(), 0);
        assert_conserved(&queue);
    }

    #[test]
    fn test_garbage_file_is_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(Config::QUEUE_FILE_NAME);
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();

        let queue = StackQueue::open(dir.path()).unwrap();
        assert!(queue.was_reset());
        assert_eq!(queue.size(), 0);
        queue.add(msg("http://example.com/")).unwrap();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_undecodable_record_resets_store() {
        let dir = TempDir::new().unwrap();
        {
            let queue = StackQueue::open(dir.path()).unwrap();
            queue.add(msg("http://example.com/ok")).unwrap();
        }
        {
            let db = Database::create(dir.path().join(Config::QUEUE_FILE_NAME)).unwrap();
            let write_txn = db.begin_write().unwrap();
            {
                let mut table = write_txn.open_table(STACK_MESSAGES).unwrap();
                table.insert("broken000000", [1u8, 2, 3].as_slice()).unwrap();
            }
            write_txn.commit().unwrap();
        }

        let queue = StackQueue::open(dir.path()).unwrap();
        assert!(queue.was_reset());
        assert_eq!(queue.size(), 0);
        assert_conserved(&queue);
    }
}
