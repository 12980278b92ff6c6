//! Per-key bookkeeping for many concurrent transfers between a peer pair.
//!
//! Receiving: a consumer is registered when a header arrives, chunks are
//! routed to it by content key, and it is dropped once complete. Sending:
//! producers are queued and served round-robin so one large asset does not
//! starve the others.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use assetlink_protocol::{AssetChunk, AssetHeader, ContentKey};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::config::TransferConfig;
use crate::consumer::AssetConsumer;
use crate::producer::{AssetProducer, AssetSource, BoxedProducer};
use crate::progress::{ProgressHandle, TransferProgress};

/// A fully received asset, ready to be moved into the asset store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedAsset {
    pub id: ContentKey,
    pub name: String,
    /// The `.part` file holding the asset's bytes.
    pub path: PathBuf,
    pub size: u64,
}

/// Result of registering a header with [`TransferManager::add_consumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new consumer is waiting for chunks.
    Started,
    /// A transfer for this key is already running; it was left untouched.
    AlreadyActive,
    /// The asset is empty and was complete on arrival.
    Completed(CompletedAsset),
}

/// Receiving-side notifications.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Added(AssetHeader),
    Updated(TransferProgress),
    Completed(CompletedAsset),
    Failed { id: ContentKey, error: String },
}

/// Callback invoked for every [`TransferEvent`].
pub type EventCallback = Box<dyn Fn(&TransferEvent) + Send + Sync>;

type ConsumerSlot = Arc<Mutex<AssetConsumer>>;

struct ConsumerEntry {
    consumer: ConsumerSlot,
    progress: ProgressHandle,
}

/// Send queue. A producer being read is out of `ready` and listed in
/// `reading` under its ticket; abandoning its key removes the ticket so the
/// producer is discarded when the read returns.
#[derive(Default)]
struct ProducerQueue {
    ready: VecDeque<BoxedProducer>,
    reading: HashMap<u64, ContentKey>,
    next_ticket: u64,
}

/// Routes chunks to consumers and serves chunks from producers.
///
/// Safe to share between tasks. Each consumer has its own lock and the
/// registry lock is released before any chunk is written, so different
/// assets make progress in parallel. Chunks of one asset must still be fed
/// by a single flow of control, in the order they were produced.
pub struct TransferManager {
    dest_dir: PathBuf,
    config: TransferConfig,
    consumers: Mutex<HashMap<ContentKey, ConsumerEntry>>,
    producers: Mutex<ProducerQueue>,
    listeners: RwLock<Vec<EventCallback>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransferManager {
    /// Creates a manager that writes incoming assets under `dest_dir`.
    pub fn new(dest_dir: impl Into<PathBuf>, config: TransferConfig) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            config,
            consumers: Mutex::new(HashMap::new()),
            producers: Mutex::new(ProducerQueue::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Registers a listener for receiving-side events.
    pub fn on_event(&self, callback: EventCallback) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn emit(&self, event: TransferEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for cb in listeners.iter() {
            cb(&event);
        }
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Prepares to receive the asset described by `header`.
    pub fn add_consumer(&self, header: AssetHeader) -> Result<Registration, TransferError> {
        let mut consumers = lock(&self.consumers);
        if consumers.contains_key(&header.id) {
            debug!(key = %header.id, "transfer already active, header ignored");
            return Ok(Registration::AlreadyActive);
        }

        let consumer =
            AssetConsumer::with_policy(&self.dest_dir, header.clone(), self.config.overshoot)?;

        if consumer.is_complete() {
            drop(consumers);
            let done = completed(&consumer);
            info!(key = %done.id, name = %done.name, "empty asset complete on arrival");
            self.emit(TransferEvent::Added(header));
            self.emit(TransferEvent::Completed(done.clone()));
            return Ok(Registration::Completed(done));
        }

        let progress = consumer.progress();
        consumers.insert(
            header.id,
            ConsumerEntry {
                consumer: Arc::new(Mutex::new(consumer)),
                progress,
            },
        );
        drop(consumers);

        debug!(key = %header.id, name = %header.name, size = header.size, "receiving asset");
        self.emit(TransferEvent::Added(header));
        Ok(Registration::Started)
    }

    /// Feeds one chunk to the consumer for its key.
    ///
    /// Returns the finished asset when this chunk completed it. A consumer
    /// whose write fails is dropped before the error is returned.
    pub fn update(&self, chunk: &AssetChunk) -> Result<Option<CompletedAsset>, TransferError> {
        let slot = {
            let consumers = lock(&self.consumers);
            match consumers.get(&chunk.id) {
                Some(entry) => Arc::clone(&entry.consumer),
                None => return Err(TransferError::UnknownAsset(chunk.id)),
            }
        };

        let mut consumer = lock(&slot);
        if let Err(e) = consumer.accept(&chunk.data) {
            drop(consumer);
            return Err(self.fail(&slot, chunk.id, e));
        }

        if !consumer.is_complete() {
            let progress = consumer.progress().snapshot();
            drop(consumer);
            self.emit(TransferEvent::Updated(progress));
            return Ok(None);
        }

        if self.config.verify_on_complete {
            if let Err(e) = consumer.verify() {
                drop(consumer);
                return Err(self.fail(&slot, chunk.id, e));
            }
        }

        let done = completed(&consumer);
        drop(consumer);
        self.retire(&chunk.id, &slot);
        self.emit(TransferEvent::Completed(done.clone()));
        Ok(Some(done))
    }

    /// Unregisters `slot` if it is still the consumer for `id`. The key may
    /// have been abandoned and registered again while a chunk was written.
    fn retire(&self, id: &ContentKey, slot: &ConsumerSlot) {
        let mut consumers = lock(&self.consumers);
        if consumers
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.consumer, slot))
        {
            consumers.remove(id);
        }
    }

    fn fail(&self, slot: &ConsumerSlot, id: ContentKey, error: TransferError) -> TransferError {
        self.retire(&id, slot);
        warn!(key = %id, error = %error, "asset transfer failed");
        self.emit(TransferEvent::Failed {
            id,
            error: error.to_string(),
        });
        error
    }

    /// Drops the consumer and any producer for `id`, including one whose
    /// chunk is being read right now; that chunk is never returned.
    ///
    /// The partial file stays on disk until the next consumer for the same
    /// key removes it.
    pub fn abandon(&self, id: &ContentKey) -> bool {
        let had_consumer = lock(&self.consumers).remove(id).is_some();
        let had_producer = {
            let mut queue = lock(&self.producers);
            let before = queue.ready.len() + queue.reading.len();
            queue.ready.retain(|p| p.header().id != *id);
            queue.reading.retain(|_, key| key != id);
            queue.ready.len() + queue.reading.len() != before
        };
        if had_consumer || had_producer {
            info!(key = %id, "asset transfer abandoned");
        }
        had_consumer || had_producer
    }

    pub fn progress_handle(&self, id: &ContentKey) -> Option<ProgressHandle> {
        lock(&self.consumers).get(id).map(|e| e.progress.clone())
    }

    /// Progress of one incoming asset, read without waiting on its writer.
    pub fn consumer_progress(&self, id: &ContentKey) -> Option<TransferProgress> {
        self.progress_handle(id).map(|h| h.snapshot())
    }

    /// Progress of every incoming asset still in flight.
    pub fn active_consumers(&self) -> Vec<TransferProgress> {
        lock(&self.consumers)
            .values()
            .map(|e| e.progress.snapshot())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queues a producer; its chunks are interleaved with those already
    /// queued.
    pub fn add_producer<R: AssetSource + 'static>(&self, producer: AssetProducer<R>) {
        debug!(key = %producer.header().id, size = producer.size(), "queued asset for sending");
        lock(&self.producers).ready.push_back(producer.boxed());
    }

    /// Queues a file for sending and returns the header to announce to the
    /// peer before its chunks.
    pub fn push_file(&self, path: &Path) -> Result<AssetHeader, TransferError> {
        let header = AssetHeader::for_file(path)?;
        let producer = AssetProducer::from_file(header.clone(), path, self.config.chunk_size())?;
        self.add_producer(producer);
        Ok(header)
    }

    /// Queues an in-memory asset for sending.
    pub fn push_bytes(
        &self,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<AssetHeader, TransferError> {
        let header = AssetHeader::for_bytes(name, &data);
        let producer = AssetProducer::from_bytes(header.clone(), data, self.config.chunk_size())?;
        self.add_producer(producer);
        Ok(header)
    }

    /// Next chunk to send, taking producers in turn.
    ///
    /// Exhausted producers leave the queue. A producer whose source fails is
    /// dropped and the error returned; the others stay queued. The queue lock
    /// is not held while reading.
    pub fn next_chunk(&self) -> Result<Option<AssetChunk>, TransferError> {
        loop {
            let (ticket, mut producer) = {
                let mut queue = lock(&self.producers);
                let Some(producer) = queue.ready.pop_front() else {
                    return Ok(None);
                };
                let ticket = queue.next_ticket;
                queue.next_ticket = queue.next_ticket.wrapping_add(1);
                queue.reading.insert(ticket, producer.header().id);
                (ticket, producer)
            };

            let result = producer.produce();

            let mut queue = lock(&self.producers);
            if queue.reading.remove(&ticket).is_none() {
                debug!(key = %producer.header().id, "discarding read of abandoned asset");
                continue;
            }
            match result {
                Ok(Some(chunk)) => {
                    if !producer.is_exhausted() {
                        queue.ready.push_back(producer);
                    }
                    return Ok(Some(chunk));
                }
                Ok(None) => continue,
                Err(e) => {
                    drop(queue);
                    warn!(key = %producer.header().id, error = %e, "dropping failed producer");
                    return Err(e);
                }
            }
        }
    }

    /// Producers queued or being read.
    pub fn pending_producers(&self) -> usize {
        let queue = lock(&self.producers);
        queue.ready.len() + queue.reading.len()
    }

    pub fn has_pending_producers(&self) -> bool {
        self.pending_producers() > 0
    }
}

fn completed(consumer: &AssetConsumer) -> CompletedAsset {
    CompletedAsset {
        id: consumer.id(),
        name: consumer.name().to_string(),
        path: consumer.resolved_path().to_path_buf(),
        size: consumer.size(),
    }
}
