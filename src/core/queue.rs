//! Global ordered queue of durable mutations
//!
//! Every mutation accepted by one adapter goes through a single FIFO that a
//! drain task executes against the [`BlockStore`] one operation at a time.
//! Before an operation is appended it is offered to the operations still
//! waiting in the queue, which lets redundant work disappear:
//!
//! | incoming      | latest pending op on the same file | result                         |
//! |---------------|------------------------------------|--------------------------------|
//! | `DeleteFile`  | `DeleteFile`                       | resolves at once               |
//! | `DeleteFile`  | `CreateFile` anywhere in the queue | create, its ops and delete vanish |
//! | `DeleteFile`  | writes / truncates                 | those are dropped, delete queues |
//! | `WriteBytes`  | `WriteBytes`                       | ranges appended to pending op  |
//! | `SetLength`   | `SetLength`                        | pending length replaced        |
//!
//! Only the latest pending op of a file is a merge target, so no operation
//! ever overtakes another one on the same file. A delete only cancels a
//! queued create while the store has not assigned the file an id yet; a
//! create for a file the store already holds is skipped by the drain.

use crate::core::block_store::{BlockStore, StoreFileId, WriteBatch};
use crate::core::file_table::FileId;
use crate::error::{Result, VfsError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Maps adapter ids to the ids the store assigned
pub type IdMap = HashMap<FileId, StoreFileId>;

type Outcome = Option<Result<()>>;

/// A durable mutation waiting to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    CreateFile { file: FileId, name: String },
    DeleteFile { file: FileId },
    WriteBytes { file: FileId, batch: WriteBatch },
    SetLength { file: FileId, length: u64 },
}

impl PendingOperation {
    pub fn file(&self) -> FileId {
        match self {
            PendingOperation::CreateFile { file, .. }
            | PendingOperation::DeleteFile { file }
            | PendingOperation::WriteBytes { file, .. }
            | PendingOperation::SetLength { file, .. } => *file,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PendingOperation::CreateFile { .. } => "create",
            PendingOperation::DeleteFile { .. } => "delete",
            PendingOperation::WriteBytes { .. } => "write",
            PendingOperation::SetLength { .. } => "set_length",
        }
    }

    /// Offer this operation to the not-yet-started queue
    fn try_merge_into(self, pending: &mut VecDeque<QueuedOperation>, ids: &IdMap) -> Merge {
        let file = self.file();
        match self {
            PendingOperation::DeleteFile { .. } => {
                let already_deleting = pending
                    .iter()
                    .any(|q| matches!(q.op, PendingOperation::DeleteFile { file: f } if f == file));
                if already_deleting {
                    trace!("delete of {} already queued", file);
                    return Merge::Consumed(OperationTicket::resolved());
                }

                let create_pending = !ids.contains_key(&file)
                    && pending
                        .iter()
                        .any(|q| matches!(q.op, PendingOperation::CreateFile { file: f, .. } if f == file));

                // Everything still queued for this file is moot now
                pending.retain(|q| {
                    if q.op.file() == file {
                        trace!("dropping queued {} of {}", q.op.kind(), file);
                        q.done.send_replace(Some(Ok(())));
                        false
                    } else {
                        true
                    }
                });

                if create_pending {
                    debug!("delete of {} cancelled its queued create", file);
                    Merge::Consumed(OperationTicket::resolved())
                } else {
                    Merge::Unconsumed(self)
                }
            }
            PendingOperation::WriteBytes { file, batch } => {
                match pending.iter_mut().rev().find(|q| q.op.file() == file) {
                    Some(QueuedOperation {
                        op: PendingOperation::WriteBytes { batch: existing, .. },
                        done,
                        seq,
                    }) => {
                        existing.absorb(batch);
                        trace!("write to {} merged into queued op {}", file, seq);
                        Merge::Consumed(OperationTicket::new(*seq, done.subscribe()))
                    }
                    _ => Merge::Unconsumed(PendingOperation::WriteBytes { file, batch }),
                }
            }
            PendingOperation::SetLength { file, length } => {
                match pending.iter_mut().rev().find(|q| q.op.file() == file) {
                    Some(QueuedOperation {
                        op: PendingOperation::SetLength { length: existing, .. },
                        done,
                        seq,
                    }) => {
                        *existing = length;
                        Merge::Consumed(OperationTicket::new(*seq, done.subscribe()))
                    }
                    _ => Merge::Unconsumed(PendingOperation::SetLength { file, length }),
                }
            }
            create @ PendingOperation::CreateFile { .. } => Merge::Unconsumed(create),
        }
    }

    /// Run against the store
    async fn execute(&self, store: &dyn BlockStore, shared: &QueueShared) -> Result<()> {
        match self {
            PendingOperation::CreateFile { file, name } => {
                let stored = shared.state.lock().ids.contains_key(file);
                if stored {
                    trace!("{} already stored, skipping create", file);
                    return Ok(());
                }
                let store_id = store.create_file(name).await?;
                shared.state.lock().ids.insert(*file, store_id);
                Ok(())
            }
            PendingOperation::DeleteFile { file } => {
                let store_id = shared.resolve(*file)?;
                store.delete_file(store_id).await?;
                shared.state.lock().ids.remove(file);
                Ok(())
            }
            PendingOperation::WriteBytes { file, batch } => {
                let store_id = shared.resolve(*file)?;
                store.write_ranges(store_id, batch).await
            }
            PendingOperation::SetLength { file, length } => {
                let store_id = shared.resolve(*file)?;
                store.set_length(store_id, *length).await
            }
        }
    }
}

enum Merge {
    Consumed(OperationTicket),
    Unconsumed(PendingOperation),
}

struct QueuedOperation {
    seq: u64,
    op: PendingOperation,
    done: watch::Sender<Outcome>,
}

/// Completion of one accepted operation
///
/// Operations that were cancelled or made moot by a later delete resolve
/// `Ok`. Operations merged into another share its ticket.
#[derive(Debug, Clone)]
pub struct OperationTicket {
    seq: u64,
    rx: watch::Receiver<Outcome>,
}

impl OperationTicket {
    fn new(seq: u64, rx: watch::Receiver<Outcome>) -> Self {
        Self { seq, rx }
    }

    /// A ticket that is already settled successfully
    pub fn resolved() -> Self {
        let (_tx, rx) = watch::channel(Some(Ok(())));
        Self { seq: 0, rx }
    }

    fn failed(err: VfsError) -> Self {
        let (_tx, rx) = watch::channel(Some(Err(err)));
        Self { seq: 0, rx }
    }

    /// Queue position of the operation this ticket follows
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Outcome if the operation has settled, without waiting
    pub fn outcome(&self) -> Option<Result<()>> {
        self.rx.borrow().clone()
    }

    pub async fn wait(mut self) -> Result<()> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone().unwrap_or_else(|| {
                    Err(VfsError::StorageUnavailable(
                        "operation queue shut down".to_string(),
                    ))
                });
            }
        }
    }
}

/// Resolves once everything accepted before it was created has settled
#[derive(Debug, Clone)]
pub struct FlushTicket {
    target: u64,
    rx: Option<watch::Receiver<u64>>,
}

impl FlushTicket {
    fn ready() -> Self {
        Self { target: 0, rx: None }
    }

    pub fn is_settled(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow() >= self.target,
            None => true,
        }
    }

    pub async fn wait(self) {
        let Some(mut rx) = self.rx else {
            return;
        };
        loop {
            if *rx.borrow_and_update() >= self.target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Durability barrier returned by a handle's `sync`
///
/// Waiting on it never happens inside the engine's call frame; the host
/// awaits it from its own event loop.
#[derive(Debug, Default)]
pub struct SyncBarrier {
    flush: Option<FlushTicket>,
    tickets: Vec<OperationTicket>,
}

impl SyncBarrier {
    /// A barrier with nothing to wait for
    pub fn ready() -> Self {
        Self::default()
    }

    pub fn new(flush: FlushTicket, tickets: Vec<OperationTicket>) -> Self {
        Self {
            flush: Some(flush),
            tickets,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.flush.as_ref().map_or(true, FlushTicket::is_settled)
    }

    /// Wait for the flush, then report the first failure among the
    /// operations this barrier covers
    pub async fn wait(self) -> Result<()> {
        if let Some(flush) = self.flush {
            flush.wait().await;
        }
        for ticket in self.tickets {
            ticket.wait().await?;
        }
        Ok(())
    }
}

struct QueueState {
    pending: VecDeque<QueuedOperation>,
    in_flight: Option<u64>,
    next_seq: u64,
    /// Every op with seq <= settled has finished or been cancelled
    settled: u64,
    /// First failure since the last adapter-level flush
    unreported: Option<VfsError>,
    /// Store ids of the files the store holds
    ids: IdMap,
    shutdown: bool,
}

impl QueueState {
    fn advance(&mut self, progress: &watch::Sender<u64>) {
        let floor = self
            .in_flight
            .into_iter()
            .chain(self.pending.front().map(|q| q.seq))
            .min()
            .map_or(self.next_seq - 1, |seq| seq - 1);
        if floor > self.settled {
            self.settled = floor;
            progress.send_replace(floor);
        }
    }

    fn tail(&self) -> Option<u64> {
        self.pending.back().map(|q| q.seq).or(self.in_flight)
    }
}

struct QueueShared {
    state: Mutex<QueueState>,
    wake: Notify,
    progress: watch::Sender<u64>,
}

impl QueueShared {
    fn resolve(&self, file: FileId) -> Result<StoreFileId> {
        self.state
            .lock()
            .ids
            .get(&file)
            .copied()
            .ok_or_else(|| VfsError::Consistency(format!("no stored file for {}", file)))
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: bool,
    pub accepted: u64,
    pub settled: u64,
}

/// Single global FIFO of durable mutations for one adapter
pub struct OperationQueue {
    shared: Arc<QueueShared>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl OperationQueue {
    /// Start the drain task on the current tokio runtime
    ///
    /// `ids` maps files already present in the store.
    pub fn start(store: Arc<dyn BlockStore>, ids: IdMap) -> Self {
        let (progress, _) = watch::channel(0);
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: None,
                next_seq: 1,
                settled: 0,
                unreported: None,
                ids,
                shutdown: false,
            }),
            wake: Notify::new(),
            progress,
        });
        let drain = tokio::spawn(drain(Arc::clone(&shared), store));
        Self {
            shared,
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Accept an operation; never waits
    ///
    /// Once the queue is shut down the ticket fails at once.
    pub fn enqueue(&self, op: PendingOperation) -> OperationTicket {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.shutdown {
            let err = VfsError::StorageUnavailable("operation queue shut down".to_string());
            debug!("rejected {} of {}: {}", op.kind(), op.file(), err);
            state.unreported.get_or_insert_with(|| err.clone());
            return OperationTicket::failed(err);
        }

        let op = match op.try_merge_into(&mut state.pending, &state.ids) {
            Merge::Consumed(ticket) => {
                state.advance(&self.shared.progress);
                return ticket;
            }
            Merge::Unconsumed(op) => op,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        trace!("queued {} of {} as {}", op.kind(), op.file(), seq);

        let (done, rx) = watch::channel(None);
        state.pending.push_back(QueuedOperation { seq, op, done });
        drop(guard);

        self.shared.wake.notify_one();
        OperationTicket::new(seq, rx)
    }

    /// Barrier over everything accepted so far
    pub fn flush(&self) -> FlushTicket {
        let state = self.shared.state.lock();
        if state.shutdown {
            return FlushTicket::ready();
        }
        match state.tail() {
            Some(target) if target > state.settled => FlushTicket {
                target,
                rx: Some(self.shared.progress.subscribe()),
            },
            _ => FlushTicket::ready(),
        }
    }

    /// Take the first failure recorded since the previous call
    pub fn take_failure(&self) -> Option<VfsError> {
        self.shared.state.lock().unreported.take()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            pending: state.pending.len(),
            in_flight: state.in_flight.is_some(),
            accepted: state.next_seq - 1,
            settled: state.settled,
        }
    }

    /// Drain everything and stop the drain task
    pub async fn shutdown(&self) {
        self.flush().wait().await;
        self.signal_shutdown();
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            if let Err(err) = drain.await {
                warn!("operation queue drain task ended abnormally: {}", err);
            }
        }
    }

    fn signal_shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_one();
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        // The drain task finishes whatever is queued, then exits
        self.signal_shutdown();
    }
}

async fn drain(shared: Arc<QueueShared>, store: Arc<dyn BlockStore>) {
    loop {
        let next = {
            let mut state = shared.state.lock();
            match state.pending.pop_front() {
                Some(queued) => {
                    state.in_flight = Some(queued.seq);
                    Some(queued)
                }
                None if state.shutdown => break,
                None => None,
            }
        };

        let Some(queued) = next else {
            shared.wake.notified().await;
            continue;
        };

        let result = queued.op.execute(store.as_ref(), &shared).await;
        if let Err(err) = &result {
            warn!(
                "durable {} of {} failed: {}",
                queued.op.kind(),
                queued.op.file(),
                err
            );
        }

        let mut state = shared.state.lock();
        if let Err(err) = &result {
            state.unreported.get_or_insert_with(|| err.clone());
        }
        queued.done.send_replace(Some(result));
        state.in_flight = None;
        state.advance(&shared.progress);
    }
    debug!("operation queue drained and stopped");
}
