//! Caller side: request correlation and progress routing.

use crate::mailbox::{Mailbox, MailboxConfig, spawn_mailbox};
use crate::protocol::{Command, Outbound, Payload, QUEUE_FULL, Reply};
use crossbeam_channel::{Receiver, TrySendError, unbounded};
use sqlviz_db::{ColumnData, ExecResult, ImportSummary, Params, ProgressUpdate, TableSchema};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The worker answered with `{error}`.
    #[error("{0}")]
    Worker(String),
    #[error("worker disconnected")]
    Disconnected,
    #[error("unexpected reply payload for {0}")]
    UnexpectedPayload(&'static str),
    #[error("{0}")]
    InvalidTableName(String),
    #[error("failed to start worker: {0}")]
    Spawn(#[from] io::Error),
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Counters {
    next: u64,
    channels: HashMap<u64, mpsc::UnboundedSender<f64>>,
}

/// Hands out progress counter ids and routes progress messages to them.
#[derive(Clone, Default)]
pub struct ProgressRegistry {
    inner: Arc<Mutex<Counters>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a counter. Ids start at 0 and are never reused.
    pub fn create(&self) -> ProgressStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut counters = lock(&self.inner);
        let id = counters.next;
        counters.next += 1;
        counters.channels.insert(id, tx);
        ProgressStream { id, rx }
    }

    pub fn delete(&self, id: u64) -> bool {
        lock(&self.inner).channels.remove(&id).is_some()
    }

    /// Delivers `update` to its counter. Returns false when nobody listens.
    pub fn route(&self, update: ProgressUpdate) -> bool {
        let counters = lock(&self.inner);
        let delivered = counters
            .channels
            .get(&update.id)
            .is_some_and(|tx| tx.send(update.progress).is_ok());
        if !delivered {
            debug!(counter = update.id, progress = update.progress, "progress for unknown counter dropped");
        }
        delivered
    }

    pub fn active(&self) -> usize {
        lock(&self.inner).channels.len()
    }
}

/// Receiving end of one progress counter.
pub struct ProgressStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<f64>,
}

impl ProgressStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next value, or `None` once the counter is deleted and drained.
    pub async fn next(&mut self) -> Option<f64> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<f64> {
        self.rx.try_recv().ok()
    }
}

/// Talks to a mailbox running on its own thread.
pub struct WorkerClient {
    mailbox: Option<Mailbox>,
    pending: Pending,
    progress: ProgressRegistry,
    next_id: AtomicU64,
    router: Option<JoinHandle<()>>,
}

impl WorkerClient {
    pub fn spawn(config: MailboxConfig) -> Result<Self, ClientError> {
        let (outbound_tx, outbound_rx) = unbounded();
        let mailbox = spawn_mailbox(config, outbound_tx)?;
        let pending: Pending = Arc::default();
        let progress = ProgressRegistry::new();
        let router = thread::Builder::new().name("sqlviz-router".to_string()).spawn({
            let pending = Arc::clone(&pending);
            let progress = progress.clone();
            move || route_loop(outbound_rx, pending, progress)
        })?;
        Ok(Self {
            mailbox: Some(mailbox),
            pending,
            progress,
            next_id: AtomicU64::new(1),
            router: Some(router),
        })
    }

    pub fn progress(&self) -> &ProgressRegistry {
        &self.progress
    }

    /// Sends `command` and waits for its reply.
    pub async fn call(&self, command: Command) -> Result<Payload, ClientError> {
        let mailbox = self.mailbox.as_ref().ok_or(ClientError::Disconnected)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        match mailbox.try_submit(command.into_request(id)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                lock(&self.pending).remove(&id);
                return Err(ClientError::Worker(QUEUE_FULL.to_string()));
            }
            Err(TrySendError::Disconnected(_)) => {
                lock(&self.pending).remove(&id);
                return Err(ClientError::Disconnected);
            }
        }
        let reply = rx.await.map_err(|_| ClientError::Disconnected)?;
        reply.into_result().map_err(ClientError::Worker)
    }

    pub async fn open(&self, image: Option<Vec<u8>>) -> Result<(), ClientError> {
        match self.call(Command::Open { image }).await? {
            Payload::Ready => Ok(()),
            _ => Err(ClientError::UnexpectedPayload("open")),
        }
    }

    pub async fn reopen(&self) -> Result<(), ClientError> {
        match self.call(Command::Reopen).await? {
            Payload::Ready => Ok(()),
            _ => Err(ClientError::UnexpectedPayload("reopen")),
        }
    }

    pub async fn exec(
        &self,
        sql: &str,
        params: Option<Params>,
    ) -> Result<Vec<ExecResult>, ClientError> {
        let command = Command::Exec {
            sql: sql.to_string(),
            params,
        };
        match self.call(command).await? {
            Payload::Results(results) => Ok(results),
            _ => Err(ClientError::UnexpectedPayload("exec")),
        }
    }

    /// Imports `data`. Progress goes to `counter` when one is given.
    pub async fn import(
        &self,
        table: &str,
        data: ColumnData,
        counter: Option<u64>,
        chunk_size: Option<usize>,
    ) -> Result<ImportSummary, ClientError> {
        let command = Command::Import {
            table: table.to_string(),
            data,
            counter,
            chunk_size,
        };
        match self.call(command).await? {
            Payload::Imported(summary) => Ok(summary),
            _ => Err(ClientError::UnexpectedPayload("import")),
        }
    }

    pub async fn export(&self) -> Result<Vec<u8>, ClientError> {
        match self.call(Command::Export).await? {
            Payload::Database(bytes) => Ok(bytes),
            _ => Err(ClientError::UnexpectedPayload("export")),
        }
    }

    pub async fn close(&self) -> Result<(), ClientError> {
        match self.call(Command::Close).await? {
            Payload::Closed => Ok(()),
            _ => Err(ClientError::UnexpectedPayload("close")),
        }
    }

    pub async fn schema(&self) -> Result<Vec<TableSchema>, ClientError> {
        match self.call(Command::Schema).await? {
            Payload::Schema(tables) => Ok(tables),
            _ => Err(ClientError::UnexpectedPayload("schema")),
        }
    }

    /// Stops the worker after the queued requests finish. Blocks until it has.
    pub fn terminate(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(mailbox) = self.mailbox.take() {
            mailbox.shut_down();
        }
        if let Some(router) = self.router.take() {
            let _ = router.join();
        }
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn route_loop(outbound: Receiver<Outbound>, pending: Pending, progress: ProgressRegistry) {
    while let Ok(message) = outbound.recv() {
        match message {
            Outbound::Progress(update) => {
                progress.route(update);
            }
            Outbound::Reply(reply) => {
                let waiter = lock(&pending).remove(&reply.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(id = reply.id, "reply for unknown request dropped"),
                }
            }
        }
    }
    // Outstanding calls fail with `Disconnected`.
    lock(&pending).clear();
}
