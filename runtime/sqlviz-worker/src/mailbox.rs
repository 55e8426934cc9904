//! The execution mailbox: one thread, one session, requests in arrival order.

use crate::protocol::{Command, Outbound, Payload, QUEUE_FULL, Reply, Request};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use sqlviz_db::{DEFAULT_CHUNK_SIZE, ProgressUpdate, Session, SessionConfig, schema};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct MailboxConfig {
    pub max_queue: usize,
    pub chunk_size: usize,
    pub session: SessionConfig,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_queue: 64,
            chunk_size: DEFAULT_CHUNK_SIZE,
            session: SessionConfig::default(),
        }
    }
}

/// Runs commands against the session it owns.
pub struct Dispatcher {
    session: Session,
    chunk_size: usize,
}

impl Dispatcher {
    pub fn new(session: SessionConfig, chunk_size: usize) -> Self {
        Self {
            session: Session::new(session),
            chunk_size,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn dispatch(
        &mut self,
        command: Command,
        progress: &mut dyn FnMut(ProgressUpdate),
    ) -> sqlviz_db::Result<Payload> {
        Ok(match command {
            Command::Open { image } => {
                self.session.open(image.as_deref())?;
                Payload::Ready
            }
            Command::Reopen => {
                self.session.reopen()?;
                Payload::Ready
            }
            Command::Exec { sql, params } => Payload::Results(self.session.exec(&sql, params.as_ref())?),
            Command::Import {
                table,
                data,
                counter,
                chunk_size,
            } => {
                let chunk_size = chunk_size.unwrap_or(self.chunk_size);
                let mut forward = |update: ProgressUpdate| {
                    if counter.is_some() {
                        progress(update);
                    }
                };
                let summary = self.session.import(
                    &table,
                    &data,
                    counter.unwrap_or_default(),
                    chunk_size,
                    &mut forward,
                )?;
                Payload::Imported(summary)
            }
            Command::Export => Payload::Database(self.session.export()?),
            Command::Close => {
                self.session.close()?;
                Payload::Closed
            }
            Command::Schema => Payload::Schema(schema::introspect(&mut self.session)?),
        })
    }

    /// Handles one request. Never fails: errors and panics become `{error}` replies.
    pub fn handle(&mut self, request: Request, progress: &mut dyn FnMut(ProgressUpdate)) -> Reply {
        let id = request.id;
        let command = match Command::try_from(request) {
            Ok(command) => command,
            Err(err) => return Reply::error(id, err.to_string()),
        };
        let action = command.action();
        debug!(id, action, "dispatching request");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(command, progress)));
        match outcome {
            Ok(Ok(payload)) => Reply::ok(id, payload),
            Ok(Err(err)) => {
                debug!(id, action, error = %err, "request failed");
                Reply::error(id, err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(id, action, message = %message, "handler panicked");
                Reply::error(id, message)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker handler panicked".to_string()
    }
}

/// Submission side of a running mailbox.
pub struct Mailbox {
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

impl Mailbox {
    /// Queues `request` without blocking.
    pub fn try_submit(&self, request: Request) -> Result<(), TrySendError<Request>> {
        self.requests.try_send(request)
    }

    pub fn queued(&self) -> usize {
        self.requests.len()
    }

    /// Stops accepting requests and waits for the queued ones to finish.
    pub fn shut_down(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let (closed, _) = bounded(0);
        drop(std::mem::replace(&mut self.requests, closed));
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("mailbox thread panicked");
            }
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reply for a request turned away because the queue is full.
pub fn queue_full(id: u64) -> Reply {
    Reply::error(id, QUEUE_FULL)
}

/// Starts the mailbox thread. Replies and progress go to `outbound` in the
/// order they are produced.
pub fn spawn_mailbox(config: MailboxConfig, outbound: Sender<Outbound>) -> io::Result<Mailbox> {
    let (requests, inbox) = bounded::<Request>(config.max_queue.max(1));
    let thread = thread::Builder::new()
        .name("sqlviz-mailbox".to_string())
        .spawn(move || mailbox_loop(inbox, outbound, config))?;
    Ok(Mailbox {
        requests,
        thread: Some(thread),
    })
}

fn mailbox_loop(inbox: Receiver<Request>, outbound: Sender<Outbound>, config: MailboxConfig) {
    let mut dispatcher = Dispatcher::new(config.session, config.chunk_size);
    while let Ok(request) = inbox.recv() {
        let progress_tx = outbound.clone();
        let mut progress = move |update: ProgressUpdate| {
            if progress_tx.send(Outbound::Progress(update)).is_err() {
                warn!(counter = update.id, "progress dropped, caller is gone");
            }
        };
        let reply = dispatcher.handle(request, &mut progress);
        if outbound.send(Outbound::Reply(reply)).is_err() {
            debug!("outbound channel closed, stopping mailbox");
            break;
        }
    }
    if dispatcher.session().is_open() {
        if let Err(err) = dispatcher.session.close() {
            warn!(error = %err, "failed to close session on shutdown");
        }
    }
}
