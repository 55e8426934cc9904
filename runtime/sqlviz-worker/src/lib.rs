//! Worker-isolated execution for `sqlviz-db` sessions.
//!
//! A mailbox thread owns the only [`sqlviz_db::Session`] and handles requests
//! one at a time. Callers reach it in-process through [`WorkerClient`] and
//! [`Database`], or over framed stdio through the `sqlviz-worker` binary.

pub mod client;
pub mod codec;
pub mod config;
pub mod database;
pub mod frame;
pub mod mailbox;
pub mod protocol;
pub mod stdio;

pub use client::{ClientError, ProgressRegistry, ProgressStream, WorkerClient};
pub use codec::WireCodec;
pub use config::WorkerConfig;
pub use database::Database;
pub use mailbox::{Dispatcher, Mailbox, MailboxConfig, spawn_mailbox};
pub use protocol::{Command, Outbound, Payload, ProtocolError, Reply, Request};
