use crate::mailbox::MailboxConfig;
use sqlviz_db::{DEFAULT_CHUNK_SIZE, SessionConfig};
use std::env;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_MAX_QUEUE: usize = 64;

/// Worker settings: CLI flags first, then `SQLVIZ_*` variables, then defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    pub max_queue: usize,
    pub chunk_size: usize,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_MAX_QUEUE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            scratch_dir: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_sources(env::args().skip(1), |key| env::var(key).ok())
    }

    pub fn from_sources<I, F>(args: I, var: F) -> Self
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(val) = var("SQLVIZ_MAX_QUEUE").and_then(|val| val.parse().ok()) {
            config.max_queue = val;
        }
        if let Some(val) = var("SQLVIZ_CHUNK_SIZE").and_then(|val| val.parse().ok()) {
            config.chunk_size = val;
        }
        if let Some(val) = var("SQLVIZ_SCRATCH_DIR").filter(|val| !val.is_empty()) {
            config.scratch_dir = Some(PathBuf::from(val));
        }

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--max-queue" => {
                    if let Some(val) = args.next() {
                        config.max_queue = val.parse().unwrap_or(config.max_queue);
                    }
                }
                "--chunk-size" => {
                    if let Some(val) = args.next() {
                        config.chunk_size = val.parse().unwrap_or(config.chunk_size);
                    }
                }
                "--scratch-dir" => config.scratch_dir = args.next().map(PathBuf::from),
                "--stdio" => {}
                other => warn!(arg = other, "ignoring unknown argument"),
            }
        }
        config
    }

    pub fn mailbox(&self) -> MailboxConfig {
        MailboxConfig {
            max_queue: self.max_queue,
            chunk_size: self.chunk_size,
            session: SessionConfig {
                scratch_dir: self.scratch_dir.clone(),
            },
        }
    }
}
