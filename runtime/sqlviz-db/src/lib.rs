//! Single-handle SQLite session with bulk import and schema introspection.
//!
//! A [`Session`] owns the only engine handle. It is not `Send`: create it on
//! the thread that will drive it and route every operation there.

mod arena;
mod engine;
mod error;
mod functions;
pub mod import;
pub mod schema;
mod session;
mod statement;
mod value;

pub use arena::{ArenaSlot, ParamArena};
pub use engine::VirtualFile;
pub use error::{Error, Result};
pub use functions::FunctionResult;
pub use import::{ChunkPlan, DEFAULT_CHUNK_SIZE, ImportSummary, ProgressUpdate};
pub use schema::{ColumnSchema, TableSchema};
pub use session::{Session, SessionConfig, SessionState};
pub use statement::{Statement, StatementId};
pub use value::{ColumnData, ExecResult, Params, Value};
