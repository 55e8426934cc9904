//! SQLite connector helpers: the handle, its error text and the backing file.

use crate::error::Result;
use rusqlite::{Connection, OpenFlags, ffi};
use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

const BUSY_TIMEOUT_MS: u64 = 100;
const DB_FILE_NAME: &str = "database.sqlite";

/// Opens a read-write handle on `path`, creating the file when missing.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

/// Current `sqlite3_errmsg` text for `db`.
pub(crate) fn errmsg(db: *mut ffi::sqlite3) -> String {
    if db.is_null() {
        return "no database handle".to_string();
    }
    let msg = unsafe { ffi::sqlite3_errmsg(db) };
    if msg.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

/// The database file a session runs against.
///
/// Lives in its own scratch directory so rollback journals are cleaned up
/// together with it.
#[derive(Debug)]
pub struct VirtualFile {
    dir: TempDir,
    path: PathBuf,
}

impl VirtualFile {
    /// Materializes `image` (or nothing, for a fresh database) under `scratch`.
    pub fn create(scratch: Option<&Path>, image: Option<&[u8]>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sqlviz-");
        let dir = match scratch {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        let path = dir.path().join(DB_FILE_NAME);
        if let Some(bytes) = image {
            fs::write(&path, bytes)?;
        }
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole file. A database that was never written is empty.
    pub fn read(&self) -> Result<Vec<u8>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        Ok(fs::read(&self.path)?)
    }

    /// Deletes the scratch directory.
    pub fn release(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }
}
