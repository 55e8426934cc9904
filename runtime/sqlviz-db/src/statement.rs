//! Prepared statements driven through the raw SQLite API.

use crate::arena::ParamArena;
use crate::engine::errmsg;
use crate::error::{Error, Result};
use crate::value::{Params, Value};
use rusqlite::{Connection, ffi};
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;

/// Identifier of a statement held in a session's registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatementId(pub u64);

/// One compiled SQL statement.
///
/// Text and blob parameters are copied into a [`ParamArena`] and bound
/// without a destructor; the arena is released on every [`reset`](Self::reset).
/// A `Statement` must not outlive the connection it was prepared on; the
/// session finalizes its statements before closing the handle.
pub struct Statement {
    raw: *mut ffi::sqlite3_stmt,
    db: *mut ffi::sqlite3,
    pos: c_int,
    arena: ParamArena,
}

impl Statement {
    /// Compiles the first statement of `sql`.
    ///
    /// Returns the statement (or `None` when the head is only whitespace or
    /// comments) and the number of bytes consumed.
    pub(crate) fn prepare(conn: &Connection, sql: &str) -> Result<(Option<Self>, usize)> {
        let len = c_int::try_from(sql.len())
            .map_err(|_| Error::Engine("statement text too long".to_string()))?;
        let db = unsafe { conn.handle() };
        let head = sql.as_ptr() as *const c_char;
        let mut raw = ptr::null_mut();
        let mut tail: *const c_char = ptr::null();
        let rc = unsafe { ffi::sqlite3_prepare_v2(db, head, len, &mut raw, &mut tail) };
        if rc != ffi::SQLITE_OK {
            return Err(Error::Engine(errmsg(db)));
        }
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            (tail as usize - head as usize).min(sql.len())
        };
        if raw.is_null() {
            return Ok((None, consumed));
        }
        Ok((
            Some(Self {
                raw,
                db,
                pos: 1,
                arena: ParamArena::new(),
            }),
            consumed,
        ))
    }

    /// Resets the statement and binds `params`.
    ///
    /// Named keys that match no parameter in the statement text are skipped.
    pub fn bind(&mut self, params: &Params) -> Result<bool> {
        self.reset();
        match params {
            Params::Positional(values) => self.bind_values(values)?,
            Params::Named(values) => {
                for (name, value) in values {
                    let Ok(cname) = CString::new(name.as_str()) else {
                        continue;
                    };
                    let index = unsafe { ffi::sqlite3_bind_parameter_index(self.raw, cname.as_ptr()) };
                    if index != 0 {
                        self.bind_value(value, Some(index))?;
                    }
                }
            }
        }
        Ok(true)
    }

    /// Binds `values` positionally from index 1.
    pub fn bind_values<'a, I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        for (idx, value) in values.into_iter().enumerate() {
            let index = c_int::try_from(idx + 1)
                .map_err(|_| Error::Engine("too many parameters".to_string()))?;
            self.bind_value(value, Some(index))?;
        }
        Ok(())
    }

    /// Binds one value at `index`, or at the parameter cursor when `index` is `None`.
    pub fn bind_value(&mut self, value: &Value, index: Option<c_int>) -> Result<()> {
        let pos = match index {
            Some(pos) => pos,
            None => {
                let pos = self.pos;
                self.pos += 1;
                pos
            }
        };
        let rc = match value {
            Value::Null => unsafe { ffi::sqlite3_bind_null(self.raw, pos) },
            Value::Bool(b) => unsafe { ffi::sqlite3_bind_int64(self.raw, pos, i64::from(*b)) },
            Value::Integer(n) => unsafe { ffi::sqlite3_bind_int64(self.raw, pos, *n) },
            Value::Real(x) => unsafe { ffi::sqlite3_bind_double(self.raw, pos, *x) },
            Value::Text(text) => {
                let slot = self.arena.allocate(text.as_bytes());
                let len = slot_len(slot.len())?;
                unsafe {
                    ffi::sqlite3_bind_text(
                        self.raw,
                        pos,
                        slot.as_ptr() as *const c_char,
                        len,
                        ffi::SQLITE_STATIC(),
                    )
                }
            }
            Value::Blob(bytes) => {
                let slot = self.arena.allocate(bytes);
                let len = slot_len(slot.len())?;
                unsafe {
                    ffi::sqlite3_bind_blob(
                        self.raw,
                        pos,
                        slot.as_ptr() as *const c_void,
                        len,
                        ffi::SQLITE_STATIC(),
                    )
                }
            }
            Value::Unsupported(_) => {
                return Err(Error::BindingType(format!(
                    "tried to bind a value of an unknown type ({})",
                    value.type_name()
                )));
            }
        };
        if rc != ffi::SQLITE_OK {
            return Err(Error::Engine(errmsg(self.db)));
        }
        Ok(())
    }

    /// Advances one row. `Ok(true)` when a row is available, `Ok(false)` when done.
    pub fn step(&mut self) -> Result<bool> {
        match unsafe { ffi::sqlite3_step(self.raw) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            _ => Err(Error::Engine(errmsg(self.db))),
        }
    }

    /// Reads the current row. With `params`, binds them and steps once first.
    pub fn get(&mut self, params: Option<&Params>) -> Result<Vec<Value>> {
        if let Some(params) = params {
            if self.bind(params)? {
                self.step()?;
            }
        }
        let count = unsafe { ffi::sqlite3_column_count(self.raw) };
        Ok((0..count).map(|col| self.column(col)).collect())
    }

    fn column(&self, col: c_int) -> Value {
        match unsafe { ffi::sqlite3_column_type(self.raw, col) } {
            ffi::SQLITE_INTEGER => Value::Integer(unsafe { ffi::sqlite3_column_int64(self.raw, col) }),
            ffi::SQLITE_FLOAT => Value::Real(unsafe { ffi::sqlite3_column_double(self.raw, col) }),
            ffi::SQLITE_TEXT => {
                let text = unsafe { ffi::sqlite3_column_text(self.raw, col) };
                let len = unsafe { ffi::sqlite3_column_bytes(self.raw, col) };
                let bytes = unsafe { column_bytes(text, len) };
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
            ffi::SQLITE_BLOB => {
                let blob = unsafe { ffi::sqlite3_column_blob(self.raw, col) };
                let len = unsafe { ffi::sqlite3_column_bytes(self.raw, col) };
                Value::Blob(unsafe { column_bytes(blob as *const u8, len) }.to_vec())
            }
            _ => Value::Null,
        }
    }

    /// Result column names in declared order.
    pub fn column_names(&self) -> Vec<String> {
        let count = unsafe { ffi::sqlite3_column_count(self.raw) };
        (0..count)
            .map(|col| {
                let name = unsafe { ffi::sqlite3_column_name(self.raw, col) };
                if name.is_null() {
                    String::new()
                } else {
                    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
                }
            })
            .collect()
    }

    pub fn parameter_count(&self) -> usize {
        let count = unsafe { ffi::sqlite3_bind_parameter_count(self.raw) };
        usize::try_from(count).unwrap_or(0)
    }

    /// Binds, steps once and resets.
    pub fn run(&mut self, params: Option<&Params>) -> Result<bool> {
        if let Some(params) = params {
            self.bind(params)?;
        }
        self.step()?;
        Ok(self.reset())
    }

    /// Clears bindings and rewinds the cursor. The parameter arena is released
    /// whatever the two calls return.
    pub fn reset(&mut self) -> bool {
        let cleared = unsafe { ffi::sqlite3_clear_bindings(self.raw) } == ffi::SQLITE_OK;
        let rewound = unsafe { ffi::sqlite3_reset(self.raw) } == ffi::SQLITE_OK;
        self.arena.release_all();
        self.pos = 1;
        cleared && rewound
    }

    /// Bytes currently held for bound text/blob parameters.
    pub fn arena_bytes(&self) -> usize {
        self.arena.bytes_in_use()
    }

    /// Finalizes the statement.
    pub fn free(mut self) -> bool {
        self.finalize()
    }

    fn finalize(&mut self) -> bool {
        if self.raw.is_null() {
            return true;
        }
        let rc = unsafe { ffi::sqlite3_finalize(self.raw) };
        self.raw = ptr::null_mut();
        self.arena.release_all();
        rc == ffi::SQLITE_OK
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn slot_len(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| Error::Engine("parameter too large".to_string()))
}

/// # Safety
/// `data` must point to `len` readable bytes that outlive the returned slice.
unsafe fn column_bytes<'a>(data: *const u8, len: c_int) -> &'a [u8] {
    let len = usize::try_from(len).unwrap_or(0);
    if data.is_null() || len == 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(data, len) }
}
