//! Safe binding surface over the SQLite C API: connections, prepared
//! statements, dynamic values, host-defined callbacks, incremental blob I/O
//! and online backup, with serialized per-connection access and a bounded
//! busy-retry discipline.

mod backup;
mod blob;
mod busy;
mod cache;
mod connection;
mod error;
mod functions;
mod hooks;
mod statement;
mod value;

pub use sqbind_sqlite_ffi::ffi;

pub use crate::backup::{Backup, BackupCancelToken, BackupProgress, BackupRun};
pub use crate::blob::{BlobHandle, BlobMode};
pub use crate::busy::{Backoff, BusyPolicy};
pub use crate::connection::{Connection, OpenOptions, Transaction, TransactionMode};
pub use crate::error::{CallbackError, CallbackResult, Error, Result};
pub use crate::functions::{Aggregate, FunctionOptions};
pub use crate::hooks::{AuthContext, Authorization, TraceEvent, TraceEvents};
pub use crate::statement::Statement;
pub use crate::value::Value;

use core::ffi::c_int;

pub(crate) const SQLITE_OK: c_int = 0;
pub(crate) const SQLITE_ROW: c_int = 100;
pub(crate) const SQLITE_DONE: c_int = 101;

pub(crate) const SQLITE_ABORT: c_int = 4;
pub(crate) const SQLITE_BUSY: c_int = 5;
pub(crate) const SQLITE_LOCKED: c_int = 6;
pub(crate) const SQLITE_MISUSE: c_int = 21;
pub(crate) const SQLITE_RANGE: c_int = 25;

pub(crate) const SQLITE_INTEGER: c_int = 1;
pub(crate) const SQLITE_FLOAT: c_int = 2;
pub(crate) const SQLITE_TEXT: c_int = 3;
pub(crate) const SQLITE_BLOB: c_int = 4;

pub(crate) const SQLITE_OPEN_READONLY: c_int = 0x0000_0001;
pub(crate) const SQLITE_OPEN_READWRITE: c_int = 0x0000_0002;
pub(crate) const SQLITE_OPEN_CREATE: c_int = 0x0000_0004;
pub(crate) const SQLITE_OPEN_URI: c_int = 0x0000_0040;
pub(crate) const SQLITE_OPEN_MEMORY: c_int = 0x0000_0080;
pub(crate) const SQLITE_OPEN_SHAREDCACHE: c_int = 0x0002_0000;

pub(crate) const SQLITE_UTF8: u8 = 1;
pub(crate) const SQLITE_UTF8_ENCODING: c_int = 1;
pub(crate) const SQLITE_DETERMINISTIC: c_int = 0x0000_0800;

pub(crate) const SQLITE_DENY: c_int = 1;
pub(crate) const SQLITE_IGNORE: c_int = 2;

pub(crate) const SQLITE_TRACE_STMT: c_int = 0x01;
pub(crate) const SQLITE_TRACE_PROFILE: c_int = 0x02;
pub(crate) const SQLITE_TRACE_ROW: c_int = 0x04;
pub(crate) const SQLITE_TRACE_CLOSE: c_int = 0x08;

pub fn sqlite_lib_version() -> String {
	sqbind_sqlite_ffi::sqlite_lib_version()
}

pub fn sqlite_lib_version_number() -> i32 {
	sqbind_sqlite_ffi::sqlite_lib_version_number()
}

pub fn sqlite_source_id() -> String {
	sqbind_sqlite_ffi::sqlite_source_id()
}

pub fn sqlite_compile_option_used(name: &str) -> bool {
	sqbind_sqlite_ffi::sqlite_compile_option_used(name)
}

pub fn sqlite_compile_options() -> Vec<String> {
	sqbind_sqlite_ffi::sqlite_compile_options()
}
