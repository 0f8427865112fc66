use core::ffi::{c_int, c_void};

use crate::error::{Error, Result};
use crate::ffi;

/// A dynamically typed value crossing the engine boundary. Values are copied
/// across the boundary in both directions, never aliased.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Null,
	Integer(i64),
	Real(f64),
	Text(String),
	Blob(Vec<u8>),
}

impl Value {
	#[must_use]
	pub const fn type_name(&self) -> &'static str {
		match self {
			Self::Null => "null",
			Self::Integer(_) => "integer",
			Self::Real(_) => "real",
			Self::Text(_) => "text",
			Self::Blob(_) => "blob",
		}
	}

	#[must_use]
	pub const fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}

	#[must_use]
	pub fn as_integer(&self) -> Option<i64> {
		match self {
			Self::Integer(value) => Some(*value),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_real(&self) -> Option<f64> {
		match self {
			Self::Real(value) => Some(*value),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_text(&self) -> Option<&str> {
		match self {
			Self::Text(value) => Some(value),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_blob(&self) -> Option<&[u8]> {
		match self {
			Self::Blob(value) => Some(value),
			_ => None,
		}
	}
}

impl From<i64> for Value {
	fn from(value: i64) -> Self {
		Self::Integer(value)
	}
}

impl From<i32> for Value {
	fn from(value: i32) -> Self {
		Self::Integer(i64::from(value))
	}
}

impl From<u32> for Value {
	fn from(value: u32) -> Self {
		Self::Integer(i64::from(value))
	}
}

impl From<f64> for Value {
	fn from(value: f64) -> Self {
		Self::Real(value)
	}
}

impl From<bool> for Value {
	fn from(value: bool) -> Self {
		Self::Integer(i64::from(value))
	}
}

impl From<String> for Value {
	fn from(value: String) -> Self {
		Self::Text(value)
	}
}

impl From<&str> for Value {
	fn from(value: &str) -> Self {
		Self::Text(value.to_string())
	}
}

impl From<Vec<u8>> for Value {
	fn from(value: Vec<u8>) -> Self {
		Self::Blob(value)
	}
}

impl From<&[u8]> for Value {
	fn from(value: &[u8]) -> Self {
		Self::Blob(value.to_vec())
	}
}

impl<T: Into<Value>> From<Option<T>> for Value {
	fn from(value: Option<T>) -> Self {
		value.map_or(Self::Null, Into::into)
	}
}

/// The destructor sentinel telling the engine to copy the buffer before the
/// bind call returns (SQLITE_TRANSIENT).
pub(crate) fn sqlite_transient() -> unsafe extern "C" fn(*mut c_void) {
	unsafe { std::mem::transmute::<isize, unsafe extern "C" fn(*mut c_void)>(-1_isize) }
}

/// Bind one host value to a statement parameter. Returns the raw result code;
/// the caller owns translation and state bookkeeping.
pub(crate) fn bind_value_raw(stmt: *mut ffi::Sqlite3Stmt, index: c_int, value: &Value) -> c_int {
	match value {
		Value::Null => unsafe { ffi::sqlite3_bind_null(stmt, index) },
		Value::Integer(value) => unsafe { ffi::sqlite3_bind_int64(stmt, index, *value) },
		Value::Real(value) => unsafe { ffi::sqlite3_bind_double(stmt, index, *value) },
		Value::Text(value) => unsafe {
			ffi::sqlite3_bind_text64(
				stmt,
				index,
				value.as_ptr().cast(),
				value.len() as u64,
				Some(sqlite_transient()),
				crate::SQLITE_UTF8,
			)
		},
		Value::Blob(value) => unsafe {
			ffi::sqlite3_bind_blob64(
				stmt,
				index,
				value.as_ptr().cast(),
				value.len() as u64,
				Some(sqlite_transient()),
			)
		},
	}
}

fn text_from_parts(ptr: *const u8, len: c_int, what: &str) -> Result<String> {
	if ptr.is_null() || len <= 0 {
		return Ok(String::new());
	}
	let len = usize::try_from(len).unwrap_or_default();
	let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
	String::from_utf8(bytes.to_vec())
		.map_err(|_| Error::Type(format!("{what} holds text that is not valid UTF-8")))
}

fn blob_from_parts(ptr: *const c_void, len: c_int) -> Vec<u8> {
	if ptr.is_null() || len <= 0 {
		return Vec::new();
	}
	let len = usize::try_from(len).unwrap_or_default();
	unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) }.to_vec()
}

/// Read one result column. Legal only while the owning statement sits on a
/// row; the caller enforces that.
pub(crate) fn column_value_raw(stmt: *mut ffi::Sqlite3Stmt, index: c_int) -> Result<Value> {
	match unsafe { ffi::sqlite3_column_type(stmt, index) } {
		crate::SQLITE_INTEGER => {
			Ok(Value::Integer(unsafe { ffi::sqlite3_column_int64(stmt, index) }))
		}
		crate::SQLITE_FLOAT => Ok(Value::Real(unsafe { ffi::sqlite3_column_double(stmt, index) })),
		crate::SQLITE_TEXT => {
			let ptr = unsafe { ffi::sqlite3_column_text(stmt, index) };
			let len = unsafe { ffi::sqlite3_column_bytes(stmt, index) };
			Ok(Value::Text(text_from_parts(ptr, len, &format!("column {index}"))?))
		}
		crate::SQLITE_BLOB => {
			let ptr = unsafe { ffi::sqlite3_column_blob(stmt, index) };
			let len = unsafe { ffi::sqlite3_column_bytes(stmt, index) };
			Ok(Value::Blob(blob_from_parts(ptr, len)))
		}
		_ => Ok(Value::Null),
	}
}

/// Convert one engine value handle (a callback argument) to a host value.
pub(crate) fn value_from_raw(value: *mut ffi::Sqlite3Value, index: usize) -> Result<Value> {
	match unsafe { ffi::sqlite3_value_type(value) } {
		crate::SQLITE_INTEGER => Ok(Value::Integer(unsafe { ffi::sqlite3_value_int64(value) })),
		crate::SQLITE_FLOAT => Ok(Value::Real(unsafe { ffi::sqlite3_value_double(value) })),
		crate::SQLITE_TEXT => {
			let ptr = unsafe { ffi::sqlite3_value_text(value) };
			let len = unsafe { ffi::sqlite3_value_bytes(value) };
			Ok(Value::Text(text_from_parts(ptr, len, &format!("argument {index}"))?))
		}
		crate::SQLITE_BLOB => {
			let ptr = unsafe { ffi::sqlite3_value_blob(value) };
			let len = unsafe { ffi::sqlite3_value_bytes(value) };
			Ok(Value::Blob(blob_from_parts(ptr, len)))
		}
		_ => Ok(Value::Null),
	}
}

/// Convert the argument vector of an engine-invoked callback.
pub(crate) fn values_from_raw(
	argc: c_int,
	argv: *mut *mut ffi::Sqlite3Value,
) -> Result<Vec<Value>> {
	if argc <= 0 || argv.is_null() {
		return Ok(Vec::new());
	}

	let argc = usize::try_from(argc).unwrap_or_default();
	let args = unsafe { std::slice::from_raw_parts(argv, argc) };
	args.iter().enumerate().map(|(index, value)| value_from_raw(*value, index)).collect()
}

/// Hand one host value back to the engine as a callback result.
pub(crate) fn result_value_raw(context: *mut ffi::Sqlite3Context, value: &Value) {
	match value {
		Value::Null => unsafe { ffi::sqlite3_result_null(context) },
		Value::Integer(value) => unsafe { ffi::sqlite3_result_int64(context, *value) },
		Value::Real(value) => unsafe { ffi::sqlite3_result_double(context, *value) },
		Value::Text(value) => unsafe {
			ffi::sqlite3_result_text64(
				context,
				value.as_ptr().cast(),
				value.len() as u64,
				Some(sqlite_transient()),
				crate::SQLITE_UTF8,
			);
		},
		Value::Blob(value) => unsafe {
			ffi::sqlite3_result_blob64(
				context,
				value.as_ptr().cast(),
				value.len() as u64,
				Some(sqlite_transient()),
			);
		},
	}
}
