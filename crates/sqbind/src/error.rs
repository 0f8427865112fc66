use core::ffi::c_int;
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::ffi;

/// Error raised by a registered host callable.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by host callables invoked from the engine.
pub type CallbackResult<T> = std::result::Result<T, CallbackError>;

pub type Result<T> = std::result::Result<T, Error>;

/// The binding's error taxonomy. Engine result codes are translated into
/// these categories exactly once, at the foreign boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("operation illegal in current state: {0}")]
	State(String),

	#[error("cannot marshal value: {0}")]
	Type(String),

	#[error("out of range: {0}")]
	Range(String),

	#[error("database busy after {attempts} attempts ({waited:?}): {message}")]
	Busy { message: String, attempts: u32, waited: Duration },

	#[error("engine error {code}: {message}")]
	Engine { code: i32, message: String },

	#[error("handle invalidated by concurrent modification: {0}")]
	Stale(String),

	#[error("callback {function:?} raised: {source}")]
	Callback {
		function: String,
		#[source]
		source: CallbackError,
	},
}

impl Error {
	pub(crate) fn busy_now(message: impl Into<String>) -> Self {
		Self::Busy { message: message.into(), attempts: 0, waited: Duration::ZERO }
	}

	#[must_use]
	pub const fn is_busy(&self) -> bool {
		matches!(self, Self::Busy { .. })
	}

	#[must_use]
	pub const fn is_stale(&self) -> bool {
		matches!(self, Self::Stale(_))
	}
}

/// Category a primary engine result code translates into.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ErrorClass {
	Busy,
	Range,
	State,
	Stale,
	Engine,
}

/// Process-wide registry mapping primary engine result codes to taxonomy
/// categories. Built once, read-only afterwards.
fn error_classes() -> &'static HashMap<c_int, ErrorClass> {
	static CLASSES: OnceLock<HashMap<c_int, ErrorClass>> = OnceLock::new();
	CLASSES.get_or_init(|| {
		let mut classes = HashMap::new();
		classes.insert(crate::SQLITE_BUSY, ErrorClass::Busy);
		classes.insert(crate::SQLITE_LOCKED, ErrorClass::Busy);
		classes.insert(crate::SQLITE_RANGE, ErrorClass::Range);
		classes.insert(crate::SQLITE_MISUSE, ErrorClass::State);
		classes.insert(crate::SQLITE_ABORT, ErrorClass::Stale);
		classes
	})
}

pub(crate) fn classify(code: c_int) -> ErrorClass {
	error_classes().get(&(code & 0xff)).copied().unwrap_or(ErrorClass::Engine)
}

pub(crate) fn is_busy_code(code: c_int) -> bool {
	classify(code) == ErrorClass::Busy
}

fn db_error_message(db: *mut ffi::Sqlite3, code: c_int) -> String {
	if !db.is_null() {
		let message = unsafe { ffi::sqlite3_errmsg(db) };
		if !message.is_null() {
			return unsafe { CStr::from_ptr(message).to_string_lossy().into_owned() };
		}
	}

	let message = unsafe { ffi::sqlite3_errstr(code) };
	if message.is_null() {
		"unknown engine error".to_string()
	} else {
		unsafe { CStr::from_ptr(message).to_string_lossy().into_owned() }
	}
}

/// Translate an engine result code into the taxonomy. The extended code is
/// preferred for `Engine` wrapping when the handle carries one.
pub(crate) fn translate(db: *mut ffi::Sqlite3, code: c_int) -> Error {
	let message = db_error_message(db, code);
	match classify(code) {
		ErrorClass::Busy => Error::Busy { message, attempts: 1, waited: Duration::ZERO },
		ErrorClass::Range => Error::Range(message),
		ErrorClass::State => Error::State(message),
		ErrorClass::Stale => Error::Stale(message),
		ErrorClass::Engine => {
			let extended = if db.is_null() { 0 } else { unsafe { ffi::sqlite3_extended_errcode(db) } };
			let code = if extended == 0 { code } else { extended };
			Error::Engine { code, message }
		}
	}
}

/// One-deep mailbox carrying an error raised by a host callable out of an
/// engine-invoked trampoline, to be re-raised once the triggering engine call
/// returns to host code. The first error wins; later ones are dropped.
#[derive(Default)]
pub(crate) struct CallbackErrorSlot(parking_lot::Mutex<Option<Error>>);

impl CallbackErrorSlot {
	pub(crate) fn store(&self, error: Error) {
		let mut slot = self.0.lock();
		if slot.is_none() {
			*slot = Some(error);
		}
	}

	pub(crate) fn take(&self) -> Option<Error> {
		self.0.lock().take()
	}
}
