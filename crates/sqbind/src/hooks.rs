use core::ffi::{c_char, c_int, c_void};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::ffi::{CStr, CString};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::{error, ffi};

/// Decision returned by an authorizer for one attempted operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Authorization {
	Allow,
	Deny,
	Ignore,
}

/// One operation presented to the authorizer. The action code and the
/// meaning of the detail strings follow the engine's authorizer contract.
#[derive(Debug)]
pub struct AuthContext<'a> {
	pub action_code: i32,
	pub detail1: Option<&'a str>,
	pub detail2: Option<&'a str>,
	pub database: Option<&'a str>,
	pub trigger: Option<&'a str>,
}

/// Which observer events to deliver to a trace handler.
#[derive(Debug, Copy, Clone, Default)]
pub struct TraceEvents {
	pub statement: bool,
	pub profile: bool,
	pub row: bool,
	pub close: bool,
}

impl TraceEvents {
	fn mask(self) -> c_int {
		let mut mask = 0;
		if self.statement {
			mask |= crate::SQLITE_TRACE_STMT;
		}
		if self.profile {
			mask |= crate::SQLITE_TRACE_PROFILE;
		}
		if self.row {
			mask |= crate::SQLITE_TRACE_ROW;
		}
		if self.close {
			mask |= crate::SQLITE_TRACE_CLOSE;
		}
		mask
	}
}

/// One delivered trace observation.
#[derive(Debug)]
pub enum TraceEvent<'a> {
	Statement { sql: &'a str },
	Profile { sql: &'a str, elapsed: Duration },
	Row,
	Close,
}

struct CollationData {
	compare: Box<dyn Fn(&str, &str) -> Ordering + Send + Sync + 'static>,
}

pub(crate) struct AuthorizerData {
	decide: Box<dyn Fn(&AuthContext<'_>) -> Authorization + Send + Sync + 'static>,
}

pub(crate) struct ProgressData {
	callback: Box<dyn Fn() -> bool + Send + Sync + 'static>,
}

pub(crate) struct CommitHookData {
	callback: Box<dyn Fn() -> bool + Send + Sync + 'static>,
}

pub(crate) struct RollbackHookData {
	callback: Box<dyn Fn() + Send + Sync + 'static>,
}

pub(crate) struct TraceData {
	callback: Box<dyn Fn(&TraceEvent<'_>) + Send + Sync + 'static>,
}

fn optional_str<'a>(ptr: *const c_char) -> Option<&'a str> {
	if ptr.is_null() { None } else { unsafe { CStr::from_ptr(ptr) }.to_str().ok() }
}

fn collation_text<'a>(ptr: *const c_void, len: c_int) -> Cow<'a, str> {
	if ptr.is_null() || len <= 0 {
		return Cow::Borrowed("");
	}
	let len = usize::try_from(len).unwrap_or_default();
	let bytes = unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) };
	String::from_utf8_lossy(bytes)
}

unsafe extern "C" fn collation_trampoline(
	data: *mut c_void,
	left_len: c_int,
	left: *const c_void,
	right_len: c_int,
	right: *const c_void,
) -> c_int {
	let Some(data) = (unsafe { data.cast::<CollationData>().as_ref() }) else {
		return 0;
	};

	let left = collation_text(left, left_len);
	let right = collation_text(right, right_len);
	match catch_unwind(AssertUnwindSafe(|| (data.compare)(&left, &right))) {
		Ok(Ordering::Less) => -1,
		Ok(Ordering::Equal) => 0,
		Ok(Ordering::Greater) => 1,
		// A comparator must return something; equal keeps the sort stable.
		Err(_) => 0,
	}
}

unsafe extern "C" fn destroy_collation_data(data: *mut c_void) {
	if !data.is_null() {
		drop(unsafe { Box::from_raw(data.cast::<CollationData>()) });
	}
}

unsafe extern "C" fn authorizer_trampoline(
	data: *mut c_void,
	action: c_int,
	detail1: *const c_char,
	detail2: *const c_char,
	database: *const c_char,
	trigger: *const c_char,
) -> c_int {
	let Some(data) = (unsafe { data.cast::<AuthorizerData>().as_ref() }) else {
		return crate::SQLITE_DENY;
	};

	let context = AuthContext {
		action_code: action,
		detail1: optional_str(detail1),
		detail2: optional_str(detail2),
		database: optional_str(database),
		trigger: optional_str(trigger),
	};

	match catch_unwind(AssertUnwindSafe(|| (data.decide)(&context))) {
		Ok(Authorization::Allow) => crate::SQLITE_OK,
		Ok(Authorization::Deny) => crate::SQLITE_DENY,
		Ok(Authorization::Ignore) => crate::SQLITE_IGNORE,
		// Fail closed when the host callable panics.
		Err(_) => crate::SQLITE_DENY,
	}
}

unsafe extern "C" fn progress_trampoline(data: *mut c_void) -> c_int {
	let Some(data) = (unsafe { data.cast::<ProgressData>().as_ref() }) else {
		return 0;
	};
	match catch_unwind(AssertUnwindSafe(|| (data.callback)())) {
		Ok(interrupt) => c_int::from(interrupt),
		Err(_) => 1,
	}
}

unsafe extern "C" fn commit_hook_trampoline(data: *mut c_void) -> c_int {
	let Some(data) = (unsafe { data.cast::<CommitHookData>().as_ref() }) else {
		return 0;
	};
	match catch_unwind(AssertUnwindSafe(|| (data.callback)())) {
		Ok(abort) => c_int::from(abort),
		// A panicking commit hook turns the commit into a rollback.
		Err(_) => 1,
	}
}

unsafe extern "C" fn rollback_hook_trampoline(data: *mut c_void) {
	let Some(data) = (unsafe { data.cast::<RollbackHookData>().as_ref() }) else {
		return;
	};
	let _ = catch_unwind(AssertUnwindSafe(|| (data.callback)()));
}

unsafe extern "C" fn trace_trampoline(
	kind: c_int,
	data: *mut c_void,
	p: *mut c_void,
	x: *mut c_void,
) -> c_int {
	let Some(data) = (unsafe { data.cast::<TraceData>().as_ref() }) else {
		return 0;
	};

	match kind {
		crate::SQLITE_TRACE_STMT => {
			let sql = optional_str(x.cast::<c_char>().cast_const()).unwrap_or("");
			let event = TraceEvent::Statement { sql };
			let _ = catch_unwind(AssertUnwindSafe(|| (data.callback)(&event)));
		}
		crate::SQLITE_TRACE_PROFILE => {
			let sql_ptr = unsafe { ffi::sqlite3_sql(p.cast::<ffi::Sqlite3Stmt>()) };
			let sql = optional_str(sql_ptr).unwrap_or("");
			let nanos = if x.is_null() { 0 } else { unsafe { *x.cast::<i64>() } };
			let event = TraceEvent::Profile {
				sql,
				elapsed: Duration::from_nanos(u64::try_from(nanos).unwrap_or_default()),
			};
			let _ = catch_unwind(AssertUnwindSafe(|| (data.callback)(&event)));
		}
		crate::SQLITE_TRACE_ROW => {
			let _ = catch_unwind(AssertUnwindSafe(|| (data.callback)(&TraceEvent::Row)));
		}
		crate::SQLITE_TRACE_CLOSE => {
			let _ = catch_unwind(AssertUnwindSafe(|| (data.callback)(&TraceEvent::Close)));
		}
		_ => {}
	}

	0
}

impl Connection {
	/// Register (or overwrite) a collating sequence usable from SQL.
	pub fn create_collation<F>(&self, name: &str, compare: F) -> Result<()>
	where
		F: Fn(&str, &str) -> Ordering + Send + Sync + 'static,
	{
		let _guard = self.enter()?;
		let name_c = CString::new(name)
			.map_err(|_| Error::Configuration("collation name contains a NUL byte".to_string()))?;

		let data = Box::into_raw(Box::new(CollationData { compare: Box::new(compare) }));
		let rc = unsafe {
			ffi::sqlite3_create_collation_v2(
				self.raw(),
				name_c.as_ptr(),
				crate::SQLITE_UTF8_ENCODING,
				data.cast(),
				Some(collation_trampoline),
				Some(destroy_collation_data),
			)
		};
		if rc != crate::SQLITE_OK {
			// The engine does not invoke the destructor when collation
			// registration fails.
			drop(unsafe { Box::from_raw(data) });
			return Err(error::translate(self.raw(), rc));
		}

		debug!(name, "registered collation");
		Ok(())
	}

	pub fn remove_collation(&self, name: &str) -> Result<()> {
		let _guard = self.enter()?;
		let name_c = CString::new(name)
			.map_err(|_| Error::Configuration("collation name contains a NUL byte".to_string()))?;

		let rc = unsafe {
			ffi::sqlite3_create_collation_v2(
				self.raw(),
				name_c.as_ptr(),
				crate::SQLITE_UTF8_ENCODING,
				std::ptr::null_mut(),
				None,
				None,
			)
		};
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}
		Ok(())
	}

	/// Install the authorizer consulted for each operation the engine is
	/// about to perform during statement preparation.
	pub fn set_authorizer<F>(&self, decide: F) -> Result<()>
	where
		F: Fn(&AuthContext<'_>) -> Authorization + Send + Sync + 'static,
	{
		let mut guard = self.enter()?;
		let data = Box::new(AuthorizerData { decide: Box::new(decide) });
		let rc = unsafe {
			ffi::sqlite3_set_authorizer(
				self.raw(),
				Some(authorizer_trampoline),
				std::ptr::from_ref::<AuthorizerData>(data.as_ref()).cast_mut().cast(),
			)
		};
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}
		guard.state.authorizer = Some(data);
		Ok(())
	}

	pub fn clear_authorizer(&self) -> Result<()> {
		let mut guard = self.enter()?;
		let rc =
			unsafe { ffi::sqlite3_set_authorizer(self.raw(), None, std::ptr::null_mut()) };
		guard.state.authorizer = None;
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}
		Ok(())
	}

	/// Install a handler invoked every `steps` virtual-machine operations;
	/// returning `true` interrupts the in-flight call.
	pub fn set_progress_handler<F>(&self, steps: u32, callback: F) -> Result<()>
	where
		F: Fn() -> bool + Send + Sync + 'static,
	{
		if steps == 0 {
			return Err(Error::Range("progress interval must be at least 1".to_string()));
		}

		let mut guard = self.enter()?;
		let data = Box::new(ProgressData { callback: Box::new(callback) });
		unsafe {
			ffi::sqlite3_progress_handler(
				self.raw(),
				c_int::try_from(steps).unwrap_or(c_int::MAX),
				Some(progress_trampoline),
				std::ptr::from_ref::<ProgressData>(data.as_ref()).cast_mut().cast(),
			);
		}
		guard.state.progress = Some(data);
		Ok(())
	}

	pub fn clear_progress_handler(&self) -> Result<()> {
		let mut guard = self.enter()?;
		unsafe { ffi::sqlite3_progress_handler(self.raw(), 0, None, std::ptr::null_mut()) };
		guard.state.progress = None;
		Ok(())
	}

	/// Install a hook consulted before each commit; returning `true` turns
	/// the commit into a rollback.
	pub fn set_commit_hook<F>(&self, callback: F) -> Result<()>
	where
		F: Fn() -> bool + Send + Sync + 'static,
	{
		let mut guard = self.enter()?;
		let data = Box::new(CommitHookData { callback: Box::new(callback) });
		unsafe {
			ffi::sqlite3_commit_hook(
				self.raw(),
				Some(commit_hook_trampoline),
				std::ptr::from_ref::<CommitHookData>(data.as_ref()).cast_mut().cast(),
			);
		}
		guard.state.commit_hook = Some(data);
		Ok(())
	}

	pub fn clear_commit_hook(&self) -> Result<()> {
		let mut guard = self.enter()?;
		unsafe { ffi::sqlite3_commit_hook(self.raw(), None, std::ptr::null_mut()) };
		guard.state.commit_hook = None;
		Ok(())
	}

	/// Install a hook notified after each rollback.
	pub fn set_rollback_hook<F>(&self, callback: F) -> Result<()>
	where
		F: Fn() + Send + Sync + 'static,
	{
		let mut guard = self.enter()?;
		let data = Box::new(RollbackHookData { callback: Box::new(callback) });
		unsafe {
			ffi::sqlite3_rollback_hook(
				self.raw(),
				Some(rollback_hook_trampoline),
				std::ptr::from_ref::<RollbackHookData>(data.as_ref()).cast_mut().cast(),
			);
		}
		guard.state.rollback_hook = Some(data);
		Ok(())
	}

	pub fn clear_rollback_hook(&self) -> Result<()> {
		let mut guard = self.enter()?;
		unsafe { ffi::sqlite3_rollback_hook(self.raw(), None, std::ptr::null_mut()) };
		guard.state.rollback_hook = None;
		Ok(())
	}

	/// Install a trace/profile observer for the selected events.
	pub fn set_trace_handler<F>(&self, events: TraceEvents, callback: F) -> Result<()>
	where
		F: Fn(&TraceEvent<'_>) + Send + Sync + 'static,
	{
		let mask = events.mask();
		if mask == 0 {
			return Err(Error::Range("no trace events selected".to_string()));
		}

		let mut guard = self.enter()?;
		let data = Box::new(TraceData { callback: Box::new(callback) });
		let rc = unsafe {
			ffi::sqlite3_trace_v2(
				self.raw(),
				mask,
				Some(trace_trampoline),
				std::ptr::from_ref::<TraceData>(data.as_ref()).cast_mut().cast(),
			)
		};
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}
		guard.state.trace = Some(data);
		Ok(())
	}

	pub fn clear_trace_handler(&self) -> Result<()> {
		let mut guard = self.enter()?;
		let rc = unsafe { ffi::sqlite3_trace_v2(self.raw(), 0, None, std::ptr::null_mut()) };
		// The engine stops calling the old context before trace_v2 returns,
		// so the box can be dropped now.
		guard.state.trace = None;
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}
		Ok(())
	}
}
