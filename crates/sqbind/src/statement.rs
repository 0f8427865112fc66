use core::ffi::c_int;
use std::ffi::{CStr, CString};
use std::ptr::NonNull;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::value::Value;
use crate::{busy, error, ffi, value};

/// Execution state of a prepared statement.
///
/// `Ready --bind--> Bound --step--> Row | Done`, `Row --step--> Row | Done`,
/// any state `--reset--> Ready`. Finalize is terminal and consumes the
/// statement, so a finalized handle cannot be misused afterwards.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum StmtState {
	Ready,
	Bound,
	Row,
	Done,
	Finalized,
}

/// One prepared statement, exclusively owned by one connection.
pub struct Statement<'conn> {
	conn: &'conn Connection,
	stmt: NonNull<ffi::Sqlite3Stmt>,
	state: StmtState,
	cache_key: Option<String>,
}

impl std::fmt::Debug for Statement<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Statement")
			.field("state", &self.state)
			.field("cache_key", &self.cache_key)
			.finish_non_exhaustive()
	}
}

impl<'conn> Statement<'conn> {
	pub(crate) fn new(
		conn: &'conn Connection,
		stmt: NonNull<ffi::Sqlite3Stmt>,
		cache_key: Option<String>,
	) -> Self {
		Self { conn, stmt, state: StmtState::Ready, cache_key }
	}

	pub fn sql(&self) -> Result<Option<String>> {
		let _guard = self.conn.enter()?;
		let ptr = unsafe { ffi::sqlite3_sql(self.stmt.as_ptr()) };
		if ptr.is_null() {
			Ok(None)
		} else {
			Ok(Some(unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }))
		}
	}

	pub fn is_readonly(&self) -> Result<bool> {
		let _guard = self.conn.enter()?;
		Ok(unsafe { ffi::sqlite3_stmt_readonly(self.stmt.as_ptr()) } != 0)
	}

	pub fn parameter_count(&self) -> Result<usize> {
		let _guard = self.conn.enter()?;
		let count = unsafe { ffi::sqlite3_bind_parameter_count(self.stmt.as_ptr()) };
		Ok(usize::try_from(count).unwrap_or_default())
	}

	/// Name of the 1-based parameter, including its `:`/`@`/`$` prefix.
	/// Nameless (`?`) parameters yield `None`.
	pub fn parameter_name(&self, index: usize) -> Result<Option<String>> {
		let _guard = self.conn.enter()?;
		let index = c_int::try_from(index)
			.map_err(|_| Error::Range(format!("parameter index {index} does not fit the engine")))?;
		let ptr = unsafe { ffi::sqlite3_bind_parameter_name(self.stmt.as_ptr(), index) };
		if ptr.is_null() {
			Ok(None)
		} else {
			Ok(Some(unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }))
		}
	}

	fn require_bindable(&self) -> Result<()> {
		match self.state {
			StmtState::Ready | StmtState::Bound => Ok(()),
			_ => Err(Error::State("rebinding requires a reset first".to_string())),
		}
	}

	/// Bind one value at a 1-based parameter index.
	pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
		self.require_bindable()?;
		let value = value.into();

		let _guard = self.conn.enter()?;
		let raw_index = c_int::try_from(index)
			.map_err(|_| Error::Range(format!("parameter index {index} does not fit the engine")))?;
		let rc = value::bind_value_raw(self.stmt.as_ptr(), raw_index, &value);

		if rc != crate::SQLITE_OK {
			if error::classify(rc) == error::ErrorClass::Range {
				return Err(Error::Range(format!(
					"parameter index {index} is out of range for this statement"
				)));
			}
			return Err(error::translate(self.conn.raw(), rc));
		}

		self.state = StmtState::Bound;
		Ok(())
	}

	/// Bind one value to a named parameter; the `:`/`@`/`$` prefix may be
	/// omitted.
	pub fn bind_named(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
		let index = self
			.named_parameter_index(name)?
			.ok_or_else(|| Error::Range(format!("unknown named parameter: {name}")))?;
		self.bind(index, value)
	}

	/// Bind every positional parameter. The value count must match the
	/// declared parameter count exactly; a mismatch fails before any step.
	pub fn bind_all(&mut self, values: &[Value]) -> Result<()> {
		self.require_bindable()?;
		let expected = self.parameter_count()?;
		if values.len() != expected {
			return Err(Error::Range(format!(
				"statement declares {expected} parameters, got {} values",
				values.len()
			)));
		}

		for (offset, value) in values.iter().enumerate() {
			self.bind(offset + 1, value.clone())?;
		}
		Ok(())
	}

	/// Bind every named parameter. Every name declared in the SQL text must
	/// be supplied, and every supplied name must exist; either failure is
	/// reported before any value is bound.
	pub fn bind_named_all(&mut self, values: &[(&str, Value)]) -> Result<()> {
		self.require_bindable()?;

		let count = self.parameter_count()?;
		let mut declared = Vec::with_capacity(count);
		for index in 1..=count {
			let name = self.parameter_name(index)?.ok_or_else(|| {
				Error::Range(format!("parameter {index} has no name and cannot be bound by name"))
			})?;
			declared.push((index, name));
		}

		for (index, name) in &declared {
			let bare = strip_parameter_prefix(name);
			if !values.iter().any(|(supplied, _)| strip_parameter_prefix(supplied) == bare) {
				return Err(Error::Range(format!("missing value for parameter {index} ({name})")));
			}
		}
		for (supplied, _) in values {
			let bare = strip_parameter_prefix(supplied);
			if !declared.iter().any(|(_, name)| strip_parameter_prefix(name) == bare) {
				return Err(Error::Range(format!("unknown named parameter: {supplied}")));
			}
		}

		for (supplied, value) in values {
			let bare = strip_parameter_prefix(supplied);
			if let Some((index, _)) =
				declared.iter().find(|(_, name)| strip_parameter_prefix(name) == bare)
			{
				self.bind(*index, value.clone())?;
			}
		}

		Ok(())
	}

	fn named_parameter_index(&self, name: &str) -> Result<Option<usize>> {
		let _guard = self.conn.enter()?;
		for candidate in binding_name_candidates(name) {
			let candidate = CString::new(candidate)
				.map_err(|_| Error::Type("parameter name contains a NUL byte".to_string()))?;
			let index = unsafe {
				ffi::sqlite3_bind_parameter_index(self.stmt.as_ptr(), candidate.as_ptr())
			};
			if index > 0 {
				return Ok(Some(usize::try_from(index).unwrap_or_default()));
			}
		}
		Ok(None)
	}

	/// Advance execution by one row. `Ok(true)` leaves the statement on a
	/// row; `Ok(false)` means execution completed. Busy/locked conditions go
	/// through the connection's busy policy before surfacing.
	pub fn step(&mut self) -> Result<bool> {
		match self.state {
			StmtState::Done => {
				return Err(Error::State(
					"statement already ran to completion; reset it before stepping again"
						.to_string(),
				));
			}
			StmtState::Finalized => {
				return Err(Error::State("statement has been finalized".to_string()));
			}
			_ => {}
		}

		let guard = self.conn.enter()?;
		let policy = guard.state.busy_policy.clone();
		let stmt = self.stmt;
		let outcome = busy::retry(&policy, || unsafe { ffi::sqlite3_step(stmt.as_ptr()) });

		let result = match outcome.rc {
			crate::SQLITE_ROW => {
				self.state = StmtState::Row;
				Ok(true)
			}
			crate::SQLITE_DONE => {
				self.state = StmtState::Done;
				Ok(false)
			}
			rc if error::is_busy_code(rc) => Err(self.conn.busy_exhausted(&outcome)),
			rc => {
				self.state = StmtState::Done;
				Err(self.conn.engine_error(rc))
			}
		};
		drop(guard);
		result
	}

	pub fn column_count(&self) -> Result<usize> {
		let _guard = self.conn.enter()?;
		let count = unsafe { ffi::sqlite3_column_count(self.stmt.as_ptr()) };
		Ok(usize::try_from(count).unwrap_or_default())
	}

	pub fn column_name(&self, index: usize) -> Result<Option<String>> {
		let _guard = self.conn.enter()?;
		let index = c_int::try_from(index)
			.map_err(|_| Error::Range(format!("column index {index} does not fit the engine")))?;
		let ptr = unsafe { ffi::sqlite3_column_name(self.stmt.as_ptr(), index) };
		if ptr.is_null() {
			Ok(None)
		} else {
			Ok(Some(unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }))
		}
	}

	/// Declared column type from the table definition, when there is one.
	pub fn column_decltype(&self, index: usize) -> Result<Option<String>> {
		let _guard = self.conn.enter()?;
		let index = c_int::try_from(index)
			.map_err(|_| Error::Range(format!("column index {index} does not fit the engine")))?;
		let ptr = unsafe { ffi::sqlite3_column_decltype(self.stmt.as_ptr(), index) };
		if ptr.is_null() {
			Ok(None)
		} else {
			Ok(Some(unsafe { CStr::from_ptr(ptr).to_string_lossy().into_owned() }))
		}
	}

	pub fn column_index(&self, name: &str) -> Result<Option<usize>> {
		for index in 0..self.column_count()? {
			if self.column_name(index)?.is_some_and(|column| column == name) {
				return Ok(Some(index));
			}
		}
		Ok(None)
	}

	fn require_row(&self) -> Result<()> {
		if self.state == StmtState::Row {
			Ok(())
		} else {
			Err(Error::State(
				"no current row; column access is only legal after step returns a row".to_string(),
			))
		}
	}

	/// Read one column of the current row by 0-based index.
	pub fn column_value(&self, index: usize) -> Result<Value> {
		self.require_row()?;
		if index >= self.column_count()? {
			return Err(Error::Range(format!("column index {index} is out of range")));
		}

		let _guard = self.conn.enter()?;
		let index = c_int::try_from(index)
			.map_err(|_| Error::Range(format!("column index {index} does not fit the engine")))?;
		value::column_value_raw(self.stmt.as_ptr(), index)
	}

	pub fn column_value_by_name(&self, name: &str) -> Result<Value> {
		let index = self
			.column_index(name)?
			.ok_or_else(|| Error::Range(format!("no result column named {name}")))?;
		self.column_value(index)
	}

	/// All columns of the current row.
	pub fn row_values(&self) -> Result<Vec<Value>> {
		self.require_row()?;
		let count = self.column_count()?;
		let mut row = Vec::with_capacity(count);
		for index in 0..count {
			row.push(self.column_value(index)?);
		}
		Ok(row)
	}

	/// Return to Ready: rewinds execution and clears all bindings.
	pub fn reset(&mut self) -> Result<()> {
		let _guard = self.conn.enter()?;
		// reset reports the prior step's failure, which the caller already
		// saw; only a clear_bindings failure is new information.
		let _ = unsafe { ffi::sqlite3_reset(self.stmt.as_ptr()) };
		let rc = unsafe { ffi::sqlite3_clear_bindings(self.stmt.as_ptr()) };

		self.state = StmtState::Ready;
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.conn.raw(), rc));
		}
		Ok(())
	}

	/// Destroy the statement handle now. Dropping a statement obtained from
	/// `prepare_cached` would instead return the handle to the pool.
	pub fn finalize(mut self) -> Result<()> {
		self.state = StmtState::Finalized;
		self.cache_key = None;
		let _guard = self.conn.enter()?;
		let rc = unsafe { ffi::sqlite3_finalize(self.stmt.as_ptr()) };
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.conn.raw(), rc));
		}
		Ok(())
	}
}

impl Drop for Statement<'_> {
	fn drop(&mut self) {
		if self.state == StmtState::Finalized {
			return;
		}

		match self.conn.enter() {
			Ok(mut guard) => {
				if let Some(sql) = self.cache_key.take() {
					let _ = unsafe { ffi::sqlite3_reset(self.stmt.as_ptr()) };
					let _ = unsafe { ffi::sqlite3_clear_bindings(self.stmt.as_ptr()) };
					guard.state.cache.put(sql, self.stmt);
				} else {
					let _ = unsafe { ffi::sqlite3_finalize(self.stmt.as_ptr()) };
				}
			}
			// Same thread is inside an engine call on this connection;
			// finalizing an unrelated statement is still permitted.
			Err(_) => {
				let _ = unsafe { ffi::sqlite3_finalize(self.stmt.as_ptr()) };
			}
		}
	}
}

fn strip_parameter_prefix(name: &str) -> &str {
	name.strip_prefix(|c: char| c == ':' || c == '@' || c == '$').unwrap_or(name)
}

fn binding_name_candidates(name: &str) -> Vec<String> {
	if name.starts_with(':')
		|| name.starts_with('@')
		|| name.starts_with('$')
		|| name.starts_with('?')
	{
		vec![name.to_string()]
	} else {
		vec![format!(":{name}"), format!("@{name}"), format!("${name}")]
	}
}
