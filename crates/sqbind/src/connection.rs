use core::ffi::c_int;
use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::busy::{BusyPolicy, RetryOutcome};
use crate::cache::StatementCache;
use crate::error::{CallbackErrorSlot, Error, Result};
use crate::hooks::{AuthorizerData, CommitHookData, ProgressData, RollbackHookData, TraceData};
use crate::statement::Statement;
use crate::value::Value;
use crate::{busy, error, ffi};

thread_local! {
	// Connections this thread is currently inside an engine call on, keyed by
	// handle address. Present entry == an engine call on this thread's stack,
	// which makes any further entry a re-entrant callback.
	static ACTIVE_ENGINE_CALLS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

fn ensure_engine_version() -> Result<()> {
	static CHECK: OnceLock<std::result::Result<(), String>> = OnceLock::new();
	CHECK
		.get_or_init(|| {
			let version = sqbind_sqlite_ffi::sqlite_lib_version_number();
			if version < sqbind_sqlite_ffi::MIN_ENGINE_VERSION_NUMBER {
				Err(format!(
					"engine library version {version} is below the supported floor {}",
					sqbind_sqlite_ffi::MIN_ENGINE_VERSION_NUMBER
				))
			} else {
				Ok(())
			}
		})
		.clone()
		.map_err(Error::Configuration)
}

pub(crate) fn quote_identifier(name: &str) -> String {
	format!("\"{}\"", name.replace('"', "\"\""))
}

/// How a transaction acquires its locks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionMode {
	Deferred,
	Immediate,
	Exclusive,
}

impl TransactionMode {
	const fn begin_sql(self) -> &'static str {
		match self {
			Self::Deferred => "BEGIN DEFERRED",
			Self::Immediate => "BEGIN IMMEDIATE",
			Self::Exclusive => "BEGIN EXCLUSIVE",
		}
	}
}

/// Structured option set for opening a connection.
#[derive(Debug, Clone)]
pub struct OpenOptions {
	read_only: bool,
	create: bool,
	in_memory: bool,
	shared_cache: bool,
	uri: bool,
	statement_cache_capacity: usize,
}

impl Default for OpenOptions {
	fn default() -> Self {
		Self {
			read_only: false,
			create: true,
			in_memory: false,
			shared_cache: false,
			uri: false,
			statement_cache_capacity: 64,
		}
	}
}

impl OpenOptions {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Open without write access. Clears create-if-missing.
	#[must_use]
	pub const fn read_only(mut self, read_only: bool) -> Self {
		self.read_only = read_only;
		if read_only {
			self.create = false;
		}
		self
	}

	#[must_use]
	pub const fn create_if_missing(mut self, create: bool) -> Self {
		self.create = create;
		self
	}

	#[must_use]
	pub const fn in_memory(mut self, in_memory: bool) -> Self {
		self.in_memory = in_memory;
		self
	}

	#[must_use]
	pub const fn shared_cache(mut self, shared_cache: bool) -> Self {
		self.shared_cache = shared_cache;
		self
	}

	/// Interpret the path as a `file:` URI.
	#[must_use]
	pub const fn uri(mut self, uri: bool) -> Self {
		self.uri = uri;
		self
	}

	/// Prepared statements reused through `prepare_cached` are pooled up to
	/// this many entries; zero disables the pool.
	#[must_use]
	pub const fn statement_cache_capacity(mut self, capacity: usize) -> Self {
		self.statement_cache_capacity = capacity;
		self
	}

	fn flags(&self) -> Result<c_int> {
		if self.read_only && self.create {
			return Err(Error::Configuration(
				"create-if-missing conflicts with read-only".to_string(),
			));
		}

		let mut flags =
			if self.read_only { crate::SQLITE_OPEN_READONLY } else { crate::SQLITE_OPEN_READWRITE };
		if self.create {
			flags |= crate::SQLITE_OPEN_CREATE;
		}
		if self.in_memory {
			flags |= crate::SQLITE_OPEN_MEMORY;
		}
		if self.shared_cache {
			flags |= crate::SQLITE_OPEN_SHAREDCACHE;
		}
		if self.uri {
			flags |= crate::SQLITE_OPEN_URI;
		}
		Ok(flags)
	}
}

pub(crate) struct ConnState {
	pub(crate) transaction_depth: u32,
	pub(crate) busy_policy: BusyPolicy,
	pub(crate) cache: StatementCache,
	pub(crate) authorizer: Option<Box<AuthorizerData>>,
	pub(crate) progress: Option<Box<ProgressData>>,
	pub(crate) commit_hook: Option<Box<CommitHookData>>,
	pub(crate) rollback_hook: Option<Box<RollbackHookData>>,
	pub(crate) trace: Option<Box<TraceData>>,
}

/// Exclusive access to one connection's handle for the duration of one engine
/// call (or a short sequence of them). At most one guard per connection
/// exists at a time; a second acquisition from the same thread means the
/// caller sits inside one of this connection's own callbacks.
pub(crate) struct CallGuard<'conn> {
	pub(crate) state: MutexGuard<'conn, ConnState>,
	key: usize,
}

impl Drop for CallGuard<'_> {
	fn drop(&mut self) {
		ACTIVE_ENGINE_CALLS.with(|calls| {
			calls.borrow_mut().remove(&self.key);
		});
	}
}

/// One open database handle. All engine access through this connection is
/// serialized internally, so a `Connection` can be shared across threads;
/// distinct connections are fully independent.
pub struct Connection {
	db: NonNull<ffi::Sqlite3>,
	state: Mutex<ConnState>,
	error_slot: Arc<CallbackErrorSlot>,
	closed: AtomicBool,
}

// The raw handle is only touched while the state mutex is held, and the
// engine is built threadsafe.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl std::fmt::Debug for Connection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Connection")
			.field("closed", &self.closed.load(std::sync::atomic::Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

impl Connection {
	pub fn open(path: &str, options: &OpenOptions) -> Result<Self> {
		ensure_engine_version()?;
		let flags = options.flags()?;
		let path_c = CString::new(path)
			.map_err(|_| Error::Configuration("database path contains a NUL byte".to_string()))?;

		let mut db: *mut ffi::Sqlite3 = std::ptr::null_mut();
		let rc =
			unsafe { ffi::sqlite3_open_v2(path_c.as_ptr(), &raw mut db, flags, std::ptr::null()) };
		if rc != crate::SQLITE_OK {
			let open_error = error::translate(db, rc);
			if !db.is_null() {
				let _ = unsafe { ffi::sqlite3_close_v2(db) };
			}
			return Err(open_error);
		}

		let db = NonNull::new(db).ok_or_else(|| {
			Error::Configuration("engine returned a null connection handle".to_string())
		})?;

		let _ = unsafe { ffi::sqlite3_extended_result_codes(db.as_ptr(), 1) };
		// The engine-side busy handler stays off; retrying is this binding's
		// job and the two must not compete.
		let _ = unsafe { ffi::sqlite3_busy_timeout(db.as_ptr(), 0) };

		debug!(path, flags, "opened database connection");

		Ok(Self {
			db,
			state: Mutex::new(ConnState {
				transaction_depth: 0,
				busy_policy: BusyPolicy::default(),
				cache: StatementCache::new(options.statement_cache_capacity),
				authorizer: None,
				progress: None,
				commit_hook: None,
				rollback_hook: None,
				trace: None,
			}),
			error_slot: Arc::new(CallbackErrorSlot::default()),
			closed: AtomicBool::new(false),
		})
	}

	pub fn open_in_memory() -> Result<Self> {
		Self::open(":memory:", &OpenOptions::default().in_memory(true))
	}

	pub(crate) fn enter(&self) -> Result<CallGuard<'_>> {
		let key = self.db.as_ptr() as usize;
		let entered = ACTIVE_ENGINE_CALLS.with(|calls| calls.borrow_mut().insert(key));
		if !entered {
			return Err(Error::State(
				"re-entrant use of a connection from within its own callback".to_string(),
			));
		}
		let guard = CallGuard { state: self.state.lock(), key };
		// A callback error can be left behind by a call whose result the
		// caller discarded; it must not be attributed to this call.
		let _ = self.error_slot.take();
		Ok(guard)
	}

	pub(crate) const fn raw(&self) -> *mut ffi::Sqlite3 {
		self.db.as_ptr()
	}

	pub(crate) fn error_slot(&self) -> Arc<CallbackErrorSlot> {
		Arc::clone(&self.error_slot)
	}

	/// Error for a failed engine call: an error raised by one of this
	/// connection's callbacks during that call takes precedence over the
	/// engine's generic report of it.
	pub(crate) fn engine_error(&self, rc: c_int) -> Error {
		self.error_slot.take().unwrap_or_else(|| error::translate(self.db.as_ptr(), rc))
	}

	pub(crate) fn busy_exhausted(&self, outcome: &RetryOutcome) -> Error {
		match error::translate(self.db.as_ptr(), outcome.rc) {
			Error::Busy { message, .. } => {
				Error::Busy { message, attempts: outcome.attempts, waited: outcome.waited }
			}
			other => other,
		}
	}

	pub(crate) fn prepare_locked(
		&self,
		state: &ConnState,
		sql: &str,
	) -> Result<Option<NonNull<ffi::Sqlite3Stmt>>> {
		let sql_c = CString::new(sql)
			.map_err(|_| Error::Type("SQL text contains a NUL byte".to_string()))?;

		// Preparation takes a shared schema lock, so it can report busy just
		// like a step and goes through the same policy.
		let mut stmt: *mut ffi::Sqlite3Stmt = std::ptr::null_mut();
		let outcome = busy::retry(&state.busy_policy, || unsafe {
			ffi::sqlite3_prepare_v3(
				self.db.as_ptr(),
				sql_c.as_ptr(),
				-1,
				0,
				&raw mut stmt,
				std::ptr::null_mut(),
			)
		});
		if outcome.rc != crate::SQLITE_OK {
			if error::is_busy_code(outcome.rc) {
				return Err(self.busy_exhausted(&outcome));
			}
			return Err(self.engine_error(outcome.rc));
		}

		Ok(NonNull::new(stmt))
	}

	fn step_to_completion(
		&self,
		state: &ConnState,
		stmt: NonNull<ffi::Sqlite3Stmt>,
	) -> Result<()> {
		let policy = state.busy_policy.clone();
		let mut outcome =
			busy::retry(&policy, || unsafe { ffi::sqlite3_step(stmt.as_ptr()) });
		while outcome.rc == crate::SQLITE_ROW {
			outcome = busy::retry(&policy, || unsafe { ffi::sqlite3_step(stmt.as_ptr()) });
		}

		let rc = outcome.rc;
		let _ = unsafe { ffi::sqlite3_finalize(stmt.as_ptr()) };
		if rc == crate::SQLITE_DONE {
			Ok(())
		} else if error::is_busy_code(rc) {
			Err(self.busy_exhausted(&outcome))
		} else {
			Err(self.engine_error(rc))
		}
	}

	pub(crate) fn exec_locked(&self, state: &mut ConnState, sql: &str) -> Result<()> {
		let Some(stmt) = self.prepare_locked(state, sql)? else {
			return Ok(());
		};
		self.step_to_completion(state, stmt)
	}

	/// Prepare, step to completion and finalize one transient statement.
	pub fn execute(&self, sql: &str) -> Result<()> {
		let mut guard = self.enter()?;
		self.exec_locked(&mut guard.state, sql)
	}

	/// Run a script of semicolon-separated statements, stopping at the first
	/// failure.
	pub fn execute_batch(&self, sql: &str) -> Result<()> {
		let guard = self.enter()?;
		let sql_c = CString::new(sql)
			.map_err(|_| Error::Type("SQL text contains a NUL byte".to_string()))?;

		let mut rest = sql_c.as_ptr();
		while unsafe { *rest } != 0 {
			let mut stmt: *mut ffi::Sqlite3Stmt = std::ptr::null_mut();
			let mut tail = std::ptr::null();
			let outcome = busy::retry(&guard.state.busy_policy, || unsafe {
				ffi::sqlite3_prepare_v3(self.db.as_ptr(), rest, -1, 0, &raw mut stmt, &raw mut tail)
			});
			if outcome.rc != crate::SQLITE_OK {
				if error::is_busy_code(outcome.rc) {
					return Err(self.busy_exhausted(&outcome));
				}
				return Err(self.engine_error(outcome.rc));
			}
			rest = tail;

			let Some(stmt) = NonNull::new(stmt) else {
				continue;
			};
			self.step_to_completion(&guard.state, stmt)?;
		}

		Ok(())
	}

	pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
		let guard = self.enter()?;
		let stmt = self
			.prepare_locked(&guard.state, sql)?
			.ok_or_else(|| Error::State("SQL did not produce a statement".to_string()))?;
		drop(guard);
		Ok(Statement::new(self, stmt, None))
	}

	/// Like `prepare`, but reuses a pooled handle for previously seen SQL
	/// text. The handle returns to the pool when the statement is dropped.
	pub fn prepare_cached(&self, sql: &str) -> Result<Statement<'_>> {
		let mut guard = self.enter()?;
		if let Some(stmt) = guard.state.cache.take(sql) {
			drop(guard);
			return Ok(Statement::new(self, stmt, Some(sql.to_string())));
		}

		let stmt = self
			.prepare_locked(&guard.state, sql)?
			.ok_or_else(|| Error::State("SQL did not produce a statement".to_string()))?;
		drop(guard);
		Ok(Statement::new(self, stmt, Some(sql.to_string())))
	}

	pub fn query_all(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
		let mut stmt = self.prepare(sql)?;
		let mut rows = Vec::new();
		while stmt.step()? {
			rows.push(stmt.row_values()?);
		}
		Ok(rows)
	}

	pub fn query_row(&self, sql: &str) -> Result<Option<Vec<Value>>> {
		let mut stmt = self.prepare(sql)?;
		if !stmt.step()? {
			return Ok(None);
		}

		let row = stmt.row_values()?;
		if stmt.step()? {
			return Err(Error::State("query returned more than one row".to_string()));
		}

		Ok(Some(row))
	}

	pub fn begin(&self, mode: TransactionMode) -> Result<()> {
		let mut guard = self.enter()?;
		if guard.state.transaction_depth > 0 {
			return Err(Error::State(
				"a transaction is already active; use a savepoint to nest".to_string(),
			));
		}
		self.exec_locked(&mut guard.state, mode.begin_sql())?;
		guard.state.transaction_depth = 1;
		Ok(())
	}

	pub fn commit(&self) -> Result<()> {
		let mut guard = self.enter()?;
		if guard.state.transaction_depth == 0 {
			return Err(Error::State("no active transaction to commit".to_string()));
		}
		let result = self.exec_locked(&mut guard.state, "COMMIT");
		// A commit hook can turn the commit into a rollback; the engine is
		// then back in autocommit even though the call failed.
		if result.is_ok() || unsafe { ffi::sqlite3_get_autocommit(self.db.as_ptr()) } != 0 {
			guard.state.transaction_depth = 0;
		}
		result
	}

	pub fn rollback(&self) -> Result<()> {
		let mut guard = self.enter()?;
		if guard.state.transaction_depth == 0 {
			return Err(Error::State("no active transaction to roll back".to_string()));
		}
		let result = self.exec_locked(&mut guard.state, "ROLLBACK");
		if result.is_ok() || unsafe { ffi::sqlite3_get_autocommit(self.db.as_ptr()) } != 0 {
			guard.state.transaction_depth = 0;
		}
		result
	}

	/// Savepoints emulate transaction nesting; each one deepens the locally
	/// tracked depth.
	pub fn savepoint(&self, name: &str) -> Result<()> {
		let mut guard = self.enter()?;
		let sql = format!("SAVEPOINT {}", quote_identifier(name));
		self.exec_locked(&mut guard.state, &sql)?;
		guard.state.transaction_depth += 1;
		Ok(())
	}

	pub fn release(&self, name: &str) -> Result<()> {
		let mut guard = self.enter()?;
		if guard.state.transaction_depth == 0 {
			return Err(Error::State("no active savepoint to release".to_string()));
		}
		let sql = format!("RELEASE SAVEPOINT {}", quote_identifier(name));
		self.exec_locked(&mut guard.state, &sql)?;
		guard.state.transaction_depth -= 1;
		Ok(())
	}

	/// Roll back to a savepoint without releasing it; the depth is unchanged.
	pub fn rollback_to(&self, name: &str) -> Result<()> {
		let mut guard = self.enter()?;
		if guard.state.transaction_depth == 0 {
			return Err(Error::State("no active savepoint to roll back to".to_string()));
		}
		let sql = format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name));
		self.exec_locked(&mut guard.state, &sql)
	}

	pub fn transaction(&self) -> Result<Transaction<'_>> {
		self.transaction_with_mode(TransactionMode::Immediate)
	}

	pub fn transaction_with_mode(&self, mode: TransactionMode) -> Result<Transaction<'_>> {
		self.begin(mode)?;
		Ok(Transaction { conn: self, active: true })
	}

	pub fn transaction_depth(&self) -> Result<u32> {
		Ok(self.enter()?.state.transaction_depth)
	}

	pub fn set_busy_policy(&self, policy: BusyPolicy) -> Result<()> {
		let mut guard = self.enter()?;
		guard.state.busy_policy = policy;
		Ok(())
	}

	pub fn busy_policy(&self) -> Result<BusyPolicy> {
		Ok(self.enter()?.state.busy_policy.clone())
	}

	pub fn last_insert_rowid(&self) -> Result<i64> {
		let _guard = self.enter()?;
		Ok(unsafe { ffi::sqlite3_last_insert_rowid(self.db.as_ptr()) })
	}

	pub fn changes(&self) -> Result<i64> {
		let _guard = self.enter()?;
		Ok(i64::from(unsafe { ffi::sqlite3_changes(self.db.as_ptr()) }))
	}

	pub fn total_changes(&self) -> Result<i64> {
		let _guard = self.enter()?;
		Ok(i64::from(unsafe { ffi::sqlite3_total_changes(self.db.as_ptr()) }))
	}

	pub fn is_autocommit(&self) -> Result<bool> {
		let _guard = self.enter()?;
		Ok(unsafe { ffi::sqlite3_get_autocommit(self.db.as_ptr()) } != 0)
	}

	pub fn is_readonly(&self, database: &str) -> Result<bool> {
		let _guard = self.enter()?;
		let database_c = CString::new(database)
			.map_err(|_| Error::Configuration("database name contains a NUL byte".to_string()))?;
		let rc = unsafe { ffi::sqlite3_db_readonly(self.db.as_ptr(), database_c.as_ptr()) };
		if rc < 0 {
			return Err(Error::Configuration(format!("unknown database: {database}")));
		}
		Ok(rc != 0)
	}

	/// Ask the engine to abort the in-flight call on this connection. Safe to
	/// invoke from another thread without the connection lock; that is the
	/// one engine entry point designed for it.
	pub fn interrupt(&self) {
		unsafe { ffi::sqlite3_interrupt(self.db.as_ptr()) };
	}

	pub fn cached_statement_count(&self) -> Result<usize> {
		Ok(self.enter()?.state.cache.len())
	}

	fn try_close(&self) -> Result<()> {
		let mut guard = self.enter()?;
		guard.state.cache.clear();

		let leftover = unsafe { ffi::sqlite3_next_stmt(self.db.as_ptr(), std::ptr::null_mut()) };
		if !leftover.is_null() {
			return Err(Error::busy_now(
				"connection still has unfinalized statements".to_string(),
			));
		}

		let rc = unsafe { ffi::sqlite3_close(self.db.as_ptr()) };
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.db.as_ptr(), rc));
		}

		self.closed.store(true, Ordering::Release);
		debug!("closed database connection");
		Ok(())
	}

	/// Close the connection, refusing (with a busy condition) while anything
	/// derived from it is still alive.
	pub fn close(self) -> std::result::Result<(), (Self, Error)> {
		match self.try_close() {
			Ok(()) => Ok(()),
			Err(close_error) => Err((self, close_error)),
		}
	}

	/// Close with best-effort cleanup: finalizes whatever statements are
	/// still outstanding first.
	pub fn force_close(self) -> Result<()> {
		{
			let mut guard = self.enter()?;
			guard.state.cache.clear();
			loop {
				let stmt =
					unsafe { ffi::sqlite3_next_stmt(self.db.as_ptr(), std::ptr::null_mut()) };
				if stmt.is_null() {
					break;
				}
				let _ = unsafe { ffi::sqlite3_finalize(stmt) };
			}

			let rc = unsafe { ffi::sqlite3_close(self.db.as_ptr()) };
			if rc != crate::SQLITE_OK {
				let _ = unsafe { ffi::sqlite3_close_v2(self.db.as_ptr()) };
			}
		}
		self.closed.store(true, Ordering::Release);
		Ok(())
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		if self.closed.load(Ordering::Acquire) {
			return;
		}
		self.state.get_mut().cache.clear();
		let _ = unsafe { ffi::sqlite3_close_v2(self.db.as_ptr()) };
	}
}

/// Scoped transaction that rolls back on drop unless committed.
pub struct Transaction<'conn> {
	conn: &'conn Connection,
	active: bool,
}

impl<'conn> Transaction<'conn> {
	pub fn prepare(&self, sql: &str) -> Result<Statement<'conn>> {
		self.conn.prepare(sql)
	}

	pub fn execute(&self, sql: &str) -> Result<()> {
		self.conn.execute(sql)
	}

	pub fn query_all(&self, sql: &str) -> Result<Vec<Vec<Value>>> {
		self.conn.query_all(sql)
	}

	pub fn query_row(&self, sql: &str) -> Result<Option<Vec<Value>>> {
		self.conn.query_row(sql)
	}

	pub fn commit(mut self) -> Result<()> {
		if !self.active {
			return Ok(());
		}
		self.conn.commit()?;
		self.active = false;
		Ok(())
	}

	pub fn rollback(mut self) -> Result<()> {
		if !self.active {
			return Ok(());
		}
		self.conn.rollback()?;
		self.active = false;
		Ok(())
	}

	#[must_use]
	pub const fn is_active(&self) -> bool {
		self.active
	}
}

impl Drop for Transaction<'_> {
	fn drop(&mut self) {
		if self.active {
			let _ = self.conn.rollback();
		}
	}
}
