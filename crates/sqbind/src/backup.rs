use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::busy::BusyPolicy;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::{busy, error, ffi};

/// Page counts reported after a backup step.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BackupProgress {
	pub remaining: usize,
	pub total: usize,
	pub done: bool,
}

/// How a driven backup run ended. A cancelled run leaves both connections
/// valid, but the destination contents are not guaranteed consistent.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BackupRun {
	Completed(BackupProgress),
	Cancelled(BackupProgress),
}

/// Cooperative cancellation switch for `Backup::run`, checked between steps
/// and never mid-step.
#[derive(Debug, Clone)]
pub struct BackupCancelToken(Arc<AtomicBool>);

impl BackupCancelToken {
	pub fn cancel(&self) {
		self.0.store(true, Ordering::Release);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}
}

/// One online-backup session copying a source database into a destination
/// connection in bounded page-count steps.
pub struct Backup<'a> {
	source: &'a Connection,
	dest: &'a Connection,
	handle: NonNull<ffi::Sqlite3Backup>,
	policy: BusyPolicy,
	cancel: Arc<AtomicBool>,
	done: bool,
	finished: bool,
}

impl std::fmt::Debug for Backup<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Backup")
			.field("policy", &self.policy)
			.field("done", &self.done)
			.field("finished", &self.finished)
			.finish_non_exhaustive()
	}
}

impl<'a> Backup<'a> {
	/// Start a backup of `source_db` on `source` into `dest_db` on `dest`.
	/// The two handles must belong to different connections.
	pub fn new(
		source: &'a Connection,
		source_db: &str,
		dest: &'a Connection,
		dest_db: &str,
	) -> Result<Self> {
		if std::ptr::eq(source.raw(), dest.raw()) {
			return Err(Error::Configuration(
				"source and destination must be different connections".to_string(),
			));
		}

		let source_db_c = CString::new(source_db)
			.map_err(|_| Error::Configuration("database name contains a NUL byte".to_string()))?;
		let dest_db_c = CString::new(dest_db)
			.map_err(|_| Error::Configuration("database name contains a NUL byte".to_string()))?;

		let policy = dest.busy_policy()?;
		let (_first, _second) = Self::lock_pair(source, dest)?;
		let handle = unsafe {
			ffi::sqlite3_backup_init(
				dest.raw(),
				dest_db_c.as_ptr(),
				source.raw(),
				source_db_c.as_ptr(),
			)
		};
		let Some(handle) = NonNull::new(handle) else {
			let rc = unsafe { ffi::sqlite3_errcode(dest.raw()) };
			return Err(error::translate(dest.raw(), rc));
		};

		Ok(Self {
			source,
			dest,
			handle,
			policy,
			cancel: Arc::new(AtomicBool::new(false)),
			done: false,
			finished: false,
		})
	}

	// Both connections stay locked for the duration of one backup step; a
	// stable acquisition order keeps two opposing backups from deadlocking.
	fn lock_pair(
		source: &'a Connection,
		dest: &'a Connection,
	) -> Result<(crate::connection::CallGuard<'a>, crate::connection::CallGuard<'a>)> {
		if (source.raw() as usize) < (dest.raw() as usize) {
			let first = source.enter()?;
			let second = dest.enter()?;
			Ok((first, second))
		} else {
			let first = dest.enter()?;
			let second = source.enter()?;
			Ok((first, second))
		}
	}

	fn progress(&self) -> BackupProgress {
		let remaining =
			usize::try_from(unsafe { ffi::sqlite3_backup_remaining(self.handle.as_ptr()) })
				.unwrap_or_default();
		let total =
			usize::try_from(unsafe { ffi::sqlite3_backup_pagecount(self.handle.as_ptr()) })
				.unwrap_or_default();
		BackupProgress { remaining, total, done: self.done }
	}

	#[must_use]
	pub const fn is_done(&self) -> bool {
		self.done
	}

	#[must_use]
	pub fn cancel_token(&self) -> BackupCancelToken {
		BackupCancelToken(Arc::clone(&self.cancel))
	}

	/// Copy up to `pages` pages; a negative count copies everything that
	/// remains in one step. Busy/locked conditions go through the
	/// destination's busy policy before surfacing.
	pub fn step(&mut self, pages: i32) -> Result<BackupProgress> {
		if self.done {
			return Ok(self.progress());
		}

		let guards = Self::lock_pair(self.source, self.dest)?;
		let handle = self.handle;
		let outcome = busy::retry(&self.policy, || unsafe {
			ffi::sqlite3_backup_step(handle.as_ptr(), pages)
		});

		let progress = match outcome.rc {
			crate::SQLITE_OK => Ok(()),
			crate::SQLITE_DONE => {
				self.done = true;
				Ok(())
			}
			rc if error::is_busy_code(rc) => Err(self.dest.busy_exhausted(&outcome)),
			rc => Err(error::translate(self.dest.raw(), rc)),
		}
		.map(|()| self.progress());
		drop(guards);

		if let Ok(progress) = &progress {
			trace!(remaining = progress.remaining, total = progress.total, "backup step");
		}
		progress
	}

	/// Drive the copy to completion in `pages_per_step` increments, checking
	/// the cancellation token between steps.
	pub fn run(&mut self, pages_per_step: i32) -> Result<BackupRun> {
		loop {
			if self.cancel.load(Ordering::Acquire) && !self.done {
				return Ok(BackupRun::Cancelled(self.progress()));
			}

			let progress = self.step(pages_per_step)?;
			if progress.done {
				return Ok(BackupRun::Completed(progress));
			}
		}
	}

	/// Tear down the session, releasing the source read lock. Both
	/// connections remain independently usable afterwards.
	pub fn finish(mut self) -> Result<()> {
		self.finished = true;
		let _guards = Self::lock_pair(self.source, self.dest)?;
		let rc = unsafe { ffi::sqlite3_backup_finish(self.handle.as_ptr()) };
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.dest.raw(), rc));
		}
		Ok(())
	}
}

impl Drop for Backup<'_> {
	fn drop(&mut self) {
		if self.finished {
			return;
		}
		let _guards = Self::lock_pair(self.source, self.dest);
		let _ = unsafe { ffi::sqlite3_backup_finish(self.handle.as_ptr()) };
	}
}
