use core::ffi::c_int;
use std::ffi::CString;
use std::ptr::NonNull;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::{error, ffi};

/// Access mode for incremental blob I/O.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlobMode {
	ReadOnly,
	ReadWrite,
}

/// Random-access I/O over one blob cell, scoped to one row/column. A blob
/// cannot grow or shrink through this handle, and the handle goes stale if
/// the underlying row is modified or deleted by anyone else.
pub struct BlobHandle<'conn> {
	conn: &'conn Connection,
	blob: NonNull<ffi::Sqlite3Blob>,
	mode: BlobMode,
	// Captured at open/reopen so bounds checks stay meaningful after the
	// handle expires; the engine then reports staleness, not a bad range.
	len: usize,
	finished: bool,
}

impl std::fmt::Debug for BlobHandle<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BlobHandle")
			.field("mode", &self.mode)
			.field("len", &self.len)
			.field("finished", &self.finished)
			.finish_non_exhaustive()
	}
}

impl Connection {
	/// Open incremental I/O on the blob stored at (`database`.`table`.
	/// `column`, `rowid`).
	pub fn blob_open(
		&self,
		database: &str,
		table: &str,
		column: &str,
		rowid: i64,
		mode: BlobMode,
	) -> Result<BlobHandle<'_>> {
		let _guard = self.enter()?;
		let database_c = CString::new(database)
			.map_err(|_| Error::Configuration("database name contains a NUL byte".to_string()))?;
		let table_c = CString::new(table)
			.map_err(|_| Error::Configuration("table name contains a NUL byte".to_string()))?;
		let column_c = CString::new(column)
			.map_err(|_| Error::Configuration("column name contains a NUL byte".to_string()))?;

		let writeable = c_int::from(mode == BlobMode::ReadWrite);
		let mut blob: *mut ffi::Sqlite3Blob = std::ptr::null_mut();
		let rc = unsafe {
			ffi::sqlite3_blob_open(
				self.raw(),
				database_c.as_ptr(),
				table_c.as_ptr(),
				column_c.as_ptr(),
				rowid,
				writeable,
				&raw mut blob,
			)
		};
		if rc != crate::SQLITE_OK {
			if !blob.is_null() {
				let _ = unsafe { ffi::sqlite3_blob_close(blob) };
			}
			return Err(error::translate(self.raw(), rc));
		}

		let blob = NonNull::new(blob).ok_or_else(|| {
			Error::Configuration("engine returned a null blob handle".to_string())
		})?;
		let len =
			usize::try_from(unsafe { ffi::sqlite3_blob_bytes(blob.as_ptr()) }).unwrap_or_default();

		Ok(BlobHandle { conn: self, blob, mode, len, finished: false })
	}
}

impl BlobHandle<'_> {
	/// Total size of the underlying blob cell, fixed at open time.
	#[must_use]
	pub const fn len(&self) -> usize {
		self.len
	}

	#[must_use]
	pub const fn is_empty(&self) -> bool {
		self.len == 0
	}

	#[must_use]
	pub const fn mode(&self) -> BlobMode {
		self.mode
	}

	fn check_bounds(&self, offset: usize, length: usize, what: &str) -> Result<()> {
		let end = offset
			.checked_add(length)
			.ok_or_else(|| Error::Range(format!("{what} range overflows")))?;
		if end > self.len {
			return Err(Error::Range(format!(
				"{what} of {length} bytes at offset {offset} exceeds blob length {}",
				self.len
			)));
		}
		Ok(())
	}

	fn io_error(&self, rc: c_int) -> Error {
		match error::translate(self.conn.raw(), rc) {
			Error::Stale(_) => Error::Stale(
				"blob handle expired because its row was modified or deleted".to_string(),
			),
			other => other,
		}
	}

	/// Read `length` bytes starting at `offset`. The range must lie inside
	/// the blob; reads never extend it.
	pub fn read_at(&self, length: usize, offset: usize) -> Result<Vec<u8>> {
		self.check_bounds(offset, length, "read")?;
		if length == 0 {
			return Ok(Vec::new());
		}

		let _guard = self.conn.enter()?;
		let mut buffer = vec![0_u8; length];
		let rc = unsafe {
			ffi::sqlite3_blob_read(
				self.blob.as_ptr(),
				buffer.as_mut_ptr().cast(),
				c_int::try_from(length)
					.map_err(|_| Error::Range(format!("read of {length} bytes is too large")))?,
				c_int::try_from(offset)
					.map_err(|_| Error::Range(format!("offset {offset} is too large")))?,
			)
		};
		if rc != crate::SQLITE_OK {
			return Err(self.io_error(rc));
		}

		Ok(buffer)
	}

	/// Write `data` starting at `offset`. The range must lie inside the
	/// blob; writes never resize it.
	pub fn write_at(&mut self, data: &[u8], offset: usize) -> Result<()> {
		if self.mode == BlobMode::ReadOnly {
			return Err(Error::State("blob handle is read-only".to_string()));
		}
		self.check_bounds(offset, data.len(), "write")?;
		if data.is_empty() {
			return Ok(());
		}

		let _guard = self.conn.enter()?;
		let rc = unsafe {
			ffi::sqlite3_blob_write(
				self.blob.as_ptr(),
				data.as_ptr().cast(),
				c_int::try_from(data.len())
					.map_err(|_| Error::Range(format!("write of {} bytes is too large", data.len())))?,
				c_int::try_from(offset)
					.map_err(|_| Error::Range(format!("offset {offset} is too large")))?,
			)
		};
		if rc != crate::SQLITE_OK {
			return Err(self.io_error(rc));
		}

		Ok(())
	}

	/// Move the handle to the same column of another row, cheaper than a
	/// close-and-reopen pair.
	pub fn reopen(&mut self, rowid: i64) -> Result<()> {
		let _guard = self.conn.enter()?;
		let rc = unsafe { ffi::sqlite3_blob_reopen(self.blob.as_ptr(), rowid) };
		if rc != crate::SQLITE_OK {
			return Err(self.io_error(rc));
		}

		self.len =
			usize::try_from(unsafe { ffi::sqlite3_blob_bytes(self.blob.as_ptr()) })
				.unwrap_or_default();
		Ok(())
	}

	/// Release the handle, reporting any deferred write error.
	pub fn close(mut self) -> Result<()> {
		self.finished = true;
		let _guard = self.conn.enter()?;
		let rc = unsafe { ffi::sqlite3_blob_close(self.blob.as_ptr()) };
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.conn.raw(), rc));
		}
		Ok(())
	}
}

impl Drop for BlobHandle<'_> {
	fn drop(&mut self) {
		if self.finished {
			return;
		}
		let _guard = self.conn.enter();
		let _ = unsafe { ffi::sqlite3_blob_close(self.blob.as_ptr()) };
	}
}
