use core::ffi::{c_int, c_void};
use std::ffi::CString;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::debug;

use crate::connection::Connection;
use crate::error::{CallbackError, CallbackErrorSlot, CallbackResult, Error, Result};
use crate::value::Value;
use crate::{error, ffi, value};

/// Option set for registering a function.
#[derive(Debug, Clone, Default)]
pub struct FunctionOptions {
	pub deterministic: bool,
}

impl FunctionOptions {
	fn flags(&self) -> c_int {
		let mut flags = crate::SQLITE_UTF8_ENCODING;
		if self.deterministic {
			flags |= crate::SQLITE_DETERMINISTIC;
		}
		flags
	}
}

/// Accumulator for a user-defined aggregate. One instance exists per group,
/// created lazily on the group's first row and destroyed when the engine
/// finalizes the aggregate.
pub trait Aggregate: Send + 'static {
	fn step(&mut self, args: &[Value]) -> CallbackResult<()>;
	fn finalize(self) -> CallbackResult<Value>;
}

struct ScalarData {
	name: String,
	func: Box<dyn Fn(&[Value]) -> CallbackResult<Value> + Send + Sync + 'static>,
	error_slot: Arc<CallbackErrorSlot>,
}

struct AggregateData<A> {
	name: String,
	factory: Box<dyn Fn() -> A + Send + Sync + 'static>,
	error_slot: Arc<CallbackErrorSlot>,
}

struct AggregateState<A> {
	accumulator: A,
	failed: bool,
}

fn function_name_c(name: &str) -> Result<CString> {
	CString::new(name)
		.map_err(|_| Error::Configuration("function name contains a NUL byte".to_string()))
}

fn check_arity(arity: i32) -> Result<()> {
	if (-1..=127).contains(&arity) {
		Ok(())
	} else {
		Err(Error::Range(format!("function arity {arity} must be between -1 and 127")))
	}
}

pub(crate) fn set_result_error(context: *mut ffi::Sqlite3Context, message: &str) {
	if let Ok(message) = CString::new(message) {
		unsafe { ffi::sqlite3_result_error(context, message.as_ptr(), -1) };
	} else {
		unsafe { ffi::sqlite3_result_error(context, c"callback error".as_ptr(), -1) };
	}
}

/// Record a host-raised error for re-raising once the engine call returns,
/// and fail the current SQL call with its message.
fn report_callback_failure(
	context: *mut ffi::Sqlite3Context,
	name: &str,
	slot: &CallbackErrorSlot,
	source: CallbackError,
) {
	let message = source.to_string();
	slot.store(Error::Callback { function: name.to_string(), source });
	set_result_error(context, &message);
}

fn report_marshal_failure(
	context: *mut ffi::Sqlite3Context,
	slot: &CallbackErrorSlot,
	marshal_error: Error,
) {
	let message = marshal_error.to_string();
	slot.store(marshal_error);
	set_result_error(context, &message);
}

unsafe extern "C" fn scalar_trampoline(
	context: *mut ffi::Sqlite3Context,
	argc: c_int,
	argv: *mut *mut ffi::Sqlite3Value,
) {
	let data = unsafe { ffi::sqlite3_user_data(context) }.cast::<ScalarData>();
	let Some(data) = (unsafe { data.as_ref() }) else {
		set_result_error(context, "missing scalar callback state");
		return;
	};

	let args = match value::values_from_raw(argc, argv) {
		Ok(args) => args,
		Err(marshal_error) => {
			report_marshal_failure(context, &data.error_slot, marshal_error);
			return;
		}
	};

	match catch_unwind(AssertUnwindSafe(|| (data.func)(&args))) {
		Ok(Ok(result)) => value::result_value_raw(context, &result),
		Ok(Err(raised)) => report_callback_failure(context, &data.name, &data.error_slot, raised),
		Err(_) => report_callback_failure(
			context,
			&data.name,
			&data.error_slot,
			CallbackError::from("scalar callback panicked"),
		),
	}
}

unsafe extern "C" fn aggregate_step_trampoline<A: Aggregate>(
	context: *mut ffi::Sqlite3Context,
	argc: c_int,
	argv: *mut *mut ffi::Sqlite3Value,
) {
	let data = unsafe { ffi::sqlite3_user_data(context) }.cast::<AggregateData<A>>();
	let Some(data) = (unsafe { data.as_ref() }) else {
		set_result_error(context, "missing aggregate callback state");
		return;
	};

	let slot_size = c_int::try_from(size_of::<*mut AggregateState<A>>()).unwrap_or(0);
	let slot = unsafe { ffi::sqlite3_aggregate_context(context, slot_size) }
		.cast::<*mut AggregateState<A>>();
	if slot.is_null() {
		set_result_error(context, "unable to allocate aggregate context");
		return;
	}

	if unsafe { (*slot).is_null() } {
		match catch_unwind(AssertUnwindSafe(|| (data.factory)())) {
			Ok(accumulator) => unsafe {
				*slot = Box::into_raw(Box::new(AggregateState { accumulator, failed: false }));
			},
			Err(_) => {
				report_callback_failure(
					context,
					&data.name,
					&data.error_slot,
					CallbackError::from("aggregate factory panicked"),
				);
				return;
			}
		}
	}

	let state = unsafe { &mut **slot };
	if state.failed {
		return;
	}

	let args = match value::values_from_raw(argc, argv) {
		Ok(args) => args,
		Err(marshal_error) => {
			state.failed = true;
			report_marshal_failure(context, &data.error_slot, marshal_error);
			return;
		}
	};

	match catch_unwind(AssertUnwindSafe(|| state.accumulator.step(&args))) {
		Ok(Ok(())) => {}
		Ok(Err(raised)) => {
			state.failed = true;
			report_callback_failure(context, &data.name, &data.error_slot, raised);
		}
		Err(_) => {
			state.failed = true;
			report_callback_failure(
				context,
				&data.name,
				&data.error_slot,
				CallbackError::from("aggregate step panicked"),
			);
		}
	}
}

unsafe extern "C" fn aggregate_final_trampoline<A: Aggregate>(context: *mut ffi::Sqlite3Context) {
	let data = unsafe { ffi::sqlite3_user_data(context) }.cast::<AggregateData<A>>();
	let Some(data) = (unsafe { data.as_ref() }) else {
		set_result_error(context, "missing aggregate callback state");
		return;
	};

	// Zero-byte request: never allocates, so a group that saw no rows is
	// observable as an empty slot here.
	let slot =
		unsafe { ffi::sqlite3_aggregate_context(context, 0) }.cast::<*mut AggregateState<A>>();

	let state = if slot.is_null() || unsafe { (*slot).is_null() } {
		// Group with zero rows: run the accumulator lifecycle anyway, as a
		// create-then-finalize pair.
		match catch_unwind(AssertUnwindSafe(|| (data.factory)())) {
			Ok(accumulator) => Box::new(AggregateState { accumulator, failed: false }),
			Err(_) => {
				report_callback_failure(
					context,
					&data.name,
					&data.error_slot,
					CallbackError::from("aggregate factory panicked"),
				);
				return;
			}
		}
	} else {
		let state = unsafe { Box::from_raw(*slot) };
		unsafe {
			*slot = std::ptr::null_mut();
		}
		state
	};

	if state.failed {
		// The step error already sits in the connection's error slot.
		set_result_error(context, "aggregate step failed");
		return;
	}

	let AggregateState { accumulator, .. } = *state;
	match catch_unwind(AssertUnwindSafe(move || accumulator.finalize())) {
		Ok(Ok(result)) => value::result_value_raw(context, &result),
		Ok(Err(raised)) => report_callback_failure(context, &data.name, &data.error_slot, raised),
		Err(_) => report_callback_failure(
			context,
			&data.name,
			&data.error_slot,
			CallbackError::from("aggregate finalize panicked"),
		),
	}
}

unsafe extern "C" fn destroy_scalar_data(data: *mut c_void) {
	if !data.is_null() {
		drop(unsafe { Box::from_raw(data.cast::<ScalarData>()) });
	}
}

unsafe extern "C" fn destroy_aggregate_data<A: Aggregate>(data: *mut c_void) {
	if !data.is_null() {
		drop(unsafe { Box::from_raw(data.cast::<AggregateData<A>>()) });
	}
}

impl Connection {
	/// Register (or overwrite) a scalar SQL function. An arity of -1 accepts
	/// any argument count.
	pub fn create_scalar_function<F>(
		&self,
		name: &str,
		arity: i32,
		options: &FunctionOptions,
		func: F,
	) -> Result<()>
	where
		F: Fn(&[Value]) -> CallbackResult<Value> + Send + Sync + 'static,
	{
		check_arity(arity)?;
		let _guard = self.enter()?;
		let name_c = function_name_c(name)?;

		let data = Box::new(ScalarData {
			name: name.to_string(),
			func: Box::new(func),
			error_slot: self.error_slot(),
		});
		let rc = unsafe {
			ffi::sqlite3_create_function_v2(
				self.raw(),
				name_c.as_ptr(),
				arity,
				options.flags(),
				Box::into_raw(data).cast(),
				Some(scalar_trampoline),
				None,
				None,
				Some(destroy_scalar_data),
			)
		};
		// On failure the engine has already run the destructor on the data.
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}

		debug!(name, arity, "registered scalar function");
		Ok(())
	}

	/// Register (or overwrite) an aggregate SQL function. `factory` builds a
	/// fresh accumulator for each group.
	pub fn create_aggregate_function<A, F>(
		&self,
		name: &str,
		arity: i32,
		options: &FunctionOptions,
		factory: F,
	) -> Result<()>
	where
		A: Aggregate,
		F: Fn() -> A + Send + Sync + 'static,
	{
		check_arity(arity)?;
		let _guard = self.enter()?;
		let name_c = function_name_c(name)?;

		let data = Box::new(AggregateData::<A> {
			name: name.to_string(),
			factory: Box::new(factory),
			error_slot: self.error_slot(),
		});
		let rc = unsafe {
			ffi::sqlite3_create_function_v2(
				self.raw(),
				name_c.as_ptr(),
				arity,
				options.flags(),
				Box::into_raw(data).cast(),
				None,
				Some(aggregate_step_trampoline::<A>),
				Some(aggregate_final_trampoline::<A>),
				Some(destroy_aggregate_data::<A>),
			)
		};
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}

		debug!(name, arity, "registered aggregate function");
		Ok(())
	}

	/// Drop a previously registered function of the given (name, arity).
	pub fn remove_function(&self, name: &str, arity: i32) -> Result<()> {
		check_arity(arity)?;
		let _guard = self.enter()?;
		let name_c = function_name_c(name)?;

		let rc = unsafe {
			ffi::sqlite3_create_function_v2(
				self.raw(),
				name_c.as_ptr(),
				arity,
				crate::SQLITE_UTF8_ENCODING,
				std::ptr::null_mut(),
				None,
				None,
				None,
				None,
			)
		};
		if rc != crate::SQLITE_OK {
			return Err(error::translate(self.raw(), rc));
		}
		Ok(())
	}
}
