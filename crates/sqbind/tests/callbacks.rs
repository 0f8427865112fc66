use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

use sqbind::{
	Aggregate, Authorization, CallbackResult, Connection, Error, FunctionOptions, TraceEvent,
	TraceEvents, Value,
};

struct SumInteger {
	total: i64,
}

impl Aggregate for SumInteger {
	fn step(&mut self, args: &[Value]) -> CallbackResult<()> {
		match args.first() {
			Some(Value::Integer(x)) => {
				self.total += *x;
				Ok(())
			}
			Some(Value::Null) | None => Ok(()),
			Some(other) => Err(format!("expected an integer, got {}", other.type_name()).into()),
		}
	}

	fn finalize(self) -> CallbackResult<Value> {
		Ok(Value::Integer(self.total))
	}
}

#[test]
fn scalar_function_round_trips_values() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.create_scalar_function("double_it", 1, &FunctionOptions::default(), |args| {
		match args.first() {
			Some(Value::Integer(x)) => Ok(Value::Integer(x * 2)),
			_ => Err("double_it expects one integer".into()),
		}
	})
	.expect("register double_it");

	let row = db.query_row("select double_it(21)").expect("call double_it");
	assert_eq!(row, Some(vec![Value::Integer(42)]));
}

#[test]
fn scalar_function_errors_surface_as_callback_errors() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.create_scalar_function("broken", 0, &FunctionOptions::default(), |_| {
		Err("deliberate failure".into())
	})
	.expect("register broken");

	let err = db.query_row("select broken()").expect_err("call must fail");
	match err {
		Error::Callback { function, source } => {
			assert_eq!(function, "broken");
			assert!(source.to_string().contains("deliberate failure"));
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn registered_aggregate_sums_one_to_one_hundred() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x integer)").expect("create table");

	let tx = db.transaction().expect("begin transaction");
	{
		let mut insert = tx.prepare("insert into t(x) values (?)").expect("prepare insert");
		for x in 1..=100_i64 {
			insert.bind(1, x).expect("bind x");
			assert!(!insert.step().expect("insert row"));
			insert.reset().expect("reset insert");
		}
	}
	tx.commit().expect("commit rows");

	db.create_aggregate_function("sum_integers", 1, &FunctionOptions::default(), || SumInteger {
		total: 0,
	})
	.expect("register aggregate");

	let row = db.query_row("select sum_integers(x) from t").expect("run aggregate");
	assert_eq!(row, Some(vec![Value::Integer(5050)]));
}

#[test]
fn aggregate_handles_a_group_with_zero_rows() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x integer)").expect("create table");
	db.create_aggregate_function("sum_integers", 1, &FunctionOptions::default(), || SumInteger {
		total: 0,
	})
	.expect("register aggregate");

	// The engine finalizes the aggregate without ever stepping it.
	let row = db.query_row("select sum_integers(x) from t").expect("run over empty table");
	assert_eq!(row, Some(vec![Value::Integer(0)]));
}

#[test]
fn aggregate_step_errors_fail_the_call() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");
	db.execute("insert into t values ('not a number')").expect("insert");
	db.create_aggregate_function("sum_integers", 1, &FunctionOptions::default(), || SumInteger {
		total: 0,
	})
	.expect("register aggregate");

	let err = db.query_row("select sum_integers(x) from t").expect_err("text input must fail");
	assert!(matches!(err, Error::Callback { .. }), "unexpected error: {err:?}");
}

#[test]
fn functions_can_be_overwritten_and_removed() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.create_scalar_function("answer", 0, &FunctionOptions::default(), |_| {
		Ok(Value::Integer(1))
	})
	.expect("register v1");
	db.create_scalar_function("answer", 0, &FunctionOptions::default(), |_| {
		Ok(Value::Integer(42))
	})
	.expect("overwrite with v2");

	let row = db.query_row("select answer()").expect("call v2");
	assert_eq!(row, Some(vec![Value::Integer(42)]));

	db.remove_function("answer", 0).expect("remove function");
	let err = db.query_row("select answer()").expect_err("function is gone");
	assert!(matches!(err, Error::Engine { .. }));
}

#[test]
fn collation_orders_query_results() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(s text)").expect("create table");
	db.execute("insert into t values ('b'), ('A'), ('c')").expect("insert rows");

	db.create_collation("nocase_flipped", |left, right| {
		left.to_ascii_lowercase().cmp(&right.to_ascii_lowercase()).reverse()
	})
	.expect("register collation");

	let rows = db
		.query_all("select s from t order by s collate nocase_flipped")
		.expect("query with collation");
	assert_eq!(
		rows,
		vec![
			vec![Value::Text("c".to_string())],
			vec![Value::Text("b".to_string())],
			vec![Value::Text("A".to_string())],
		]
	);

	db.remove_collation("nocase_flipped").expect("remove collation");
	let err = db
		.query_all("select s from t order by s collate nocase_flipped")
		.expect_err("collation is gone");
	assert!(matches!(err, Error::Engine { .. }));
}

#[test]
fn collation_comparator_agrees_with_std_ordering() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.create_collation("plain", |left, right| left.cmp(right)).expect("register collation");

	let row = db
		.query_row("select 'abc' = 'abc' collate plain, 'abc' < 'abd' collate plain")
		.expect("compare");
	assert_eq!(row, Some(vec![Value::Integer(1), Value::Integer(1)]));
	assert_eq!("abc".cmp("abd"), Ordering::Less);
}

#[test]
fn authorizer_can_deny_operations() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");

	db.set_authorizer(|_context| Authorization::Deny).expect("install deny-all authorizer");
	let err = db.prepare("select x from t").expect_err("prepare must be denied");
	match err {
		Error::Engine { code, .. } => assert_eq!(code & 0xff, 23, "expected an auth failure"),
		other => panic!("unexpected error: {other:?}"),
	}

	db.clear_authorizer().expect("clear authorizer");
	db.prepare("select x from t").expect("prepare allowed again");
}

#[test]
fn authorizer_sees_operation_details() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table secrets(x)").expect("create table");

	let saw_secrets = Arc::new(AtomicBool::new(false));
	let witness = Arc::clone(&saw_secrets);
	db.set_authorizer(move |context| {
		if context.detail1 == Some("secrets") {
			witness.store(true, AtomicOrdering::Release);
		}
		Authorization::Allow
	})
	.expect("install authorizer");

	db.query_all("select x from secrets").expect("query");
	assert!(saw_secrets.load(AtomicOrdering::Acquire));
}

#[test]
fn progress_handler_can_interrupt() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.set_progress_handler(10, || true).expect("install interrupting handler");

	let err = db
		.query_all(
			"with recursive c(x) as (select 1 union all select x + 1 from c where x < 100000)
			 select count(*) from c",
		)
		.expect_err("long query must be interrupted");
	match err {
		Error::Engine { code, .. } => assert_eq!(code & 0xff, 9, "expected an interrupt"),
		other => panic!("unexpected error: {other:?}"),
	}

	db.clear_progress_handler().expect("clear handler");
	db.query_all("select 1").expect("queries run again");
}

#[test]
fn commit_hook_can_turn_commit_into_rollback() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");

	db.set_commit_hook(|| true).expect("install refusing hook");
	db.begin(sqbind::TransactionMode::Immediate).expect("begin");
	db.execute("insert into t values (1)").expect("insert");
	let err = db.commit().expect_err("hook refuses the commit");
	assert!(matches!(err, Error::Engine { .. }), "unexpected error: {err:?}");
	assert!(db.is_autocommit().expect("transaction is gone"));

	db.clear_commit_hook().expect("clear hook");
	let count = db.query_row("select count(*) from t").expect("count");
	assert_eq!(count, Some(vec![Value::Integer(0)]));
}

#[test]
fn rollback_hook_observes_rollbacks() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");

	let rolled_back = Arc::new(AtomicBool::new(false));
	let witness = Arc::clone(&rolled_back);
	db.set_rollback_hook(move || witness.store(true, AtomicOrdering::Release))
		.expect("install hook");

	db.begin(sqbind::TransactionMode::Immediate).expect("begin");
	db.execute("insert into t values (1)").expect("insert");
	db.rollback().expect("rollback");

	assert!(rolled_back.load(AtomicOrdering::Acquire));
}

#[test]
fn trace_handler_sees_statement_text() {
	let db = Connection::open_in_memory().expect("open memory database");
	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = Arc::clone(&seen);

	db.set_trace_handler(
		TraceEvents { statement: true, ..TraceEvents::default() },
		move |event| {
			if let TraceEvent::Statement { sql } = event {
				sink.lock().expect("trace sink").push(sql.to_string());
			}
		},
	)
	.expect("install trace handler");

	db.execute("create table t(x)").expect("create table");
	db.execute("insert into t values (1)").expect("insert");

	let seen = seen.lock().expect("trace sink");
	assert!(seen.iter().any(|sql| sql.contains("create table t")), "saw: {seen:?}");
	assert!(seen.iter().any(|sql| sql.contains("insert into t")), "saw: {seen:?}");
	drop(seen);

	db.clear_trace_handler().expect("clear handler");
}

#[test]
fn profile_events_report_elapsed_time() {
	let db = Connection::open_in_memory().expect("open memory database");
	let profiled = Arc::new(AtomicUsize::new(0));
	let sink = Arc::clone(&profiled);

	db.set_trace_handler(
		TraceEvents { profile: true, ..TraceEvents::default() },
		move |event| {
			if let TraceEvent::Profile { .. } = event {
				sink.fetch_add(1, AtomicOrdering::Relaxed);
			}
		},
	)
	.expect("install profile handler");

	db.execute("select 1").expect("run query");
	assert!(profiled.load(AtomicOrdering::Relaxed) >= 1);
}

#[test]
fn reentrant_connection_use_from_a_callback_is_rejected() {
	let db = Arc::new(Connection::open_in_memory().expect("open memory database"));

	let inner = Arc::clone(&db);
	db.create_scalar_function("reenter", 0, &FunctionOptions::default(), move |_| {
		match inner.execute("select 1") {
			Err(Error::State(message)) => Ok(Value::Text(message)),
			Ok(()) => Err("re-entrant call was allowed".into()),
			Err(other) => Err(format!("unexpected error: {other}").into()),
		}
	})
	.expect("register reentrant probe");

	let row = db.query_row("select reenter()").expect("probe runs");
	match row {
		Some(values) => match values.first() {
			Some(Value::Text(message)) => assert!(message.contains("re-entrant")),
			other => panic!("unexpected result: {other:?}"),
		},
		None => panic!("probe returned no row"),
	}
}

#[test]
fn deterministic_functions_are_usable_in_indexes() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.create_scalar_function(
		"stable_len",
		1,
		&FunctionOptions { deterministic: true },
		|args| match args.first() {
			Some(Value::Text(s)) => Ok(Value::Integer(i64::try_from(s.len()).unwrap_or(0))),
			_ => Ok(Value::Null),
		},
	)
	.expect("register deterministic function");

	db.execute("create table t(s text)").expect("create table");
	db.execute("create index t_len on t(stable_len(s))").expect("index over the function");
	db.execute("insert into t values ('abc')").expect("insert");

	let row = db.query_row("select stable_len(s) from t").expect("query");
	assert_eq!(row, Some(vec![Value::Integer(3)]));
}
