use sqbind::{Connection, Error, OpenOptions, TransactionMode, Value};

fn round_trip(db: &Connection, value: Value) -> Value {
	let mut stmt = db.prepare("select ?").expect("prepare probe");
	stmt.bind(1, value).expect("bind probe value");
	assert!(stmt.step().expect("step probe"));
	stmt.column_value(0).expect("read probe column")
}

#[test]
fn values_survive_round_trips() {
	let db = Connection::open_in_memory().expect("open memory database");

	for value in [
		Value::Null,
		Value::Integer(0),
		Value::Integer(i64::MAX),
		Value::Integer(i64::MIN),
		Value::Real(3.5),
		Value::Real(f64::INFINITY),
		Value::Real(f64::NEG_INFINITY),
		Value::Text(String::new()),
		Value::Text("snails & snails".to_string()),
		Value::Blob(Vec::new()),
		Value::Blob(vec![0, 1, 2, 255]),
	] {
		assert_eq!(round_trip(&db, value.clone()), value);
	}
}

#[test]
fn nan_is_normalized_to_null_by_the_engine() {
	let db = Connection::open_in_memory().expect("open memory database");
	assert_eq!(round_trip(&db, Value::Real(f64::NAN)), Value::Null);
}

#[test]
fn open_options_respect_read_only() {
	let dir = tempfile::tempdir().expect("create temp dir");
	let path = dir.path().join("fresh.db");
	let path = path.to_str().expect("utf-8 temp path");

	let err = Connection::open(path, &OpenOptions::default().read_only(true))
		.expect_err("read-only open of a missing file should fail");
	assert!(matches!(err, Error::Engine { .. }), "unexpected error: {err:?}");

	let db = Connection::open(path, &OpenOptions::default()).expect("create database");
	db.execute("create table t(x)").expect("create table");
	drop(db);

	let db =
		Connection::open(path, &OpenOptions::default().read_only(true)).expect("reopen read-only");
	assert!(db.is_readonly("main").expect("query readonly"));
	let err = db.execute("insert into t values (1)").expect_err("writes must fail");
	assert!(matches!(err, Error::Engine { .. }));
}

#[test]
fn statement_bindings_by_index_and_name() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table kv(name text, qty integer)").expect("create table");

	let mut named =
		db.prepare("insert into kv(name, qty) values (:name, :qty)").expect("prepare named");
	named.bind_named("name", "apples").expect("bind name");
	named.bind_named(":qty", 12_i64).expect("bind qty");
	assert!(!named.step().expect("run named insert"));

	let mut positional =
		db.prepare("insert into kv(name, qty) values (?, ?)").expect("prepare positional");
	positional
		.bind_all(&[Value::Text("pears".to_string()), Value::Integer(7)])
		.expect("bind positional");
	assert!(!positional.step().expect("run positional insert"));

	let rows = db.query_all("select name, qty from kv order by name").expect("query kv");
	assert_eq!(
		rows,
		vec![
			vec![Value::Text("apples".to_string()), Value::Integer(12)],
			vec![Value::Text("pears".to_string()), Value::Integer(7)],
		]
	);
}

#[test]
fn under_binding_fails_before_any_step() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(a, b)").expect("create table");

	let mut stmt = db.prepare("insert into t values (?, ?)").expect("prepare");
	let err = stmt.bind_all(&[Value::Integer(1)]).expect_err("one value for two slots");
	assert!(matches!(err, Error::Range(_)), "unexpected error: {err:?}");

	let mut named = db.prepare("insert into t values (:a, :b)").expect("prepare named");
	let err = named
		.bind_named_all(&[("a", Value::Integer(1))])
		.expect_err("missing :b must be reported");
	assert!(matches!(err, Error::Range(_)));

	let err = named
		.bind_named_all(&[
			("a", Value::Integer(1)),
			("b", Value::Integer(2)),
			("c", Value::Integer(3)),
		])
		.expect_err("unknown :c must be reported");
	assert!(matches!(err, Error::Range(_)));

	let count = db.query_row("select count(*) from t").expect("count rows");
	assert_eq!(count, Some(vec![Value::Integer(0)]));
}

#[test]
fn binding_an_out_of_range_index_names_the_parameter() {
	let db = Connection::open_in_memory().expect("open memory database");
	let mut stmt = db.prepare("select ?").expect("prepare");
	let err = stmt.bind(2, 1_i64).expect_err("index 2 of 1");
	match err {
		Error::Range(message) => assert!(message.contains('2'), "message: {message}"),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn statement_state_machine_is_enforced() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");
	db.execute("insert into t values (1), (2)").expect("insert rows");

	let mut stmt = db.prepare("select x from t order by x").expect("prepare");

	// Column access before the first row is a state error.
	let err = stmt.column_value(0).expect_err("no row yet");
	assert!(matches!(err, Error::State(_)));

	assert!(stmt.step().expect("first row"));
	assert_eq!(stmt.column_value(0).expect("read row"), Value::Integer(1));

	// Rebinding mid-execution requires a reset.
	assert!(matches!(stmt.bind(1, 9_i64), Err(Error::State(_))));

	assert!(stmt.step().expect("second row"));
	assert!(!stmt.step().expect("exhausted"));

	// Stepping a completed statement is a state error, not a silent no-op.
	let err = stmt.step().expect_err("step after done");
	assert!(matches!(err, Error::State(_)));

	stmt.reset().expect("reset");
	assert!(stmt.step().expect("runs again after reset"));

	stmt.finalize().expect("finalize");
}

#[test]
fn rebinding_without_reset_is_rejected() {
	let db = Connection::open_in_memory().expect("open memory database");
	let mut stmt = db.prepare("select ?").expect("prepare");
	stmt.bind(1, 1_i64).expect("bind");
	assert!(stmt.step().expect("step"));

	let err = stmt.bind(1, 2_i64).expect_err("bind while on a row");
	assert!(matches!(err, Error::State(_)));

	stmt.reset().expect("reset");
	stmt.bind(1, 2_i64).expect("bind after reset");
}

#[test]
fn column_metadata_is_available() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(id integer primary key, label text)").expect("create table");

	let stmt = db.prepare("select id, label from t").expect("prepare");
	assert_eq!(stmt.column_count().expect("count"), 2);
	assert_eq!(stmt.column_name(0).expect("name"), Some("id".to_string()));
	assert_eq!(stmt.column_name(1).expect("name"), Some("label".to_string()));
	let decltype = stmt.column_decltype(0).expect("decltype").expect("declared type");
	assert!(decltype.eq_ignore_ascii_case("integer"), "decltype: {decltype}");
	assert_eq!(stmt.column_index("label").expect("index"), Some(1));
	assert_eq!(stmt.column_index("missing").expect("index"), None);
	assert!(stmt.is_readonly().expect("readonly"));
}

#[test]
fn transactions_and_savepoints_track_depth() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");

	db.begin(TransactionMode::Immediate).expect("begin");
	assert_eq!(db.transaction_depth().expect("depth"), 1);
	assert!(!db.is_autocommit().expect("autocommit"));

	let err = db.begin(TransactionMode::Deferred).expect_err("nested begin is misuse");
	assert!(matches!(err, Error::State(_)));

	db.savepoint("inner").expect("savepoint");
	assert_eq!(db.transaction_depth().expect("depth"), 2);

	db.execute("insert into t values (1)").expect("insert");
	db.rollback_to("inner").expect("rollback to savepoint");
	db.release("inner").expect("release savepoint");
	assert_eq!(db.transaction_depth().expect("depth"), 1);

	db.commit().expect("commit");
	assert!(db.is_autocommit().expect("autocommit restored"));

	let err = db.commit().expect_err("commit without transaction");
	assert!(matches!(err, Error::State(_)));
	let err = db.rollback().expect_err("rollback without transaction");
	assert!(matches!(err, Error::State(_)));

	let count = db.query_row("select count(*) from t").expect("count");
	assert_eq!(count, Some(vec![Value::Integer(0)]));
}

#[test]
fn transaction_guard_rolls_back_on_drop_and_can_commit() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table txlog(value text)").expect("create table");

	{
		let tx = db.transaction().expect("begin transaction");
		tx.execute("insert into txlog(value) values ('rolled')").expect("insert rolled row");
	}

	let rolled = db.query_row("select count(*) from txlog").expect("count after rollback");
	assert_eq!(rolled, Some(vec![Value::Integer(0)]));

	let tx = db.transaction().expect("begin transaction");
	tx.execute("insert into txlog(value) values ('committed')").expect("insert committed row");
	tx.commit().expect("commit transaction");

	let committed = db.query_row("select count(*) from txlog").expect("count after commit");
	assert_eq!(committed, Some(vec![Value::Integer(1)]));
}

#[test]
fn execute_batch_walks_scripts() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute_batch(
		"create table a(x);
		 create table b(y);
		 insert into a values (1);
		 insert into b values (2);
		 -- trailing comment is fine",
	)
	.expect("run script");

	assert_eq!(db.query_row("select x from a").expect("query a"), Some(vec![Value::Integer(1)]));
	assert_eq!(db.query_row("select y from b").expect("query b"), Some(vec![Value::Integer(2)]));

	let err = db
		.execute_batch("insert into a values (3); insert into nowhere values (4);")
		.expect_err("script stops at first failure");
	assert!(matches!(err, Error::Engine { .. }));
	assert_eq!(
		db.query_row("select count(*) from a").expect("count a"),
		Some(vec![Value::Integer(2)])
	);
}

#[test]
fn prepared_statement_cache_reuses_handles() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");

	{
		let mut stmt = db.prepare_cached("insert into t values (?)").expect("prepare cached");
		stmt.bind(1, 1_i64).expect("bind");
		assert!(!stmt.step().expect("insert"));
	}
	assert_eq!(db.cached_statement_count().expect("cache size"), 1);

	{
		let mut stmt = db.prepare_cached("insert into t values (?)").expect("reuse cached");
		assert_eq!(db.cached_statement_count().expect("cache size"), 0);
		stmt.bind(1, 2_i64).expect("bind");
		assert!(!stmt.step().expect("insert"));
	}
	assert_eq!(db.cached_statement_count().expect("cache size"), 1);

	let rows = db.query_all("select x from t order by x").expect("query");
	assert_eq!(rows, vec![vec![Value::Integer(1)], vec![Value::Integer(2)]]);
}

#[test]
fn cache_capacity_zero_disables_pooling() {
	let db = Connection::open(
		":memory:",
		&OpenOptions::default().in_memory(true).statement_cache_capacity(0),
	)
	.expect("open without cache");
	db.execute("create table t(x)").expect("create table");

	{
		let _stmt = db.prepare_cached("select x from t").expect("prepare");
	}
	assert_eq!(db.cached_statement_count().expect("cache size"), 0);
}

#[test]
fn connection_introspection() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(id integer primary key, x text)").expect("create table");
	db.execute("insert into t(x) values ('a')").expect("insert");

	assert_eq!(db.last_insert_rowid().expect("rowid"), 1);
	assert_eq!(db.changes().expect("changes"), 1);
	assert!(db.total_changes().expect("total") >= 1);
	assert!(!db.is_readonly("main").expect("readonly"));
	assert!(db.is_readonly("nowhere").is_err());
}

#[test]
fn close_succeeds_once_children_are_gone() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");

	{
		let _cached = db.prepare_cached("select x from t").expect("prime the cache");
	}
	assert_eq!(db.cached_statement_count().expect("cache size"), 1);

	// Close drains the cache itself.
	db.close().map_err(|(_, err)| err).expect("close connection");
}

#[test]
fn force_close_cleans_up_best_effort() {
	let db = Connection::open_in_memory().expect("open memory database");
	db.execute("create table t(x)").expect("create table");
	db.force_close().expect("force close");
}
