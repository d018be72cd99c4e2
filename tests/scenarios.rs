//! End-to-end scenarios run against an in-memory SQLite schema through
//! `sqlx`'s `Any` driver, exercising the same SQL text the Orchestrator and
//! RunDeleter would issue against a real model database.

use sqlx::any::{AnyPool, AnyPoolOptions};
use sqlx::Row;

use simrun_results::catalog::{
    Acc, Attr, Dim, Entity, EntityGeneration, EnumDef, Model, OutputTable, Run, RunStatus, TypeDef,
};
use simrun_results::cell::CellValue;
use simrun_results::facet::LiteFacet;
use simrun_results::genquery::{Filter, FilterOp};
use simrun_results::orchestrator::{Orchestrator, ReadKind, ReadRequest};
use simrun_results::parse::parse_calculation;
use simrun_results::reader::Page;
use simrun_results::run::RunDeleter;
use simrun_results::Error;

async fn setup_pool() -> AnyPool {
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite pool");

    let ddl = [
        "CREATE TABLE run_lst (run_id INTEGER PRIMARY KEY, run_name TEXT, run_digest TEXT, status TEXT)",
        "CREATE TABLE workset_lst (base_run_id INTEGER)",
        "CREATE TABLE parameter_dic (parameter_hid INTEGER PRIMARY KEY, db_run_table TEXT)",
        "CREATE TABLE run_parameter (parameter_hid INTEGER, run_id INTEGER, base_run_id INTEGER, value_digest TEXT)",
        "CREATE TABLE table_dic (table_hid INTEGER PRIMARY KEY, db_expr_table TEXT, db_acc_table TEXT)",
        "CREATE TABLE run_table (table_hid INTEGER, run_id INTEGER, base_run_id INTEGER, value_digest TEXT)",
        "CREATE TABLE entity_gen (entity_gen_hid INTEGER PRIMARY KEY, db_entity_table TEXT)",
        "CREATE TABLE entity_gen_attr (entity_gen_hid INTEGER, attr_id INTEGER)",
        "CREATE TABLE run_entity (entity_gen_hid INTEGER, run_id INTEGER, base_run_id INTEGER, value_digest TEXT)",
        "CREATE TABLE run_parameter_txt (run_id INTEGER)",
        "CREATE TABLE run_txt (run_id INTEGER)",
        "CREATE TABLE run_option (run_id INTEGER)",
        "CREATE TABLE run_progress (run_id INTEGER)",
        "CREATE TABLE t1_a (run_id INTEGER, acc_id INTEGER, sub_id INTEGER, dim0 INTEGER, acc_value REAL)",
        "CREATE TABLE t1_v (run_id INTEGER, expr_id INTEGER, dim0 INTEGER, expr_value REAL)",
        "CREATE TABLE person_g1 (run_id INTEGER, entity_key INTEGER, Sex INTEGER, Income REAL)",
    ];
    for stmt in ddl {
        sqlx::query(stmt).execute(&pool).await.expect("create fixture table");
    }
    pool
}

fn sample_table() -> OutputTable {
    OutputTable {
        table_id: 1,
        table_hid: 7,
        name: "T1".into(),
        dims: vec![Dim {
            dim_id: 0,
            name: "dim0".into(),
            type_id: 100,
            is_total: false,
            col_name: "dim0".into(),
        }],
        accs: vec![
            Acc { acc_id: 0, name: "acc0".into(), is_derived: false, src_acc: String::new(), col_name: "acc0".into() },
            Acc { acc_id: 1, name: "acc1".into(), is_derived: false, src_acc: String::new(), col_name: "acc1".into() },
        ],
        exprs: vec![],
        db_expr_table: "t1_v".into(),
        db_acc_table: "t1_a".into(),
    }
}

fn sample_model(table: OutputTable, entities: Vec<Entity>) -> Model {
    Model {
        model_id: 1,
        digest: "d".into(),
        name: "M".into(),
        types: vec![],
        params: vec![],
        tables: vec![table],
        entities,
        langs: vec![],
    }
}

fn success_run(run_id: i64, name: &str) -> Run {
    Run {
        run_id,
        run_digest: format!("digest-{run_id}"),
        run_stamp: format!("stamp-{run_id}"),
        name: name.into(),
        status: RunStatus::Success,
    }
}

fn cell_as_f64(cell: &CellValue) -> f64 {
    match cell {
        CellValue::Float(v) => *v,
        CellValue::Int(v) => *v as f64,
        other => panic!("expected numeric cell, got {other:?}"),
    }
}

fn cell_as_i64(cell: &CellValue) -> i64 {
    match cell {
        CellValue::Int(v) => *v,
        other => panic!("expected integer cell, got {other:?}"),
    }
}

/// S1 — simple aggregate over two dimension buckets.
#[tokio::test]
async fn simple_aggregate_sums_per_dimension_bucket() {
    let pool = setup_pool().await;
    let table = sample_table();
    let model = sample_model(table.clone(), vec![]);
    let facet = LiteFacet;

    sqlx::query("INSERT INTO run_lst (run_id, run_name, run_digest, status) VALUES (1, 'R1', 'd1', 's')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO table_dic (table_hid, db_expr_table, db_acc_table) VALUES (7, 't1_v', 't1_a')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_table (table_hid, run_id, base_run_id, value_digest) VALUES (7, 1, 1, 'v1')")
        .execute(&pool)
        .await
        .unwrap();
    for (dim0, acc_id, value) in [(0, 0, 1.0), (0, 1, 10.0), (1, 0, 2.0), (1, 1, 20.0)] {
        sqlx::query(&format!(
            "INSERT INTO t1_a (run_id, acc_id, sub_id, dim0, acc_value) VALUES (1, {acc_id}, 0, {dim0}, {value})"
        ))
        .execute(&pool)
        .await
        .unwrap();
    }

    let run = success_run(1, "R1");
    let expr = parse_calculation("OM_SUM(acc0 + 0.5 * acc1)").unwrap();
    let orchestrator = Orchestrator::new(&model, &facet, &pool);
    let req = ReadRequest {
        kind: ReadKind::Calculation,
        run: &run,
        name: "T1".into(),
        offset: 0,
        size: None,
        filters: vec![],
        order_by: vec![],
        calculation: Some(&expr),
        entity_gen_digest: None,
        variant_runs: vec![],
        dims: vec![],
        is_id_csv: false,
    };

    let prepared = orchestrator.prepare(&req).await.unwrap();
    let full_sql = format!("{}\n{}", prepared.cte_sql, prepared.main_sql);
    let reader = orchestrator.reader();
    let (rows, page_result) = reader.read_page(&full_sql, Page { offset: 0, size: None }).await.unwrap();

    assert!(page_result.is_last_page);
    assert_eq!(rows.len(), 2);
    for row in &rows {
        let dim0 = cell_as_i64(&row[2]);
        let calc_value = cell_as_f64(&row[3]);
        if dim0 == 0 {
            assert_eq!(calc_value, 6.0);
        } else {
            assert_eq!(calc_value, 12.0);
        }
    }
}

/// S5 — filtering on both a dimension and the calculated value.
#[tokio::test]
async fn filter_narrows_to_matching_dimension_bucket() {
    let pool = setup_pool().await;
    let table = sample_table();
    let model = sample_model(table.clone(), vec![]);
    let facet = LiteFacet;

    sqlx::query("INSERT INTO run_lst (run_id, run_name, run_digest, status) VALUES (1, 'R1', 'd1', 's')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO table_dic (table_hid, db_expr_table, db_acc_table) VALUES (7, 't1_v', 't1_a')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_table (table_hid, run_id, base_run_id, value_digest) VALUES (7, 1, 1, 'v1')")
        .execute(&pool)
        .await
        .unwrap();
    for (dim0, value) in [(0, 6.0), (1, 20.0)] {
        sqlx::query(&format!(
            "INSERT INTO t1_a (run_id, acc_id, sub_id, dim0, acc_value) VALUES (1, 0, 0, {dim0}, {value})"
        ))
        .execute(&pool)
        .await
        .unwrap();
    }

    let run = success_run(1, "R1");
    let expr = parse_calculation("OM_SUM(acc0)").unwrap();
    let orchestrator = Orchestrator::new(&model, &facet, &pool);
    let filters = vec![
        Filter { name: "dim0".into(), op: FilterOp::Eq, values: vec!["0".into()] },
        Filter { name: "calc_value".into(), op: FilterOp::Lt, values: vec!["10".into()] },
    ];
    let req = ReadRequest {
        kind: ReadKind::Calculation,
        run: &run,
        name: "T1".into(),
        offset: 0,
        size: None,
        filters,
        order_by: vec![],
        calculation: Some(&expr),
        entity_gen_digest: None,
        variant_runs: vec![],
        dims: vec![],
        is_id_csv: false,
    };

    let prepared = orchestrator.prepare(&req).await.unwrap();
    let full_sql = format!("{}\n{}", prepared.cte_sql, prepared.main_sql);
    let reader = orchestrator.reader();
    let (rows, _) = reader.read_page(&full_sql, Page { offset: 0, size: None }).await.unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(cell_as_i64(&rows[0][2]), 0);
    assert_eq!(cell_as_f64(&rows[0][3]), 6.0);
}

/// S3 — run-comparison microdata aggregation grouped by an attribute.
#[tokio::test]
async fn microdata_run_comparison_groups_by_attribute() {
    let pool = setup_pool().await;

    let generation = EntityGeneration {
        gen_hid: 1,
        gen_digest: "gd1".into(),
        attrs: vec![
            Attr { attr_id: 0, name: "Sex".into(), type_id: 100 },
            Attr { attr_id: 1, name: "Income".into(), type_id: 2 },
        ],
        db_entity_table: "person_g1".into(),
    };
    let entity = Entity {
        entity_id: 1,
        entity_hid: 1,
        name: "Person".into(),
        attrs: generation.attrs.clone(),
        generations: vec![generation],
    };
    let table = sample_table();
    let model = sample_model(table, vec![entity]);
    let facet = LiteFacet;

    sqlx::query("INSERT INTO run_lst (run_id, run_name, run_digest, status) VALUES (1, 'R1', 'd1', 's')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_lst (run_id, run_name, run_digest, status) VALUES (2, 'R2', 'd2', 's')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO entity_gen (entity_gen_hid, db_entity_table) VALUES (1, 'person_g1')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_entity (entity_gen_hid, run_id, base_run_id, value_digest) VALUES (1, 1, 1, 'e1')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_entity (entity_gen_hid, run_id, base_run_id, value_digest) VALUES (1, 2, 2, 'e2')")
        .execute(&pool)
        .await
        .unwrap();
    for (run_id, entity_key, sex, income) in [
        (1, 100, 1, 1000.0),
        (1, 101, 2, 1200.0),
        (2, 100, 1, 1100.0),
        (2, 101, 2, 1150.0),
    ] {
        sqlx::query(&format!(
            "INSERT INTO person_g1 (run_id, entity_key, Sex, Income) VALUES ({run_id}, {entity_key}, {sex}, {income})"
        ))
        .execute(&pool)
        .await
        .unwrap();
    }

    let base_run = success_run(1, "R1");
    let variant_run = success_run(2, "R2");
    let expr = parse_calculation("OM_AVG(Income[variant] - Income[base])").unwrap();
    let orchestrator = Orchestrator::new(&model, &facet, &pool);
    let req = ReadRequest {
        kind: ReadKind::MicrodataCalculation,
        run: &base_run,
        name: "Person".into(),
        offset: 0,
        size: None,
        filters: vec![],
        order_by: vec![],
        calculation: Some(&expr),
        entity_gen_digest: Some("gd1"),
        variant_runs: vec![&variant_run],
        dims: vec!["Sex".into()],
        is_id_csv: false,
    };

    let prepared = orchestrator.prepare(&req).await.unwrap();
    let full_sql = format!("{}\n{}", prepared.cte_sql, prepared.main_sql);
    let reader = orchestrator.reader();
    let (rows, _) = reader.read_page(&full_sql, Page { offset: 0, size: None }).await.unwrap();

    assert_eq!(rows.len(), 2);
    for row in &rows {
        let sex = cell_as_i64(&row[1]);
        let calc_value = cell_as_f64(&row[2]);
        if sex == 1 {
            assert_eq!(calc_value, 100.0);
        } else {
            assert_eq!(calc_value, -50.0);
        }
    }
}

/// S4 — unlinking the shared base rewrites sibling ownership and storage.
#[tokio::test]
async fn unlink_run_rebases_siblings_and_moves_storage() {
    let pool = setup_pool().await;

    sqlx::query("INSERT INTO run_lst (run_id, run_name, run_digest, status) VALUES (1, 'R1', 'd1', 's')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_lst (run_id, run_name, run_digest, status) VALUES (2, 'R2', 'd2', 's')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO table_dic (table_hid, db_expr_table, db_acc_table) VALUES (7, 't1_v', 't1_a')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_table (table_hid, run_id, base_run_id, value_digest) VALUES (7, 1, 1, 'v1')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_table (table_hid, run_id, base_run_id, value_digest) VALUES (7, 2, 1, 'v1')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO t1_a (run_id, acc_id, sub_id, dim0, acc_value) VALUES (1, 0, 0, 0, 5.0)")
        .execute(&pool)
        .await
        .unwrap();

    let deleter = RunDeleter::new(&pool);
    deleter.unlink_run(1).await.unwrap();

    let status: String = sqlx::query("SELECT status FROM run_lst WHERE run_id = 1")
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get(0)
        .unwrap();
    assert_eq!(status, "d");

    let remaining_links: i64 = sqlx::query("SELECT COUNT(*) FROM run_table WHERE table_hid = 7")
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get(0)
        .unwrap();
    assert_eq!(remaining_links, 1);

    let (run_id, base_run_id): (i64, i64) = {
        let row = sqlx::query("SELECT run_id, base_run_id FROM run_table WHERE table_hid = 7")
            .fetch_one(&pool)
            .await
            .unwrap();
        (row.try_get(0).unwrap(), row.try_get(1).unwrap())
    };
    assert_eq!(run_id, 2);
    assert_eq!(base_run_id, 2);

    let moved_value: f64 = sqlx::query("SELECT acc_value FROM t1_a WHERE run_id = 2")
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get(0)
        .unwrap();
    assert_eq!(moved_value, 5.0);

    let old_rows: i64 = sqlx::query("SELECT COUNT(*) FROM t1_a WHERE run_id = 1")
        .fetch_one(&pool)
        .await
        .unwrap()
        .try_get(0)
        .unwrap();
    assert_eq!(old_rows, 0);
}

/// Direct accumulator read, exercising the Cell Converter end to end: the
/// `acc_id` column comes back as its declared name and the enum-typed `dim0`
/// column comes back as its declared code, not raw storage ids.
#[tokio::test]
async fn direct_accumulator_read_converts_ids_to_names_and_codes() {
    let pool = setup_pool().await;
    let age_type = TypeDef {
        type_id: 100,
        name: "age_group".into(),
        enums: vec![
            EnumDef { enum_id: 0, code: "young".into(), label: "Young".into() },
            EnumDef { enum_id: 1, code: "old".into(), label: "Old".into() },
        ],
        total_enum_id: None,
    };
    let table = sample_table();
    let mut model = sample_model(table, vec![]);
    model.types.push(age_type);
    let facet = LiteFacet;

    sqlx::query("INSERT INTO run_lst (run_id, run_name, run_digest, status) VALUES (1, 'R1', 'd1', 's')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO table_dic (table_hid, db_expr_table, db_acc_table) VALUES (7, 't1_v', 't1_a')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO run_table (table_hid, run_id, base_run_id, value_digest) VALUES (7, 1, 1, 'v1')")
        .execute(&pool)
        .await
        .unwrap();
    for (acc_id, dim0, value) in [(0, 0, 1.0), (0, 1, 2.0), (1, 0, 10.0)] {
        sqlx::query(&format!(
            "INSERT INTO t1_a (run_id, acc_id, sub_id, dim0, acc_value) VALUES (1, {acc_id}, 0, {dim0}, {value})"
        ))
        .execute(&pool)
        .await
        .unwrap();
    }

    let run = success_run(1, "R1");
    let orchestrator = Orchestrator::new(&model, &facet, &pool);
    let req = ReadRequest {
        kind: ReadKind::Accumulator,
        run: &run,
        name: "T1".into(),
        offset: 0,
        size: None,
        filters: vec![],
        order_by: vec![],
        calculation: None,
        entity_gen_digest: None,
        variant_runs: vec![],
        dims: vec![],
        is_id_csv: false,
    };

    let prepared = orchestrator.prepare(&req).await.unwrap();
    assert_eq!(
        simrun_results::cell::csv_header(&prepared.header),
        vec!["acc_name", "sub_id", "dim0", "acc_value"]
    );

    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    orchestrator
        .read(&prepared, Page { offset: 0, size: None }, |row| {
            rows.push(row);
            Ok(true)
        })
        .await
        .unwrap();

    assert_eq!(rows.len(), 3);
    let first = &rows[0];
    assert_eq!(first[0], CellValue::Str("acc0".into()));
    assert_eq!(first[2], CellValue::Str("young".into()));
    assert_eq!(first[3], CellValue::Float(1.0));
}

/// S6 — a calculation containing a forbidden statement separator is rejected
/// before any SQL is built.
#[test]
fn unsafe_expression_is_rejected_before_compilation() {
    let result = parse_calculation("OM_SUM(acc0); DROP TABLE run_lst");
    assert!(matches!(result, Err(Error::UnsafeExpression(_))));
}
