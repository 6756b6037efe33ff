//! Tests for table merges and value merges

mod common;

use common::{actions, client, columns, result, MockDriver};
use mssql_kit::prelude::*;

/// Target `people` has an identity `id`
fn people_driver() -> MockDriver {
    let driver = MockDriver::new();
    driver
        .respond("TOP(0) * FROM [people]", columns(&["id", "name", "age", "salary"]))
        .respond("is_identity = 1", result(&["name"], vec![vec![Value::from("id")]]));
    driver
}

fn merge_statement(driver: &MockDriver) -> String {
    driver
        .statements()
        .into_iter()
        .find(|s| s.starts_with("MERGE"))
        .expect("no MERGE statement was executed")
}

// ==================== merge_tables Tests ====================

#[tokio::test]
async fn test_merge_tables_counts_actions() {
    let driver = people_driver();
    driver
        .respond("TOP(0) * FROM [people_import]", columns(&["name", "age", "salary"]))
        .respond("MERGE [people]", actions(&["INSERT", "UPDATE", "UPDATE", "DELETE"]));
    let client = client(&driver).await;

    let spec = MergeSpec::new(["name"]).delete_not_matching(true);
    let outcome = client
        .merge_tables("people_import", "people", &spec)
        .await
        .unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.updated, 2);
    assert_eq!(outcome.deleted, 1);

    let sql = merge_statement(&driver);
    assert!(sql.starts_with("MERGE [people] WITH (SERIALIZABLE) AS T"));
    assert!(sql.contains("USING [people_import] AS S"));
    assert!(sql.contains("ON T.[name] = S.[name]"));
    assert!(sql.contains("UPDATE SET T.[age] = S.[age], T.[salary] = S.[salary]"));
    assert!(sql.contains("INSERT ([name], [age], [salary]) VALUES (S.[name], S.[age], S.[salary])"));
    assert!(sql.contains("WHEN NOT MATCHED BY SOURCE THEN"));
}

#[tokio::test]
async fn test_merge_tables_leaves_identity_out_of_defaults() {
    let driver = people_driver();
    driver.respond("TOP(0) * FROM [people_copy]", columns(&["id", "name", "age", "salary"]));
    let client = client(&driver).await;

    client
        .merge_tables("people_copy", "people", &MergeSpec::new(["name"]))
        .await
        .unwrap();

    let sql = merge_statement(&driver);
    assert!(!sql.contains("T.[id] = S.[id]"));
    assert!(sql.contains("INSERT ([name], [age], [salary])"));
    assert!(!sql.contains("DELETE"));
}

#[tokio::test]
async fn test_merge_tables_explicit_fields() {
    let driver = people_driver();
    driver.respond("TOP(0) * FROM [people_import]", columns(&["name", "age", "salary"]));
    let client = client(&driver).await;

    let spec = MergeSpec::new(["name"])
        .with_update_fields(["name", "salary"])
        .with_insert_fields(["name"]);
    client
        .merge_tables("people_import", "people", &spec)
        .await
        .unwrap();

    let sql = merge_statement(&driver);
    // match fields are never updated
    assert!(sql.contains("UPDATE SET T.[salary] = S.[salary]\n"));
    assert!(sql.contains("INSERT ([name]) VALUES (S.[name])"));
}

#[tokio::test]
async fn test_merge_tables_requires_match_fields() {
    let driver = people_driver();
    let client = client(&driver).await;

    let err = client
        .merge_tables("people_import", "people", &MergeSpec::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(driver.statements().is_empty());
}

#[tokio::test]
async fn test_merge_tables_match_field_must_exist_on_both_sides() {
    let driver = people_driver();
    driver.respond("TOP(0) * FROM [people_import]", columns(&["name", "age"]));
    let client = client(&driver).await;

    let err = client
        .merge_tables("people_import", "people", &MergeSpec::new(["email"]))
        .await
        .unwrap_err();
    match &err {
        Error::Merge { target, source } => {
            assert_eq!(target, "people");
            assert!(matches!(**source, Error::InvalidArgument { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_merge_tables_statement_failure_names_target() {
    let driver = people_driver();
    driver
        .respond("TOP(0) * FROM [people_import]", columns(&["name", "age"]))
        .fail_on("MERGE [people]", "The MERGE statement attempted to UPDATE the same row more than once.");
    let client = client(&driver).await;

    let err = client
        .merge_tables("people_import", "people", &MergeSpec::new(["name"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Merge { .. }));
    assert!(matches!(err.root(), Error::Execution { .. }));
    assert!(err.to_string().starts_with("merge into people failed"));
}

#[test]
fn test_outcome_report_keys() {
    let outcome = MergeOutcome {
        inserted: 2,
        updated: 1,
        deleted: 0,
        execution_time_ms: 5,
    };
    let json = serde_json::to_value(outcome).unwrap();
    assert_eq!(json["INSERT"], 2);
    assert_eq!(json["UPDATE"], 1);
    assert_eq!(json["DELETE"], 0);
    assert_eq!(json["executionTime"], 5);
}

// ==================== merge_values Tests ====================

fn staged_driver() -> MockDriver {
    let driver = people_driver();
    driver
        .respond(
            "TOP(0) [age], [name] FROM [tmp_merge_people]",
            columns(&["age", "name"]),
        )
        .respond(
            "TOP(0) * FROM [tmp_merge_people]",
            columns(&["id", "name", "age", "salary"]),
        )
        .respond("MERGE [people]", actions(&["INSERT", "UPDATE"]));
    driver
}

fn records() -> Vec<Record> {
    vec![
        record! { "name" => "Johnny", "age" => 33 },
        record! { "name" => "Jill", "age" => 25 },
    ]
}

#[tokio::test]
async fn test_merge_values_stages_and_cleans_up() {
    let driver = staged_driver();
    let client = client(&driver).await;

    let outcome = client
        .merge_values(&records(), "people", &MergeSpec::new(["name"]))
        .await
        .unwrap();

    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.deleted, 0);
    assert_eq!(
        outcome.execution_time_ms,
        outcome.insert_execution_time_ms + outcome.merge_execution_time_ms
    );

    let statements = driver.statements();
    assert_eq!(
        statements[0],
        "IF OBJECT_ID(@P1, N'U') IS NOT NULL DROP TABLE [tmp_merge_people]"
    );
    // outer-join clone: nullable columns, no identity
    assert_eq!(
        statements[1],
        "SELECT S.* INTO [tmp_merge_people] FROM (VALUES (0)) AS D ([x]) \
         LEFT JOIN [people] AS S ON 1 = 0 WHERE 1 = 0"
    );
    assert_eq!(
        statements.last().unwrap(),
        "IF OBJECT_ID(@P1, N'U') IS NOT NULL DROP TABLE [tmp_merge_people]"
    );

    let executed = driver.executed();
    assert_eq!(executed[0].params[0].value, Value::from("tmp_merge_people"));

    let loads = driver.bulk_loads();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].table, "tmp_merge_people");
    assert_eq!(loads[0].rows.len(), 2);

    let sql = merge_statement(&driver);
    assert!(sql.contains("USING [tmp_merge_people] AS S"));
}

#[tokio::test]
async fn test_merge_values_keeps_temp_table_on_request() {
    let driver = staged_driver();
    let client = client(&driver).await;

    let spec = MergeSpec::new(["name"]).keep_temp_table(true);
    client.merge_values(&records(), "people", &spec).await.unwrap();

    let drops = driver
        .statements()
        .iter()
        .filter(|s| s.contains("DROP TABLE"))
        .count();
    assert_eq!(drops, 1);
    assert!(driver.statements().last().unwrap().starts_with("MERGE"));
}

#[tokio::test]
async fn test_merge_values_drops_staging_after_failure() {
    let driver = staged_driver();
    driver.fail_bulk("String or binary data would be truncated");
    let client = client(&driver).await;

    let err = client
        .merge_values(&records(), "people", &MergeSpec::new(["name"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BulkInsert { .. }));

    let statements = driver.statements();
    assert!(statements.iter().all(|s| !s.starts_with("MERGE")));
    assert!(statements.last().unwrap().contains("DROP TABLE [tmp_merge_people]"));
}

#[tokio::test]
async fn test_merge_values_requires_records() {
    let driver = staged_driver();
    let client = client(&driver).await;

    let err = client
        .merge_values(&[], "people", &MergeSpec::new(["name"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(driver.statements().is_empty());
}

#[test]
fn test_values_outcome_report_keys() {
    let outcome = MergeValuesOutcome {
        inserted: 1,
        updated: 2,
        deleted: 3,
        execution_time_ms: 30,
        insert_execution_time_ms: 10,
        merge_execution_time_ms: 20,
    };
    let json = serde_json::to_value(outcome).unwrap();
    assert_eq!(json["insertExecutionTime"], 10);
    assert_eq!(json["mergeExecutionTime"], 20);
    assert_eq!(json["executionTime"], 30);
}

// ==================== merge_values_inline Tests ====================

#[tokio::test]
async fn test_merge_values_inline_binds_every_value() {
    let driver = people_driver();
    driver.respond("MERGE [people]", actions(&["INSERT", "INSERT"]));
    let client = client(&driver).await;

    let outcome = client
        .merge_values_inline(&records(), "people", &MergeSpec::new(["name"]))
        .await
        .unwrap();
    assert_eq!(outcome.inserted, 2);

    let executed = driver.executed();
    let merge = executed
        .iter()
        .find(|e| e.sql.starts_with("MERGE"))
        .unwrap();
    assert!(merge
        .sql
        .contains("USING (VALUES (@P1, @P2), (@P3, @P4)) AS S ([age], [name])"));
    assert!(!merge.sql.contains("Johnny"));
    assert_eq!(merge.params.len(), 4);
    assert_eq!(merge.params[1].value, Value::from("Johnny"));
    assert!(driver.bulk_loads().is_empty());
}

#[tokio::test]
async fn test_merge_values_inline_parameter_ceiling() {
    let driver = people_driver();
    let client = client(&driver).await;

    let data: Vec<Record> = (0..1_051)
        .map(|i| record! { "name" => format!("person-{i}"), "age" => i })
        .collect();
    let err = client
        .merge_values_inline(&data, "people", &MergeSpec::new(["name"]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }));
    assert!(driver.statements().is_empty());
}
