// ABOUTME: End-to-end replication tests against the in-memory store and fake org
// ABOUTME: Covers schema evolution, watermarks, batching, rollback and keep-going runs

mod common;

use chrono::{Duration, SubsecRound, Utc};
use common::{extractor, object, remote_time, FakeOrg, MemoryStore};
use force_replicator::schema::StorageColumn;
use force_replicator::store::{RelationalStore, ValueTuple};
use force_replicator::sync::{upsert_rows, Replicator, RunContext};
use force_replicator::ReplicationError;

fn seeded_account_org() -> FakeOrg {
    let org = FakeOrg::new().with_account();
    org.upsert_record(
        "account",
        &[
            ("id", "001A"),
            ("name", "Acme"),
            ("industry", "Energy"),
            ("annualrevenue", "1000"),
            ("isdeleted", "false"),
            ("lastmodifieddate", "2024-01-05T10:00:00.000Z"),
        ],
    );
    org.upsert_record(
        "account",
        &[
            ("id", "001B"),
            ("name", "O'Brien Ltd"),
            ("industry", ""),
            ("annualrevenue", ""),
            ("isdeleted", "true"),
            ("lastmodifieddate", "2024-01-06T08:30:00.000Z"),
        ],
    );
    org.upsert_record(
        "account",
        &[
            ("id", "001C"),
            ("name", "Globex"),
            ("industry", "Media"),
            ("annualrevenue", "250.5"),
            ("isdeleted", "false"),
            ("lastmodifieddate", "2024-01-07T12:00:00.000Z"),
        ],
    );
    org
}

fn contact_org(org: FakeOrg) -> FakeOrg {
    let org = org.with_object(
        "contact",
        &[
            ("Id", "id", 18, 0, 0),
            ("LastName", "string", 80, 0, 0),
            ("Email", "email", 80, 0, 0),
            ("LastModifiedDate", "datetime", 0, 0, 0),
        ],
    );
    org.upsert_record(
        "contact",
        &[
            ("id", "003A"),
            ("lastname", "Smith"),
            ("email", "smith@example.com"),
            ("lastmodifieddate", "2024-02-01T09:00:00.000Z"),
        ],
    );
    org
}

#[tokio::test]
async fn test_account_first_and_incremental_run() {
    let context = RunContext::new(vec![object("Account", &["Name", "Industry"])], 10_000);
    let mut replicator = Replicator::new(context, extractor(seeded_account_org()), MemoryStore::new());

    let started = Utc::now().trunc_subsecs(0);
    let stats = replicator.run().await.unwrap();
    let finished = Utc::now().trunc_subsecs(0);
    assert!(stats.is_success());
    assert_eq!(stats.objects_synced, 1);
    assert_eq!(stats.rows_synced, 3);

    let store = replicator.store();
    assert_eq!(
        store.column_names("account"),
        vec!["id", "industry", "lastmodifieddate", "name"]
    );
    assert_eq!(store.ddl.len(), 1);
    assert_eq!(store.row_count("account"), 3);

    let acme = store.row("account", "001A").unwrap();
    assert_eq!(acme["name"], "'Acme'");
    assert_eq!(acme["industry"], "'Energy'");
    assert_eq!(acme["lastmodifieddate"], "'2024-01-05 10:00:00'");
    let obrien = store.row("account", "001B").unwrap();
    assert_eq!(obrien["name"], r"'O\'Brien Ltd'");
    assert_eq!(obrien["industry"], "''");

    // The watermark is the run start, to the second
    let first_watermark = store.history("account");
    assert_eq!(first_watermark.len(), 1);
    assert!(first_watermark[0] >= started && first_watermark[0] <= finished);
    assert_eq!(first_watermark[0].timestamp_subsec_nanos(), 0);

    let org = replicator.service().api();
    assert_eq!(
        org.queries.lock().unwrap()[0],
        "SELECT id, lastmodifieddate, name, industry FROM account"
    );

    // Change one record after the first run
    let modified = remote_time(Utc::now() + Duration::minutes(5));
    org.upsert_record(
        "account",
        &[("id", "001A"), ("industry", "Finance"), ("lastmodifieddate", &modified)],
    );

    let stats = replicator.run().await.unwrap();
    assert_eq!(stats.rows_synced, 1);

    let org = replicator.service().api();
    assert_eq!(org.describe_calls.lock().unwrap().len(), 1);
    assert!(org.queries.lock().unwrap()[1].contains("WHERE LastModifiedDate >= "));

    let store = replicator.store();
    assert_eq!(store.row_count("account"), 3);
    assert_eq!(store.row("account", "001A").unwrap()["industry"], "'Finance'");
    assert_eq!(store.row("account", "001B").unwrap()["name"], r"'O\'Brien Ltd'");

    let history = store.history("account");
    assert_eq!(history.len(), 2);
    assert!(history[1] >= history[0]);
    assert_eq!(history[0], first_watermark[0]);

    let (_, mut store) = replicator.into_parts();
    assert_eq!(
        store.most_recent_sync("account").await.unwrap(),
        Some(history[1])
    );
}

#[tokio::test]
async fn test_no_new_data_keeps_watermark() {
    let context = RunContext::new(vec![object("account", &["name"])], 10_000);
    let mut replicator = Replicator::new(context, extractor(seeded_account_org()), MemoryStore::new());

    replicator.run().await.unwrap();
    let before = replicator.store().history("account");
    assert_eq!(before.len(), 1);

    let stats = replicator.run().await.unwrap();
    assert!(stats.is_success());
    assert_eq!(stats.objects_synced, 0);
    assert_eq!(stats.objects_without_data, 1);
    assert_eq!(replicator.store().history("account"), before);
}

#[tokio::test]
async fn test_empty_object_records_no_history() {
    let org = FakeOrg::new().with_account();
    let context = RunContext::new(vec![object("account", &["name"])], 10_000);
    let mut replicator = Replicator::new(context, extractor(org), MemoryStore::new());

    let stats = replicator.run().await.unwrap();
    assert_eq!(stats.objects_without_data, 1);

    let store = replicator.store();
    assert!(store.table("account").is_some());
    assert!(store.history("account").is_empty());
    assert_eq!(store.upsert_calls, 0);
}

#[tokio::test]
async fn test_field_mismatch_applies_no_ddl() {
    let org = contact_org(seeded_account_org());
    let context = RunContext::new(
        vec![
            object("account", &["name", "rating"]),
            object("contact", &["lastname", "phone"]),
        ],
        10_000,
    );
    let mut replicator = Replicator::new(context, extractor(org), MemoryStore::new());

    let err = replicator.run().await.unwrap_err();
    match err.downcast_ref::<ReplicationError>() {
        Some(ReplicationError::FieldMismatch { fields }) => {
            assert_eq!(fields, &vec!["account.rating".to_string(), "contact.phone".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let store = replicator.store();
    assert!(store.ddl.is_empty());
    assert!(store.table("account").is_none());
    assert!(replicator.service().api().queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_schema_only_grows() {
    let context = RunContext::new(vec![object("account", &["name"])], 10_000);
    let mut replicator = Replicator::new(context, extractor(seeded_account_org()), MemoryStore::new());
    replicator.run().await.unwrap();
    assert_eq!(
        replicator.store().column_names("account"),
        vec!["id", "lastmodifieddate", "name"]
    );

    let (service, store) = replicator.into_parts();
    let context = RunContext::new(
        vec![object("account", &["name", "industry", "annualrevenue"])],
        10_000,
    );
    let mut replicator = Replicator::new(context, service, store);
    replicator.run().await.unwrap();

    let store = replicator.store();
    assert_eq!(store.ddl.len(), 2);
    assert_eq!(
        store.ddl[1],
        "ALTER TABLE `account` ADD COLUMN `industry` VARCHAR(40), ADD COLUMN `annualrevenue` DECIMAL(18,0)"
    );
    assert_eq!(
        store.column_names("account"),
        vec!["annualrevenue", "id", "industry", "lastmodifieddate", "name"]
    );
    assert_eq!(store.row("account", "001C").unwrap()["name"], "'Globex'");
}

#[tokio::test]
async fn test_all_fields_object() {
    let context = RunContext::new(vec![object("Account", &["*"])], 10_000);
    let mut replicator = Replicator::new(context, extractor(seeded_account_org()), MemoryStore::new());
    replicator.run().await.unwrap();

    assert_eq!(
        replicator.service().api().queries.lock().unwrap()[0],
        "SELECT id, lastmodifieddate, isdeleted, name, industry, annualrevenue FROM account"
    );

    let store = replicator.store();
    assert_eq!(store.column_names("account").len(), 6);
    let obrien = store.row("account", "001B").unwrap();
    assert_eq!(obrien["isdeleted"], "1");
    assert_eq!(obrien["annualrevenue"], "NULL");
    let globex = store.row("account", "001C").unwrap();
    assert_eq!(globex["isdeleted"], "0");
    assert_eq!(globex["annualrevenue"], "250.5");
}

#[tokio::test]
async fn test_bad_row_rolls_back_object() {
    let org = seeded_account_org();
    org.upsert_record("account", &[("id", "001C"), ("annualrevenue", "12abc")]);

    let context = RunContext::new(vec![object("account", &["name", "annualrevenue"])], 1);
    let mut replicator = Replicator::new(context, extractor(org), MemoryStore::new());

    let err = replicator.run().await.unwrap_err();
    match err.downcast_ref::<ReplicationError>() {
        Some(ReplicationError::RowParse { object, row, .. }) => {
            assert_eq!(object, "account");
            assert_eq!(*row, 3);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let store = replicator.store();
    assert_eq!(store.upsert_calls, 2);
    assert_eq!(store.row_count("account"), 0);
    assert!(store.history("account").is_empty());
    assert_eq!(store.transaction_depth(), 0);
    assert_eq!(store.rollbacks, 1);
}

#[tokio::test]
async fn test_failed_upsert_rolls_back_history() {
    let context = RunContext::new(vec![object("account", &["name"])], 2);
    let mut store = MemoryStore::new();
    store.fail_upsert_call = Some(2);
    let mut replicator = Replicator::new(context, extractor(seeded_account_org()), store);

    assert!(replicator.run().await.is_err());

    let store = replicator.store();
    assert_eq!(store.row_count("account"), 0);
    assert!(store.history("account").is_empty());
    assert_eq!(store.transaction_depth(), 0);
}

#[tokio::test]
async fn test_keep_going_continues_after_object_failure() {
    let org = contact_org(seeded_account_org());
    org.upsert_record("account", &[("id", "001B"), ("annualrevenue", "n/a")]);

    let context = RunContext::new(
        vec![
            object("account", &["name", "annualrevenue"]),
            object("contact", &["lastname", "email"]),
        ],
        10_000,
    )
    .keep_going(true);
    let mut replicator = Replicator::new(context, extractor(org), MemoryStore::new());

    let stats = replicator.run().await.unwrap();
    assert!(!stats.is_success());
    assert_eq!(stats.errors.len(), 1);
    assert!(stats.errors[0].contains("account"));
    assert_eq!(stats.objects_synced, 1);

    let store = replicator.store();
    assert_eq!(store.row_count("account"), 0);
    assert_eq!(store.row_count("contact"), 1);
    assert_eq!(
        store.row("contact", "003A").unwrap()["email"],
        "'smith@example.com'"
    );
}

#[tokio::test]
async fn test_failed_job_aborts_run_by_default() {
    let org = contact_org(seeded_account_org());
    org.fail_jobs_for("account");

    let context = RunContext::new(
        vec![object("account", &["name"]), object("contact", &["lastname"])],
        10_000,
    );
    let mut replicator = Replicator::new(context, extractor(org), MemoryStore::new());

    let err = replicator.run().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ReplicationError>(),
        Some(ReplicationError::JobFailed { .. })
    ));
    assert_eq!(replicator.store().row_count("contact"), 0);
    assert_eq!(replicator.service().api().queries.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_rerun_of_same_window_is_idempotent() {
    let org = seeded_account_org();
    let future = remote_time(Utc::now() + Duration::hours(1));
    for id in ["001A", "001B", "001C"] {
        org.upsert_record("account", &[("id", id), ("lastmodifieddate", &future)]);
    }

    let context = RunContext::new(vec![object("account", &["name", "industry"])], 2);
    let mut replicator = Replicator::new(context, extractor(org), MemoryStore::new());

    replicator.run().await.unwrap();
    let after_first = replicator.store().table("account").cloned();
    let stats = replicator.run().await.unwrap();

    assert_eq!(stats.rows_synced, 3);
    assert_eq!(replicator.store().table("account").cloned(), after_first);
    assert_eq!(replicator.store().history("account").len(), 2);
}

#[tokio::test]
async fn test_batches_follow_configured_size() {
    let org = seeded_account_org();
    let mut account = object("account", &["name"]);
    account.batch_size = Some(2);
    let context = RunContext::new(vec![account], 10_000);
    let mut replicator = Replicator::new(context, extractor(org), MemoryStore::new());

    let stats = replicator.run().await.unwrap();
    assert_eq!(stats.batches_written, 2);
    assert_eq!(replicator.store().upsert_calls, 2);
}

async fn store_with_account_table() -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .create_table(
            "account",
            &[
                StorageColumn::new("id", "VARCHAR(18)"),
                StorageColumn::new("name", "VARCHAR(80)"),
            ],
        )
        .await
        .unwrap();
    store
}

fn account_tuples(count: usize) -> Vec<ValueTuple> {
    (0..count)
        .map(|i| ValueTuple::new(vec![format!("'{:03}'", i), format!("'name {}'", i)]))
        .collect()
}

#[tokio::test]
async fn test_upsert_partitioning() {
    for (rows, batch_size, expected_calls) in [(25, 10, 3), (20, 10, 2), (1, 10, 1), (7, 1, 7)] {
        let mut store = store_with_account_table().await;
        let columns = vec!["id".to_string(), "name".to_string()];

        let summary = upsert_rows(
            &mut store,
            "account",
            columns,
            account_tuples(rows),
            batch_size,
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(summary.batches, expected_calls as u64);
        assert_eq!(summary.rows, rows as u64);
        assert_eq!(store.upsert_calls, expected_calls);
        assert_eq!(store.row_count("account"), rows);
        assert_eq!(store.history("account").len(), 1);
        assert_eq!(store.commits, 1);
    }
}

#[tokio::test]
async fn test_upsert_without_rows_writes_nothing() {
    let mut store = store_with_account_table().await;

    let summary = upsert_rows(
        &mut store,
        "account",
        vec!["id".to_string(), "name".to_string()],
        Vec::new(),
        10,
        Utc::now(),
    )
    .await
    .unwrap();

    assert!(!summary.watermark_recorded);
    assert_eq!(store.upsert_calls, 0);
    assert!(store.history("account").is_empty());
    assert_eq!(store.transaction_depth(), 0);
}

#[tokio::test]
async fn test_upsert_twice_is_idempotent() {
    let mut store = store_with_account_table().await;
    let columns = vec!["id".to_string(), "name".to_string()];
    let started = Utc::now();

    upsert_rows(&mut store, "account", columns.clone(), account_tuples(5), 2, started)
        .await
        .unwrap();
    let first = store.table("account").cloned();
    upsert_rows(&mut store, "account", columns, account_tuples(5), 3, started)
        .await
        .unwrap();

    assert_eq!(store.table("account").cloned(), first);
}
