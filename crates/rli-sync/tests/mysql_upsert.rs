// Runs against a live MySQL configured through MYSQL_* variables:
//   cargo test -p rli-sync --test mysql_upsert -- --ignored

use rli_core::RawListingRecord;
use rli_sync::{run_migrations, MySqlRawListingStore, RawListingStore, SyncConfig};
use serde_json::json;
use sqlx::Row;
use uuid::Uuid;

async fn fetch_row(store: &MySqlRawListingStore, id: &str) -> Option<(String, String, String)> {
    sqlx::query("SELECT source, payload, status FROM raw_listing WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await
        .expect("select raw_listing")
        .map(|row| (row.get("source"), row.get("payload"), row.get("status")))
}

#[tokio::test]
#[ignore = "needs a running MySQL"]
async fn upsert_refreshes_payload_and_keeps_source() {
    let config = SyncConfig::from_env();
    run_migrations(&config.database).await.expect("migrate");

    let id = format!("it-{}", Uuid::new_v4());
    let first_item = json!({"id": id, "source": "feed-a", "v": 1});
    let first = RawListingRecord::from_item(&first_item, "target")
        .expect("record")
        .expect("has id");
    let second = RawListingRecord::from_item(&json!({"id": id, "v": 2}), "target")
        .expect("record")
        .expect("has id");

    let mut store = MySqlRawListingStore::connect(&config.database).await.expect("connect");
    store.begin().await.expect("begin");
    store.upsert(&first).await.expect("first upsert");
    store.upsert(&second).await.expect("second upsert");
    store.commit().await.expect("commit");

    let (source, payload, status) = fetch_row(&store, &id).await.expect("row exists");
    assert_eq!(source, "feed-a");
    assert_eq!(status, "OK");
    assert_eq!(payload, second.payload);

    store.close().await.expect("close");
}

#[tokio::test]
#[ignore = "needs a running MySQL"]
async fn rollback_discards_uncommitted_upserts() {
    let config = SyncConfig::from_env();
    run_migrations(&config.database).await.expect("migrate");

    let id = format!("it-{}", Uuid::new_v4());
    let record = RawListingRecord::from_item(&json!({"uuid": id}), "target")
        .expect("record")
        .expect("has id");

    let mut store = MySqlRawListingStore::connect(&config.database).await.expect("connect");
    store.begin().await.expect("begin");
    store.upsert(&record).await.expect("upsert");
    store.rollback().await.expect("rollback");

    assert!(fetch_row(&store, &id).await.is_none());
    store.close().await.expect("close");
}
