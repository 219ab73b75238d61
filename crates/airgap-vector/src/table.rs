//! LanceDB connection and housekeeping helpers.
//!
//! Database open, create-if-absent tables, and a key/value meta table that
//! holds the active snapshot pointer next to the store's self-description.
use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_array::{RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray};
use chrono::Utc;
use lancedb::query::ExecutableQuery;
use lancedb::{connect, Connection};

use airgap_core::{Error, Result};

use crate::schema::build_meta_schema;
use crate::storage_err;

pub async fn open_db(uri: &str) -> Result<Connection> {
    connect(uri).execute().await.map_err(storage_err)
}

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let names = conn.table_names().execute().await.map_err(storage_err)?;
    Ok(names.iter().any(|n| n == name))
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<arrow_schema::Schema>) -> Result<()> {
    if table_exists(conn, name).await? {
        return Ok(());
    }
    // create empty table with 0 rows
    let iter = RecordBatchIterator::new(vec![].into_iter(), schema.clone());
    conn.create_table(name, Box::new(iter)).execute().await.map_err(storage_err)?;
    Ok(())
}

/// Upsert several keys in one commit so readers never see half of them.
pub async fn set_meta(conn: &Connection, table: &str, pairs: &[(&str, String)]) -> Result<()> {
    if pairs.is_empty() {
        return Ok(());
    }
    ensure_table(conn, table, build_meta_schema()).await?;
    let t = conn.open_table(table).execute().await.map_err(storage_err)?;
    let now = Utc::now().timestamp_millis();
    let rb = RecordBatch::try_new(
        build_meta_schema(),
        vec![
            Arc::new(StringArray::from(pairs.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(pairs.iter().map(|(_, v)| v.clone()).collect::<Vec<_>>())),
            Arc::new(TimestampMillisecondArray::from(vec![now; pairs.len()])),
        ],
    )
    .map_err(storage_err)?;
    let reader = Box::new(RecordBatchIterator::new(vec![Ok(rb)].into_iter(), build_meta_schema()));
    // key is unique
    let mut mi = t.merge_insert(&["key"]);
    mi.when_matched_update_all(None).when_not_matched_insert_all();
    mi.execute(reader).await.map_err(storage_err)?;
    Ok(())
}

/// Every key/value pair in the meta table; empty when the table does not exist.
pub async fn read_meta(conn: &Connection, table: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if !table_exists(conn, table).await? {
        return Ok(out);
    }
    let t = conn.open_table(table).execute().await.map_err(storage_err)?;
    let mut stream = t.query().execute().await.map_err(storage_err)?;
    while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await.map_err(storage_err)? {
        let keys = string_column(&batch, "key")?;
        let values = string_column(&batch, "value")?;
        for i in 0..batch.num_rows() {
            out.insert(keys.value(i).to_string(), values.value(i).to_string());
        }
    }
    Ok(out)
}

pub(crate) fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::Storage(format!("column '{name}' missing or not utf8")))
}
