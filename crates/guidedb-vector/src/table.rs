//! LanceDB connection and housekeeping helpers.
//!
//! Besides opening the database and creating tables on demand, this keeps a small
//! key/value `meta` table holding pointers such as the active cache table and the
//! model version the persisted index was built with.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use arrow_array::{RecordBatch, RecordBatchIterator, StringArray, TimestampMillisecondArray};
use arrow_schema::{Schema, SchemaRef};
use chrono::Utc;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection};

use crate::schema::{build_meta_schema, string_column};

pub const META_TABLE: &str = "meta";

pub async fn open_db(uri: &str) -> Result<Connection> { Ok(connect(uri).execute().await?) }

pub async fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    Ok(conn.table_names().execute().await?.iter().any(|n| n == name))
}

pub async fn ensure_table(conn: &Connection, name: &str, schema: Arc<Schema>) -> Result<()> {
    if table_exists(conn, name).await? {
        return Ok(());
    }
    let iter = RecordBatchIterator::new(vec![].into_iter(), schema);
    conn.create_table(name, Box::new(iter)).execute().await?;
    Ok(())
}

pub async fn table_schema(conn: &Connection, name: &str) -> Result<SchemaRef> {
    let t = conn.open_table(name).execute().await?;
    Ok(t.schema().await?)
}

pub async fn append(conn: &Connection, name: &str, schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<()> {
    if batches.is_empty() {
        return Ok(());
    }
    let t = conn.open_table(name).execute().await?;
    let reader = Box::new(RecordBatchIterator::new(batches.into_iter().map(Ok), schema));
    t.add(reader).execute().await?;
    Ok(())
}

/// Make the rows matching `scope` equal `batches`, keyed on `key`, in one commit.
///
/// Rows with a matching key are updated, new keys inserted, and rows in `scope` whose
/// key is absent from `batches` deleted.
pub async fn replace_where(conn: &Connection, name: &str, key: &str, scope: &str, schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<()> {
    let t = conn.open_table(name).execute().await?;
    let reader = Box::new(RecordBatchIterator::new(batches.into_iter().map(Ok), schema));
    let mut mi = t.merge_insert(&[key]);
    mi.when_matched_update_all(None).when_not_matched_insert_all().when_not_matched_by_source_delete(Some(scope.to_string()));
    mi.execute(reader).await?;
    Ok(())
}

pub async fn delete_where(conn: &Connection, name: &str, predicate: &str) -> Result<()> {
    let t = conn.open_table(name).execute().await?;
    t.delete(predicate).await?;
    Ok(())
}

/// Stream table `name`, optionally filtered, handing every batch to `visit`.
pub async fn scan<F>(conn: &Connection, name: &str, filter: Option<&str>, mut visit: F) -> Result<()>
where
    F: FnMut(&RecordBatch) -> Result<()>,
{
    let t = conn.open_table(name).execute().await?;
    let mut stream = match filter {
        Some(pred) => t.query().only_if(pred).execute().await?,
        None => t.query().execute().await?,
    };
    while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await? {
        visit(&batch)?;
    }
    Ok(())
}

/// Quote a string literal for a Lance SQL predicate.
pub fn sql_str(value: &str) -> String { format!("'{}'", value.replace('\'', "''")) }

/// `column IN ('a', 'b', ...)`
pub fn sql_in(column: &str, values: &[String]) -> String {
    let list: Vec<String> = values.iter().map(|v| sql_str(v)).collect();
    format!("{column} IN ({})", list.join(", "))
}

/// A new physical table name: `base` suffixed with the current time in milliseconds
/// and a per-process sequence number.
pub fn fresh_table_name(base: &str) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    format!("{base}-{}-{}", Utc::now().timestamp_millis(), SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Physical table currently standing in for the logical table `base`.
pub async fn active_table(conn: &Connection, base: &str) -> Result<String> {
    Ok(get_meta(conn, &active_key(base)).await?.unwrap_or_else(|| base.to_string()))
}

/// Point `base` at a new, empty physical table and return its name.
///
/// The abandoned table is left in place; nothing reads it once the pointer moves.
pub async fn rotate_table(conn: &Connection, base: &str, schema: Arc<Schema>) -> Result<String> {
    let fresh = fresh_table_name(base);
    ensure_table(conn, &fresh, schema).await?;
    set_meta(conn, &active_key(base), &fresh).await?;
    Ok(fresh)
}

/// Point `base` at the already populated table `table`, writing `extra` meta pairs in
/// the same commit. Readers see either the old table with the old pairs or the new
/// table with the new ones. Returns the table `base` pointed at before.
pub async fn publish_table(conn: &Connection, base: &str, table: &str, extra: &[(String, String)]) -> Result<String> {
    let previous = active_table(conn, base).await?;
    let mut pairs = vec![(active_key(base), table.to_string())];
    pairs.extend(extra.iter().cloned());
    set_meta_many(conn, &pairs).await?;
    Ok(previous)
}

fn active_key(base: &str) -> String { format!("active_table:{base}") }

pub async fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    set_meta_many(conn, &[(key.to_string(), value.to_string())]).await
}

/// Upsert several meta pairs as one commit.
pub async fn set_meta_many(conn: &Connection, pairs: &[(String, String)]) -> Result<()> {
    ensure_table(conn, META_TABLE, build_meta_schema()).await?;
    let t = conn.open_table(META_TABLE).execute().await?;
    let now = Utc::now().timestamp_millis();
    let rb = RecordBatch::try_new(
        build_meta_schema(),
        vec![
            Arc::new(StringArray::from(pairs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(pairs.iter().map(|(_, v)| v.as_str()).collect::<Vec<_>>())),
            Arc::new(TimestampMillisecondArray::from(vec![now; pairs.len()])),
        ],
    )?;
    let reader = Box::new(RecordBatchIterator::new(vec![Ok(rb)].into_iter(), build_meta_schema()));
    let mut mi = t.merge_insert(&["key"]);
    mi.when_matched_update_all(None).when_not_matched_insert_all();
    mi.execute(reader).await?;
    Ok(())
}

pub async fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    if !table_exists(conn, META_TABLE).await? {
        return Ok(None);
    }
    let mut found = None;
    scan(conn, META_TABLE, Some(&format!("key = {}", sql_str(key))), |batch| {
        if found.is_none() && batch.num_rows() > 0 {
            found = Some(string_column(batch, "value")?.value(0).to_string());
        }
        Ok(())
    })
    .await?;
    Ok(found)
}

pub fn ensure_width(expected: usize, actual: Option<usize>, table: &str) -> Result<()> {
    match actual {
        Some(w) if w == expected => Ok(()),
        Some(w) => Err(anyhow!("table {table} stores {w}-dimensional vectors, expected {expected}")),
        None => Err(anyhow!("table {table} has no usable vector column")),
    }
}
