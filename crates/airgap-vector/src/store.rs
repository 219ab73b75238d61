//! Snapshot persistence of a [`VectorIndex`] in LanceDB.
//!
//! Every `persist` writes the full index into a fresh generation table
//! (`{table}_v{n}`) and then, in a single meta-table commit, points
//! `active_table` at it. A crash before the flip leaves the previous snapshot
//! active.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{FixedSizeListArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use lancedb::query::ExecutableQuery;
use lancedb::Connection;
use tracing::{debug, info};

use airgap_core::types::{Chunk, IndexEntry, Meta};
use airgap_core::{Error, Result};

use crate::index::VectorIndex;
use crate::schema::{build_entries_schema, FORMAT_VERSION};
use crate::storage_err;
use crate::table::{open_db, read_meta, set_meta, string_column, table_exists};

const WRITE_BATCH: usize = 1000;

const KEY_ACTIVE: &str = "active_table";
const KEY_GENERATION: &str = "generation";
const KEY_DIMENSION: &str = "dimension";
const KEY_METRIC: &str = "metric";
const KEY_FORMAT: &str = "format_version";
const KEY_EMBEDDER: &str = "embedder_id";

/// Self-description of a persisted index, read from the meta table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub active_table: String,
    pub generation: u64,
    /// 0 while nothing has ever been added.
    pub dimension: usize,
    pub metric: String,
    pub format_version: u32,
    pub embedder_id: String,
}

impl StoreInfo {
    fn from_meta(meta: &BTreeMap<String, String>) -> Result<Option<Self>> {
        let Some(active_table) = meta.get(KEY_ACTIVE) else { return Ok(None) };
        let num = |key: &str| -> Result<u64> {
            meta.get(key)
                .map(|v| v.parse::<u64>().map_err(|e| Error::Storage(format!("meta '{key}' = {v:?}: {e}"))))
                .transpose()
                .map(|v| v.unwrap_or(0))
        };
        let format_version = num(KEY_FORMAT)? as u32;
        if format_version > FORMAT_VERSION {
            return Err(Error::Storage(format!(
                "index format {format_version} is newer than supported {FORMAT_VERSION}"
            )));
        }
        Ok(Some(Self {
            active_table: active_table.clone(),
            generation: num(KEY_GENERATION)?,
            dimension: num(KEY_DIMENSION)? as usize,
            metric: meta.get(KEY_METRIC).cloned().unwrap_or_else(|| "cosine".to_string()),
            format_version,
            embedder_id: meta.get(KEY_EMBEDDER).cloned().unwrap_or_default(),
        }))
    }
}

pub struct LanceStore {
    conn: Connection,
    table: String,
    meta_table: String,
}

impl LanceStore {
    /// Open (creating if absent) the store directory at `path`.
    pub async fn open(path: &Path, table: &str) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let conn = open_db(path.to_string_lossy().as_ref()).await?;
        Ok(Self { conn, table: table.to_string(), meta_table: format!("{table}_meta") })
    }

    pub async fn info(&self) -> Result<Option<StoreInfo>> {
        StoreInfo::from_meta(&read_meta(&self.conn, &self.meta_table).await?)
    }

    /// Write a full snapshot of `index` and make it the active generation.
    pub async fn persist(&self, index: &VectorIndex, embedder_id: &str) -> Result<StoreInfo> {
        let entries = index.snapshot();
        let dim = index.dimension().unwrap_or(0);
        let mut generation = self.info().await?.map_or(0, |i| i.generation) + 1;
        let mut name = format!("{}_v{generation}", self.table);
        // skip leftovers of an interrupted persist
        while table_exists(&self.conn, &name).await? {
            generation += 1;
            name = format!("{}_v{generation}", self.table);
        }

        let active_table = if entries.is_empty() {
            String::new()
        } else {
            let schema = build_entries_schema(dim);
            let batches = entries
                .chunks(WRITE_BATCH)
                .enumerate()
                .map(|(n, chunk)| entries_to_record_batch(chunk, n * WRITE_BATCH, dim))
                .collect::<Result<Vec<_>>>()?;
            let reader = RecordBatchIterator::new(batches.into_iter().map(Ok::<_, arrow_schema::ArrowError>), schema);
            self.conn.create_table(&name, Box::new(reader)).execute().await.map_err(storage_err)?;
            debug!("Wrote {} entries to {}", entries.len(), name);
            name
        };

        let info = StoreInfo {
            active_table,
            generation,
            dimension: dim,
            metric: "cosine".to_string(),
            format_version: FORMAT_VERSION,
            embedder_id: embedder_id.to_string(),
        };
        set_meta(
            &self.conn,
            &self.meta_table,
            &[
                (KEY_DIMENSION, info.dimension.to_string()),
                (KEY_METRIC, info.metric.clone()),
                (KEY_FORMAT, info.format_version.to_string()),
                (KEY_EMBEDDER, info.embedder_id.clone()),
                (KEY_GENERATION, info.generation.to_string()),
                (KEY_ACTIVE, info.active_table.clone()),
            ],
        )
        .await?;
        // TODO: drop generation tables older than the previous one once nothing can still be reading them
        info!("Persisted {} index entries (generation {})", entries.len(), generation);
        Ok(info)
    }

    /// Load the active snapshot; `None` when nothing was ever persisted.
    pub async fn load(&self) -> Result<Option<(VectorIndex, StoreInfo)>> {
        let Some(info) = self.info().await? else { return Ok(None) };
        let index = if info.dimension == 0 {
            VectorIndex::new()
        } else {
            VectorIndex::with_dimension(info.dimension)
        };
        if info.active_table.is_empty() {
            return Ok(Some((index, info)));
        }

        let t = self.conn.open_table(&info.active_table).execute().await.map_err(storage_err)?;
        let mut rows: Vec<(i64, IndexEntry)> = Vec::new();
        let mut stream = t.query().execute().await.map_err(storage_err)?;
        while let Some(batch) = futures::TryStreamExt::try_next(&mut stream).await.map_err(storage_err)? {
            rows.extend(record_batch_to_entries(&batch)?);
        }
        rows.sort_by_key(|(seq, _)| *seq);
        let n = rows.len();
        index.add(rows.into_iter().map(|(_, e)| e).collect())?;
        info!("Loaded {} index entries from {}", n, info.active_table);
        Ok(Some((index, info)))
    }

    /// Load for a specific embedder, refusing stores built by a different model.
    pub async fn load_for(&self, embedder_id: &str, dim: usize) -> Result<VectorIndex> {
        let Some((index, info)) = self.load().await? else { return Ok(VectorIndex::new()) };
        if info.dimension != 0 && info.dimension != dim {
            return Err(Error::DimensionMismatch { expected: info.dimension, actual: dim });
        }
        if !info.embedder_id.is_empty() && info.embedder_id != embedder_id && !index.is_empty() {
            return Err(Error::Configuration(format!(
                "index was built with '{}' but the active embedder is '{embedder_id}'; a full reindex is required",
                info.embedder_id
            )));
        }
        Ok(index)
    }
}

fn entries_to_record_batch(entries: &[IndexEntry], seq_offset: usize, dim: usize) -> Result<RecordBatch> {
    let len = |v: usize| v as i64;
    let metadata = entries
        .iter()
        .map(|e| serde_json::to_string(&e.metadata).map_err(storage_err))
        .collect::<Result<Vec<_>>>()?;
    let vectors = entries.iter().map(|e| Some(e.embedding.iter().map(|&x| Some(x)).collect::<Vec<_>>()));
    RecordBatch::try_new(
        build_entries_schema(dim),
        vec![
            Arc::new(Int64Array::from_iter_values((0..entries.len()).map(|i| len(seq_offset + i)))),
            Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.chunk.id.as_str()))),
            Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.chunk.doc_id.as_str()))),
            Arc::new(Int64Array::from_iter_values(entries.iter().map(|e| len(e.chunk.ordinal)))),
            Arc::new(StringArray::from_iter_values(entries.iter().map(|e| e.chunk.text.as_str()))),
            Arc::new(Int64Array::from_iter_values(entries.iter().map(|e| len(e.chunk.start)))),
            Arc::new(Int64Array::from_iter_values(entries.iter().map(|e| len(e.chunk.end)))),
            Arc::new(Int64Array::from_iter_values(entries.iter().map(|e| len(e.chunk.overlap_prev)))),
            Arc::new(StringArray::from(metadata)),
            Arc::new(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(vectors, dim as i32)),
        ],
    )
    .map_err(storage_err)
}

fn int_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
        .ok_or_else(|| Error::Storage(format!("column '{name}' missing or not int64")))
}

fn record_batch_to_entries(batch: &RecordBatch) -> Result<Vec<(i64, IndexEntry)>> {
    let seq = int_column(batch, "seq")?;
    let ids = string_column(batch, "id")?;
    let doc_ids = string_column(batch, "doc_id")?;
    let ordinals = int_column(batch, "ordinal")?;
    let texts = string_column(batch, "text")?;
    let starts = int_column(batch, "start")?;
    let ends = int_column(batch, "end")?;
    let overlaps = int_column(batch, "overlap_prev")?;
    let metadata = string_column(batch, "metadata")?;
    let vectors = batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .ok_or_else(|| Error::Storage("column 'vector' missing".to_string()))?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let meta: Meta = serde_json::from_str(metadata.value(i)).map_err(storage_err)?;
        let list = vectors.value(i);
        let embedding = list.as_primitive::<Float32Type>().values().to_vec();
        out.push((
            seq.value(i),
            IndexEntry {
                chunk: Chunk {
                    id: ids.value(i).to_string(),
                    doc_id: doc_ids.value(i).to_string(),
                    ordinal: ordinals.value(i) as usize,
                    text: texts.value(i).to_string(),
                    start: starts.value(i) as usize,
                    end: ends.value(i) as usize,
                    overlap_prev: overlaps.value(i) as usize,
                },
                embedding,
                metadata: meta,
            },
        ));
    }
    Ok(out)
}
