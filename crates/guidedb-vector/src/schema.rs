use std::sync::Arc;

use anyhow::{anyhow, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema, TimeUnit};

pub fn vector_field(dim: usize) -> Result<Field> {
    let width = i32::try_from(dim).map_err(|_| anyhow!("vector dimension {dim} does not fit the arrow schema"))?;
    Ok(Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), width), true))
}

/// `(content_hash, model_version) -> vector` rows of the embedding cache.
pub fn build_cache_schema(dim: usize) -> Result<Arc<Schema>> {
    Ok(Arc::new(Schema::new(vec![
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("model_version", DataType::Utf8, false),
        Field::new("created_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
        vector_field(dim)?,
    ])))
}

/// One row per live chunk of the vector index.
pub fn build_index_schema(dim: usize) -> Result<Arc<Schema>> {
    Ok(Arc::new(Schema::new(vec![
        Field::new("chunk_id", DataType::Utf8, false),
        Field::new("guide_id", DataType::Utf8, false),
        Field::new("game_id", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("model_version", DataType::Utf8, false),
        vector_field(dim)?,
    ])))
}

pub fn build_meta_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("value", DataType::Utf8, false),
        Field::new("updated_at", DataType::Timestamp(TimeUnit::Millisecond, None), false),
    ]))
}

/// Width of the `vector` column, if the schema has a well-formed one.
pub fn vector_width(schema: &Schema) -> Option<usize> {
    match schema.field_with_name("vector").ok()?.data_type() {
        DataType::FixedSizeList(item, width) if item.data_type() == &DataType::Float32 => usize::try_from(*width).ok(),
        _ => None,
    }
}

pub fn vectors_array<'a>(rows: impl Iterator<Item = &'a [f32]>, dim: usize) -> Result<FixedSizeListArray> {
    let width = i32::try_from(dim)?;
    let values: Vec<Option<Vec<Option<f32>>>> = rows.map(|v| Some(v.iter().copied().map(Some).collect())).collect();
    Ok(FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(values, width))
}

pub fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow!("{name} column missing or not utf8"))
}

pub fn vector_column<'a>(batch: &'a RecordBatch) -> Result<&'a FixedSizeListArray> {
    batch
        .column_by_name("vector")
        .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
        .ok_or_else(|| anyhow!("vector column missing or not a fixed-size list"))
}

/// Row `i` of a vector column; `None` for null rows.
pub fn read_vector(col: &FixedSizeListArray, i: usize) -> Option<Vec<f32>> {
    if col.is_null(i) {
        return None;
    }
    Some(col.value(i).as_primitive::<Float32Type>().values().to_vec())
}
