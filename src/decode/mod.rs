//! Columnar result decoding.
//!
//! Each `data-chunk` payload from the engine host is a self-contained Arrow
//! IPC stream holding one record batch. Decoding parses the buffer into a
//! typed batch and then applies the active coercion configuration:
//!
//! - millisecond timestamps become dates when `cast_timestamp_to_date64` is
//!   set; the byte layout is identical, so only the logical type tag
//!   changes and no values are copied,
//! - 64-bit integers become doubles when `cast_bigint_to_double` is set
//!   (value-converting, via the cast kernel).
//!
//! A coercion flag that meets a column it cannot handle (e.g. a
//! non-millisecond timestamp) is a configuration error at decode time, not
//! a silent pass-through.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::{make_array, Array, ArrayRef};
use arrow::compute;
use arrow::datatypes::{DataType, Schema, SchemaRef, TimeUnit};
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;

use crate::config::QueryConfig;
use crate::error::{BridgeError, BridgeResult};

/// Decode one IPC buffer into a record batch, applying active coercions.
pub fn decode_batch(buffer: &[u8], config: &QueryConfig) -> BridgeResult<RecordBatch> {
    let mut reader = StreamReader::try_new(Cursor::new(buffer), None)?;
    let batch = reader
        .next()
        .transpose()?
        .ok_or_else(|| BridgeError::protocol("data chunk contained no record batch"))?;
    if reader.next().is_some() {
        return Err(BridgeError::protocol(
            "data chunk contained more than one record batch",
        ));
    }
    patch_batch(batch, config)
}

/// Rewrite a schema according to the active coercions.
///
/// Returns the input schema untouched when nothing applies.
pub fn patch_schema(schema: &SchemaRef, config: &QueryConfig) -> BridgeResult<SchemaRef> {
    if !config.has_any_cast() {
        return Ok(schema.clone());
    }

    let mut changed = false;
    let mut fields = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        match coerced_type(field.data_type(), config)? {
            Some(target) => {
                changed = true;
                fields.push(Arc::new(field.as_ref().clone().with_data_type(target)));
            }
            None => fields.push(field.clone()),
        }
    }

    if changed {
        Ok(Arc::new(Schema::new_with_metadata(
            fields,
            schema.metadata().clone(),
        )))
    } else {
        Ok(schema.clone())
    }
}

/// Apply active coercions to a decoded batch.
pub fn patch_batch(batch: RecordBatch, config: &QueryConfig) -> BridgeResult<RecordBatch> {
    if !config.has_any_cast() {
        return Ok(batch);
    }
    let schema = patch_schema(&batch.schema(), config)?;
    if schema == batch.schema() {
        return Ok(batch);
    }

    let mut columns = Vec::with_capacity(batch.num_columns());
    for column in batch.columns() {
        columns.push(patch_column(column, config)?);
    }
    RecordBatch::try_new(schema, columns).map_err(BridgeError::from)
}

/// Target type for a coerced column, `None` when the column is untouched.
fn coerced_type(data_type: &DataType, config: &QueryConfig) -> BridgeResult<Option<DataType>> {
    match data_type {
        DataType::Timestamp(unit, _) if config.cast_timestamp_to_date64 => match unit {
            TimeUnit::Millisecond => Ok(Some(DataType::Date64)),
            other => Err(BridgeError::Config(format!(
                "castTimestampToDate64 does not support {:?} timestamps",
                other
            ))),
        },
        DataType::Int64 | DataType::UInt64 if config.cast_bigint_to_double => {
            Ok(Some(DataType::Float64))
        }
        _ => Ok(None),
    }
}

fn patch_column(column: &ArrayRef, config: &QueryConfig) -> BridgeResult<ArrayRef> {
    match coerced_type(column.data_type(), config)? {
        None => Ok(column.clone()),
        Some(DataType::Date64) => {
            // Millisecond timestamps and Date64 share an 8-byte layout;
            // retag the existing buffers instead of copying.
            let data = column
                .to_data()
                .into_builder()
                .data_type(DataType::Date64)
                .build()
                .map_err(BridgeError::from)?;
            Ok(make_array(data))
        }
        Some(target) => compute::cast(column, &target).map_err(BridgeError::from),
    }
}

/// Downcast a result column to a concrete Arrow array type.
///
/// The decode path is shape-agnostic; this is the call-site typed view over
/// a self-describing batch.
pub fn column_as<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    index: usize,
) -> BridgeResult<&'a T> {
    let column = batch.columns().get(index).ok_or_else(|| {
        BridgeError::TypeMismatch(format!(
            "no column at index {} (batch has {})",
            index,
            batch.num_columns()
        ))
    })?;
    column.as_any().downcast_ref::<T>().ok_or_else(|| {
        BridgeError::TypeMismatch(format!(
            "column {} has type {:?}",
            index,
            column.data_type()
        ))
    })
}
