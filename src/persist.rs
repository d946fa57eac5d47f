//! Parquet persistence for flat tables.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, DictionaryArray, Float64Array, Int32Array, Int64Array,
    StringArray,
};
use arrow::datatypes::{Field, Int32Type, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::errors::ParquetError;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use thiserror::Error;
use tracing::{error, info};

use crate::table::{FieldValue, Table};

pub const PARQUET_EXTENSION: &str = "parquet";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int,
    Float,
    Bool,
    Text,
}

#[derive(Debug, Clone)]
pub struct ParquetPersister {
    output_dir: PathBuf,
}

impl ParquetPersister {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{name}.{PARQUET_EXTENSION}"))
    }

    /// Returns `Ok(None)` without touching disk when the table is empty.
    pub fn write(&self, table: &Table, name: &str) -> Result<Option<PathBuf>, PersistError> {
        self.write_with_metadata(table, name, &[])
    }

    pub fn write_with_metadata(
        &self,
        table: &Table,
        name: &str,
        metadata: &[(String, String)],
    ) -> Result<Option<PathBuf>, PersistError> {
        let path = self.artifact_path(name);
        if table.is_empty() {
            error!(
                component = "persist",
                event = "persist.empty_table",
                path = %path.display(),
                "attempted to persist an empty table"
            );
            return Ok(None);
        }

        match write_parquet(table, name, &path, metadata) {
            Ok(()) => {
                info!(
                    component = "persist",
                    event = "persist.write.finish",
                    path = %path.display(),
                    rows = table.len(),
                    columns = table.columns().len()
                );
                Ok(Some(path))
            }
            Err(err) => {
                error!(
                    component = "persist",
                    event = "persist.write.failed",
                    path = %path.display(),
                    error = %err
                );
                Err(err)
            }
        }
    }
}

fn write_parquet(
    table: &Table,
    name: &str,
    path: &Path,
    metadata: &[(String, String)],
) -> Result<(), PersistError> {
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(PersistError::InvalidName(name.to_string()));
    }

    let batch = table_to_record_batch(table)?;
    let key_values = metadata
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
        .collect::<Vec<_>>();
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata((!key_values.is_empty()).then_some(key_values))
        .build();

    let tmp_path = path.with_file_name(format!("{name}.{PARQUET_EXTENSION}.tmp"));
    let result = (|| -> Result<(), PersistError> {
        let file = fs::File::create(&tmp_path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() && tmp_path.exists() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Categorical columns become `Dictionary(Int32, _)` over the column's own value type,
/// so category values are stored unchanged. Boolean categories stay plain booleans.
pub fn table_to_record_batch(table: &Table) -> Result<RecordBatch, PersistError> {
    let mut fields = Vec::with_capacity(table.columns().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(table.columns().len());

    for column in table.columns() {
        let kind = infer_kind(table.column_values(column));
        let cells = || table.column_values(column);
        let array: ArrayRef = if table.is_categorical(column) && kind != ColumnKind::Bool {
            match kind {
                ColumnKind::Int => {
                    let (keys, values) = dictionary_parts(cells().map(int_cell))?;
                    Arc::new(DictionaryArray::<Int32Type>::try_new(
                        keys,
                        Arc::new(Int64Array::from(values)),
                    )?)
                }
                ColumnKind::Float => {
                    let (keys, values) = dictionary_parts(cells().map(float_cell))?;
                    Arc::new(DictionaryArray::<Int32Type>::try_new(
                        keys,
                        Arc::new(Float64Array::from(values)),
                    )?)
                }
                _ => {
                    let (keys, values) = dictionary_parts(cells().map(FieldValue::render))?;
                    Arc::new(DictionaryArray::<Int32Type>::try_new(
                        keys,
                        Arc::new(StringArray::from(values)),
                    )?)
                }
            }
        } else {
            match kind {
                ColumnKind::Int => Arc::new(cells().map(int_cell).collect::<Int64Array>()),
                ColumnKind::Float => Arc::new(cells().map(float_cell).collect::<Float64Array>()),
                ColumnKind::Bool => Arc::new(cells().map(bool_cell).collect::<BooleanArray>()),
                ColumnKind::Text => {
                    Arc::new(cells().map(FieldValue::render).collect::<StringArray>())
                }
            }
        };
        fields.push(Field::new(column, array.data_type().clone(), true));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}

fn int_cell(value: &FieldValue) -> Option<i64> {
    match value {
        FieldValue::Int(int) => Some(*int),
        FieldValue::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
}

fn float_cell(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Float(float) if float.is_nan() => None,
        FieldValue::Float(float) => Some(*float),
        FieldValue::Int(int) => Some(*int as f64),
        FieldValue::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn bool_cell(value: &FieldValue) -> Option<bool> {
    match value {
        FieldValue::Bool(flag) => Some(*flag),
        _ => None,
    }
}

/// Keys into the distinct non-null values, in first-seen order.
fn dictionary_parts<T: PartialEq>(
    cells: impl Iterator<Item = Option<T>>,
) -> Result<(Int32Array, Vec<T>), ArrowError> {
    let mut values: Vec<T> = Vec::new();
    let mut keys = Vec::new();
    for cell in cells {
        let key = match cell {
            Some(value) => {
                let idx = match values.iter().position(|seen| *seen == value) {
                    Some(idx) => idx,
                    None => {
                        values.push(value);
                        values.len() - 1
                    }
                };
                Some(i32::try_from(idx).map_err(|_| ArrowError::DictionaryKeyOverflowError)?)
            }
            None => None,
        };
        keys.push(key);
    }
    Ok((Int32Array::from(keys), values))
}

fn infer_kind<'a>(values: impl Iterator<Item = &'a FieldValue>) -> ColumnKind {
    let (mut ints, mut floats, mut bools, mut texts) = (false, false, false, false);
    for value in values {
        match value {
            FieldValue::Int(_) => ints = true,
            FieldValue::Float(_) => floats = true,
            FieldValue::Bool(_) => bools = true,
            FieldValue::Text(_) => texts = true,
            FieldValue::Null => {}
        }
    }

    if texts {
        ColumnKind::Text
    } else if floats {
        ColumnKind::Float
    } else if ints {
        ColumnKind::Int
    } else if bools {
        ColumnKind::Bool
    } else {
        ColumnKind::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Row;
    use arrow::array::AsArray;
    use arrow::datatypes::{DataType, Int64Type};

    fn row(fields: &[(&str, FieldValue)]) -> Row {
        fields
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn mixed_int_and_float_columns_widen_to_float() {
        let table = Table::from_rows([
            row(&[("value", FieldValue::Int(5))]),
            row(&[("value", FieldValue::Float(5.5))]),
        ]);
        let batch = table_to_record_batch(&table).unwrap();
        assert_eq!(batch.schema().field(0).data_type(), &DataType::Float64);
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn text_anywhere_makes_the_column_text_and_all_null_defaults_to_text() {
        let table = Table::from_rows([
            row(&[("kickoff", FieldValue::Text("2024-08-16T19:00:00Z".to_string())), ("gap", FieldValue::Null)]),
            row(&[("kickoff", FieldValue::Int(1)), ("gap", FieldValue::Null)]),
        ]);
        let batch = table_to_record_batch(&table).unwrap();
        let schema = batch.schema();
        assert_eq!(schema.field_with_name("kickoff").unwrap().data_type(), &DataType::Utf8);
        assert_eq!(schema.field_with_name("gap").unwrap().data_type(), &DataType::Utf8);
    }

    #[test]
    fn categorical_columns_keep_their_value_type() {
        let mut table = Table::from_rows([
            row(&[("team", FieldValue::Int(3)), ("position", FieldValue::Text("MID".to_string()))]),
            row(&[("team", FieldValue::Null), ("position", FieldValue::Text("FWD".to_string()))]),
            row(&[("team", FieldValue::Int(3)), ("position", FieldValue::Text("MID".to_string()))]),
        ]);
        table.mark_categorical("team");
        table.mark_categorical("position");

        let batch = table_to_record_batch(&table).unwrap();

        let schema = batch.schema();
        assert_eq!(
            schema.field_with_name("team").unwrap().data_type(),
            &DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Int64))
        );
        assert_eq!(
            schema.field_with_name("position").unwrap().data_type(),
            &DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Utf8))
        );
        let team = batch.column_by_name("team").unwrap().as_dictionary::<Int32Type>();
        assert_eq!(team.values().len(), 1);
        assert_eq!(team.values().as_primitive::<Int64Type>().value(0), 3);
        assert!(team.is_null(1));
        assert_eq!(team.keys().value(2), 0);
    }

    #[test]
    fn boolean_categories_stay_plain_booleans() {
        let mut table = Table::from_rows([row(&[("was_home", FieldValue::Bool(true))])]);
        table.mark_categorical("was_home");

        let batch = table_to_record_batch(&table).unwrap();

        assert_eq!(batch.schema().field(0).data_type(), &DataType::Boolean);
    }
}
