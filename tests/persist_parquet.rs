use std::fs::{self, File};

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Int32Type, Int64Type};
use fpl_features::{FieldValue, ParquetPersister, PersistError, Row, Table};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::reader::{FileReader, SerializedFileReader};

fn training_row(element: i64, round: i64, team: i64, lag: f64) -> Row {
    let mut row = Row::new();
    row.insert("element".to_string(), FieldValue::Int(element));
    row.insert("round".to_string(), FieldValue::Int(round));
    row.insert("team".to_string(), FieldValue::Int(team));
    row.insert("kickoff_time".to_string(), FieldValue::Text("2024-08-17T14:00:00Z".to_string()));
    row.insert("total_points_lag_1".to_string(), FieldValue::Float(lag));
    row.insert("total_points_roll_3".to_string(), FieldValue::Null);
    row
}

fn sample_table() -> Table {
    let mut table = Table::from_rows([
        training_row(1, 2, 14, 5.0),
        training_row(1, 3, 14, 10.0),
        training_row(2, 2, 3, 1.0),
    ]);
    table.mark_categorical("team");
    table
}

#[test]
fn non_empty_table_round_trips_row_count() {
    let dir = tempfile::tempdir().unwrap();
    let persister = ParquetPersister::new(dir.path()).unwrap();
    let table = sample_table();

    let path = persister
        .write(&table, "training_features")
        .unwrap()
        .expect("artifact should be written");

    assert_eq!(path, dir.path().join("training_features.parquet"));
    let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
    assert_eq!(reader.metadata().file_metadata().num_rows(), table.len() as i64);
    assert!(!dir.path().join("training_features.parquet.tmp").exists());
}

#[test]
fn empty_table_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let persister = ParquetPersister::new(dir.path()).unwrap();

    let written = persister.write(&Table::new(), "training_features").unwrap();

    assert!(written.is_none());
    assert!(!persister.artifact_path("training_features").exists());
}

#[test]
fn output_directory_is_created_on_demand() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("data").join("processed");

    let persister = ParquetPersister::new(&nested).unwrap();
    persister.write(&sample_table(), "features").unwrap();

    assert!(nested.join("features.parquet").is_file());
}

#[test]
fn column_types_and_categorical_encoding_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    let persister = ParquetPersister::new(dir.path()).unwrap();
    let path = persister.write(&sample_table(), "typed").unwrap().unwrap();

    let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
        .unwrap()
        .build()
        .unwrap();
    let batches: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
    let schema = batches[0].schema();

    assert_eq!(
        schema.field_with_name("team").unwrap().data_type(),
        &DataType::Dictionary(Box::new(DataType::Int32), Box::new(DataType::Int64))
    );
    let team = batches[0]
        .column_by_name("team")
        .unwrap()
        .as_dictionary::<Int32Type>();
    let categories = team.values().as_primitive::<Int64Type>();
    let first_key = team.keys().value(0) as usize;
    let last_key = team.keys().value(2) as usize;
    assert_eq!(categories.value(first_key), 14);
    assert_eq!(categories.value(last_key), 3);
    assert_eq!(
        schema.field_with_name("element").unwrap().data_type(),
        &DataType::Int64
    );
    assert_eq!(
        schema.field_with_name("total_points_lag_1").unwrap().data_type(),
        &DataType::Float64
    );
    assert_eq!(
        schema.field_with_name("kickoff_time").unwrap().data_type(),
        &DataType::Utf8
    );
    let total_rows: usize = batches.iter().map(|batch| batch.num_rows()).sum();
    assert_eq!(total_rows, 3);
    assert_eq!(batches[0].column_by_name("total_points_roll_3").unwrap().null_count(), 3);
}

#[test]
fn key_value_metadata_is_embedded() {
    let dir = tempfile::tempdir().unwrap();
    let persister = ParquetPersister::new(dir.path()).unwrap();
    let metadata = vec![
        ("fpl.schema_version".to_string(), "1".to_string()),
        ("fpl.schema_fingerprint".to_string(), "abc123".to_string()),
    ];

    let path = persister
        .write_with_metadata(&sample_table(), "tagged", &metadata)
        .unwrap()
        .unwrap();

    let reader = SerializedFileReader::new(File::open(path).unwrap()).unwrap();
    let key_values = reader
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .cloned()
        .unwrap_or_default();
    let fingerprint = key_values
        .iter()
        .find(|kv| kv.key == "fpl.schema_fingerprint")
        .and_then(|kv| kv.value.clone());
    assert_eq!(fingerprint.as_deref(), Some("abc123"));
}

#[test]
fn rewriting_replaces_the_previous_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let persister = ParquetPersister::new(dir.path()).unwrap();
    persister.write(&sample_table(), "features").unwrap();

    let smaller = Table::from_rows([training_row(9, 4, 1, 2.0)]);
    let path = persister.write(&smaller, "features").unwrap().unwrap();

    let reader = SerializedFileReader::new(File::open(path).unwrap()).unwrap();
    assert_eq!(reader.metadata().file_metadata().num_rows(), 1);
}

#[test]
fn blocked_target_path_surfaces_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let persister = ParquetPersister::new(dir.path()).unwrap();
    fs::create_dir(persister.artifact_path("blocked")).unwrap();

    let err = persister.write(&sample_table(), "blocked").unwrap_err();

    assert!(matches!(err, PersistError::Io(_)));
    assert!(!dir.path().join("blocked.parquet.tmp").exists());
}

#[test]
fn names_with_path_separators_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let persister = ParquetPersister::new(dir.path()).unwrap();

    let err = persister.write(&sample_table(), "../escape").unwrap_err();

    assert!(matches!(err, PersistError::InvalidName(_)));
}
