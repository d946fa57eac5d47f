//! In-memory flat table shared by the flattener, feature engine and persister.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Null,
}

impl FieldValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(int) => Self::Int(int),
                None => number.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            Value::String(text) => Self::Text(text.clone()),
            Value::Array(_) | Value::Object(_) => Self::Text(value.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view used for tracked statistics. Numeric strings are parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(int) => Some(*int as f64),
            Self::Float(float) if float.is_nan() => None,
            Self::Float(float) => Some(*float),
            Self::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            Self::Text(text) => text.trim().parse::<f64>().ok().filter(|v| !v.is_nan()),
            Self::Null => None,
        }
    }

    /// Integer view used for entity and round keys.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(int) => Some(*int),
            Self::Float(float) if float.fract() == 0.0 && float.is_finite() => Some(*float as i64),
            Self::Text(text) => text.trim().parse::<i64>().ok(),
            Self::Float(_) | Self::Bool(_) | Self::Null => None,
        }
    }

    pub fn from_option_f64(value: Option<f64>) -> Self {
        value.map(Self::Float).unwrap_or(Self::Null)
    }

    pub fn render(&self) -> Option<String> {
        match self {
            Self::Int(int) => Some(int.to_string()),
            Self::Float(float) => Some(float.to_string()),
            Self::Bool(flag) => Some(flag.to_string()),
            Self::Text(text) => Some(text.clone()),
            Self::Null => None,
        }
    }
}

pub type Row = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    categorical: BTreeSet<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Appends a row, registering unseen columns in first-seen order.
    pub fn push_row(&mut self, row: Row) {
        for name in row.keys() {
            self.ensure_column(name);
        }
        self.rows.push(row);
    }

    pub fn ensure_column(&mut self, name: &str) {
        if !self.has_column(name) {
            self.columns.push(name.to_string());
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column == name)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Missing cells read as `Null`.
    pub fn value(&self, row: usize, column: &str) -> &FieldValue {
        self.rows
            .get(row)
            .and_then(|fields| fields.get(column))
            .unwrap_or(&FieldValue::Null)
    }

    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a FieldValue> + 'a {
        self.rows
            .iter()
            .map(move |row| row.get(column).unwrap_or(&FieldValue::Null))
    }

    /// Declares a column categorical. Only the declared type changes, never the values.
    pub fn mark_categorical(&mut self, column: &str) -> bool {
        if !self.has_column(column) {
            return false;
        }
        self.categorical.insert(column.to_string());
        true
    }

    pub fn is_categorical(&self, column: &str) -> bool {
        self.categorical.contains(column)
    }

    pub fn categorical_columns(&self) -> impl Iterator<Item = &str> {
        self.categorical.iter().map(String::as_str)
    }

    pub(crate) fn with_layout(columns: Vec<String>, categorical: BTreeSet<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            categorical,
            rows,
        }
    }

    pub(crate) fn layout(&self) -> (Vec<String>, BTreeSet<String>) {
        (self.columns.clone(), self.categorical.clone())
    }
}
