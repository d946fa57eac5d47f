//! Nested per-entity history payloads to one flat per-round table.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{info, warn};

use crate::ingest::{Catalog, EntityId};
use crate::table::{FieldValue, Row, Table};

pub const HISTORY_FIELD: &str = "history";

pub fn flatten_histories<'a>(records: impl IntoIterator<Item = &'a Value>) -> Table {
    let mut table = Table::new();
    let mut contributing_records = 0usize;

    for record in records {
        let Some(history) = record.get(HISTORY_FIELD).and_then(Value::as_array) else {
            continue;
        };
        if history.is_empty() {
            continue;
        }

        contributing_records += 1;
        for entry in history {
            let Some(fields) = entry.as_object() else {
                continue;
            };
            // payload field order, not row key order, defines the column order
            for name in fields.keys() {
                table.ensure_column(name);
            }
            let row: Row = fields
                .iter()
                .map(|(name, value)| (name.clone(), FieldValue::from_json(value)))
                .collect();
            table.push_row(row);
        }
    }

    if table.is_empty() {
        warn!(
            component = "flatten",
            event = "flatten.empty_input",
            "no entity history found to flatten"
        );
        return table;
    }

    info!(
        component = "flatten",
        event = "flatten.finish",
        records = contributing_records,
        rows = table.len(),
        columns = table.columns().len()
    );

    table
}

/// Copies catalog attributes onto every row whose entity id is known to the catalog.
/// Values already present on a row are left untouched.
pub fn attach_entity_attributes(
    table: Table,
    catalog: &Catalog,
    entity_column: &str,
    attributes: &[String],
) -> Table {
    if table.is_empty() || attributes.is_empty() {
        return table;
    }

    let lookup: HashMap<EntityId, &serde_json::Map<String, Value>> = catalog
        .elements
        .iter()
        .map(|entity| (entity.id, &entity.attributes))
        .collect();

    let (mut columns, categorical) = table.layout();
    for attribute in attributes {
        if !columns.iter().any(|column| column == attribute) {
            columns.push(attribute.clone());
        }
    }

    let rows = table
        .into_rows()
        .into_iter()
        .map(|mut row| {
            let known = row
                .get(entity_column)
                .and_then(FieldValue::as_i64)
                .and_then(|id| lookup.get(&id));
            for attribute in attributes {
                let value = known
                    .and_then(|fields| fields.get(attribute))
                    .map(FieldValue::from_json)
                    .unwrap_or(FieldValue::Null);
                let slot = row.entry(attribute.clone()).or_insert(FieldValue::Null);
                if slot.is_null() {
                    *slot = value;
                }
            }
            row
        })
        .collect();

    Table::with_layout(columns, categorical, rows)
}
