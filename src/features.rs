//! Leakage-safe lag and trailing-mean features over per-entity round sequences.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::ingest::EntityId;
use crate::table::{FieldValue, Row, Table};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_TRACKED_STATS: [&str; 4] = ["total_points", "goals_scored", "ict_index", "minutes"];
pub const DEFAULT_ROLLING_WINDOWS: [u32; 2] = [3, 5];
pub const DEFAULT_CATEGORICAL_COLUMNS: [&str; 2] = ["element_type", "team"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundCollisionPolicy {
    /// Rows sharing a round stay in input order and count as consecutive steps.
    Sequential,
    Reject,
}

/// Handling of rows whose entity or round key is missing or not an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidKeyPolicy {
    /// Drop the row with a warning; it could never receive a lag value.
    Skip,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
    Categorical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub rolling_windows: Vec<u32>,
    pub tracked_stats: Vec<String>,
    pub entity_column: String,
    pub round_column: String,
    pub categorical_columns: Vec<String>,
    pub round_collision: RoundCollisionPolicy,
    pub invalid_keys: InvalidKeyPolicy,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            rolling_windows: DEFAULT_ROLLING_WINDOWS.to_vec(),
            tracked_stats: DEFAULT_TRACKED_STATS.iter().map(|s| s.to_string()).collect(),
            entity_column: "element".to_string(),
            round_column: "round".to_string(),
            categorical_columns: DEFAULT_CATEGORICAL_COLUMNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            round_collision: RoundCollisionPolicy::Sequential,
            invalid_keys: InvalidKeyPolicy::Skip,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("column {0} is missing from the table")]
    MissingColumn(String),
    #[error("row {row} has no value for key column {column}")]
    MissingKey { row: usize, column: String },
    #[error("row {row} has non-integer key {column}={value}")]
    InvalidKey {
        row: usize,
        column: String,
        value: String,
    },
    #[error("entity {entity_id} has more than one row for round {round}")]
    DuplicateRound { entity_id: EntityId, round: i64 },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn lag_column(stat: &str) -> String {
    format!("{stat}_lag_1")
}

pub fn rolling_column(stat: &str, window: u32) -> String {
    format!("{stat}_roll_{window}")
}

/// Value at the preceding step; the first step has none.
pub fn lag_series(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut previous = None;
    for value in values {
        out.push(previous);
        previous = *value;
    }
    out
}

/// Mean over up to `window` strictly earlier steps, skipping missing values.
/// Partial windows are averaged over what exists; no earlier value means `None`.
pub fn trailing_means(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let mut prior: VecDeque<Option<f64>> = VecDeque::with_capacity(window + 1);
    let mut out = Vec::with_capacity(values.len());

    for value in values {
        out.push(mean_present(&prior));
        prior.push_back(*value);
        while prior.len() > window {
            prior.pop_front();
        }
    }

    out
}

fn mean_present(window: &VecDeque<Option<f64>>) -> Option<f64> {
    let (sum, count) = window
        .iter()
        .flatten()
        .fold((0.0_f64, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

/// Rows grouped per entity, each group sorted by round ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityGroups {
    groups: BTreeMap<EntityId, Vec<Row>>,
    columns: Vec<String>,
    categorical: BTreeSet<String>,
    skipped_rows: usize,
}

impl EntityGroups {
    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.groups.keys().copied()
    }

    pub fn rows(&self, entity_id: EntityId) -> Option<&[Row]> {
        self.groups.get(&entity_id).map(Vec::as_slice)
    }

    pub fn entity_count(&self) -> usize {
        self.groups.len()
    }

    pub fn row_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    /// Input rows left out because their key was unusable.
    pub fn skipped_rows(&self) -> usize {
        self.skipped_rows
    }

    pub fn into_table(self) -> Table {
        let rows = self.groups.into_values().flatten().collect();
        Table::with_layout(self.columns, self.categorical, rows)
    }

    fn register_column(&mut self, name: &str) {
        if !self.columns.iter().any(|column| column == name) {
            self.columns.push(name.to_string());
        }
    }

    fn series(rows: &[Row], stat: &str) -> Vec<Option<f64>> {
        rows.iter()
            .map(|row| row.get(stat).and_then(FieldValue::as_f64))
            .collect()
    }

    /// Builds new rows for every group with `derive` output attached under `column`.
    fn with_derived(
        mut self,
        column: &str,
        derive: impl Fn(&[Option<f64>]) -> Vec<Option<f64>>,
        source_stat: &str,
    ) -> Self {
        self.register_column(column);
        let groups = std::mem::take(&mut self.groups);
        self.groups = groups
            .into_iter()
            .map(|(entity_id, rows)| {
                let derived = derive(&Self::series(&rows, source_stat));
                let rows = rows
                    .into_iter()
                    .zip(derived)
                    .map(|(mut row, value)| {
                        row.insert(column.to_string(), FieldValue::from_option_f64(value));
                        row
                    })
                    .collect();
                (entity_id, rows)
            })
            .collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct FeatureEngine {
    cfg: FeatureConfig,
}

impl FeatureEngine {
    pub fn new(cfg: FeatureConfig) -> Result<Self, FeatureError> {
        validate_config(&cfg)?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    /// Sort, lag and rolling steps. The result is ordered by entity, then round.
    pub fn engineer(&self, table: &Table) -> Result<Table, FeatureError> {
        if table.is_empty() {
            return Ok(table.clone());
        }
        for stat in &self.cfg.tracked_stats {
            if !table.has_column(stat) {
                return Err(FeatureError::MissingColumn(stat.clone()));
            }
        }

        info!(
            component = "features",
            event = "features.engineer.start",
            rows = table.len(),
            tracked_stats = ?self.cfg.tracked_stats,
            windows = ?self.cfg.rolling_windows
        );

        let groups = self.group_by_entity(table)?;
        let entity_count = groups.entity_count();
        let skipped_rows = groups.skipped_rows();
        let groups = self.add_lag_features(groups);
        let groups = self.add_rolling_features(groups);
        let enriched = self.normalize_tracked_stats(groups).into_table();

        info!(
            component = "features",
            event = "features.engineer.finish",
            entities = entity_count,
            rows = enriched.len(),
            skipped_rows,
            columns = enriched.columns().len()
        );

        Ok(enriched)
    }

    pub fn group_by_entity(&self, table: &Table) -> Result<EntityGroups, FeatureError> {
        let entity_column = &self.cfg.entity_column;
        let round_column = &self.cfg.round_column;
        if !table.is_empty() {
            for key in [entity_column, round_column] {
                if !table.has_column(key) {
                    return Err(FeatureError::MissingColumn(key.clone()));
                }
            }
        }

        let mut keyed: BTreeMap<EntityId, Vec<(i64, Row)>> = BTreeMap::new();
        let mut skipped_rows = 0usize;
        for (idx, row) in table.rows().iter().enumerate() {
            let keys = key_value(row, idx, entity_column)
                .and_then(|entity_id| Ok((entity_id, key_value(row, idx, round_column)?)));
            match keys {
                Ok((entity_id, round)) => {
                    keyed.entry(entity_id).or_default().push((round, row.clone()));
                }
                Err(err) if self.cfg.invalid_keys == InvalidKeyPolicy::Skip => {
                    warn!(
                        component = "features",
                        event = "features.key.invalid",
                        row = idx,
                        error = %err
                    );
                    skipped_rows += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let mut groups = BTreeMap::new();
        for (entity_id, mut rows) in keyed {
            rows.sort_by_key(|(round, _)| *round);
            if self.cfg.round_collision == RoundCollisionPolicy::Reject {
                if let Some(pair) = rows.windows(2).find(|pair| pair[0].0 == pair[1].0) {
                    return Err(FeatureError::DuplicateRound {
                        entity_id,
                        round: pair[0].0,
                    });
                }
            }
            groups.insert(entity_id, rows.into_iter().map(|(_, row)| row).collect());
        }

        let (columns, categorical) = table.layout();
        Ok(EntityGroups {
            groups,
            columns,
            categorical,
            skipped_rows,
        })
    }

    pub fn add_lag_features(&self, groups: EntityGroups) -> EntityGroups {
        self.cfg
            .tracked_stats
            .iter()
            .fold(groups, |groups, stat| {
                groups.with_derived(&lag_column(stat), lag_series, stat)
            })
    }

    pub fn add_rolling_features(&self, groups: EntityGroups) -> EntityGroups {
        let mut groups = groups;
        for window in &self.cfg.rolling_windows {
            for stat in &self.cfg.tracked_stats {
                groups = groups.with_derived(
                    &rolling_column(stat, *window),
                    |values| trailing_means(values, *window as usize),
                    stat,
                );
            }
        }
        groups
    }

    /// Drops rows lacking any tracked lag value and declares categorical columns.
    pub fn prepare_for_training(&self, table: Table) -> Result<Table, FeatureError> {
        if table.is_empty() {
            return Ok(table);
        }

        let lag_columns: Vec<String> = self.cfg.tracked_stats.iter().map(|s| lag_column(s)).collect();
        for column in &lag_columns {
            if !table.has_column(column) {
                return Err(FeatureError::MissingColumn(column.clone()));
            }
        }

        let input_rows = table.len();
        let (columns, categorical) = table.layout();
        let rows: Vec<Row> = table
            .into_rows()
            .into_iter()
            .filter(|row| {
                lag_columns
                    .iter()
                    .all(|column| row.get(column).map(|v| !v.is_null()).unwrap_or(false))
            })
            .collect();

        let mut prepared = Table::with_layout(columns, categorical, rows);
        let mut marked = Vec::new();
        for column in &self.cfg.categorical_columns {
            if prepared.mark_categorical(column) {
                marked.push(column.clone());
            }
        }

        info!(
            component = "features",
            event = "features.training.finish",
            input_rows,
            output_rows = prepared.len(),
            dropped_rows = input_rows - prepared.len(),
            categorical = ?marked
        );

        Ok(prepared)
    }

    fn normalize_tracked_stats(&self, mut groups: EntityGroups) -> EntityGroups {
        for rows in groups.groups.values_mut() {
            for row in rows.iter_mut() {
                for stat in &self.cfg.tracked_stats {
                    let numeric = row.get(stat).and_then(FieldValue::as_f64);
                    row.insert(stat.clone(), FieldValue::from_option_f64(numeric));
                }
            }
        }
        groups
    }
}

fn key_value(row: &Row, idx: usize, column: &str) -> Result<i64, FeatureError> {
    let value = row.get(column).filter(|value| !value.is_null()).ok_or_else(|| {
        FeatureError::MissingKey {
            row: idx,
            column: column.to_string(),
        }
    })?;
    value.as_i64().ok_or_else(|| FeatureError::InvalidKey {
        row: idx,
        column: column.to_string(),
        value: value.render().unwrap_or_default(),
    })
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut columns = Vec::new();

    for stat in &cfg.tracked_stats {
        columns.push(FeatureColumn {
            name: stat.clone(),
            dtype: FeatureDType::F64,
        });
    }
    for stat in &cfg.tracked_stats {
        columns.push(FeatureColumn {
            name: lag_column(stat),
            dtype: FeatureDType::F64,
        });
    }
    for window in &cfg.rolling_windows {
        for stat in &cfg.tracked_stats {
            columns.push(FeatureColumn {
                name: rolling_column(stat, *window),
                dtype: FeatureDType::F64,
            });
        }
    }
    for column in &cfg.categorical_columns {
        columns.push(FeatureColumn {
            name: column.clone(),
            dtype: FeatureDType::Categorical,
        });
    }

    let fingerprint = schema_fingerprint(cfg, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        windows = ?cfg.rolling_windows,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }

    if cfg.entity_column.is_empty() || cfg.round_column.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "entity_column and round_column must be non-empty".to_string(),
        ));
    }
    if cfg.entity_column == cfg.round_column {
        return Err(FeatureError::InvalidConfig(
            "entity_column and round_column must differ".to_string(),
        ));
    }

    let mut seen_windows = HashSet::new();
    for window in &cfg.rolling_windows {
        if *window == 0 {
            return Err(FeatureError::InvalidConfig(
                "rolling_windows entries must be > 0".to_string(),
            ));
        }
        if !seen_windows.insert(*window) {
            return Err(FeatureError::InvalidConfig(
                "rolling_windows entries must be unique".to_string(),
            ));
        }
    }

    if cfg.tracked_stats.is_empty() {
        return Err(FeatureError::InvalidConfig(
            "tracked_stats must not be empty".to_string(),
        ));
    }
    let mut seen_stats = HashSet::new();
    for stat in &cfg.tracked_stats {
        if stat.trim().is_empty() {
            return Err(FeatureError::InvalidConfig(
                "tracked_stats entries must be non-empty".to_string(),
            ));
        }
        if !seen_stats.insert(stat.as_str()) {
            return Err(FeatureError::InvalidConfig(
                "tracked_stats entries must be unique".to_string(),
            ));
        }
    }

    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update("windows:");
    for window in &cfg.rolling_windows {
        hasher.update(format!("{window},"));
    }
    hasher.update(";columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        match column.dtype {
            FeatureDType::F64 => hasher.update(":f64;"),
            FeatureDType::Categorical => hasher.update(":categorical;"),
        }
    }
    hex::encode(hasher.finalize())
}
