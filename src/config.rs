//! Run configuration with environment overrides.

use std::env;
use std::path::PathBuf;

use crate::features::FeatureConfig;
use crate::ingest::IngestConfig;

pub const DEFAULT_OUTPUT_DIR: &str = "data/processed";
pub const DEFAULT_OUTPUT_NAME: &str = "training_features";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub features: FeatureConfig,
    pub output_dir: PathBuf,
    pub output_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            features: FeatureConfig::default(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            output_name: DEFAULT_OUTPUT_NAME.to_string(),
        }
    }
}

/// Reads `FPL_*` variables from the process environment.
pub fn pipeline_config_from_env() -> PipelineConfig {
    pipeline_config_from_lookup(|key| env::var(key).ok())
}

/// Builds a config from any key source. Blank or unparseable values keep the default.
pub fn pipeline_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PipelineConfig {
    let var = |key: &str| non_empty(lookup(key));
    let mut config = PipelineConfig::default();

    if let Some(base_url) = var("FPL_API_BASE_URL") {
        config.ingest.base_url = base_url;
    }

    if let Some(timeout_ms) = var("FPL_TIMEOUT_SECONDS").and_then(|raw| parse_timeout_seconds(&raw)) {
        config.ingest.timeout_ms = timeout_ms;
    }

    if let Some(raw) = var("FPL_MAX_CONCURRENCY") {
        if let Some(limit) = parse_concurrency(&raw) {
            config.ingest.max_concurrency = limit;
        }
    }

    if let Some(windows) = var("FPL_ROLLING_WINDOWS").and_then(|raw| parse_windows(&raw)) {
        config.features.rolling_windows = windows;
    }

    if let Some(stats) = var("FPL_TRACKED_STATS").and_then(|raw| parse_names(&raw)) {
        config.features.tracked_stats = stats;
    }

    if let Some(output_dir) = var("FPL_OUTPUT_DIR") {
        config.output_dir = PathBuf::from(output_dir);
    }

    if let Some(output_name) = var("FPL_OUTPUT_NAME") {
        config.output_name = output_name;
    }

    config
}

pub(crate) fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_timeout_seconds(raw: &str) -> Option<u64> {
    let seconds = raw.parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }
    Some((seconds * 1_000.0).round() as u64).filter(|ms| *ms > 0)
}

/// `Some(None)` means unbounded; `None` means the value is unusable.
fn parse_concurrency(raw: &str) -> Option<Option<usize>> {
    match raw.to_ascii_lowercase().as_str() {
        "none" | "unbounded" => Some(None),
        other => other.parse::<usize>().ok().filter(|n| *n > 0).map(Some),
    }
}

/// Comma-separated positive window sizes; duplicates collapse to first occurrence.
fn parse_windows(raw: &str) -> Option<Vec<u32>> {
    let mut windows = Vec::new();
    for token in raw.split(',') {
        let window = token.trim().parse::<u32>().ok().filter(|w| *w > 0)?;
        if !windows.contains(&window) {
            windows.push(window);
        }
    }
    Some(windows)
}

fn parse_names(raw: &str) -> Option<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for token in raw.split(',') {
        let name = token.trim();
        if name.is_empty() {
            return None;
        }
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }
    Some(names)
}

pub(crate) fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        pipeline_config_from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = config_from(&[]);

        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.ingest.timeout_ms, 10_000);
        assert_eq!(cfg.ingest.max_concurrency, None);
        assert_eq!(cfg.features.rolling_windows, vec![3, 5]);
        assert_eq!(cfg.output_dir, PathBuf::from("data/processed"));
        assert_eq!(cfg.output_name, "training_features");
    }

    #[test]
    fn overrides_apply_to_ingest_features_and_output() {
        let cfg = config_from(&[
            ("FPL_API_BASE_URL", "http://127.0.0.1:8000/api"),
            ("FPL_TIMEOUT_SECONDS", "2.5"),
            ("FPL_MAX_CONCURRENCY", "16"),
            ("FPL_ROLLING_WINDOWS", "2, 4,2"),
            ("FPL_TRACKED_STATS", "total_points,bps"),
            ("FPL_OUTPUT_DIR", "/tmp/fpl"),
            ("FPL_OUTPUT_NAME", "gw_features"),
        ]);

        assert_eq!(cfg.ingest.base_url, "http://127.0.0.1:8000/api");
        assert_eq!(cfg.ingest.timeout_ms, 2_500);
        assert_eq!(cfg.ingest.max_concurrency, Some(16));
        assert_eq!(cfg.features.rolling_windows, vec![2, 4]);
        assert_eq!(cfg.features.tracked_stats, vec!["total_points", "bps"]);
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/fpl"));
        assert_eq!(cfg.output_name, "gw_features");
    }

    #[test]
    fn unbounded_keyword_clears_a_concurrency_limit() {
        assert_eq!(parse_concurrency("unbounded"), Some(None));
        assert_eq!(parse_concurrency("4"), Some(Some(4)));
        assert_eq!(parse_concurrency("0"), None);
    }

    #[test]
    fn unusable_values_keep_defaults() {
        let cfg = config_from(&[
            ("FPL_API_BASE_URL", "   "),
            ("FPL_TIMEOUT_SECONDS", "-1"),
            ("FPL_MAX_CONCURRENCY", "0"),
            ("FPL_ROLLING_WINDOWS", "3,zero"),
            ("FPL_TRACKED_STATS", "total_points,,minutes"),
        ]);

        assert_eq!(cfg, PipelineConfig::default());
    }
}
