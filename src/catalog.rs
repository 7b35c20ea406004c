//! Key catalog: the immutable metric-key → (kind, slot) mapping built by
//! discovery and consumed by the schema planner and the aggregation engine.
//!
//! The catalog is persisted as a versioned JSON artifact carrying the
//! discovery window, so a later transform run can be rejected if its window
//! is not covered by the one the catalog was built for.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::TimeWindow;

/// Artifact format version; bumped on incompatible layout changes.
const ARTIFACT_VERSION: u32 = 1;

/// Numeric kind of a metric key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Integer,
    Float,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Integer => "integer",
            MetricKind::Float => "float",
        }
    }
}

/// Immutable mapping from metric key to column slot, per kind.
///
/// Slot `i` of the integer kind corresponds to target column `int{i+1}`,
/// and likewise for floats. Keys are stored sorted lexicographically so an
/// identical input key set always reproduces an identical catalog.
#[derive(Debug, Clone)]
pub struct KeyCatalog {
    window: TimeWindow,
    int_keys: Vec<String>,
    float_keys: Vec<String>,
    int_slots: HashMap<String, usize>,
    float_slots: HashMap<String, usize>,
}

impl KeyCatalog {
    /// Builds a catalog from discovered key sets. `BTreeSet` iteration
    /// yields keys in byte order, which fixes the slot assignment.
    pub fn build(
        window: TimeWindow,
        int_keys: BTreeSet<String>,
        float_keys: BTreeSet<String>,
    ) -> Self {
        let int_keys: Vec<String> = int_keys.into_iter().collect();
        let float_keys: Vec<String> = float_keys.into_iter().collect();
        let int_slots = slot_index(&int_keys);
        let float_slots = slot_index(&float_keys);

        Self {
            window,
            int_keys,
            float_keys,
            int_slots,
            float_slots,
        }
    }

    /// The discovery window this catalog was built over.
    pub fn window(&self) -> TimeWindow {
        self.window
    }

    /// Slot for an integer metric key, if present.
    pub fn int_slot(&self, key: &str) -> Option<usize> {
        self.int_slots.get(key).copied()
    }

    /// Slot for a float metric key, if present.
    pub fn float_slot(&self, key: &str) -> Option<usize> {
        self.float_slots.get(key).copied()
    }

    /// Kind of a key, if the catalog knows it. Integer keys take
    /// precedence should the same key exist in both kinds.
    pub fn kind_of(&self, key: &str) -> Option<MetricKind> {
        if self.int_slots.contains_key(key) {
            Some(MetricKind::Integer)
        } else if self.float_slots.contains_key(key) {
            Some(MetricKind::Float)
        } else {
            None
        }
    }

    /// Integer keys in slot order (slot 0 first).
    pub fn int_keys(&self) -> &[String] {
        &self.int_keys
    }

    /// Float keys in slot order.
    pub fn float_keys(&self) -> &[String] {
        &self.float_keys
    }

    pub fn int_key_count(&self) -> usize {
        self.int_keys.len()
    }

    pub fn float_key_count(&self) -> usize {
        self.float_keys.len()
    }

    /// Fails unless this catalog's discovery window covers `window`.
    ///
    /// Transforming a window the catalog was not built for risks unknown
    /// keys and an invalid slot assignment, so it is rejected up front.
    pub fn ensure_covers(&self, window: &TimeWindow) -> Result<()> {
        if !self.window.covers(window) {
            bail!(
                "catalog window [{}, {}) does not cover requested window [{}, {}); \
                 re-run discovery over the full transformation range",
                self.window.start_ms,
                self.window.end_ms,
                window.start_ms,
                window.end_ms,
            );
        }
        Ok(())
    }

    /// Persists the catalog as a versioned JSON artifact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let artifact = CatalogArtifact {
            version: ARTIFACT_VERSION,
            window: self.window,
            int_keys: self.int_keys.clone(),
            float_keys: self.float_keys.clone(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        let data = serde_json::to_vec_pretty(&artifact).context("serializing key catalog")?;
        std::fs::write(path, data)
            .with_context(|| format!("writing key catalog to {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            int_keys = self.int_keys.len(),
            float_keys = self.float_keys.len(),
            "key catalog saved",
        );

        Ok(())
    }

    /// Loads a persisted catalog, re-validating invariants that external
    /// edits could have broken: artifact version, sorted key order, and
    /// absence of duplicates within a kind.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading key catalog from {}", path.display()))?;

        let artifact: CatalogArtifact =
            serde_json::from_str(&data).context("parsing key catalog artifact")?;

        if artifact.version != ARTIFACT_VERSION {
            bail!(
                "key catalog version {} is not supported (expected {})",
                artifact.version,
                ARTIFACT_VERSION,
            );
        }

        validate_keys(&artifact.int_keys, MetricKind::Integer)?;
        validate_keys(&artifact.float_keys, MetricKind::Float)?;

        let int_slots = slot_index(&artifact.int_keys);
        let float_slots = slot_index(&artifact.float_keys);

        Ok(Self {
            window: artifact.window,
            int_keys: artifact.int_keys,
            float_keys: artifact.float_keys,
            int_slots,
            float_slots,
        })
    }
}

/// On-disk representation of the catalog.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogArtifact {
    version: u32,
    window: TimeWindow,
    int_keys: Vec<String>,
    float_keys: Vec<String>,
}

fn slot_index(keys: &[String]) -> HashMap<String, usize> {
    keys.iter()
        .enumerate()
        .map(|(slot, key)| (key.clone(), slot))
        .collect()
}

/// Slot stability depends on the stored order being the canonical sorted
/// order, and on every key being unique within its kind.
fn validate_keys(keys: &[String], kind: MetricKind) -> Result<()> {
    for pair in keys.windows(2) {
        if pair[0] >= pair[1] {
            bail!(
                "{} keys in catalog artifact are not in sorted unique order ({:?} before {:?})",
                kind.as_str(),
                pair[0],
                pair[1],
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> TimeWindow {
        TimeWindow::new(0, 86_400_000).unwrap()
    }

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_assigns_slots_in_sorted_order() {
        let catalog = KeyCatalog::build(window(), keys(&["zeta", "alpha", "mid"]), keys(&[]));
        assert_eq!(catalog.int_keys(), &["alpha", "mid", "zeta"]);
        assert_eq!(catalog.int_slot("alpha"), Some(0));
        assert_eq!(catalog.int_slot("mid"), Some(1));
        assert_eq!(catalog.int_slot("zeta"), Some(2));
        assert_eq!(catalog.int_slot("missing"), None);
    }

    #[test]
    fn test_zero_float_keys_is_legal() {
        let catalog = KeyCatalog::build(window(), keys(&["a"]), keys(&[]));
        assert_eq!(catalog.float_key_count(), 0);
        assert_eq!(catalog.float_slot("a"), None);
    }

    #[test]
    fn test_kind_of() {
        let catalog = KeyCatalog::build(window(), keys(&["i"]), keys(&["f"]));
        assert_eq!(catalog.kind_of("i"), Some(MetricKind::Integer));
        assert_eq!(catalog.kind_of("f"), Some(MetricKind::Float));
        assert_eq!(catalog.kind_of("x"), None);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let catalog = KeyCatalog::build(window(), keys(&["b", "a"]), keys(&["q"]));
        catalog.save(&path).unwrap();

        let loaded = KeyCatalog::load(&path).unwrap();
        assert_eq!(loaded.window(), catalog.window());
        assert_eq!(loaded.int_keys(), catalog.int_keys());
        assert_eq!(loaded.float_keys(), catalog.float_keys());
        assert_eq!(loaded.int_slot("a"), Some(0));
    }

    #[test]
    fn test_load_rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"version":99,"window":{"start_ms":0,"end_ms":1},"int_keys":[],"float_keys":[]}"#,
        )
        .unwrap();

        let err = KeyCatalog::load(&path).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn test_load_rejects_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"version":1,"window":{"start_ms":0,"end_ms":1},"int_keys":["a","a"],"float_keys":[]}"#,
        )
        .unwrap();

        assert!(KeyCatalog::load(&path).is_err());
    }

    #[test]
    fn test_load_rejects_unsorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"version":1,"window":{"start_ms":0,"end_ms":1},"int_keys":["b","a"],"float_keys":[]}"#,
        )
        .unwrap();

        assert!(KeyCatalog::load(&path).is_err());
    }

    #[test]
    fn test_ensure_covers() {
        let catalog = KeyCatalog::build(window(), keys(&[]), keys(&[]));
        let inside = TimeWindow::new(1000, 2000).unwrap();
        let outside = TimeWindow::new(0, 86_400_001).unwrap();
        assert!(catalog.ensure_covers(&inside).is_ok());
        assert!(catalog.ensure_covers(&outside).is_err());
    }
}
