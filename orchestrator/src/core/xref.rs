//! Cross-Reference Map: per-file relationships used for context expansion.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::SCHEMA_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Documents,
    Implements,
    Tests,
    DependsOn,
    Configures,
}

/// How tightly two files are coupled. Ordered weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelationKind,
    pub target: String,
    pub strength: Strength,
    /// Set when `target` resolves to neither a map entry nor a file on disk.
    #[serde(default)]
    pub broken: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Content fingerprint (hex SHA-256) at last indexing.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

/// Persisted cross-reference document (`xref.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReferenceMap {
    pub schema_version: u32,
    pub files: BTreeMap<String, FileEntry>,
}

impl Default for CrossReferenceMap {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            files: BTreeMap::new(),
        }
    }
}

/// An edge reached while walking the map, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor<'a> {
    pub path: &'a str,
    pub kind: RelationKind,
    pub strength: Strength,
}

impl CrossReferenceMap {
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Add a relation, creating the source entry if needed.
    pub fn relate(&mut self, source: &str, kind: RelationKind, target: &str, strength: Strength) {
        let entry = self.files.entry(source.to_string()).or_default();
        if let Some(existing) = entry
            .relations
            .iter_mut()
            .find(|rel| rel.kind == kind && rel.target == target)
        {
            existing.strength = existing.strength.max(strength);
            return;
        }
        entry.relations.push(Relation {
            kind,
            target: target.to_string(),
            strength,
            broken: false,
        });
    }

    /// Non-broken neighbours of `path`: its own outgoing edges plus every
    /// entry with an edge pointing at it.
    pub fn neighbors(&self, path: &str) -> Vec<Neighbor<'_>> {
        let mut out = Vec::new();
        if let Some(entry) = self.files.get(path) {
            for rel in entry.relations.iter().filter(|rel| !rel.broken) {
                out.push(Neighbor {
                    path: rel.target.as_str(),
                    kind: rel.kind,
                    strength: rel.strength,
                });
            }
        }
        for (source, entry) in &self.files {
            if source == path {
                continue;
            }
            for rel in entry
                .relations
                .iter()
                .filter(|rel| !rel.broken && rel.target == path)
            {
                out.push(Neighbor {
                    path: source.as_str(),
                    kind: rel.kind,
                    strength: rel.strength,
                });
            }
        }
        out
    }

    /// Flag every edge whose target is neither indexed nor present per `exists`.
    ///
    /// Edges that resolve again are un-flagged. Returns the number of edges whose
    /// flag changed.
    pub fn mark_broken_edges<F: Fn(&str) -> bool>(&mut self, exists: F) -> usize {
        let indexed: Vec<String> = self.files.keys().cloned().collect();
        let mut changed = 0;
        for entry in self.files.values_mut() {
            for rel in &mut entry.relations {
                let resolves = indexed.binary_search(&rel.target).is_ok() || exists(&rel.target);
                if rel.broken == resolves {
                    rel.broken = !resolves;
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn broken_edges(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (source, entry) in &self.files {
            for rel in entry.relations.iter().filter(|rel| rel.broken) {
                out.push((source.clone(), rel.target.clone()));
            }
        }
        out
    }
}
