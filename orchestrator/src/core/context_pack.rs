//! Context Budget Loader: bounded context assembly for one task.
//!
//! Candidates are the task's declared targets and context files, expanded
//! through the Cross-Reference Map. They load greedily in rank order, each
//! degrading full -> skeleton -> head-truncated -> dropped to fit the budget.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::ContextSettings;
use crate::core::error::OrchestratorError;
use crate::core::skeleton;
use crate::core::types::Task;
use crate::core::xref::{CrossReferenceMap, Strength};

/// Read access to candidate files. `None` from `read` means missing.
pub trait ContextSource {
    fn read(&self, path: &str) -> Option<String>;
    fn modified(&self, path: &str) -> Option<DateTime<Utc>>;
}

/// Why a file is a candidate. Ordered lowest rank first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Related(Strength),
    Declared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub path: String,
    pub origin: Origin,
    pub hops: usize,
    pub recency: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Full,
    Skeleton,
    Truncated,
    Dropped,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleFile {
    pub path: String,
    pub origin: Origin,
    pub mode: LoadMode,
    /// Estimated size of `content` in budget units.
    pub units: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextBundle {
    pub task_id: String,
    pub budget: usize,
    pub used: usize,
    pub files: Vec<BundleFile>,
}

impl ContextBundle {
    pub fn loaded(&self) -> impl Iterator<Item = &BundleFile> {
        self.files.iter().filter(|file| file.content.is_some())
    }

    pub fn count(&self, mode: LoadMode) -> usize {
        self.files.iter().filter(|file| file.mode == mode).count()
    }
}

/// Over-estimate of `text`'s size in budget units.
pub fn estimate(text: &str, bytes_per_unit: usize) -> usize {
    text.len().div_ceil(bytes_per_unit.max(1)) + 1
}

/// Ranked, deduplicated candidates for `task`.
pub fn candidates<S: ContextSource + ?Sized>(
    task: &Task,
    xref: &CrossReferenceMap,
    hop_depth: usize,
    source: &S,
) -> Vec<Candidate> {
    let mut found: BTreeMap<String, (Origin, usize)> = BTreeMap::new();
    let mut queue: VecDeque<(String, Strength, usize)> = VecDeque::new();

    for path in task.targets.iter().chain(task.context.iter()) {
        if found.insert(path.clone(), (Origin::Declared, 0)).is_none() {
            queue.push_back((path.clone(), Strength::Strong, 0));
        }
    }

    // Breadth-first; a related file's strength is the weakest edge on its path,
    // and the best path wins.
    while let Some((path, strength, hops)) = queue.pop_front() {
        if hops >= hop_depth {
            continue;
        }
        for neighbor in xref.neighbors(&path) {
            let next_strength = strength.min(neighbor.strength);
            let via = Origin::Related(next_strength);
            match found.get_mut(neighbor.path) {
                Some((origin, _)) if *origin >= via => continue,
                Some(entry) => *entry = (via, hops + 1),
                None => {
                    found.insert(neighbor.path.to_string(), (via, hops + 1));
                }
            }
            queue.push_back((neighbor.path.to_string(), next_strength, hops + 1));
        }
    }

    let mut out: Vec<Candidate> = found
        .into_iter()
        .map(|(path, (origin, hops))| {
            let recency = xref
                .files
                .get(&path)
                .and_then(|entry| entry.modified)
                .or_else(|| source.modified(&path));
            Candidate {
                path,
                origin,
                hops,
                recency,
            }
        })
        .collect();
    out.sort_by(|a, b| {
        (Reverse(a.origin), Reverse(a.recency), &a.path).cmp(&(
            Reverse(b.origin),
            Reverse(b.recency),
            &b.path,
        ))
    });
    out
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut index = index;
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Head of `content` plus a truncation marker, sized to fit `units`.
fn head_truncate(content: &str, units: usize, bytes_per_unit: usize) -> Option<String> {
    let allowed = units.checked_sub(1)?.checked_mul(bytes_per_unit.max(1))?;
    let marker = format!("\n[... truncated, {} bytes total]", content.len());
    let body = allowed.checked_sub(marker.len())?;
    if body == 0 {
        return None;
    }
    let cut = floor_char_boundary(content, body);
    if cut == 0 {
        return None;
    }
    Some(format!("{}{}", &content[..cut], marker))
}

/// Load ranked `candidates` into a bundle that never exceeds `settings.budget`.
///
/// A declared target that cannot be fitted at all is a
/// [`OrchestratorError::ContextBudget`]. Missing files are recorded and skipped.
pub fn load_context<S: ContextSource + ?Sized>(
    task: &Task,
    candidates: &[Candidate],
    settings: &ContextSettings,
    source: &S,
) -> Result<ContextBundle, OrchestratorError> {
    let bpu = settings.bytes_per_unit.max(1);
    let mut remaining = settings.budget;
    let mut files = Vec::with_capacity(candidates.len());
    let mut exhausted = false;

    for candidate in candidates {
        let entry = |mode, units, content| BundleFile {
            path: candidate.path.clone(),
            origin: candidate.origin,
            mode,
            units,
            content,
        };

        if exhausted || remaining < settings.reserve_min {
            exhausted = true;
            files.push(entry(LoadMode::Dropped, 0, None));
            continue;
        }
        let Some(content) = source.read(&candidate.path) else {
            debug!(path = %candidate.path, "context candidate missing");
            files.push(entry(LoadMode::Missing, 0, None));
            continue;
        };

        let full = estimate(&content, bpu);
        if full <= remaining {
            remaining -= full;
            files.push(entry(LoadMode::Full, full, Some(content)));
            continue;
        }

        match skeleton::extract(&candidate.path, &content) {
            Some(skeleton) if estimate(&skeleton, bpu) <= remaining => {
                let units = estimate(&skeleton, bpu);
                remaining -= units;
                files.push(entry(LoadMode::Skeleton, units, Some(skeleton)));
                continue;
            }
            Some(_) => debug!(path = %candidate.path, "skeleton exceeds remaining budget"),
            None => debug!(path = %candidate.path, "no skeleton for file kind"),
        }

        match head_truncate(&content, remaining, bpu) {
            Some(head) => {
                let units = estimate(&head, bpu);
                remaining -= units;
                files.push(entry(LoadMode::Truncated, units, Some(head)));
            }
            None => files.push(entry(LoadMode::Dropped, 0, None)),
        }
    }

    let dropped_targets: Vec<&str> = files
        .iter()
        .filter(|file| file.mode == LoadMode::Dropped)
        .map(|file| file.path.as_str())
        .filter(|path| task.targets.iter().any(|target| target == path))
        .collect();
    if !dropped_targets.is_empty() {
        return Err(OrchestratorError::ContextBudget {
            task: task.id.clone(),
            detail: format!(
                "declared target(s) do not fit in {} units even when degraded: {}",
                settings.budget,
                dropped_targets.join(", ")
            ),
        });
    }

    Ok(ContextBundle {
        task_id: task.id.clone(),
        budget: settings.budget,
        used: settings.budget - remaining,
        files,
    })
}
