//! Randomized context packing: whatever the file sizes and budget, a bundle
//! never exceeds its budget and declared targets are never silently dropped.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use orchestrator::config::ContextSettings;
use orchestrator::core::context_pack::{LoadMode, candidates, estimate, load_context};
use orchestrator::core::error::OrchestratorError;
use orchestrator::core::xref::{CrossReferenceMap, RelationKind, Strength};
use orchestrator::test_support::{MemorySource, task_with_deps};

const KINDS: [RelationKind; 3] = [
    RelationKind::DependsOn,
    RelationKind::Tests,
    RelationKind::Documents,
];
const STRENGTHS: [Strength; 3] = [Strength::Weak, Strength::Medium, Strength::Strong];

fn rust_source(rng: &mut StdRng, index: usize) -> String {
    let functions = rng.gen_range(1..40);
    let mut source = format!("//! module {index}\n\nuse std::fmt;\n\n");
    for f in 0..functions {
        let body_lines = rng.gen_range(0..12);
        source.push_str(&format!("pub fn item_{index}_{f}(value: u32) -> u32 {{\n"));
        for line in 0..body_lines {
            source.push_str(&format!("    let v{line} = value.wrapping_mul({line});\n"));
        }
        source.push_str("    value\n}\n\n");
    }
    source
}

#[test]
fn bundles_respect_budget_across_random_workspaces() {
    let mut rng = StdRng::seed_from_u64(0x5eed_c0de);
    for round in 0..200 {
        let file_count = rng.gen_range(1..12);
        let paths: Vec<String> = (0..file_count)
            .map(|i| {
                if rng.gen_bool(0.2) {
                    format!("docs/notes_{i}.txt")
                } else {
                    format!("src/mod_{i}.rs")
                }
            })
            .collect();

        let mut source = MemorySource::default();
        for (i, path) in paths.iter().enumerate() {
            if rng.gen_bool(0.9) {
                source = source.with(path, &rust_source(&mut rng, i));
            }
        }

        let mut xref = CrossReferenceMap::default();
        for _ in 0..rng.gen_range(0..20) {
            let from = &paths[rng.gen_range(0..paths.len())];
            let to = &paths[rng.gen_range(0..paths.len())];
            if from != to {
                let kind = KINDS[rng.gen_range(0..KINDS.len())];
                let strength = STRENGTHS[rng.gen_range(0..STRENGTHS.len())];
                xref.relate(from, kind, to, strength);
            }
        }

        let mut task = task_with_deps("t", &[]);
        let targets = rng.gen_range(1..=paths.len().min(3));
        task.targets = paths[..targets].to_vec();

        let budget = rng.gen_range(64..6_000);
        let settings = ContextSettings {
            budget,
            hop_depth: rng.gen_range(0..4),
            reserve_min: rng.gen_range(0..32),
            bytes_per_unit: rng.gen_range(1..5),
        };

        let ranked = candidates(&task, &xref, settings.hop_depth, &source);
        match load_context(&task, &ranked, &settings, &source) {
            Ok(bundle) => {
                assert!(bundle.used <= budget, "round {round}: {} > {budget}", bundle.used);
                let units: usize = bundle.files.iter().map(|file| file.units).sum();
                assert_eq!(units, bundle.used, "round {round}: unit accounting");
                for file in bundle.loaded() {
                    let content = file.content.as_deref().unwrap_or_default();
                    assert!(estimate(content, settings.bytes_per_unit) <= file.units);
                }
                for target in &task.targets {
                    let file = bundle
                        .files
                        .iter()
                        .find(|file| &file.path == target)
                        .expect("declared target is always a candidate");
                    assert_ne!(file.mode, LoadMode::Dropped, "round {round}: {target}");
                }
            }
            Err(OrchestratorError::ContextBudget { task: id, detail }) => {
                assert_eq!(id, "t");
                assert!(task.targets.iter().any(|target| detail.contains(target.as_str())));
            }
            Err(other) => panic!("round {round}: unexpected error {other}"),
        }
    }
}
