//! Evidence requirement checks, separate from authenticity scoring.
//!
//! Unmet requirements keep a task incomplete but are not fabrication.

use crate::core::evidence::{EvidenceKind, EvidenceRecord};
use crate::core::types::Task;

/// Names each unmet requirement of `task` given the accepted `records`.
///
/// `exists` answers whether a workspace-relative path is present.
pub fn unmet_requirements<F: Fn(&str) -> bool>(
    task: &Task,
    records: &[&EvidenceRecord],
    exists: F,
) -> Vec<String> {
    let mut unmet = Vec::new();
    let wanted = task.evidence;

    if wanted.test_pass
        && !records
            .iter()
            .any(|record| record.test_run.as_ref().is_some_and(|run| run.is_passing()))
    {
        unmet.push("test_pass: no passing test run".to_string());
    }

    if wanted.file_existence {
        let missing: Vec<&str> = if task.targets.is_empty() {
            records
                .iter()
                .filter_map(|record| record.files.as_ref())
                .flat_map(|files| files.created.iter().chain(files.modified.iter()))
                .map(String::as_str)
                .filter(|path| !exists(path))
                .collect()
        } else {
            task.targets
                .iter()
                .map(String::as_str)
                .filter(|path| !exists(path))
                .collect()
        };
        let reported_any = !task.targets.is_empty()
            || records.iter().any(|record| {
                record
                    .files
                    .as_ref()
                    .is_some_and(|f| !f.created.is_empty() || !f.modified.is_empty())
            });
        if !reported_any {
            unmet.push("file_existence: no files reported".to_string());
        } else if !missing.is_empty() {
            unmet.push(format!("file_existence: missing {}", missing.join(", ")));
        }
    }

    if wanted.external_validation {
        let succeeded = |service: Option<&str>| {
            records.iter().any(|record| {
                record.service_calls.iter().any(|call| {
                    service.is_none_or(|name| call.service == name)
                        && call.status.is_some_and(|status| (200..300).contains(&status))
                })
            })
        };
        if task.services.is_empty() {
            if !succeeded(None) {
                unmet.push("external_validation: no successful service call".to_string());
            }
        } else {
            let missing: Vec<&str> = task
                .services
                .iter()
                .map(String::as_str)
                .filter(|service| !succeeded(Some(*service)))
                .collect();
            if !missing.is_empty() {
                unmet.push(format!(
                    "external_validation: no successful call to {}",
                    missing.join(", ")
                ));
            }
        }
    }

    if wanted.integration_proof
        && !records.iter().any(|record| {
            record.kind == EvidenceKind::Validation
                && record.test_run.as_ref().is_some_and(|run| run.is_passing())
        })
    {
        unmet.push("integration_proof: no passing validation run".to_string());
    }

    unmet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::evidence::{FileSystemEvidence, ServiceCallEvidence, TestRunEvidence};
    use crate::core::types::EvidenceRequirements;
    use crate::test_support::{evidence_record, task_with_deps, timestamp};

    fn passing_run() -> TestRunEvidence {
        TestRunEvidence {
            command: "cargo test".to_string(),
            exit_status: 0,
            passed: 12,
            failed: 0,
            expected: None,
            actual: None,
            duration_ms: Some(4_200.0),
        }
    }

    #[test]
    fn no_requirements_are_trivially_met() {
        let task = task_with_deps("t", &[]);
        assert!(unmet_requirements(&task, &[], |_| false).is_empty());
    }

    #[test]
    fn each_requirement_reports_its_gap() {
        let mut task = task_with_deps("t", &[]);
        task.evidence = EvidenceRequirements {
            test_pass: true,
            file_existence: true,
            external_validation: true,
            integration_proof: true,
        };
        task.targets = vec!["src/lib.rs".to_string()];
        task.services = vec!["billing".to_string()];

        let unmet = unmet_requirements(&task, &[], |_| false);
        assert_eq!(
            unmet,
            vec![
                "test_pass: no passing test run",
                "file_existence: missing src/lib.rs",
                "external_validation: no successful call to billing",
                "integration_proof: no passing validation run",
            ]
        );
    }

    #[test]
    fn complete_evidence_meets_all_requirements() {
        let mut task = task_with_deps("t", &[]);
        task.evidence = EvidenceRequirements {
            test_pass: true,
            file_existence: true,
            external_validation: true,
            integration_proof: true,
        };
        task.services = vec!["billing".to_string()];

        let mut record = evidence_record("t", 1, EvidenceKind::Validation, timestamp(5));
        record.test_run = Some(passing_run());
        record.files = Some(FileSystemEvidence {
            created: vec!["src/billing.rs".to_string()],
            ..FileSystemEvidence::default()
        });
        record.service_calls.push(ServiceCallEvidence {
            service: "billing".to_string(),
            endpoint: "/v1/charges".to_string(),
            status: Some(201),
            dns_ms: Some(1.5),
            connect_ms: Some(6.0),
            total_ms: Some(70.0),
            response_excerpt: None,
        });

        let unmet = unmet_requirements(&task, &[&record], |path| path == "src/billing.rs");
        assert!(unmet.is_empty(), "{unmet:?}");
    }
}
