//! Typed decision payloads and structured-response recovery.
//!
//! Responses are recovered with an ordered list of extraction strategies and
//! must validate against the schema for the expected response kind. Nothing
//! partial is ever returned.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DECISION_SCHEMA: &str = include_str!("../../schemas/decision.schema.json");
const ESCALATION_VERDICT_SCHEMA: &str = include_str!("../../schemas/escalation_verdict.schema.json");

/// One decision per dispatched request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// Continuation instruction for the external executor.
    Continue {
        instruction: String,
        #[serde(default)]
        actions: Vec<String>,
    },
    /// The engine cannot proceed on this task.
    Block {
        reason: String,
        #[serde(default)]
        needs: Vec<String>,
    },
    /// The engine considers the task satisfied.
    Complete { summary: String },
}

impl Decision {
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Continue { .. } => "continue",
            Decision::Block { .. } => "block",
            Decision::Complete { .. } => "complete",
        }
    }
}

/// Expected schema tag carried by a gateway request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Decision,
    EscalationVerdict,
}

fn compile(schema: &str) -> Validator {
    let value: Value = serde_json::from_str(schema).expect("embedded schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&value)
        .expect("embedded schema compiles")
}

static DECISION_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(DECISION_SCHEMA));
static VERDICT_VALIDATOR: LazyLock<Validator> =
    LazyLock::new(|| compile(ESCALATION_VERDICT_SCHEMA));

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseKind::Decision => "decision",
            ResponseKind::EscalationVerdict => "escalation_verdict",
        }
    }

    pub fn schema(self) -> &'static str {
        match self {
            ResponseKind::Decision => DECISION_SCHEMA,
            ResponseKind::EscalationVerdict => ESCALATION_VERDICT_SCHEMA,
        }
    }

    fn validator(self) -> &'static Validator {
        match self {
            ResponseKind::Decision => &DECISION_VALIDATOR,
            ResponseKind::EscalationVerdict => &VERDICT_VALIDATOR,
        }
    }

    /// Schema violations for `value`, empty when it conforms.
    pub fn violations(self, value: &Value) -> Vec<String> {
        self.validator()
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect()
    }
}

/// Extraction strategies, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Extraction {
    DelimitedBlock,
    BracketMatching,
    TrimmedRaw,
}

impl Extraction {
    pub const ORDER: [Extraction; 3] = [
        Extraction::DelimitedBlock,
        Extraction::BracketMatching,
        Extraction::TrimmedRaw,
    ];

    fn candidates(self, raw: &str) -> Vec<&str> {
        match self {
            Extraction::DelimitedBlock => fenced_blocks(raw),
            Extraction::BracketMatching => balanced_objects(raw),
            Extraction::TrimmedRaw => vec![raw.trim()],
        }
    }
}

/// Contents of every ``` fenced block, in order.
fn fenced_blocks(raw: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        // Skip the info string (e.g. `json`) up to the end of the fence line.
        let body_start = after.find('\n').map_or(after.len(), |nl| nl + 1);
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        out.push(body[..close].trim());
        rest = &body[close + 3..];
    }
    out
}

/// Balanced `{...}` span starting at each `{`, in order of position.
fn balanced_objects(raw: &str) -> Vec<&str> {
    raw.match_indices('{')
        .filter_map(|(start, _)| balanced_from(raw, start))
        .collect()
}

/// Balanced span opening at `start`, respecting JSON string escapes.
fn balanced_from(raw: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (offset, c) in raw[start..].char_indices() {
        if in_str {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_str = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_str = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// A recovered, schema-valid response.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub value: T,
    pub strategy: Extraction,
}

/// Recover a `T` from raw response text.
///
/// Returns every strategy's failure reason when none produced a schema-valid
/// value; callers turn this into a malformed-response error carrying `raw`.
pub fn parse_response<T: DeserializeOwned>(
    raw: &str,
    kind: ResponseKind,
) -> Result<Parsed<T>, Vec<String>> {
    let mut reasons = Vec::new();
    for strategy in Extraction::ORDER {
        let candidates = strategy.candidates(raw);
        if candidates.is_empty() {
            reasons.push(format!("{strategy:?}: nothing to extract"));
            continue;
        }
        for candidate in candidates {
            let value: Value = match serde_json::from_str(candidate) {
                Ok(value) => value,
                Err(err) => {
                    reasons.push(format!("{strategy:?}: invalid json: {err}"));
                    continue;
                }
            };
            let violations = kind.violations(&value);
            if !violations.is_empty() {
                reasons.push(format!(
                    "{strategy:?}: {} schema violation(s): {}",
                    kind.as_str(),
                    violations.join("; ")
                ));
                continue;
            }
            match serde_json::from_value::<T>(value) {
                Ok(value) => return Ok(Parsed { value, strategy }),
                Err(err) => reasons.push(format!("{strategy:?}: {err}")),
            }
        }
    }
    Err(reasons)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_wins_over_surrounding_prose() {
        let raw = "Here is my decision {not json}:\n```json\n{\"kind\":\"continue\",\"instruction\":\"write the parser\"}\n```\nthanks";
        let parsed: Parsed<Decision> = parse_response(raw, ResponseKind::Decision).expect("parse");
        assert_eq!(parsed.strategy, Extraction::DelimitedBlock);
        assert_eq!(
            parsed.value,
            Decision::Continue {
                instruction: "write the parser".to_string(),
                actions: Vec::new()
            }
        );
    }

    #[test]
    fn bracket_matching_handles_braces_in_strings() {
        let raw = "Decision: {\"kind\":\"block\",\"reason\":\"needs a } brace\",\"needs\":[\"api key\"]} end";
        let parsed: Parsed<Decision> = parse_response(raw, ResponseKind::Decision).expect("parse");
        assert_eq!(parsed.strategy, Extraction::BracketMatching);
        assert_eq!(parsed.value.kind(), "block");
    }

    #[test]
    fn bare_object_is_found_by_bracket_matching() {
        let raw = "  {\"kind\":\"complete\",\"summary\":\"done\"}\n";
        let parsed: Parsed<Decision> = parse_response(raw, ResponseKind::Decision).expect("parse");
        assert_eq!(parsed.strategy, Extraction::BracketMatching);
    }

    #[test]
    fn later_object_is_tried_when_the_first_brace_is_prose() {
        let raw = "Plan {draft, not json} then {\"kind\":\"complete\",\"summary\":\"done\"}";
        let parsed: Parsed<Decision> = parse_response(raw, ResponseKind::Decision).expect("parse");
        assert_eq!(parsed.strategy, Extraction::BracketMatching);
        assert_eq!(parsed.value.kind(), "complete");
    }

    #[test]
    fn trimmed_raw_runs_after_every_other_strategy() {
        let reasons = parse_response::<Decision>(" [1, 2] ", ResponseKind::Decision).unwrap_err();
        assert_eq!(reasons.len(), 3);
        assert!(reasons[0].starts_with("DelimitedBlock: nothing to extract"));
        assert!(reasons[1].starts_with("BracketMatching: nothing to extract"));
        assert!(reasons[2].starts_with("TrimmedRaw: decision schema violation"));
    }

    #[test]
    fn balanced_objects_lists_each_opening_brace() {
        let raw = "x {a} {\"b\": {\"c\": \"}\"}} {";
        assert_eq!(
            balanced_objects(raw),
            vec!["{a}", "{\"b\": {\"c\": \"}\"}}", "{\"c\": \"}\"}"]
        );
    }

    #[test]
    fn schema_violation_is_never_partially_accepted() {
        let raw = "{\"kind\":\"continue\"}";
        let reasons = parse_response::<Decision>(raw, ResponseKind::Decision).unwrap_err();
        assert!(reasons.iter().any(|r| r.contains("schema violation")));
    }

    #[test]
    fn unknown_kind_and_garbage_fail() {
        assert!(parse_response::<Decision>("{\"kind\":\"retry\"}", ResponseKind::Decision).is_err());
        assert!(parse_response::<Decision>("no structure at all", ResponseKind::Decision).is_err());
    }

    #[test]
    fn verdict_schema_requires_revision_for_defects() {
        let value = serde_json::json!({
            "classification": "specification_defect",
            "rationale": "the test asserts two different values for one input"
        });
        assert!(!ResponseKind::EscalationVerdict.violations(&value).is_empty());
    }

    #[test]
    fn fenced_blocks_extracts_each_block() {
        let raw = "```\n{\"a\":1}\n```\ntext\n```json\n{\"b\":2}\n```";
        assert_eq!(fenced_blocks(raw), vec!["{\"a\":1}", "{\"b\":2}"]);
    }
}
