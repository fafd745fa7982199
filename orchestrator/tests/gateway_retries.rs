//! Decision Gateway retry behavior against a scripted endpoint.

use std::time::{Duration, Instant};

use orchestrator::config::GatewaySettings;
use orchestrator::core::decision::{Decision, ResponseKind};
use orchestrator::core::error::GatewayError;
use orchestrator::io::audit::AuditOutcome;
use orchestrator::io::gateway::{DispatchError, Gateway, GatewayRequest};
use orchestrator::test_support::{MemoryAudit, ScriptedDispatcher};

fn settings() -> GatewaySettings {
    GatewaySettings {
        backoff_base_ms: 1,
        backoff_max_ms: 4,
        ..GatewaySettings::default()
    }
}

fn request() -> GatewayRequest {
    GatewayRequest {
        operation: "next_action".to_string(),
        task_id: "lexer".to_string(),
        prompt: "Decide the next step for the lexer".to_string(),
        expected: ResponseKind::Decision,
        deadline: Instant::now() + Duration::from_secs(30),
    }
}

/// Two timeouts then a valid decision: accepted on the third attempt, with
/// every attempt audited under one request id.
#[test]
fn two_timeouts_then_success_takes_three_attempts() {
    let dispatcher = ScriptedDispatcher::new(vec![
        Err(DispatchError::Timeout),
        Err(DispatchError::Timeout),
        Ok("```json\n{\"kind\":\"continue\",\"instruction\":\"Tokenize identifiers\"}\n```".to_string()),
    ]);
    let audit = MemoryAudit::default();
    let gateway = Gateway::new(&dispatcher, &audit, &settings()).expect("gateway");

    let response = gateway.execute::<Decision>(&request()).expect("decision");
    assert_eq!(response.attempts, 3);
    assert_eq!(
        response.value,
        Decision::Continue {
            instruction: "Tokenize identifiers".to_string(),
            actions: Vec::new(),
        }
    );

    let entries = audit.entries();
    let outcomes: Vec<AuditOutcome> = entries.iter().map(|entry| entry.outcome).collect();
    assert_eq!(
        outcomes,
        vec![AuditOutcome::Timeout, AuditOutcome::Timeout, AuditOutcome::Accepted]
    );
    assert!(entries.iter().all(|entry| entry.request_id == response.request_id));
    let attempts: Vec<u32> = dispatcher.requests().iter().map(|req| req.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[test]
fn timeouts_on_every_attempt_are_reported_as_timeout() {
    let dispatcher = ScriptedDispatcher::new(vec![
        Err(DispatchError::Timeout),
        Err(DispatchError::Timeout),
        Err(DispatchError::Timeout),
    ]);
    let audit = MemoryAudit::default();
    let gateway = Gateway::new(&dispatcher, &audit, &settings()).expect("gateway");

    let err = gateway.execute::<Decision>(&request()).unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { attempts: 3, .. }));
    assert_eq!(audit.entries().len(), 3);
}

#[test]
fn response_missing_required_field_is_never_partially_accepted() {
    let dispatcher = ScriptedDispatcher::new(vec![
        Ok(r#"{"kind":"continue"}"#.to_string()),
        Ok(r#"{"kind":"block","reason":"grammar undecided"}"#.to_string()),
    ]);
    let audit = MemoryAudit::default();
    let gateway = Gateway::new(&dispatcher, &audit, &settings()).expect("gateway");

    let response = gateway.execute::<Decision>(&request()).expect("decision");
    assert_eq!(response.attempts, 2);
    assert_eq!(response.value.kind(), "block");
    assert_eq!(audit.entries()[0].outcome, AuditOutcome::Malformed);
}
