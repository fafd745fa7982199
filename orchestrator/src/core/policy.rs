//! Pre-dispatch security policy for the Decision Gateway.
//!
//! Fails closed: an operation outside the allow-list, or content matching any
//! deny-list pattern, is rejected before anything is dispatched.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::GatewaySettings;
use crate::core::error::GatewayError;

#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    allowed_operations: Vec<String>,
    denied: Vec<Regex>,
}

impl SecurityPolicy {
    pub fn new(allowed_operations: Vec<String>, denied_patterns: &[String]) -> Result<Self> {
        let denied = denied_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("compile denied pattern '{pattern}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allowed_operations,
            denied,
        })
    }

    pub fn from_settings(settings: &GatewaySettings) -> Result<Self> {
        Self::new(settings.allowed_operations.clone(), &settings.denied_patterns)
    }

    pub fn check(&self, operation: &str, content: &str) -> Result<(), GatewayError> {
        if !self.allowed_operations.iter().any(|allowed| allowed == operation) {
            return Err(GatewayError::PolicyViolation {
                reason: format!("operation '{operation}' is not allowed"),
            });
        }
        if let Some(pattern) = self.denied.iter().find(|re| re.is_match(content)) {
            return Err(GatewayError::PolicyViolation {
                reason: format!("content matches denied pattern '{}'", pattern.as_str()),
            });
        }
        Ok(())
    }
}
