//! Audit target validation.
//!
//! Only rejects inputs that cannot possibly be audited. Syntactic URL
//! normalization belongs to the caller.

use serde::{Deserialize, Serialize};

use crate::error::AuditError;

const MAX_TARGET_LEN: usize = 2048;

/// A non-empty, single-token audit target (usually a URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AuditTarget(String);

impl AuditTarget {
    pub fn parse(raw: &str) -> Result<Self, AuditError> {
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(AuditError::invalid_target("target is empty"));
        }
        if trimmed.len() > MAX_TARGET_LEN {
            return Err(AuditError::invalid_target(format!(
                "target longer than {MAX_TARGET_LEN} bytes"
            )));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(AuditError::invalid_target("target contains whitespace"));
        }

        let host_part = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);
        if host_part.trim_matches('/').is_empty() {
            return Err(AuditError::invalid_target("target has no host"));
        }
        if !host_part.chars().any(|c| c.is_alphanumeric()) {
            return Err(AuditError::invalid_target("target has no host"));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for AuditTarget {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AuditTarget {
    type Error = AuditError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AuditTarget> for String {
    fn from(value: AuditTarget) -> Self {
        value.0
    }
}
