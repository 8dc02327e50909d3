//! Identifiers used across the relay.

use core::str::FromStr;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuditError;

/// Token binding one submitted job to one progress channel.
///
/// Opaque: the backend may hand back an id of its own making, so no UUID
/// syntax is required. Decoding goes through [`FromStr`], so a blank id or
/// one that is not a single URL path segment never gets constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh id (random 128-bit UUID).
    ///
    /// Falls back to [`CorrelationId::fallback`] when the OS random source is
    /// unavailable.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => Self(uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "os random source unavailable; using fallback correlation id");
                Self::fallback()
            }
        }
    }

    /// Timestamp plus a pseudo-random suffix.
    pub fn fallback() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix: u32 = rand::random();
        Self(format!("cid-{millis:x}-{suffix:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AuditError::stream("correlation id must not be blank"));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AuditError::stream(format!(
                "correlation id contains unsupported characters: {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = AuditError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}

/// Client-side identifier of one audit job (stable across reconciliation).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Uses UUIDv7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
