//! Audit job lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::id::{CorrelationId, JobId};
use crate::target::AuditTarget;

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, nothing sent yet
    Pending,
    /// Probing backend liveness
    AwaitingReadiness,
    /// Progress channel open, submission in flight (including retries)
    Submitted,
    /// Progress events are arriving for the current correlation id
    Streaming,
    /// Final result delivered
    Completed,
    /// Classified error delivered
    Failed { error: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::AwaitingReadiness => 1,
            JobStatus::Submitted => 2,
            JobStatus::Streaming => 3,
            JobStatus::Completed | JobStatus::Failed { .. } => 4,
        }
    }
}

/// One audit, from user action to terminal status.
///
/// Status only moves forward. The single exception is [`AuditJob::reconcile`],
/// which swaps in a backend-assigned correlation id once and restarts the job
/// at `Submitted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditJob {
    pub id: JobId,
    correlation_id: CorrelationId,
    reconciled_from: Option<CorrelationId>,
    pub target: AuditTarget,
    status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AuditJob {
    pub fn new(target: AuditTarget, correlation_id: CorrelationId) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            correlation_id,
            reconciled_from: None,
            target,
            status: JobStatus::Pending,
            created_at: now,
            submitted_at: None,
            updated_at: now,
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// The client-generated id, if the backend superseded it.
    pub fn reconciled_from(&self) -> Option<&CorrelationId> {
        self.reconciled_from.as_ref()
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    /// Move forward to `next`. Re-entering the current status is a no-op.
    pub fn advance(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status.clone()));
        }
        if next.rank() < self.status.rank() {
            return Err(TransitionError::Backwards {
                from: self.status.clone(),
                to: next,
            });
        }
        if next == self.status {
            return Ok(());
        }

        let now = Utc::now();
        if next == JobStatus::Submitted && self.submitted_at.is_none() {
            self.submitted_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), TransitionError> {
        self.advance(JobStatus::Completed)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(JobStatus::Failed {
            error: error.into(),
        })
    }

    /// Adopt a backend-assigned correlation id. Allowed once per job.
    pub fn reconcile(&mut self, assigned: CorrelationId) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal(self.status.clone()));
        }
        if self.reconciled_from.is_some() {
            return Err(TransitionError::AlreadyReconciled);
        }

        let previous = std::mem::replace(&mut self.correlation_id, assigned);
        self.reconciled_from = Some(previous);
        self.status = JobStatus::Submitted;
        self.updated_at = Utc::now();
        Ok(())
    }
}
