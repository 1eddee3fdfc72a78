//! Entry points for the command and reporting front-ends.
//!
//! Front-ends own the transport (chat buttons, slash commands, dashboards);
//! these functions only map ledger and batch results to replies.

use crate::db::{Database, LedgerStats};
use crate::error::{BatchError, StoreError};
use crate::summarize::{BatchOutcome, SummarizationManager};
use std::fmt;
use tracing::{error, info};

/// Number of messages waiting to be summarized.
pub async fn handle_status_command(db: &Database) -> Result<i64, StoreError> {
    db.run_blocking(|db| db.pending_count()).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryReply {
    Digest { text: String, message_count: usize },
    NothingPending,
    AllShort { count: usize, min_length: usize },
    Failed { reason: String },
}

impl fmt::Display for SummaryReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryReply::Digest { text, message_count } => {
                write!(f, "📝 Digest of {message_count} messages:\n\n{text}")
            }
            SummaryReply::NothingPending => write!(f, "✅ No new messages to summarize."),
            SummaryReply::AllShort { count, min_length } => write!(
                f,
                "Found {count} messages, but all are too short (< {min_length} characters)."
            ),
            SummaryReply::Failed { reason } => write!(f, "❌ {reason}"),
        }
    }
}

/// Runs one batch and turns the result into a user-facing reply. Internal
/// causes stay in the logs.
pub async fn handle_summary_command(manager: &SummarizationManager) -> SummaryReply {
    info!("Command: Summary requested");
    match manager.run().await {
        Ok(BatchOutcome::Digest { text, eligible, .. }) => SummaryReply::Digest {
            text,
            message_count: eligible,
        },
        Ok(BatchOutcome::NothingPending) => SummaryReply::NothingPending,
        Ok(BatchOutcome::AllShort { count }) => SummaryReply::AllShort {
            count,
            min_length: manager.min_length(),
        },
        Err(BatchError::Gateway(e)) => {
            error!("Command: Summary failed: {} ({})", e, e.cause);
            SummaryReply::Failed {
                reason: "Summarization service is unavailable. Please try again later."
                    .to_string(),
            }
        }
        Err(BatchError::Persistence(e)) => {
            error!("Command: Summary failed: {}", e);
            SummaryReply::Failed {
                reason: "Could not create a summary.".to_string(),
            }
        }
    }
}

/// Read-only counters for the reporting surface.
pub async fn handle_stats(db: &Database) -> Result<LedgerStats, StoreError> {
    db.run_blocking(|db| db.stats()).await
}
