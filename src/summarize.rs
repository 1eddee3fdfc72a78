use crate::config::Config;
use crate::db::{Database, DigestDraft, MessageRecord};
use crate::error::BatchError;
use crate::llm::Summarizer;
use std::sync::Arc;
use tracing::{error, info};

/// Joins the per-message blocks of a summarization document.
pub const DOCUMENT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    NothingPending,
    /// Every fetched message was below the length threshold; all were marked.
    AllShort { count: usize },
    Digest {
        digest_id: i64,
        text: String,
        eligible: usize,
        total: usize,
    },
}

/// Runs one summarization batch per invocation.
///
/// Selection and marking are separate ledger operations, so two overlapping
/// runs can pick the same pending rows and both call the gateway. Duplicate
/// digests are accepted in that case.
pub struct SummarizationManager {
    db: Database,
    summarizer: Arc<dyn Summarizer>,
    batch_limit: usize,
    min_length: usize,
}

impl SummarizationManager {
    pub fn new(db: Database, summarizer: Arc<dyn Summarizer>, config: &Config) -> Self {
        Self {
            db,
            summarizer,
            batch_limit: config.summary_batch_limit,
            min_length: config.summary_min_length,
        }
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn is_eligible(&self, message: &MessageRecord) -> bool {
        message.text.trim().chars().count() >= self.min_length
    }

    pub async fn run(&self) -> Result<BatchOutcome, BatchError> {
        let limit = self.batch_limit;
        let batch = self
            .db
            .run_blocking(move |db| db.select_pending(limit))
            .await?;

        if batch.is_empty() {
            info!("Summarizer: No pending messages");
            return Ok(BatchOutcome::NothingPending);
        }

        let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
        let eligible: Vec<&MessageRecord> = batch.iter().filter(|m| self.is_eligible(m)).collect();

        let (Some(first), Some(last)) = (eligible.first(), eligible.last()) else {
            let count = batch.len();
            info!(
                "Summarizer: All {} pending messages are shorter than {} chars, marking them",
                count, self.min_length
            );
            self.db
                .run_blocking(move |db| {
                    for id in ids {
                        db.mark_summarized(id)?;
                    }
                    Ok(())
                })
                .await?;
            return Ok(BatchOutcome::AllShort { count });
        };

        let document = build_document(&eligible);
        info!(
            "Summarizer: Summarizing {} of {} messages ({} chars)",
            eligible.len(),
            batch.len(),
            document.chars().count()
        );

        // Nothing is marked until the gateway has answered.
        let text = self.summarizer.summarize(&document).await.map_err(|e| {
            error!("Summarizer: Gateway call failed: {} ({})", e, e.cause);
            e
        })?;

        let draft = DigestDraft {
            origin_message_id: first.id,
            last_message_id: last.id,
            message_count: eligible.len(),
            text: text.clone(),
        };
        let (eligible_count, total) = (eligible.len(), batch.len());
        let digest_id = self
            .db
            .run_blocking(move |db| db.apply_batch(&draft, &ids))
            .await?;

        info!(
            "Summarizer: Stored digest {} covering {} messages",
            digest_id, total
        );
        Ok(BatchOutcome::Digest {
            digest_id,
            text,
            eligible: eligible_count,
            total,
        })
    }
}

/// `"{sender} ({date}):\n{text}"` blocks joined by [`DOCUMENT_SEPARATOR`].
pub fn build_document(messages: &[&MessageRecord]) -> String {
    messages
        .iter()
        .map(|m| format!("{} ({}):\n{}", m.sender, m.date, m.text))
        .collect::<Vec<_>>()
        .join(DOCUMENT_SEPARATOR)
}
