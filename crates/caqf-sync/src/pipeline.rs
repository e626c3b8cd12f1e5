//! Per-identifier ingestion: ledger gate, fetch, catalog resolution, translate + dual write,
//! ledger mark.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use caqf_adapters::{QuestionSource, QuestionTranslator};
use caqf_core::{QuestionIndexEntry, RawQuestion, SourceIdentifier, SECTION_ID};
use caqf_storage::{NewQuestion, QuestionIndex, RelationalStore, StoreResult};
use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ledger::DedupLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub max_workers: usize,
    pub question_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            question_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IdentifierOutcome {
    /// Already in the ledger; nothing fetched.
    Skipped,
    /// Page had no question blocks. Marked so it is not refetched.
    NoContent,
    Ingested {
        persisted: usize,
        failed: usize,
        unindexed: usize,
    },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierReport {
    pub identifier: SourceIdentifier,
    #[serde(flatten)]
    pub outcome: IdentifierOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    /// Identifiers that persisted at least one question.
    pub succeeded: usize,
    pub skipped: usize,
    pub no_content: usize,
    pub failed: usize,
    pub questions_persisted: usize,
    pub questions_failed: usize,
    pub questions_unindexed: usize,
    pub reports: Vec<IdentifierReport>,
}

impl IngestionSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            no_content: 0,
            failed: 0,
            questions_persisted: 0,
            questions_failed: 0,
            questions_unindexed: 0,
            reports: Vec::new(),
        }
    }

    fn record(&mut self, identifier: SourceIdentifier, outcome: IdentifierOutcome) {
        self.attempted += 1;
        match &outcome {
            IdentifierOutcome::Skipped => self.skipped += 1,
            IdentifierOutcome::NoContent => self.no_content += 1,
            IdentifierOutcome::Ingested {
                persisted,
                failed,
                unindexed,
            } => {
                if *persisted > 0 {
                    self.succeeded += 1;
                }
                self.questions_persisted += persisted;
                self.questions_failed += failed;
                self.questions_unindexed += unindexed;
            }
            IdentifierOutcome::Failed { .. } => self.failed += 1,
        }
        self.reports.push(IdentifierReport { identifier, outcome });
    }

    pub fn outcome_for(&self, identifier: &SourceIdentifier) -> Option<&IdentifierOutcome> {
        self.reports
            .iter()
            .find(|r| &r.identifier == identifier)
            .map(|r| &r.outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuestionOutcome {
    Persisted,
    PersistedUnindexed,
    Failed,
}

#[derive(Clone)]
pub struct IngestionPipeline {
    ledger: DedupLedger,
    source: Arc<dyn QuestionSource>,
    translator: Arc<QuestionTranslator>,
    relational: Arc<dyn RelationalStore>,
    index: Arc<dyn QuestionIndex>,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    pub fn new(
        ledger: DedupLedger,
        source: Arc<dyn QuestionSource>,
        translator: Arc<QuestionTranslator>,
        relational: Arc<dyn RelationalStore>,
        index: Arc<dyn QuestionIndex>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            source,
            translator,
            relational,
            index,
            settings,
        }
    }

    /// Runs every identifier through the pipeline on a bounded worker pool. Never fails as a
    /// whole; per-identifier problems end up as [`IdentifierOutcome::Failed`].
    pub async fn ingest(&self, identifiers: Vec<SourceIdentifier>) -> IngestionSummary {
        let run_id = Uuid::new_v4();
        let mut summary = IngestionSummary::new(run_id, Utc::now());
        let span = info_span!("ingest", %run_id, identifiers = identifiers.len());

        async {
            let workers = Arc::new(Semaphore::new(self.settings.max_workers.max(1)));
            let mut tasks = JoinSet::new();
            for identifier in identifiers {
                let pipeline = self.clone();
                let workers = Arc::clone(&workers);
                tasks.spawn(
                    async move {
                        let _permit = workers.acquire_owned().await;
                        let outcome = AssertUnwindSafe(pipeline.ingest_one(identifier))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| IdentifierOutcome::Failed {
                                reason: "worker panicked".to_string(),
                            });
                        (identifier, outcome)
                    }
                    .in_current_span(),
                );
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((identifier, outcome)) => summary.record(identifier, outcome),
                    Err(err) => error!(error = %err, "ingestion worker aborted"),
                }
            }
        }
        .instrument(span)
        .await;

        summary.reports.sort_by_key(|r| r.identifier);
        summary.finished_at = Utc::now();
        info!(
            %run_id,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            no_content = summary.no_content,
            failed = summary.failed,
            questions_persisted = summary.questions_persisted,
            questions_failed = summary.questions_failed,
            questions_unindexed = summary.questions_unindexed,
            "ingestion finished"
        );
        summary
    }

    async fn ingest_one(&self, identifier: SourceIdentifier) -> IdentifierOutcome {
        let span = info_span!("identifier", %identifier);
        self.process(identifier).instrument(span).await
    }

    async fn process(&self, identifier: SourceIdentifier) -> IdentifierOutcome {
        match self.ledger.is_processed(&identifier).await {
            Ok(true) => {
                info!("already processed, skipping");
                return IdentifierOutcome::Skipped;
            }
            Ok(false) => {}
            Err(err) => return failed("ledger check", err),
        }

        let raw = match self.source.fetch(&identifier).await {
            Ok(raw) => raw,
            Err(err) => return failed("fetch", err),
        };

        if raw.is_empty() {
            return match self.ledger.mark_processed(&identifier).await {
                Ok(_) => IdentifierOutcome::NoContent,
                Err(err) => failed("ledger mark", err),
            };
        }

        let (skill_id, topic_id) = match self.resolve_catalog(&identifier).await {
            Ok(ids) => ids,
            Err(err) => return failed("skill/topic resolution", err),
        };

        let outcomes: Vec<QuestionOutcome> = stream::iter(raw)
            .map(|question| {
                let this = self.clone();
                async move { this.persist_question(question, skill_id, topic_id).await }
            })
            .buffer_unordered(self.settings.question_concurrency.max(1))
            .collect()
            .await;

        let failed_questions = outcomes
            .iter()
            .filter(|o| **o == QuestionOutcome::Failed)
            .count();
        let unindexed = outcomes
            .iter()
            .filter(|o| **o == QuestionOutcome::PersistedUnindexed)
            .count();
        let persisted = outcomes.len() - failed_questions;

        if let Err(err) = self.ledger.mark_processed(&identifier).await {
            return failed("ledger mark", err);
        }
        info!(persisted, failed = failed_questions, unindexed, "identifier ingested");
        IdentifierOutcome::Ingested {
            persisted,
            failed: failed_questions,
            unindexed,
        }
    }

    async fn resolve_catalog(&self, identifier: &SourceIdentifier) -> StoreResult<(i64, i64)> {
        let skill_id = self
            .relational
            .get_or_create_skill(&identifier.skill_name())
            .await?;
        let topic_id = self
            .relational
            .get_or_create_topic(&identifier.topic_name(), skill_id)
            .await?;
        Ok((skill_id, topic_id))
    }

    async fn persist_question(
        &self,
        raw: RawQuestion,
        skill_id: i64,
        topic_id: i64,
    ) -> QuestionOutcome {
        let Some(translated) = self.translator.translate(&raw).await else {
            warn!("question dropped after translation failure");
            return QuestionOutcome::Failed;
        };

        let row = NewQuestion::from_translated(&translated, skill_id, topic_id);
        let inserted = match self.relational.insert_question(&row).await {
            Ok(inserted) => inserted,
            Err(err) => {
                warn!(error = %err, "question insert failed");
                return QuestionOutcome::Failed;
            }
        };

        let entry = QuestionIndexEntry {
            question_id: inserted.id,
            section_id: SECTION_ID,
            skill_id,
            topic_id,
            created_at: inserted.created_at,
            question: translated.question,
            options: translated.options,
            correct_option: translated.correct_option,
            solution: translated.explanation,
        };
        match self.index.insert_entry(&entry).await {
            Ok(()) => QuestionOutcome::Persisted,
            Err(err) => {
                warn!(question_id = inserted.id, error = %err, "question index write failed");
                QuestionOutcome::PersistedUnindexed
            }
        }
    }
}

fn failed(stage: &str, err: impl std::fmt::Display) -> IdentifierOutcome {
    warn!(stage, error = %err, "identifier failed");
    IdentifierOutcome::Failed {
        reason: format!("{stage}: {err}"),
    }
}
