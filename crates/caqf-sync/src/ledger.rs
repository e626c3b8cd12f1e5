use std::sync::Arc;

use caqf_core::{LedgerEntry, SourceIdentifier};
use caqf_storage::{LedgerStats, LedgerStore, MarkOutcome, StoreResult};
use chrono::Utc;
use tracing::info;

/// Durable record of identifiers whose page has been ingested. Checked before any network
/// call; entries are never updated or removed.
#[derive(Clone)]
pub struct DedupLedger {
    store: Arc<dyn LedgerStore>,
    base_url: String,
}

impl DedupLedger {
    pub fn new(store: Arc<dyn LedgerStore>, base_url: impl Into<String>) -> Self {
        Self {
            store,
            base_url: base_url.into(),
        }
    }

    pub async fn is_processed(&self, identifier: &SourceIdentifier) -> StoreResult<bool> {
        self.store.contains(&identifier.url(&self.base_url)).await
    }

    pub async fn mark_processed(&self, identifier: &SourceIdentifier) -> StoreResult<MarkOutcome> {
        let entry = LedgerEntry {
            url: identifier.url(&self.base_url),
            source_date: identifier.date(),
            processed: true,
            scraped_at: Utc::now(),
        };
        let outcome = self.store.insert_if_absent(&entry).await?;
        if outcome == MarkOutcome::AlreadyMarked {
            info!(url = %entry.url, "already marked");
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> StoreResult<LedgerStats> {
        self.store.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caqf_core::{identifier_for_date, DEFAULT_SOURCE_BASE_URL};
    use caqf_storage::memory::InMemoryDocumentStore;

    #[tokio::test]
    async fn marking_is_idempotent_and_scoped_to_one_identifier() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let ledger = DedupLedger::new(store.clone(), DEFAULT_SOURCE_BASE_URL);
        let day = identifier_for_date(2024, 3, 15).unwrap();
        let other = identifier_for_date(2024, 3, 16).unwrap();

        assert!(!ledger.is_processed(&day).await.unwrap());
        assert_eq!(ledger.mark_processed(&day).await.unwrap(), MarkOutcome::Marked);
        assert_eq!(ledger.mark_processed(&day).await.unwrap(), MarkOutcome::AlreadyMarked);
        assert!(ledger.is_processed(&day).await.unwrap());
        assert!(!ledger.is_processed(&other).await.unwrap());

        let entries = store.ledger_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].url, "https://www.indiabix.com/current-affairs/2024-03-15");
        assert!(entries[0].processed);
    }

    #[tokio::test]
    async fn unreachable_store_propagates() {
        let store = Arc::new(InMemoryDocumentStore::new());
        store.set_unavailable(true);
        let ledger = DedupLedger::new(store, DEFAULT_SOURCE_BASE_URL);
        let day = identifier_for_date(2024, 3, 15).unwrap();
        assert!(ledger.is_processed(&day).await.is_err());
    }
}
