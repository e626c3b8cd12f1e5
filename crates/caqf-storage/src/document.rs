//! Document store: the dedup ledger and the denormalized question index.
//!
//! Both collections live in their own Postgres database (JSONB bodies) reached through a pool
//! that is independent from the relational catalog's.

use async_trait::async_trait;
use caqf_core::{LedgerEntry, QuestionIndexEntry};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyCount {
    /// "March 2024"
    pub month: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: u64,
    /// Newest month first.
    pub monthly: Vec<MonthlyCount>,
}

impl LedgerStats {
    /// Groups source dates by calendar month, newest first.
    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        let mut buckets = std::collections::BTreeMap::<NaiveDate, u64>::new();
        let mut total = 0;
        for date in dates {
            let first = date.with_day(1).unwrap_or(date);
            *buckets.entry(first).or_default() += 1;
            total += 1;
        }
        let monthly = buckets
            .into_iter()
            .rev()
            .map(|(first, count)| MonthlyCount {
                month: first.format("%B %Y").to_string(),
                count,
            })
            .collect();
        Self { total, monthly }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn contains(&self, url: &str) -> StoreResult<bool>;
    async fn insert_if_absent(&self, entry: &LedgerEntry) -> StoreResult<MarkOutcome>;
    async fn stats(&self) -> StoreResult<LedgerStats>;
}

#[async_trait]
pub trait QuestionIndex: Send + Sync {
    async fn insert_entry(&self, entry: &QuestionIndexEntry) -> StoreResult<()>;
    async fn ids_for_skill(&self, skill_id: i64) -> StoreResult<Vec<i64>>;
    async fn ids_for_topic(&self, topic_id: i64) -> StoreResult<Vec<i64>>;
    /// Inclusive on both ends.
    async fn ids_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>>;
}

#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations/documents")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    async fn ids_where(&self, sql: &str, key: i64) -> StoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl LedgerStore for PgDocumentStore {
    async fn contains(&self, url: &str) -> StoreResult<bool> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM ledger_entries WHERE url = $1)")
                .bind(url)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn insert_if_absent(&self, entry: &LedgerEntry) -> StoreResult<MarkOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (url, source_date, processed, scraped_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(&entry.url)
        .bind(entry.source_date)
        .bind(entry.processed)
        .bind(entry.scraped_at)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 0 {
            MarkOutcome::AlreadyMarked
        } else {
            MarkOutcome::Marked
        })
    }

    async fn stats(&self) -> StoreResult<LedgerStats> {
        let rows = sqlx::query(
            r#"
            SELECT date_trunc('month', source_date)::date AS month, COUNT(*) AS count
              FROM ledger_entries
             GROUP BY 1
             ORDER BY 1 DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = LedgerStats::default();
        for row in rows {
            let month: NaiveDate = row.try_get("month")?;
            let count: i64 = row.try_get("count")?;
            let count = u64::try_from(count).unwrap_or_default();
            stats.total += count;
            stats.monthly.push(MonthlyCount {
                month: month.format("%B %Y").to_string(),
                count,
            });
        }
        Ok(stats)
    }
}

#[async_trait]
impl QuestionIndex for PgDocumentStore {
    async fn insert_entry(&self, entry: &QuestionIndexEntry) -> StoreResult<()> {
        let body = serde_json::to_value(entry)?;
        sqlx::query(
            r#"
            INSERT INTO question_index (question_id, section_id, skill_id, topic_id, created_at, body)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (question_id) DO NOTHING
            "#,
        )
        .bind(entry.question_id)
        .bind(entry.section_id)
        .bind(entry.skill_id)
        .bind(entry.topic_id)
        .bind(entry.created_at)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ids_for_skill(&self, skill_id: i64) -> StoreResult<Vec<i64>> {
        self.ids_where(
            "SELECT question_id FROM question_index WHERE skill_id = $1 ORDER BY question_id",
            skill_id,
        )
        .await
    }

    async fn ids_for_topic(&self, topic_id: i64) -> StoreResult<Vec<i64>> {
        self.ids_where(
            "SELECT question_id FROM question_index WHERE topic_id = $1 ORDER BY question_id",
            topic_id,
        )
        .await
    }

    async fn ids_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT question_id FROM question_index
             WHERE created_at >= $1 AND created_at <= $2
             ORDER BY question_id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
