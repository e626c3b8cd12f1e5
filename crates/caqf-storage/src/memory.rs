//! In-process store adapters. Used by tests and dry runs; semantics mirror the Postgres
//! adapters, including live-row uniqueness for skills and topics.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use caqf_core::{LedgerEntry, QuestionIndexEntry};
use chrono::{DateTime, Utc};

use crate::document::{LedgerStats, LedgerStore, MarkOutcome, QuestionIndex};
use crate::relational::{
    InsertedQuestion, NewPracticeSet, NewQuestion, NewSkill, NewTopic, QuestionRow,
    RelationalStore,
};
use crate::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredSkill {
    pub id: i64,
    pub skill: NewSkill,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredTopic {
    pub id: i64,
    pub topic: NewTopic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredQuestion {
    pub id: i64,
    pub question: NewQuestion,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPracticeSet {
    pub id: i64,
    pub set: NewPracticeSet,
}

#[derive(Debug, Default)]
struct RelationalState {
    next_id: i64,
    skills: Vec<StoredSkill>,
    topics: Vec<StoredTopic>,
    questions: Vec<StoredQuestion>,
    practice_sets: Vec<StoredPracticeSet>,
    links: Vec<(i64, i64)>,
}

impl RelationalState {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRelationalStore {
    state: Mutex<RelationalState>,
    unavailable: AtomicBool,
    question_inserts_failing: AtomicBool,
    rejected_links: Mutex<HashSet<i64>>,
}

impl InMemoryRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails only `insert_question`; catalog lookups keep working.
    pub fn set_question_inserts_failing(&self, failing: bool) {
        self.question_inserts_failing.store(failing, Ordering::SeqCst);
    }

    /// Makes `link_question` fail for this question id.
    pub fn reject_link_for(&self, question_id: i64) {
        if let Ok(mut rejected) = self.rejected_links.lock() {
            rejected.insert(question_id);
        }
    }

    pub fn skills(&self) -> Vec<StoredSkill> {
        self.read(|s| s.skills.clone())
    }

    pub fn topics(&self) -> Vec<StoredTopic> {
        self.read(|s| s.topics.clone())
    }

    pub fn questions(&self) -> Vec<StoredQuestion> {
        self.read(|s| s.questions.clone())
    }

    pub fn practice_sets(&self) -> Vec<StoredPracticeSet> {
        self.read(|s| s.practice_sets.clone())
    }

    pub fn links_for(&self, practice_set_id: i64) -> Vec<i64> {
        self.read(|s| {
            s.links
                .iter()
                .filter(|(set_id, _)| *set_id == practice_set_id)
                .map(|(_, question_id)| *question_id)
                .collect()
        })
    }

    fn read<T: Default>(&self, f: impl FnOnce(&RelationalState) -> T) -> T {
        self.state.lock().map(|s| f(&s)).unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RelationalState) -> T) -> StoreResult<T> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("relational store offline".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("relational store poisoned".into()))?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl RelationalStore for InMemoryRelationalStore {
    async fn find_skill_by_name(&self, name: &str) -> StoreResult<Option<i64>> {
        self.with_state(|s| {
            s.skills
                .iter()
                .find(|row| row.skill.name == name)
                .map(|row| row.id)
        })
    }

    async fn insert_skill_if_absent(&self, skill: &NewSkill) -> StoreResult<Option<i64>> {
        self.with_state(|s| {
            let taken = s
                .skills
                .iter()
                .any(|row| row.skill.name == skill.name && row.skill.section_id == skill.section_id);
            if taken {
                return None;
            }
            let id = s.allocate();
            s.skills.push(StoredSkill {
                id,
                skill: skill.clone(),
                created_at: Utc::now(),
            });
            Some(id)
        })
    }

    async fn find_topic_by_name(&self, name: &str, skill_id: i64) -> StoreResult<Option<i64>> {
        self.with_state(|s| {
            s.topics
                .iter()
                .find(|row| row.topic.name == name && row.topic.skill_id == skill_id)
                .map(|row| row.id)
        })
    }

    async fn insert_topic_if_absent(&self, topic: &NewTopic) -> StoreResult<Option<i64>> {
        self.with_state(|s| {
            let taken = s
                .topics
                .iter()
                .any(|row| row.topic.name == topic.name && row.topic.skill_id == topic.skill_id);
            if taken {
                return None;
            }
            let id = s.allocate();
            s.topics.push(StoredTopic {
                id,
                topic: topic.clone(),
            });
            Some(id)
        })
    }

    async fn latest_skill(&self) -> StoreResult<Option<i64>> {
        self.with_state(|s| {
            s.skills
                .iter()
                .max_by_key(|row| (row.created_at, row.id))
                .map(|row| row.id)
        })
    }

    async fn insert_question(&self, question: &NewQuestion) -> StoreResult<InsertedQuestion> {
        if self.question_inserts_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("questions table offline".into()));
        }
        self.with_state(|s| {
            let id = s.allocate();
            let created_at = Utc::now();
            s.questions.push(StoredQuestion {
                id,
                question: question.clone(),
                created_at,
            });
            InsertedQuestion { id, created_at }
        })
    }

    async fn create_practice_set(&self, set: &NewPracticeSet) -> StoreResult<i64> {
        self.with_state(|s| {
            let id = s.allocate();
            s.practice_sets.push(StoredPracticeSet {
                id,
                set: set.clone(),
            });
            id
        })
    }

    async fn link_question(&self, practice_set_id: i64, question_id: i64) -> StoreResult<()> {
        let rejected = self
            .rejected_links
            .lock()
            .map(|r| r.contains(&question_id))
            .unwrap_or(false);
        if rejected {
            return Err(StoreError::Missing(format!("question {question_id}")));
        }
        self.with_state(|s| s.links.push((practice_set_id, question_id)))
    }

    async fn question_details(&self, ids: &[i64]) -> StoreResult<Vec<QuestionRow>> {
        self.with_state(|s| {
            s.questions
                .iter()
                .filter(|row| ids.contains(&row.id))
                .map(|row| QuestionRow {
                    id: row.id,
                    code: row.question.code.clone(),
                    question: row.question.question_html.clone(),
                    options: row.question.options.clone(),
                    correct_answer: row.question.correct_answer.clone(),
                    solution: row.question.solution_html.clone(),
                    skill_id: row.question.skill_id,
                    topic_id: row.question.topic_id,
                })
                .collect()
        })
    }
}

#[derive(Debug, Default)]
struct DocumentState {
    ledger: BTreeMap<String, LedgerEntry>,
    index: BTreeMap<i64, QuestionIndexEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<DocumentState>,
    unavailable: AtomicBool,
    index_unavailable: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every ledger and index call.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fails only question-index writes; the ledger keeps working.
    pub fn set_index_unavailable(&self, unavailable: bool) {
        self.index_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn ledger_entries(&self) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .map(|s| s.ledger.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn index_entries(&self) -> Vec<QuestionIndexEntry> {
        self.state
            .lock()
            .map(|s| s.index.values().cloned().collect())
            .unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DocumentState) -> T) -> StoreResult<T> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("document store offline".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("document store poisoned".into()))?;
        Ok(f(&mut state))
    }

    fn index_ids(&self, keep: impl Fn(&QuestionIndexEntry) -> bool) -> StoreResult<Vec<i64>> {
        self.with_state(|s| {
            s.index
                .values()
                .filter(|entry| keep(entry))
                .map(|entry| entry.question_id)
                .collect()
        })
    }
}

#[async_trait]
impl LedgerStore for InMemoryDocumentStore {
    async fn contains(&self, url: &str) -> StoreResult<bool> {
        self.with_state(|s| s.ledger.contains_key(url))
    }

    async fn insert_if_absent(&self, entry: &LedgerEntry) -> StoreResult<MarkOutcome> {
        self.with_state(|s| {
            if s.ledger.contains_key(&entry.url) {
                MarkOutcome::AlreadyMarked
            } else {
                s.ledger.insert(entry.url.clone(), entry.clone());
                MarkOutcome::Marked
            }
        })
    }

    async fn stats(&self) -> StoreResult<LedgerStats> {
        self.with_state(|s| LedgerStats::from_dates(s.ledger.values().map(|e| e.source_date)))
    }
}

#[async_trait]
impl QuestionIndex for InMemoryDocumentStore {
    async fn insert_entry(&self, entry: &QuestionIndexEntry) -> StoreResult<()> {
        if self.index_unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("question index offline".into()));
        }
        self.with_state(|s| {
            s.index.entry(entry.question_id).or_insert_with(|| entry.clone());
        })
    }

    async fn ids_for_skill(&self, skill_id: i64) -> StoreResult<Vec<i64>> {
        self.index_ids(|e| e.skill_id == skill_id)
    }

    async fn ids_for_topic(&self, topic_id: i64) -> StoreResult<Vec<i64>> {
        self.index_ids(|e| e.topic_id == topic_id)
    }

    async fn ids_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<i64>> {
        self.index_ids(|e| e.created_at >= start && e.created_at <= end)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::NaiveDate;
    use tokio::task::JoinSet;

    fn entry(url: &str) -> LedgerEntry {
        LedgerEntry {
            url: url.to_string(),
            source_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            processed: true,
            scraped_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn get_or_create_skill_is_idempotent() {
        let store = InMemoryRelationalStore::new();
        let first = store.get_or_create_skill("March 2024").await.unwrap();
        let second = store.get_or_create_skill("March 2024").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.skills().len(), 1);
        assert!(store.skills()[0].skill.code.starts_with("skl_"));
        assert_eq!(store.skills()[0].skill.slug, "march-2024");
    }

    #[tokio::test]
    async fn concurrent_get_or_create_yields_one_skill_and_one_topic() {
        let store = Arc::new(InMemoryRelationalStore::new());
        let mut tasks = JoinSet::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                let skill = store.get_or_create_skill("March 2024").await?;
                let topic = store
                    .get_or_create_topic("15 March 2024 Current Affairs", skill)
                    .await?;
                Ok::<_, StoreError>((skill, topic))
            });
        }
        let mut seen = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            seen.insert(joined.unwrap().unwrap());
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(store.skills().len(), 1);
        assert_eq!(store.topics().len(), 1);
    }

    #[tokio::test]
    async fn topics_are_scoped_to_their_skill() {
        let store = InMemoryRelationalStore::new();
        let march = store.get_or_create_skill("March 2024").await.unwrap();
        let april = store.get_or_create_skill("April 2024").await.unwrap();
        let a = store.get_or_create_topic("Shared", march).await.unwrap();
        let b = store.get_or_create_topic("Shared", april).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.find_topic_by_name("Shared", march).await.unwrap(), Some(a));
        assert_eq!(store.latest_skill().await.unwrap(), Some(april));
    }

    #[tokio::test]
    async fn ledger_double_mark_keeps_one_entry() {
        let store = InMemoryDocumentStore::new();
        let url = "https://www.indiabix.com/current-affairs/2024-03-15";
        assert!(!store.contains(url).await.unwrap());
        assert_eq!(store.insert_if_absent(&entry(url)).await.unwrap(), MarkOutcome::Marked);
        assert_eq!(
            store.insert_if_absent(&entry(url)).await.unwrap(),
            MarkOutcome::AlreadyMarked
        );
        assert!(store.contains(url).await.unwrap());
        assert!(!store
            .contains("https://www.indiabix.com/current-affairs/2024-03-16")
            .await
            .unwrap());
        assert_eq!(store.ledger_entries().len(), 1);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn offline_stores_report_unavailable() {
        let documents = InMemoryDocumentStore::new();
        documents.set_unavailable(true);
        assert!(matches!(
            documents.contains("x").await,
            Err(StoreError::Unavailable(_))
        ));

        let relational = InMemoryRelationalStore::new();
        relational.set_unavailable(true);
        assert!(relational.get_or_create_skill("March 2024").await.is_err());
    }
}
