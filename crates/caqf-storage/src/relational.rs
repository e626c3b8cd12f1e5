//! Relational catalog: skills, topics, questions and practice sets.

use async_trait::async_trait;
use caqf_core::{
    encode_answer_marker, slugify, TranslatedQuestion, DIFFICULTY_LEVEL_ID,
    PRACTICE_SET_SUB_CATEGORY_ID, QUESTION_TYPE_ID, SECTION_ID,
};
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::{classify_store_error, retry_with_backoff, BackoffPolicy, StoreError, StoreResult};

const CODE_SUFFIX_LEN: usize = 10;

/// `prefix` followed by ten random ASCII alphanumerics, e.g. `skl_a8Zk03PqLm`.
pub fn generate_code(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CODE_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

fn paragraph(text: &str) -> String {
    format!("<p>{text}</p>")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSkill {
    pub name: String,
    pub code: String,
    pub slug: String,
    pub section_id: i64,
    pub short_description: String,
}

impl NewSkill {
    pub fn for_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            code: generate_code("skl_"),
            slug: slugify(name),
            section_id: SECTION_ID,
            short_description: format!("Current affairs questions for {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub name: String,
    pub code: String,
    pub slug: String,
    pub skill_id: i64,
    pub short_description: String,
}

impl NewTopic {
    pub fn for_name(name: &str, skill_id: i64) -> Self {
        Self {
            name: name.to_string(),
            code: generate_code("top_"),
            slug: slugify(name),
            skill_id,
            short_description: format!("Questions from {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewQuestion {
    pub code: String,
    pub question_type_id: i64,
    pub question_html: String,
    pub options: Value,
    pub correct_answer: String,
    pub default_marks: i32,
    pub default_time: i32,
    pub skill_id: i64,
    pub topic_id: i64,
    pub difficulty_level_id: i64,
    pub preferences: Value,
    pub solution_html: String,
}

impl NewQuestion {
    pub fn from_translated(question: &TranslatedQuestion, skill_id: i64, topic_id: i64) -> Self {
        let options = question
            .options
            .iter()
            .map(|option| json!({ "option": option, "partial_weightage": 0 }))
            .collect::<Vec<_>>();
        Self {
            code: generate_code("que_"),
            question_type_id: QUESTION_TYPE_ID,
            question_html: paragraph(&question.question),
            options: Value::Array(options),
            correct_answer: encode_answer_marker(question.correct_option),
            default_marks: 1,
            default_time: 60,
            skill_id,
            topic_id,
            difficulty_level_id: DIFFICULTY_LEVEL_ID,
            preferences: json!([]),
            solution_html: paragraph(&question.explanation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedQuestion {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPracticeSet {
    pub title: String,
    pub code: String,
    pub slug: String,
    pub sub_category_id: i64,
    pub skill_id: i64,
    pub description: String,
    pub total_questions: i32,
    pub auto_grading: bool,
    pub allow_rewards: bool,
    pub settings: Value,
    pub is_paid: bool,
}

impl NewPracticeSet {
    pub fn new(title: &str, skill_id: i64, total_questions: usize, description: String) -> Self {
        Self {
            title: title.to_string(),
            code: generate_code("set_"),
            slug: slugify(title),
            sub_category_id: PRACTICE_SET_SUB_CATEGORY_ID,
            skill_id,
            description,
            total_questions: i32::try_from(total_questions).unwrap_or(i32::MAX),
            auto_grading: true,
            allow_rewards: true,
            settings: json!({ "show_reward_popup": true }),
            is_paid: false,
        }
    }
}

/// Stored question as read back for export.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionRow {
    pub id: i64,
    pub code: String,
    pub question: String,
    pub options: Value,
    pub correct_answer: String,
    pub solution: String,
    pub skill_id: i64,
    pub topic_id: i64,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn find_skill_by_name(&self, name: &str) -> StoreResult<Option<i64>>;
    /// Returns `None` when a live skill with the same name already exists.
    async fn insert_skill_if_absent(&self, skill: &NewSkill) -> StoreResult<Option<i64>>;
    async fn find_topic_by_name(&self, name: &str, skill_id: i64) -> StoreResult<Option<i64>>;
    /// Returns `None` when a live topic with the same name already exists under the skill.
    async fn insert_topic_if_absent(&self, topic: &NewTopic) -> StoreResult<Option<i64>>;
    async fn latest_skill(&self) -> StoreResult<Option<i64>>;
    async fn insert_question(&self, question: &NewQuestion) -> StoreResult<InsertedQuestion>;
    async fn create_practice_set(&self, set: &NewPracticeSet) -> StoreResult<i64>;
    async fn link_question(&self, practice_set_id: i64, question_id: i64) -> StoreResult<()>;
    async fn question_details(&self, ids: &[i64]) -> StoreResult<Vec<QuestionRow>>;

    async fn get_or_create_skill(&self, name: &str) -> StoreResult<i64> {
        if let Some(id) = self.find_skill_by_name(name).await? {
            return Ok(id);
        }
        if let Some(id) = self.insert_skill_if_absent(&NewSkill::for_name(name)).await? {
            info!(skill = name, id, "created skill");
            return Ok(id);
        }
        // Lost the insert race; the winner's row is live now.
        debug!(skill = name, "skill created concurrently, re-reading");
        self.find_skill_by_name(name)
            .await?
            .ok_or_else(|| StoreError::Missing(format!("skill '{name}'")))
    }

    async fn get_or_create_topic(&self, name: &str, skill_id: i64) -> StoreResult<i64> {
        if let Some(id) = self.find_topic_by_name(name, skill_id).await? {
            return Ok(id);
        }
        if let Some(id) = self
            .insert_topic_if_absent(&NewTopic::for_name(name, skill_id))
            .await?
        {
            info!(topic = name, skill_id, id, "created topic");
            return Ok(id);
        }
        debug!(topic = name, "topic created concurrently, re-reading");
        self.find_topic_by_name(name, skill_id)
            .await?
            .ok_or_else(|| StoreError::Missing(format!("topic '{name}'")))
    }
}

#[derive(Debug, Clone)]
pub struct PgRelationalStore {
    pool: PgPool,
    retry: BackoffPolicy,
}

impl PgRelationalStore {
    pub fn new(pool: PgPool, retry: BackoffPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations/relational")
            .run(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_insert_question(&self, question: &NewQuestion) -> StoreResult<InsertedQuestion> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO questions (
                code, question_type_id, question, options, correct_answer,
                default_marks, default_time, skill_id, topic_id, difficulty_level_id,
                preferences, solution, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, TRUE)
            RETURNING id, created_at
            "#,
        )
        .bind(&question.code)
        .bind(question.question_type_id)
        .bind(&question.question_html)
        .bind(&question.options)
        .bind(&question.correct_answer)
        .bind(question.default_marks)
        .bind(question.default_time)
        .bind(question.skill_id)
        .bind(question.topic_id)
        .bind(question.difficulty_level_id)
        .bind(&question.preferences)
        .bind(&question.solution_html)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(InsertedQuestion {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn try_create_practice_set(&self, set: &NewPracticeSet) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO practice_sets (
                title, code, slug, sub_category_id, skill_id, description,
                total_questions, auto_grading, allow_rewards, settings, is_paid, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, TRUE)
            RETURNING id
            "#,
        )
        .bind(&set.title)
        .bind(&set.code)
        .bind(&set.slug)
        .bind(set.sub_category_id)
        .bind(set.skill_id)
        .bind(&set.description)
        .bind(set.total_questions)
        .bind(set.auto_grading)
        .bind(set.allow_rewards)
        .bind(&set.settings)
        .bind(set.is_paid)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }
}

#[async_trait]
impl RelationalStore for PgRelationalStore {
    async fn find_skill_by_name(&self, name: &str) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT id FROM skills
             WHERE name = $1 AND section_id = $2 AND deleted_at IS NULL
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(name)
        .bind(SECTION_ID)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_skill_if_absent(&self, skill: &NewSkill) -> StoreResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO skills (name, code, slug, section_id, short_description, is_active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            ON CONFLICT (name, section_id) WHERE deleted_at IS NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&skill.name)
        .bind(&skill.code)
        .bind(&skill.slug)
        .bind(skill.section_id)
        .bind(&skill.short_description)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn find_topic_by_name(&self, name: &str, skill_id: i64) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT id FROM topics
             WHERE name = $1 AND skill_id = $2 AND deleted_at IS NULL
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(name)
        .bind(skill_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_topic_if_absent(&self, topic: &NewTopic) -> StoreResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO topics (name, code, slug, skill_id, short_description, is_active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            ON CONFLICT (name, skill_id) WHERE deleted_at IS NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&topic.name)
        .bind(&topic.code)
        .bind(&topic.slug)
        .bind(topic.skill_id)
        .bind(&topic.short_description)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn latest_skill(&self) -> StoreResult<Option<i64>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT id FROM skills
             WHERE section_id = $1 AND deleted_at IS NULL
             ORDER BY created_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(SECTION_ID)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn insert_question(&self, question: &NewQuestion) -> StoreResult<InsertedQuestion> {
        retry_with_backoff(&self.retry, "insert_question", classify_store_error, |_| {
            self.try_insert_question(question)
        })
        .await
    }

    async fn create_practice_set(&self, set: &NewPracticeSet) -> StoreResult<i64> {
        retry_with_backoff(&self.retry, "create_practice_set", classify_store_error, |_| {
            self.try_create_practice_set(set)
        })
        .await
    }

    async fn link_question(&self, practice_set_id: i64, question_id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO practice_set_questions (practice_set_id, question_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(practice_set_id)
        .bind(question_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn question_details(&self, ids: &[i64]) -> StoreResult<Vec<QuestionRow>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            r#"
            SELECT id, code, question, options, correct_answer, solution, skill_id, topic_id
              FROM questions
             WHERE id = ANY($1) AND deleted_at IS NULL
             ORDER BY id
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(QuestionRow {
                id: row.try_get("id")?,
                code: row.try_get("code")?,
                question: row.try_get("question")?,
                options: row.try_get("options")?,
                correct_answer: row.try_get("correct_answer")?,
                solution: row.try_get("solution")?,
                skill_id: row.try_get("skill_id")?,
                topic_id: row.try_get("topic_id")?,
            });
        }
        Ok(out)
    }
}
