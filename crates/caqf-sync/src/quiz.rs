//! Random quiz export from stored questions.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use caqf_core::{decode_answer_marker, Scope};
use caqf_storage::{QuestionRow, RelationalStore};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::assembler::{AssembleError, PracticeSetAssembler};

pub const DEFAULT_QUIZ_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub id: i64,
    pub code: String,
    pub question: String,
    pub options: Vec<String>,
    /// 0-based.
    pub correct_index: usize,
    pub solution: String,
    pub skill_id: i64,
    pub topic_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub questions: Vec<QuizQuestion>,
}

impl Quiz {
    pub async fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self).context("serializing quiz")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("writing quiz to {}", path.display()))?;
        info!(path = %path.display(), questions = self.questions.len(), "quiz written");
        Ok(())
    }
}

fn option_texts(options: &JsonValue) -> Vec<String> {
    options
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("option").and_then(JsonValue::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl From<QuestionRow> for QuizQuestion {
    fn from(row: QuestionRow) -> Self {
        let correct_index = decode_answer_marker(&row.correct_answer)
            .and_then(|index| index.checked_sub(1))
            .unwrap_or_else(|| {
                warn!(id = row.id, marker = %row.correct_answer, "unreadable answer marker");
                0
            });
        Self {
            id: row.id,
            code: row.code,
            question: row.question,
            options: option_texts(&row.options),
            correct_index,
            solution: row.solution,
            skill_id: row.skill_id,
            topic_id: row.topic_id,
        }
    }
}

#[derive(Clone)]
pub struct QuizExporter {
    relational: Arc<dyn RelationalStore>,
    assembler: PracticeSetAssembler,
}

impl QuizExporter {
    pub fn new(relational: Arc<dyn RelationalStore>, assembler: PracticeSetAssembler) -> Self {
        Self {
            relational,
            assembler,
        }
    }

    /// Picks up to `size` random questions from the scope.
    pub async fn build(
        &self,
        scope: Scope,
        size: usize,
        now: DateTime<Utc>,
    ) -> Result<Quiz, AssembleError> {
        let (_, ids) = self.assembler.select(scope, now).await?;
        if ids.is_empty() {
            return Err(AssembleError::NoQuestionsFound(scope.to_string()));
        }
        let picked: Vec<i64> = if ids.len() <= size {
            ids
        } else {
            ids.choose_multiple(&mut rand::thread_rng(), size)
                .copied()
                .collect()
        };
        let rows = self.relational.question_details(&picked).await?;

        Ok(Quiz {
            title: format!("Current Affairs Quiz - {}", now.format("%d %B %Y")),
            created_at: now,
            questions: rows.into_iter().map(QuizQuestion::from).collect(),
        })
    }
}

/// `quiz_march_2024.json`, `quiz_15_march_2024.json`, ...
pub fn default_quiz_filename(scope: &Scope) -> String {
    let label = match *scope {
        Scope::Date(date) => date.format("%d %B %Y").to_string(),
        Scope::Month { year, month } => {
            caqf_core::month_label(year, month).unwrap_or_else(|_| format!("{year} {month}"))
        }
        Scope::TrailingDays(7) => "week".to_string(),
        Scope::TrailingDays(days) => format!("last {days} days"),
        Scope::Range { start, end } => format!("{start} to {end}"),
    };
    format!("quiz_{}.json", label.to_lowercase().replace([' ', '-'], "_"))
}
