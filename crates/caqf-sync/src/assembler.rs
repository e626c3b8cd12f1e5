//! Practice-set assembly: scope → question ids from the index → one practice set plus links.

use std::sync::Arc;

use caqf_core::{month_label, IdentifierError, Scope, SourceIdentifier};
use caqf_storage::{NewPracticeSet, QuestionIndex, RelationalStore, StoreError};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("invalid range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error(transparent)]
    InvalidScope(#[from] IdentifierError),
    #[error("skill '{0}' not found")]
    SkillNotFound(String),
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error("no skills exist yet")]
    NoSkills,
    #[error("no questions found for {0}")]
    NoQuestionsFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledSet {
    pub id: i64,
    pub title: String,
    pub skill_id: i64,
    pub total_questions: usize,
    /// Links that were written; can be lower than `total_questions` when some failed.
    pub linked: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DailySetsReport {
    pub created: Vec<AssembledSet>,
    pub skipped: Vec<NaiveDate>,
}

/// A scope resolved against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Date { topic_name: String, skill_id: i64 },
    Month { label: String, skill_id: i64 },
    Trailing { days: u32, start: NaiveDate, end: NaiveDate },
    Range { start: NaiveDate, end: NaiveDate },
}

fn long_date(date: NaiveDate) -> String {
    date.format("%d %B %Y").to_string()
}

impl Target {
    pub(crate) fn title(&self) -> String {
        match self {
            Target::Date { topic_name, .. } => topic_name.clone(),
            Target::Month { label, .. } => format!("{label} Monthly Current Affairs"),
            Target::Trailing { days: 7, start, end } => format!(
                "Weekly Current Affairs ({} to {})",
                long_date(*start),
                long_date(*end)
            ),
            Target::Trailing { start, end, .. } | Target::Range { start, end } => format!(
                "Current Affairs ({} to {})",
                long_date(*start),
                long_date(*end)
            ),
        }
    }

    fn description(&self, total: usize) -> String {
        match self {
            Target::Date { topic_name, .. } => {
                let day = topic_name.trim_end_matches(" Current Affairs");
                format!(
                    "Practice set for {topic_name}. This set contains {total} questions to test your knowledge of current events from {day}."
                )
            }
            Target::Month { label, .. } => format!(
                "Monthly practice set for {label} Current Affairs. This comprehensive set contains {total} questions covering all important current events from {label}."
            ),
            Target::Trailing { days: 7, start, end } => format!(
                "Weekly practice set covering current affairs from {} to {}. This set contains {total} questions to test your knowledge of recent events.",
                long_date(*start),
                long_date(*end)
            ),
            Target::Trailing { start, end, .. } | Target::Range { start, end } => format!(
                "Practice set covering current affairs from {} to {}. This set contains {total} questions from this date range.",
                long_date(*start),
                long_date(*end)
            ),
        }
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    date.and_time(last_second).and_utc()
}

#[derive(Clone)]
pub struct PracticeSetAssembler {
    relational: Arc<dyn RelationalStore>,
    index: Arc<dyn QuestionIndex>,
}

impl PracticeSetAssembler {
    pub fn new(relational: Arc<dyn RelationalStore>, index: Arc<dyn QuestionIndex>) -> Self {
        Self { relational, index }
    }

    pub async fn assemble(&self, scope: Scope) -> Result<AssembledSet, AssembleError> {
        self.assemble_at(scope, Utc::now()).await
    }

    /// Like [`assemble`](Self::assemble) with trailing windows anchored on `now`.
    pub async fn assemble_at(
        &self,
        scope: Scope,
        now: DateTime<Utc>,
    ) -> Result<AssembledSet, AssembleError> {
        let (target, ids) = self.select(scope, now).await?;
        if ids.is_empty() {
            return Err(AssembleError::NoQuestionsFound(scope.to_string()));
        }
        let skill_id = self.skill_for(&target).await?;

        let title = target.title();
        let set = NewPracticeSet::new(&title, skill_id, ids.len(), target.description(ids.len()));
        let set_id = self.relational.create_practice_set(&set).await?;

        let mut linked = 0;
        for question_id in &ids {
            match self.relational.link_question(set_id, *question_id).await {
                Ok(()) => linked += 1,
                Err(err) => warn!(set_id, question_id, error = %err, "linking question failed"),
            }
        }
        info!(set_id, %title, total = ids.len(), linked, "practice set created");

        Ok(AssembledSet {
            id: set_id,
            title,
            skill_id,
            total_questions: ids.len(),
            linked,
        })
    }

    /// One date-scoped set per day in `start..=end`; days without a topic or questions are
    /// reported as skipped.
    pub async fn assemble_daily_sets(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DailySetsReport, AssembleError> {
        if start > end {
            return Err(AssembleError::InvalidRange { start, end });
        }
        let mut report = DailySetsReport::default();
        for day in start.iter_days().take_while(|d| *d <= end) {
            match self.assemble(Scope::Date(day)).await {
                Ok(set) => report.created.push(set),
                Err(
                    AssembleError::SkillNotFound(_)
                    | AssembleError::TopicNotFound(_)
                    | AssembleError::NoQuestionsFound(_),
                ) => {
                    info!(%day, "no questions, skipping day");
                    report.skipped.push(day);
                }
                Err(err) => {
                    warn!(%day, error = %err, "daily set failed");
                    report.skipped.push(day);
                }
            }
        }
        Ok(report)
    }

    /// Resolves a scope to its catalog target and matching question ids.
    pub(crate) async fn select(
        &self,
        scope: Scope,
        now: DateTime<Utc>,
    ) -> Result<(Target, Vec<i64>), AssembleError> {
        match scope {
            Scope::Date(date) => {
                let identifier = SourceIdentifier::new(date);
                let skill_name = identifier.skill_name();
                let skill_id = self
                    .relational
                    .find_skill_by_name(&skill_name)
                    .await?
                    .ok_or(AssembleError::SkillNotFound(skill_name))?;
                let topic_name = identifier.topic_name();
                let topic_id = self
                    .relational
                    .find_topic_by_name(&topic_name, skill_id)
                    .await?
                    .ok_or_else(|| AssembleError::TopicNotFound(topic_name.clone()))?;
                let ids = self.index.ids_for_topic(topic_id).await?;
                Ok((Target::Date { topic_name, skill_id }, ids))
            }
            Scope::Month { year, month } => {
                let label = month_label(year, month)?;
                let skill_id = self
                    .relational
                    .find_skill_by_name(&label)
                    .await?
                    .ok_or_else(|| AssembleError::SkillNotFound(label.clone()))?;
                let ids = self.index.ids_for_skill(skill_id).await?;
                Ok((Target::Month { label, skill_id }, ids))
            }
            Scope::TrailingDays(days) => {
                let from = now
                    .checked_sub_signed(Duration::days(i64::from(days)))
                    .ok_or(IdentifierError::InvalidTrailingDays(days))?;
                let ids = self.index.ids_created_between(from, now).await?;
                let target = Target::Trailing {
                    days,
                    start: from.date_naive(),
                    end: now.date_naive(),
                };
                Ok((target, ids))
            }
            Scope::Range { start, end } => {
                if start > end {
                    return Err(AssembleError::InvalidRange { start, end });
                }
                let ids = self
                    .index
                    .ids_created_between(start_of_day(start), end_of_day(end))
                    .await?;
                Ok((Target::Range { start, end }, ids))
            }
        }
    }

    async fn skill_for(&self, target: &Target) -> Result<i64, AssembleError> {
        match target {
            Target::Date { skill_id, .. } | Target::Month { skill_id, .. } => Ok(*skill_id),
            // Trailing windows can straddle months; the newest skill stands in.
            Target::Trailing { .. } => self.latest_skill().await,
            Target::Range { start, .. } => {
                let label = SourceIdentifier::new(*start).skill_name();
                match self.relational.find_skill_by_name(&label).await? {
                    Some(id) => Ok(id),
                    None => self.latest_skill().await,
                }
            }
        }
    }

    async fn latest_skill(&self) -> Result<i64, AssembleError> {
        self.relational
            .latest_skill()
            .await?
            .ok_or(AssembleError::NoSkills)
    }
}
