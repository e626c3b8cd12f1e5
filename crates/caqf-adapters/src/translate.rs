use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use caqf_core::{RawQuestion, TranslatedQuestion};
use caqf_storage::{
    classify_reqwest_error, classify_status, retry_with_backoff, BackoffPolicy, RetryDisposition,
};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const GOOGLE_TRANSLATE_ENDPOINT: &str = "https://translate.googleapis.com/translate_a/single";

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("translation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("translation service answered with status {0}")]
    Status(u16),
    #[error("unexpected translation payload: {0}")]
    Payload(String),
    #[error("translation came back empty")]
    Empty,
}

impl TranslateError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            TranslateError::Request(err) => classify_reqwest_error(err),
            TranslateError::Status(code) => StatusCode::from_u16(*code)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            TranslateError::Payload(_) | TranslateError::Empty => RetryDisposition::Retryable,
        }
    }
}

/// Machine translation with source-language auto-detection.
#[async_trait]
pub trait TranslationService: Send + Sync {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslateError>;
}

#[derive(Debug, Clone)]
pub struct GoogleTranslateClient {
    client: reqwest::Client,
    endpoint: String,
}

impl GoogleTranslateClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building translation client")?;
        Ok(Self {
            client,
            endpoint: GOOGLE_TRANSLATE_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// The endpoint answers with `[[["translated", "original", ...], ...], ...]`; sentences
/// are split across the inner arrays.
fn join_segments(payload: &JsonValue) -> Result<String, TranslateError> {
    let segments = payload
        .get(0)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| TranslateError::Payload("missing segment list".into()))?;
    Ok(segments
        .iter()
        .filter_map(|segment| segment.get(0).and_then(JsonValue::as_str))
        .collect())
}

#[async_trait]
impl TranslationService for GoogleTranslateClient {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslateError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("client", "gtx"),
                ("sl", "auto"),
                ("tl", target_language),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TranslateError::Status(status.as_u16()));
        }
        let payload: JsonValue = resp.json().await?;
        join_segments(&payload)
    }
}

/// What happens to a field whose translation keeps failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExhaustedPolicy {
    /// Keep the untranslated text for that field.
    #[default]
    KeepOriginal,
    /// Drop the whole question.
    SkipQuestion,
}

impl FromStr for ExhaustedPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keep-original" | "keep_original" => Ok(Self::KeepOriginal),
            "skip-question" | "skip_question" => Ok(Self::SkipQuestion),
            other => Err(format!("unknown translation fallback '{other}'")),
        }
    }
}

impl fmt::Display for ExhaustedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeepOriginal => "keep-original",
            Self::SkipQuestion => "skip-question",
        })
    }
}

#[derive(Clone)]
pub struct QuestionTranslator {
    service: Arc<dyn TranslationService>,
    target_language: String,
    retry: BackoffPolicy,
    policy: ExhaustedPolicy,
}

impl QuestionTranslator {
    pub fn new(
        service: Arc<dyn TranslationService>,
        target_language: impl Into<String>,
        retry: BackoffPolicy,
        policy: ExhaustedPolicy,
    ) -> Self {
        Self {
            service,
            target_language: target_language.into(),
            retry,
            policy,
        }
    }

    pub fn policy(&self) -> ExhaustedPolicy {
        self.policy
    }

    /// Translates question, options (order kept) and explanation. `None` only under
    /// [`ExhaustedPolicy::SkipQuestion`] when some field could not be translated.
    pub async fn translate(&self, raw: &RawQuestion) -> Option<TranslatedQuestion> {
        let question = self.translate_field(&raw.question).await?;
        let mut options = Vec::with_capacity(raw.options.len());
        for option in &raw.options {
            options.push(self.translate_field(option).await?);
        }
        let explanation = self.translate_field(&raw.explanation).await?;

        Some(TranslatedQuestion {
            question,
            options,
            correct_option: raw.correct_option,
            explanation,
            source: raw.source,
        })
    }

    async fn translate_field(&self, text: &str) -> Option<String> {
        if text.trim().is_empty() {
            return Some(text.to_string());
        }
        let attempt = retry_with_backoff(
            &self.retry,
            "translate",
            TranslateError::disposition,
            |_| async move {
                let translated = self.service.translate(text, &self.target_language).await?;
                if translated.trim().is_empty() {
                    return Err(TranslateError::Empty);
                }
                Ok(translated)
            },
        )
        .await;

        match (attempt, self.policy) {
            (Ok(translated), _) => Some(translated),
            (Err(err), ExhaustedPolicy::KeepOriginal) => {
                warn!(error = %err, "translation exhausted, keeping original text");
                Some(text.to_string())
            }
            (Err(err), ExhaustedPolicy::SkipQuestion) => {
                warn!(error = %err, "translation exhausted, skipping question");
                None
            }
        }
    }
}
