//! Current-affairs page source + translation adapters.

use async_trait::async_trait;
use caqf_core::{option_index_from_marker, RawQuestion, SourceIdentifier};
use caqf_storage::{FetchError, HttpFetcher, PageResponse};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info};

pub mod translate;

pub use translate::{
    ExhaustedPolicy, GoogleTranslateClient, QuestionTranslator, TranslateError, TranslationService,
};

pub const CRATE_NAME: &str = "caqf-adapters";

const BLOCK_SELECTOR: &str = ".bix-div-container";
const QUESTION_SELECTOR: &str = ".bix-td-qtxt";
const OPTION_SELECTOR: &str = ".bix-td-option";
const ANSWER_SELECTOR: &str = ".jq-hdnakqb";
const EXPLANATION_SELECTOR: &str = ".bix-ans-description";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("invalid selector `{selector}`: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
}

/// Produces the raw question blocks published for one identifier. An empty vec means the
/// source has nothing for that day.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    async fn fetch(&self, identifier: &SourceIdentifier) -> Result<Vec<RawQuestion>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct CurrentAffairsSource {
    http: HttpFetcher,
    base_url: String,
}

impl CurrentAffairsSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl QuestionSource for CurrentAffairsSource {
    async fn fetch(&self, identifier: &SourceIdentifier) -> Result<Vec<RawQuestion>, SourceError> {
        let url = identifier.url(&self.base_url);
        match self.http.fetch_page(&url).await {
            Ok(PageResponse::Content { final_url, body }) => {
                let questions = parse_question_page(&body, *identifier)?;
                info!(url = %final_url, count = questions.len(), "parsed question page");
                Ok(questions)
            }
            Ok(PageResponse::NoContent { status }) => {
                info!(%url, status, "no content published");
                Ok(vec![])
            }
            Err(source) => Err(SourceError::Fetch { url, source }),
        }
    }
}

struct PageSelectors {
    block: Selector,
    question: Selector,
    option: Selector,
    answer: Selector,
    explanation: Selector,
}

impl PageSelectors {
    fn new() -> Result<Self, SourceError> {
        Ok(Self {
            block: parse_selector(BLOCK_SELECTOR)?,
            question: parse_selector(QUESTION_SELECTOR)?,
            option: parse_selector(OPTION_SELECTOR)?,
            answer: parse_selector(ANSWER_SELECTOR)?,
            explanation: parse_selector(EXPLANATION_SELECTOR)?,
        })
    }
}

fn parse_selector(selector: &'static str) -> Result<Selector, SourceError> {
    Selector::parse(selector).map_err(|e| SourceError::Selector {
        selector,
        message: e.to_string(),
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

/// Extracts well-formed question blocks from a page. Blocks with no question text, no options,
/// a missing or unknown answer marker, or a marker past the last option are dropped.
pub fn parse_question_page(
    html: &str,
    source: SourceIdentifier,
) -> Result<Vec<RawQuestion>, SourceError> {
    let selectors = PageSelectors::new()?;
    let document = Html::parse_document(html);

    let mut out = Vec::new();
    for (position, block) in document.select(&selectors.block).enumerate() {
        match parse_block(block, &selectors, source) {
            Some(question) => out.push(question),
            None => debug!(%source, position, "dropped malformed question block"),
        }
    }
    Ok(out)
}

fn parse_block(
    block: ElementRef<'_>,
    selectors: &PageSelectors,
    source: SourceIdentifier,
) -> Option<RawQuestion> {
    let question = block
        .select(&selectors.question)
        .next()
        .map(element_text)
        .filter(|text| !text.is_empty())?;
    let options: Vec<String> = block.select(&selectors.option).map(element_text).collect();
    let correct_option = block
        .select(&selectors.answer)
        .next()
        .and_then(|node| node.value().attr("value"))
        .and_then(option_index_from_marker)?;
    let explanation = block
        .select(&selectors.explanation)
        .next()
        .map(element_text)
        .unwrap_or_default();

    let parsed = RawQuestion {
        question,
        options,
        correct_option,
        explanation,
        source,
    };
    parsed.is_well_formed().then_some(parsed)
}
