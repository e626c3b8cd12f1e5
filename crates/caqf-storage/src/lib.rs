//! Retry/backoff, HTTP fetch utilities and datastore adapters for CAQF.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub mod document;
pub mod memory;
pub mod pool;
pub mod relational;

pub use document::{LedgerStats, LedgerStore, MarkOutcome, MonthlyCount, PgDocumentStore, QuestionIndex};
pub use pool::{connect_pool, PoolSettings};
pub use relational::{
    generate_code, InsertedQuestion, NewPracticeSet, NewQuestion, NewSkill, NewTopic,
    PgRelationalStore, QuestionRow, RelationalStore,
};

pub const CRATE_NAME: &str = "caqf-storage";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:108.0) Gecko/20100101 Firefox/108.0",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("row missing: {0}")]
    Missing(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    match err {
        StoreError::Unavailable(_) => RetryDisposition::Retryable,
        StoreError::Database(db) => match db {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
            sqlx::Error::Database(e) => {
                // SQLSTATE class 08 is connection exceptions; 40001 is a serialization failure.
                let code = e.code().unwrap_or_default();
                if code.starts_with("08") || code == "40001" {
                    RetryDisposition::Retryable
                } else {
                    RetryDisposition::NonRetryable
                }
            }
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Policy with no sleeping between attempts.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// `base * 2^attempt * (0.5 + rand())`, capped at `max_delay`.
    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        if !self.jitter {
            return delay;
        }
        let factor = 0.5 + rand::thread_rng().gen::<f64>();
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy's attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    operation: &str,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if classify(&err) == RetryDisposition::NonRetryable || attempt + 1 >= max_attempts {
                    return Err(err);
                }
                let delay = policy.jittered_delay(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Fixed user agent; when unset a browser agent is picked at random per request.
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Randomized pause taken before every request, as (min, max).
    pub politeness_delay: Option<(Duration, Duration)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
            politeness_delay: Some((Duration::from_secs(1), Duration::from_secs(3))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageResponse {
    Content { final_url: String, body: String },
    NoContent { status: u16 },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    user_agent: Option<String>,
    backoff: BackoffPolicy,
    politeness_delay: Option<(Duration, Duration)>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            user_agent: config.user_agent,
            backoff: config.backoff,
            politeness_delay: config.politeness_delay,
        })
    }

    fn pick_user_agent(&self) -> String {
        if let Some(agent) = &self.user_agent {
            return agent.clone();
        }
        USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string()
    }

    async fn polite_pause(&self) {
        let Some((min, max)) = self.politeness_delay else {
            return;
        };
        let pause = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    /// GETs a page. Missing pages and empty bodies are `NoContent`; 5xx, 429 and network
    /// failures are retried per the backoff policy before surfacing as errors.
    pub async fn fetch_page(&self, url: &str) -> Result<PageResponse, FetchError> {
        let _permit = self.limit.acquire().await;
        let span = info_span!("http_fetch", url);

        async {
            retry_with_backoff(&self.backoff, "http_fetch", FetchError::disposition, |attempt| async move {
                self.polite_pause().await;
                debug!(attempt, "requesting page");
                let resp = self
                    .client
                    .get(url)
                    .header(USER_AGENT, self.pick_user_agent())
                    .send()
                    .await?;
                let status = resp.status();
                let final_url = resp.url().to_string();

                if status.is_success() {
                    let body = resp.text().await?;
                    if body.trim().is_empty() {
                        return Ok(PageResponse::NoContent { status: status.as_u16() });
                    }
                    return Ok(PageResponse::Content { final_url, body });
                }

                if classify_status(status) == RetryDisposition::NonRetryable {
                    return Ok(PageResponse::NoContent { status: status.as_u16() });
                }

                Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                })
            })
            .await
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering `path -> (status, body)`; unknown paths get 404.
    /// Returns the base url and the list of requested paths.
    async fn serve(routes: Vec<(&'static str, u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let routes: Arc<HashMap<&'static str, (u16, &'static str)>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, status, body)| (path, (status, body)))
                .collect(),
        );
        let hits = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let seen = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = Arc::clone(&routes);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    while read < buf.len() {
                        let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = routes.get(path.as_str()).copied().unwrap_or((404, ""));
                    seen.lock().unwrap().push(path);
                    let response = format!(
                        "HTTP/1.1 {status} Status\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (base, hits)
    }

    fn test_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::immediate(3),
            politeness_delay: None,
        })
        .unwrap()
    }

    fn hit_count(hits: &Mutex<Vec<String>>, path: &str) -> usize {
        hits.lock().unwrap().iter().filter(|p| p.as_str() == path).count()
    }

    #[tokio::test]
    async fn missing_and_empty_pages_are_no_content_without_retries() {
        let (base, hits) = serve(vec![
            ("/gone", 410, "gone"),
            ("/forbidden", 403, "no"),
            ("/empty", 200, "  "),
            ("/page", 200, "<html>ok</html>"),
        ])
        .await;
        let fetcher = test_fetcher();

        let missing = fetcher.fetch_page(&format!("{base}/missing")).await.unwrap();
        assert_eq!(missing, PageResponse::NoContent { status: 404 });
        let gone = fetcher.fetch_page(&format!("{base}/gone")).await.unwrap();
        assert_eq!(gone, PageResponse::NoContent { status: 410 });
        let forbidden = fetcher.fetch_page(&format!("{base}/forbidden")).await.unwrap();
        assert_eq!(forbidden, PageResponse::NoContent { status: 403 });
        let empty = fetcher.fetch_page(&format!("{base}/empty")).await.unwrap();
        assert_eq!(empty, PageResponse::NoContent { status: 200 });

        match fetcher.fetch_page(&format!("{base}/page")).await.unwrap() {
            PageResponse::Content { final_url, body } => {
                assert_eq!(final_url, format!("{base}/page"));
                assert_eq!(body, "<html>ok</html>");
            }
            other => panic!("expected content, got {other:?}"),
        }

        for path in ["/missing", "/gone", "/forbidden", "/empty", "/page"] {
            assert_eq!(hit_count(&hits, path), 1, "{path}");
        }
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_retried_then_surface() {
        let (base, hits) = serve(vec![("/busy", 503, "busy"), ("/limited", 429, "slow down")]).await;
        let fetcher = test_fetcher();

        let busy = fetcher.fetch_page(&format!("{base}/busy")).await;
        assert!(matches!(busy, Err(FetchError::HttpStatus { status: 503, .. })));
        assert_eq!(hit_count(&hits, "/busy"), 3);

        let limited = fetcher.fetch_page(&format!("{base}/limited")).await;
        assert!(matches!(limited, Err(FetchError::HttpStatus { status: 429, .. })));
        assert_eq!(hit_count(&hits, "/limited"), 3);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = test_fetcher().fetch_page(&format!("http://{addr}/2024-03-15")).await;
        assert!(matches!(result, Err(FetchError::Request(_))));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half_times_the_base() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..200 {
            let delay = policy.jittered_delay(2);
            assert!(delay >= Duration::from_millis(200), "{delay:?}");
            assert!(delay <= Duration::from_millis(600), "{delay:?}");
        }
    }

    #[test]
    fn status_classification_splits_terminal_and_transient() {
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::GONE), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_store_error(&StoreError::Unavailable("down".into())),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_store_error(&StoreError::Missing("skill".into())),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), StoreError> = retry_with_backoff(
            &BackoffPolicy::immediate(3),
            "test",
            classify_store_error,
            |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".into()))
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_non_retryable_errors() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: Result<(), StoreError> = retry_with_backoff(
            &BackoffPolicy::immediate(5),
            "test",
            classify_store_error,
            |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Missing("gone".into()))
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<usize, StoreError> = retry_with_backoff(
            &BackoffPolicy::immediate(5),
            "test",
            classify_store_error,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(StoreError::Unavailable("flaky".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
