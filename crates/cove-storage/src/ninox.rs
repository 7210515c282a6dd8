use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cove_core::CanonicalRecord;
use reqwest::{Method, RequestBuilder, StatusCode};
use tokio::sync::Semaphore;
use tracing::{debug, info, Instrument};

use crate::{RecordStore, StoreError};

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct NinoxConfig {
    /// Team endpoint, e.g. `https://api.ninoxdb.de/v1/teams/<team>`.
    pub base_url: String,
    pub api_key: String,
    /// Logical table name -> `databases/<db>/tables/<table>`.
    pub tables: BTreeMap<String, String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub per_page: usize,
    pub upsert_chunk: usize,
    pub backoff: BackoffPolicy,
}

impl Default for NinoxConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            tables: BTreeMap::new(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            per_page: 9000,
            upsert_chunk: 500,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct NinoxStore {
    client: reqwest::Client,
    config: NinoxConfig,
    limit: Arc<Semaphore>,
}

impl NinoxStore {
    pub fn new(config: NinoxConfig) -> Result<Self, StoreError> {
        if config.api_key.trim().is_empty() {
            return Err(StoreError::Config("NINOX_API_KEY is required for the ninox store".into()));
        }
        if config.base_url.trim().is_empty() {
            return Err(StoreError::Config("NINOX_BASE_URL is required for the ninox store".into()));
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
        })
    }

    pub fn records_url(&self, table: &str) -> Result<String, StoreError> {
        let path = self
            .config
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(format!(
            "{}/{}/records",
            self.config.base_url.trim_end_matches('/'),
            path.trim_matches('/')
        ))
    }

    pub fn record_url(&self, records_url: &str, id: u64) -> String {
        format!("{records_url}/{id}")
    }

    async fn execute<F>(&self, method: Method, url: &str, prepare: F) -> Result<Vec<u8>, StoreError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let backoff = self.config.backoff;

        for attempt in 0..=backoff.max_retries {
            let request = prepare(
                self.client
                    .request(method.clone(), url)
                    .bearer_auth(&self.config.api_key),
            );

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < backoff.max_retries {
                        debug!(%status, attempt, "retrying store request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying store request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        unreachable!("the final attempt always returns")
    }
}

#[async_trait]
impl RecordStore for NinoxStore {
    fn name(&self) -> &'static str {
        "ninox"
    }

    async fn fetch(&self, table: &str, filter: Option<&str>) -> Result<Vec<CanonicalRecord>, StoreError> {
        let url = self.records_url(table)?;
        let per_page = self.config.per_page.to_string();
        let span = tracing::info_span!("store_request", table, method = "GET");

        async {
            let body = self
                .execute(Method::GET, &url, |req| {
                    let req = req.query(&[("perPage", per_page.as_str())]);
                    match filter {
                        Some(filters) if !filters.is_empty() => req.query(&[("filters", filters)]),
                        _ => req,
                    }
                })
                .await?;
            let records: Vec<CanonicalRecord> =
                serde_json::from_slice(&body).map_err(|source| StoreError::Decode {
                    table: table.to_string(),
                    source,
                })?;
            info!(records = records.len(), "fetched table");
            Ok::<_, StoreError>(records)
        }
        .instrument(span)
        .await
    }

    async fn upsert(&self, table: &str, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        let url = self.records_url(table)?;
        let span = tracing::info_span!("store_request", table, method = "POST");

        async {
            let mut written = 0;
            for chunk in records.chunks(self.config.upsert_chunk.max(1)) {
                self.execute(Method::POST, &url, |req| req.json(chunk)).await?;
                written += chunk.len();
                info!(written, total = records.len(), "upserted chunk");
            }
            Ok::<_, StoreError>(written)
        }
        .instrument(span)
        .await
    }

    /// Ninox deletes one record per request.
    async fn delete(&self, table: &str, ids: &[u64]) -> Result<usize, StoreError> {
        let url = self.records_url(table)?;
        let span = tracing::info_span!("store_request", table, method = "DELETE");

        async {
            let mut removed = 0;
            for id in ids {
                self.execute(Method::DELETE, &self.record_url(&url, *id), |req| req)
                    .await?;
                removed += 1;
                debug!(id, "deleted record");
            }
            info!(removed, "deleted records");
            Ok::<_, StoreError>(removed)
        }
        .instrument(span)
        .await
    }
}
