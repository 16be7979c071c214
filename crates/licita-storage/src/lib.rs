//! HTTP fetch utilities + JSON backup storage for the harvester.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use licita_core::{compact_date, short_date, Contract, Item, ItemRecord, ListingPage};

pub const CRATE_NAME: &str = "licita-storage";

/// Classified outcome of a fetch, decided once at this boundary so
/// downstream components branch on meaning, not on transport details.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Terminal by design: callers read this as "no more data here".
    /// Never retried.
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
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
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` up to `1 + policy.max_retries` times, sleeping between
/// attempts. A not-found outcome is returned on the spot; any other
/// failure is retried until the attempt budget runs out, at which point
/// the last observed error surfaces.
pub async fn fetch_with_retry<T, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut last_error: Option<FetchError> = None;

    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ FetchError::NotFound { .. }) => return Err(err),
            Err(err) => {
                if attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = policy.max_retries + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(err);
            }
        }
    }

    Err(last_error.expect("retry loop records an error before exhausting attempts"))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Retrying JSON fetcher with a bounded per-request timeout.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            backoff: config.backoff,
        })
    }

    /// GET `url` and decode the JSON body, retrying transient failures.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        fetch_with_retry(&self.backoff, || self.get_json(url))
            .instrument(span)
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}

/// Query parameters for the contract-listing endpoint.
#[derive(Debug, Clone)]
pub struct ListingQuery {
    pub modality_code: u8,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub uf: Option<String>,
}

/// The two upstream endpoints the harvester consumes.
#[async_trait]
pub trait ProcurementApi: Send + Sync {
    /// One page of contract listings for the query window.
    async fn listing_page(
        &self,
        run_id: Uuid,
        query: &ListingQuery,
        page: u32,
    ) -> Result<ListingPage, FetchError>;

    /// One line item of a contract, by 1-based sequence index.
    async fn item(
        &self,
        run_id: Uuid,
        contract: &Contract,
        index: u32,
    ) -> Result<Item, FetchError>;
}

/// PNCP open-data client backed by the retrying fetcher.
#[derive(Debug)]
pub struct PncpClient {
    fetcher: HttpFetcher,
    consulta_base: String,
    integracao_base: String,
}

impl PncpClient {
    pub fn new(
        fetcher: HttpFetcher,
        consulta_base: impl Into<String>,
        integracao_base: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            consulta_base: consulta_base.into().trim_end_matches('/').to_string(),
            integracao_base: integracao_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn listing_url(&self, query: &ListingQuery, page: u32) -> String {
        let mut url = format!(
            "{}/v1/contratacoes/proposta?dataInicial={}&dataFinal={}",
            self.consulta_base,
            compact_date(query.window_start),
            compact_date(query.window_end),
        );
        if let Some(uf) = &query.uf {
            url.push_str(&format!("&uf={uf}"));
        }
        url.push_str(&format!(
            "&codigoModalidadeContratacao={}&pagina={page}",
            query.modality_code
        ));
        url
    }

    fn item_url(&self, contract: &Contract, index: u32) -> String {
        format!(
            "{}/v1/orgaos/{}/compras/{}/{}/itens/{index}",
            self.integracao_base,
            contract.orgao_entidade.cnpj,
            contract.ano_compra,
            contract.sequencial_compra,
        )
    }
}

#[async_trait]
impl ProcurementApi for PncpClient {
    async fn listing_page(
        &self,
        run_id: Uuid,
        query: &ListingQuery,
        page: u32,
    ) -> Result<ListingPage, FetchError> {
        self.fetcher
            .fetch_json(run_id, &self.listing_url(query, page))
            .await
    }

    async fn item(
        &self,
        run_id: Uuid,
        contract: &Contract,
        index: u32,
    ) -> Result<Item, FetchError> {
        self.fetcher
            .fetch_json(run_id, &self.item_url(contract, index))
            .await
    }
}

/// Destination bucket inside the backup folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupBucket {
    /// Goods items that were persisted to the store.
    Harvested,
    /// Service items discarded by the classifier, kept for audit.
    Skipped,
}

/// JSON backup files, one per (modality, date-window) bucket.
///
/// Every append rewrites the whole file after collapsing exact duplicate
/// records. That is O(n) per batch and fine at observed volumes; the
/// interface is narrow so the format can change without touching the
/// walk.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    prefix: String,
    window: String,
}

impl BackupStore {
    pub fn new(
        root: impl Into<PathBuf>,
        prefix: &str,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.to_string(),
            window: format!("{}-a-{}", short_date(window_start), short_date(window_end)),
        }
    }

    pub fn file_path(&self, bucket: BackupBucket) -> PathBuf {
        let name = match bucket {
            BackupBucket::Harvested => format!("{}-itens-{}.json", self.prefix, self.window),
            BackupBucket::Skipped => {
                format!("{}-itens-ignorados-{}.json", self.prefix, self.window)
            }
        };
        self.root.join(name)
    }

    /// Merge `records` into the bucket file. Duplicates collapse by
    /// full-record equality, so re-delivery after a crash-and-resume is
    /// absorbed here.
    pub async fn append(&self, bucket: BackupBucket, records: &[ItemRecord]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating backup directory {}", self.root.display()))?;

        let path = self.file_path(bucket);
        let mut merged = self.read_existing(&path).await;
        merged.extend(records.iter().cloned());

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(merged.len());
        for record in merged {
            let serialized = serde_json::to_vec(&record).context("serializing backup record")?;
            if seen.insert(record_digest(&serialized)) {
                unique.push(record);
            }
        }

        let bytes = serde_json::to_vec_pretty(&unique).context("serializing backup file")?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// A corrupted or unreadable backup file starts the bucket over
    /// instead of failing the append.
    async fn read_existing(&self, path: &Path) -> Vec<ItemRecord> {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "existing backup file unreadable; starting fresh"
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }
}

fn record_digest(serialized: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    hex::encode(hasher.finalize())
}
