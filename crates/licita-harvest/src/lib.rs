//! Harvest pipeline: page/contract orchestration, sequential item
//! walking and idempotent persistence.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use licita_core::{
    build_item_record, check_eligibility, classify, Classification, Contract, Ineligibility,
    ItemRecord, Modality, PurchaseStatus,
};
use licita_storage::{BackupBucket, BackupStore, ListingQuery, ProcurementApi};

pub const CRATE_NAME: &str = "licita-harvest";

/// Highest item index probed per contract, a circuit breaker against
/// pathological upstream data.
const MAX_ITEM_INDEX: u32 = 999;

/// Immutable configuration for one harvest run, threaded explicitly
/// through orchestrator, walker and sink.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub modality: Modality,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub uf: Option<String>,
    pub starting_page: u32,
    pub item_delay: Duration,
    pub output_dir: PathBuf,
}

impl HarvestConfig {
    pub fn listing_query(&self) -> ListingQuery {
        ListingQuery {
            modality_code: self.modality.code(),
            window_start: self.window_start,
            window_end: self.window_end,
            uf: self.uf.clone(),
        }
    }

    pub fn backup_store(&self) -> BackupStore {
        BackupStore::new(
            &self.output_dir,
            self.modality.bucket_prefix(),
            self.window_start,
            self.window_end,
        )
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Items the item endpoint returned.
    pub returned: u64,
    /// Items discarded as services.
    pub skipped: u64,
    /// Items written to the store.
    pub written: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_contracts: u64,
    pub total_pages: u32,
    pub stats: RunStats,
}

/// Store-side persistence seam for one output record.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    /// Insert or update by the natural key (orgao, compra, modalidade,
    /// item).
    async fn upsert(&self, record: &ItemRecord) -> Result<()>;
}

/// Single long-lived pool handle reused across all upserts of a run.
pub async fn connect_store(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .context("connecting to the item store")
}

/// Postgres-backed repository. All SQL is runtime-checked (sqlx::query,
/// not sqlx::query!) so builds don't need a live database.
pub struct PgItemRepository {
    pool: PgPool,
}

impl PgItemRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the schema and items table when missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("CREATE SCHEMA IF NOT EXISTS licitacao")
            .execute(&self.pool)
            .await
            .context("creating schema")?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS licitacao.itens (
                id BIGSERIAL PRIMARY KEY,
                orgao TEXT NOT NULL,
                unidade TEXT NOT NULL,
                municipio TEXT NOT NULL,
                compra TEXT NOT NULL,
                data_encerramento_proposta DATE NOT NULL,
                modalidade TEXT NOT NULL,
                disputa TEXT NOT NULL,
                registro_preco TEXT NOT NULL,
                item INTEGER NOT NULL,
                descricao TEXT NOT NULL,
                quantidade DOUBLE PRECISION NOT NULL,
                unidade_medida TEXT NOT NULL,
                valor_unitario_estimado DOUBLE PRECISION NOT NULL,
                valor_total DOUBLE PRECISION NOT NULL,
                link TEXT NOT NULL,
                valor_contratado DOUBLE PRECISION,
                observacoes TEXT,
                data_empenho TEXT,
                numero_empenho TEXT,
                data_entrega TEXT,
                data_pagamento TEXT,
                data_previsao_pagamento TEXT,
                numero_nf_venda TEXT,
                status_compra TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (orgao, compra, modalidade, item)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating items table")?;
        Ok(())
    }
}

#[async_trait]
impl ItemRepository for PgItemRepository {
    /// Harvest-owned columns are overwritten on conflict. Business
    /// columns merge with COALESCE so a null incoming value never
    /// clobbers a stored one; the status defaults only on first insert.
    async fn upsert(&self, record: &ItemRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO licitacao.itens (
                orgao, unidade, municipio, compra, data_encerramento_proposta,
                modalidade, disputa, registro_preco, item, descricao,
                quantidade, unidade_medida, valor_unitario_estimado, valor_total, link,
                valor_contratado, observacoes, data_empenho, numero_empenho, data_entrega,
                data_pagamento, data_previsao_pagamento, numero_nf_venda, status_compra
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, COALESCE($24, 'NAO_PARTICIPAMOS')
            )
            ON CONFLICT (orgao, compra, modalidade, item)
            DO UPDATE SET
                unidade = EXCLUDED.unidade,
                municipio = EXCLUDED.municipio,
                data_encerramento_proposta = EXCLUDED.data_encerramento_proposta,
                disputa = EXCLUDED.disputa,
                registro_preco = EXCLUDED.registro_preco,
                descricao = EXCLUDED.descricao,
                quantidade = EXCLUDED.quantidade,
                unidade_medida = EXCLUDED.unidade_medida,
                valor_unitario_estimado = EXCLUDED.valor_unitario_estimado,
                valor_total = EXCLUDED.valor_total,
                link = EXCLUDED.link,
                valor_contratado = COALESCE(EXCLUDED.valor_contratado, itens.valor_contratado),
                observacoes = COALESCE(EXCLUDED.observacoes, itens.observacoes),
                data_empenho = COALESCE(EXCLUDED.data_empenho, itens.data_empenho),
                numero_empenho = COALESCE(EXCLUDED.numero_empenho, itens.numero_empenho),
                data_entrega = COALESCE(EXCLUDED.data_entrega, itens.data_entrega),
                data_pagamento = COALESCE(EXCLUDED.data_pagamento, itens.data_pagamento),
                data_previsao_pagamento = COALESCE(EXCLUDED.data_previsao_pagamento, itens.data_previsao_pagamento),
                numero_nf_venda = COALESCE(EXCLUDED.numero_nf_venda, itens.numero_nf_venda),
                status_compra = COALESCE($24, itens.status_compra),
                updated_at = NOW()
            "#,
        )
        .bind(&record.orgao)
        .bind(&record.unidade)
        .bind(&record.municipio)
        .bind(&record.compra)
        .bind(record.data_encerramento_proposta)
        .bind(&record.modalidade)
        .bind(&record.disputa)
        .bind(&record.registro_preco)
        .bind(record.item as i32)
        .bind(&record.descricao)
        .bind(record.quantidade)
        .bind(&record.unidade_medida)
        .bind(record.valor_unitario_estimado)
        .bind(record.valor_total)
        .bind(&record.link)
        .bind(record.valor_contratado)
        .bind(record.observacoes.as_deref())
        .bind(record.data_empenho.as_deref())
        .bind(record.numero_empenho.as_deref())
        .bind(record.data_entrega.as_deref())
        .bind(record.data_pagamento.as_deref())
        .bind(record.data_previsao_pagamento.as_deref())
        .bind(record.numero_nf_venda.as_deref())
        .bind(record.status_compra.map(PurchaseStatus::as_str))
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting item {} of {}", record.item, record.compra))?;
        Ok(())
    }
}

/// In-memory repository applying the same merge rule as the Postgres
/// implementation. Doubles as the reference for the upsert semantics in
/// tests.
#[derive(Debug, Default)]
pub struct MemoryItemRepository {
    rows: Mutex<HashMap<(String, String, String, u32), ItemRecord>>,
}

impl MemoryItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, key: &(String, String, String, u32)) -> Option<ItemRecord> {
        self.rows.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl ItemRepository for MemoryItemRepository {
    async fn upsert(&self, record: &ItemRecord) -> Result<()> {
        let mut rows = self.rows.lock().await;
        match rows.entry(record.natural_key()) {
            Entry::Occupied(mut slot) => {
                let merged = merge_business_fields(record, slot.get());
                slot.insert(merged);
            }
            Entry::Vacant(slot) => {
                let mut row = record.clone();
                if row.status_compra.is_none() {
                    row.status_compra = Some(PurchaseStatus::NaoParticipamos);
                }
                slot.insert(row);
            }
        }
        Ok(())
    }
}

/// Null incoming business fields keep the stored value; everything else
/// comes from the incoming row.
fn merge_business_fields(incoming: &ItemRecord, existing: &ItemRecord) -> ItemRecord {
    let mut row = incoming.clone();
    row.valor_contratado = row.valor_contratado.or(existing.valor_contratado);
    row.observacoes = row.observacoes.take().or_else(|| existing.observacoes.clone());
    row.data_empenho = row.data_empenho.take().or_else(|| existing.data_empenho.clone());
    row.numero_empenho = row
        .numero_empenho
        .take()
        .or_else(|| existing.numero_empenho.clone());
    row.data_entrega = row.data_entrega.take().or_else(|| existing.data_entrega.clone());
    row.data_pagamento = row
        .data_pagamento
        .take()
        .or_else(|| existing.data_pagamento.clone());
    row.data_previsao_pagamento = row
        .data_previsao_pagamento
        .take()
        .or_else(|| existing.data_previsao_pagamento.clone());
    row.numero_nf_venda = row
        .numero_nf_venda
        .take()
        .or_else(|| existing.numero_nf_venda.clone());
    row.status_compra = row.status_compra.or(existing.status_compra);
    row
}

/// Writes one record to the store (fatal on failure) and to the JSON
/// backup (logged and swallowed on failure).
pub struct ItemSink {
    repository: Arc<dyn ItemRepository>,
    backup: BackupStore,
}

impl ItemSink {
    pub fn new(repository: Arc<dyn ItemRepository>, backup: BackupStore) -> Self {
        Self { repository, backup }
    }

    /// The store is the record of truth; its failure propagates. The
    /// backup append is best-effort.
    pub async fn store(&self, record: &ItemRecord) -> Result<()> {
        self.repository.upsert(record).await?;
        info!(item = record.item, compra = %record.compra, "item stored");
        if let Err(err) = self
            .backup
            .append(BackupBucket::Harvested, std::slice::from_ref(record))
            .await
        {
            warn!(error = %err, "backup append failed; continuing");
        }
        Ok(())
    }

    /// Audit trail for discarded service items; never fatal.
    pub async fn record_skipped(&self, record: &ItemRecord) {
        if let Err(err) = self
            .backup
            .append(BackupBucket::Skipped, std::slice::from_ref(record))
            .await
        {
            warn!(error = %err, "skipped-bucket append failed; continuing");
        }
    }
}

/// Drives pagination and per-contract walking for one run.
pub struct HarvestPipeline {
    config: HarvestConfig,
    api: Arc<dyn ProcurementApi>,
    repository: Arc<dyn ItemRepository>,
}

impl HarvestPipeline {
    pub fn new(
        config: HarvestConfig,
        api: Arc<dyn ProcurementApi>,
        repository: Arc<dyn ItemRepository>,
    ) -> Self {
        Self {
            config,
            api,
            repository,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let query = self.config.listing_query();
        let sink = ItemSink::new(self.repository.clone(), self.config.backup_store());
        let mut stats = RunStats::default();

        let first = self
            .api
            .listing_page(run_id, &query, 1)
            .await
            .context("fetching page 1 of the contract listing")?;
        let total_pages = first.total_paginas;
        info!(
            %run_id,
            total_contracts = first.total_registros,
            total_pages,
            "listing window sized"
        );

        for page in self.config.starting_page..=total_pages {
            info!(page, total_pages, "processing page");
            let listing = self
                .api
                .listing_page(run_id, &query, page)
                .await
                .with_context(|| restart_hint(page))?;

            let Some(contracts) = listing.contracts() else {
                warn!(page, "listing payload is not a contract array; skipping page");
                continue;
            };

            for contract in &contracts {
                info!(
                    unit = %contract.unidade_orgao.nome_unidade,
                    compra = %contract.purchase_label(),
                    "processing contract"
                );
                // the walker absorbs not-found itself; anything that
                // reaches this level aborts the run
                self.walk_contract(run_id, contract, &sink, &mut stats)
                    .await
                    .with_context(|| restart_hint(page))?;
            }
        }

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            total_contracts: first.total_registros,
            total_pages,
            stats,
        })
    }

    /// Walk one contract's items sequentially from index 1.
    ///
    /// Assumes item indices are contiguous starting at 1: the first
    /// not-found ends the contract. That is an assumption about upstream
    /// data, not a guarantee of the API.
    async fn walk_contract(
        &self,
        run_id: Uuid,
        contract: &Contract,
        sink: &ItemSink,
        stats: &mut RunStats,
    ) -> Result<()> {
        if let Err(reason) = check_eligibility(contract, self.config.window_start) {
            match reason {
                Ineligibility::ClosedBeforeWindow => warn!(
                    closing = %contract.data_encerramento_proposta,
                    window_start = %self.config.window_start,
                    "proposals closed before the window start; skipping contract"
                ),
                Ineligibility::PriceRegistry => {
                    debug!("price-registry contract; skipping")
                }
            }
            return Ok(());
        }

        for index in 1..=MAX_ITEM_INDEX {
            let item = match self.api.item(run_id, contract, index).await {
                Ok(item) => item,
                Err(err) if err.is_not_found() => break,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "fetching item {index} of {}",
                            contract.purchase_label()
                        )
                    })
                }
            };
            stats.returned += 1;

            let record = build_item_record(contract, index, &item);
            match classify(&item) {
                Classification::Skip(reason) => {
                    stats.skipped += 1;
                    debug!(item = index, ?reason, "service item skipped");
                    sink.record_skipped(&record).await;
                }
                Classification::Keep => {
                    sink.store(&record).await?;
                    stats.written += 1;
                    tokio::time::sleep(self.config.item_delay).await;
                }
            }
        }
        Ok(())
    }
}

fn restart_hint(page: u32) -> String {
    format!("run failed on page {page}; restart with --page {page}")
}
