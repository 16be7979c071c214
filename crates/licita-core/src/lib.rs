//! Domain model for the PNCP goods-item harvester: upstream wire types,
//! the flattened output record, item classification and contract
//! eligibility.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "licita-core";

/// One page of the contract-listing endpoint.
///
/// `data` is kept raw: the upstream occasionally answers with something
/// other than a contract array, and callers must be able to tell that
/// apart from a transport failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPage {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub total_registros: u64,
    #[serde(default)]
    pub total_paginas: u32,
    #[serde(default)]
    pub numero_pagina: u32,
    #[serde(default)]
    pub paginas_restantes: u32,
    #[serde(default)]
    pub empty: bool,
}

impl ListingPage {
    /// The page's contracts, or `None` when the payload is malformed.
    pub fn contracts(&self) -> Option<Vec<Contract>> {
        if !self.data.is_array() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgaoEntidade {
    pub cnpj: String,
    pub razao_social: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnidadeOrgao {
    pub codigo_unidade: String,
    pub nome_unidade: String,
    pub municipio_nome: String,
}

/// One procurement process as listed by the window query. Immutable once
/// fetched; only used to derive item URLs and denormalized record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub orgao_entidade: OrgaoEntidade,
    pub unidade_orgao: UnidadeOrgao,
    pub ano_compra: i32,
    pub sequencial_compra: i64,
    pub numero_compra: String,
    pub modalidade_nome: String,
    pub modo_disputa_nome: String,
    pub srp: bool,
    #[serde(default)]
    pub data_abertura_proposta: Option<String>,
    pub data_encerramento_proposta: String,
}

impl Contract {
    /// `"<number>/<year>"` purchase label used in logs and records.
    pub fn purchase_label(&self) -> String {
        format!("{}/{}", self.numero_compra, self.ano_compra)
    }

    /// Public portal link for the contract's notice page.
    pub fn detail_link(&self) -> String {
        format!(
            "https://pncp.gov.br/app/editais/{}/{}/{}",
            self.orgao_entidade.cnpj, self.ano_compra, self.sequencial_compra
        )
    }
}

/// One line item of a contract as returned by the item-detail endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub descricao: String,
    pub quantidade: f64,
    #[serde(default)]
    pub unidade_medida: Option<String>,
    pub valor_unitario_estimado: f64,
    pub valor_total: f64,
    /// `"M"` for goods, `"S"` for services.
    pub material_ou_servico: String,
}

/// Lifecycle state attached to a stored item by out-of-band processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseStatus {
    NaoParticipamos,
    Participando,
    Empenhado,
    Entregue,
    Pago,
    Cancelado,
}

impl PurchaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NaoParticipamos => "NAO_PARTICIPAMOS",
            Self::Participando => "PARTICIPANDO",
            Self::Empenhado => "EMPENHADO",
            Self::Entregue => "ENTREGUE",
            Self::Pago => "PAGO",
            Self::Cancelado => "CANCELADO",
        }
    }
}

/// Contracting modality codes accepted by the listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    LeilaoEletronico = 1,
    DialogoCompetitivo = 2,
    Concurso = 3,
    ConcorrenciaEletronica = 4,
    ConcorrenciaPresencial = 5,
    PregaoEletronico = 6,
    PregaoPresencial = 7,
    DispensaDeLicitacao = 8,
    Inexigibilidade = 9,
    ManifestacaoDeInteresse = 10,
    PreQualificacao = 11,
    Credenciamento = 12,
    LeilaoPresencial = 13,
}

impl Modality {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::LeilaoEletronico),
            2 => Some(Self::DialogoCompetitivo),
            3 => Some(Self::Concurso),
            4 => Some(Self::ConcorrenciaEletronica),
            5 => Some(Self::ConcorrenciaPresencial),
            6 => Some(Self::PregaoEletronico),
            7 => Some(Self::PregaoPresencial),
            8 => Some(Self::DispensaDeLicitacao),
            9 => Some(Self::Inexigibilidade),
            10 => Some(Self::ManifestacaoDeInteresse),
            11 => Some(Self::PreQualificacao),
            12 => Some(Self::Credenciamento),
            13 => Some(Self::LeilaoPresencial),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::LeilaoEletronico => "Leilão - Eletrônico",
            Self::DialogoCompetitivo => "Diálogo Competitivo",
            Self::Concurso => "Concurso",
            Self::ConcorrenciaEletronica => "Concorrência - Eletrônica",
            Self::ConcorrenciaPresencial => "Concorrência - Presencial",
            Self::PregaoEletronico => "Pregão - Eletrônico",
            Self::PregaoPresencial => "Pregão - Presencial",
            Self::DispensaDeLicitacao => "Dispensa de Licitação",
            Self::Inexigibilidade => "Inexigibilidade",
            Self::ManifestacaoDeInteresse => "Manifestação de Interesse",
            Self::PreQualificacao => "Pré-qualificação",
            Self::Credenciamento => "Credenciamento",
            Self::LeilaoPresencial => "Leilão - Presencial",
        }
    }

    /// File-name prefix for backup buckets of this modality.
    pub fn bucket_prefix(self) -> &'static str {
        match self {
            Self::DispensaDeLicitacao => "dispensa",
            _ => "pregao",
        }
    }
}

/// Flattened contract + item denormalization, the unit of persistence.
///
/// Natural key: (orgao, compra, modalidade, item). The trailing optional
/// fields are owned by downstream processes and only pass through the
/// harvester; absent values serialize away entirely so backup files stay
/// byte-comparable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub orgao: String,
    pub unidade: String,
    pub municipio: String,
    pub compra: String,
    pub data_encerramento_proposta: NaiveDate,
    pub modalidade: String,
    pub disputa: String,
    pub registro_preco: String,
    pub item: u32,
    pub descricao: String,
    pub quantidade: f64,
    pub unidade_medida: String,
    pub valor_unitario_estimado: f64,
    pub valor_total: f64,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valor_contratado: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observacoes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_empenho: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numero_empenho: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_entrega: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_pagamento: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_previsao_pagamento: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numero_nf_venda: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_compra: Option<PurchaseStatus>,
}

impl ItemRecord {
    /// The tuple the store upserts on.
    pub fn natural_key(&self) -> (String, String, String, u32) {
        (
            self.orgao.clone(),
            self.compra.clone(),
            self.modalidade.clone(),
            self.item,
        )
    }
}

/// Build the persisted record for one fetched item of an eligible contract.
pub fn build_item_record(contract: &Contract, index: u32, item: &Item) -> ItemRecord {
    ItemRecord {
        orgao: contract.orgao_entidade.razao_social.trim().to_string(),
        unidade: format!(
            "{} - {}",
            contract.unidade_orgao.codigo_unidade, contract.unidade_orgao.nome_unidade
        )
        .trim()
        .to_string(),
        municipio: contract.unidade_orgao.municipio_nome.trim().to_string(),
        compra: contract.purchase_label(),
        data_encerramento_proposta: proposal_date(&contract.data_encerramento_proposta)
            .unwrap_or_default(),
        modalidade: contract.modalidade_nome.trim().to_string(),
        disputa: contract.modo_disputa_nome.trim().to_string(),
        registro_preco: if contract.srp { "SIM" } else { "NÃO" }.to_string(),
        item: index,
        descricao: item.descricao.to_lowercase().trim().to_string(),
        quantidade: item.quantidade,
        unidade_medida: item
            .unidade_medida
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string(),
        valor_unitario_estimado: item.valor_unitario_estimado,
        valor_total: item.valor_total,
        link: contract.detail_link(),
        valor_contratado: None,
        observacoes: None,
        data_empenho: None,
        numero_empenho: None,
        data_entrega: None,
        data_pagamento: None,
        data_previsao_pagamento: None,
        numero_nf_venda: None,
        status_compra: None,
    }
}

/// Unit-of-measure spellings that mark a line item as a service.
const SERVICE_UNIT_TOKENS: [&str; 8] = [
    "SERV", "SRV", "SERVIÇO", "SV", "SERV.", "SERVICO", "SRVC", "SER",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Keep,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The upstream type flag marks the item as a service.
    ServiceFlag,
    /// The normalized unit of measure is a known service spelling.
    ServiceUnit,
}

/// Decide whether a fetched line item is a physical good worth keeping.
pub fn classify(item: &Item) -> Classification {
    if item.material_ou_servico == "S" {
        return Classification::Skip(SkipReason::ServiceFlag);
    }
    let unit = normalize_unit(item.unidade_medida.as_deref().unwrap_or(""));
    if SERVICE_UNIT_TOKENS.contains(&unit.as_str()) {
        return Classification::Skip(SkipReason::ServiceUnit);
    }
    Classification::Keep
}

/// Trim, drop embedded control and invisible-space characters, uppercase.
pub fn normalize_unit(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| {
            !matches!(
                c,
                '\n' | '\r'
                    | '\t'
                    | '\u{00A0}'
                    | '\u{2000}'..='\u{200B}'
                    | '\u{202F}'
                    | '\u{205F}'
                    | '\u{3000}'
            )
        })
        .collect::<String>()
        .to_uppercase()
}

/// Why a contract is excluded from item harvesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    /// Proposals closed before the harvest window opened.
    ClosedBeforeWindow,
    /// Price-registry (SRP) contracts are not harvested.
    PriceRegistry,
}

/// Contract-level filter applied before any item is fetched. An
/// unparseable closing date does not exclude the contract.
pub fn check_eligibility(contract: &Contract, window_start: NaiveDate) -> Result<(), Ineligibility> {
    if let Some(closing) = proposal_date(&contract.data_encerramento_proposta) {
        if closing < window_start {
            return Err(Ineligibility::ClosedBeforeWindow);
        }
    }
    if contract.srp {
        return Err(Ineligibility::PriceRegistry);
    }
    Ok(())
}

/// Date portion of an upstream proposal timestamp such as
/// `2026-01-15T17:00:00`.
pub fn proposal_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.split('T').next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Parse an operator-supplied `DD-MM-YYYY` date.
pub fn parse_br_date(raw: &str) -> chrono::ParseResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%d-%m-%Y")
}

/// `YYYYMMDD` form used by the listing query string.
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// `YY-MM-DD` form used in backup bucket file names.
pub fn short_date(date: NaiveDate) -> String {
    date.format("%y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn goods_item(unit: &str) -> Item {
        Item {
            descricao: "Caneta esferográfica azul".to_string(),
            quantidade: 100.0,
            unidade_medida: Some(unit.to_string()),
            valor_unitario_estimado: 1.5,
            valor_total: 150.0,
            material_ou_servico: "M".to_string(),
        }
    }

    fn sample_contract() -> Contract {
        Contract {
            orgao_entidade: OrgaoEntidade {
                cnpj: "00394460000141".to_string(),
                razao_social: "  Ministério da Gestão  ".to_string(),
            },
            unidade_orgao: UnidadeOrgao {
                codigo_unidade: "1101".to_string(),
                nome_unidade: "Secretaria Executiva".to_string(),
                municipio_nome: " Brasília ".to_string(),
            },
            ano_compra: 2026,
            sequencial_compra: 42,
            numero_compra: "90012".to_string(),
            modalidade_nome: "Dispensa de Licitação ".to_string(),
            modo_disputa_nome: "Dispensa Com Disputa".to_string(),
            srp: false,
            data_abertura_proposta: Some("2026-01-02T08:00:00".to_string()),
            data_encerramento_proposta: "2026-01-15T17:00:00".to_string(),
        }
    }

    #[test]
    fn service_flag_always_skips() {
        let mut item = goods_item("UN");
        item.material_ou_servico = "S".to_string();
        assert_eq!(classify(&item), Classification::Skip(SkipReason::ServiceFlag));
    }

    #[test]
    fn service_unit_spellings_skip() {
        for unit in ["SERV", "srv", "Serviço", "sv", "serv.", "servico", "SRVC", "ser"] {
            assert_eq!(
                classify(&goods_item(unit)),
                Classification::Skip(SkipReason::ServiceUnit),
                "unit {unit:?} should be classified as a service"
            );
        }
    }

    #[test]
    fn padded_service_units_skip() {
        assert_eq!(
            classify(&goods_item("\u{00A0}serv\u{00A0}")),
            Classification::Skip(SkipReason::ServiceUnit)
        );
        assert_eq!(
            classify(&goods_item("\tse\tr\nv")),
            Classification::Skip(SkipReason::ServiceUnit)
        );
        assert_eq!(
            classify(&goods_item("SERV\u{202F}IÇO")),
            Classification::Skip(SkipReason::ServiceUnit)
        );
    }

    #[test]
    fn goods_units_keep() {
        for unit in ["UN", "CX", "KG", "SERVO", "UNIDADE"] {
            assert_eq!(classify(&goods_item(unit)), Classification::Keep);
        }
        let mut item = goods_item("UN");
        item.unidade_medida = None;
        assert_eq!(classify(&item), Classification::Keep);
    }

    #[test]
    fn normalization_strips_invisible_characters_only() {
        assert_eq!(normalize_unit(" se\u{2009}r\u{200B}v\u{3000} "), "SERV");
        assert_eq!(normalize_unit("un"), "UN");
        // plain interior spaces survive normalization
        assert_eq!(normalize_unit("s e r v"), "S E R V");
    }

    #[test]
    fn eligibility_rejects_srp_and_stale_contracts() {
        let window_start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        let mut contract = sample_contract();
        contract.srp = true;
        assert_eq!(
            check_eligibility(&contract, window_start),
            Err(Ineligibility::PriceRegistry)
        );

        let mut contract = sample_contract();
        contract.data_encerramento_proposta = "2025-12-20T17:00:00".to_string();
        assert_eq!(
            check_eligibility(&contract, window_start),
            Err(Ineligibility::ClosedBeforeWindow)
        );

        assert_eq!(check_eligibility(&sample_contract(), window_start), Ok(()));
    }

    #[test]
    fn unparseable_closing_date_stays_eligible() {
        let mut contract = sample_contract();
        contract.data_encerramento_proposta = "soon".to_string();
        let window_start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(check_eligibility(&contract, window_start), Ok(()));
    }

    #[test]
    fn record_denormalizes_and_normalizes_fields() {
        let contract = sample_contract();
        let mut item = goods_item(" UN ");
        item.descricao = "  CANETA Esferográfica AZUL ".to_string();

        let record = build_item_record(&contract, 3, &item);
        assert_eq!(record.orgao, "Ministério da Gestão");
        assert_eq!(record.unidade, "1101 - Secretaria Executiva");
        assert_eq!(record.municipio, "Brasília");
        assert_eq!(record.compra, "90012/2026");
        assert_eq!(
            record.data_encerramento_proposta,
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
        );
        assert_eq!(record.modalidade, "Dispensa de Licitação");
        assert_eq!(record.registro_preco, "NÃO");
        assert_eq!(record.item, 3);
        assert_eq!(record.descricao, "caneta esferográfica azul");
        assert_eq!(record.unidade_medida, "UN");
        assert_eq!(
            record.link,
            "https://pncp.gov.br/app/editais/00394460000141/2026/42"
        );
        assert_eq!(record.status_compra, None);
        assert_eq!(
            record.natural_key(),
            (
                "Ministério da Gestão".to_string(),
                "90012/2026".to_string(),
                "Dispensa de Licitação".to_string(),
                3
            )
        );
    }

    #[test]
    fn optional_fields_serialize_away() {
        let record = build_item_record(&sample_contract(), 1, &goods_item("UN"));
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("valorContratado").is_none());
        assert!(value.get("statusCompra").is_none());
        assert_eq!(value["registroPreco"], "NÃO");

        let mut record = record;
        record.status_compra = Some(PurchaseStatus::NaoParticipamos);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["statusCompra"], "NAO_PARTICIPAMOS");
    }

    #[test]
    fn listing_page_exposes_contract_arrays_only() {
        let page: ListingPage = serde_json::from_value(json!({
            "data": [serde_json::to_value(sample_contract()).unwrap()],
            "totalRegistros": 1,
            "totalPaginas": 1,
            "numeroPagina": 1,
            "paginasRestantes": 0,
            "empty": false
        }))
        .unwrap();
        assert_eq!(page.contracts().unwrap().len(), 1);

        let malformed: ListingPage = serde_json::from_value(json!({
            "data": {"message": "sem resultados"},
            "totalPaginas": 4
        }))
        .unwrap();
        assert_eq!(malformed.total_paginas, 4);
        assert!(malformed.contracts().is_none());
    }

    #[test]
    fn modality_codes_round_trip() {
        assert_eq!(Modality::DispensaDeLicitacao.code(), 8);
        assert_eq!(Modality::from_code(8), Some(Modality::DispensaDeLicitacao));
        assert_eq!(Modality::from_code(6), Some(Modality::PregaoEletronico));
        assert_eq!(Modality::from_code(14), None);
        assert_eq!(Modality::DispensaDeLicitacao.bucket_prefix(), "dispensa");
        assert_eq!(Modality::PregaoEletronico.bucket_prefix(), "pregao");
        assert_eq!(Modality::DispensaDeLicitacao.label(), "Dispensa de Licitação");
    }

    #[test]
    fn date_helpers_match_operator_formats() {
        let date = parse_br_date("27-12-2025").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 12, 27).unwrap());
        assert_eq!(compact_date(date), "20251227");
        assert_eq!(short_date(date), "25-12-27");
        assert!(parse_br_date("2025-12-27").is_err());
        assert_eq!(
            proposal_date("2026-01-15T17:00:00"),
            NaiveDate::from_ymd_opt(2026, 1, 15)
        );
        assert_eq!(proposal_date("2026-01-15"), NaiveDate::from_ymd_opt(2026, 1, 15));
        assert_eq!(proposal_date("15/01/2026"), None);
    }
}
