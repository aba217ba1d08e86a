use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};
use vocario_core::{LineItem, Unit};

use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::llm::LlmClient;

pub const EXTRACTION_SYSTEM_PROMPT: &str = "\
Tu extrais les prestations d'un devis du bâtiment à partir d'un message d'artisan.
Réponds UNIQUEMENT avec un tableau JSON valide, sans texte autour ni commentaire.
Chaque objet: {\"description\": \"...\", \"quantite\": N, \"unite\": \"...\", \"prix_unitaire\": N}
Unités valides: u, m2, ml, m, h, jour, kg, l, forfait.
Sans quantité explicite: quantite 1 et unite \"forfait\".
Si le prix est un total (\"peinture 800€\"), mets quantite 1 et prix_unitaire 800.
N'invente jamais un prix absent du message.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("line item extraction is disabled")]
    Disabled,
    #[error("llm call failed: {0}")]
    Llm(String),
    #[error("llm response is not a list of line items: {0}")]
    Malformed(String),
    #[error("no line item found in the message")]
    Empty,
    #[error("extracted items rejected ({reason_code}): {detail}")]
    Rejected { reason_code: &'static str, detail: String },
}

/// Turns free text the deterministic parser could not read into line items.
#[async_trait]
pub trait LineItemExtraction: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<LineItem>, ExtractionError>;
}

/// Stand-in when extraction is switched off in configuration.
#[derive(Default)]
pub struct DisabledExtractor;

#[async_trait]
impl LineItemExtraction for DisabledExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<LineItem>, ExtractionError> {
        Err(ExtractionError::Disabled)
    }
}

pub struct LlmLineItemExtractor {
    client: Arc<dyn LlmClient>,
    guardrails: GuardrailPolicy,
}

impl LlmLineItemExtractor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client, guardrails: GuardrailPolicy::default() }
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailPolicy) -> Self {
        self.guardrails = guardrails;
        self
    }
}

#[async_trait]
impl LineItemExtraction for LlmLineItemExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<LineItem>, ExtractionError> {
        let raw = self
            .client
            .complete(EXTRACTION_SYSTEM_PROMPT, text)
            .await
            .map_err(|error| ExtractionError::Llm(error.to_string()))?;
        let items = parse_items(&raw)?;
        if items.is_empty() {
            return Err(ExtractionError::Empty);
        }

        if let GuardrailDecision::Deny { reason_code, detail } =
            self.guardrails.evaluate(text, &items)
        {
            warn!(
                event_name = "agent.extraction.denied",
                reason_code,
                detail = %detail,
                "extracted line items rejected by guardrails"
            );
            return Err(ExtractionError::Rejected { reason_code, detail });
        }

        info!(
            event_name = "agent.extraction.completed",
            items = items.len(),
            "line items extracted"
        );
        Ok(items)
    }
}

#[derive(Debug, Deserialize)]
struct ExtractedItem {
    description: String,
    #[serde(default, alias = "quantite")]
    quantity: Option<Decimal>,
    #[serde(default, alias = "unite")]
    unit: Option<String>,
    #[serde(alias = "prix_unitaire")]
    unit_price: Decimal,
}

impl ExtractedItem {
    fn into_line_item(self) -> LineItem {
        let unit = self.unit.as_deref().and_then(parse_unit);
        match (self.quantity, unit) {
            (Some(quantity), Some(unit)) => LineItem {
                description: self.description.trim().to_owned(),
                quantity,
                unit,
                unit_price: self.unit_price,
            },
            (Some(quantity), None) if quantity != Decimal::ONE => LineItem {
                description: self.description.trim().to_owned(),
                quantity,
                unit: Unit::Piece,
                unit_price: self.unit_price,
            },
            _ => LineItem::flat(self.description.trim(), self.unit_price),
        }
    }
}

fn parse_unit(raw: &str) -> Option<Unit> {
    match raw.trim().to_lowercase().as_str() {
        "lot" | "ens" | "ensemble" => Some(Unit::Flat),
        other => Unit::parse(other),
    }
}

/// Reads the model's answer, tolerating a Markdown code fence around the JSON.
fn parse_items(raw: &str) -> Result<Vec<LineItem>, ExtractionError> {
    let body = strip_code_fence(raw);
    let extracted: Vec<ExtractedItem> = serde_json::from_str(body)
        .map_err(|error| ExtractionError::Malformed(error.to_string()))?;
    Ok(extracted.into_iter().map(ExtractedItem::into_line_item).collect())
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.split("```").next().unwrap_or(rest).trim()
}
