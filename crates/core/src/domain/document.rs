use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::draft::{ClientDetails, DraftDocument, LineItem, Totals};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Quote,
    Invoice,
}

impl DocumentKind {
    pub fn number_prefix(self) -> &'static str {
        match self {
            Self::Quote => "DEV",
            Self::Invoice => "FAC",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Quote => "Devis",
            Self::Invoice => "Facture",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Standard,
    Deposit,
    Final,
}

impl InvoiceKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Standard => "Facture",
            Self::Deposit => "Acompte",
            Self::Final => "Facture finale",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Sent,
    Signed,
    Accepted,
    Refused,
    Paid,
    Cancelled,
}

impl DocumentStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "⏳ En attente",
            Self::Sent => "📤 Envoyé",
            Self::Signed => "✍️ Signé",
            Self::Accepted => "✅ Accepté",
            Self::Refused => "❌ Refusé",
            Self::Paid => "💶 Payée",
            Self::Cancelled => "🚫 Annulé",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Word,
}

impl DocumentFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Word => "doc",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pdf => "PDF",
            Self::Word => "Word",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Word => "application/msword",
        }
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "word" | "doc" | "docx" => Ok(Self::Word),
            other => Err(DomainError::InvariantViolation(format!(
                "unsupported document format `{other}` (expected pdf|word)"
            ))),
        }
    }
}

/// Where a rendered file of a document stands in the build/store pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ArtifactState {
    Building,
    Ready { url: String },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduction {
    pub label: String,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub number: String,
    pub kind: DocumentKind,
    pub invoice_kind: Option<InvoiceKind>,
    pub client: ClientDetails,
    pub project: Option<String>,
    pub lines: Vec<LineItem>,
    pub discount_pct: Decimal,
    pub deposit_pct: Option<Decimal>,
    pub completion_delay: Option<String>,
    pub vat_rate: Decimal,
    pub deductions: Vec<Deduction>,
    pub status: DocumentStatus,
    pub source_quote: Option<DocumentId>,
    pub issued_on: NaiveDate,
    #[serde(default)]
    pub artifacts: BTreeMap<DocumentFormat, ArtifactState>,
}

impl DocumentRecord {
    pub fn from_draft(
        id: DocumentId,
        number: String,
        draft: &DraftDocument,
        vat_rate: Decimal,
        issued_on: NaiveDate,
    ) -> Self {
        Self {
            id,
            number,
            kind: draft.kind,
            invoice_kind: (draft.kind == DocumentKind::Invoice).then_some(InvoiceKind::Standard),
            client: draft.client.clone(),
            project: draft.project.clone(),
            lines: draft.lines.clone(),
            discount_pct: draft.discount_pct,
            deposit_pct: draft.deposit_pct,
            completion_delay: draft.completion_delay.clone(),
            vat_rate,
            deductions: Vec::new(),
            status: DocumentStatus::Pending,
            source_quote: None,
            issued_on,
            artifacts: BTreeMap::new(),
        }
    }

    pub fn totals(&self) -> Totals {
        Totals::compute(&self.lines, self.discount_pct, self.vat_rate, self.deposit_pct)
    }

    /// Total left to pay once deductions (paid deposits) are taken off.
    pub fn amount_due(&self) -> Decimal {
        let deducted = self
            .deductions
            .iter()
            .map(|deduction| deduction.amount)
            .fold(Decimal::ZERO, Decimal::saturating_add);
        self.totals().total.saturating_sub(deducted)
    }

    pub fn title(&self) -> &'static str {
        match self.invoice_kind {
            Some(kind) => kind.label(),
            None => self.kind.label(),
        }
    }

    pub fn filename(&self, format: DocumentFormat) -> String {
        format!("{}.{}", self.number, format.extension())
    }

    pub fn artifact_url(&self, format: DocumentFormat) -> Option<&str> {
        match self.artifacts.get(&format) {
            Some(ArtifactState::Ready { url }) => Some(url.as_str()),
            _ => None,
        }
    }

    pub fn is_quote(&self) -> bool {
        self.kind == DocumentKind::Quote
    }

    pub fn days_since_issue(&self, today: NaiveDate) -> i64 {
        (today - self.issued_on).num_days()
    }

    /// Unpaid invoices after 15 days and sent but unanswered quotes after 7 call for a reminder.
    pub fn reminder_due(&self, today: NaiveDate) -> bool {
        let days = self.days_since_issue(today);
        match self.kind {
            DocumentKind::Invoice => {
                matches!(self.status, DocumentStatus::Pending | DocumentStatus::Sent)
                    && days >= INVOICE_REMINDER_DAYS
            }
            DocumentKind::Quote => {
                self.status == DocumentStatus::Sent && days >= QUOTE_REMINDER_DAYS
            }
        }
    }

    pub fn reminder_urgent(&self, today: NaiveDate) -> bool {
        !self.is_quote() && self.days_since_issue(today) > URGENT_REMINDER_DAYS
    }
}

const INVOICE_REMINDER_DAYS: i64 = 15;
const QUOTE_REMINDER_DAYS: i64 = 7;
const URGENT_REMINDER_DAYS: i64 = 30;

/// Builds `DEV-20260115-0003` style numbers from the issue date and the per-session sequence.
pub fn document_number(kind: DocumentKind, issued_on: NaiveDate, sequence: u32) -> String {
    format!("{}-{}-{sequence:04}", kind.number_prefix(), issued_on.format("%Y%m%d"))
}
