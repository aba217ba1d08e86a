use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation::render::format_money;
use crate::domain::document::{DocumentFormat, DocumentId, DocumentKind, DocumentRecord};
use crate::domain::draft::LineItem;

/// One rendered file of one document. Build and store commands for the same artifact are
/// chained by the host: the store step consumes the bytes the build step produced.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub document: DocumentId,
    pub format: DocumentFormat,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub number: String,
    pub kind: DocumentKind,
    pub client_name: String,
    pub filename: String,
    pub content_type: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EmailAttachment {
    /// Produced by a store command earlier in the same batch.
    Pending { artifact: ArtifactRef, filename: String },
    Archived { url: String, filename: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    BuildDocument { artifact: ArtifactRef, document: Box<DocumentRecord> },
    StoreDocument { artifact: ArtifactRef, metadata: ArchiveMetadata },
    SendEmail {
        document: DocumentId,
        to: String,
        subject: String,
        body: String,
        attachment: Option<EmailAttachment>,
    },
    ExtractLineItems { text: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BuildDocument { .. } => "build_document",
            Self::StoreDocument { .. } => "store_document",
            Self::SendEmail { .. } => "send_email",
            Self::ExtractLineItems { .. } => "extract_line_items",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStage {
    Build,
    Store,
    Email,
    Extraction,
}

/// Outcomes of host-side work, fed back into the engine like any other input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    DocumentStored { artifact: ArtifactRef, url: String },
    EmailSent { document: DocumentId, to: String },
    LineItemsExtracted { items: Vec<LineItem> },
    CommandFailed { stage: CommandStage, artifact: Option<ArtifactRef>, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inbound {
    Message { text: String, received_at: DateTime<Utc> },
    System(SystemEvent),
}

impl Inbound {
    pub fn text(text: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self::Message { text: text.into(), received_at }
    }
}

pub(crate) fn build_and_store(document: &DocumentRecord, format: DocumentFormat) -> [Command; 2] {
    let artifact = ArtifactRef { document: document.id.clone(), format };
    [
        Command::BuildDocument { artifact: artifact.clone(), document: Box::new(document.clone()) },
        Command::StoreDocument {
            artifact,
            metadata: ArchiveMetadata {
                number: document.number.clone(),
                kind: document.kind,
                client_name: document.client.display_name().to_owned(),
                filename: document.filename(format),
                content_type: format.content_type().to_owned(),
            },
        },
    ]
}

pub(crate) fn document_email(
    document: &DocumentRecord,
    to: &str,
    company_name: &str,
    attachment: EmailAttachment,
) -> Command {
    let title = document.title().to_lowercase();
    let project = document.project.as_deref().map(|project| format!(" - {project}"));
    let subject =
        format!("{} {}{}", document.title(), document.number, project.unwrap_or_default());
    let greeting =
        document.client.name.as_deref().map(|name| format!(" {name}")).unwrap_or_default();
    let body = format!(
        "Bonjour{greeting},\n\nVeuillez trouver ci-joint votre {title} {}.\n\nCordialement,\n{company_name}",
        document.number
    );

    Command::SendEmail {
        document: document.id.clone(),
        to: to.to_owned(),
        subject,
        body,
        attachment: Some(attachment),
    }
}

/// Reminder wording for an overdue document; past the urgent threshold it asks for payment.
pub(crate) fn reminder_text(
    document: &DocumentRecord,
    today: NaiveDate,
    company_name: &str,
) -> String {
    let article = if document.is_quote() { "le devis" } else { "la facture" };
    let amount = format_money(document.amount_due());
    let greeting =
        document.client.name.as_deref().map(|name| format!(" {name}")).unwrap_or_default();
    let request = if document.reminder_urgent(today) {
        format!(
            "Sauf erreur de ma part, {article} {} d'un montant de {amount} reste impayée depuis {} jours.\n\nMerci de bien vouloir procéder au règlement dans les plus brefs délais.",
            document.number,
            document.days_since_issue(today)
        )
    } else {
        format!(
            "Petit rappel concernant {article} {} ({amount}). N'hésitez pas à me contacter si vous avez des questions.",
            document.number
        )
    };
    format!("Bonjour{greeting},\n\n{request}\n\nCordialement,\n{company_name}")
}

pub(crate) fn reminder_email(
    document: &DocumentRecord,
    to: &str,
    body: String,
    attachment: Option<EmailAttachment>,
) -> Command {
    Command::SendEmail {
        document: document.id.clone(),
        to: to.to_owned(),
        subject: format!("Relance {} {}", document.title(), document.number),
        body,
        attachment,
    }
}
