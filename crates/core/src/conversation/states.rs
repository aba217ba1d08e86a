use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::document::{DocumentId, DocumentRecord, DocumentStatus, InvoiceKind};
use crate::domain::draft::{ClientDetails, DraftDocument, DraftField};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: ConversationId,
    pub state: ConversationState,
    pub draft: Option<DraftDocument>,
    pub documents: Vec<DocumentRecord>,
    pub next_sequence: u32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            state: ConversationState::MainMenu,
            draft: None,
            documents: Vec::new(),
            next_sequence: 1,
            updated_at: None,
        }
    }

    pub fn document(&self, id: &DocumentId) -> Option<&DocumentRecord> {
        self.documents.iter().find(|document| &document.id == id)
    }

    pub fn document_mut(&mut self, id: &DocumentId) -> Option<&mut DocumentRecord> {
        self.documents.iter_mut().find(|document| &document.id == id)
    }

    /// Invoices issued from `quote`, in creation order.
    pub fn linked_invoices(&self, quote: &DocumentId) -> Vec<DocumentId> {
        self.documents
            .iter()
            .filter(|document| document.source_quote.as_ref() == Some(quote))
            .map(|document| document.id.clone())
            .collect()
    }

    /// Deposit invoices issued from `quote` that are already paid.
    pub fn paid_deposits(&self, quote: &DocumentId) -> Vec<&DocumentRecord> {
        self.documents
            .iter()
            .filter(|document| {
                document.source_quote.as_ref() == Some(quote)
                    && document.invoice_kind == Some(InvoiceKind::Deposit)
                    && document.status == DocumentStatus::Paid
            })
            .collect()
    }

    /// The final invoice already issued from `quote`; there is at most one.
    pub fn final_invoice(&self, quote: &DocumentId) -> Option<&DocumentRecord> {
        self.documents.iter().find(|document| {
            document.source_quote.as_ref() == Some(quote)
                && document.invoice_kind == Some(InvoiceKind::Final)
        })
    }

    /// Allocates the next document id and sequence number for this conversation.
    pub fn allocate_document(&mut self) -> (DocumentId, u32) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        (DocumentId(format!("{}-{sequence}", self.id)), sequence)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum ConversationState {
    MainMenu,
    CreatingDocument(CreationStep),
    DocumentList { entries: Vec<DocumentId> },
    DocumentDetail {
        document: DocumentId,
        linked: Vec<DocumentId>,
        from_quote: Option<DocumentId>,
    },
    DepositRate { quote: DocumentId },
    EmailRecipient { document: DocumentId },
    DuplicateList { quotes: Vec<DocumentId> },
    DuplicateClient { quote: DocumentId },
    ReminderList { entries: Vec<DocumentId>, as_of: NaiveDate },
    ReminderAction { document: DocumentId, as_of: NaiveDate },
    AwaitingConfirmation(PendingAction),
}

impl ConversationState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MainMenu => "main_menu",
            Self::CreatingDocument(_) => "creating_document",
            Self::DocumentList { .. } => "document_list",
            Self::DocumentDetail { .. } => "document_detail",
            Self::DepositRate { .. } => "deposit_rate",
            Self::EmailRecipient { .. } => "email_recipient",
            Self::DuplicateList { .. } => "duplicate_list",
            Self::DuplicateClient { .. } => "duplicate_client",
            Self::ReminderList { .. } => "reminder_list",
            Self::ReminderAction { .. } => "reminder_action",
            Self::AwaitingConfirmation(_) => "awaiting_confirmation",
        }
    }

    pub fn is_confirmation(&self) -> bool {
        matches!(self, Self::AwaitingConfirmation(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", content = "field", rename_all = "snake_case")]
pub enum CreationStep {
    /// Clients of earlier documents, most recent first; the entry after them starts a new one.
    RecentClient { clients: Vec<ClientDetails> },
    ClientName,
    ClientPhone,
    LineItems { extracting: bool },
    LineItemsReview,
    Recap,
    EditMenu,
    EditField(DraftField),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "document", rename_all = "snake_case")]
pub enum PendingAction {
    CancelDraft,
    DeleteDocument(DocumentId),
    IssueFinalInvoice(DocumentId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MainMenuOption {
    NewQuote,
    NewInvoice,
    Documents,
    DuplicateQuote,
    Reminders,
    Help,
}

pub const MAIN_MENU_OPTIONS: [MainMenuOption; 6] = [
    MainMenuOption::NewQuote,
    MainMenuOption::NewInvoice,
    MainMenuOption::Documents,
    MainMenuOption::DuplicateQuote,
    MainMenuOption::Reminders,
    MainMenuOption::Help,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReviewOption {
    AddMore,
    Continue,
    StartOver,
}

pub const REVIEW_OPTIONS: [ReviewOption; 3] =
    [ReviewOption::AddMore, ReviewOption::Continue, ReviewOption::StartOver];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecapOption {
    Validate,
    Edit,
    Fill(DraftField),
    Cancel,
}

const RECAP_ENRICHMENT: [DraftField; 6] = [
    DraftField::ClientEmail,
    DraftField::ClientAddress,
    DraftField::Project,
    DraftField::Discount,
    DraftField::Deposit,
    DraftField::CompletionDelay,
];

/// Recap choices: validate, edit, one entry per optional field still empty, cancel.
pub fn recap_options(draft: &DraftDocument) -> Vec<RecapOption> {
    let mut options = vec![RecapOption::Validate, RecapOption::Edit];
    options.extend(
        RECAP_ENRICHMENT
            .iter()
            .copied()
            .filter(|field| draft.is_empty(*field))
            .map(RecapOption::Fill),
    );
    options.push(RecapOption::Cancel);
    options
}

pub const EDIT_MENU_OPTIONS: [DraftField; 9] = [
    DraftField::ClientName,
    DraftField::ClientPhone,
    DraftField::ClientEmail,
    DraftField::ClientAddress,
    DraftField::Project,
    DraftField::LineItems,
    DraftField::Discount,
    DraftField::Deposit,
    DraftField::CompletionDelay,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuoteDetailOption {
    SharePdf,
    SendEmail,
    DepositInvoice,
    FinalInvoice,
    ExportWord,
    Delete,
}

pub const QUOTE_DETAIL_OPTIONS: [QuoteDetailOption; 6] = [
    QuoteDetailOption::SharePdf,
    QuoteDetailOption::SendEmail,
    QuoteDetailOption::DepositInvoice,
    QuoteDetailOption::FinalInvoice,
    QuoteDetailOption::ExportWord,
    QuoteDetailOption::Delete,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvoiceDetailOption {
    SharePdf,
    SendEmail,
    MarkPaid,
    Delete,
}

pub const INVOICE_DETAIL_OPTIONS: [InvoiceDetailOption; 4] = [
    InvoiceDetailOption::SharePdf,
    InvoiceDetailOption::SendEmail,
    InvoiceDetailOption::MarkPaid,
    InvoiceDetailOption::Delete,
];

pub const DEPOSIT_RATE_OPTIONS: [Decimal; 3] = [
    Decimal::from_parts(30, 0, 0, false, 0),
    Decimal::from_parts(40, 0, 0, false, 0),
    Decimal::from_parts(50, 0, 0, false, 0),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateClientOption {
    SameClient,
    NewClient,
}

pub const DUPLICATE_CLIENT_OPTIONS: [DuplicateClientOption; 2] =
    [DuplicateClientOption::SameClient, DuplicateClientOption::NewClient];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReminderOption {
    ForwardMessage,
    SendEmail,
}

pub const REMINDER_OPTIONS: [ReminderOption; 2] =
    [ReminderOption::ForwardMessage, ReminderOption::SendEmail];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationOption {
    Confirm,
    Decline,
}

pub const CONFIRMATION_OPTIONS: [ConfirmationOption; 2] =
    [ConfirmationOption::Confirm, ConfirmationOption::Decline];

/// Stable per-document label for the invoices linked to a quote: A, B, C, ...
pub fn linked_label(index: usize) -> String {
    let letter = u8::try_from(index % 26).map(|offset| char::from(b'A' + offset)).unwrap_or('?');
    if index < 26 {
        letter.to_string()
    } else {
        format!("{letter}{}", index / 26)
    }
}

/// Inverse of [`linked_label`] for the single letters users type.
pub fn linked_index(token: &str) -> Option<usize> {
    let mut chars = token.chars();
    let letter = chars.next()?;
    if chars.next().is_some() || !letter.is_ascii_alphabetic() {
        return None;
    }
    Some(usize::from(letter.to_ascii_uppercase() as u8 - b'A'))
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use crate::domain::document::{DocumentId, DocumentKind};
    use crate::domain::draft::{ClientDetails, DraftDocument, DraftField};

    use super::{
        linked_index, linked_label, recap_options, ConversationId, ConversationState, CreationStep,
        RecapOption, Session,
    };

    #[test]
    fn new_sessions_start_at_main_menu() {
        let session = Session::new(ConversationId("33612345678".to_owned()));
        assert_eq!(session.state, ConversationState::MainMenu);
        assert!(session.draft.is_none());
        assert_eq!(session.next_sequence, 1);
    }

    #[test]
    fn allocated_ids_are_scoped_to_the_conversation() {
        let mut session = Session::new(ConversationId("33612345678".to_owned()));
        let (first, _) = session.allocate_document();
        let (second, sequence) = session.allocate_document();

        assert_eq!(first.0, "33612345678-1");
        assert_eq!(second.0, "33612345678-2");
        assert_eq!(sequence, 2);
    }

    #[test]
    fn recap_offers_only_empty_optional_fields() {
        let mut draft = DraftDocument::new(DocumentKind::Quote);
        assert_eq!(recap_options(&draft).len(), 9);

        draft.client.email = Some("client@exemple.fr".to_owned());
        draft.discount_pct = Decimal::new(5, 0);
        let options = recap_options(&draft);

        assert_eq!(options.len(), 7);
        assert!(!options.contains(&RecapOption::Fill(DraftField::ClientEmail)));
        assert!(!options.contains(&RecapOption::Fill(DraftField::Discount)));
        assert_eq!(options.last(), Some(&RecapOption::Cancel));
    }

    #[test]
    fn labels_round_trip_through_letters() {
        assert_eq!(linked_label(0), "A");
        assert_eq!(linked_label(1), "B");
        assert_eq!(linked_index("b"), Some(1));
        assert_eq!(linked_index("ab"), None);
        assert_eq!(linked_index("3"), None);
    }

    #[test]
    fn list_states_survive_json_storage() {
        let as_of = chrono::NaiveDate::from_ymd_opt(2026, 3, 2).expect("date");
        let states = [
            ConversationState::CreatingDocument(CreationStep::RecentClient {
                clients: vec![ClientDetails {
                    name: Some("Dupont".to_owned()),
                    ..ClientDetails::default()
                }],
            }),
            ConversationState::DuplicateList { quotes: vec![DocumentId("336-1".to_owned())] },
            ConversationState::ReminderAction { document: DocumentId("336-2".to_owned()), as_of },
        ];

        for state in states {
            let encoded = serde_json::to_string(&state).expect("serialize state");
            let decoded: ConversationState =
                serde_json::from_str(&encoded).expect("deserialize state");
            assert_eq!(decoded, state);
        }
    }

    #[test]
    fn unknown_state_tags_fail_to_decode() {
        let decoded = serde_json::from_str::<ConversationState>(r#"{"state":"signing_quote"}"#);
        assert!(decoded.is_err());
    }

    #[test]
    fn session_state_survives_json_storage() {
        let mut session = Session::new(ConversationId("33600000000".to_owned()));
        session.state = ConversationState::CreatingDocument(CreationStep::EditField(
            DraftField::Discount,
        ));
        session.draft = Some(DraftDocument::new(DocumentKind::Invoice));

        let encoded = serde_json::to_string(&session).expect("serialize session");
        let decoded: Session = serde_json::from_str(&encoded).expect("deserialize session");
        assert_eq!(decoded, session);
    }
}
