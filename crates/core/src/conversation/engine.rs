use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::conversation::commands::{
    build_and_store, document_email, reminder_email, reminder_text, ArtifactRef, Command,
    CommandStage, EmailAttachment, Inbound, SystemEvent,
};
use crate::conversation::render::{self, format_money, format_percent, problem_message};
use crate::conversation::states::{
    linked_index, recap_options, ConfirmationOption, ConversationState, CreationStep,
    DuplicateClientOption, InvoiceDetailOption, MainMenuOption, PendingAction,
    QuoteDetailOption, RecapOption, ReminderOption, ReviewOption, Session, CONFIRMATION_OPTIONS,
    DEPOSIT_RATE_OPTIONS, DUPLICATE_CLIENT_OPTIONS, EDIT_MENU_OPTIONS, INVOICE_DETAIL_OPTIONS,
    MAIN_MENU_OPTIONS, QUOTE_DETAIL_OPTIONS, REMINDER_OPTIONS, REVIEW_OPTIONS,
};
use crate::domain::contact::{normalize_email, normalize_phone};
use crate::domain::document::{
    document_number, ArtifactState, Deduction, DocumentFormat, DocumentId, DocumentKind,
    DocumentRecord, DocumentStatus, InvoiceKind,
};
use crate::domain::draft::{
    percent_of, ClientDetails, DraftDocument, DraftField, LineItem, DEFAULT_VAT_RATE,
};
use crate::parsing::{parse_express, parse_line_items, parse_percentage};

const MAX_LISTED_DOCUMENTS: usize = 9;
const RECENT_CLIENT_LIMIT: usize = 5;
const SKIP_WORDS: [&str; 6] = ["non", "passer", "skip", "aucun", "aucune", "-"];
const NEW_CLIENT_WORDS: [&str; 3] = ["nouveau", "new", "autre"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub vat_rate: Decimal,
    pub line_item_extraction: bool,
    pub company_name: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            vat_rate: DEFAULT_VAT_RATE,
            line_item_extraction: false,
            company_name: "Vocario".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputProblem {
    OutOfRange,
    UnrecognizedText,
    EmptyValue,
    InvalidPhone,
    InvalidEmail,
    InvalidPercentage,
    NoLineItems,
    DocumentBusy,
    AlreadyPaid,
    AmountTooLarge,
    FinalInvoiceExists,
    NoClientEmail,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConversationError {
    #[error("input rejected in state {state}: {problem:?}")]
    UserInput { state: &'static str, problem: InputProblem },
    #[error("draft cannot be finalized without {field:?}")]
    DraftIncomplete { field: DraftField },
    #[error("conversation invariant violated: {0}")]
    InternalInvariant(String),
}

/// Result of feeding one inbound value to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub session: Session,
    pub reply: Option<String>,
    pub commands: Vec<Command>,
    pub error: Option<ConversationError>,
}

impl Transition {
    pub fn is_defect(&self) -> bool {
        matches!(self.error, Some(ConversationError::InternalInvariant(_)))
    }
}

#[derive(Debug, Default)]
struct Step {
    notice: Option<String>,
    commands: Vec<Command>,
    show_prompt: bool,
}

impl Step {
    fn prompt() -> Self {
        Self { notice: None, commands: Vec::new(), show_prompt: true }
    }

    fn notice(text: impl Into<String>) -> Self {
        Self { notice: Some(text.into()), commands: Vec::new(), show_prompt: true }
    }

    fn notice_only(text: impl Into<String>) -> Self {
        Self { notice: Some(text.into()), commands: Vec::new(), show_prompt: false }
    }

    fn silent() -> Self {
        Self::default()
    }

    fn with_commands(mut self, commands: impl IntoIterator<Item = Command>) -> Self {
        self.commands.extend(commands);
        self
    }
}

enum DraftOutcome {
    Continue { next: CreationStep, notice: Option<String>, commands: Vec<Command> },
    Finalize,
    Cancel,
}

impl DraftOutcome {
    fn next(step: CreationStep) -> Self {
        Self::Continue { next: step, notice: None, commands: Vec::new() }
    }
}

enum Navigation {
    Back,
    Home,
}

struct Input<'a> {
    raw: &'a str,
    folded: String,
}

impl<'a> Input<'a> {
    fn new(raw: &'a str) -> Self {
        let raw = raw.trim();
        Self { raw, folded: raw.to_lowercase() }
    }

    /// A single digit is a menu choice; anything longer is free text.
    fn choice(&self) -> Option<usize> {
        let mut chars = self.folded.chars();
        match (chars.next(), chars.next()) {
            (Some(digit), None) => digit.to_digit(10).and_then(|value| usize::try_from(value).ok()),
            _ => None,
        }
    }

    fn navigation(&self) -> Option<Navigation> {
        match self.folded.as_str() {
            "back" | "retour" => Some(Navigation::Back),
            "home" | "menu" | "accueil" | "start" | "bonjour" | "salut" | "hello" => {
                Some(Navigation::Home)
            }
            _ => None,
        }
    }

    fn is_skip(&self) -> bool {
        SKIP_WORDS.contains(&self.folded.as_str())
    }
}

/// Pure conversation state machine: `(session, inbound) -> (session, reply, commands)`.
#[derive(Clone, Debug, Default)]
pub struct ConversationEngine {
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn transition(&self, session: Session, inbound: &Inbound) -> Transition {
        let mut next = session.clone();
        let step = match inbound {
            Inbound::Message { text, received_at } => {
                next.updated_at = Some(*received_at);
                self.on_message(&mut next, text, *received_at)
            }
            Inbound::System(event) => self.on_system_event(&mut next, event),
        };

        match step {
            Ok(step) => match self.compose_reply(&next, step.notice, step.show_prompt) {
                Ok(reply) => {
                    Transition { session: next, reply, commands: step.commands, error: None }
                }
                Err(fault) => self.reset(session, fault),
            },
            Err(fault @ ConversationError::InternalInvariant(_)) => self.reset(session, fault),
            Err(error) => match render::prompt(&session, &self.settings) {
                Ok(menu) => Transition {
                    reply: Some(format!("{}\n\n{menu}", render::soft_error(&error))),
                    session,
                    commands: Vec::new(),
                    error: Some(error),
                },
                Err(fault) => self.reset(session, fault),
            },
        }
    }

    pub fn transition_with_audit<S>(
        &self,
        session: Session,
        inbound: &Inbound,
        sink: &S,
        audit: &AuditContext,
    ) -> Transition
    where
        S: AuditSink + ?Sized,
    {
        let from = session.state.name();
        let transition = self.transition(session, inbound);
        let (event_type, outcome) = match &transition.error {
            None => ("conversation.transition_applied", AuditOutcome::Success),
            Some(ConversationError::InternalInvariant(_)) => {
                ("conversation.invariant_violated", AuditOutcome::Failed)
            }
            Some(_) => ("conversation.input_rejected", AuditOutcome::Rejected),
        };

        let mut event = AuditEvent::new(
            audit.conversation_id.clone(),
            audit.document_id.clone(),
            audit.correlation_id.clone(),
            event_type,
            AuditCategory::Conversation,
            audit.actor.clone(),
            outcome,
        )
        .with_metadata("from", from)
        .with_metadata("to", transition.session.state.name())
        .with_metadata("commands", transition.commands.len().to_string());
        if let Some(error) = &transition.error {
            event = event.with_metadata("error", error.to_string());
        }
        sink.emit(event);

        transition
    }

    fn compose_reply(
        &self,
        session: &Session,
        notice: Option<String>,
        show_prompt: bool,
    ) -> Result<Option<String>, ConversationError> {
        if !show_prompt {
            return Ok(notice);
        }
        let prompt = render::prompt(session, &self.settings)?;
        Ok(Some(match notice {
            Some(notice) => format!("{notice}\n\n{prompt}"),
            None => prompt,
        }))
    }

    fn reset(&self, mut session: Session, fault: ConversationError) -> Transition {
        session.state = ConversationState::MainMenu;
        session.draft = None;
        Transition {
            session,
            reply: Some(format!("{}\n\n{}", render::GENERIC_FAILURE, render::main_menu())),
            commands: Vec::new(),
            error: Some(fault),
        }
    }

    fn on_message(
        &self,
        session: &mut Session,
        text: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Step, ConversationError> {
        let input = Input::new(text);
        if !session.state.is_confirmation() {
            match input.navigation() {
                Some(Navigation::Home) => {
                    session.draft = None;
                    session.state = ConversationState::MainMenu;
                    return Ok(Step::prompt());
                }
                Some(Navigation::Back) => return self.go_back(session),
                None => {}
            }
        }

        match session.state.clone() {
            ConversationState::MainMenu => self.on_main_menu(session, &input, received_at),
            ConversationState::CreatingDocument(step) => {
                self.on_creating(session, step, &input, received_at)
            }
            ConversationState::DocumentList { entries } => {
                let state = session.state.clone();
                let document = resolve(&state, &entries, &input)?
                    .ok_or_else(|| user_input(&state, InputProblem::UnrecognizedText))?;
                session.state = detail_state(session, &document, None)?;
                Ok(Step::prompt())
            }
            ConversationState::DocumentDetail { document, linked, .. } => {
                self.on_document_detail(session, &document, &linked, &input)
            }
            ConversationState::DepositRate { quote } => {
                let state = session.state.clone();
                let rate = match resolve(&state, &DEPOSIT_RATE_OPTIONS, &input)? {
                    Some(rate) => rate,
                    None => parse_percentage(input.raw)
                        .filter(|rate| !rate.is_zero())
                        .ok_or_else(|| user_input(&state, InputProblem::InvalidPercentage))?,
                };
                self.issue_deposit_invoice(session, &quote, rate, received_at)
            }
            ConversationState::EmailRecipient { document } => {
                self.on_email_recipient(session, &document, &input)
            }
            ConversationState::DuplicateList { quotes } => {
                let state = session.state.clone();
                let quote = resolve(&state, &quotes, &input)?
                    .ok_or_else(|| user_input(&state, InputProblem::UnrecognizedText))?;
                session.state = ConversationState::DuplicateClient { quote };
                Ok(Step::prompt())
            }
            ConversationState::DuplicateClient { quote } => {
                self.duplicate_quote(session, &quote, &input)
            }
            ConversationState::ReminderList { entries, as_of } => {
                let state = session.state.clone();
                let document = resolve(&state, &entries, &input)?
                    .ok_or_else(|| user_input(&state, InputProblem::UnrecognizedText))?;
                session.state = ConversationState::ReminderAction { document, as_of };
                Ok(Step::prompt())
            }
            ConversationState::ReminderAction { document, as_of } => {
                self.on_reminder_action(session, &document, as_of, &input)
            }
            ConversationState::AwaitingConfirmation(action) => {
                self.on_confirmation(session, action, &input, received_at)
            }
        }
    }

    fn go_back(&self, session: &mut Session) -> Result<Step, ConversationError> {
        use CreationStep::{
            ClientName, ClientPhone, EditField, EditMenu, LineItems, LineItemsReview, Recap,
            RecentClient,
        };

        let parent = match &session.state {
            ConversationState::MainMenu => ConversationState::MainMenu,
            ConversationState::CreatingDocument(RecentClient { .. } | ClientName) => {
                session.draft = None;
                ConversationState::MainMenu
            }
            ConversationState::CreatingDocument(ClientPhone) => {
                ConversationState::CreatingDocument(ClientName)
            }
            ConversationState::CreatingDocument(LineItems { .. }) => {
                ConversationState::CreatingDocument(ClientPhone)
            }
            ConversationState::CreatingDocument(LineItemsReview) => {
                ConversationState::CreatingDocument(LineItems { extracting: false })
            }
            ConversationState::CreatingDocument(Recap) => {
                ConversationState::CreatingDocument(LineItemsReview)
            }
            ConversationState::CreatingDocument(EditMenu | EditField(_)) => {
                ConversationState::CreatingDocument(Recap)
            }
            ConversationState::DocumentList { .. } => ConversationState::MainMenu,
            ConversationState::DocumentDetail { from_quote: Some(quote), .. } => {
                detail_state(session, quote, None)?
            }
            ConversationState::DocumentDetail { from_quote: None, .. } => list_state(session),
            ConversationState::DepositRate { quote } => detail_state(session, quote, None)?,
            ConversationState::EmailRecipient { document } => {
                let from_quote = source_quote_of(session, document);
                detail_state(session, document, from_quote)?
            }
            ConversationState::DuplicateList { .. } | ConversationState::ReminderList { .. } => {
                ConversationState::MainMenu
            }
            ConversationState::DuplicateClient { .. } => duplicate_state(session),
            ConversationState::ReminderAction { as_of, .. } => reminder_state(session, *as_of),
            ConversationState::AwaitingConfirmation(_) => session.state.clone(),
        };

        session.state = parent;
        Ok(Step::prompt())
    }

    fn on_main_menu(
        &self,
        session: &mut Session,
        input: &Input<'_>,
        received_at: DateTime<Utc>,
    ) -> Result<Step, ConversationError> {
        let option = match resolve(&session.state, &MAIN_MENU_OPTIONS, input)? {
            Some(option) => option,
            None => main_menu_alias(&input.folded)
                .ok_or_else(|| user_input(&session.state, InputProblem::UnrecognizedText))?,
        };

        let step = match option {
            MainMenuOption::NewQuote => start_draft(session, DocumentKind::Quote),
            MainMenuOption::NewInvoice => start_draft(session, DocumentKind::Invoice),
            MainMenuOption::Documents => {
                session.state = list_state(session);
                Step::prompt()
            }
            MainMenuOption::DuplicateQuote => match duplicate_state(session) {
                ConversationState::DuplicateList { quotes } if quotes.is_empty() => {
                    Step::notice("📭 Aucun devis à dupliquer.")
                }
                state => {
                    session.state = state;
                    Step::prompt()
                }
            },
            MainMenuOption::Reminders => match reminder_state(session, received_at.date_naive()) {
                ConversationState::ReminderList { entries, .. } if entries.is_empty() => {
                    Step::notice("✅ *Rien à relancer !* Tous vos documents sont à jour.")
                }
                state => {
                    session.state = state;
                    Step::prompt()
                }
            },
            MainMenuOption::Help => Step::notice(render::help()),
        };
        Ok(step)
    }

    fn on_creating(
        &self,
        session: &mut Session,
        step: CreationStep,
        input: &Input<'_>,
        received_at: DateTime<Utc>,
    ) -> Result<Step, ConversationError> {
        let state = session.state.clone();
        let draft = session.draft.as_mut().ok_or_else(missing_draft)?;

        match self.advance_draft(&state, draft, step, input)? {
            DraftOutcome::Continue { next, notice, commands } => {
                session.state = ConversationState::CreatingDocument(next);
                Ok(Step { notice, commands, show_prompt: true })
            }
            DraftOutcome::Finalize => self.finalize(session, received_at),
            DraftOutcome::Cancel => {
                session.state = ConversationState::AwaitingConfirmation(PendingAction::CancelDraft);
                Ok(Step::prompt())
            }
        }
    }

    fn advance_draft(
        &self,
        state: &ConversationState,
        draft: &mut DraftDocument,
        step: CreationStep,
        input: &Input<'_>,
    ) -> Result<DraftOutcome, ConversationError> {
        let outcome = match step {
            CreationStep::RecentClient { clients } => {
                if input.choice() == Some(clients.len() + 1)
                    || NEW_CLIENT_WORDS.contains(&input.folded.as_str())
                {
                    return Ok(DraftOutcome::next(CreationStep::ClientName));
                }
                if input.choice().is_none() {
                    return self.advance_draft(state, draft, CreationStep::ClientName, input);
                }
                let client = resolve(state, &clients, input)?
                    .ok_or_else(|| user_input(state, InputProblem::UnrecognizedText))?;
                let notice = format!("✅ Client : *{}*", client.display_name());
                draft.client = client;
                DraftOutcome::Continue {
                    next: lines_step(draft),
                    notice: Some(notice),
                    commands: Vec::new(),
                }
            }
            CreationStep::ClientName => {
                let text = free_text(state, input)?;
                match parse_express(text) {
                    Some(entry) => {
                        check_bounds(state, &entry.lines)?;
                        let count = entry.lines.len();
                        draft.client.name = Some(entry.client_name);
                        draft.client.phone = Some(entry.phone);
                        draft.lines.extend(entry.lines);
                        DraftOutcome::Continue {
                            next: CreationStep::Recap,
                            notice: Some(format!(
                                "⚡ Saisie express : {count} prestation(s) ajoutée(s)."
                            )),
                            commands: Vec::new(),
                        }
                    }
                    None => {
                        draft.client.name = Some(text.to_owned());
                        DraftOutcome::next(CreationStep::ClientPhone)
                    }
                }
            }
            CreationStep::ClientPhone => {
                let text = free_text(state, input)?;
                draft.client.phone = if input.is_skip() {
                    None
                } else {
                    Some(
                        normalize_phone(text)
                            .ok_or_else(|| user_input(state, InputProblem::InvalidPhone))?,
                    )
                };
                DraftOutcome::next(lines_step(draft))
            }
            CreationStep::LineItems { .. } => {
                let text = free_text(state, input)?;
                let items = parse_line_items(text);
                if !items.is_empty() {
                    check_bounds(state, &items)?;
                    draft.lines.extend(items);
                    DraftOutcome::next(CreationStep::LineItemsReview)
                } else if self.settings.line_item_extraction {
                    DraftOutcome::Continue {
                        next: CreationStep::LineItems { extracting: true },
                        notice: None,
                        commands: vec![Command::ExtractLineItems { text: text.to_owned() }],
                    }
                } else {
                    return Err(user_input(state, InputProblem::NoLineItems));
                }
            }
            CreationStep::LineItemsReview => {
                match resolve(state, &REVIEW_OPTIONS, input)?
                    .ok_or_else(|| user_input(state, InputProblem::UnrecognizedText))?
                {
                    ReviewOption::AddMore => {
                        DraftOutcome::next(CreationStep::LineItems { extracting: false })
                    }
                    ReviewOption::Continue => DraftOutcome::next(CreationStep::Recap),
                    ReviewOption::StartOver => {
                        draft.lines.clear();
                        DraftOutcome::next(CreationStep::LineItems { extracting: false })
                    }
                }
            }
            CreationStep::Recap => {
                let options = recap_options(draft);
                match resolve(state, &options, input)?
                    .ok_or_else(|| user_input(state, InputProblem::UnrecognizedText))?
                {
                    RecapOption::Validate => DraftOutcome::Finalize,
                    RecapOption::Edit => DraftOutcome::next(CreationStep::EditMenu),
                    RecapOption::Fill(field) => DraftOutcome::next(CreationStep::EditField(field)),
                    RecapOption::Cancel => DraftOutcome::Cancel,
                }
            }
            CreationStep::EditMenu => {
                let field = resolve(state, &EDIT_MENU_OPTIONS, input)?
                    .ok_or_else(|| user_input(state, InputProblem::UnrecognizedText))?;
                if field == DraftField::LineItems {
                    draft.lines.clear();
                    DraftOutcome::next(CreationStep::LineItems { extracting: false })
                } else {
                    DraftOutcome::next(CreationStep::EditField(field))
                }
            }
            CreationStep::EditField(field) => {
                let text = free_text(state, input)?;
                apply_field(draft, field, text, input.is_skip())
                    .map_err(|problem| user_input(state, problem))?;
                DraftOutcome::Continue {
                    next: CreationStep::Recap,
                    notice: Some(format!("✅ {} : c'est noté.", field.label())),
                    commands: Vec::new(),
                }
            }
        };
        Ok(outcome)
    }

    fn finalize(
        &self,
        session: &mut Session,
        received_at: DateTime<Utc>,
    ) -> Result<Step, ConversationError> {
        let draft = session.draft.take().ok_or_else(missing_draft)?;
        if let Some(field) = draft.missing_for_finalize() {
            return Err(ConversationError::DraftIncomplete { field });
        }

        let (id, sequence) = session.allocate_document();
        let issued_on = received_at.date_naive();
        let number = document_number(draft.kind, issued_on, sequence);
        let mut record =
            DocumentRecord::from_draft(id, number, &draft, self.settings.vat_rate, issued_on);
        record.artifacts.insert(DocumentFormat::Pdf, ArtifactState::Building);

        let mut commands = Vec::from(build_and_store(&record, DocumentFormat::Pdf));
        if let Some(to) = &record.client.email {
            let attachment = EmailAttachment::Pending {
                artifact: ArtifactRef { document: record.id.clone(), format: DocumentFormat::Pdf },
                filename: record.filename(DocumentFormat::Pdf),
            };
            commands.push(document_email(&record, to, &self.settings.company_name, attachment));
        }

        let notice = format!(
            "✅ {} {} validé ! Génération du PDF en cours...",
            record.title(),
            record.number
        );
        session.state = ConversationState::DocumentDetail {
            document: record.id.clone(),
            linked: Vec::new(),
            from_quote: None,
        };
        session.documents.push(record);
        Ok(Step::notice(notice).with_commands(commands))
    }

    fn on_document_detail(
        &self,
        session: &mut Session,
        document: &DocumentId,
        linked: &[DocumentId],
        input: &Input<'_>,
    ) -> Result<Step, ConversationError> {
        let state = session.state.clone();
        let record = session.document(document).cloned().ok_or_else(|| unknown(document))?;

        if record.is_quote() {
            if let Some(index) = linked_index(&input.folded) {
                let invoice = linked
                    .get(index)
                    .ok_or_else(|| user_input(&state, InputProblem::OutOfRange))?;
                session.state = detail_state(session, invoice, Some(document.clone()))?;
                return Ok(Step::prompt());
            }

            let option = resolve(&state, &QUOTE_DETAIL_OPTIONS, input)?
                .ok_or_else(|| user_input(&state, InputProblem::UnrecognizedText))?;
            return match option {
                QuoteDetailOption::SharePdf => {
                    share_artifact(session, &state, &record, DocumentFormat::Pdf)
                }
                QuoteDetailOption::SendEmail => self.send_by_email(session, &state, &record),
                QuoteDetailOption::DepositInvoice => {
                    session.state = ConversationState::DepositRate { quote: document.clone() };
                    Ok(Step::prompt())
                }
                QuoteDetailOption::FinalInvoice => {
                    if session.final_invoice(document).is_some() {
                        return Err(user_input(&state, InputProblem::FinalInvoiceExists));
                    }
                    session.state = ConversationState::AwaitingConfirmation(
                        PendingAction::IssueFinalInvoice(document.clone()),
                    );
                    Ok(Step::prompt())
                }
                QuoteDetailOption::ExportWord => {
                    share_artifact(session, &state, &record, DocumentFormat::Word)
                }
                QuoteDetailOption::Delete => {
                    session.state = ConversationState::AwaitingConfirmation(
                        PendingAction::DeleteDocument(document.clone()),
                    );
                    Ok(Step::prompt())
                }
            };
        }

        let option = resolve(&state, &INVOICE_DETAIL_OPTIONS, input)?
            .ok_or_else(|| user_input(&state, InputProblem::UnrecognizedText))?;
        match option {
            InvoiceDetailOption::SharePdf => {
                share_artifact(session, &state, &record, DocumentFormat::Pdf)
            }
            InvoiceDetailOption::SendEmail => self.send_by_email(session, &state, &record),
            InvoiceDetailOption::MarkPaid => {
                if record.status == DocumentStatus::Paid {
                    return Err(user_input(&state, InputProblem::AlreadyPaid));
                }
                let paid = session.document_mut(document).ok_or_else(|| unknown(document))?;
                paid.status = DocumentStatus::Paid;
                let title = record.title();
                Ok(Step::notice(format!("✅ {title} {} marquée comme payée.", record.number)))
            }
            InvoiceDetailOption::Delete => {
                session.state = ConversationState::AwaitingConfirmation(
                    PendingAction::DeleteDocument(document.clone()),
                );
                Ok(Step::prompt())
            }
        }
    }

    fn send_by_email(
        &self,
        session: &mut Session,
        state: &ConversationState,
        record: &DocumentRecord,
    ) -> Result<Step, ConversationError> {
        match record.client.email.clone() {
            Some(to) => self.email_document(session, state, &record.id, &to),
            None => {
                session.state = ConversationState::EmailRecipient { document: record.id.clone() };
                Ok(Step::prompt())
            }
        }
    }

    fn email_document(
        &self,
        session: &mut Session,
        state: &ConversationState,
        document: &DocumentId,
        to: &str,
    ) -> Result<Step, ConversationError> {
        let record = session.document_mut(document).ok_or_else(|| unknown(document))?;
        let filename = record.filename(DocumentFormat::Pdf);
        let mut commands = Vec::new();

        let attachment = match record.artifacts.get(&DocumentFormat::Pdf) {
            Some(ArtifactState::Ready { url }) => {
                EmailAttachment::Archived { url: url.clone(), filename }
            }
            Some(ArtifactState::Building) => {
                return Err(user_input(state, InputProblem::DocumentBusy));
            }
            Some(ArtifactState::Failed { .. }) | None => {
                record.artifacts.insert(DocumentFormat::Pdf, ArtifactState::Building);
                commands.extend(build_and_store(record, DocumentFormat::Pdf));
                EmailAttachment::Pending {
                    artifact: ArtifactRef {
                        document: document.clone(),
                        format: DocumentFormat::Pdf,
                    },
                    filename,
                }
            }
        };
        commands.push(document_email(record, to, &self.settings.company_name, attachment));

        let notice =
            format!("📧 Envoi de {} {} à {to} en cours...", record.title(), record.number);
        Ok(Step::notice(notice).with_commands(commands))
    }

    fn on_email_recipient(
        &self,
        session: &mut Session,
        document: &DocumentId,
        input: &Input<'_>,
    ) -> Result<Step, ConversationError> {
        let state = session.state.clone();
        let text = free_text(&state, input)?;
        let email =
            normalize_email(text).ok_or_else(|| user_input(&state, InputProblem::InvalidEmail))?;

        let record = session.document_mut(document).ok_or_else(|| unknown(document))?;
        record.client.email = Some(email.clone());
        let from_quote = record.source_quote.clone();

        let step = self.email_document(session, &state, document, &email)?;
        session.state = detail_state(session, document, from_quote)?;
        Ok(step)
    }

    fn on_confirmation(
        &self,
        session: &mut Session,
        action: PendingAction,
        input: &Input<'_>,
        received_at: DateTime<Utc>,
    ) -> Result<Step, ConversationError> {
        let state = session.state.clone();
        let choice = match resolve(&state, &CONFIRMATION_OPTIONS, input)? {
            Some(choice) => choice,
            None => match input.folded.as_str() {
                "oui" | "o" | "yes" | "y" => ConfirmationOption::Confirm,
                "non" | "n" | "no" => ConfirmationOption::Decline,
                _ => return Err(user_input(&state, InputProblem::UnrecognizedText)),
            },
        };

        match (action, choice) {
            (PendingAction::CancelDraft, ConfirmationOption::Confirm) => {
                session.draft = None;
                session.state = ConversationState::MainMenu;
                Ok(Step::notice("🗑️ Brouillon abandonné."))
            }
            (PendingAction::CancelDraft, ConfirmationOption::Decline) => {
                session.state = ConversationState::CreatingDocument(CreationStep::Recap);
                Ok(Step::prompt())
            }
            (PendingAction::DeleteDocument(document), ConfirmationOption::Confirm) => {
                delete_document(session, &document)
            }
            (PendingAction::DeleteDocument(document), ConfirmationOption::Decline) => {
                let from_quote = source_quote_of(session, &document);
                session.state = detail_state(session, &document, from_quote)?;
                Ok(Step::prompt())
            }
            (PendingAction::IssueFinalInvoice(quote), ConfirmationOption::Confirm) => {
                self.issue_final_invoice(session, &quote, received_at)
            }
            (PendingAction::IssueFinalInvoice(quote), ConfirmationOption::Decline) => {
                session.state = detail_state(session, &quote, None)?;
                Ok(Step::prompt())
            }
        }
    }

    fn issue_deposit_invoice(
        &self,
        session: &mut Session,
        quote: &DocumentId,
        rate: Decimal,
        received_at: DateTime<Utc>,
    ) -> Result<Step, ConversationError> {
        let source = session.document(quote).cloned().ok_or_else(|| unknown(quote))?;
        let amount = percent_of(source.totals().net, rate);

        let mut draft = DraftDocument::new(DocumentKind::Invoice);
        draft.client = source.client.clone();
        draft.project = source.project.clone();
        draft.lines.push(LineItem::flat(
            format!("Acompte {} sur devis {}", format_percent(rate), source.number),
            amount,
        ));

        Ok(issue_invoice(
            session,
            &draft,
            &source,
            InvoiceKind::Deposit,
            Vec::new(),
            received_at,
        ))
    }

    fn issue_final_invoice(
        &self,
        session: &mut Session,
        quote: &DocumentId,
        received_at: DateTime<Utc>,
    ) -> Result<Step, ConversationError> {
        let source = session.document(quote).cloned().ok_or_else(|| unknown(quote))?;
        if session.final_invoice(quote).is_some() {
            session.state = detail_state(session, quote, None)?;
            return Ok(Step::notice(problem_message(InputProblem::FinalInvoiceExists)));
        }
        let deductions = session
            .paid_deposits(quote)
            .into_iter()
            .map(|deposit| Deduction {
                label: format!("Acompte {}", deposit.number),
                amount: deposit.totals().total,
            })
            .collect();

        let mut draft = DraftDocument::new(DocumentKind::Invoice);
        draft.client = source.client.clone();
        draft.project = source.project.clone();
        draft.lines = source.lines.clone();
        draft.discount_pct = source.discount_pct;
        draft.completion_delay = source.completion_delay.clone();

        Ok(issue_invoice(session, &draft, &source, InvoiceKind::Final, deductions, received_at))
    }

    fn duplicate_quote(
        &self,
        session: &mut Session,
        quote: &DocumentId,
        input: &Input<'_>,
    ) -> Result<Step, ConversationError> {
        let state = session.state.clone();
        let option = match resolve(&state, &DUPLICATE_CLIENT_OPTIONS, input)? {
            Some(option) => option,
            None => match input.folded.as_str() {
                "même" | "meme" => DuplicateClientOption::SameClient,
                word if NEW_CLIENT_WORDS.contains(&word) => DuplicateClientOption::NewClient,
                _ => return Err(user_input(&state, InputProblem::UnrecognizedText)),
            },
        };

        let source = session.document(quote).cloned().ok_or_else(|| unknown(quote))?;
        let mut draft = DraftDocument::new(DocumentKind::Quote);
        draft.project = source.project.clone();
        draft.lines = source.lines.clone();
        draft.discount_pct = source.discount_pct;
        draft.deposit_pct = source.deposit_pct;
        draft.completion_delay = source.completion_delay.clone();

        let next = match option {
            DuplicateClientOption::SameClient => {
                draft.client = source.client.clone();
                CreationStep::Recap
            }
            DuplicateClientOption::NewClient => CreationStep::ClientName,
        };
        let notice = format!(
            "📋 Devis {} dupliqué : {} prestation(s) copiée(s).",
            source.number,
            draft.lines.len()
        );
        session.draft = Some(draft);
        session.state = ConversationState::CreatingDocument(next);
        Ok(Step::notice(notice))
    }

    fn on_reminder_action(
        &self,
        session: &mut Session,
        document: &DocumentId,
        as_of: NaiveDate,
        input: &Input<'_>,
    ) -> Result<Step, ConversationError> {
        let state = session.state.clone();
        let option = resolve(&state, &REMINDER_OPTIONS, input)?
            .ok_or_else(|| user_input(&state, InputProblem::UnrecognizedText))?;
        let record = session.document(document).cloned().ok_or_else(|| unknown(document))?;
        let text = reminder_text(&record, as_of, &self.settings.company_name);

        match option {
            ReminderOption::ForwardMessage => {
                let phone = record.client.phone.as_deref().map(|phone| format!(" ({phone})"));
                Ok(Step::notice(format!(
                    "📱 *Message à transférer à {}{}* :\n\n{text}",
                    record.client.display_name(),
                    phone.unwrap_or_default()
                )))
            }
            ReminderOption::SendEmail => {
                let to = record
                    .client
                    .email
                    .clone()
                    .ok_or_else(|| user_input(&state, InputProblem::NoClientEmail))?;
                let attachment = record.artifact_url(DocumentFormat::Pdf).map(|url| {
                    EmailAttachment::Archived {
                        url: url.to_owned(),
                        filename: record.filename(DocumentFormat::Pdf),
                    }
                });
                session.state = ConversationState::MainMenu;
                Ok(Step::notice(format!(
                    "📧 Relance de {} {} envoyée à {to}.",
                    record.title(),
                    record.number
                ))
                .with_commands([reminder_email(&record, &to, text, attachment)]))
            }
        }
    }

    fn on_system_event(
        &self,
        session: &mut Session,
        event: &SystemEvent,
    ) -> Result<Step, ConversationError> {
        let extracting = session.state
            == ConversationState::CreatingDocument(CreationStep::LineItems { extracting: true });

        match event {
            SystemEvent::DocumentStored { artifact, url } => {
                let Some(record) = session.document_mut(&artifact.document) else {
                    return Ok(Step::silent());
                };
                record.artifacts.insert(artifact.format, ArtifactState::Ready { url: url.clone() });
                Ok(Step::notice_only(format!(
                    "📄 {} {} ({}) prêt : {url}",
                    record.title(),
                    record.number,
                    artifact.format.label()
                )))
            }
            SystemEvent::EmailSent { document, to } => {
                let Some(record) = session.document_mut(document) else {
                    return Ok(Step::silent());
                };
                if record.status == DocumentStatus::Pending {
                    record.status = DocumentStatus::Sent;
                }
                Ok(Step::notice_only(format!(
                    "📧 {} {} envoyé à {to}.",
                    record.title(),
                    record.number
                )))
            }
            SystemEvent::LineItemsExtracted { items } => {
                if !extracting {
                    return Ok(Step::silent());
                }
                let draft = session.draft.as_mut().ok_or_else(missing_draft)?;
                let accepted: Vec<LineItem> =
                    items.iter().filter(|item| item.within_bounds()).cloned().collect();
                if accepted.is_empty() {
                    session.state = ConversationState::CreatingDocument(CreationStep::LineItems {
                        extracting: false,
                    });
                    let problem = match items.is_empty() {
                        true => InputProblem::NoLineItems,
                        false => InputProblem::AmountTooLarge,
                    };
                    return Ok(Step::notice(problem_message(problem)));
                }
                let count = accepted.len();
                draft.lines.extend(accepted);
                session.state = ConversationState::CreatingDocument(CreationStep::LineItemsReview);
                Ok(Step::notice(format!("🤖 {count} prestation(s) reconnue(s).")))
            }
            SystemEvent::CommandFailed { stage, artifact, reason } => match stage {
                CommandStage::Build | CommandStage::Store => {
                    let Some(artifact) = artifact else {
                        return Ok(Step::notice_only("⚠️ Un document n'a pas pu être généré."));
                    };
                    let Some(record) = session.document_mut(&artifact.document) else {
                        return Ok(Step::silent());
                    };
                    record
                        .artifacts
                        .insert(artifact.format, ArtifactState::Failed { reason: reason.clone() });
                    Ok(Step::notice_only(format!(
                        "⚠️ Le {} de {} {} n'a pas pu être généré. Réessayez depuis 📂 Mes documents.",
                        artifact.format.label(),
                        record.title(),
                        record.number
                    )))
                }
                CommandStage::Email => Ok(Step::notice_only(
                    "⚠️ L'email n'a pas pu être envoyé. Réessayez depuis 📂 Mes documents.",
                )),
                CommandStage::Extraction => {
                    if !extracting {
                        return Ok(Step::silent());
                    }
                    session.state = ConversationState::CreatingDocument(CreationStep::LineItems {
                        extracting: false,
                    });
                    Ok(Step::notice(problem_message(InputProblem::NoLineItems)))
                }
            },
        }
    }
}

fn start_draft(session: &mut Session, kind: DocumentKind) -> Step {
    session.draft = Some(DraftDocument::new(kind));
    let clients = recent_clients(session);
    let step = match clients.is_empty() {
        true => CreationStep::ClientName,
        false => CreationStep::RecentClient { clients },
    };
    session.state = ConversationState::CreatingDocument(step);
    Step::prompt()
}

/// Distinct named clients of earlier documents, most recent first.
fn recent_clients(session: &Session) -> Vec<ClientDetails> {
    let mut seen = HashSet::new();
    session
        .documents
        .iter()
        .rev()
        .filter(|document| {
            document.client.name.as_deref().is_some_and(|name| seen.insert(name.to_lowercase()))
        })
        .take(RECENT_CLIENT_LIMIT)
        .map(|document| document.client.clone())
        .collect()
}

fn lines_step(draft: &DraftDocument) -> CreationStep {
    match draft.lines.is_empty() {
        true => CreationStep::LineItems { extracting: false },
        false => CreationStep::LineItemsReview,
    }
}

fn check_bounds(state: &ConversationState, items: &[LineItem]) -> Result<(), ConversationError> {
    match items.iter().all(LineItem::within_bounds) {
        true => Ok(()),
        false => Err(user_input(state, InputProblem::AmountTooLarge)),
    }
}

fn issue_invoice(
    session: &mut Session,
    draft: &DraftDocument,
    quote: &DocumentRecord,
    kind: InvoiceKind,
    deductions: Vec<Deduction>,
    received_at: DateTime<Utc>,
) -> Step {
    let (id, sequence) = session.allocate_document();
    let issued_on = received_at.date_naive();
    let number = document_number(DocumentKind::Invoice, issued_on, sequence);
    let mut record = DocumentRecord::from_draft(id, number, draft, quote.vat_rate, issued_on);
    record.invoice_kind = Some(kind);
    record.source_quote = Some(quote.id.clone());
    record.deductions = deductions;
    record.artifacts.insert(DocumentFormat::Pdf, ArtifactState::Building);

    let commands = build_and_store(&record, DocumentFormat::Pdf);
    let notice = format!(
        "✅ {} {} créée : {} à régler. Génération du PDF en cours...",
        kind.label(),
        record.number,
        format_money(record.amount_due())
    );
    session.state = ConversationState::DocumentDetail {
        document: record.id.clone(),
        linked: Vec::new(),
        from_quote: Some(quote.id.clone()),
    };
    session.documents.push(record);
    Step::notice(notice).with_commands(commands)
}

fn share_artifact(
    session: &mut Session,
    state: &ConversationState,
    record: &DocumentRecord,
    format: DocumentFormat,
) -> Result<Step, ConversationError> {
    match record.artifacts.get(&format) {
        Some(ArtifactState::Ready { url }) => Ok(Step::notice(format!(
            "📄 {} {} ({}) : {url}",
            record.title(),
            record.number,
            format.label()
        ))),
        Some(ArtifactState::Building) => Err(user_input(state, InputProblem::DocumentBusy)),
        Some(ArtifactState::Failed { .. }) | None => {
            let stored = session.document_mut(&record.id).ok_or_else(|| unknown(&record.id))?;
            stored.artifacts.insert(format, ArtifactState::Building);
            let commands = build_and_store(stored, format);
            Ok(Step::notice(format!("⏳ Génération du {} en cours...", format.label()))
                .with_commands(commands))
        }
    }
}

fn delete_document(
    session: &mut Session,
    document: &DocumentId,
) -> Result<Step, ConversationError> {
    let record = session.document(document).cloned().ok_or_else(|| unknown(document))?;
    let cascade = record.is_quote();
    session.documents.retain(|candidate| {
        candidate.id != *document
            && !(cascade && candidate.source_quote.as_ref() == Some(document))
    });

    let parent = record.source_quote.clone().filter(|quote| session.document(quote).is_some());
    session.state = match parent {
        Some(quote) => detail_state(session, &quote, None)?,
        None => list_state(session),
    };
    Ok(Step::notice(format!("🗑️ {} {} supprimé.", record.title(), record.number)))
}

fn apply_field(
    draft: &mut DraftDocument,
    field: DraftField,
    text: &str,
    skip: bool,
) -> Result<(), InputProblem> {
    let optional = |text: &str| (!skip).then(|| text.to_owned());
    match field {
        DraftField::ClientName => draft.client.name = Some(text.to_owned()),
        DraftField::ClientPhone => {
            draft.client.phone = match skip {
                true => None,
                false => Some(normalize_phone(text).ok_or(InputProblem::InvalidPhone)?),
            };
        }
        DraftField::ClientEmail => {
            draft.client.email = match skip {
                true => None,
                false => Some(normalize_email(text).ok_or(InputProblem::InvalidEmail)?),
            };
        }
        DraftField::ClientAddress => draft.client.address = optional(text),
        DraftField::Project => draft.project = optional(text),
        DraftField::CompletionDelay => draft.completion_delay = optional(text),
        DraftField::LineItems => {
            let items = parse_line_items(text);
            if items.is_empty() {
                return Err(InputProblem::NoLineItems);
            }
            if !items.iter().all(LineItem::within_bounds) {
                return Err(InputProblem::AmountTooLarge);
            }
            draft.lines = items;
        }
        DraftField::Discount => {
            draft.discount_pct = match skip {
                true => Decimal::ZERO,
                false => parse_percentage(text).ok_or(InputProblem::InvalidPercentage)?,
            };
        }
        DraftField::Deposit => {
            draft.deposit_pct = match skip {
                true => None,
                false => Some(
                    parse_percentage(text)
                        .filter(|pct| !pct.is_zero())
                        .ok_or(InputProblem::InvalidPercentage)?,
                ),
            };
        }
    }
    Ok(())
}

/// Documents in creation order, each quote followed by its invoices, standalone invoices after.
pub(crate) fn list_entries(session: &Session) -> Vec<DocumentId> {
    let mut entries = Vec::new();
    for quote in session.documents.iter().filter(|document| document.is_quote()) {
        entries.push(quote.id.clone());
        entries.extend(session.linked_invoices(&quote.id));
    }
    entries.extend(
        session
            .documents
            .iter()
            .filter(|document| {
                !document.is_quote()
                    && document
                        .source_quote
                        .as_ref()
                        .map_or(true, |quote| session.document(quote).is_none())
            })
            .map(|document| document.id.clone()),
    );

    if entries.len() > MAX_LISTED_DOCUMENTS {
        entries.drain(..entries.len() - MAX_LISTED_DOCUMENTS);
    }
    entries
}

fn list_state(session: &Session) -> ConversationState {
    ConversationState::DocumentList { entries: list_entries(session) }
}

/// Quotes available as templates, most recent first.
fn duplicate_state(session: &Session) -> ConversationState {
    let quotes = session
        .documents
        .iter()
        .rev()
        .filter(|document| document.is_quote())
        .take(MAX_LISTED_DOCUMENTS)
        .map(|document| document.id.clone())
        .collect();
    ConversationState::DuplicateList { quotes }
}

/// Documents due a reminder on `as_of`: invoices first, then the longest outstanding.
pub(crate) fn overdue_entries(session: &Session, as_of: NaiveDate) -> Vec<DocumentId> {
    let mut overdue: Vec<&DocumentRecord> =
        session.documents.iter().filter(|document| document.reminder_due(as_of)).collect();
    overdue.sort_by_key(|document| (document.is_quote(), document.issued_on));
    overdue.into_iter().take(MAX_LISTED_DOCUMENTS).map(|document| document.id.clone()).collect()
}

fn reminder_state(session: &Session, as_of: NaiveDate) -> ConversationState {
    ConversationState::ReminderList { entries: overdue_entries(session, as_of), as_of }
}

fn detail_state(
    session: &Session,
    document: &DocumentId,
    from_quote: Option<DocumentId>,
) -> Result<ConversationState, ConversationError> {
    let record = session.document(document).ok_or_else(|| unknown(document))?;
    let linked = if record.is_quote() { session.linked_invoices(document) } else { Vec::new() };
    Ok(ConversationState::DocumentDetail { document: document.clone(), linked, from_quote })
}

fn source_quote_of(session: &Session, document: &DocumentId) -> Option<DocumentId> {
    session.document(document).and_then(|record| record.source_quote.clone())
}

/// Resolves a single-digit choice against the state's ordered options (1-based).
fn resolve<T: Clone>(
    state: &ConversationState,
    options: &[T],
    input: &Input<'_>,
) -> Result<Option<T>, ConversationError> {
    let Some(choice) = input.choice() else {
        return Ok(None);
    };
    choice
        .checked_sub(1)
        .and_then(|index| options.get(index))
        .cloned()
        .map(Some)
        .ok_or_else(|| user_input(state, InputProblem::OutOfRange))
}

fn free_text<'a>(
    state: &ConversationState,
    input: &Input<'a>,
) -> Result<&'a str, ConversationError> {
    if input.choice().is_some() {
        return Err(user_input(state, InputProblem::OutOfRange));
    }
    if input.raw.is_empty() {
        return Err(user_input(state, InputProblem::EmptyValue));
    }
    Ok(input.raw)
}

fn main_menu_alias(folded: &str) -> Option<MainMenuOption> {
    match folded {
        "devis" | "nouveau devis" => Some(MainMenuOption::NewQuote),
        "facture" | "nouvelle facture" => Some(MainMenuOption::NewInvoice),
        "documents" | "docs" | "mes documents" => Some(MainMenuOption::Documents),
        "dupliquer" | "copier" | "dupliquer un devis" => Some(MainMenuOption::DuplicateQuote),
        "relance" | "relances" | "relancer" => Some(MainMenuOption::Reminders),
        "aide" | "help" | "?" => Some(MainMenuOption::Help),
        _ => None,
    }
}

fn user_input(state: &ConversationState, problem: InputProblem) -> ConversationError {
    ConversationError::UserInput { state: state.name(), problem }
}

fn missing_draft() -> ConversationError {
    ConversationError::InternalInvariant("draft missing while creating a document".to_owned())
}

fn unknown(document: &DocumentId) -> ConversationError {
    ConversationError::InternalInvariant(format!("unknown document `{document}`"))
}
