//! Reply text for every conversation state. Replies use WhatsApp markdown (`*bold*`, `_italic_`).

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::conversation::engine::{ConversationError, EngineSettings, InputProblem};
use crate::conversation::states::{
    linked_label, recap_options, ConversationState, CreationStep, PendingAction, RecapOption,
    Session, EDIT_MENU_OPTIONS,
};
use crate::domain::document::{
    ArtifactState, DocumentFormat, DocumentId, DocumentKind, DocumentRecord, InvoiceKind,
};
use crate::domain::draft::{
    round_money, ClientDetails, DraftDocument, DraftField, LineItem, Totals, Unit,
};

pub const GENERIC_FAILURE: &str =
    "😕 Oups, quelque chose s'est mal passé. Retour au menu principal.";

const NAVIGATION: &str = "↩️ _retour_ · 🏠 _menu_";
const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━";

pub fn main_menu() -> String {
    [
        "👋 *Bienvenue sur Vocario !*",
        "",
        "*1.* 📝 Nouveau devis",
        "*2.* 🧾 Nouvelle facture",
        "*3.* 📂 Mes documents",
        "*4.* 📋 Dupliquer un devis",
        "*5.* 🔔 Relances",
        "*6.* ❓ Aide",
    ]
    .join("\n")
}

pub fn help() -> String {
    [
        "❓ *Aide*",
        "",
        "• Tapez *menu* à tout moment pour revenir à l'accueil",
        "• Tapez *retour* pour revenir à l'étape précédente",
        "• Une prestation par ligne : _peinture 40m2 x 25€_",
        "• Devis express : _Dupont 0612345678 carrelage 30m2 45€_",
        "• Tapez *relances* pour voir les factures et devis en attente de réponse",
    ]
    .join("\n")
}

/// Renders the menu or question matching the session's current state.
pub(crate) fn prompt(
    session: &Session,
    settings: &EngineSettings,
) -> Result<String, ConversationError> {
    let body = match &session.state {
        ConversationState::MainMenu => return Ok(main_menu()),
        ConversationState::CreatingDocument(step) => {
            let draft = session.draft.as_ref().ok_or_else(|| {
                ConversationError::InternalInvariant("draft missing while creating".to_owned())
            })?;
            creation_prompt(step, draft, settings)
        }
        ConversationState::DocumentList { entries } => document_list(session, entries)?,
        ConversationState::DocumentDetail { document, linked, .. } => {
            document_detail(session, document_for(session, document)?, linked)?
        }
        ConversationState::DepositRate { quote } => {
            let quote = document_for(session, quote)?;
            format!(
                "💰 *Facture d'acompte* · {}\nTotal devis : {}\n\n*1.* 30 %\n*2.* 40 %\n*3.* 50 %\n\n_Ou tapez un autre pourcentage, ex : 25%_",
                quote.number,
                format_money(quote.totals().total)
            )
        }
        ConversationState::EmailRecipient { document } => {
            let document = document_for(session, document)?;
            format!("📧 *Adresse email pour {} {} ?*", document.title(), document.number)
        }
        ConversationState::DuplicateList { quotes } => duplicate_list(session, quotes)?,
        ConversationState::DuplicateClient { quote } => {
            let quote = document_for(session, quote)?;
            let client = quote.client.display_name();
            format!(
                "📋 *Dupliquer : {}*\nClient d'origine : {client}\n\n*1.* 👤 Même client ({client})\n*2.* 🆕 Nouveau client",
                quote.number
            )
        }
        ConversationState::ReminderList { entries, as_of } => {
            reminder_list(session, entries, *as_of)?
        }
        ConversationState::ReminderAction { document, as_of } => {
            reminder_action(document_for(session, document)?, *as_of)
        }
        ConversationState::AwaitingConfirmation(action) => {
            return confirmation(session, action);
        }
    };

    Ok(format!("{body}\n\n{NAVIGATION}"))
}

pub(crate) fn soft_error(error: &ConversationError) -> String {
    match error {
        ConversationError::UserInput { problem, .. } => problem_message(*problem).to_owned(),
        ConversationError::DraftIncomplete { field: DraftField::LineItems } => {
            "⚠️ Il manque les prestations : ajoutez-en au moins une avant de valider.".to_owned()
        }
        ConversationError::DraftIncomplete { field } => {
            format!("⚠️ Il manque une information avant de valider : *{}*.", field.label())
        }
        ConversationError::InternalInvariant(_) => GENERIC_FAILURE.to_owned(),
    }
}

pub(crate) fn problem_message(problem: InputProblem) -> &'static str {
    match problem {
        InputProblem::OutOfRange => "🤔 Ce choix n'existe pas. Répondez avec un numéro du menu.",
        InputProblem::UnrecognizedText => "🤔 Je n'ai pas compris. Pouvez-vous reformuler ?",
        InputProblem::EmptyValue => "✏️ Merci de saisir une valeur.",
        InputProblem::InvalidPhone => "📞 Numéro invalide (10 chiffres minimum).",
        InputProblem::InvalidEmail => "📧 Email invalide, ex : client@exemple.fr",
        InputProblem::InvalidPercentage => "🔢 Pourcentage invalide, ex : 10%",
        InputProblem::NoLineItems => {
            "🔨 Je n'ai reconnu aucune prestation. Indiquez un prix, ex : _carrelage 30m2 x 45€_"
        }
        InputProblem::DocumentBusy => {
            "⏳ Le document est encore en cours de génération, réessayez dans un instant."
        }
        InputProblem::AlreadyPaid => "✅ Cette facture est déjà marquée comme payée.",
        InputProblem::AmountTooLarge => {
            "💸 Montant trop élevé : 100 000 unités et 10 000 000 € par prestation au maximum."
        }
        InputProblem::FinalInvoiceExists => "🧾 Ce devis a déjà une facture finale.",
        InputProblem::NoClientEmail => {
            "📧 Aucun email pour ce client. Ajoutez-le depuis 📂 Mes documents > Envoyer par email."
        }
    }
}

fn creation_prompt(
    step: &CreationStep,
    draft: &DraftDocument,
    settings: &EngineSettings,
) -> String {
    match step {
        CreationStep::RecentClient { clients } => recent_clients(draft.kind, clients),
        CreationStep::ClientName => {
            let heading = creation_heading(draft.kind);
            format!(
                "{heading}\n\n👤 *Nom du client ?*\n\n💡 Devis express : _Dupont 0612345678 carrelage 30m2 45€_"
            )
        }
        CreationStep::ClientPhone => {
            "📞 *Téléphone du client ?*\n_Tapez *non* pour passer_".to_owned()
        }
        CreationStep::LineItems { extracting: true } => {
            "🤖 Analyse de vos prestations en cours...".to_owned()
        }
        CreationStep::LineItems { extracting: false } => {
            "🔨 *Prestations ?*\nUne par ligne, par exemple :\n_carrelage 30m2 x 45€_\n_dépose forfait 350€_"
                .to_owned()
        }
        CreationStep::LineItemsReview => {
            let mut lines = vec!["🔨 *Prestations*".to_owned()];
            lines.extend(draft.lines.iter().map(line_item));
            let subtotal = draft.totals(settings.vat_rate).subtotal;
            lines.push(format!("\nSous-total HT : {}", format_money(subtotal)));
            lines.push(String::new());
            lines.push("*1.* ➕ Ajouter des prestations".to_owned());
            lines.push("*2.* ✅ Continuer".to_owned());
            lines.push("*3.* 🔄 Recommencer".to_owned());
            lines.join("\n")
        }
        CreationStep::Recap => recap(draft, settings),
        CreationStep::EditMenu => {
            let mut lines = vec!["✏️ *Que voulez-vous modifier ?*".to_owned(), String::new()];
            lines.extend(
                EDIT_MENU_OPTIONS
                    .iter()
                    .enumerate()
                    .map(|(index, field)| format!("*{}.* {}", index + 1, field.label())),
            );
            lines.join("\n")
        }
        CreationStep::EditField(field) => field_prompt(*field),
    }
}

fn creation_heading(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Quote => "📝 *Nouveau devis*",
        DocumentKind::Invoice => "🧾 *Nouvelle facture*",
    }
}

fn recent_clients(kind: DocumentKind, clients: &[ClientDetails]) -> String {
    let mut lines = vec![
        creation_heading(kind).to_owned(),
        String::new(),
        "👤 *Client récent ou nouveau ?*".to_owned(),
        String::new(),
    ];
    for (index, client) in clients.iter().enumerate() {
        let phone = client
            .phone
            .as_deref()
            .and_then(|phone| phone.get(phone.len().saturating_sub(4)..))
            .map(|tail| format!(" (…{tail})"))
            .unwrap_or_default();
        lines.push(format!("*{}.* {}{phone}", index + 1, client.display_name()));
    }
    lines.push(format!("*{}.* ➕ Nouveau client", clients.len() + 1));
    lines.push(String::new());
    lines.push("_Tapez le numéro ou directement le nom_".to_owned());
    lines.join("\n")
}

fn field_prompt(field: DraftField) -> String {
    let hint = match field {
        DraftField::ClientName => "",
        DraftField::ClientPhone
        | DraftField::ClientEmail
        | DraftField::ClientAddress
        | DraftField::Project
        | DraftField::CompletionDelay => "\n_Tapez *non* pour effacer_",
        DraftField::LineItems => "\n_Une par ligne, ex : carrelage 30m2 x 45€_",
        DraftField::Discount | DraftField::Deposit => "\n_Ex : 10%, ou *non* pour retirer_",
    };
    format!("✏️ *{} ?*{hint}", field.label())
}

fn recap(draft: &DraftDocument, settings: &EngineSettings) -> String {
    let totals = draft.totals(settings.vat_rate);
    let heading = format!("📋 *Récapitulatif {}*", draft.kind.label().to_lowercase());
    let mut lines = vec![heading, String::new()];

    if let Some(name) = &draft.client.name {
        lines.push(format!("👤 {name}"));
    }
    if let Some(phone) = &draft.client.phone {
        lines.push(format!("📞 {phone}"));
    }
    if let Some(email) = &draft.client.email {
        lines.push(format!("📧 {email}"));
    }
    if let Some(address) = &draft.client.address {
        lines.push(format!("📍 {address}"));
    }
    if let Some(project) = &draft.project {
        lines.push(format!("🏗️ {project}"));
    }
    if let Some(delay) = &draft.completion_delay {
        lines.push(format!("🗓️ Délai : {delay}"));
    }

    lines.push(String::new());
    lines.extend(draft.lines.iter().map(line_item));
    lines.push(String::new());
    lines.extend(totals_block(&totals, draft.discount_pct, draft.deposit_pct));
    lines.push(SEPARATOR.to_owned());

    for (index, option) in recap_options(draft).iter().enumerate() {
        let label = match option {
            RecapOption::Validate => "✅ Valider et générer".to_owned(),
            RecapOption::Edit => "✏️ Modifier".to_owned(),
            RecapOption::Fill(field) => format!("➕ {}", field.label()),
            RecapOption::Cancel => "🗑️ Abandonner".to_owned(),
        };
        lines.push(format!("*{}.* {label}", index + 1));
    }

    lines.join("\n")
}

fn totals_block(
    totals: &Totals,
    discount_pct: Decimal,
    deposit_pct: Option<Decimal>,
) -> Vec<String> {
    let mut lines = vec![format!("💶 Total HT : {}", format_money(totals.subtotal))];
    if !totals.discount.is_zero() {
        lines.push(format!(
            "🏷️ Remise ({}) : -{}",
            format_percent(discount_pct),
            format_money(totals.discount)
        ));
    }
    if totals.vat_rate.is_zero() {
        lines.push("📊 _TVA non applicable_".to_owned());
    } else {
        lines.push(format!(
            "📊 TVA ({}) : {}",
            format_percent(totals.vat_rate),
            format_money(totals.vat)
        ));
    }
    lines.push(format!("💰 *Total TTC : {}*", format_money(totals.total)));
    if let (Some(pct), Some(deposit)) = (deposit_pct, totals.deposit) {
        lines.push(format!("💳 Acompte ({}) : {}", format_percent(pct), format_money(deposit)));
    }
    lines
}

fn document_list(session: &Session, entries: &[DocumentId]) -> Result<String, ConversationError> {
    let mut lines = vec!["📂 *Mes documents*".to_owned(), String::new()];
    if entries.is_empty() {
        lines.push("_Aucun document pour le moment._".to_owned());
    }

    for (index, id) in entries.iter().enumerate() {
        let document = document_for(session, id)?;
        let indent = if document.source_quote.is_some() { "   " } else { "" };
        lines.push(format!(
            "{indent}*{}.* {} {} | {} | {} | {}",
            index + 1,
            document_icon(document),
            document.number,
            document.client.display_name(),
            format_money(document.totals().total),
            document.status.label()
        ));
    }

    Ok(lines.join("\n"))
}

fn duplicate_list(session: &Session, quotes: &[DocumentId]) -> Result<String, ConversationError> {
    let mut lines = vec![
        "📋 *Dupliquer un devis*".to_owned(),
        "Choisissez le devis à copier :".to_owned(),
        String::new(),
    ];
    for (index, id) in quotes.iter().enumerate() {
        let quote = document_for(session, id)?;
        let project = quote.project.as_deref().map(|project| format!(" | {project}"));
        lines.push(format!(
            "*{}.* {} | {} | {}{}",
            index + 1,
            quote.number,
            quote.client.display_name(),
            format_money(quote.totals().total),
            project.unwrap_or_default()
        ));
    }
    Ok(lines.join("\n"))
}

fn reminder_list(
    session: &Session,
    entries: &[DocumentId],
    as_of: NaiveDate,
) -> Result<String, ConversationError> {
    let mut lines = vec!["🔔 *Relances clients*".to_owned(), String::new()];
    if entries.is_empty() {
        lines.push("_Rien à relancer, tous vos documents sont à jour._".to_owned());
    }
    for (index, id) in entries.iter().enumerate() {
        let document = document_for(session, id)?;
        lines.push(format!(
            "*{}.* {} {} {} | {} | {} | {} j",
            index + 1,
            urgency_icon(document, as_of),
            document.title(),
            document.number,
            document.client.display_name(),
            format_money(document.amount_due()),
            document.days_since_issue(as_of)
        ));
    }
    Ok(lines.join("\n"))
}

fn reminder_action(document: &DocumentRecord, as_of: NaiveDate) -> String {
    format!(
        "{} *{} {}*\nClient : {}\nMontant : {}\nEn retard : {} jours\n\nComment relancer ?\n\n*1.* 📱 Message WhatsApp à transférer\n*2.* 📧 Envoyer par email",
        urgency_icon(document, as_of),
        document.title(),
        document.number,
        document.client.display_name(),
        format_money(document.amount_due()),
        document.days_since_issue(as_of)
    )
}

fn urgency_icon(document: &DocumentRecord, as_of: NaiveDate) -> &'static str {
    match document.reminder_urgent(as_of) {
        true => "🔴",
        false => "🟡",
    }
}

fn document_detail(
    session: &Session,
    document: &DocumentRecord,
    linked: &[DocumentId],
) -> Result<String, ConversationError> {
    let totals = document.totals();
    let mut lines = vec![format!(
        "{} *{} {}*",
        document_icon(document),
        document.title().to_uppercase(),
        document.number
    )];
    lines.push(format!("👤 {}", document.client.display_name()));
    if let Some(project) = &document.project {
        lines.push(format!("🏗️ {project}"));
    }
    if let Some(phone) = &document.client.phone {
        lines.push(format!("📞 {phone}"));
    }
    if let Some(email) = &document.client.email {
        lines.push(format!("📧 {email}"));
    }
    lines.push(format!("💰 {} TTC", format_money(totals.total)));
    for deduction in &document.deductions {
        lines.push(format!("➖ {} : -{}", deduction.label, format_money(deduction.amount)));
    }
    if !document.deductions.is_empty() {
        lines.push(format!("💳 *Reste à payer : {}*", format_money(document.amount_due())));
    }
    lines.push(format!("📊 {}", document.status.label()));
    lines.push(artifact_line(document, DocumentFormat::Pdf));
    if document.artifacts.contains_key(&DocumentFormat::Word) {
        lines.push(artifact_line(document, DocumentFormat::Word));
    }
    if let Some(source) = &document.source_quote {
        if let Some(quote) = session.document(source) {
            lines.push(format!("📎 Devis : {}", quote.number));
        }
    }

    if !linked.is_empty() {
        lines.push(String::new());
        lines.push("📎 *Factures liées :*".to_owned());
        for (index, id) in linked.iter().enumerate() {
            let invoice = document_for(session, id)?;
            lines.push(format!(
                "  *{}.* {} {} {} · {} · {}",
                linked_label(index),
                document_icon(invoice),
                invoice.title(),
                invoice.number,
                format_money(invoice.totals().total),
                invoice.status.label()
            ));
        }
    }

    lines.push(String::new());
    lines.push(SEPARATOR.to_owned());
    if document.is_quote() {
        lines.push("*1.* 📄 Obtenir le PDF".to_owned());
        lines.push("*2.* 📧 Envoyer par email".to_owned());
        lines.push("*3.* 💰 Créer une facture d'acompte".to_owned());
        lines.push("*4.* 🧾 Créer la facture finale".to_owned());
        lines.push("*5.* 📝 Version Word".to_owned());
        lines.push("*6.* 🗑️ Supprimer".to_owned());
        if !linked.is_empty() {
            let last = linked_label(linked.len() - 1);
            lines.push(format!("_Tapez A à {last} pour ouvrir une facture liée_"));
        }
    } else {
        lines.push("*1.* 📄 Obtenir le PDF".to_owned());
        lines.push("*2.* 📧 Envoyer par email".to_owned());
        lines.push("*3.* ✅ Marquer comme payée".to_owned());
        lines.push("*4.* 🗑️ Supprimer".to_owned());
    }

    Ok(lines.join("\n"))
}

fn confirmation(session: &Session, action: &PendingAction) -> Result<String, ConversationError> {
    let question = match action {
        PendingAction::CancelDraft => "❓ *Abandonner ce brouillon ?*".to_owned(),
        PendingAction::DeleteDocument(id) => {
            let document = document_for(session, id)?;
            let cascade = if document.is_quote() && !session.linked_invoices(id).is_empty() {
                "\n\n⚠️ Les factures liées seront aussi supprimées."
            } else {
                ""
            };
            format!(
                "🗑️ *Confirmer la suppression ?*\n\n{} {} - {}{cascade}",
                document.title(),
                document.number,
                document.client.display_name()
            )
        }
        PendingAction::IssueFinalInvoice(id) => {
            let quote = document_for(session, id)?;
            let paid_deposits = session
                .paid_deposits(id)
                .iter()
                .map(|invoice| invoice.totals().total)
                .fold(Decimal::ZERO, Decimal::saturating_add);
            let total = quote.totals().total;
            format!(
                "🧾 *Créer la facture finale ?*\n\nDevis {} · {}\nAcomptes payés : -{}\nReste à payer : {}",
                quote.number,
                format_money(total),
                format_money(paid_deposits),
                format_money(total.saturating_sub(paid_deposits))
            )
        }
    };

    Ok(format!("{question}\n\n*1.* ✅ Oui\n*2.* ❌ Non"))
}

fn artifact_line(document: &DocumentRecord, format: DocumentFormat) -> String {
    let label = format.label();
    match document.artifacts.get(&format) {
        Some(ArtifactState::Ready { url }) => format!("📄 {label} : {url}"),
        Some(ArtifactState::Building) => format!("📄 {label} : ⏳ en cours de génération"),
        Some(ArtifactState::Failed { .. }) => format!("📄 {label} : ⚠️ échec de génération"),
        None => format!("📄 {label} : non généré"),
    }
}

fn document_for<'a>(
    session: &'a Session,
    id: &DocumentId,
) -> Result<&'a DocumentRecord, ConversationError> {
    session
        .document(id)
        .ok_or_else(|| ConversationError::InternalInvariant(format!("unknown document `{id}`")))
}

fn document_icon(document: &DocumentRecord) -> &'static str {
    match document.invoice_kind {
        None => "📋",
        Some(InvoiceKind::Deposit) => "💰",
        Some(InvoiceKind::Standard | InvoiceKind::Final) => "🧾",
    }
}

fn line_item(item: &LineItem) -> String {
    if item.unit == Unit::Flat && item.quantity == Decimal::ONE {
        return format!("• {} : {}", item.description, format_money(item.amount()));
    }
    format!(
        "• {} : {} {} × {} = {}",
        item.description,
        format_number(item.quantity),
        item.unit.label(),
        format_money(item.unit_price),
        format_money(item.amount())
    )
}

/// French money formatting: `1 234,50 €`.
pub fn format_money(amount: Decimal) -> String {
    let rounded = round_money(amount);
    let raw = format!("{:.2}", rounded.abs());
    let (whole, cents) = raw.split_once('.').unwrap_or((raw.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(digit);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() { "-" } else { "" };
    format!("{sign}{grouped},{cents} €")
}

pub fn format_percent(value: Decimal) -> String {
    format!("{} %", format_number(value))
}

fn format_number(value: Decimal) -> String {
    value.normalize().to_string().replace('.', ",")
}
