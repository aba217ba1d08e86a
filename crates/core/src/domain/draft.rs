use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::domain::document::DocumentKind;

pub const DEFAULT_VAT_RATE: Decimal = Decimal::from_parts(20, 0, 0, false, 0);

/// Largest quantity accepted on a single line item.
pub const MAX_QUANTITY: Decimal = Decimal::from_parts(100_000, 0, 0, false, 0);
/// Largest unit price (EUR) accepted on a single line item.
pub const MAX_UNIT_PRICE: Decimal = Decimal::from_parts(10_000_000, 0, 0, false, 0);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    SquareMetre,
    LinearMetre,
    Metre,
    Hour,
    Piece,
    Day,
    Kilogram,
    Litre,
    Flat,
}

impl Unit {
    /// Recognizes the unit spellings artisans type in messages (`m2`, `m²`, `ml`, `jours`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "m2" | "m²" => Some(Self::SquareMetre),
            "ml" => Some(Self::LinearMetre),
            "m" => Some(Self::Metre),
            "h" | "heure" | "heures" => Some(Self::Hour),
            "u" | "unité" | "unités" | "unite" | "unites" | "pièce" | "pièces" | "piece"
            | "pieces" => Some(Self::Piece),
            "j" | "jour" | "jours" => Some(Self::Day),
            "kg" => Some(Self::Kilogram),
            "l" => Some(Self::Litre),
            "forfait" => Some(Self::Flat),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::SquareMetre => "m²",
            Self::LinearMetre => "ml",
            Self::Metre => "m",
            Self::Hour => "h",
            Self::Piece => "u",
            Self::Day => "j",
            Self::Kilogram => "kg",
            Self::Litre => "l",
            Self::Flat => "forfait",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Decimal,
    pub unit: Unit,
    pub unit_price: Decimal,
}

impl LineItem {
    pub fn flat(description: impl Into<String>, price: Decimal) -> Self {
        Self {
            description: description.into(),
            quantity: Decimal::ONE,
            unit: Unit::Flat,
            unit_price: price,
        }
    }

    /// Saturates instead of overflowing; values outside [`LineItem::within_bounds`] never
    /// reach a document through the conversation.
    pub fn amount(&self) -> Decimal {
        round_money(self.quantity.saturating_mul(self.unit_price))
    }

    pub fn within_bounds(&self) -> bool {
        !self.quantity.is_sign_negative()
            && !self.unit_price.is_sign_negative()
            && self.quantity <= MAX_QUANTITY
            && self.unit_price <= MAX_UNIT_PRICE
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetails {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

impl ClientDetails {
    pub fn has_any(&self) -> bool {
        [&self.name, &self.phone, &self.email, &self.address].iter().any(|field| field.is_some())
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Client")
    }
}

/// Fields the user can fill or edit while a draft is open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftField {
    ClientName,
    ClientPhone,
    ClientEmail,
    ClientAddress,
    Project,
    LineItems,
    Discount,
    Deposit,
    CompletionDelay,
}

impl DraftField {
    pub fn label(self) -> &'static str {
        match self {
            Self::ClientName => "Nom du client",
            Self::ClientPhone => "Téléphone",
            Self::ClientEmail => "Email",
            Self::ClientAddress => "Adresse",
            Self::Project => "Titre du projet",
            Self::LineItems => "Prestations",
            Self::Discount => "Remise",
            Self::Deposit => "Acompte",
            Self::CompletionDelay => "Délai de réalisation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftDocument {
    pub kind: DocumentKind,
    pub client: ClientDetails,
    pub project: Option<String>,
    pub lines: Vec<LineItem>,
    pub discount_pct: Decimal,
    pub deposit_pct: Option<Decimal>,
    pub completion_delay: Option<String>,
}

impl DraftDocument {
    pub fn new(kind: DocumentKind) -> Self {
        Self {
            kind,
            client: ClientDetails::default(),
            project: None,
            lines: Vec::new(),
            discount_pct: Decimal::ZERO,
            deposit_pct: None,
            completion_delay: None,
        }
    }

    pub fn totals(&self, vat_rate: Decimal) -> Totals {
        Totals::compute(&self.lines, self.discount_pct, vat_rate, self.deposit_pct)
    }

    pub fn is_empty(&self, field: DraftField) -> bool {
        match field {
            DraftField::ClientName => self.client.name.is_none(),
            DraftField::ClientPhone => self.client.phone.is_none(),
            DraftField::ClientEmail => self.client.email.is_none(),
            DraftField::ClientAddress => self.client.address.is_none(),
            DraftField::Project => self.project.is_none(),
            DraftField::LineItems => self.lines.is_empty(),
            DraftField::Discount => self.discount_pct.is_zero(),
            DraftField::Deposit => self.deposit_pct.is_none(),
            DraftField::CompletionDelay => self.completion_delay.is_none(),
        }
    }

    /// First field preventing finalization, if any.
    pub fn missing_for_finalize(&self) -> Option<DraftField> {
        if !self.client.has_any() {
            return Some(DraftField::ClientName);
        }
        if self.lines.is_empty() {
            return Some(DraftField::LineItems);
        }
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub net: Decimal,
    pub vat_rate: Decimal,
    pub vat: Decimal,
    pub total: Decimal,
    pub deposit: Option<Decimal>,
}

impl Totals {
    pub fn compute(
        lines: &[LineItem],
        discount_pct: Decimal,
        vat_rate: Decimal,
        deposit_pct: Option<Decimal>,
    ) -> Self {
        let subtotal =
            lines.iter().map(LineItem::amount).fold(Decimal::ZERO, Decimal::saturating_add);
        let discount = percent_of(subtotal, discount_pct);
        let net = subtotal.saturating_sub(discount);
        let vat = percent_of(net, vat_rate);
        let total = net.saturating_add(vat);
        let deposit = deposit_pct.map(|pct| percent_of(total, pct));

        Self { subtotal, discount, net, vat_rate, vat, total, deposit }
    }
}

/// `pct` percent of `amount`, rounded to cents.
pub fn percent_of(amount: Decimal, pct: Decimal) -> Decimal {
    round_money(amount.saturating_mul(pct) / Decimal::ONE_HUNDRED)
}

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use crate::domain::document::DocumentKind;

    use super::{
        DraftDocument, DraftField, LineItem, Totals, Unit, DEFAULT_VAT_RATE, MAX_QUANTITY,
        MAX_UNIT_PRICE,
    };

    fn tiling() -> LineItem {
        LineItem {
            description: "Carrelage".to_owned(),
            quantity: Decimal::new(30, 0),
            unit: Unit::SquareMetre,
            unit_price: Decimal::new(45, 0),
        }
    }

    #[test]
    fn totals_apply_discount_before_vat() {
        let totals = Totals::compute(
            &[tiling(), LineItem::flat("Dépose", Decimal::new(150, 0))],
            Decimal::new(10, 0),
            DEFAULT_VAT_RATE,
            Some(Decimal::new(30, 0)),
        );

        assert_eq!(totals.subtotal, Decimal::new(1_500, 0));
        assert_eq!(totals.discount, Decimal::new(150, 0));
        assert_eq!(totals.net, Decimal::new(1_350, 0));
        assert_eq!(totals.vat, Decimal::new(270, 0));
        assert_eq!(totals.total, Decimal::new(1_620, 0));
        assert_eq!(totals.deposit, Some(Decimal::new(486, 0)));
    }

    #[test]
    fn totals_are_recomputed_from_lines() {
        let mut draft = DraftDocument::new(DocumentKind::Quote);
        draft.lines.push(tiling());
        let before = draft.totals(DEFAULT_VAT_RATE);

        draft.lines[0].quantity = Decimal::new(10, 0);
        let after = draft.totals(DEFAULT_VAT_RATE);

        assert_eq!(before.subtotal, Decimal::new(1_350, 0));
        assert_eq!(after.subtotal, Decimal::new(450, 0));
    }

    #[test]
    fn fractional_amounts_round_to_cents() {
        let line = LineItem {
            description: "Plinthes".to_owned(),
            quantity: Decimal::new(125, 1),
            unit: Unit::LinearMetre,
            unit_price: Decimal::new(333, 2),
        };

        assert_eq!(line.amount(), Decimal::new(4_163, 2));
    }

    #[test]
    fn line_bounds_cap_quantity_and_price() {
        let mut line = tiling();
        assert!(line.within_bounds());

        line.quantity = MAX_QUANTITY;
        line.unit_price = MAX_UNIT_PRICE;
        assert!(line.within_bounds());

        line.quantity += Decimal::ONE;
        assert!(!line.within_bounds());

        line.quantity = Decimal::new(-1, 0);
        assert!(!line.within_bounds());
    }

    #[test]
    fn huge_stored_lines_saturate_instead_of_panicking() {
        let huge = LineItem {
            description: "Carrelage".to_owned(),
            quantity: Decimal::MAX,
            unit: Unit::SquareMetre,
            unit_price: Decimal::MAX,
        };

        assert_eq!(huge.amount(), Decimal::MAX);
        let totals = Totals::compute(
            &[huge.clone(), huge],
            Decimal::new(10, 0),
            DEFAULT_VAT_RATE,
            Some(Decimal::new(30, 0)),
        );
        assert_eq!(totals.subtotal, Decimal::MAX);
        assert!(totals.total > Decimal::ZERO);
    }

    #[test]
    fn finalize_requires_client_then_lines() {
        let mut draft = DraftDocument::new(DocumentKind::Quote);
        assert_eq!(draft.missing_for_finalize(), Some(DraftField::ClientName));

        draft.client.phone = Some("+33612345678".to_owned());
        assert_eq!(draft.missing_for_finalize(), Some(DraftField::LineItems));

        draft.lines.push(tiling());
        assert_eq!(draft.missing_for_finalize(), None);
    }

    #[test]
    fn unit_spellings_are_recognized() {
        assert_eq!(Unit::parse("m²"), Some(Unit::SquareMetre));
        assert_eq!(Unit::parse("M2"), Some(Unit::SquareMetre));
        assert_eq!(Unit::parse("jours"), Some(Unit::Day));
        assert_eq!(Unit::parse("couches"), None);
    }
}
