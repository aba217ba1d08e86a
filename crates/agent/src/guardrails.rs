use std::collections::HashSet;

use rust_decimal::Decimal;
use vocario_core::LineItem;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, detail: String },
}

/// Limits on what the model may hand back. The model transcribes amounts; it never decides them,
/// so every price it returns must be readable in the user's own text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub max_items: usize,
    pub max_unit_price: Decimal,
    pub prices_must_appear_in_text: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self {
            max_items: 30,
            max_unit_price: Decimal::new(1_000_000, 0),
            prices_must_appear_in_text: true,
        }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(&self, source_text: &str, items: &[LineItem]) -> GuardrailDecision {
        if items.len() > self.max_items {
            return GuardrailDecision::Deny {
                reason_code: "too_many_items",
                detail: format!("{} items exceeds the limit of {}", items.len(), self.max_items),
            };
        }

        let mentioned = self.prices_must_appear_in_text.then(|| numbers_in(source_text));
        for item in items {
            if item.description.trim().is_empty() {
                return GuardrailDecision::Deny {
                    reason_code: "empty_description",
                    detail: "an item has no description".to_owned(),
                };
            }
            if item.quantity <= Decimal::ZERO {
                return GuardrailDecision::Deny {
                    reason_code: "non_positive_quantity",
                    detail: format!("`{}` has quantity {}", item.description, item.quantity),
                };
            }
            if item.unit_price < Decimal::ZERO || item.unit_price > self.max_unit_price {
                return GuardrailDecision::Deny {
                    reason_code: "price_out_of_bounds",
                    detail: format!("`{}` has unit price {}", item.description, item.unit_price),
                };
            }
            if let Some(mentioned) = &mentioned {
                let unit_price = item.unit_price.normalize();
                let amount = item.amount().normalize();
                if !mentioned.contains(&unit_price) && !mentioned.contains(&amount) {
                    return GuardrailDecision::Deny {
                        reason_code: "invented_price",
                        detail: format!(
                            "`{}` price {} does not appear in the message",
                            item.description, item.unit_price
                        ),
                    };
                }
            }
        }

        GuardrailDecision::Allow
    }
}

/// Every number written in `text`, reading `,` as a decimal separator and accepting spaces as
/// thousands separators (`1 200,50`).
fn numbers_in(text: &str) -> HashSet<Decimal> {
    let mut numbers = HashSet::new();
    for candidate in [text.to_owned(), join_thousands(text)] {
        let mut current = String::new();
        for ch in candidate.chars().chain(std::iter::once(' ')) {
            if ch.is_ascii_digit() || (matches!(ch, ',' | '.') && !current.is_empty()) {
                current.push(if ch == ',' { '.' } else { ch });
                continue;
            }
            if let Ok(value) = current.trim_end_matches('.').parse::<Decimal>() {
                numbers.insert(value.normalize());
            }
            current.clear();
        }
    }
    numbers
}

fn join_thousands(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut joined = String::with_capacity(text.len());
    for (index, ch) in chars.iter().enumerate() {
        let is_separator = matches!(ch, ' ' | '\u{a0}' | '\u{202f}');
        let digit_before = index > 0 && chars[index - 1].is_ascii_digit();
        let group_after = chars
            .get(index + 1..index + 4)
            .is_some_and(|group| group.iter().all(char::is_ascii_digit))
            && !chars.get(index + 4).is_some_and(char::is_ascii_digit);
        if is_separator && digit_before && group_after {
            continue;
        }
        joined.push(*ch);
    }
    joined
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use vocario_core::{LineItem, Unit};

    use super::{numbers_in, GuardrailDecision, GuardrailPolicy};

    fn item(description: &str, quantity: i64, unit_price: i64) -> LineItem {
        LineItem {
            description: description.to_owned(),
            quantity: Decimal::new(quantity, 0),
            unit: Unit::SquareMetre,
            unit_price: Decimal::new(unit_price, 0),
        }
    }

    #[test]
    fn numbers_are_read_with_french_separators() {
        let numbers = numbers_in("carrelage 12,5 m2 à 45€ et pose 1 200 €");

        assert!(numbers.contains(&Decimal::new(125, 1)));
        assert!(numbers.contains(&Decimal::new(45, 0)));
        assert!(numbers.contains(&Decimal::new(1200, 0)));
    }

    #[test]
    fn prices_found_in_the_message_are_allowed() {
        let policy = GuardrailPolicy::default();
        let text = "peinture salon 20 m2 à 25 euros, et le plafond pour 300";
        let items = vec![item("Peinture salon", 20, 25), item("Plafond", 1, 300)];

        assert_eq!(policy.evaluate(text, &items), GuardrailDecision::Allow);
    }

    #[test]
    fn a_total_written_by_the_user_also_counts() {
        let policy = GuardrailPolicy::default();
        let items = vec![item("Parquet", 10, 50)];

        assert_eq!(policy.evaluate("parquet 10 m2 pour 500", &items), GuardrailDecision::Allow);
    }

    #[test]
    fn invented_prices_are_denied() {
        let policy = GuardrailPolicy::default();
        let decision = policy.evaluate("refaire la cuisine", &[item("Cuisine", 1, 4500)]);

        assert!(matches!(
            decision,
            GuardrailDecision::Deny { reason_code: "invented_price", .. }
        ));
    }

    #[test]
    fn malformed_items_are_denied() {
        let policy = GuardrailPolicy::default();

        assert!(matches!(
            policy.evaluate("0 m2 à 10", &[item("Sol", 0, 10)]),
            GuardrailDecision::Deny { reason_code: "non_positive_quantity", .. }
        ));
        assert!(matches!(
            policy.evaluate("10", &[item("  ", 1, 10)]),
            GuardrailDecision::Deny { reason_code: "empty_description", .. }
        ));
        let many = vec![item("Pose", 1, 10); 31];
        assert!(matches!(
            policy.evaluate("pose 10", &many),
            GuardrailDecision::Deny { reason_code: "too_many_items", .. }
        ));
    }
}
