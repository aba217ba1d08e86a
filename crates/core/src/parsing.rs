//! Free-text intake: line items, express quotes and percentages as artisans type them.
//!
//! Three line shapes are recognized, tried in order:
//! `carrelage 30 m2 x 45€`, `peinture forfait 800€` and `800€ peinture`.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::domain::contact::normalize_phone;
use crate::domain::draft::{LineItem, Unit};

const CURRENCY_MARKERS: [&str; 4] = ["€", "euro", "euros", "eur"];
const PRICE_SEPARATORS: [&str; 6] = ["x", "à", "a", "@", "*", "pour"];
const PRICE_SUFFIXES: [&str; 2] = ["ht", "ttc"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpressEntry {
    pub client_name: String,
    pub phone: String,
    pub lines: Vec<LineItem>,
}

/// Splits a message into segments and parses every segment that matches a known shape.
pub fn parse_line_items(text: &str) -> Vec<LineItem> {
    split_segments(text).filter_map(parse_segment).collect()
}

/// `Dupont 0612345678 carrelage 30m2 45€`: a name, a phone number, then line items.
pub fn parse_express(text: &str) -> Option<ExpressEntry> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let phone_at = tokens.iter().position(|token| looks_like_phone(token))?;
    if phone_at == 0 {
        return None;
    }

    let phone = normalize_phone(tokens[phone_at])?;
    let rest = tokens[phone_at + 1..].join(" ");
    let lines = parse_line_items(&rest);
    if lines.is_empty() {
        return None;
    }

    Some(ExpressEntry { client_name: tokens[..phone_at].join(" "), phone, lines })
}

/// Accepts `10`, `10%`, `12,5 %`; the value must fall in `0..=100`.
pub fn parse_percentage(text: &str) -> Option<Decimal> {
    let trimmed = text.trim().trim_end_matches('%').trim();
    let value = parse_number(trimmed)?;
    (value <= Decimal::ONE_HUNDRED).then_some(value)
}

fn split_segments(text: &str) -> impl Iterator<Item = &str> {
    text.split(['\n', ';'])
        .flat_map(|line| line.split(" + "))
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
}

fn parse_segment(segment: &str) -> Option<LineItem> {
    let spaced = segment.replace('€', " € ").replace('×', " x ");
    let tokens: Vec<&str> = spaced.split_whitespace().collect();

    parse_quantified(&tokens).or_else(|| parse_flat(&tokens)).or_else(|| parse_price_first(&tokens))
}

fn parse_quantified(tokens: &[&str]) -> Option<LineItem> {
    for start in 1..tokens.len() {
        let Some((quantity, unit, mut next)) = read_quantity(tokens, start) else {
            continue;
        };
        if unit == Unit::Flat {
            continue;
        }

        if tokens.get(next).is_some_and(|token| is_one_of(token, &PRICE_SEPARATORS)) {
            next += 1;
        }
        let Some(unit_price) = tokens.get(next).and_then(|token| parse_number(token)) else {
            continue;
        };
        let trailing_ok = tokens[next + 1..].iter().all(|token| is_price_suffix(token));
        if !trailing_ok {
            continue;
        }

        return Some(LineItem {
            description: tokens[..start].join(" "),
            quantity,
            unit,
            unit_price,
        });
    }
    None
}

fn parse_flat(tokens: &[&str]) -> Option<LineItem> {
    let mut end = tokens.len();
    let mut has_currency = false;
    while end > 0 && is_price_suffix(tokens[end - 1]) {
        has_currency |= is_one_of(tokens[end - 1], &CURRENCY_MARKERS);
        end -= 1;
    }
    if !has_currency || end < 2 {
        return None;
    }

    let price = parse_number(tokens[end - 1])?;
    let description: Vec<&str> = tokens[..end - 1]
        .iter()
        .copied()
        .filter(|token| !token.eq_ignore_ascii_case("forfait"))
        .collect();
    if description.is_empty() {
        return None;
    }

    Some(LineItem::flat(description.join(" "), price))
}

fn parse_price_first(tokens: &[&str]) -> Option<LineItem> {
    let price = parse_number(tokens.first()?)?;
    if !tokens.get(1).is_some_and(|token| is_one_of(token, &CURRENCY_MARKERS)) {
        return None;
    }

    let description = tokens.get(2..)?.join(" ");
    if description.is_empty() {
        return None;
    }
    Some(LineItem::flat(description, price))
}

/// Reads `30m2` or `30 m2` at `index`, returning the quantity, unit and next token index.
fn read_quantity(tokens: &[&str], index: usize) -> Option<(Decimal, Unit, usize)> {
    let token = tokens.get(index)?;
    let split_at = token
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.' || *ch == ','))
        .map(|(position, _)| position);

    match split_at {
        Some(0) => None,
        Some(position) => {
            let quantity = parse_number(&token[..position])?;
            let unit = Unit::parse(&token[position..])?;
            Some((quantity, unit, index + 1))
        }
        None => {
            let quantity = parse_number(token)?;
            let unit = Unit::parse(tokens.get(index + 1)?)?;
            Some((quantity, unit, index + 2))
        }
    }
}

fn parse_number(raw: &str) -> Option<Decimal> {
    let normalized = raw.trim().replace(',', ".");
    if normalized.is_empty() || !normalized.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
        return None;
    }
    let value = Decimal::from_str(&normalized).ok()?;
    (!value.is_sign_negative()).then_some(value)
}

fn looks_like_phone(token: &str) -> bool {
    token.chars().all(|ch| ch.is_ascii_digit() || matches!(ch, '+' | '.' | '-'))
        && normalize_phone(token).is_some()
}

fn is_price_suffix(token: &str) -> bool {
    is_one_of(token, &CURRENCY_MARKERS)
        || is_one_of(token, &PRICE_SUFFIXES)
        || (token.starts_with('/') && token.len() > 1)
}

fn is_one_of(token: &str, candidates: &[&str]) -> bool {
    let lowered = token.to_lowercase();
    candidates.iter().any(|candidate| *candidate == lowered)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use crate::domain::draft::Unit;

    use super::{parse_express, parse_line_items, parse_percentage};

    #[test]
    fn quantified_line_with_separator() {
        let items = parse_line_items("Carrelage sol 30 m2 x 45€");

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "Carrelage sol");
        assert_eq!(items[0].quantity, Decimal::new(30, 0));
        assert_eq!(items[0].unit, Unit::SquareMetre);
        assert_eq!(items[0].unit_price, Decimal::new(45, 0));
    }

    #[test]
    fn glued_quantity_and_decimal_comma() {
        let items = parse_line_items("plinthes 12,5ml à 8,90 € /ml");

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, Decimal::new(125, 1));
        assert_eq!(items[0].unit, Unit::LinearMetre);
        assert_eq!(items[0].unit_price, Decimal::new(890, 2));
    }

    #[test]
    fn numbers_inside_description_are_kept() {
        let items = parse_line_items("peinture 2 couches 40m2 à 25€");

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description, "peinture 2 couches");
        assert_eq!(items[0].quantity, Decimal::new(40, 0));
    }

    #[test]
    fn flat_and_price_first_shapes() {
        let items =
            parse_line_items("Dépose ancienne cuisine forfait 350€\n120 € nettoyage chantier");

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].description, "Dépose ancienne cuisine");
        assert_eq!(items[0].unit, Unit::Flat);
        assert_eq!(items[0].unit_price, Decimal::new(350, 0));
        assert_eq!(items[1].description, "nettoyage chantier");
        assert_eq!(items[1].unit_price, Decimal::new(120, 0));
    }

    #[test]
    fn segments_split_on_plus_and_semicolon() {
        let items = parse_line_items("pose 3h x 45€ + fournitures 80€; évacuation 60 euros");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].unit, Unit::Hour);
    }

    #[test]
    fn unpriced_text_yields_nothing() {
        assert!(parse_line_items("refaire la salle de bain").is_empty());
        assert!(parse_line_items("800").is_empty());
    }

    #[test]
    fn express_entry_splits_name_phone_and_items() {
        let entry = parse_express("Martin Dupont 06.12.34.56.78 carrelage 30m2 45€ + joints 90€")
            .expect("express entry");

        assert_eq!(entry.client_name, "Martin Dupont");
        assert_eq!(entry.phone, "0612345678");
        assert_eq!(entry.lines.len(), 2);
    }

    #[test]
    fn express_entry_needs_name_and_items() {
        assert!(parse_express("0612345678 carrelage 30m2 45€").is_none());
        assert!(parse_express("Dupont 0612345678").is_none());
        assert!(parse_express("Dupont carrelage 30m2 45€").is_none());
    }

    #[test]
    fn percentages_accept_sign_and_comma() {
        assert_eq!(parse_percentage("10"), Some(Decimal::new(10, 0)));
        assert_eq!(parse_percentage("12,5 %"), Some(Decimal::new(125, 1)));
        assert_eq!(parse_percentage("150%"), None);
        assert_eq!(parse_percentage("beaucoup"), None);
    }
}
