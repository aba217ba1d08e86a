//! Normalization of the contact details typed into a conversation.

const MIN_PHONE_LEN: usize = 10;
const MASKED_HEAD_MIN_LEN: usize = 10;

/// Keeps digits and `+`, and accepts the result once it is long enough to be a real number.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let cleaned: String = raw.chars().filter(|ch| ch.is_ascii_digit() || *ch == '+').collect();
    (cleaned.len() >= MIN_PHONE_LEN).then_some(cleaned)
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let candidate = raw.trim().to_lowercase();
    if candidate.chars().any(char::is_whitespace) {
        return None;
    }

    let (local, domain) = candidate.split_once('@')?;
    let valid = !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@');
    valid.then_some(candidate)
}

/// Hides the middle of a phone number so identifiers can be logged.
///
/// At least half of the characters are always masked; short values only keep their last two.
pub fn mask_phone(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }

    let head_len = if chars.len() < MASKED_HEAD_MIN_LEN { 0 } else { 3 };
    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - head_len - 2))
}

#[cfg(test)]
mod tests {
    use super::{mask_phone, normalize_email, normalize_phone};

    #[test]
    fn phone_keeps_digits_and_plus() {
        assert_eq!(normalize_phone("06 12 34 56 78"), Some("0612345678".to_owned()));
        assert_eq!(normalize_phone("+33 6.12.34.56.78"), Some("+33612345678".to_owned()));
        assert_eq!(normalize_phone("06 12"), None);
    }

    #[test]
    fn email_needs_at_and_dotted_domain() {
        assert_eq!(normalize_email(" Jean@Exemple.FR "), Some("jean@exemple.fr".to_owned()));
        assert_eq!(normalize_email("jean@exemple"), None);
        assert_eq!(normalize_email("jean exemple.fr"), None);
        assert_eq!(normalize_email("@exemple.fr"), None);
    }

    #[test]
    fn masked_phone_keeps_only_edges() {
        assert_eq!(mask_phone("33612345678"), "336******78");
        assert_eq!(mask_phone("123"), "***");
    }

    #[test]
    fn short_identifiers_never_log_in_clear() {
        assert_eq!(mask_phone("12345"), "***45");
        assert_eq!(mask_phone("061234567"), "*******67");
        for raw in ["12345", "123456", "0612345", "+336123456"] {
            let masked = mask_phone(raw);
            let hidden = masked.chars().filter(|ch| *ch == '*').count();
            assert!(hidden * 2 >= raw.chars().count(), "`{raw}` masked as `{masked}`");
        }
    }
}
