/// Twilio rejects WhatsApp bodies longer than this many characters.
pub const MAX_BODY_CHARS: usize = 1_600;

/// Splits a reply into bodies no longer than `limit` characters, cutting at paragraph breaks
/// first, then at line breaks, and only inside a line when a single line is too long.
pub fn split_reply(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= limit {
        return vec![text.to_owned()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        for piece in fit_paragraph(paragraph, limit) {
            let separator = if current.is_empty() { 0 } else { 2 };
            if char_len(&current) + separator + char_len(&piece) > limit {
                flush(&mut parts, &mut current);
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }
    flush(&mut parts, &mut current);
    parts
}

fn fit_paragraph(paragraph: &str, limit: usize) -> Vec<String> {
    if char_len(paragraph) <= limit {
        return vec![paragraph.to_owned()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for line in paragraph.lines() {
        for chunk in hard_wrap(line, limit) {
            let separator = usize::from(!current.is_empty());
            if char_len(&current) + separator + char_len(&chunk) > limit {
                flush(&mut pieces, &mut current);
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&chunk);
        }
    }
    flush(&mut pieces, &mut current);
    pieces
}

fn hard_wrap(line: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars.chunks(limit).map(|chunk| chunk.iter().collect()).collect()
}

fn flush(parts: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_owned());
    }
    current.clear();
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

#[cfg(test)]
mod tests {
    use super::{split_reply, MAX_BODY_CHARS};

    #[test]
    fn short_replies_are_sent_as_is() {
        assert_eq!(split_reply("  Bonjour  ", MAX_BODY_CHARS), vec!["Bonjour".to_owned()]);
        assert!(split_reply("   ", MAX_BODY_CHARS).is_empty());
    }

    #[test]
    fn long_replies_break_between_paragraphs() {
        let reply = "aaaa aaaa\n\nbbbb bbbb\n\ncccc";
        let parts = split_reply(reply, 12);

        assert_eq!(parts, vec!["aaaa aaaa", "bbbb bbbb", "cccc"]);
    }

    #[test]
    fn oversized_lines_are_cut_without_losing_characters() {
        let reply = "é".repeat(25);
        let parts = split_reply(&reply, 10);

        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|part| part.chars().count() <= 10));
        assert_eq!(parts.concat(), reply);
    }

    #[test]
    fn every_part_respects_the_provider_limit() {
        let line = format!("{}\n", "ligne de devis ".repeat(8));
        let reply = line.repeat(40);
        let parts = split_reply(&reply, MAX_BODY_CHARS);

        assert!(parts.len() > 1);
        assert!(parts.iter().all(|part| part.chars().count() <= MAX_BODY_CHARS));
    }
}
