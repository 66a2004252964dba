/// Truncate a string to at most `max_bytes` bytes without splitting a character.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let end = (0..=max_bytes)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0);
    &s[..end]
}

/// Strip a surrounding markdown code fence (```json ... ```) from a model reply.
pub fn strip_code_blocks(response: &str) -> &str {
    let trimmed = response.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_multibyte_characters() {
        let text = "Concierto en el café";
        let truncated = truncate_to_char_boundary(text, 19);
        assert!(truncated.len() <= 19);
        assert!(text.starts_with(truncated));
        assert_eq!(truncated, "Concierto en el caf");
    }

    #[test]
    fn short_input_is_untouched() {
        assert_eq!(truncate_to_char_boundary("gig", 100), "gig");
    }

    #[test]
    fn fences_are_removed() {
        assert_eq!(strip_code_blocks("```json\n[{\"event_title\":\"x\"}]\n```"), "[{\"event_title\":\"x\"}]");
        assert_eq!(strip_code_blocks("```\n[]\n```"), "[]");
        assert_eq!(strip_code_blocks("  []  "), "[]");
    }
}
