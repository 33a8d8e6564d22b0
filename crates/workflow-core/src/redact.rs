//! Log sanitization (`spec.md` §7): strips recognizable API-key patterns,
//! home-directory paths, and long base64 runs from a message before it
//! reaches `tracing` output.

const DEFAULT_BASE64_THRESHOLD: usize = 64;

pub fn redact(message: &str) -> String {
    redact_with_threshold(message, DEFAULT_BASE64_THRESHOLD)
}

pub fn redact_with_threshold(message: &str, base64_threshold: usize) -> String {
    let mut out = String::with_capacity(message.len());
    for token in message.split_inclusive(char::is_whitespace) {
        let (word, trailing_ws) = split_trailing_whitespace(token);
        out.push_str(&redact_word(word, base64_threshold));
        out.push_str(trailing_ws);
    }
    out
}

fn split_trailing_whitespace(token: &str) -> (&str, &str) {
    let trimmed = token.trim_end_matches(char::is_whitespace);
    (trimmed, &token[trimmed.len()..])
}

fn redact_word(word: &str, base64_threshold: usize) -> String {
    if looks_like_api_key(word) {
        return "[REDACTED_KEY]".to_string();
    }
    if looks_like_home_path(word) {
        return "[REDACTED_PATH]".to_string();
    }
    if looks_like_base64(word, base64_threshold) {
        return "[REDACTED_BLOB]".to_string();
    }
    word.to_string()
}

fn looks_like_api_key(word: &str) -> bool {
    const PREFIXES: &[&str] = &["sk-", "sk_", "pk_", "api_key_", "Bearer "];
    PREFIXES.iter().any(|p| word.starts_with(p)) && word.len() > 12
}

fn looks_like_home_path(word: &str) -> bool {
    word.starts_with("/home/") || word.starts_with("/root/") || word.contains("/Users/")
}

fn looks_like_base64(word: &str, threshold: usize) -> bool {
    if word.len() < threshold {
        return false;
    }
    word.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_api_key_prefix() {
        let msg = "using key sk-abcdefghijklmnopqrst for auth";
        let redacted = redact(msg);
        assert!(!redacted.contains("sk-abcdefghijklmnopqrst"));
        assert!(redacted.contains("[REDACTED_KEY]"));
    }

    #[test]
    fn redacts_home_directory_path() {
        let msg = "reading /root/secrets/config.json";
        let redacted = redact(msg);
        assert!(redacted.contains("[REDACTED_PATH]"));
    }

    #[test]
    fn redacts_long_base64_blob() {
        let blob = "A".repeat(80);
        let msg = format!("payload: {blob}");
        let redacted = redact(&msg);
        assert!(redacted.contains("[REDACTED_BLOB]"));
    }

    #[test]
    fn leaves_ordinary_text_untouched() {
        let msg = "module s1.text_input completed successfully";
        assert_eq!(redact(msg), msg);
    }
}
