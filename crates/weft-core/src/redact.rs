//! Sensitive-data detection and keyed tokenization
//!
//! Any argument value that leaves the process boundary (logs, analytics,
//! cross-process caches, sandbox call logs) passes through a [`Redactor`].
//! Detected patterns are replaced by deterministic tokens derived from a
//! caller-held secret: the same secret maps the same value to the same
//! token, and without the secret tokens cannot be mapped back.

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Categories of sensitive data the redactor detects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensitiveKind {
    Email,
    Phone,
    Ssn,
    CreditCard,
    IpAddress,
}

impl SensitiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensitiveKind::Email => "email",
            SensitiveKind::Phone => "phone",
            SensitiveKind::Ssn => "ssn",
            SensitiveKind::CreditCard => "card",
            SensitiveKind::IpAddress => "ip",
        }
    }
}

/// Pattern-based tokenizer over strings and JSON trees
pub struct Redactor {
    secret: Option<String>,
    // Order matters: SSN and card numbers would otherwise match the
    // looser phone pattern.
    patterns: Vec<(SensitiveKind, Regex)>,
}

impl Redactor {
    /// Redactor with a secret: matches become `[kind:token]` with a
    /// deterministic 12-hex token
    pub fn new(secret: impl Into<String>) -> Self {
        Self::build(Some(secret.into()))
    }

    /// Redactor without a secret: matches become plain `[kind]` markers
    pub fn unkeyed() -> Self {
        Self::build(None)
    }

    fn build(secret: Option<String>) -> Self {
        let patterns = vec![
            (
                SensitiveKind::Email,
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            ),
            (
                SensitiveKind::Ssn,
                Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            ),
            (
                SensitiveKind::CreditCard,
                Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").unwrap(),
            ),
            (
                SensitiveKind::Phone,
                Regex::new(r"\b(?:\+?\d{1,3}[-. ]?)?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b").unwrap(),
            ),
            (
                SensitiveKind::IpAddress,
                Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
            ),
        ];
        Self { secret, patterns }
    }

    fn token(&self, kind: SensitiveKind, matched: &str) -> String {
        match &self.secret {
            Some(secret) => {
                let mut hasher = Sha256::new();
                hasher.update(secret.as_bytes());
                hasher.update([0]);
                hasher.update(kind.as_str().as_bytes());
                hasher.update([0]);
                hasher.update(matched.as_bytes());
                let digest = hasher.finalize();
                let hex: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
                format!("[{}:{}]", kind.as_str(), hex)
            }
            None => format!("[{}]", kind.as_str()),
        }
    }

    /// Replace every detected pattern in `text` with its token
    pub fn redact_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (kind, pattern) in &self.patterns {
            out = pattern
                .replace_all(&out, |caps: &regex::Captures<'_>| {
                    self.token(*kind, caps.get(0).map(|m| m.as_str()).unwrap_or_default())
                })
                .into_owned();
        }
        out
    }

    /// Walk a JSON tree, redacting every string leaf
    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.redact_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Whether `text` contains any detectable sensitive data
    pub fn detects(&self, text: &str) -> bool {
        self.patterns.iter().any(|(_, p)| p.is_match(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_tokenized() {
        let redactor = Redactor::new("s3cret");
        let out = redactor.redact_text("contact alice@example.com for access");
        assert!(!out.contains("alice@example.com"));
        assert!(out.contains("[email:"));
    }

    #[test]
    fn test_tokens_deterministic_per_secret() {
        let a = Redactor::new("s3cret");
        let b = Redactor::new("s3cret");
        let text = "ssn 123-45-6789";
        assert_eq!(a.redact_text(text), b.redact_text(text));
    }

    #[test]
    fn test_tokens_differ_across_secrets() {
        let a = Redactor::new("one");
        let b = Redactor::new("two");
        let text = "ssn 123-45-6789";
        assert_ne!(a.redact_text(text), b.redact_text(text));
    }

    #[test]
    fn test_unkeyed_markers() {
        let redactor = Redactor::unkeyed();
        let out = redactor.redact_text("host 10.0.0.1 unreachable");
        assert_eq!(out, "host [ip] unreachable");
    }

    #[test]
    fn test_card_and_phone() {
        let redactor = Redactor::unkeyed();
        let out = redactor.redact_text("card 4111-1111-1111-1111, call 555-867-5309");
        assert!(out.contains("[card]"));
        assert!(out.contains("[phone]"));
        assert!(!out.contains("4111"));
    }

    #[test]
    fn test_value_tree_redaction() {
        let redactor = Redactor::new("k");
        let value = json!({
            "to": "bob@example.org",
            "nested": {"ips": ["192.168.1.1", "clean"]},
            "count": 3
        });
        let redacted = redactor.redact_value(&value);
        let text = redacted.to_string();
        assert!(!text.contains("bob@example.org"));
        assert!(!text.contains("192.168.1.1"));
        assert!(text.contains("clean"));
        assert_eq!(redacted["count"], json!(3));
    }

    #[test]
    fn test_clean_text_untouched() {
        let redactor = Redactor::new("k");
        assert_eq!(redactor.redact_text("nothing secret here"), "nothing secret here");
        assert!(!redactor.detects("nothing secret here"));
    }
}
