//! Compiled text-extraction patterns.
//!
//! Each pattern is compiled once and shared read-only by every
//! classification. All extractors return the first match or `None`.

use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::types::Transition;

/// A named, compiled matcher that extracts one capture group.
#[derive(Debug)]
pub struct ExtractionPattern {
    pub name: &'static str,
    regex: Regex,
    group: usize,
}

impl ExtractionPattern {
    fn new(name: &'static str, pattern: &str, group: usize) -> Self {
        let regex = Regex::new(pattern)
            .unwrap_or_else(|e| panic!("extraction pattern {name} failed to compile: {e}"));
        Self { name, regex, group }
    }

    /// First match in `text`, trimmed. Empty matches count as no match.
    pub fn find(&self, text: &str) -> Option<String> {
        let caps = self.regex.captures(text)?;
        let value = caps.get(self.group)?.as_str().trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

static USERNAME: LazyLock<ExtractionPattern> =
    LazyLock::new(|| ExtractionPattern::new("username", r"@[_A-Za-z0-9]{3,}", 0));

static LABELED_ID: LazyLock<ExtractionPattern> =
    LazyLock::new(|| ExtractionPattern::new("labeled_id", r"(?i)ID[:\s]*([\-\d]{5,})", 1));

static BARE_ID: LazyLock<ExtractionPattern> =
    LazyLock::new(|| ExtractionPattern::new("bare_id", r"\b(\d{5,})\b", 1));

static COMMAND: LazyLock<ExtractionPattern> =
    LazyLock::new(|| ExtractionPattern::new("command", r"(/[A-Za-z0-9_]+)", 1));

static ACTION_FIELD: LazyLock<ExtractionPattern> =
    LazyLock::new(|| ExtractionPattern::new("action_field", r"(?i)Действие[:\s]*([^\n\r]+)", 1));

static CONVERSION: LazyLock<ExtractionPattern> = LazyLock::new(|| {
    ExtractionPattern::new("conversion", r"(?i)[\d.,]+\s*TON\s*≈\s*[\d.,]+\s*\$", 0)
});

/// What to do when a message has no labeled `ID:` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdFallback {
    /// Take the first standalone run of 5+ digits anywhere in the text.
    #[default]
    AnyDigitRun,
    /// Only accept the labeled form.
    LabeledOnly,
}

impl IdFallback {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "any_digit_run" | "any" => Some(Self::AnyDigitRun),
            "labeled_only" | "labeled" => Some(Self::LabeledOnly),
            _ => None,
        }
    }
}

/// Stateless extractors over message text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternLibrary {
    id_fallback: IdFallback,
}

impl PatternLibrary {
    pub fn new(id_fallback: IdFallback) -> Self {
        Self { id_fallback }
    }

    pub fn id_fallback(&self) -> IdFallback {
        self.id_fallback
    }

    /// `@` followed by 3+ word characters; the `@` is kept.
    pub fn extract_username(&self, text: &str) -> Option<String> {
        USERNAME.find(text)
    }

    /// Labeled `ID: 12345` first, then (policy permitting) any 5+ digit run.
    pub fn extract_numeric_id(&self, text: &str) -> Option<String> {
        LABELED_ID.find(text).or_else(|| match self.id_fallback {
            IdFallback::AnyDigitRun => BARE_ID.find(text),
            IdFallback::LabeledOnly => None,
        })
    }

    /// A `/command` token, else the rest of a `Действие:` line.
    pub fn extract_action(&self, text: &str) -> Option<String> {
        COMMAND.find(text).or_else(|| ACTION_FIELD.find(text))
    }

    /// `<number> TON ≈ <number> $`.
    pub fn extract_conversion_phrase(&self, text: &str) -> Option<String> {
        CONVERSION.find(text)
    }

    /// Username, id and action together, or nothing.
    pub fn extract_transition(&self, text: &str) -> Option<Transition> {
        Some(Transition {
            username: self.extract_username(text)?,
            id: self.extract_numeric_id(text)?,
            action: self.extract_action(text)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lib() -> PatternLibrary {
        PatternLibrary::default()
    }

    #[test]
    fn username_requires_three_chars() {
        assert_eq!(lib().extract_username("hi @ab there"), None);
        assert_eq!(
            lib().extract_username("user @alice_99 joined"),
            Some("@alice_99".into())
        );
    }

    #[test]
    fn username_takes_first_match() {
        assert_eq!(
            lib().extract_username("@first_one and @second_one"),
            Some("@first_one".into())
        );
    }

    #[test]
    fn labeled_id_preferred_over_bare_digits() {
        let text = "Order 99999 for user (ID: 123456)";
        assert_eq!(lib().extract_numeric_id(text), Some("123456".into()));
    }

    #[test]
    fn labeled_id_is_case_insensitive() {
        assert_eq!(lib().extract_numeric_id("id:765432"), Some("765432".into()));
        assert_eq!(lib().extract_numeric_id("Id 765432"), Some("765432".into()));
    }

    #[test]
    fn labeled_id_requires_five_digits() {
        assert_eq!(lib().extract_numeric_id("ID: 1234"), None);
    }

    #[test]
    fn bare_id_fallback() {
        assert_eq!(
            lib().extract_numeric_id("visitor 5551234 clicked"),
            Some("5551234".into())
        );
    }

    #[test]
    fn labeled_only_policy_ignores_bare_digits() {
        let strict = PatternLibrary::new(IdFallback::LabeledOnly);
        assert_eq!(strict.extract_numeric_id("visitor 5551234 clicked"), None);
        assert_eq!(
            strict.extract_numeric_id("visitor ID: 5551234"),
            Some("5551234".into())
        );
    }

    #[test]
    fn action_prefers_command() {
        let text = "Действие: открыл сайт\n/start";
        assert_eq!(lib().extract_action(text), Some("/start".into()));
    }

    #[test]
    fn action_falls_back_to_labeled_field() {
        let text = "Пользователь: @bob_x\nДействие:   открыл сайт  \nдалее";
        assert_eq!(lib().extract_action(text), Some("открыл сайт".into()));
    }

    #[test]
    fn action_field_case_insensitive() {
        assert_eq!(
            lib().extract_action("действие: вход"),
            Some("вход".into())
        );
    }

    #[test]
    fn conversion_phrase_extracted() {
        assert_eq!(
            lib().extract_conversion_phrase("Rate: 12.5 TON ≈ 340,10 $ today"),
            Some("12.5 TON ≈ 340,10 $".into())
        );
    }

    #[test]
    fn conversion_phrase_case_insensitive_and_tight_spacing() {
        assert_eq!(
            lib().extract_conversion_phrase("gift: 3ton≈9.9$"),
            Some("3ton≈9.9$".into())
        );
    }

    #[test]
    fn conversion_phrase_requires_approx_sign() {
        assert_eq!(lib().extract_conversion_phrase("12.5 TON = 340 $"), None);
    }

    #[test]
    fn absent_matches_are_none() {
        let l = lib();
        assert!(l.extract_username("").is_none());
        assert!(l.extract_numeric_id("").is_none());
        assert!(l.extract_action("").is_none());
        assert!(l.extract_conversion_phrase("").is_none());
        assert!(l.extract_transition("plain text").is_none());
    }

    #[test]
    fn transition_any_order() {
        let forward = lib()
            .extract_transition("@alice_99 ID: 123456 /start")
            .unwrap();
        let reversed = lib()
            .extract_transition("/start then ID: 123456 from @alice_99")
            .unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(forward.username, "@alice_99");
        assert_eq!(forward.id, "123456");
        assert_eq!(forward.action, "/start");
    }

    #[test]
    fn id_fallback_parse() {
        assert_eq!(IdFallback::parse("labeled_only"), Some(IdFallback::LabeledOnly));
        assert_eq!(IdFallback::parse("ANY_DIGIT_RUN"), Some(IdFallback::AnyDigitRun));
        assert_eq!(IdFallback::parse("sometimes"), None);
    }
}
