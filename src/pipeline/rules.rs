//! Ordered classification rules.
//!
//! Every message from the source is checked against the rule list top to
//! bottom; the first rule that matches decides the action:
//! - username + id + action all present → structured transition report
//! - "🎯 Новое действие!" banner → forward as is
//! - "🍏 УСПЕШНАЯ АВТОРИЗАЦИЯ" banner → forward and consult the price bot
//! - "💸 УСПЕШНАЯ ОБРАБОТКА МАМОНТА" banner → forward as is
//! - error/compromise keywords → forward as is
//!
//! Anything else is ignored. Classification only reads the message text.

use tracing::debug;

use crate::channels::IncomingMessage;
use crate::pipeline::patterns::PatternLibrary;
use crate::pipeline::types::ActionKind;

/// Keywords that flag error or compromise reports.
const ALERT_KEYWORDS: [&str; 4] = [
    "мамонт",
    "произошел конфуз",
    "конфуз",
    "доступ к сессии утерян",
];

/// A fixed message prefix: an emoji glyph followed by a title.
///
/// The source sends both `🍏 TITLE` and `🍏TITLE`, so one optional space
/// between glyph and title is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    glyph: String,
    title: String,
}

impl Banner {
    pub fn new(glyph: &str, title: &str) -> Self {
        Self {
            glyph: glyph.to_string(),
            title: title.to_string(),
        }
    }

    /// Whether `text` starts with this banner.
    pub fn matches(&self, text: &str) -> bool {
        let Some(rest) = text.strip_prefix(self.glyph.as_str()) else {
            return false;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        rest.starts_with(self.title.as_str())
    }
}

/// When a rule fires.
#[derive(Debug, Clone)]
pub enum RulePredicate {
    /// Username, numeric id and action token can all be extracted.
    AllFieldsExtractable,
    /// Text starts with the banner.
    Banner(Banner),
    /// Lowercased text contains any of these (already lowercase) substrings.
    Keywords(Vec<String>),
}

/// What a firing rule produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    ForwardRaw,
    ForwardStructured,
    ForwardWithConversation,
}

/// A single (predicate, action) pair.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    /// Name used in logs.
    pub name: String,
    pub predicate: RulePredicate,
    pub action: RuleAction,
}

/// Rule-list classifier.
pub struct Classifier {
    rules: Vec<ClassificationRule>,
    patterns: PatternLibrary,
}

impl Classifier {
    /// Create a classifier with the standard rule list.
    pub fn default_rules(patterns: PatternLibrary) -> Self {
        let rules = vec![
            ClassificationRule {
                name: "structured_transition".into(),
                predicate: RulePredicate::AllFieldsExtractable,
                action: RuleAction::ForwardStructured,
            },
            ClassificationRule {
                name: "new_action_banner".into(),
                predicate: RulePredicate::Banner(Banner::new("🎯", "Новое действие!")),
                action: RuleAction::ForwardRaw,
            },
            ClassificationRule {
                name: "authorization_banner".into(),
                predicate: RulePredicate::Banner(Banner::new("🍏", "УСПЕШНАЯ АВТОРИЗАЦИЯ")),
                action: RuleAction::ForwardWithConversation,
            },
            ClassificationRule {
                name: "processing_banner".into(),
                predicate: RulePredicate::Banner(Banner::new("💸", "УСПЕШНАЯ ОБРАБОТКА МАМОНТА")),
                action: RuleAction::ForwardRaw,
            },
            ClassificationRule {
                name: "alert_keywords".into(),
                predicate: RulePredicate::Keywords(
                    ALERT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
                ),
                action: RuleAction::ForwardRaw,
            },
        ];

        Self { rules, patterns }
    }

    /// Create a classifier with no rules (for testing).
    pub fn empty(patterns: PatternLibrary) -> Self {
        Self {
            rules: Vec::new(),
            patterns,
        }
    }

    /// Append a banner rule after the existing ones.
    pub fn add_banner_rule(&mut self, name: &str, banner: Banner, action: RuleAction) {
        self.rules.push(ClassificationRule {
            name: name.into(),
            predicate: RulePredicate::Banner(banner),
            action,
        });
    }

    /// Append a keyword rule after the existing ones.
    pub fn add_keyword_rule(&mut self, name: &str, keywords: &[&str], action: RuleAction) {
        self.rules.push(ClassificationRule {
            name: name.into(),
            predicate: RulePredicate::Keywords(keywords.iter().map(|k| k.to_lowercase()).collect()),
            action,
        });
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn patterns(&self) -> &PatternLibrary {
        &self.patterns
    }

    /// Classify a message. Returns `Ignore` when no rule matches.
    pub fn classify(&self, message: &IncomingMessage) -> ActionKind {
        self.classify_text(message.text())
    }

    /// Classify already-trimmed message text.
    pub fn classify_text(&self, text: &str) -> ActionKind {
        for rule in &self.rules {
            if let Some(action) = self.apply(rule, text) {
                debug!(
                    rule = %rule.name,
                    action = action.label(),
                    "Message matched classification rule"
                );
                return action;
            }
        }

        ActionKind::Ignore
    }

    fn apply(&self, rule: &ClassificationRule, text: &str) -> Option<ActionKind> {
        let holds = match &rule.predicate {
            RulePredicate::AllFieldsExtractable => self.patterns.extract_transition(text).is_some(),
            RulePredicate::Banner(banner) => banner.matches(text),
            RulePredicate::Keywords(keywords) => {
                let lower = text.to_lowercase();
                keywords.iter().any(|k| lower.contains(k.as_str()))
            }
        };
        if !holds {
            return None;
        }

        let action = match rule.action {
            RuleAction::ForwardRaw => ActionKind::ForwardRaw,
            RuleAction::ForwardStructured => {
                ActionKind::ForwardStructured(self.patterns.extract_transition(text)?)
            }
            RuleAction::ForwardWithConversation => ActionKind::ForwardWithConversation {
                username: self.patterns.extract_username(text),
            },
        };
        Some(action)
    }
}
