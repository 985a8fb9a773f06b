//! Configuration types.
//!
//! Everything is read from environment variables, the same way the channel
//! configs are built. `from_lookup` takes any key → value function so tests
//! never have to touch the process environment.

use std::fmt;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{ConfigError, Result};
use crate::pipeline::patterns::IdFallback;

/// Counterpart queried for price data when no override is configured.
///
/// This is a bot. The Bot API does not deliver messages between bots, so
/// [`TelegramMessenger`](crate::channels::TelegramMessenger) cannot consult
/// it; a user-account (MTProto) transport behind `Messenger` is needed for
/// that, or an override that points at a chat the bot can talk to.
pub const DEFAULT_COUNTERPART: &str = "PriceNFTbot";

/// How long a consultation waits for the counterpart's reply.
pub const DEFAULT_CONSULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Default Telegram Bot API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

const DEFAULT_SESSION_NAME: &str = "forward_session";
const DEFAULT_SELF_TEST_PLACEHOLDER: &str = "0";

/// A configured chat identity, before it is resolved to a handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Public username, stored without the leading `@`.
    Username(String),
    /// Numeric chat id (channels look like `-100…`).
    Id(i64),
}

impl Identity {
    /// Parse a raw identifier.
    ///
    /// A leading `@` is dropped. Values that start with `-` or are all digits
    /// become numeric ids when they fit in an `i64`; anything else is treated
    /// as a username. Returns `None` for blank input.
    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim().trim_start_matches('@');
        if value.is_empty() {
            return None;
        }

        let looks_numeric =
            value.starts_with('-') || value.chars().all(|c| c.is_ascii_digit());
        if looks_numeric {
            if let Ok(id) = value.parse::<i64>() {
                return Some(Self::Id(id));
            }
        }

        Some(Self::Username(value.to_string()))
    }

    /// Telegram requires bot usernames to end in "bot".
    pub fn is_bot_username(&self) -> bool {
        match self {
            Self::Username(name) => name.to_ascii_lowercase().ends_with("bot"),
            Self::Id(_) => false,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Username(name) => write!(f, "@{name}"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

/// One-shot consultation run right after startup.
#[derive(Debug, Clone)]
pub struct SelfTestConfig {
    pub enabled: bool,
    /// Username sent to the counterpart. The self-test is skipped without it.
    pub identity: Option<String>,
    /// Placeholder profit value reported alongside the self-test.
    pub placeholder: String,
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            identity: None,
            placeholder: DEFAULT_SELF_TEST_PLACEHOLDER.to_string(),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bot API credential.
    pub bot_token: SecretString,
    /// Bot API base URL (overridable for local gateways).
    pub api_base: String,
    /// Label for this relay session, used in logs.
    pub session_name: String,
    /// Monitored sender whose messages are classified.
    pub source: Identity,
    /// Channel receiving relayed output.
    pub destination: Identity,
    /// Party consulted for enrichment data.
    pub counterpart: Identity,
    /// Deadline for a single consultation.
    pub consult_timeout: Duration,
    /// Whether an unlabeled digit run may stand in for a user id.
    pub id_fallback: IdFallback,
    pub self_test: SelfTestConfig,
}

impl RelayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self::read(lookup)?)
    }

    fn read<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bot_token = get("TELEGRAM_BOT_TOKEN").ok_or_else(|| ConfigError::MissingRequired {
            key: "TELEGRAM_BOT_TOKEN".into(),
            hint: "Create a bot with @BotFather and export its token".into(),
        })?;

        let source = required_identity(&get, "RELAY_SOURCE")?;
        let destination = required_identity(&get, "RELAY_DESTINATION")?;

        let counterpart = match get("RELAY_COUNTERPART") {
            Some(raw) => Identity::parse(&raw).ok_or_else(|| invalid("RELAY_COUNTERPART", "empty identity"))?,
            None => Identity::Username(DEFAULT_COUNTERPART.to_string()),
        };

        let consult_timeout = match get("RELAY_CONSULT_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| invalid("RELAY_CONSULT_TIMEOUT_SECS", "expected whole seconds"))?;
                if secs == 0 {
                    return Err(invalid("RELAY_CONSULT_TIMEOUT_SECS", "must be greater than zero"));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_CONSULT_TIMEOUT,
        };

        let id_fallback = match get("RELAY_ID_FALLBACK") {
            Some(raw) => IdFallback::parse(&raw).ok_or_else(|| {
                invalid("RELAY_ID_FALLBACK", "expected any_digit_run or labeled_only")
            })?,
            None => IdFallback::default(),
        };

        let self_test = SelfTestConfig {
            enabled: match get("RELAY_SELF_TEST") {
                Some(raw) => parse_bool(&raw).ok_or_else(|| invalid("RELAY_SELF_TEST", "expected a boolean"))?,
                None => true,
            },
            identity: get("RELAY_SELF_TEST_IDENTITY")
                .map(|v| v.trim_start_matches('@').to_string())
                .filter(|v| !v.is_empty()),
            placeholder: get("RELAY_SELF_TEST_PLACEHOLDER")
                .unwrap_or_else(|| DEFAULT_SELF_TEST_PLACEHOLDER.to_string()),
        };

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            api_base: get("TELEGRAM_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            session_name: get("RELAY_SESSION_NAME")
                .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string()),
            source,
            destination,
            counterpart,
            consult_timeout,
            id_fallback,
            self_test,
        })
    }
}

fn required_identity<G>(get: &G, key: &str) -> std::result::Result<Identity, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.into(),
        hint: "Use a @username or a numeric chat id".into(),
    })?;
    Identity::parse(&raw).ok_or_else(|| invalid(key, "empty identity"))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
