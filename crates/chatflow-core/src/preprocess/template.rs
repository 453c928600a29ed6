//! Template tokens in system prompts and message name sanitizing.

use chrono::{DateTime, Local};
use uuid::Uuid;

/// Maximum length of a message `name` accepted by providers.
const MAX_NAME_CHARS: usize = 64;

/// Host facts exposed to templates. Captured once per preprocessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEnvironment {
    pub hostname: String,
    pub platform: String,
    pub username: String,
}

impl TemplateEnvironment {
    /// Read the facts of the current host.
    pub fn detect() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        Self {
            hostname,
            platform: std::env::consts::OS.to_string(),
            username,
        }
    }
}

/// Values for every supported `{{token}}`.
#[derive(Debug, Clone)]
pub struct TemplateContext<'a> {
    pub user: &'a str,
    pub char_name: &'a str,
    pub model: &'a str,
    pub now: DateTime<Local>,
    pub environment: &'a TemplateEnvironment,
    /// Cache buster, fresh per request.
    pub nonce: String,
}

impl<'a> TemplateContext<'a> {
    pub fn new(
        user: &'a str,
        char_name: &'a str,
        model: &'a str,
        environment: &'a TemplateEnvironment,
    ) -> Self {
        Self {
            user,
            char_name,
            model,
            now: Local::now(),
            environment,
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Expand template tokens in `text`. Unknown tokens are left as-is.
pub fn expand(text: &str, ctx: &TemplateContext<'_>) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    let date = ctx.now.format("%Y-%m-%d").to_string();
    let time = ctx.now.format("%H:%M:%S").to_string();
    let tokens: [(&str, &str); 9] = [
        ("{{user}}", ctx.user),
        ("{{char}}", ctx.char_name),
        ("{{model}}", ctx.model),
        ("{{date}}", &date),
        ("{{time}}", &time),
        ("{{hostname}}", &ctx.environment.hostname),
        ("{{platform}}", &ctx.environment.platform),
        ("{{username}}", &ctx.environment.username),
        ("{{nonce}}", &ctx.nonce),
    ];
    tokens
        .iter()
        .fold(text.to_string(), |acc, (token, value)| acc.replace(token, value))
}

/// Reduce `name` to the characters providers accept in a `name` field.
///
/// Returns `None` when nothing usable remains.
pub fn sanitize_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_NAME_CHARS)
        .collect();
    let trimmed = cleaned.trim_matches('_');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
