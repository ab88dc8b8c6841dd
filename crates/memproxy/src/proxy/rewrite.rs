//! Conversation rewriting
//!
//! For an eligible chat request the session's remembered history replaces
//! the client-supplied history: recalled records come first, followed by the
//! newest incoming message exactly as the client sent it.

use axum::http::{HeaderMap, header::AUTHORIZATION};
use serde_json::{Value, json};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::memory::RecordMetadata;
use crate::provider::strip_bearer;
use crate::session::SessionGuard;

/// Headers a credential may arrive in, in lookup order
const CREDENTIAL_HEADERS: &[&str] = &["x-api-key", "x-goog-api-key"];

/// Result of rewriting one request's messages
#[derive(Debug, Clone, PartialEq)]
pub struct Rewrite {
    /// Messages to send upstream
    pub messages: Vec<Value>,
    /// Whether `messages` differs from what the client sent
    pub rewritten: bool,
    /// Whitespace-token count of the incoming messages
    pub original_tokens: u64,
    /// Whitespace-token count of the outgoing messages
    pub compressed_tokens: u64,
}

/// The caller's credential: `Authorization: Bearer <x>`, `x-api-key` or
/// `x-goog-api-key`, trimmed. Empty when none is present.
pub fn extract_credential(headers: &HeaderMap) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(strip_bearer)
            .filter(|v| !v.is_empty())
    };

    header_value(AUTHORIZATION.as_str())
        .or_else(|| CREDENTIAL_HEADERS.iter().find_map(|name| header_value(*name)))
        .unwrap_or_default()
        .to_string()
}

/// Parse a request body. An empty body is treated as `{}`.
pub fn parse_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| ProxyError::MalformedBody(e.to_string()))
}

/// Whether a request takes part in memory rewriting: the path ends with one
/// of the configured chat paths and the body carries enough messages.
///
/// Sub-resources such as `/v1/messages/count_tokens` or
/// `/v1/messages/batches` never match, so they leave memory alone.
pub fn is_eligible(path: &str, body: &Value, config: &ProxyConfig) -> bool {
    let path = path.trim_end_matches('/');
    let chat_path = config
        .chat_paths
        .iter()
        .map(|p| p.trim_end_matches('/'))
        .any(|p| !p.is_empty() && path.ends_with(p));

    chat_path
        && body
            .get("messages")
            .and_then(Value::as_array)
            .is_some_and(|messages| messages.len() >= config.min_messages.max(1))
}

/// Plain text of one chat message.
///
/// String content is returned as-is; block arrays contribute their `text`
/// blocks joined by newlines. Anything else has no text.
pub fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                Value::String(text) => Some(text.as_str()),
                _ => block.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn message_role(message: &Value) -> &str {
    message.get("role").and_then(Value::as_str).unwrap_or("user")
}

/// Whitespace-token estimate over every message's text
pub fn count_tokens(messages: &[Value]) -> u64 {
    messages
        .iter()
        .map(|m| message_text(m).split_whitespace().count() as u64)
        .sum()
}

/// Rewrite `messages` against the locked session.
///
/// History is recalled before any incoming message is stored, so the
/// current turn never shows up in its own history.
pub async fn rewrite_messages(
    guard: &mut SessionGuard,
    messages: &[Value],
    recall_limit: usize,
) -> Result<Rewrite> {
    let history: Vec<Value> = guard
        .recall("", 0.0, recall_limit)
        .await?
        .iter()
        .filter_map(|record| {
            record
                .content()
                .map(|content| json!({ "role": record.role(), "content": content }))
        })
        .collect();

    for message in messages {
        let metadata = RecordMetadata::new(message_role(message), guard.key().as_str());
        guard.remember(&message_text(message), metadata).await?;
    }

    let rewritten = !history.is_empty();
    let outgoing = if rewritten {
        let mut outgoing = history;
        outgoing.extend(messages.last().cloned());
        outgoing
    } else {
        messages.to_vec()
    };

    Ok(Rewrite {
        original_tokens: count_tokens(messages),
        compressed_tokens: count_tokens(&outgoing),
        messages: outgoing,
        rewritten,
    })
}
