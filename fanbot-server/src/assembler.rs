//! Builds the ordered message list sent upstream.

use fanbot_shared::{ChatMessage, ClientChatRequest};

pub const SYSTEM_PROMPT: &str = "\
Tu es FanBot, assistant officiel de la Coupe du Monde 2030.
Pays hôtes: Maroc, Espagne, Portugal.

Tu aides les fans pour:
- matchs
- stades
- villes
- transports
- fan zones
- billets
- hôtels
- règles du stade

Réponds en français, clairement, avec des infos pratiques.
Si les données sont fournies dans le contexte, utilise-les.";

pub const CONTEXT_PREFIX: &str = "Contexte utile:\n";

/// Sent when the caller gave us nothing to answer.
pub const DEFAULT_GREETING: &str = "Bonjour";

/// Order is always: persona, optional context, then the conversation.
/// A caller-supplied history takes precedence over a single `message`.
pub fn assemble(request: &ClientChatRequest) -> Vec<ChatMessage> {
    let history = request.messages.as_deref().unwrap_or_default();
    let mut messages = Vec::with_capacity(2 + history.len().max(1));

    messages.push(ChatMessage::system(SYSTEM_PROMPT));

    if let Some(context) = request.context.as_deref().filter(|c| !c.is_empty()) {
        messages.push(ChatMessage::system(format!("{CONTEXT_PREFIX}{context}")));
    }

    if !history.is_empty() {
        messages.extend_from_slice(history);
    } else if let Some(text) = request
        .message
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        messages.push(ChatMessage::user(text));
    } else {
        messages.push(ChatMessage::user(DEFAULT_GREETING));
    }

    messages
}
