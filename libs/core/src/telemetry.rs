use tracing::info_span;

use crate::types::ChatId;

pub fn span_for_chat(action: &'static str, chat: &ChatId) -> tracing::Span {
    info_span!("support.chat", action, chat_id = chat.as_str())
}

pub fn span_for_session(chat: &ChatId) -> tracing::Span {
    info_span!("support.session", chat_id = chat.as_str())
}

pub fn span_for_delivery(action: &'static str, chat: &ChatId, marker: u64) -> tracing::Span {
    info_span!("support.delivery", action, chat_id = chat.as_str(), marker)
}
