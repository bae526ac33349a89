use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

use crate::broker::{EntityDescriptor, HistoryMessage, ParticipantInfo};
use crate::error::BoxError;

/// encodes binary side-data to text so every payload stays json-encodable
pub fn encode_binary(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_binary(text: &str) -> Result<Vec<u8>, BoxError> {
    Ok(STANDARD.decode(text.as_bytes())?)
}

/// payload for one extracted message; datetimes are normalised to rfc-3339
pub fn message_payload(source: &str, message: &HistoryMessage) -> Value {
    json!({
        "channel": source,
        "message_id": message.id,
        "date": message.date.to_rfc3339(),
        "text": message.text,
        "reply_count": message.reply_count,
    })
}

/// payload for one media attachment
pub fn media_payload(source: &str, message: &HistoryMessage) -> Value {
    json!({
        "channel": source,
        "message_id": message.id,
        "date": message.date.to_rfc3339(),
        "media_kind": message.media_kind,
        "media_data": message.media_bytes.as_deref().map(encode_binary),
        "caption": message.text,
    })
}

/// payload for one extracted participant
pub fn participant_payload(source: &str, participant: &ParticipantInfo) -> Value {
    json!({
        "channel": source,
        "user_id": participant.user_id,
        "username": participant.username,
        "first_name": participant.first_name,
        "last_name": participant.last_name,
        "phone": participant.phone,
        "is_bot": participant.is_bot,
    })
}

/// payload describing the community a parse source resolved to
pub fn community_payload(source: &str, entity: &EntityDescriptor) -> Value {
    json!({
        "link": source,
        "platform_id": entity.platform_id,
        "kind": entity.kind.as_str(),
        "username": entity.username,
        "title": entity.title,
    })
}
