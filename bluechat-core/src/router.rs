//! Message router: chat message <-> type-tagged payload.
//!
//! Text (and every non-media kind) travels as a JSON object with a fixed field
//! order. Image and video travel as `[u16 BE metadata length][metadata JSON][raw media]`,
//! where every metadata value is a JSON string. Both layouts are shared with
//! other implementations and must not change.

use serde::{Deserialize, Serialize};

use crate::protocol::{ChatMessage, ChatMessageType, MessageType};

/// Length of the media metadata prefix.
const METADATA_LEN_SIZE: usize = 2;

#[derive(Debug, Serialize, Deserialize)]
struct TextEnvelope {
    id: u32,
    #[serde(rename = "type")]
    kind: ChatMessageType,
    content: String,
    timestamp: u64,
    #[serde(rename = "isFromCurrentUser")]
    is_from_current_user: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct MediaMetadata {
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    content: String,
    timestamp: String,
    #[serde(rename = "isFromCurrentUser", default)]
    is_from_current_user: String,
}

/// A chat message ready for the fragmenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

/// Encode a chat message into its frame type and payload bytes.
pub fn encode_message(message: &ChatMessage) -> Result<EncodedMessage, RouteError> {
    match message.kind.wire_type() {
        MessageType::Image => encode_media(message, MessageType::Image, message.image_data.as_deref()),
        MessageType::Video => encode_media(message, MessageType::Video, message.video_data.as_deref()),
        _ => {
            let envelope = TextEnvelope {
                id: message.id,
                kind: message.kind,
                content: message.content.clone(),
                timestamp: message.timestamp,
                is_from_current_user: message.is_from_current_user,
            };
            Ok(EncodedMessage {
                message_type: MessageType::Text,
                payload: serde_json::to_vec(&envelope)?,
            })
        }
    }
}

fn encode_media(
    message: &ChatMessage,
    message_type: MessageType,
    media: Option<&[u8]>,
) -> Result<EncodedMessage, RouteError> {
    let metadata = MediaMetadata {
        id: message.id.to_string(),
        kind: message.kind.to_string(),
        content: message.content.clone(),
        timestamp: message.timestamp.to_string(),
        is_from_current_user: message.is_from_current_user.to_string(),
    };
    let json = serde_json::to_vec(&metadata)?;
    let len = u16::try_from(json.len()).map_err(|_| RouteError::MetadataTooLarge(json.len()))?;
    let media = media.unwrap_or_default();

    let mut payload = Vec::with_capacity(METADATA_LEN_SIZE + json.len() + media.len());
    payload.extend_from_slice(&len.to_be_bytes());
    payload.extend_from_slice(&json);
    payload.extend_from_slice(media);
    Ok(EncodedMessage {
        message_type,
        payload,
    })
}

/// Decode a reassembled payload by its frame type. The result is always marked
/// as not from the current user.
pub fn decode_message(message_type: MessageType, payload: &[u8]) -> Result<ChatMessage, RouteError> {
    match message_type {
        MessageType::Image => decode_media(ChatMessageType::Image, payload),
        MessageType::Video => decode_media(ChatMessageType::Video, payload),
        _ => {
            let envelope: TextEnvelope = serde_json::from_slice(payload)?;
            Ok(ChatMessage {
                id: envelope.id,
                kind: envelope.kind,
                content: envelope.content,
                image_data: None,
                video_data: None,
                timestamp: envelope.timestamp,
                is_from_current_user: false,
            })
        }
    }
}

fn decode_media(kind: ChatMessageType, payload: &[u8]) -> Result<ChatMessage, RouteError> {
    if payload.len() < METADATA_LEN_SIZE {
        return Err(RouteError::MissingMetadataLength(payload.len()));
    }
    let len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let end = METADATA_LEN_SIZE + len;
    if payload.len() < end {
        return Err(RouteError::MetadataTruncated {
            declared: len,
            available: payload.len() - METADATA_LEN_SIZE,
        });
    }
    let json =
        std::str::from_utf8(&payload[METADATA_LEN_SIZE..end]).map_err(|_| RouteError::MetadataNotUtf8)?;
    let metadata: MediaMetadata = serde_json::from_str(json)?;
    let id = metadata
        .id
        .parse::<u32>()
        .map_err(|_| RouteError::BadNumber {
            field: "id",
            value: metadata.id.clone(),
        })?;
    let timestamp = metadata
        .timestamp
        .parse::<u64>()
        .map_err(|_| RouteError::BadNumber {
            field: "timestamp",
            value: metadata.timestamp.clone(),
        })?;

    let media = payload[end..].to_vec();
    let (image_data, video_data) = match kind {
        ChatMessageType::Video => (None, Some(media)),
        _ => (Some(media), None),
    };
    Ok(ChatMessage {
        id,
        kind,
        content: metadata.content,
        image_data,
        video_data,
        timestamp,
        is_from_current_user: false,
    })
}

/// A payload that cannot be turned into a chat message (or vice versa).
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("media payload of {0} bytes has no metadata length")]
    MissingMetadataLength(usize),
    #[error("metadata declares {declared} bytes, only {available} present")]
    MetadataTruncated { declared: usize, available: usize },
    #[error("metadata is not valid UTF-8")]
    MetadataNotUtf8,
    #[error("metadata of {0} bytes does not fit the length prefix")]
    MetadataTooLarge(usize),
    #[error("field {field} is not a number: {value:?}")]
    BadNumber { field: &'static str, value: String },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
