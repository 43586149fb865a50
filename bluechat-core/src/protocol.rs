//! BlueChat wire protocol: constants, frame message types, and the chat message model.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Current protocol version. Written into every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum transmissible unit of the radio link (ATT MTU).
pub const DEFAULT_MTU: usize = 517;

/// Fixed frame header length in bytes.
pub const HEADER_LEN: usize = 25;

/// Largest payload a single frame may carry: MTU minus header.
pub const MAX_PAYLOAD_SIZE: usize = DEFAULT_MTU - HEADER_LEN;

/// Frame-level message type byte. Values are part of the wire format.
///
/// `Control`, `Ack`, `Heartbeat` and the `Call*` types are reserved: they decode
/// from the wire but nothing in the engine produces them.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text = 0x01,
    Image = 0x02,
    Video = 0x03,
    Audio = 0x04,
    File = 0x05,
    Control = 0x06,
    Ack = 0x07,
    Heartbeat = 0x08,
    CallRequest = 0x09,
    CallResponse = 0x0A,
    CallEnd = 0x0B,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether payloads of this type use the length-prefixed metadata + binary layout.
    pub fn is_media(self) -> bool {
        matches!(self, MessageType::Image | MessageType::Video)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Text),
            0x02 => Ok(MessageType::Image),
            0x03 => Ok(MessageType::Video),
            0x04 => Ok(MessageType::Audio),
            0x05 => Ok(MessageType::File),
            0x06 => Ok(MessageType::Control),
            0x07 => Ok(MessageType::Ack),
            0x08 => Ok(MessageType::Heartbeat),
            0x09 => Ok(MessageType::CallRequest),
            0x0A => Ok(MessageType::CallResponse),
            0x0B => Ok(MessageType::CallEnd),
            other => Err(other),
        }
    }
}

/// Application-level chat message kind. Serialized as a lowercase tag,
/// parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatMessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
}

impl ChatMessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMessageType::Text => "text",
            ChatMessageType::Image => "image",
            ChatMessageType::Video => "video",
            ChatMessageType::Audio => "audio",
            ChatMessageType::File => "file",
        }
    }

    /// Frame type used to carry a message of this kind. Anything that is not
    /// image or video travels on the text path.
    pub fn wire_type(self) -> MessageType {
        match self {
            ChatMessageType::Image => MessageType::Image,
            ChatMessageType::Video => MessageType::Video,
            _ => MessageType::Text,
        }
    }
}

impl fmt::Display for ChatMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised chat message type tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chat message type {0:?}")]
pub struct UnknownChatType(pub String);

impl FromStr for ChatMessageType {
    type Err = UnknownChatType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(ChatMessageType::Text),
            "image" => Ok(ChatMessageType::Image),
            "video" => Ok(ChatMessageType::Video),
            "audio" => Ok(ChatMessageType::Audio),
            "file" => Ok(ChatMessageType::File),
            _ => Err(UnknownChatType(s.to_string())),
        }
    }
}

impl Serialize for ChatMessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChatMessageType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(d)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

/// A chat message as shown in the message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: u32,
    pub kind: ChatMessageType,
    /// Text body, or a short label for media messages.
    pub content: String,
    pub image_data: Option<Vec<u8>>,
    pub video_data: Option<Vec<u8>>,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Set locally. Always false for anything decoded off the wire.
    pub is_from_current_user: bool,
}

impl ChatMessage {
    pub fn text(id: u32, content: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id,
            kind: ChatMessageType::Text,
            content: content.into(),
            image_data: None,
            video_data: None,
            timestamp,
            is_from_current_user: true,
        }
    }

    pub fn image(id: u32, data: Vec<u8>, timestamp: u64) -> Self {
        Self {
            id,
            kind: ChatMessageType::Image,
            content: IMAGE_LABEL.to_string(),
            image_data: Some(data),
            video_data: None,
            timestamp,
            is_from_current_user: true,
        }
    }

    pub fn video(id: u32, data: Vec<u8>, timestamp: u64) -> Self {
        Self {
            id,
            kind: ChatMessageType::Video,
            content: VIDEO_LABEL.to_string(),
            image_data: None,
            video_data: Some(data),
            timestamp,
            is_from_current_user: true,
        }
    }

    /// Binary media attached to this message, if any.
    pub fn media(&self) -> Option<&[u8]> {
        match self.kind {
            ChatMessageType::Image => self.image_data.as_deref(),
            ChatMessageType::Video => self.video_data.as_deref(),
            _ => None,
        }
    }
}

/// Content label for outbound photos.
pub const IMAGE_LABEL: &str = "Photo";
/// Content label for outbound videos.
pub const VIDEO_LABEL: &str = "Video";

/// Bit reserved on locally coined message ids.
pub const LOCAL_ID_BIT: u32 = 0x8000_0000;

/// Monotonic message id source for locally authored messages. Ids carry
/// `LOCAL_ID_BIT` so they never collide with peer ids that leave it clear.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    counter: u32,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        self.counter = self.counter.wrapping_add(1) & !LOCAL_ID_BIT;
        LOCAL_ID_BIT | self.counter
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
