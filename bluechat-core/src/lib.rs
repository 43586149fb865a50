//! BlueChat wire protocol engine.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod chunk;
pub mod core;
pub mod history;
pub mod integrity;
pub mod protocol;
pub mod router;
pub mod session;
pub mod wire;

pub use crate::core::{
    Action, ChatCore, ChatError, ErrorCategory, TransportCommand, TransportEvent,
};
pub use chunk::{split_into_frames, CompleteMessage, Reassembler, Reassembly};
pub use history::{MessageKey, MessageLog};
pub use protocol::{
    ChatMessage, ChatMessageType, MessageType, HEADER_LEN, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
pub use router::{decode_message, encode_message, EncodedMessage, RouteError};
pub use session::{LinkRole, Peer, SessionConfig, SessionState, TimerId, TimerKind};
pub use wire::{decode_frame, decode_header, encode_header, Frame, FrameDecodeError, FrameEncodeError, FrameHeader};
