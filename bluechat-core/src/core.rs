//! Host-driven API: ChatCore receives user commands, transport events and timer
//! fires from the host, and returns actions for the host to perform.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chunk::{self, Reassembly, Reassembler};
use crate::history::MessageLog;
use crate::protocol::{self, ChatMessage, MessageIdGenerator};
use crate::router::{self, RouteError};
use crate::session::{LinkRole, Peer, SessionConfig, SessionState, TimerId, TimerKind};
use crate::wire::{self, FrameDecodeError};

/// Session owner. Holds the link state, reassembly table, discovered peers and
/// message log; every mutation goes through one of its entry points.
pub struct ChatCore {
    config: SessionConfig,
    state: SessionState,
    role: Option<LinkRole>,
    connected_peer: Option<String>,
    peers: Vec<Peer>,
    reassembler: Reassembler,
    log: MessageLog,
    ids: MessageIdGenerator,
    timers: HashMap<TimerKind, TimerId>,
    timer_generation: u64,
    clock: Box<dyn Fn() -> u64 + Send>,
}

impl ChatCore {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            role: None,
            connected_peer: None,
            peers: Vec::new(),
            reassembler: Reassembler::new(),
            log: MessageLog::new(),
            ids: MessageIdGenerator::new(),
            timers: HashMap::new(),
            timer_generation: 0,
            clock: Box::new(protocol::now_millis),
        }
    }

    /// Replace the millisecond wall clock used for message and frame timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<LinkRole> {
        self.role
    }

    pub fn connected_peer(&self) -> Option<&str> {
        self.connected_peer.as_deref()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.log.entries()
    }

    /// Messages partially received and still waiting for chunks.
    pub fn pending_reassemblies(&self) -> usize {
        self.reassembler.pending()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ---- user operations ----

    pub fn start_scanning(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.state.is_idle() {
            debug!(state = %self.state, "start_scanning ignored");
            return actions;
        }
        self.begin_session();
        self.peers.clear();
        actions.push(Action::PeersChanged);
        actions.push(Action::Transport(TransportCommand::StartScan));
        self.schedule(TimerKind::ScanTimeout, self.config.scan_timeout, &mut actions);
        self.set_state(SessionState::Scanning, &mut actions);
        actions
    }

    pub fn stop_scanning(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != SessionState::Scanning {
            return actions;
        }
        self.cancel(TimerKind::ScanTimeout, &mut actions);
        actions.push(Action::Transport(TransportCommand::StopScan));
        self.set_state(SessionState::Disconnected, &mut actions);
        actions
    }

    pub fn start_advertising(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.state.is_idle() {
            debug!(state = %self.state, "start_advertising ignored");
            return actions;
        }
        self.begin_session();
        self.role = Some(LinkRole::Responder);
        actions.push(Action::Transport(TransportCommand::StartAdvertising));
        self.set_state(SessionState::Advertising, &mut actions);
        actions
    }

    pub fn stop_advertising(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != SessionState::Advertising {
            return actions;
        }
        actions.push(Action::Transport(TransportCommand::StopAdvertising));
        self.role = None;
        self.set_state(SessionState::Disconnected, &mut actions);
        actions
    }

    /// Connect to a peer. Allowed while idle or scanning; scanning stops first.
    pub fn connect(&mut self, peer_id: &str) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.state {
            SessionState::Scanning => {
                self.cancel(TimerKind::ScanTimeout, &mut actions);
                actions.push(Action::Transport(TransportCommand::StopScan));
            }
            s if s.is_idle() => self.begin_session(),
            s => {
                debug!(state = %s, peer = peer_id, "connect ignored");
                return actions;
            }
        }
        self.role = Some(LinkRole::Initiator);
        self.connected_peer = Some(peer_id.to_string());
        actions.push(Action::Transport(TransportCommand::Connect(peer_id.to_string())));
        self.schedule(TimerKind::ConnectTimeout, self.config.connect_timeout, &mut actions);
        self.set_state(SessionState::Connecting, &mut actions);
        actions
    }

    /// Tear down whatever is active and return to Disconnected.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let command = match self.state {
            SessionState::Scanning => Some(TransportCommand::StopScan),
            SessionState::Advertising => Some(TransportCommand::StopAdvertising),
            SessionState::Connecting => self.connected_peer.clone().map(TransportCommand::CancelConnect),
            SessionState::Connected | SessionState::Ready => Some(TransportCommand::Disconnect),
            SessionState::Disconnected | SessionState::Error => None,
        };
        if let Some(command) = command {
            actions.push(Action::Transport(command));
        }
        self.teardown(&mut actions);
        actions
    }

    pub fn send_text(&mut self, text: &str) -> Vec<Action> {
        if let Some(actions) = self.refuse_unless_ready() {
            return actions;
        }
        let id = self.ids.next_id();
        let message = ChatMessage::text(id, text, (self.clock)());
        self.send_message(message)
    }

    pub fn send_image(&mut self, data: Vec<u8>) -> Vec<Action> {
        if let Some(actions) = self.refuse_unless_ready() {
            return actions;
        }
        let id = self.ids.next_id();
        let message = ChatMessage::image(id, data, (self.clock)());
        self.send_message(message)
    }

    pub fn send_video(&mut self, data: Vec<u8>) -> Vec<Action> {
        if let Some(actions) = self.refuse_unless_ready() {
            return actions;
        }
        let id = self.ids.next_id();
        let message = ChatMessage::video(id, data, (self.clock)());
        self.send_message(message)
    }

    // ---- host callbacks ----

    /// Apply one event reported by the transport.
    pub fn on_transport_event(&mut self, event: TransportEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            TransportEvent::Unavailable => {
                warn!(state = %self.state, "radio unavailable");
                self.enter_error(ChatError::TransportUnavailable, &mut actions);
            }
            TransportEvent::PeerDiscovered { id, name } => {
                if self.state != SessionState::Scanning {
                    return actions;
                }
                match self.peers.iter_mut().find(|p| p.id == id) {
                    Some(existing) => existing.name = name,
                    None => {
                        debug!(peer = %id, name = %name, "peer discovered");
                        self.peers.push(Peer { id, name });
                    }
                }
                actions.push(Action::PeersChanged);
            }
            TransportEvent::SubscriberAttached { id } => {
                if self.state != SessionState::Advertising {
                    debug!(state = %self.state, peer = %id, "subscriber ignored");
                    return actions;
                }
                actions.push(Action::Transport(TransportCommand::StopAdvertising));
                self.role = Some(LinkRole::Responder);
                self.connected_peer = Some(id);
                self.set_state(SessionState::Connected, &mut actions);
                self.schedule(TimerKind::ReadyDelay, self.config.ready_delay, &mut actions);
            }
            TransportEvent::LinkEstablished => {
                if self.state != SessionState::Connecting {
                    return actions;
                }
                self.cancel(TimerKind::ConnectTimeout, &mut actions);
                self.set_state(SessionState::Connected, &mut actions);
            }
            TransportEvent::ChannelsReady => {
                if self.role != Some(LinkRole::Initiator) {
                    return actions;
                }
                match self.state {
                    SessionState::Connecting => {
                        self.cancel(TimerKind::ConnectTimeout, &mut actions);
                        self.set_state(SessionState::Connected, &mut actions);
                        self.set_state(SessionState::Ready, &mut actions);
                    }
                    SessionState::Connected => self.set_state(SessionState::Ready, &mut actions),
                    _ => {}
                }
            }
            TransportEvent::ConnectFailed(reason) => {
                warn!(state = %self.state, %reason, "connection failed");
                self.enter_error(ChatError::ConnectionFailed(reason), &mut actions);
            }
            TransportEvent::LinkLost => {
                if self.state.is_idle() {
                    return actions;
                }
                info!(state = %self.state, "link lost");
                self.teardown(&mut actions);
            }
            TransportEvent::FrameReceived(bytes) => self.on_frame_received(&bytes, &mut actions),
        }
        actions
    }

    /// A timer the host scheduled has elapsed. Stale or cancelled timers are no-ops.
    pub fn on_timer(&mut self, timer: TimerId) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.timers.get(&timer.kind) != Some(&timer) {
            debug!(?timer, "stale timer ignored");
            return actions;
        }
        self.timers.remove(&timer.kind);
        match timer.kind {
            TimerKind::ScanTimeout if self.state == SessionState::Scanning => {
                info!("scan timed out");
                actions.push(Action::Transport(TransportCommand::StopScan));
                self.set_state(SessionState::Disconnected, &mut actions);
            }
            TimerKind::ConnectTimeout if self.state == SessionState::Connecting => {
                if let Some(peer) = self.connected_peer.clone() {
                    actions.push(Action::Transport(TransportCommand::CancelConnect(peer)));
                }
                self.enter_error(
                    ChatError::ConnectionFailed("connection timed out".to_string()),
                    &mut actions,
                );
            }
            TimerKind::ReadyDelay
                if self.state == SessionState::Connected
                    && self.role == Some(LinkRole::Responder) =>
            {
                self.set_state(SessionState::Ready, &mut actions);
            }
            _ => {}
        }
        actions
    }

    // ---- internals ----

    fn on_frame_received(&mut self, bytes: &[u8], actions: &mut Vec<Action>) {
        if !self.state.accepts_frames() {
            debug!(state = %self.state, len = bytes.len(), "frame outside connection dropped");
            return;
        }
        let frame = match wire::decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "frame dropped");
                let err = if e.is_integrity() {
                    ChatError::Integrity(e)
                } else {
                    ChatError::Format(e)
                };
                actions.push(Action::Error(err));
                return;
            }
        };
        let header = frame.header;
        let complete = match self.reassembler.ingest(&header, frame.payload) {
            Reassembly::Complete(complete) => complete,
            Reassembly::Incomplete => return,
        };
        let message = match router::decode_message(complete.message_type, &complete.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_id = complete.message_id, error = %e, "message dropped");
                actions.push(Action::Error(ChatError::InvalidData(e)));
                return;
            }
        };
        if self.log.append_inbound(message.clone()) {
            info!(message_id = message.id, kind = %message.kind, "message received");
            actions.push(Action::MessageAppended(message));
        } else {
            debug!(message_id = message.id, "duplicate message suppressed");
        }
    }

    fn refuse_unless_ready(&self) -> Option<Vec<Action>> {
        if self.state == SessionState::Ready {
            return None;
        }
        debug!(state = %self.state, "send refused");
        Some(vec![Action::Error(ChatError::NotReady(self.state))])
    }

    fn send_message(&mut self, message: ChatMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        let encoded = match router::encode_message(&message) {
            Ok(encoded) => encoded,
            Err(e) => {
                actions.push(Action::Error(ChatError::Encode(e.to_string())));
                return actions;
            }
        };
        let clock = &self.clock;
        let frames = match chunk::split_into_frames(
            message.id,
            encoded.message_type,
            &encoded.payload,
            self.config.chunk_size(),
            &|| clock(),
        ) {
            Ok(frames) => frames,
            Err(e) => {
                actions.push(Action::Error(ChatError::Encode(e.to_string())));
                return actions;
            }
        };
        let mut wire_frames = Vec::with_capacity(frames.len());
        for frame in &frames {
            match frame.encode() {
                Ok(bytes) => wire_frames.push(bytes),
                Err(e) => {
                    actions.push(Action::Error(ChatError::Encode(e.to_string())));
                    return actions;
                }
            }
        }
        info!(
            message_id = message.id,
            kind = %message.kind,
            bytes = encoded.payload.len(),
            chunks = wire_frames.len(),
            "message sent"
        );
        actions.extend(
            wire_frames
                .into_iter()
                .map(|bytes| Action::Transport(TransportCommand::Send(bytes))),
        );
        if self.log.append_outbound(message.clone()) {
            actions.push(Action::MessageAppended(message));
        }
        actions
    }

    fn begin_session(&mut self) {
        self.reassembler.clear();
        self.connected_peer = None;
        self.role = None;
    }

    fn teardown(&mut self, actions: &mut Vec<Action>) {
        self.cancel_all(actions);
        self.reassembler.clear();
        if !self.peers.is_empty() {
            self.peers.clear();
            actions.push(Action::PeersChanged);
        }
        self.connected_peer = None;
        self.role = None;
        self.set_state(SessionState::Disconnected, actions);
    }

    fn enter_error(&mut self, error: ChatError, actions: &mut Vec<Action>) {
        self.cancel_all(actions);
        self.set_state(SessionState::Error, actions);
        actions.push(Action::Error(error));
    }

    fn set_state(&mut self, next: SessionState, actions: &mut Vec<Action>) {
        if self.state == next {
            return;
        }
        info!(from = %self.state, to = %next, "session state");
        self.state = next;
        actions.push(Action::StateChanged(next));
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration, actions: &mut Vec<Action>) {
        self.cancel(kind, actions);
        self.timer_generation += 1;
        let timer = TimerId {
            kind,
            generation: self.timer_generation,
        };
        self.timers.insert(kind, timer);
        actions.push(Action::ScheduleTimer { timer, after });
    }

    fn cancel(&mut self, kind: TimerKind, actions: &mut Vec<Action>) {
        if let Some(timer) = self.timers.remove(&kind) {
            actions.push(Action::CancelTimer(timer));
        }
    }

    fn cancel_all(&mut self, actions: &mut Vec<Action>) {
        let mut armed: Vec<TimerId> = self.timers.drain().map(|(_, t)| t).collect();
        armed.sort_by_key(|t| t.generation);
        actions.extend(armed.into_iter().map(Action::CancelTimer));
    }
}

impl Default for ChatCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Instruction for the radio transport. Fire and forget; the core does not wait on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    StartScan,
    StopScan,
    StartAdvertising,
    StopAdvertising,
    Connect(String),
    CancelConnect(String),
    Disconnect,
    /// One encoded frame. Frames of a message are issued in chunk order.
    Send(Vec<u8>),
}

/// Something the transport observed, delivered to the core by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Radio is off, unsupported or not authorized.
    Unavailable,
    PeerDiscovered { id: String, name: String },
    /// Advertising side: a remote peer subscribed to the notification channel.
    SubscriberAttached { id: String },
    /// Initiating side: the link is up.
    LinkEstablished,
    /// Initiating side: channels discovered and notifications subscribed.
    ChannelsReady,
    ConnectFailed(String),
    LinkLost,
    /// One frame-sized unit read off the link.
    FrameReceived(Vec<u8>),
}

/// Action for host to perform.
#[derive(Debug)]
pub enum Action {
    Transport(TransportCommand),
    /// Arm a one-shot timer and call `on_timer` with it once `after` elapses.
    ScheduleTimer { timer: TimerId, after: Duration },
    CancelTimer(TimerId),
    StateChanged(SessionState),
    /// Discovered-peer list changed; read it from `peers()`.
    PeersChanged,
    MessageAppended(ChatMessage),
    Error(ChatError),
}

/// Which of the application's error hooks an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Bluetooth,
    Connection,
    Data,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("bluetooth unavailable")]
    TransportUnavailable,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("integrity check failed: {0}")]
    Integrity(#[source] FrameDecodeError),
    #[error("malformed frame: {0}")]
    Format(#[source] FrameDecodeError),
    #[error("invalid message data: {0}")]
    InvalidData(#[source] RouteError),
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("cannot send while {0}")]
    NotReady(SessionState),
}

impl ChatError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::TransportUnavailable => ErrorCategory::Bluetooth,
            ChatError::ConnectionFailed(_) => ErrorCategory::Connection,
            _ => ErrorCategory::Data,
        }
    }
}
