//! Session vocabulary: link states, roles, timers, and tunables.

use std::fmt;
use std::time::Duration;

use crate::chunk::chunk_size_for_mtu;
use crate::protocol::DEFAULT_MTU;

/// Link lifecycle state. Exactly one session exists at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Scanning,
    Advertising,
    Connecting,
    Connected,
    Ready,
    Error,
}

impl SessionState {
    /// States in which inbound frames are processed.
    pub fn accepts_frames(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Ready)
    }

    /// States an explicit user action may start a new session from.
    pub fn is_idle(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Scanning => "scanning",
            SessionState::Advertising => "advertising",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Which end of the link this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Scanned and connected. Ready once its channels are discovered and subscribed.
    Initiator,
    /// Advertised and was subscribed to. Ready a fixed delay after the subscription.
    Responder,
}

/// A peer seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ScanTimeout,
    ConnectTimeout,
    ReadyDelay,
}

/// One armed timer. A fire carrying a stale generation is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Session tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Scanning stops on its own after this long.
    pub scan_timeout: Duration,
    /// A connection attempt not confirmed within this long fails.
    pub connect_timeout: Duration,
    /// Responder-side pause between Connected and Ready.
    pub ready_delay: Duration,
    /// Link MTU; frames never exceed it.
    pub mtu: usize,
}

impl SessionConfig {
    pub fn chunk_size(&self) -> usize {
        chunk_size_for_mtu(self.mtu)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_millis(30_000),
            connect_timeout: Duration::from_millis(10_000),
            ready_delay: Duration::from_millis(500),
            mtu: DEFAULT_MTU,
        }
    }
}
