//! Session actor: one task owns the `ChatCore` and drains a single event queue.
//!
//! User commands, transport callbacks and timer fires all arrive as
//! `EngineEvent`s on the same unbounded channel, so every mutation of session
//! state is serialized without locking the core.

use std::collections::HashMap;

use bluechat_core::{
    Action, ChatCore, ChatError, ChatMessage, Peer, SessionState, TimerId, TransportEvent,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Operations the application may request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartScanning,
    StopScanning,
    StartAdvertising,
    StopAdvertising,
    Connect(String),
    Disconnect,
    SendText(String),
    SendImage(Vec<u8>),
    SendVideo(Vec<u8>),
}

/// Everything the engine task reacts to.
#[derive(Debug)]
pub enum EngineEvent {
    Command(Command),
    Transport(TransportEvent),
    Timer(TimerId),
    Shutdown,
}

/// What the application sees.
#[derive(Debug)]
pub enum Update {
    State(SessionState),
    Peers(Vec<Peer>),
    Message(ChatMessage),
    Error(ChatError),
}

/// Cloneable front door to a running engine. Sends never block; they return
/// false once the engine has stopped.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    /// Queue that transports post their events to.
    pub fn event_sink(&self) -> mpsc::UnboundedSender<EngineEvent> {
        self.tx.clone()
    }

    pub fn send(&self, command: Command) -> bool {
        self.tx.send(EngineEvent::Command(command)).is_ok()
    }

    pub fn start_scanning(&self) -> bool {
        self.send(Command::StartScanning)
    }

    pub fn stop_scanning(&self) -> bool {
        self.send(Command::StopScanning)
    }

    pub fn start_advertising(&self) -> bool {
        self.send(Command::StartAdvertising)
    }

    pub fn stop_advertising(&self) -> bool {
        self.send(Command::StopAdvertising)
    }

    pub fn connect(&self, peer_id: impl Into<String>) -> bool {
        self.send(Command::Connect(peer_id.into()))
    }

    pub fn disconnect(&self) -> bool {
        self.send(Command::Disconnect)
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Command::SendText(text.into()))
    }

    pub fn send_image(&self, data: Vec<u8>) -> bool {
        self.send(Command::SendImage(data))
    }

    pub fn send_video(&self, data: Vec<u8>) -> bool {
        self.send(Command::SendVideo(data))
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(EngineEvent::Shutdown).is_ok()
    }
}

/// Create the engine queue. Hand the receiver to `run_engine`; attach
/// transports to `handle.event_sink()` first.
pub fn channel() -> (EngineHandle, mpsc::UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EngineHandle { tx }, rx)
}

/// Drive `core` until shutdown or until every handle is dropped.
pub async fn run_engine<T: Transport>(
    mut core: ChatCore,
    mut transport: T,
    handle: EngineHandle,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    updates: mpsc::UnboundedSender<Update>,
) {
    let mut timers: HashMap<TimerId, JoinHandle<()>> = HashMap::new();

    while let Some(event) = events.recv().await {
        let actions = match event {
            EngineEvent::Command(command) => apply_command(&mut core, command),
            EngineEvent::Transport(event) => core.on_transport_event(event),
            EngineEvent::Timer(timer) => {
                timers.remove(&timer);
                core.on_timer(timer)
            }
            EngineEvent::Shutdown => break,
        };

        for action in actions {
            match action {
                Action::Transport(command) => transport.execute(command),
                Action::ScheduleTimer { timer, after } => {
                    let tx = handle.event_sink();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(EngineEvent::Timer(timer));
                    });
                    if let Some(previous) = timers.insert(timer, task) {
                        previous.abort();
                    }
                }
                Action::CancelTimer(timer) => {
                    if let Some(task) = timers.remove(&timer) {
                        task.abort();
                    }
                }
                Action::StateChanged(state) => {
                    let _ = updates.send(Update::State(state));
                }
                Action::PeersChanged => {
                    let _ = updates.send(Update::Peers(core.peers().to_vec()));
                }
                Action::MessageAppended(message) => {
                    let _ = updates.send(Update::Message(message));
                }
                Action::Error(error) => {
                    warn!(category = ?error.category(), %error, "engine error");
                    let _ = updates.send(Update::Error(error));
                }
            }
        }
    }

    debug!(pending = timers.len(), "engine stopped");
    for (_, task) in timers {
        task.abort();
    }
}

fn apply_command(core: &mut ChatCore, command: Command) -> Vec<Action> {
    match command {
        Command::StartScanning => core.start_scanning(),
        Command::StopScanning => core.stop_scanning(),
        Command::StartAdvertising => core.start_advertising(),
        Command::StopAdvertising => core.stop_advertising(),
        Command::Connect(peer) => core.connect(&peer),
        Command::Disconnect => core.disconnect(),
        Command::SendText(text) => core.send_text(&text),
        Command::SendImage(data) => core.send_image(data),
        Command::SendVideo(data) => core.send_video(data),
    }
}
