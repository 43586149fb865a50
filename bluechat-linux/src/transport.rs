//! Transport seam and an in-process loopback radio.
//!
//! A `Transport` executes the engine's radio commands without blocking and
//! reports what it observes by posting `TransportEvent`s onto the owning
//! engine's queue, from whatever thread it happens to run on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bluechat_core::{TransportCommand, TransportEvent};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::engine::EngineEvent;

/// Radio operations the engine drives. Fire and forget.
pub trait Transport: Send + 'static {
    fn execute(&mut self, command: TransportCommand);
}

type EventSink = mpsc::UnboundedSender<EngineEvent>;

struct Node {
    name: String,
    sink: EventSink,
    powered: bool,
    scanning: bool,
    advertising: bool,
    link: Option<String>,
}

impl Node {
    fn post(&self, event: TransportEvent) {
        let _ = self.sink.send(EngineEvent::Transport(event));
    }
}

/// Shared medium joining loopback transports. Advertising nodes are visible to
/// scanning nodes; a connection links exactly two nodes and carries frames verbatim.
#[derive(Clone, Default)]
pub struct LoopbackRadio {
    nodes: Arc<Mutex<HashMap<String, Node>>>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the node table, recovering it if a holder panicked.
    fn nodes(&self) -> MutexGuard<'_, HashMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|poisoned| {
            warn!("loopback node table lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Add a node to the medium. Events for it are posted to `sink`.
    pub fn attach(&self, name: impl Into<String>, sink: EventSink) -> LoopbackTransport {
        let id = uuid::Uuid::new_v4().to_string();
        let node = Node {
            name: name.into(),
            sink,
            powered: true,
            scanning: false,
            advertising: false,
            link: None,
        };
        self.nodes().insert(id.clone(), node);
        LoopbackTransport {
            id,
            radio: self.clone(),
        }
    }

    /// Switch a node's radio on or off. Turning it off drops any link it holds.
    pub fn set_powered(&self, id: &str, on: bool) {
        let mut nodes = self.nodes();
        let link = match nodes.get_mut(id) {
            Some(node) => {
                node.powered = on;
                if on {
                    return;
                }
                node.scanning = false;
                node.advertising = false;
                node.post(TransportEvent::Unavailable);
                node.link.take()
            }
            None => return,
        };
        Self::drop_link(&mut nodes, link);
    }

    /// Clear the far end of a link that was just taken down and tell it so.
    fn drop_link(nodes: &mut HashMap<String, Node>, far_end: Option<String>) {
        let Some(id) = far_end else {
            return;
        };
        if let Some(other) = nodes.get_mut(&id) {
            other.link = None;
            other.post(TransportEvent::LinkLost);
        }
    }

    fn execute(&self, from: &str, command: TransportCommand) {
        let mut nodes = self.nodes();
        let powered = match nodes.get(from) {
            Some(node) => node.powered,
            None => return,
        };
        if !powered {
            if !matches!(command, TransportCommand::Send(_)) {
                if let Some(node) = nodes.get(from) {
                    node.post(TransportEvent::Unavailable);
                }
            }
            return;
        }

        match command {
            TransportCommand::StartScan => {
                if let Some(node) = nodes.get_mut(from) {
                    node.scanning = true;
                }
                let visible: Vec<(String, String)> = nodes
                    .iter()
                    .filter(|(id, n)| id.as_str() != from && n.advertising)
                    .map(|(id, n)| (id.clone(), n.name.clone()))
                    .collect();
                if let Some(node) = nodes.get(from) {
                    for (id, name) in visible {
                        node.post(TransportEvent::PeerDiscovered { id, name });
                    }
                }
            }
            TransportCommand::StopScan => {
                if let Some(node) = nodes.get_mut(from) {
                    node.scanning = false;
                }
            }
            TransportCommand::StartAdvertising => {
                let name = match nodes.get_mut(from) {
                    Some(node) => {
                        node.advertising = true;
                        node.name.clone()
                    }
                    None => return,
                };
                for (id, n) in nodes.iter() {
                    if id != from && n.scanning {
                        n.post(TransportEvent::PeerDiscovered {
                            id: from.to_string(),
                            name: name.clone(),
                        });
                    }
                }
            }
            TransportCommand::StopAdvertising => {
                if let Some(node) = nodes.get_mut(from) {
                    node.advertising = false;
                }
            }
            TransportCommand::Connect(peer) => {
                let reachable = nodes
                    .get(&peer)
                    .map(|n| n.powered && n.advertising && n.link.is_none())
                    .unwrap_or(false);
                if !reachable || peer == from {
                    // Attempt stays pending until the engine's connect timeout.
                    debug!(from, peer = %peer, "loopback connect target unreachable");
                    return;
                }
                if let Some(target) = nodes.get_mut(&peer) {
                    target.link = Some(from.to_string());
                    target.post(TransportEvent::SubscriberAttached {
                        id: from.to_string(),
                    });
                }
                if let Some(node) = nodes.get_mut(from) {
                    node.scanning = false;
                    node.link = Some(peer);
                    node.post(TransportEvent::LinkEstablished);
                    node.post(TransportEvent::ChannelsReady);
                }
            }
            TransportCommand::CancelConnect(_) => {}
            TransportCommand::Disconnect => {
                let link = nodes.get_mut(from).and_then(|n| n.link.take());
                Self::drop_link(&mut nodes, link);
            }
            TransportCommand::Send(frame) => {
                let link = nodes.get(from).and_then(|n| n.link.clone());
                match link.as_ref().and_then(|l| nodes.get(l)) {
                    Some(other) => {
                        trace!(from, len = frame.len(), "loopback frame");
                        other.post(TransportEvent::FrameReceived(frame));
                    }
                    None => debug!(from, "loopback send without link dropped"),
                }
            }
        }
    }
}

/// One node's handle on a `LoopbackRadio`.
pub struct LoopbackTransport {
    id: String,
    radio: LoopbackRadio,
}

impl LoopbackTransport {
    /// Identifier other nodes see in discovery and connect to.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Transport for LoopbackTransport {
    fn execute(&mut self, command: TransportCommand) {
        self.radio.execute(&self.id, command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_events(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::Transport(t) = ev {
                out.push(t);
            }
        }
        out
    }

    #[test]
    fn scanner_discovers_advertiser_either_order() {
        let radio = LoopbackRadio::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut a = radio.attach("alice", tx_a);
        let mut b = radio.attach("bob", tx_b);

        b.execute(TransportCommand::StartScan);
        a.execute(TransportCommand::StartAdvertising);
        assert_eq!(
            transport_events(&mut rx_b),
            vec![TransportEvent::PeerDiscovered {
                id: a.id().to_string(),
                name: "alice".into()
            }]
        );

        b.execute(TransportCommand::StopScan);
        b.execute(TransportCommand::StartScan);
        assert_eq!(transport_events(&mut rx_b).len(), 1);
        assert!(transport_events(&mut rx_a).is_empty());
    }

    #[test]
    fn connect_links_both_sides_and_carries_frames() {
        let radio = LoopbackRadio::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut a = radio.attach("alice", tx_a);
        let mut b = radio.attach("bob", tx_b);
        a.execute(TransportCommand::StartAdvertising);
        b.execute(TransportCommand::Connect(a.id().to_string()));

        assert_eq!(
            transport_events(&mut rx_a),
            vec![TransportEvent::SubscriberAttached {
                id: b.id().to_string()
            }]
        );
        assert_eq!(
            transport_events(&mut rx_b),
            vec![TransportEvent::LinkEstablished, TransportEvent::ChannelsReady]
        );

        b.execute(TransportCommand::Send(vec![1, 2, 3]));
        assert_eq!(
            transport_events(&mut rx_a),
            vec![TransportEvent::FrameReceived(vec![1, 2, 3])]
        );

        a.execute(TransportCommand::Disconnect);
        assert_eq!(transport_events(&mut rx_b), vec![TransportEvent::LinkLost]);
        b.execute(TransportCommand::Send(vec![4]));
        assert!(transport_events(&mut rx_a).is_empty());
    }

    #[test]
    fn connect_to_unknown_peer_stays_silent() {
        let radio = LoopbackRadio::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut a = radio.attach("alice", tx);
        a.execute(TransportCommand::Connect("nobody".into()));
        assert!(transport_events(&mut rx).is_empty());
    }

    #[test]
    fn radio_keeps_working_after_a_panic_under_the_lock() {
        let radio = LoopbackRadio::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut a = radio.attach("alice", tx_a);
        let mut b = radio.attach("bob", tx_b);

        let shared = radio.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = shared.nodes.lock().unwrap();
            panic!("crash while holding the node table");
        })
        .join();
        assert!(crashed.is_err());
        assert!(radio.nodes.is_poisoned());

        a.execute(TransportCommand::StartAdvertising);
        b.execute(TransportCommand::StartScan);
        assert_eq!(
            transport_events(&mut rx_b),
            vec![TransportEvent::PeerDiscovered {
                id: a.id().to_string(),
                name: "alice".into()
            }]
        );
    }

    #[test]
    fn powered_off_radio_reports_unavailable() {
        let radio = LoopbackRadio::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut a = radio.attach("alice", tx);
        radio.set_powered(a.id(), false);
        assert_eq!(transport_events(&mut rx), vec![TransportEvent::Unavailable]);
        a.execute(TransportCommand::StartScan);
        assert_eq!(transport_events(&mut rx), vec![TransportEvent::Unavailable]);
    }
}
