// BlueChat Linux: two loopback nodes and a terminal chat between them.

mod config;
mod engine;
mod transport;

use std::path::PathBuf;

use anyhow::Context;
use bluechat_core::{ChatCore, SessionState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use engine::{EngineHandle, Update};
use transport::LoopbackRadio;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("bluechat-linux {}", VERSION);
            return Ok(());
        }
    }

    let filter = std::env::var("BLUECHAT_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load()?;
    info!(?cfg, "config loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let radio = LoopbackRadio::new();
        let Node {
            handle: responder,
            updates: mut responder_updates,
            ..
        } = spawn_node(&radio, &cfg, &cfg.display_name);
        let Node {
            handle: initiator,
            updates: mut initiator_updates,
            id: initiator_id,
        } = spawn_node(&radio, &cfg, "terminal");

        responder.start_advertising();
        initiator.start_scanning();
        let peer = loop {
            match initiator_updates.recv().await {
                Some(Update::Peers(peers)) if !peers.is_empty() => break peers[0].clone(),
                Some(Update::State(SessionState::Disconnected)) => {
                    anyhow::bail!("no peer found before scan timeout")
                }
                Some(_) => {}
                None => anyhow::bail!("engine stopped"),
            }
        };
        info!(peer = %peer.name, "connecting");
        initiator.connect(peer.id);
        loop {
            match initiator_updates.recv().await {
                Some(Update::State(SessionState::Ready)) => break,
                Some(Update::Error(e)) => anyhow::bail!("connect failed: {e}"),
                Some(_) => {}
                None => anyhow::bail!("engine stopped"),
            }
        }
        println!("connected to {}; type to chat, /quit to leave", peer.name);

        tokio::spawn(async move {
            while let Some(update) = responder_updates.recv().await {
                print_update("peer", update);
            }
        });
        tokio::spawn(async move {
            while let Some(update) = initiator_updates.recv().await {
                print_update("you", update);
            }
        });

        tokio::select! {
            r = chat_loop(&initiator, &radio, &initiator_id) => r?,
            _ = shutdown_signal() => {}
        }
        initiator.disconnect();
        initiator.shutdown();
        responder.shutdown();
        Ok::<(), anyhow::Error>(())
    })
}

struct Node {
    handle: EngineHandle,
    updates: mpsc::UnboundedReceiver<Update>,
    id: String,
}

fn spawn_node(radio: &LoopbackRadio, cfg: &config::Config, name: &str) -> Node {
    let (handle, events) = engine::channel();
    let transport = radio.attach(name, handle.event_sink());
    let id = transport.id().to_string();
    let (updates_tx, updates) = mpsc::unbounded_channel();
    let core = ChatCore::with_config(cfg.session());
    info!(
        node = name,
        id = %id,
        chunk_size = core.config().chunk_size(),
        "node attached"
    );
    tokio::spawn(engine::run_engine(
        core,
        transport,
        handle.clone(),
        events,
        updates_tx,
    ));
    Node {
        handle,
        updates,
        id,
    }
}

/// One line of terminal input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Text(String),
    Image(PathBuf),
    Video(PathBuf),
    Scan,
    StopScan,
    Advertise,
    StopAdvertise,
    Connect(String),
    Disconnect,
    Radio(bool),
    Quit,
    Unknown(String),
}

fn parse_line(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if !line.starts_with('/') {
        return Some(Input::Text(line.to_string()));
    }
    let (cmd, arg) = match line.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };
    let input = match (cmd, arg) {
        ("/image", path) if !path.is_empty() => Input::Image(PathBuf::from(path)),
        ("/video", path) if !path.is_empty() => Input::Video(PathBuf::from(path)),
        ("/scan", "") => Input::Scan,
        ("/stopscan", "") => Input::StopScan,
        ("/advertise", "") => Input::Advertise,
        ("/stopadvertise", "") => Input::StopAdvertise,
        ("/connect", peer) if !peer.is_empty() => Input::Connect(peer.to_string()),
        ("/disconnect", "") => Input::Disconnect,
        ("/radio", "on") => Input::Radio(true),
        ("/radio", "off") => Input::Radio(false),
        ("/quit", "") => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    };
    Some(input)
}

/// Relay stdin to the local node until EOF or `/quit`.
async fn chat_loop(node: &EngineHandle, radio: &LoopbackRadio, id: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(input) = parse_line(&line) else {
            continue;
        };
        match input {
            Input::Text(text) => {
                node.send_text(text);
            }
            Input::Image(path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                node.send_image(data);
            }
            Input::Video(path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                node.send_video(data);
            }
            Input::Scan => {
                node.start_scanning();
            }
            Input::StopScan => {
                node.stop_scanning();
            }
            Input::Advertise => {
                node.start_advertising();
            }
            Input::StopAdvertise => {
                node.stop_advertising();
            }
            Input::Connect(peer) => {
                node.connect(peer);
            }
            Input::Disconnect => {
                node.disconnect();
            }
            Input::Radio(on) => radio.set_powered(id, on),
            Input::Quit => break,
            Input::Unknown(line) => eprintln!("unknown command: {line}"),
        }
    }
    Ok(())
}

fn print_update(side: &str, update: Update) {
    match update {
        Update::State(state) => println!("[{side}] {state}"),
        Update::Peers(peers) => {
            for p in peers {
                println!("[{side}] found {} ({})", p.name, p.id);
            }
        }
        Update::Message(m) => match m.media() {
            Some(bytes) => println!("[{side}] <{}> {} ({} bytes)", m.id, m.content, bytes.len()),
            None => println!("[{side}] <{}> {}", m.id, m.content),
        },
        Update::Error(e) => eprintln!("[{side}] error ({:?}): {e}", e.category()),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
