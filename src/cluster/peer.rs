//! Outbound peer link
//!
//! One dialing TCP link per discovered peer: Hello handshake, bounded
//! send queue, reconnect with backoff, periodic ping. Inbound traffic
//! from the peer arrives on our listener side (every node dials every
//! other node), so this half only reads handshake and pong frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{
    frame_message, read_frame_length, ClusterMessage, CLUSTER_PROTOCOL_VERSION,
};

/// Link state, visible for health decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    /// Link lost; dial retry pending
    Backoff,
    Stopped,
}

const SEND_QUEUE_CAPACITY: usize = 1024;
const PING_INTERVAL: Duration = Duration::from_secs(15);
const RECONNECT_MIN: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Handle to one peer link.
pub struct ClusterPeer {
    node_id: Arc<str>,
    addr: SocketAddr,
    tx: mpsc::Sender<ClusterMessage>,
    status: Arc<RwLock<PeerStatus>>,
}

impl ClusterPeer {
    /// Create the handle and spawn the link task. `initial_sync` is sent
    /// after every successful handshake (filter sync, client ownership).
    pub fn spawn<F>(
        node_id: Arc<str>,
        addr: SocketAddr,
        local_node_id: Arc<str>,
        initial_sync: F,
    ) -> Arc<Self>
    where
        F: Fn() -> Vec<ClusterMessage> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let status = Arc::new(RwLock::new(PeerStatus::Connecting));
        let peer = Arc::new(Self {
            node_id: node_id.clone(),
            addr,
            tx,
            status: status.clone(),
        });
        tokio::spawn(link_task(
            node_id,
            addr,
            local_node_id,
            rx,
            status,
            initial_sync,
        ));
        peer
    }

    pub fn node_id(&self) -> &Arc<str> {
        &self.node_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Queue a message for the peer. A full queue applies backpressure by
    /// refusing; the caller decides what that means per QoS.
    pub fn send(&self, message: ClusterMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    "peer '{}' send queue full, dropping {}",
                    self.node_id,
                    msg.type_name()
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Tear the link down for good.
    pub fn stop(&self) {
        *self.status.write() = PeerStatus::Stopped;
        let _ = self.tx.try_send(ClusterMessage::Goodbye);
    }
}

/// Owns the TCP connection lifecycle for one peer.
async fn link_task<F>(
    node_id: Arc<str>,
    addr: SocketAddr,
    local_node_id: Arc<str>,
    mut rx: mpsc::Receiver<ClusterMessage>,
    status: Arc<RwLock<PeerStatus>>,
    initial_sync: F,
) where
    F: Fn() -> Vec<ClusterMessage> + Send + Sync + 'static,
{
    let mut backoff = RECONNECT_MIN;
    loop {
        if *status.read() == PeerStatus::Stopped {
            return;
        }
        *status.write() = PeerStatus::Connecting;

        match connect_and_run(
            &node_id,
            addr,
            &local_node_id,
            &mut rx,
            &status,
            &initial_sync,
        )
        .await
        {
            Ok(()) => return, // clean Goodbye
            Err(e) => {
                if *status.read() == PeerStatus::Stopped {
                    return;
                }
                debug!("peer '{node_id}' link error: {e}");
                *status.write() = PeerStatus::Backoff;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        }
    }
}

async fn connect_and_run<F>(
    node_id: &Arc<str>,
    addr: SocketAddr,
    local_node_id: &Arc<str>,
    rx: &mut mpsc::Receiver<ClusterMessage>,
    status: &Arc<RwLock<PeerStatus>>,
    initial_sync: &F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Fn() -> Vec<ClusterMessage>,
{
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    // Handshake: Hello, expect HelloAck with a compatible version.
    let hello = ClusterMessage::Hello {
        node_id: local_node_id.to_string(),
        version: CLUSTER_PROTOCOL_VERSION,
    };
    stream.write_all(&frame_message(&hello)?).await?;

    let ack = read_one_frame(&mut stream).await?;
    match ack {
        ClusterMessage::HelloAck { node_id: their_id, version } => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(format!(
                    "peer '{their_id}' protocol version {version} != {CLUSTER_PROTOCOL_VERSION}"
                )
                .into());
            }
        }
        other => return Err(format!("expected HelloAck, got {}", other.type_name()).into()),
    }

    info!("cluster link to '{node_id}' established");
    *status.write() = PeerStatus::Connected;

    for msg in initial_sync() {
        stream.write_all(&frame_message(&msg)?).await?;
    }

    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.tick().await;
    let mut read_buf = vec![0u8; 4096];
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(ClusterMessage::Goodbye) => {
                        let _ = stream.write_all(&frame_message(&ClusterMessage::Goodbye)?).await;
                        info!("cluster link to '{node_id}' closed");
                        return Ok(());
                    }
                    Some(msg) => {
                        stream.write_all(&frame_message(&msg)?).await?;
                    }
                    None => return Ok(()),
                }
            }
            _ = ping_ticker.tick() => {
                stream.write_all(&frame_message(&ClusterMessage::Ping)?).await?;
            }
            read = stream.read(&mut read_buf) => {
                let n = read?;
                if n == 0 {
                    return Err("peer closed the link".into());
                }
                pending.extend_from_slice(&read_buf[..n]);
                while let Some(len) = read_frame_length(&pending) {
                    if pending.len() < 4 + len {
                        break;
                    }
                    // Only keep-alive traffic is expected on this half.
                    if let Ok(msg) = ClusterMessage::decode(&pending[4..4 + len]) {
                        if matches!(msg, ClusterMessage::Goodbye) {
                            return Ok(());
                        }
                    }
                    pending.drain(..4 + len);
                }
            }
        }
    }
}

async fn read_one_frame(
    stream: &mut TcpStream,
) -> Result<ClusterMessage, Box<dyn std::error::Error + Send + Sync>> {
    match tokio::time::timeout(Duration::from_secs(10), read_frame_inner(stream)).await {
        Ok(result) => result,
        Err(_) => Err("handshake timeout".into()),
    }
}

async fn read_frame_inner(
    stream: &mut TcpStream,
) -> Result<ClusterMessage, Box<dyn std::error::Error + Send + Sync>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > 16 * 1024 * 1024 {
        return Err("oversized cluster frame".into());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(ClusterMessage::decode(&body)?)
}
