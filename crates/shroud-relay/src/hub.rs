//! Fan-out of relay messages to connected peers.
//!
//! Each connection gets two queues drained by its transport task. Rebroadcast
//! frames go through a bounded queue and a full queue drops that one frame
//! for that one peer, so a slow subscriber never stalls the relay. Control
//! messages (directory, toggle state, handshake responses) go through their
//! own queue and are never dropped; a peer that lets [`CONTROL_BACKLOG`]
//! control messages pile up is disconnected instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use shroud_common::RelayMessage;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

pub type ConnectionId = u64;

/// Control messages a peer may leave unread before it is dropped.
pub const CONTROL_BACKLOG: usize = 1024;

#[derive(Debug)]
struct Peer {
    control: mpsc::Sender<RelayMessage>,
    frames: mpsc::Sender<RelayMessage>,
    /// Producers get control traffic but no rebroadcast frames.
    producer: bool,
}

/// Receiving side of one peer's queues.
///
/// Pending control messages are always handed out before frames.
#[derive(Debug)]
pub struct Outbox {
    control: mpsc::Receiver<RelayMessage>,
    frames: mpsc::Receiver<RelayMessage>,
}

impl Outbox {
    /// Next message, or `None` once the peer was removed from the hub.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        tokio::select! {
            biased;
            message = self.control.recv() => message,
            Some(message) = self.frames.recv() => Some(message),
        }
    }

    pub fn try_recv(&mut self) -> Result<RelayMessage, TryRecvError> {
        match self.control.try_recv() {
            Ok(message) => Ok(message),
            Err(TryRecvError::Empty) => self.frames.try_recv(),
            Err(TryRecvError::Disconnected) => Err(TryRecvError::Disconnected),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hub {
    peers: Arc<RwLock<HashMap<ConnectionId, Peer>>>,
    next_id: Arc<AtomicU64>,
    outbox_capacity: usize,
}

enum Delivery {
    Sent,
    Dropped,
    /// Control backlog exceeded; the peer must go.
    Overrun,
}

impl Hub {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Add a peer and hand back the receiving end of its queues.
    pub async fn connect(&self) -> (ConnectionId, Outbox) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BACKLOG);
        let (frames_tx, frames_rx) = mpsc::channel(self.outbox_capacity);
        self.peers.write().await.insert(
            id,
            Peer {
                control: control_tx,
                frames: frames_tx,
                producer: false,
            },
        );
        let outbox = Outbox {
            control: control_rx,
            frames: frames_rx,
        };
        (id, outbox)
    }

    /// Remove a peer. Dropping its senders ends the peer's transport task.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        self.peers.write().await.remove(&id).is_some()
    }

    pub async fn mark_producer(&self, id: ConnectionId) {
        if let Some(peer) = self.peers.write().await.get_mut(&id) {
            peer.producer = true;
        }
    }

    /// Queue a control message for one peer.
    pub async fn send_to(&self, id: ConnectionId, message: RelayMessage) -> bool {
        let delivery = {
            let peers = self.peers.read().await;
            match peers.get(&id) {
                Some(peer) => send_control(id, peer, message),
                None => return false,
            }
        };
        match delivery {
            Delivery::Sent => true,
            Delivery::Dropped => false,
            Delivery::Overrun => {
                self.evict(&[id]).await;
                false
            }
        }
    }

    /// Queue a control message for every connected peer. Returns how many
    /// accepted it.
    pub async fn broadcast(&self, message: RelayMessage) -> usize {
        let mut sent = 0;
        let mut overrun = Vec::new();
        {
            let peers = self.peers.read().await;
            for (id, peer) in peers.iter() {
                match send_control(*id, peer, message.clone()) {
                    Delivery::Sent => sent += 1,
                    Delivery::Dropped => {}
                    Delivery::Overrun => overrun.push(*id),
                }
            }
        }
        self.evict(&overrun).await;
        sent
    }

    /// Send a rebroadcast frame to every subscriber. Lossy under backpressure.
    pub async fn broadcast_frame(&self, stream_id: &str, frame: Bytes) -> usize {
        let message = RelayMessage::BroadcastFrame {
            stream_id: stream_id.to_string(),
            frame,
        };
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(_, peer)| !peer.producer)
            .filter(|(id, peer)| match peer.frames.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("frame queue of connection {} full, dropped frame", id);
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            })
            .count()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    async fn evict(&self, ids: &[ConnectionId]) {
        if ids.is_empty() {
            return;
        }
        let mut peers = self.peers.write().await;
        for id in ids {
            if peers.remove(id).is_some() {
                warn!(
                    "connection {} left {} control messages unread, disconnecting",
                    id, CONTROL_BACKLOG
                );
            }
        }
    }
}

fn send_control(id: ConnectionId, peer: &Peer, message: RelayMessage) -> Delivery {
    match peer.control.try_send(message) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(message)) => {
            debug!("control queue of connection {} full at {}", id, message.event());
            Delivery::Overrun
        }
        Err(TrySendError::Closed(_)) => Delivery::Dropped,
    }
}
