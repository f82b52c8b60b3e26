//! Peer-to-peer message transport.
//!
//! Raft messages travel between peers over the same length-prefixed framing
//! the client protocol uses, carrying protobuf-encoded `raft::Message`
//! payloads. Delivery is best-effort: a broken peer connection is dropped
//! and re-established lazily, and raft retransmits whatever was lost.

use std::collections::HashMap;

use protobuf::Message as PbMessage;
use raft::eraftpb::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{timeout, Duration};

use crate::command::MAX_MESSAGE_SIZE;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const PEER_QUEUE_SIZE: usize = 1024;

/// Accepts peer connections and feeds decoded messages into the node loop.
pub async fn serve_peers(listener: TcpListener, in_mailbox: Sender<Message>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                log::debug!("peer connected from {addr}");
                let mailbox = in_mailbox.clone();
                tokio::spawn(async move {
                    recv_loop(stream, mailbox).await;
                });
            }
            Err(e) => {
                log::error!("peer accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn recv_loop(mut stream: TcpStream, mailbox: Sender<Message>) {
    let _ = stream.set_nodelay(true);
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_MESSAGE_SIZE {
            log::warn!("peer sent invalid frame length {len}");
            return;
        }
        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        match Message::parse_from_bytes(&payload) {
            Ok(msg) => {
                if mailbox.send(msg).await.is_err() {
                    return;
                }
            }
            Err(e) => log::warn!("failed to parse peer message: {e}"),
        }
    }
}

/// Routes outbound messages from the node loop to per-peer sender tasks.
pub fn start_sender(mut out_mailbox: Receiver<Message>, peers: HashMap<u64, String>) {
    tokio::spawn(async move {
        let mut channels: HashMap<u64, Sender<Message>> = HashMap::new();
        while let Some(msg) = out_mailbox.recv().await {
            let to = msg.to;
            let tx = channels
                .entry(to)
                .or_insert_with(|| spawn_peer(to, peers.get(&to).cloned()));
            if tx.try_send(msg).is_err() {
                log::debug!("peer {to} queue full, dropping message");
            }
        }
    });
}

fn spawn_peer(id: u64, addr: Option<String>) -> Sender<Message> {
    let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_SIZE);
    tokio::spawn(async move {
        let Some(addr) = addr else {
            log::error!("no address configured for peer {id}");
            return;
        };
        let mut conn: Option<TcpStream> = None;
        while let Some(msg) = rx.recv().await {
            if conn.is_none() {
                conn = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                    Ok(Ok(stream)) => {
                        let _ = stream.set_nodelay(true);
                        log::debug!("connected to peer {id} at {addr}");
                        Some(stream)
                    }
                    Ok(Err(e)) => {
                        log::debug!("connect to peer {id} at {addr} failed: {e}");
                        None
                    }
                    Err(_) => {
                        log::debug!("connect to peer {id} at {addr} timed out");
                        None
                    }
                };
            }
            let Some(stream) = conn.as_mut() else {
                continue;
            };

            let bytes = match msg.write_to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("failed to encode raft message: {e}");
                    continue;
                }
            };
            let mut frame = Vec::with_capacity(4 + bytes.len());
            frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            frame.extend_from_slice(&bytes);
            if stream.write_all(&frame).await.is_err() {
                log::debug!("send to peer {id} failed, dropping connection");
                conn = None;
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn messages_flow_listener_to_mailbox() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (in_tx, mut in_rx) = mpsc::channel(16);
        tokio::spawn(serve_peers(listener, in_tx));

        let (out_tx, out_rx) = mpsc::channel(16);
        let peers = HashMap::from([(2u64, addr.to_string())]);
        start_sender(out_rx, peers);

        let mut msg = Message::default();
        msg.to = 2;
        msg.from = 1;
        out_tx.send(msg).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), in_rx.recv())
            .await
            .expect("message within deadline")
            .expect("mailbox open");
        assert_eq!(received.to, 2);
        assert_eq!(received.from, 1);
    }
}
