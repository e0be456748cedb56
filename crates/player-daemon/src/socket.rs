use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use player_proto::protocol::{Broadcast, Message, PROTOCOL_VERSION};
use player_proto::state::StateManager;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::core::CoreEvent;
use crate::BroadcastMessage;

/// Bind the control socket and serve clients on a background task.
pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };
        info!("TCP control socket listening at {}", addr);
        serve(listener, state_manager, event_tx, broadcast_tx).await;
    })
}

/// Accept loop over an already-bound listener.
pub async fn serve(
    listener: TcpListener,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let next_id = AtomicUsize::new(1);
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                info!("Client {} connected from {}", id, peer);

                let sm = state_manager.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, sm, id, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Length of the frame at the head of `buf`, once it has fully arrived.
fn complete_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    (buf.len() >= 4 + len).then_some(4 + len)
}

async fn handle_client(
    stream: TcpStream,
    state_manager: Arc<StateManager>,
    client_id: usize,
    event_tx: mpsc::Sender<CoreEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&state_manager).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while let Some(frame_len) = complete_frame_len(&read_buf) {
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    debug!("Client {} sent command: {:?}", client_id, cmd);
                                    if event_tx.send(CoreEvent::Command(cmd)).await.is_err() {
                                        warn!("CoreEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(e) => {
                                    // whole frame is here but unparseable: skip it
                                    read_buf.drain(..frame_len);
                                    warn!("Client {} sent a bad frame: {}", client_id, e);
                                    let reply = Broadcast::Error { message: format!("bad command: {}", e) };
                                    if let Ok(encoded) = Message::Broadcast(reply).encode() {
                                        if write_half.write_all(&encoded).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&state_manager).await,
                    Ok(BroadcastMessage::Lyric { index, text }) => {
                        Message::Broadcast(Broadcast::Lyric { index, text }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&state_manager).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

async fn encode_hello(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    let rev = state.rev;
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        rev,
        state,
    })
    .encode()
}

async fn encode_state(state_manager: &StateManager) -> anyhow::Result<Vec<u8>> {
    let state = state_manager.get_state().await;
    Message::Broadcast(Broadcast::State { data: state }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use player_proto::protocol::Command;

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().0
    }

    #[test]
    fn test_complete_frame_len() {
        assert_eq!(complete_frame_len(&[0, 0]), None);
        assert_eq!(complete_frame_len(&[0, 0, 0, 2, b'{']), None);
        assert_eq!(complete_frame_len(&[0, 0, 0, 2, b'{', b'}', 9]), Some(6));
    }

    #[tokio::test]
    async fn test_hello_then_commands_reach_core() {
        let dir = tempfile::tempdir().unwrap();
        let sm = Arc::new(StateManager::new(dir.path().join("settings.json")));
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (broadcast_tx, _) = broadcast::channel(16);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, sm, event_tx, broadcast_tx.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Hello { protocol_version, .. }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION)
            }
            other => panic!("expected hello, got {:?}", other),
        }

        // garbage frame first, then a real command
        let mut bad = 3u32.to_be_bytes().to_vec();
        bad.extend_from_slice(b"???");
        client.write_all(&bad).await.unwrap();
        let next = Message::Command(Command::Next).encode().unwrap();
        client.write_all(&next).await.unwrap();

        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Error { .. }) => {}
            other => panic!("expected error, got {:?}", other),
        }
        match event_rx.recv().await {
            Some(CoreEvent::Command(Command::Next)) => {}
            other => panic!("expected Next, got {:?}", other),
        }

        broadcast_tx
            .send(BroadcastMessage::Lyric {
                index: Some(2),
                text: Some("la".to_string()),
            })
            .unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Lyric { index, text }) => {
                assert_eq!(index, Some(2));
                assert_eq!(text.as_deref(), Some("la"));
            }
            other => panic!("expected lyric, got {:?}", other),
        }
    }
}
