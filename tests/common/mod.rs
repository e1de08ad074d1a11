//! Shared helpers: an in-process WebSocket backend and UI wait helpers
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use medivoice_client::UiState;

pub const WAIT: Duration = Duration::from_secs(5);

/// Minimal backend: records client frames and lets the test push frames back
pub struct TestServer {
    pub url: String,
    accepted: Arc<AtomicUsize>,
    frames: mpsc::UnboundedReceiver<Message>,
    peer: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl TestServer {
    pub async fn spawn() -> Self {
        Self::spawn_with_handshake_delay(Duration::ZERO).await
    }

    /// Server that waits `delay` after accepting TCP before answering the handshake
    pub async fn spawn_with_handshake_delay(delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let peer: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>> = Arc::default();

        let server_accepted = accepted.clone();
        let server_peer = peer.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server_accepted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (mut write, mut read) = ws.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                *server_peer.lock().unwrap() = Some(out_tx);

                tokio::spawn(async move {
                    while let Some(msg) = out_rx.recv().await {
                        if write.send(msg).await.is_err() {
                            break;
                        }
                    }
                });

                let frames_tx = frames_tx.clone();
                tokio::spawn(async move {
                    while let Some(Ok(msg)) = read.next().await {
                        let _ = frames_tx.send(msg);
                    }
                });
            }
        });

        Self {
            url,
            accepted,
            frames,
            peer,
        }
    }

    /// TCP connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Send a frame to the most recently connected client
    pub async fn send(&self, msg: Message) {
        tokio::time::timeout(WAIT, async {
            loop {
                let peer = self.peer.lock().unwrap().clone();
                if let Some(peer) = peer {
                    peer.send(msg).unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no client connected");
    }

    pub async fn send_json(&self, value: serde_json::Value) {
        self.send(Message::Text(value.to_string())).await;
    }

    /// Next data or close frame from the client
    pub async fn next_frame(&mut self) -> Message {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.frames.recv().await {
                    Some(Message::Ping(_)) | Some(Message::Pong(_)) => continue,
                    Some(msg) => return msg,
                    None => panic!("server stopped"),
                }
            }
        })
        .await
        .expect("timed out waiting for a client frame")
    }

    /// Next data or close frame, or `None` if nothing arrives `within`
    pub async fn try_next_frame(&mut self, within: Duration) -> Option<Message> {
        tokio::time::timeout(within, async {
            loop {
                match self.frames.recv().await {
                    Some(Message::Ping(_)) | Some(Message::Pong(_)) => continue,
                    other => return other,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }
}

/// A listener that accepts TCP connections but never answers the handshake
pub async fn spawn_silent_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    (url, accepted)
}

/// URL of a port with nothing listening
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/ws", addr)
}

/// Wait until the UI snapshot satisfies `pred`
pub async fn wait_for_ui(ui: &mut watch::Receiver<UiState>, pred: impl Fn(&UiState) -> bool) {
    tokio::time::timeout(WAIT, async {
        loop {
            if pred(&ui.borrow_and_update()) {
                return;
            }
            ui.changed().await.expect("session loop stopped");
        }
    })
    .await
    .expect("timed out waiting for UI state");
}

/// Mono 16-bit WAV bytes
pub fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}
