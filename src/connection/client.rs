//! Backend WebSocket client
//!
//! Owns the single live socket and deduplicates concurrent connect attempts.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Open the socket (or join the attempt already in flight)
//! 2. `send_binary()` / `send_message()` - Queue frames for the writer task
//! 3. Inbound frames arrive as [`Inbound`] on the channel given to `new()`
//! 4. `close()` / `shutdown()` - Close with a code; the backend may also close

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::{ClientMessage, ServerMessage, CLOSE_ABNORMAL, CLOSE_NORMAL};
use super::ConnectError;

/// Hard ceiling for the opening handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

/// Traffic delivered from the socket reader, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A parsed text frame
    Message(ServerMessage),
    /// The socket closed after it had opened
    Closed { code: u16, reason: String },
}

/// A live socket: a writer task fed by a channel and a reader task
struct Socket {
    outgoing: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Socket {
    fn spawn(ws: WsStream, inbound: mpsc::UnboundedSender<Inbound>) -> Self {
        let (write, read) = ws.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_writer(write, outgoing_rx, open.clone()));
        let reader = tokio::spawn(run_reader(read, inbound, open.clone()));

        Self {
            outgoing,
            open,
            reader,
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, msg: Message) -> bool {
        self.is_open() && self.outgoing.send(msg).is_ok()
    }

    /// Send a close frame and stop reporting inbound traffic
    fn close(self, code: u16, reason: &str) {
        if self.is_open() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: Cow::Owned(reason.to_string()),
            };
            let _ = self.outgoing.send(Message::Close(Some(frame)));
        }
        self.open.store(false, Ordering::SeqCst);
        self.reader.abort();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Ensure the reader stops if the socket is dropped without close()
        self.reader.abort();
    }
}

async fn run_writer(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    open: Arc<AtomicBool>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            log::warn!("WebSocket send failed: {}", e);
            open.store(false, Ordering::SeqCst);
            break;
        }
        if is_close {
            break;
        }
    }
    log::debug!("Writer task exiting");
}

async fn run_reader(
    mut read: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<Inbound>,
    open: Arc<AtomicBool>,
) {
    let mut code = CLOSE_ABNORMAL;
    let mut reason = String::from("Stream ended");

    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match ServerMessage::parse(&text) {
                Ok(msg) => {
                    if inbound.send(Inbound::Message(msg)).is_err() {
                        log::debug!("Inbound channel closed");
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Dropping malformed message: {}", e);
                }
            },
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    code = u16::from(frame.code);
                    reason = frame.reason.into_owned();
                } else {
                    code = CLOSE_NORMAL;
                    reason.clear();
                }
                break;
            }
            Err(e) => {
                log::warn!("WebSocket error: {}", e);
                reason = e.to_string();
                break;
            }
            _ => {} // Ignore ping/pong/binary
        }
    }

    open.store(false, Ordering::SeqCst);
    log::info!("WebSocket disconnected: {} {}", code, reason);
    let _ = inbound.send(Inbound::Closed { code, reason });
}

struct ConnectionState {
    socket: Option<Socket>,
    pending: Option<ConnectAttempt>,
    reconnect_attempts: u32,
}

/// Handle to the backend connection
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Connection {
    url: String,
    connect_timeout: Duration,
    inbound: mpsc::UnboundedSender<Inbound>,
    state: Arc<Mutex<ConnectionState>>,
}

impl Connection {
    pub fn new(
        url: impl Into<String>,
        connect_timeout: Duration,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            inbound,
            state: Arc::new(Mutex::new(ConnectionState {
                socket: None,
                pending: None,
                reconnect_attempts: 0,
            })),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the socket, or join the attempt already in flight
    ///
    /// Every caller of a shared attempt receives the same result. When a socket
    /// is already open this returns immediately without opening another one.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let attempt = {
            let mut state = lock(&self.state);

            if let Some(pending) = &state.pending {
                log::debug!("Connect already in flight, joining it");
                pending.clone()
            } else if state.socket.as_ref().is_some_and(|s| s.is_open()) {
                return Ok(());
            } else {
                if let Some(stale) = state.socket.take() {
                    log::debug!("Discarding stale socket before reconnecting");
                    stale.close(CLOSE_NORMAL, "Reconnecting");
                }

                let attempt = open_socket(
                    self.state.clone(),
                    self.url.clone(),
                    self.connect_timeout,
                    self.inbound.clone(),
                )
                .boxed()
                .shared();
                state.pending = Some(attempt.clone());
                attempt
            }
        };

        attempt.await
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state)
            .socket
            .as_ref()
            .is_some_and(|s| s.is_open())
    }

    pub fn is_connecting(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Consecutive failed connect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.state).reconnect_attempts
    }

    /// Queue a binary frame. Returns false (frame dropped) when not open.
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        match lock(&self.state).socket.as_ref() {
            Some(socket) => socket.send(Message::Binary(bytes)),
            None => false,
        }
    }

    /// Queue a JSON control message. Returns false (dropped) when not open.
    pub fn send_message(&self, msg: &ClientMessage) -> bool {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize {:?}: {}", msg, e);
                return false;
            }
        };

        match lock(&self.state).socket.as_ref() {
            Some(socket) => socket.send(Message::Text(json)),
            None => false,
        }
    }

    /// Close the current socket, if any. An in-flight attempt is not affected.
    pub fn close(&self, code: u16, reason: &str) {
        if let Some(socket) = lock(&self.state).socket.take() {
            log::info!("Closing WebSocket ({}): {}", code, reason);
            socket.close(code, reason);
        }
    }

    /// Close with a normal code unless a connect is in flight
    pub fn shutdown(&self) {
        if self.is_connecting() {
            log::info!("Connect in flight at shutdown, leaving it alone");
            return;
        }
        self.close(CLOSE_NORMAL, "Client shutting down");
    }
}

fn lock(state: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Single connection attempt; stores the socket and clears `pending` when done
async fn open_socket(
    state: Arc<Mutex<ConnectionState>>,
    url: String,
    connect_timeout: Duration,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> Result<(), ConnectError> {
    log::info!("Creating WebSocket connection to: {}", url);
    let started = Instant::now();

    let result = match timeout(connect_timeout, connect_async(url.as_str())).await {
        Err(_) => {
            log::error!("WebSocket connection timeout");
            Err(ConnectError::Timeout(connect_timeout))
        }
        Ok(Err(e)) => Err(ConnectError::from_ws_error(e)),
        Ok(Ok((ws, _response))) => Ok(ws),
    };

    let mut guard = lock(&state);
    guard.pending = None;

    match result {
        Ok(ws) => {
            log::info!(
                "WebSocket connected successfully in {}ms",
                started.elapsed().as_millis()
            );
            guard.socket = Some(Socket::spawn(ws, inbound));
            guard.reconnect_attempts = 0;
            Ok(())
        }
        Err(e) => {
            guard.reconnect_attempts += 1;
            log::warn!(
                "Connection attempt failed ({} consecutive): {}",
                guard.reconnect_attempts,
                e
            );
            Err(e)
        }
    }
}
