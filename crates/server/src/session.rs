//! WebSocket session: read/write pumps, ordered outbound queue, dispatch.
//!
//! A [`Session`] is the shared handle to one connected client. Three tasks
//! drive it:
//!
//! - the **write pump** drains the outbound queue, one frame in flight at a
//!   time, and performs the closing procedure;
//! - the **read pump** reads one frame at a time, runs it through the codec
//!   and posts valid packages onto the dispatch queue;
//! - the **dispatch pump** consumes that queue sequentially, so a session's
//!   own package handling never runs concurrently with itself, and the read
//!   pump never blocks on downstream latency.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use lasertag_protocol::{package, ClientPackage, Package};

use crate::game::Game;
use crate::registry::Server;

/// Process-unique session identifier.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// The routing rule currently responsible for a session's inbound packages.
#[derive(Clone, Default)]
pub enum Dispatch {
    /// Only `join` is meaningful; everything else draws a warning.
    #[default]
    Unjoined,
    /// Packages are handled by the game the session joined.
    InGame(Arc<Game>),
}

/// Shared handle to one connected client.
///
/// Cloneable and cheap; the underlying state is freed when the last clone
/// drops and the pump tasks have finished.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    id: SessionId,
    remote: Option<SocketAddr>,
    queue: Mutex<SendQueue>,
    wake_writer: Notify,
    dispatch: Mutex<Dispatch>,
    cancel: CancellationToken,
}

/// Outbound queue state. One mutex guards the frames and both lifecycle
/// flags so the closing procedure observes a consistent picture.
struct SendQueue {
    frames: VecDeque<Package>,
    handshake_complete: bool,
    in_closing_procedure: bool,
}

impl Session {
    fn new(remote: Option<SocketAddr>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                remote,
                queue: Mutex::new(SendQueue {
                    frames: VecDeque::new(),
                    handshake_complete: false,
                    in_closing_procedure: false,
                }),
                wake_writer: Notify::new(),
                dispatch: Mutex::new(Dispatch::Unjoined),
                cancel,
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The client's remote endpoint, informational only.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    /// Enqueues a package for delivery.
    ///
    /// Frames are delivered in enqueue order with at most one write in
    /// flight. Writes enqueued before the handshake completes are held and
    /// flushed afterwards. Writes after the closing procedure has started
    /// are dropped.
    pub fn write(&self, package: Package) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if queue.in_closing_procedure {
                tracing::warn!(session = self.inner.id, "dropping write on closing session");
                return;
            }
            queue.frames.push_back(package);
        }
        self.inner.wake_writer.notify_one();
    }

    /// Starts the closing procedure: queued-but-unsent frames are dropped
    /// and the WebSocket close frame is sent once the in-flight write (if
    /// any) completes.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Same as [`close`](Self::close), but `package` is delivered as the
    /// sole trailing frame before the close frame.
    pub fn close_with(&self, package: Package) {
        self.close_inner(Some(package));
    }

    fn close_inner(&self, last: Option<Package>) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.in_closing_procedure = true;
            queue.frames.clear();
            if let Some(package) = last {
                queue.frames.push_back(package);
            }
        }
        self.inner.wake_writer.notify_one();
    }

    /// Current dispatch delegate.
    pub fn dispatch(&self) -> Dispatch {
        self.inner.dispatch.lock().unwrap().clone()
    }

    /// Swaps the dispatch delegate; takes effect for the next package.
    pub fn set_dispatch(&self, dispatch: Dispatch) {
        *self.inner.dispatch.lock().unwrap() = dispatch;
    }

    fn mark_handshake_complete(&self) {
        self.inner.queue.lock().unwrap().handshake_complete = true;
        self.inner.wake_writer.notify_one();
    }

    /// Test-only session with a completed handshake and no pump tasks.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let session = Self::new(None, CancellationToken::new());
        session.mark_handshake_complete();
        session
    }

    /// Test-only: drains and returns every queued frame.
    #[cfg(test)]
    pub(crate) fn drain_queued(&self) -> Vec<Package> {
        self.inner.queue.lock().unwrap().frames.drain(..).collect()
    }

    /// Test-only: whether the closing procedure has started.
    #[cfg(test)]
    pub(crate) fn is_closing(&self) -> bool {
        self.inner.queue.lock().unwrap().in_closing_procedure
    }
}

/// Registers a new session with the server and spawns its pump tasks.
///
/// The stream must already have completed the WebSocket handshake; writes
/// held during construction are released once the pumps are up.
pub fn spawn(
    stream: WebSocketStream<TcpStream>,
    remote: SocketAddr,
    server: Arc<Server>,
) -> Session {
    let session = Session::new(Some(remote), server.cancel_token().child_token());
    tracing::info!(session = session.id(), %remote, "session connected");

    server.register(&session);

    let (sink, stream) = stream.split();
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

    tokio::spawn(write_pump(session.clone(), sink));
    tokio::spawn(dispatch_pump(session.clone(), server, dispatch_rx));
    tokio::spawn(read_pump(session.clone(), stream, dispatch_tx));

    session.mark_handshake_complete();
    session
}

/// What the write pump should do next, decided under the queue lock.
enum WriteStep {
    Send(Package),
    Close,
    Idle,
}

async fn write_pump<S>(session: Session, mut sink: S)
where
    S: SinkExt<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let cancel = session.inner.cancel.clone();
    loop {
        let step = {
            let mut queue = session.inner.queue.lock().unwrap();
            if !queue.handshake_complete {
                WriteStep::Idle
            } else if let Some(package) = queue.frames.pop_front() {
                WriteStep::Send(package)
            } else if queue.in_closing_procedure {
                WriteStep::Close
            } else {
                WriteStep::Idle
            }
        };

        match step {
            WriteStep::Send(package) => {
                if let Err(e) = sink.send(WsMessage::text(package.as_str())).await {
                    tracing::error!(session = session.id(), "write pump send error: {e}");
                    break;
                }
            }
            WriteStep::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
            WriteStep::Idle => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = session.inner.wake_writer.notified() => {}
                }
            }
        }
    }
    cancel.cancel();
}

async fn read_pump<S>(
    session: Session,
    mut stream: S,
    dispatch_tx: mpsc::UnboundedSender<ClientPackage>,
) where
    S: StreamExt<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let cancel = session.inner.cancel.clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(message)) => {
                let raw = match message {
                    WsMessage::Text(text) => text.as_str().to_owned(),
                    // Binary payloads go through the same codec; anything
                    // that isn't UTF-8 JSON fails verification below.
                    WsMessage::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let verified = package::parse(&raw)
                    .map_err(|e| e.to_package())
                    .and_then(|value| package::verify(value).map_err(|e| e.to_package()));
                match verified {
                    Ok(pkg) => {
                        if dispatch_tx.send(pkg).is_err() {
                            break;
                        }
                    }
                    Err(error_pkg) => session.close_with(error_pkg),
                }
            }
            Some(Err(e)) => {
                tracing::error!(session = session.id(), "read pump error: {e}");
                break;
            }
            None => break,
        }
    }

    cancel.cancel();
    // Dropping `dispatch_tx` here lets the dispatch pump drain whatever is
    // still queued before it unregisters the session.
}

async fn dispatch_pump(
    session: Session,
    server: Arc<Server>,
    mut rx: mpsc::UnboundedReceiver<ClientPackage>,
) {
    while let Some(pkg) = rx.recv().await {
        match session.dispatch() {
            Dispatch::Unjoined => server.handle_unjoined(&session, pkg),
            Dispatch::InGame(game) => game.handle_package(&server, &session, pkg),
        }
    }
    tracing::info!(session = session.id(), "session disconnected");
    server.unregister(&session);
}
