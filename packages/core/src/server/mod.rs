//! Server controller: accepts sessions and fans in their streams.
//!
//! One controller owns a bind/accept loop plus the registry of accepted
//! sessions. Each accepted connection gets its own handshake task and
//! per-session dispatch queue; the controller-level stream hub is a fan-in
//! across all of them. Closing the controller drains every accepted session
//! before the controller's own close event fires.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::config::SessionConfig;
use crate::error::{self, Error};
use crate::events::{Hub, Subscription};
use crate::headers::HeaderBlock;
use crate::session::Session;
use crate::stream::{self, Stream};

struct ServerInner {
    config: SessionConfig,
    sessions: Mutex<HashMap<u64, Session>>,
    local_addr: Mutex<Option<SocketAddr>>,
    closing: AtomicBool,
    closed: AtomicBool,
    /// Signaled when a session leaves the registry; the close drain task
    /// rechecks emptiness on every permit.
    drained: Notify,
    /// Stops the accept loop.
    shutdown: Notify,
    session_hub: Hub<Session>,
    stream_hub: Hub<(Stream, HeaderBlock)>,
    error_hub: Hub<Error>,
    close_hub: Hub<()>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Accepts inbound sessions on a bound address. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: SessionConfig) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                config,
                sessions: Mutex::new(HashMap::new()),
                local_addr: Mutex::new(None),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                drained: Notify::new(),
                shutdown: Notify::new(),
                session_hub: Hub::new(),
                stream_hub: Hub::new(),
                error_hub: Hub::new(),
                close_hub: Hub::new(),
            }),
        }
    }

    /// Binds `addr` and starts accepting. `on_ready` fires once with the
    /// bound address (useful with port 0). Bind failure surfaces on the
    /// error hub and settles the controller.
    pub fn listen(&self, addr: impl Into<String>, on_ready: impl FnOnce(SocketAddr) + Send + 'static) {
        let inner = self.inner.clone();
        let server = self.clone();
        let addr = addr.into();
        tokio::spawn(async move {
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!(%addr, error = %err, "bind failed");
                    inner.error_hub.emit(error::session_error(err));
                    server.finish_close();
                    return;
                }
            };
            let local = match listener.local_addr() {
                Ok(local) => local,
                Err(err) => {
                    inner.error_hub.emit(error::session_error(err));
                    server.finish_close();
                    return;
                }
            };
            *lock(&inner.local_addr) = Some(local);
            tracing::debug!(%local, "listening");
            on_ready(local);

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            tracing::debug!(%peer, "accepted connection");
                            let server = server.clone();
                            tokio::spawn(async move {
                                server.drive_session(socket).await;
                            });
                        }
                        Err(err) => {
                            // Transient accept failures do not stop the loop.
                            tracing::warn!(error = %err, "accept failed");
                        }
                    },
                    _ = inner.shutdown.notified() => break,
                }
            }
        });
    }

    /// The bound address, once `listen` has completed its bind.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn sessions(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Persistent subscription fired once per accepted session.
    pub fn on_session(&self, handler: impl FnMut(Session) + Send + 'static) -> Subscription {
        self.inner.session_hub.subscribe(handler)
    }

    /// Fan-in of inbound streams across every accepted session, each with
    /// its initial headers.
    pub fn on_stream(
        &self,
        handler: impl FnMut((Stream, HeaderBlock)) + Send + 'static,
    ) -> Subscription {
        self.inner.stream_hub.subscribe(handler)
    }

    pub fn on_error(&self, handler: impl FnMut(Error) + Send + 'static) -> Subscription {
        self.inner.error_hub.subscribe(handler)
    }

    pub fn once_close(&self, handler: impl FnOnce() + Send + 'static) -> Subscription {
        self.inner.close_hub.subscribe_once(move |()| handler())
    }

    /// Graceful close: stops accepting, asks every session to close, waits
    /// for the registry to drain. `on_done` fires exactly once, synchronously
    /// if the controller already closed.
    pub fn close(&self, on_done: impl FnOnce() + Send + 'static) {
        self.inner.close_hub.subscribe_once(move |()| on_done());
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();
        let sessions: Vec<Session> = lock(&self.inner.sessions).values().cloned().collect();
        for session in sessions {
            session.close(|| {});
        }
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                if lock(&server.inner.sessions).is_empty() {
                    break;
                }
                server.inner.drained.notified().await;
            }
            server.finish_close();
        });
    }

    fn finish_close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("server closed");
        self.inner.close_hub.latch(());
        self.inner.close_hub.flush();
    }

    /// Handshakes one accepted connection and runs its stream-accept loop.
    async fn drive_session(&self, socket: TcpStream) {
        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!(error = %err, "set_nodelay failed");
        }
        let mut builder = h2::server::Builder::new();
        self.inner.config.apply_server(&mut builder);
        let mut connection = match builder.handshake(socket).await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(error = %err, "server handshake failed");
                self.inner.error_hub.emit(error::session_error(err));
                return;
            }
        };

        let session = Session::new_server(self.inner.config.clone());
        self.adopt(&session);
        self.inner.session_hub.emit(session.clone());

        loop {
            tokio::select! {
                next = connection.accept() => match next {
                    Some(Ok((request, respond))) => {
                        stream::accept_server_stream(&session, request, respond);
                    }
                    Some(Err(err)) => {
                        session.fatal(Error::from(err));
                        return;
                    }
                    None => {
                        session.transport_closed();
                        return;
                    }
                },
                _ = session.inner.shutdown.notified() => {
                    // Lets in-flight streams finish while refusing new ones;
                    // the accept loop keeps running until the engine reports
                    // the connection done.
                    connection.graceful_shutdown();
                }
            }
        }
    }

    /// Registers a session and wires its stream events into the controller
    /// fan-in. The registry entry is removed when the session closes.
    fn adopt(&self, session: &Session) {
        lock(&self.inner.sessions).insert(session.id(), session.clone());

        let fan_in = self.inner.clone();
        session.on_stream(move |(stream, headers)| {
            fan_in.stream_hub.emit((stream, headers));
        });

        let registry = self.inner.clone();
        let id = session.id();
        session.once_close(move || {
            lock(&registry.sessions).remove(&id);
            registry.drained.notify_one();
        });
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("sessions", &self.sessions())
            .field("closed", &self.is_closed())
            .finish()
    }
}
