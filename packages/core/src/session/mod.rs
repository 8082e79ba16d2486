//! Session handle: one multiplexed HTTP/2 connection.
//!
//! A session owns its live stream set, the local settings snapshot, the
//! push-availability flag, and the dispatch queue that serializes handler
//! invocations for everything sharing the connection. Closing is idempotent;
//! a graceful close drains in-flight streams first, a fatal failure converts
//! every live stream into a `SESSION_TERMINATED` close before the session's
//! own close event fires.

pub(crate) mod dispatch;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::Notify;

use crate::config::{SessionConfig, Settings};
use crate::error::{self, Error, ResetCode, Result};
use crate::events::{Hub, Subscription};
use crate::headers::HeaderBlock;
use crate::stream::{self, OpenOptions, Stream};

use dispatch::Dispatcher;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) enum SessionKind {
    Client {
        send_request: h2::client::SendRequest<Bytes>,
    },
    Server,
}

pub(crate) struct SessionInner {
    serial: u64,
    kind: SessionKind,
    config: SessionConfig,
    push_enabled: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    next_stream_serial: AtomicU64,
    streams: Mutex<HashMap<u64, Stream>>,
    /// Signaled whenever a stream detaches; the graceful-close drain task
    /// rechecks emptiness on every permit.
    pub(crate) drained: Notify,
    /// Tells the connection driver (server accept loop) to stop taking new
    /// streams and shut the connection down gracefully.
    pub(crate) shutdown: Notify,
    /// Signaled once the session has settled. The client connection driver
    /// listens on it and drops the transport, since the engine has no
    /// client-side graceful shutdown call.
    pub(crate) settled: Arc<Notify>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) stream_hub: Hub<(Stream, HeaderBlock)>,
    pub(crate) error_hub: Hub<Error>,
    pub(crate) close_hub: Hub<()>,
}

impl SessionInner {
    fn new(kind: SessionKind, config: SessionConfig) -> Arc<SessionInner> {
        let push_enabled = config.enable_push;
        Arc::new(SessionInner {
            serial: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            kind,
            config,
            push_enabled: AtomicBool::new(push_enabled),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_stream_serial: AtomicU64::new(0),
            streams: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            shutdown: Notify::new(),
            settled: Arc::new(Notify::new()),
            dispatcher: Dispatcher::spawn(),
            stream_hub: Hub::new(),
            error_hub: Hub::new(),
            close_hub: Hub::new(),
        })
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<u64, Stream>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_server(&self) -> bool {
        matches!(self.kind, SessionKind::Server)
    }

    pub(crate) fn next_stream_serial(&self) -> u64 {
        self.next_stream_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_stream(&self, stream: Stream) {
        self.streams().insert(stream.serial(), stream);
    }

    /// Removes a settled stream from the live set. A stream destroyed while
    /// its session stays open simply detaches here.
    pub(crate) fn detach_stream(&self, serial: u64) {
        self.streams().remove(&serial);
        self.drained.notify_one();
    }

    pub(crate) fn live_is_empty(&self) -> bool {
        self.streams().is_empty()
    }
}

/// Handle to one multiplexed connection. Cheap to clone; all clones refer to
/// the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new_client(
        send_request: h2::client::SendRequest<Bytes>,
        config: SessionConfig,
    ) -> Session {
        Session {
            inner: SessionInner::new(SessionKind::Client { send_request }, config),
        }
    }

    pub(crate) fn new_server(config: SessionConfig) -> Session {
        Session {
            inner: SessionInner::new(SessionKind::Server, config),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.serial
    }

    /// Begins a client-initiated exchange. The handle is returned
    /// immediately; the request is dispatched to the engine on a spawned
    /// task, and writes issued before dispatch are buffered in order.
    pub fn request(&self, headers: &HeaderBlock, options: OpenOptions) -> Result<Stream> {
        let send_request = match &self.inner.kind {
            SessionKind::Client { send_request } => send_request.clone(),
            SessionKind::Server => {
                return Err(error::invalid_state("requests are client-side"));
            }
        };
        if self.is_closed() || self.inner.closing.load(Ordering::SeqCst) {
            return Err(error::invalid_state("session is closed"));
        }
        let request = headers.to_request()?;
        Ok(stream::spawn_client_request(self, send_request, request, options))
    }

    /// Snapshot of the local settings, recomputed on every call.
    pub fn local_settings(&self) -> Settings {
        self.inner.config.settings(self.push_enabled())
    }

    pub fn push_enabled(&self) -> bool {
        self.inner.push_enabled.load(Ordering::SeqCst)
    }

    /// Toggles the session-level push flag. Mid-flight streams observe the
    /// change immediately through [`Stream::push_allowed`].
    pub fn set_push_enabled(&self, enabled: bool) {
        self.inner.push_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Streams currently attached to this session.
    pub fn live_streams(&self) -> usize {
        self.inner.streams().len()
    }

    /// Graceful close: stops accepting new streams, waits for the live set
    /// to drain, then settles. `on_done` fires exactly once, synchronously
    /// if the session was already closed.
    pub fn close(&self, on_done: impl FnOnce() + Send + 'static) {
        self.inner.close_hub.subscribe_once(move |()| on_done());
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                if session.inner.live_is_empty() {
                    break;
                }
                session.inner.drained.notified().await;
            }
            session.finish_close();
        });
    }

    /// Forced teardown of the live set: every open stream settles with
    /// [`ResetCode::SESSION_TERMINATED`].
    pub fn destroy_all_streams(&self) {
        let streams: Vec<Stream> = self.inner.streams().drain().map(|(_, s)| s).collect();
        if !streams.is_empty() {
            tracing::debug!(
                session = self.id(),
                count = streams.len(),
                "terminating live streams"
            );
        }
        for stream in streams {
            stream.terminate(ResetCode::SESSION_TERMINATED);
        }
        self.inner.drained.notify_one();
    }

    /// Persistent subscription fired once per new inbound stream with its
    /// initial headers.
    pub fn on_stream(
        &self,
        handler: impl FnMut((Stream, HeaderBlock)) + Send + 'static,
    ) -> Subscription {
        self.inner.stream_hub.subscribe(handler)
    }

    pub fn once_error(&self, handler: impl FnOnce(Error) + Send + 'static) -> Subscription {
        self.inner.error_hub.subscribe_once(handler)
    }

    pub fn on_error(&self, handler: impl FnMut(Error) + Send + 'static) -> Subscription {
        self.inner.error_hub.subscribe(handler)
    }

    pub fn once_close(&self, handler: impl FnOnce() + Send + 'static) -> Subscription {
        self.inner.close_hub.subscribe_once(move |()| handler())
    }

    /// Session-level failure: records the error, converts every live stream
    /// into a `SESSION_TERMINATED` close, then settles the session itself.
    /// Stream closes are dispatched before the session's close event.
    pub(crate) fn fatal(&self, err: Error) {
        tracing::warn!(session = self.id(), error = %err, "session failed");
        self.inner.error_hub.latch(err);
        let inner = self.inner.clone();
        self.inner.dispatcher.enqueue(move || inner.error_hub.flush());
        self.destroy_all_streams();
        self.finish_close();
    }

    /// The underlying transport finished without a session-level error.
    pub(crate) fn transport_closed(&self) {
        self.destroy_all_streams();
        self.finish_close();
    }

    fn finish_close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(session = self.id(), "session closed");
        self.inner.close_hub.latch(());
        let inner = self.inner.clone();
        self.inner.dispatcher.enqueue(move || inner.close_hub.flush());
        self.inner.settled.notify_one();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.serial)
            .field("server", &self.inner.is_server())
            .field("closed", &self.is_closed())
            .finish()
    }
}
