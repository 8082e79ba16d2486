//! Stream handle: one logical exchange within a session.
//!
//! A stream wraps the engine's send/receive halves and exposes the lifecycle
//! protocol: respond, data, the want-trailers readiness handshake, server
//! push, and idempotent close. Exactly one terminal close event fires per
//! stream, carrying the reset-code (`0` on graceful finish), and no event is
//! delivered after it.

mod state;

pub use state::StreamState;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use h2::client::{PushedResponseFuture, SendRequest};
use h2::server::{SendPushedResponse, SendResponse};
use h2::{RecvStream, SendStream};
use http::Request;

use crate::error::{self, Error, ResetCode, Result};
use crate::events::{Hub, Subscription};
use crate::headers::HeaderBlock;
use crate::session::{Session, SessionInner};

/// Who opened the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientInitiated,
    /// Server push.
    ServerInitiated,
}

/// Options for opening a client-initiated stream.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// End the local direction at the request headers (no body).
    pub end_stream: bool,
    /// Arm the want-trailers protocol: the final data chunk is sent without
    /// END_STREAM and the want-trailers event fires so trailers can follow.
    pub wait_for_trailers: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            end_stream: true,
            wait_for_trailers: false,
        }
    }
}

/// Options for sending response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespondOptions {
    pub end_stream: bool,
    pub wait_for_trailers: bool,
}

pub(crate) enum Responder {
    Root(SendResponse<Bytes>),
    Pushed(SendPushedResponse<Bytes>),
}

#[derive(Default)]
struct StreamHubs {
    /// Client: final response headers.
    response: Hub<HeaderBlock>,
    /// Informational (1xx-style) headers.
    info: Hub<HeaderBlock>,
    data: Hub<Bytes>,
    trailers: Hub<HeaderBlock>,
    want_trailers: Hub<()>,
    close: Hub<ResetCode>,
    error: Hub<Error>,
    /// Client: pushed streams attributed to this one, with their request
    /// headers.
    push: Hub<(Stream, HeaderBlock)>,
}

enum WriteOutcome {
    Continue,
    FinishedLocal,
    WantTrailers,
}

pub(crate) struct StreamInner {
    serial: u64,
    /// Engine-assigned identifier; 0 until the exchange is dispatched.
    id: AtomicU32,
    direction: Direction,
    state: Mutex<StreamState>,
    session: Weak<SessionInner>,
    dispatcher: crate::session::dispatch::Dispatcher,
    /// Writes issued before the engine accepted the request are buffered in
    /// order and replayed on dispatch.
    pending: Mutex<Option<Vec<(Bytes, bool)>>>,
    send: Mutex<Option<SendStream<Bytes>>>,
    responder: Mutex<Option<Responder>>,
    responded: AtomicBool,
    trailers_armed: AtomicBool,
    trailers_sent: AtomicBool,
    received_headers: Mutex<Option<HeaderBlock>>,
    received_trailers: Mutex<Option<HeaderBlock>>,
    reset_code: Mutex<Option<ResetCode>>,
    hubs: StreamHubs,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to one exchange. Cheap to clone; all clones refer to the same
/// stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    fn build(
        session: &Session,
        direction: Direction,
        initial_state: StreamState,
        responder: Option<Responder>,
        buffer_writes: bool,
    ) -> Stream {
        Stream {
            inner: Arc::new(StreamInner {
                serial: session.inner.next_stream_serial(),
                id: AtomicU32::new(0),
                direction,
                state: Mutex::new(initial_state),
                session: session.downgrade(),
                dispatcher: session.inner.dispatcher.clone(),
                pending: Mutex::new(if buffer_writes { Some(Vec::new()) } else { None }),
                send: Mutex::new(None),
                responder: Mutex::new(responder),
                responded: AtomicBool::new(false),
                trailers_armed: AtomicBool::new(false),
                trailers_sent: AtomicBool::new(false),
                received_headers: Mutex::new(None),
                received_trailers: Mutex::new(None),
                reset_code: Mutex::new(None),
                hubs: StreamHubs::default(),
            }),
        }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// Engine-assigned stream identifier, opaque to this layer. `None` until
    /// the exchange has been dispatched.
    pub fn id(&self) -> Option<u32> {
        match self.inner.id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.inner.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// The owning session, unless it has already been dropped.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.upgrade().map(|inner| Session { inner })
    }

    /// Headers received from the peer (request headers on the server side,
    /// response headers on the client side).
    pub fn received_headers(&self) -> Option<HeaderBlock> {
        lock(&self.inner.received_headers).clone()
    }

    /// Trailers received from the peer, populated only at stream end.
    pub fn received_trailers(&self) -> Option<HeaderBlock> {
        lock(&self.inner.received_trailers).clone()
    }

    /// Set only if the stream terminated abnormally.
    pub fn reset_code(&self) -> Option<ResetCode> {
        *lock(&self.inner.reset_code)
    }

    // -------------------------------------------------------------------
    // Write path
    // -------------------------------------------------------------------

    /// Server-side: sends response headers. Fails with `InvalidState` if
    /// called more than once or after the stream closed.
    pub fn respond(&self, headers: &HeaderBlock, options: RespondOptions) -> Result<()> {
        if self.is_closed() {
            return Err(error::invalid_state("stream is closed"));
        }
        // Validate before taking the responded slot: a rejected call sends
        // nothing on the wire and must leave the stream usable for a
        // corrected retry.
        let response = headers.to_response()?;
        if self.inner.responded.swap(true, Ordering::SeqCst) {
            return Err(error::invalid_state("response already sent"));
        }
        let end = options.end_stream && !options.wait_for_trailers;

        let result = {
            let mut responder = lock(&self.inner.responder);
            match responder.as_mut() {
                Some(Responder::Root(sr)) => sr.send_response(response, end),
                Some(Responder::Pushed(sp)) => sp.send_response(response, end),
                None => {
                    self.inner.responded.store(false, Ordering::SeqCst);
                    return Err(error::invalid_state("respond is server-side"));
                }
            }
        };
        let send = match result {
            Ok(send) => send,
            Err(err) => {
                self.inner.responded.store(false, Ordering::SeqCst);
                return Err(Error::from(err));
            }
        };
        if options.wait_for_trailers {
            self.inner.trailers_armed.store(true, Ordering::SeqCst);
        }
        self.inner.id.store(u32::from(send.stream_id()), Ordering::SeqCst);
        *lock(&self.inner.send) = Some(send);

        if end {
            self.finish_local();
        } else if options.end_stream && options.wait_for_trailers {
            // Headers-only response with trailers to follow.
            self.fire_want_trailers();
        }
        Ok(())
    }

    /// Sends one data chunk. With the want-trailers protocol armed, the
    /// final chunk is sent without END_STREAM and the want-trailers event
    /// fires instead of ending the stream.
    pub fn send_data(&self, data: Bytes, end_stream: bool) -> Result<()> {
        if self.is_closed() {
            return Err(error::invalid_state("stream is closed"));
        }
        {
            let mut pending = lock(&self.inner.pending);
            if let Some(buffer) = pending.as_mut() {
                buffer.push((data, end_stream));
                return Ok(());
            }
        }
        let outcome = {
            let mut send = lock(&self.inner.send);
            let send = send
                .as_mut()
                .ok_or_else(|| error::invalid_state("stream is not writable"))?;
            self.write_chunk(send, data, end_stream)?
        };
        self.apply_write_outcome(outcome);
        Ok(())
    }

    /// Sends trailers. Valid at most once, and only after the want-trailers
    /// event fired; sending earlier is a readiness violation.
    pub fn send_trailers(&self, trailers: &HeaderBlock) -> Result<()> {
        if self.is_closed() {
            return Err(error::invalid_state("stream is closed"));
        }
        if !self.inner.hubs.want_trailers.is_latched() {
            return Err(error::invalid_state(
                "peer has not signaled trailer readiness",
            ));
        }
        // Validate before taking the sent slot, as in respond.
        let map = trailers.to_header_map(true)?;
        if self.inner.trailers_sent.swap(true, Ordering::SeqCst) {
            return Err(error::invalid_state("trailers already sent"));
        }
        {
            let mut send = lock(&self.inner.send);
            let Some(send) = send.as_mut() else {
                self.inner.trailers_sent.store(false, Ordering::SeqCst);
                return Err(error::invalid_state("stream is not writable"));
            };
            if let Err(err) = send.send_trailers(map) {
                self.inner.trailers_sent.store(false, Ordering::SeqCst);
                return Err(Error::from(err));
            }
        }
        self.finish_local();
        Ok(())
    }

    /// True only while the session-level push flag is on and this stream has
    /// not yet closed.
    pub fn push_allowed(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.session() {
            Some(session) => session.inner.is_server() && session.push_enabled(),
            None => false,
        }
    }

    /// Opens a server-push stream attributed to this one. The child is
    /// independent of its parent once created.
    pub fn open_push(&self, headers: &HeaderBlock) -> Result<Stream> {
        let session = self
            .session()
            .ok_or_else(|| error::invalid_state("session is gone"))?;
        if !session.inner.is_server() {
            return Err(error::invalid_state("push is server-side"));
        }
        if self.is_closed() {
            return Err(error::invalid_state("parent stream is closed"));
        }
        if !session.push_enabled() {
            return Err(error::push_disabled());
        }
        let request = headers.to_request()?;

        let pushed = {
            let mut responder = lock(&self.inner.responder);
            match responder.as_mut() {
                Some(Responder::Root(sr)) => sr.push_request(request).map_err(Error::from)?,
                Some(Responder::Pushed(_)) => {
                    return Err(error::invalid_state("cannot push from a pushed stream"));
                }
                None => return Err(error::invalid_state("push is server-side")),
            }
        };

        // The client never sends on a pushed stream, so the remote direction
        // is finished from the start.
        let child = Stream::build(
            &session,
            Direction::ServerInitiated,
            StreamState::HalfClosedRemote,
            Some(Responder::Pushed(pushed)),
            false,
        );
        session.inner.register_stream(child.clone());
        tracing::debug!(
            session = session.id(),
            parent = self.inner.serial,
            "opened push stream"
        );
        Ok(child)
    }

    /// Requests termination with the given reset code (`0` = normal).
    /// Closing an already-closed stream succeeds silently.
    ///
    /// A normal close on a writable stream finishes the local direction
    /// with END_STREAM rather than resetting, so frames already sent (the
    /// response headers in particular) still reach the peer; the stream
    /// settles once the remote direction finishes too. Non-zero codes
    /// reset immediately.
    pub fn close(&self, code: ResetCode) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if code == ResetCode::NO_ERROR
            && !self.inner.trailers_armed.load(Ordering::SeqCst)
            && self.send_data(Bytes::new(), true).is_ok()
        {
            return Ok(());
        }
        let reason = h2::Reason::from(code);
        {
            let mut send = lock(&self.inner.send);
            if let Some(send) = send.as_mut() {
                send.send_reset(reason);
            } else {
                let mut responder = lock(&self.inner.responder);
                match responder.as_mut() {
                    Some(Responder::Root(sr)) => sr.send_reset(reason),
                    Some(Responder::Pushed(sp)) => sp.send_reset(reason),
                    None => {}
                }
            }
        }
        self.terminate(code);
        Ok(())
    }

    // -------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------

    pub fn on_data(&self, handler: impl FnMut(Bytes) + Send + 'static) -> Subscription {
        self.inner.hubs.data.subscribe(handler)
    }

    /// Client: final response headers.
    pub fn once_response(
        &self,
        handler: impl FnOnce(HeaderBlock) + Send + 'static,
    ) -> Subscription {
        self.inner.hubs.response.subscribe_once(handler)
    }

    /// Informational (1xx-style) headers.
    pub fn on_headers(&self, handler: impl FnMut(HeaderBlock) + Send + 'static) -> Subscription {
        self.inner.hubs.info.subscribe(handler)
    }

    pub fn once_trailers(
        &self,
        handler: impl FnOnce(HeaderBlock) + Send + 'static,
    ) -> Subscription {
        self.inner.hubs.trailers.subscribe_once(handler)
    }

    pub fn once_want_trailers(&self, handler: impl FnOnce() + Send + 'static) -> Subscription {
        self.inner.hubs.want_trailers.subscribe_once(move |()| handler())
    }

    /// Always fires exactly once per stream with the terminal reset-code,
    /// `0` on graceful finish. Fires synchronously if the stream already
    /// closed.
    pub fn once_close(&self, handler: impl FnOnce(ResetCode) + Send + 'static) -> Subscription {
        self.inner.hubs.close.subscribe_once(handler)
    }

    pub fn once_error(&self, handler: impl FnOnce(Error) + Send + 'static) -> Subscription {
        self.inner.hubs.error.subscribe_once(handler)
    }

    /// Client: pushed streams attributed to this one.
    pub fn on_push(
        &self,
        handler: impl FnMut((Stream, HeaderBlock)) + Send + 'static,
    ) -> Subscription {
        self.inner.hubs.push.subscribe(handler)
    }

    // -------------------------------------------------------------------
    // Internal lifecycle
    // -------------------------------------------------------------------

    fn write_chunk(
        &self,
        send: &mut SendStream<Bytes>,
        data: Bytes,
        end_stream: bool,
    ) -> Result<WriteOutcome> {
        let finish_with_trailers =
            end_stream && self.inner.trailers_armed.load(Ordering::SeqCst);
        if finish_with_trailers {
            send.send_data(data, false).map_err(Error::from)?;
            Ok(WriteOutcome::WantTrailers)
        } else {
            send.send_data(data, end_stream).map_err(Error::from)?;
            Ok(if end_stream {
                WriteOutcome::FinishedLocal
            } else {
                WriteOutcome::Continue
            })
        }
    }

    fn apply_write_outcome(&self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Continue => {}
            WriteOutcome::FinishedLocal => self.finish_local(),
            WriteOutcome::WantTrailers => self.fire_want_trailers(),
        }
    }

    /// Installs the engine's send half and replays writes buffered before
    /// dispatch, preserving their order.
    fn install_send(&self, send_stream: SendStream<Bytes>) {
        let mut outcomes = Vec::new();
        let mut write_error = None;
        {
            let mut pending = lock(&self.inner.pending);
            let mut send = lock(&self.inner.send);
            *send = Some(send_stream);
            let queued = pending.take().unwrap_or_default();
            if let Some(send) = send.as_mut() {
                for (data, end_stream) in queued {
                    match self.write_chunk(send, data, end_stream) {
                        Ok(outcome) => outcomes.push(outcome),
                        Err(err) => {
                            write_error = Some(err);
                            break;
                        }
                    }
                }
            }
        }
        for outcome in outcomes {
            self.apply_write_outcome(outcome);
        }
        if let Some(err) = write_error {
            self.fail(err, ResetCode::INTERNAL_ERROR);
        }
    }

    fn fire_want_trailers(&self) {
        if self.inner.hubs.want_trailers.latch(()) {
            let stream = self.clone();
            self.inner
                .dispatcher
                .enqueue(move || stream.inner.hubs.want_trailers.flush());
        }
    }

    fn finish_local(&self) {
        let settle = {
            let mut st = lock(&self.inner.state);
            let (next, settle) = state::advance_local(*st);
            *st = next;
            settle
        };
        if settle {
            self.settle_graceful(ResetCode::NO_ERROR);
        }
    }

    fn finish_remote(&self) {
        let settle = {
            let mut st = lock(&self.inner.state);
            let (next, settle) = state::advance_remote(*st);
            *st = next;
            settle
        };
        if settle {
            self.settle_graceful(ResetCode::NO_ERROR);
        }
    }

    /// Marks the stream closed immediately. Returns `false` if it already
    /// was, which is what makes every terminal path at-most-once.
    fn settle_now(&self, code: ResetCode) -> bool {
        {
            let mut st = lock(&self.inner.state);
            if *st == StreamState::Closed {
                return false;
            }
            *st = StreamState::Closed;
        }
        if code != ResetCode::NO_ERROR {
            *lock(&self.inner.reset_code) = Some(code);
        }
        self.inner.hubs.close.latch(code);
        if let Some(session) = self.inner.session.upgrade() {
            session.detach_stream(self.inner.serial);
        }
        true
    }

    /// Graceful settle: travels the dispatch queue so every event the reader
    /// produced beforehand is delivered first.
    fn settle_graceful(&self, code: ResetCode) {
        let stream = self.clone();
        self.inner.dispatcher.enqueue(move || {
            if stream.settle_now(code) {
                stream.inner.hubs.close.flush();
            }
        });
    }

    /// Forced settle: the closed state is visible immediately, suppressing
    /// dispatch of events already queued for this stream.
    pub(crate) fn terminate(&self, code: ResetCode) {
        if !self.settle_now(code) {
            return;
        }
        let stream = self.clone();
        self.inner
            .dispatcher
            .enqueue(move || stream.inner.hubs.close.flush());
    }

    /// Terminal failure: error event, then close, in that order on the
    /// dispatch queue. Dropped entirely if the stream already settled, since
    /// close is terminal.
    fn fail(&self, err: Error, code: ResetCode) {
        let stream = self.clone();
        self.inner.dispatcher.enqueue(move || {
            if stream.settle_now(code) {
                stream.inner.hubs.error.latch(err);
                stream.inner.hubs.error.flush();
                stream.inner.hubs.close.flush();
            }
        });
    }

    fn fail_from_engine(&self, err: h2::Error) {
        let code = err
            .reason()
            .map(ResetCode::from)
            .unwrap_or(ResetCode::INTERNAL_ERROR);
        if code == ResetCode::NO_ERROR {
            // A reset carrying NO_ERROR is a graceful finish, not a failure.
            self.settle_graceful(ResetCode::NO_ERROR);
        } else {
            self.fail(Error::from(err), code);
        }
    }

    // Emission helpers: events travel the session dispatch queue, and a
    // stream that was force-closed in the meantime delivers nothing further.

    fn emit_data(&self, data: Bytes) {
        let stream = self.clone();
        self.inner.dispatcher.enqueue(move || {
            if !stream.is_closed() {
                stream.inner.hubs.data.emit(data);
            }
        });
    }

    fn emit_response(&self, headers: HeaderBlock) {
        *lock(&self.inner.received_headers) = Some(headers.clone());
        let stream = self.clone();
        self.inner.dispatcher.enqueue(move || {
            if !stream.is_closed() {
                stream.inner.hubs.response.emit(headers);
            }
        });
    }

    fn emit_info(&self, headers: HeaderBlock) {
        let stream = self.clone();
        self.inner.dispatcher.enqueue(move || {
            if !stream.is_closed() {
                stream.inner.hubs.info.emit(headers);
            }
        });
    }

    fn emit_trailers(&self, trailers: HeaderBlock) {
        *lock(&self.inner.received_trailers) = Some(trailers.clone());
        let stream = self.clone();
        self.inner.dispatcher.enqueue(move || {
            if !stream.is_closed() {
                stream.inner.hubs.trailers.emit(trailers);
            }
        });
    }

    fn emit_push(&self, child: Stream, headers: HeaderBlock) {
        // Not guarded on the parent's closed flag: a pushed stream is
        // independent once created, and its promise may race the parent's
        // own graceful finish.
        let stream = self.clone();
        self.inner.dispatcher.enqueue(move || {
            stream.inner.hubs.push.emit((child, headers));
        });
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id())
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

// -----------------------------------------------------------------------
// Reader tasks: translate engine lifecycle events into dispatches.
// -----------------------------------------------------------------------

/// Begins a client-initiated exchange: returns the handle immediately and
/// completes the send against the engine on a spawned task.
pub(crate) fn spawn_client_request(
    session: &Session,
    send_request: SendRequest<Bytes>,
    request: Request<()>,
    options: OpenOptions,
) -> Stream {
    let stream = Stream::build(
        session,
        Direction::ClientInitiated,
        StreamState::Idle,
        None,
        true,
    );
    if options.wait_for_trailers {
        stream.inner.trailers_armed.store(true, Ordering::SeqCst);
    }
    session.inner.register_stream(stream.clone());

    let s = stream.clone();
    tokio::spawn(async move {
        let mut ready = match send_request.ready().await {
            Ok(ready) => ready,
            Err(err) => {
                s.fail_from_engine(err);
                return;
            }
        };
        if s.is_closed() {
            // Closed before the engine accepted it; nothing was sent.
            return;
        }

        let has_queued_writes = lock(&s.inner.pending)
            .as_ref()
            .map(|buffer| !buffer.is_empty())
            .unwrap_or(false);
        let wait_for_trailers = s.inner.trailers_armed.load(Ordering::SeqCst);
        let end_at_headers = options.end_stream && !wait_for_trailers && !has_queued_writes;

        let (response, send_stream) = match ready.send_request(request, end_at_headers) {
            Ok(pair) => pair,
            Err(err) => {
                s.fail_from_engine(err);
                return;
            }
        };
        s.inner
            .id
            .store(u32::from(send_stream.stream_id()), Ordering::SeqCst);
        {
            let mut st = lock(&s.inner.state);
            if *st == StreamState::Idle {
                *st = StreamState::Open;
            }
        }
        s.install_send(send_stream);
        if end_at_headers {
            s.finish_local();
        } else if options.end_stream && wait_for_trailers && !has_queued_writes {
            // Headers-only request with trailers to follow.
            s.fire_want_trailers();
        }

        let mut response = response;
        let mut push_promises = response.push_promises();
        let parent = s.clone();
        tokio::spawn(async move {
            while let Some(promise) = push_promises.push_promise().await {
                match promise {
                    Ok(promise) => {
                        let (request, response_future) = promise.into_parts();
                        adopt_client_push(&parent, request, response_future);
                    }
                    Err(err) => {
                        tracing::debug!(error = %err, "push promise stream ended");
                        break;
                    }
                }
            }
        });

        match response.await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let headers = HeaderBlock::from_response_parts(parts.status, &parts.headers);
                if parts.status.is_informational() {
                    s.emit_info(headers);
                } else {
                    s.emit_response(headers);
                }
                recv_loop(s, body).await;
            }
            Err(err) => s.fail_from_engine(err),
        }
    });

    stream
}

/// Adopts an inbound stream accepted on a server session: registers it,
/// announces it on the session's stream hub, then starts its reader.
pub(crate) fn accept_server_stream(
    session: &Session,
    request: Request<RecvStream>,
    send_response: SendResponse<Bytes>,
) -> Stream {
    let (parts, body) = request.into_parts();
    let headers = HeaderBlock::from_request_parts(&parts);

    let stream = Stream::build(
        session,
        Direction::ClientInitiated,
        StreamState::Open,
        Some(Responder::Root(send_response)),
        false,
    );
    stream
        .inner
        .id
        .store(u32::from(body.stream_id()), Ordering::SeqCst);
    *lock(&stream.inner.received_headers) = Some(headers.clone());
    session.inner.register_stream(stream.clone());

    // The stream announcement must precede any of its data events on the
    // dispatch queue.
    let session_inner = session.inner.clone();
    let announced = stream.clone();
    session.inner.dispatcher.enqueue(move || {
        session_inner.stream_hub.emit((announced, headers));
    });

    let s = stream.clone();
    tokio::spawn(async move {
        recv_loop(s, body).await;
    });
    stream
}

/// A push promise observed by the client: an independent inbound stream
/// attributed to its parent at creation time only.
fn adopt_client_push(parent: &Stream, request: Request<()>, response: PushedResponseFuture) {
    let Some(session) = parent.session() else {
        return;
    };
    let (parts, _) = request.into_parts();
    let headers = HeaderBlock::from_request_parts(&parts);

    // The client cannot send on a pushed stream.
    let child = Stream::build(
        &session,
        Direction::ServerInitiated,
        StreamState::HalfClosedLocal,
        None,
        false,
    );
    session.inner.register_stream(child.clone());
    parent.emit_push(child.clone(), headers);

    tokio::spawn(async move {
        match response.await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                child
                    .inner
                    .id
                    .store(u32::from(body.stream_id()), Ordering::SeqCst);
                let headers = HeaderBlock::from_response_parts(parts.status, &parts.headers);
                child.emit_response(headers);
                recv_loop(child, body).await;
            }
            Err(err) => child.fail_from_engine(err),
        }
    });
}

/// Drives the receive half: data, then trailers, then the remote finish.
/// Event order per stream is headers, data, trailers, close.
async fn recv_loop(stream: Stream, mut body: RecvStream) {
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(data) => {
                if let Err(err) = body.flow_control().release_capacity(data.len()) {
                    tracing::debug!(error = %err, "failed to release flow-control capacity");
                }
                stream.emit_data(data);
            }
            Err(err) => {
                stream.fail_from_engine(err);
                return;
            }
        }
    }
    match body.trailers().await {
        Ok(Some(map)) => stream.emit_trailers(HeaderBlock::from_header_map(&map)),
        Ok(None) => {}
        Err(err) => {
            stream.fail_from_engine(err);
            return;
        }
    }
    stream.finish_remote();
}
