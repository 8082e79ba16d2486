//! End-to-end lifecycle tests against a loopback server and client pair.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use strand_core::{
    Client, Direction, HeaderBlock, OpenOptions, ResetCode, RespondOptions, Server, Session,
    SessionConfig, SettingId,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(config: SessionConfig) -> (Server, String) {
    let server = Server::new(config);
    let (tx, rx) = oneshot::channel();
    server.listen("127.0.0.1:0", move |addr| {
        let _ = tx.send(addr);
    });
    let addr = timeout(WAIT, rx).await.expect("bind timed out").unwrap();
    (server, format!("http://{addr}"))
}

async fn connect(authority: &str) -> Session {
    let client = Client::new(SessionConfig::default());
    let (tx, rx) = oneshot::channel();
    client.connect_with_error(
        authority,
        move |session| {
            let _ = tx.send(session);
        },
        |err| {
            eprintln!("connect failed: {err}");
        },
    );
    timeout(WAIT, rx).await.expect("connect timed out").unwrap()
}

fn get_headers(authority: &str, path: &str) -> HeaderBlock {
    let mut headers = HeaderBlock::new();
    headers
        .insert(":method", "GET")
        .insert(":path", path)
        .insert(":scheme", "http")
        .insert(":authority", authority.trim_start_matches("http://"));
    headers
}

fn status(code: &str) -> HeaderBlock {
    let mut headers = HeaderBlock::new();
    headers.insert(":status", code);
    headers
}

#[tokio::test(flavor = "multi_thread")]
async fn respond_then_close_zero_reaches_the_client() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    server.on_stream(|(stream, headers)| {
        assert_eq!(headers.method(), Some("GET"));
        assert_eq!(headers.path(), Some("/"));
        stream.respond(&status("200"), RespondOptions::default()).unwrap();
        stream.close(ResetCode::NO_ERROR).unwrap();
    });

    let session = connect(&authority).await;
    let stream = session
        .request(&get_headers(&authority, "/"), OpenOptions::default())
        .unwrap();

    let (response_tx, response_rx) = oneshot::channel();
    stream.once_response(move |headers| {
        let _ = response_tx.send(headers);
    });
    let (close_tx, close_rx) = oneshot::channel();
    stream.once_close(move |code| {
        let _ = close_tx.send(code);
    });

    let headers = timeout(WAIT, response_rx).await.unwrap().unwrap();
    assert_eq!(headers.status(), Some("200"));
    let code = timeout(WAIT, close_rx).await.unwrap().unwrap();
    assert_eq!(code, ResetCode::NO_ERROR);
    assert_eq!(stream.reset_code(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn request_without_pseudo_headers_is_a_protocol_violation() {
    let (_server, authority) = start_server(SessionConfig::default()).await;
    let session = connect(&authority).await;

    let mut headers = HeaderBlock::new();
    headers.insert(":method", "GET").insert(":path", "/");
    let err = session
        .request(&headers, OpenOptions::default())
        .unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(err.to_string().contains(":scheme"));
    assert_eq!(session.live_streams(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn trailers_require_the_readiness_signal() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    let (trailers_tx, mut trailers_rx) = mpsc::unbounded_channel();
    server.on_stream(move |(stream, _headers)| {
        let tx = trailers_tx.clone();
        stream.once_trailers(move |trailers| {
            let _ = tx.send(trailers);
        });
        stream
            .respond(
                &status("200"),
                RespondOptions {
                    end_stream: true,
                    wait_for_trailers: false,
                },
            )
            .unwrap();
    });

    let session = connect(&authority).await;
    let stream = session
        .request(
            &get_headers(&authority, "/upload"),
            OpenOptions {
                end_stream: false,
                wait_for_trailers: true,
            },
        )
        .unwrap();

    // Before the peer signals readiness, sending trailers is out of order.
    let mut trailers = HeaderBlock::new();
    trailers.insert("x-check", "1");
    assert!(stream.send_trailers(&trailers).unwrap_err().is_invalid_state());

    let (want_tx, want_rx) = oneshot::channel();
    stream.once_want_trailers(move || {
        let _ = want_tx.send(());
    });
    // The final chunk arms the readiness event instead of ending the stream.
    stream.send_data(Bytes::from_static(b"payload"), true).unwrap();
    timeout(WAIT, want_rx).await.expect("want-trailers timed out").unwrap();

    // Pseudo-headers are invalid in trailers; the rejected call must not
    // consume the one send the stream gets.
    let mut bad = HeaderBlock::new();
    bad.insert(":status", "200");
    assert!(stream.send_trailers(&bad).unwrap_err().is_protocol_violation());

    stream.send_trailers(&trailers).unwrap();
    // Second send is rejected.
    assert!(stream.send_trailers(&trailers).unwrap_err().is_invalid_state());

    let received = timeout(WAIT, trailers_rx.recv())
        .await
        .expect("trailers timed out")
        .unwrap();
    assert_eq!(received.get("x-check"), Some("1"));

    let (close_tx, close_rx) = oneshot::channel();
    stream.once_close(move |code| {
        let _ = close_tx.send(code);
    });
    let code = timeout(WAIT, close_rx).await.unwrap().unwrap();
    assert_eq!(code, ResetCode::NO_ERROR);
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_respond_leaves_the_stream_usable() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    server.on_stream(|(stream, _headers)| {
        // Missing :status sends nothing on the wire and must not count as
        // the response.
        let err = stream
            .respond(&HeaderBlock::new(), RespondOptions::default())
            .unwrap_err();
        assert!(err.is_protocol_violation());
        stream
            .respond(
                &status("200"),
                RespondOptions {
                    end_stream: true,
                    wait_for_trailers: false,
                },
            )
            .unwrap();
    });

    let session = connect(&authority).await;
    let stream = session
        .request(&get_headers(&authority, "/"), OpenOptions::default())
        .unwrap();

    let (response_tx, response_rx) = oneshot::channel();
    stream.once_response(move |headers| {
        let _ = response_tx.send(headers);
    });
    let headers = timeout(WAIT, response_rx).await.unwrap().unwrap();
    assert_eq!(headers.status(), Some("200"));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_final_chunk_signals_trailer_readiness() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    server.on_stream(|(stream, _headers)| {
        let sender = stream.clone();
        stream.once_want_trailers(move || {
            let mut trailers = HeaderBlock::new();
            trailers.insert("x-digest", "abc");
            sender.send_trailers(&trailers).unwrap();
        });
        stream
            .respond(
                &status("200"),
                RespondOptions {
                    end_stream: false,
                    wait_for_trailers: true,
                },
            )
            .unwrap();
        // No body after all: signal end-of-data with an empty final chunk,
        // which arms the readiness event instead of ending the stream.
        stream.send_data(Bytes::new(), true).unwrap();
    });

    let session = connect(&authority).await;
    let stream = session
        .request(&get_headers(&authority, "/"), OpenOptions::default())
        .unwrap();

    let (trailers_tx, trailers_rx) = oneshot::channel();
    stream.once_trailers(move |trailers| {
        let _ = trailers_tx.send(trailers);
    });
    let (close_tx, close_rx) = oneshot::channel();
    stream.once_close(move |code| {
        let _ = close_tx.send(code);
    });

    let trailers = timeout(WAIT, trailers_rx).await.expect("trailers timed out").unwrap();
    assert_eq!(trailers.get("x-digest"), Some("abc"));
    let code = timeout(WAIT, close_rx).await.unwrap().unwrap();
    assert_eq!(code, ResetCode::NO_ERROR);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_push_reaches_the_client() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    server.on_stream(|(stream, _headers)| {
        assert!(stream.push_allowed());
        let mut promised = HeaderBlock::new();
        promised
            .insert(":method", "GET")
            .insert(":path", "/style.css")
            .insert(":scheme", "http")
            .insert(":authority", "localhost");
        let pushed = stream.open_push(&promised).unwrap();
        pushed.respond(&status("200"), RespondOptions::default()).unwrap();
        pushed.send_data(Bytes::from_static(b"css"), true).unwrap();

        stream.respond(&status("200"), RespondOptions::default()).unwrap();
        stream.send_data(Bytes::from_static(b"html"), true).unwrap();
    });

    let session = connect(&authority).await;
    let stream = session
        .request(&get_headers(&authority, "/"), OpenOptions::default())
        .unwrap();

    let (push_tx, push_rx) = oneshot::channel();
    let mut push_tx = Some(push_tx);
    stream.on_push(move |(pushed, headers)| {
        let (data_tx, data_rx) = oneshot::channel();
        let mut data_tx = Some(data_tx);
        pushed.on_data(move |chunk| {
            if let Some(tx) = data_tx.take() {
                let _ = tx.send(chunk);
            }
        });
        let (close_tx, close_rx) = oneshot::channel();
        pushed.once_close(move |code| {
            let _ = close_tx.send(code);
        });
        // One push expected.
        if let Some(tx) = push_tx.take() {
            let _ = tx.send((pushed, headers, data_rx, close_rx));
        }
    });

    let (pushed, headers, data_rx, close_rx) =
        timeout(WAIT, push_rx).await.expect("push timed out").unwrap();
    assert_eq!(headers.path(), Some("/style.css"));
    assert_eq!(pushed.direction(), Direction::ServerInitiated);

    let chunk = timeout(WAIT, data_rx).await.unwrap().unwrap();
    assert_eq!(&chunk[..], b"css");
    let code = timeout(WAIT, close_rx).await.unwrap().unwrap();
    assert_eq!(code, ResetCode::NO_ERROR);
}

#[tokio::test(flavor = "multi_thread")]
async fn push_on_a_closed_parent_is_invalid_state() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let mut verdict_tx = Some(verdict_tx);
    server.on_stream(move |(stream, _headers)| {
        stream.close(ResetCode::NO_ERROR).unwrap();
        let err = stream.open_push(&get_headers("http://localhost", "/p")).unwrap_err();
        if let Some(tx) = verdict_tx.take() {
            let _ = tx.send(err.is_invalid_state());
        }
    });

    let session = connect(&authority).await;
    let _stream = session
        .request(&get_headers(&authority, "/"), OpenOptions::default())
        .unwrap();
    assert!(timeout(WAIT, verdict_rx).await.unwrap().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn push_flag_off_disables_mid_flight_streams() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let mut verdict_tx = Some(verdict_tx);
    server.on_stream(move |(stream, _headers)| {
        let session = stream.session().unwrap();
        assert!(stream.push_allowed());
        session.set_push_enabled(false);
        let allowed_after = stream.push_allowed();
        let err = stream.open_push(&get_headers("http://localhost", "/p")).unwrap_err();
        stream.respond(&status("200"), RespondOptions { end_stream: true, wait_for_trailers: false }).unwrap();
        if let Some(tx) = verdict_tx.take() {
            let _ = tx.send((allowed_after, err.is_push_disabled()));
        }
    });

    let session = connect(&authority).await;
    let _stream = session
        .request(&get_headers(&authority, "/"), OpenOptions::default())
        .unwrap();
    let (allowed_after, push_disabled) = timeout(WAIT, verdict_rx).await.unwrap().unwrap();
    assert!(!allowed_after);
    assert!(push_disabled);
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_close_terminates_every_stream_before_the_session() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    // Streams stay open on the server side.
    server.on_stream(|(_stream, _headers)| {});

    let session = connect(&authority).await;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let open = OpenOptions {
        end_stream: false,
        wait_for_trailers: false,
    };
    let mut streams = Vec::new();
    for path in ["/a", "/b", "/c"] {
        let stream = session.request(&get_headers(&authority, path), open).unwrap();
        let tx = event_tx.clone();
        stream.once_close(move |code| {
            let _ = tx.send(("stream", code));
        });
        streams.push(stream);
    }
    assert_eq!(session.live_streams(), 3);

    let tx = event_tx.clone();
    session.once_close(move || {
        let _ = tx.send(("session", ResetCode::NO_ERROR));
    });

    session.destroy_all_streams();
    session.close(|| {});

    let mut events = Vec::new();
    for _ in 0..4 {
        events.push(timeout(WAIT, event_rx.recv()).await.expect("event timed out").unwrap());
    }
    assert_eq!(
        events[..3],
        [
            ("stream", ResetCode::SESSION_TERMINATED),
            ("stream", ResetCode::SESSION_TERMINATED),
            ("stream", ResetCode::SESSION_TERMINATED),
        ]
    );
    assert_eq!(events[3], ("session", ResetCode::NO_ERROR));

    for stream in &streams {
        assert!(stream.is_closed());
        assert_eq!(stream.reset_code(), Some(ResetCode::SESSION_TERMINATED));
    }
    assert!(session.is_closed());
    assert_eq!(session.live_streams(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_never_produces_a_session() {
    let client = Client::new(SessionConfig::default());
    let (err_tx, err_rx) = oneshot::channel();
    client.connect_with_error(
        "http://127.0.0.1:1",
        |_session| {
            panic!("no session must be observable on a failed connect");
        },
        move |err| {
            let _ = err_tx.send(err);
        },
    );
    let err = timeout(WAIT, err_rx).await.expect("error timed out").unwrap();
    assert!(err.is_connect_failure());
}

#[tokio::test(flavor = "multi_thread")]
async fn settings_snapshot_tracks_the_push_flag() {
    let (_server, authority) = start_server(SessionConfig::default()).await;
    let session = connect(&authority).await;

    let settings = session.local_settings();
    assert_eq!(settings.get(&SettingId::EnablePush), Some(&1));
    session.set_push_enabled(false);
    let settings = session.local_settings();
    assert_eq!(settings.get(&SettingId::EnablePush), Some(&0));
}

#[tokio::test(flavor = "multi_thread")]
async fn close_subscription_after_settle_fires_synchronously() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    server.on_stream(|(stream, _headers)| {
        stream
            .respond(
                &status("200"),
                RespondOptions {
                    end_stream: true,
                    wait_for_trailers: false,
                },
            )
            .unwrap();
    });

    let session = connect(&authority).await;
    let stream = session
        .request(&get_headers(&authority, "/"), OpenOptions::default())
        .unwrap();

    let (close_tx, close_rx) = oneshot::channel();
    stream.once_close(move |code| {
        let _ = close_tx.send(code);
    });
    assert_eq!(
        timeout(WAIT, close_rx).await.unwrap().unwrap(),
        ResetCode::NO_ERROR
    );

    // Late subscription on a settled stream fires on the spot.
    let (late_tx, mut late_rx) = mpsc::unbounded_channel();
    stream.once_close(move |code| {
        let _ = late_tx.send(code);
    });
    match late_rx.try_recv() {
        Ok(code) => assert_eq!(code, ResetCode::NO_ERROR),
        Err(_) => panic!("late close subscription did not fire synchronously"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn client_close_releases_the_transport() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    let (session_tx, session_rx) = oneshot::channel();
    let mut session_tx = Some(session_tx);
    server.on_session(move |session| {
        if let Some(tx) = session_tx.take() {
            let _ = tx.send(session);
        }
    });

    let client_session = connect(&authority).await;
    let server_session = timeout(WAIT, session_rx).await.unwrap().unwrap();

    let (done_tx, done_rx) = oneshot::channel();
    client_session.close(move || {
        let _ = done_tx.send(());
    });
    timeout(WAIT, done_rx).await.expect("client close timed out").unwrap();
    assert!(client_session.is_closed());

    // The settled client drops its connection, which closes the socket;
    // the server observes that as its own session ending.
    let (server_close_tx, server_close_rx) = oneshot::channel();
    server_session.once_close(move || {
        let _ = server_close_tx.send(());
    });
    timeout(WAIT, server_close_rx)
        .await
        .expect("server session never observed the client going away")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn server_close_drains_accepted_sessions() {
    let (server, authority) = start_server(SessionConfig::default()).await;
    let (session_tx, session_rx) = oneshot::channel();
    let mut session_tx = Some(session_tx);
    server.on_session(move |session| {
        if let Some(tx) = session_tx.take() {
            let _ = tx.send(session);
        }
    });

    let client_session = connect(&authority).await;
    let server_session = timeout(WAIT, session_rx).await.unwrap().unwrap();
    assert_eq!(server.sessions(), 1);

    let (done_tx, done_rx) = oneshot::channel();
    server.close(move || {
        let _ = done_tx.send(());
    });
    timeout(WAIT, done_rx).await.expect("server close timed out").unwrap();
    assert!(server.is_closed());
    assert!(server_session.is_closed());
    assert_eq!(server.sessions(), 0);

    // The client observes the transport going away as its own session close.
    let (client_close_tx, client_close_rx) = oneshot::channel();
    client_session.once_close(move || {
        let _ = client_close_tx.send(());
    });
    timeout(WAIT, client_close_rx)
        .await
        .expect("client session close timed out")
        .unwrap();
}
