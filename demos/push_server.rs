//! HTTP/2 server that answers GET / with a body and pushes /style.css.
//!
//! Run with `cargo run --example push_server`, then point `get_client` at
//! the printed address.

use bytes::Bytes;
use strand::{HeaderBlock, ResetCode, RespondOptions, Strand};

#[tokio::main]
async fn main() {
    let server = Strand::server();

    server.on_stream(|(stream, headers)| {
        println!(
            "stream {:?}: {} {}",
            stream.id(),
            headers.method().unwrap_or("?"),
            headers.path().unwrap_or("?"),
        );

        if stream.push_allowed() {
            let mut promised = HeaderBlock::new();
            promised
                .insert(":method", "GET")
                .insert(":path", "/style.css")
                .insert(":scheme", "http")
                .insert(":authority", "localhost");
            match stream.open_push(&promised) {
                Ok(pushed) => {
                    let mut headers = HeaderBlock::new();
                    headers
                        .insert(":status", "200")
                        .insert("content-type", "text/css");
                    if let Err(err) = pushed.respond(&headers, RespondOptions::default()) {
                        eprintln!("push respond failed: {err}");
                    } else if let Err(err) =
                        pushed.send_data(Bytes::from_static(b"body { margin: 0 }"), true)
                    {
                        eprintln!("push body failed: {err}");
                    }
                }
                Err(err) => eprintln!("push failed: {err}"),
            }
        }

        let mut response = HeaderBlock::new();
        response
            .insert(":status", "200")
            .insert("content-type", "text/html");
        if let Err(err) = stream.respond(&response, RespondOptions::default()) {
            eprintln!("respond failed: {err}");
            return;
        }
        if let Err(err) = stream.send_data(Bytes::from_static(b"<h1>hello</h1>"), true) {
            eprintln!("body failed: {err}");
            let _ = stream.close(ResetCode::INTERNAL_ERROR);
        }
    });

    server.listen("127.0.0.1:8080", |addr| {
        println!("listening on http://{addr}");
    });

    tokio::signal::ctrl_c().await.ok();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    server.close(move || {
        let _ = done_tx.send(());
    });
    done_rx.await.ok();
}
