//! HTTP/2 client that sends GET / and prints response, data, and pushes.
//!
//! Run `push_server` first, then `cargo run --example get_client`.

use strand::{HeaderBlock, OpenOptions, Strand};

#[tokio::main]
async fn main() {
    let client = Strand::client();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    client.connect_with_error(
        "http://127.0.0.1:8080",
        move |session| {
            let mut request = HeaderBlock::new();
            request
                .insert(":method", "GET")
                .insert(":path", "/")
                .insert(":scheme", "http")
                .insert(":authority", "127.0.0.1:8080");

            let stream = match session.request(&request, OpenOptions::default()) {
                Ok(stream) => stream,
                Err(err) => {
                    eprintln!("request failed: {err}");
                    let _ = done_tx.send(());
                    return;
                }
            };

            stream.once_response(|headers| {
                println!("response: :status = {}", headers.status().unwrap_or("?"));
            });
            stream.on_data(|chunk| {
                println!("data: {}", String::from_utf8_lossy(&chunk));
            });
            stream.on_push(|(pushed, headers)| {
                println!("pushed: {}", headers.path().unwrap_or("?"));
                pushed.on_data(|chunk| {
                    println!("pushed data: {}", String::from_utf8_lossy(&chunk));
                });
            });
            stream.once_close(move |code| {
                println!("stream closed with code {code}");
                let _ = done_tx.send(());
            });
        },
        |err| {
            eprintln!("connect failed: {err}");
        },
    );

    done_rx.await.ok();
}
