//! Client controller: session establishment.
//!
//! Connect-time failures never produce a session. They surface as
//! [`Kind::ConnectFailure`](crate::error::Kind) on the connect error
//! callback, so a caller retrying a failed connect cannot mistake one for
//! an application-level session error after the handshake.

use tokio::net::TcpStream;
use url::Url;

use crate::config::SessionConfig;
use crate::error::{self, Error, Result};
use crate::session::Session;

/// Establishes sessions to remote authorities.
#[derive(Debug, Clone, Default)]
pub struct Client {
    config: SessionConfig,
}

impl Client {
    pub fn new(config: SessionConfig) -> Client {
        Client { config }
    }

    /// Connects to `authority` (a URL such as `http://127.0.0.1:8080`).
    /// `on_ready` fires with the session once the handshake completes;
    /// connect-time failures are logged and dropped. Use
    /// [`Client::connect_with_error`] to observe them.
    pub fn connect(&self, authority: impl Into<String>, on_ready: impl FnOnce(Session) + Send + 'static) {
        self.connect_with_error(authority, on_ready, |err| {
            tracing::warn!(error = %err, "connect failed");
        });
    }

    /// Connects to `authority`, surfacing connect-time failures on
    /// `on_error`. Exactly one of the two callbacks fires.
    pub fn connect_with_error(
        &self,
        authority: impl Into<String>,
        on_ready: impl FnOnce(Session) + Send + 'static,
        on_error: impl FnOnce(Error) + Send + 'static,
    ) {
        let config = self.config.clone();
        let authority = authority.into();
        tokio::spawn(async move {
            match establish(config, &authority).await {
                Ok(session) => on_ready(session),
                Err(err) => on_error(err),
            }
        });
    }
}

/// TCP connect plus engine handshake. Every failure up to and including the
/// handshake is a connect failure; afterwards the session's own error
/// channel takes over.
async fn establish(config: SessionConfig, authority: &str) -> Result<Session> {
    let url = Url::parse(authority).map_err(error::connect_failure)?;
    let host = url
        .host_str()
        .ok_or_else(|| error::connect_failure("authority has no host"))?;
    let port = url.port_or_known_default().unwrap_or(80);

    let socket = TcpStream::connect((host, port))
        .await
        .map_err(error::connect_failure)?;
    if let Err(err) = socket.set_nodelay(true) {
        tracing::debug!(error = %err, "set_nodelay failed");
    }

    let mut builder = h2::client::Builder::new();
    config.apply_client(&mut builder);
    let (send_request, connection) = builder
        .handshake(socket)
        .await
        .map_err(error::connect_failure)?;

    let session = Session::new_client(send_request, config);
    tracing::debug!(session = session.id(), %host, port, "session established");

    // The driver task owns the connection. Once the session settles, after
    // a graceful close drains its streams, dropping the connection here is
    // what closes the socket: the engine has no client-side graceful
    // shutdown call. The session itself is held weakly.
    let weak = session.downgrade();
    let settled = session.inner.settled.clone();
    tokio::spawn(async move {
        tokio::select! {
            outcome = connection => {
                if let Some(inner) = weak.upgrade() {
                    let session = Session { inner };
                    match outcome {
                        Ok(()) => session.transport_closed(),
                        Err(err) => session.fatal(Error::from(err)),
                    }
                }
            }
            _ = settled.notified() => {}
        }
    });

    Ok(session)
}
