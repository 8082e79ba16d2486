//! Strand Public API
//!
//! Event-driven HTTP/2 sessions over the `h2` engine: multiplexed streams,
//! server push, trailers with readiness signaling, and sequenced shutdown.
//! Construct controllers through [`Strand`] or use the re-exported types
//! directly.

#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

// Re-export the core surface
pub use strand_core::{
    Client, Direction, Error, HeaderBlock, Hub, Kind, OpenOptions, ResetCode, RespondOptions,
    Result, Server, Session, SessionConfig, SettingId, Settings, Stream, StreamState,
    Subscription,
};

/// Main entry point providing controller constructors.
pub struct Strand;

impl Strand {
    /// A server controller with default session settings.
    #[must_use]
    pub fn server() -> Server {
        Server::new(SessionConfig::default())
    }

    /// A server controller with explicit session settings.
    #[must_use]
    pub fn server_with(config: SessionConfig) -> Server {
        Server::new(config)
    }

    /// A client controller with default session settings.
    #[must_use]
    pub fn client() -> Client {
        Client::new(SessionConfig::default())
    }

    /// A client controller with explicit session settings.
    #[must_use]
    pub fn client_with(config: SessionConfig) -> Client {
        Client::new(config)
    }
}
