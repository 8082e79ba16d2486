//! # Strand HTTP/2 Core
//!
//! Session and stream lifecycle layer over the `h2` protocol engine.
//! Multiplexed streams over a shared session, server push, trailers with
//! peer-readiness signaling, and correctly sequenced shutdown: in-flight
//! streams drain before their session settles, and each entity delivers its
//! error and close events at most once.
//!
//! Framing, flow-control arithmetic, and header compression stay in the
//! engine. This layer consumes its lifecycle events and exposes control
//! operations through typed handles and subscriptions.

#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod server;
pub mod session;
pub mod stream;

pub mod prelude;

pub use prelude::*;
