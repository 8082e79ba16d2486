//! Commonly used types, re-exported in one place.

pub use crate::client::Client;
pub use crate::config::{SessionConfig, SettingId, Settings};
pub use crate::error::{Error, Kind, ResetCode, Result};
pub use crate::events::{Hub, Subscription};
pub use crate::headers::HeaderBlock;
pub use crate::server::Server;
pub use crate::session::Session;
pub use crate::stream::{Direction, OpenOptions, RespondOptions, Stream, StreamState};
