//! Session configuration applied to the protocol engine.

use hashbrown::HashMap;

/// Local HTTP/2 settings for a session, applied to the engine's client or
/// server builder at handshake time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub initial_stream_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_frame_size: u32,
    pub max_concurrent_streams: u32,
    pub max_header_list_size: u32,
    pub enable_push: bool,
    pub max_send_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_stream_window_size: 65_535,
            initial_connection_window_size: 65_535,
            max_frame_size: 16_384,
            max_concurrent_streams: 256,
            max_header_list_size: 65_535,
            enable_push: true,
            max_send_buffer_size: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub(crate) fn apply_client(&self, builder: &mut h2::client::Builder) {
        builder
            .initial_window_size(self.initial_stream_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_header_list_size(self.max_header_list_size)
            .max_send_buffer_size(self.max_send_buffer_size)
            .enable_push(self.enable_push);
    }

    pub(crate) fn apply_server(&self, builder: &mut h2::server::Builder) {
        builder
            .initial_window_size(self.initial_stream_window_size)
            .initial_connection_window_size(self.initial_connection_window_size)
            .max_frame_size(self.max_frame_size)
            .max_concurrent_streams(self.max_concurrent_streams)
            .max_header_list_size(self.max_header_list_size)
            .max_send_buffer_size(self.max_send_buffer_size);
    }

    /// Settings snapshot as setting-id → value.
    pub(crate) fn settings(&self, push_enabled: bool) -> Settings {
        let mut settings = Settings::new();
        settings.insert(SettingId::HeaderTableSize, 4_096);
        settings.insert(SettingId::EnablePush, u32::from(push_enabled));
        settings.insert(SettingId::MaxConcurrentStreams, self.max_concurrent_streams);
        settings.insert(SettingId::InitialWindowSize, self.initial_stream_window_size);
        settings.insert(SettingId::MaxFrameSize, self.max_frame_size);
        settings.insert(SettingId::MaxHeaderListSize, self.max_header_list_size);
        settings
    }
}

/// Identifiers for the negotiated per-session protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
}

/// Snapshot of a session's local settings.
pub type Settings = HashMap<SettingId, u32>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_config_and_push_flag() {
        let config = SessionConfig {
            max_concurrent_streams: 100,
            ..SessionConfig::default()
        };
        let settings = config.settings(true);
        assert_eq!(settings.get(&SettingId::MaxConcurrentStreams), Some(&100));
        assert_eq!(settings.get(&SettingId::EnablePush), Some(&1));

        let settings = config.settings(false);
        assert_eq!(settings.get(&SettingId::EnablePush), Some(&0));
    }
}
